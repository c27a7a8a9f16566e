//! System clipboard backed by `arboard`.
//!
//! One `arboard::Clipboard` lives on a dedicated thread for as long as the
//! [`SystemClipboard`] does. Requests reach it over a channel and answer on
//! a oneshot, so the capability is `Send + Sync` on every platform and a
//! slow display server never stalls the engine's event loop.
//!
//! X11 and Wayland serve clipboard contents from the process that set them,
//! and only while its handle is alive. Keeping the handle means text written
//! from a peer stays pasteable after the write returns.

use std::thread;

use arboard::Clipboard as NativeClipboard;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::capability::Clipboard;
use crate::error::{Error, Result};

enum Request {
    Read(oneshot::Sender<Result<String>>),
    Write(String, oneshot::Sender<Result<()>>),
}

/// Text clipboard of the local desktop session.
#[derive(Debug, Clone)]
pub struct SystemClipboard {
    requests: mpsc::UnboundedSender<Request>,
}

impl SystemClipboard {
    /// Start the clipboard owner thread.
    ///
    /// The native handle is opened on first use, and reopened after a
    /// failure, so a display server that appears later is picked up.
    ///
    /// # Errors
    ///
    /// Returns an error if the owner thread cannot be spawned.
    pub fn new() -> Result<Self> {
        let (requests, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("deskbridge-clipboard".to_string())
            .spawn(move || serve(rx))?;
        Ok(Self { requests })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(build(reply))
            .map_err(|_| Error::Internal("clipboard thread stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("clipboard thread stopped".to_string()))?
    }
}

fn clipboard_error(e: impl std::fmt::Display) -> Error {
    Error::Capability {
        capability: "clipboard",
        reason: e.to_string(),
    }
}

/// Whether an error means the handle itself needs reopening.
fn is_broken<T>(result: &std::result::Result<T, arboard::Error>) -> bool {
    matches!(result, Err(e) if !matches!(e, arboard::Error::ContentNotAvailable))
}

/// Owner thread: holds the native handle until every sender is gone.
fn serve(mut rx: mpsc::UnboundedReceiver<Request>) {
    let mut native: Option<NativeClipboard> = None;

    while let Some(request) = rx.blocking_recv() {
        if native.is_none() {
            match NativeClipboard::new() {
                Ok(clipboard) => native = Some(clipboard),
                Err(e) => {
                    debug!(error = %e, "Clipboard unavailable");
                    fail(request, clipboard_error(e));
                    continue;
                }
            }
        }
        let Some(clipboard) = native.as_mut() else {
            continue;
        };

        let broken = match request {
            Request::Read(reply) => {
                let result = clipboard.get_text();
                let broken = is_broken(&result);
                let _ = reply.send(match result {
                    Ok(text) if !text.is_empty() => {
                        trace!("Clipboard: read {} bytes of text", text.len());
                        Ok(text)
                    }
                    Ok(_) | Err(arboard::Error::ContentNotAvailable) => {
                        Err(Error::ClipboardEmpty)
                    }
                    Err(e) => Err(clipboard_error(e)),
                });
                broken
            }
            Request::Write(text, reply) => {
                let len = text.len();
                let result = clipboard.set_text(text);
                let broken = is_broken(&result);
                if result.is_ok() {
                    trace!("Clipboard: wrote {len} bytes of text");
                }
                let _ = reply.send(result.map_err(clipboard_error));
                broken
            }
        };

        if broken {
            native = None;
        }
    }

    debug!("Clipboard owner thread stopped");
}

fn fail(request: Request, error: Error) {
    match request {
        Request::Read(reply) => {
            let _ = reply.send(Err(error));
        }
        Request::Write(_, reply) => {
            let _ = reply.send(Err(error));
        }
    }
}

#[async_trait]
impl Clipboard for SystemClipboard {
    async fn read(&self) -> Result<String> {
        self.request(Request::Read).await
    }

    async fn write(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.request(|reply| Request::Write(text, reply)).await
    }
}
