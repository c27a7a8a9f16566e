//! Clipboard auto-sync.
//!
//! While `session.clipboard_sync` is on, the engine polls the local
//! clipboard every `session.clipboard_poll_interval` and pushes changes to
//! every authenticated session with an open conduit. Text that names an
//! existing, non-empty local file is sent as a file transfer instead.
//! Text received from a peer becomes the last seen value, so it is never
//! echoed back.

use std::path::Path;

use tracing::{debug, info, warn};

use super::SessionEngine;
use crate::protocol::Message;
use crate::session::{Session, SessionId};

/// Absolute Unix path, UNC path or drive-letter path.
pub(super) fn looks_like_path(text: &str) -> bool {
    if text.contains(['\n', '\r']) {
        return false;
    }
    match text.as_bytes() {
        [b'/', ..] | [b'\\', b'\\', ..] => true,
        [drive, b':', b'\\', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

impl SessionEngine {
    pub(super) async fn on_clipboard_tick(&mut self) {
        let targets: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|s| s.is_authenticated() && s.is_conduit_open())
            .map(Session::id)
            .collect();
        if targets.is_empty() {
            return;
        }

        let text = match self.caps.clipboard.read().await {
            Ok(text) => text,
            Err(e) => {
                debug!(error = %e, "Clipboard not readable");
                return;
            }
        };
        if text.is_empty() || self.last_clipboard.as_deref() == Some(text.as_str()) {
            return;
        }
        self.last_clipboard = Some(text.clone());

        let candidate = text.trim();
        if looks_like_path(candidate) {
            let path = Path::new(candidate);
            let is_file = self
                .caps
                .files
                .describe(path)
                .await
                .is_ok_and(|d| d.size > 0);
            if is_file {
                for id in targets {
                    match self.send_file(id, path, None).await {
                        Ok(transfer) => {
                            info!(session = %id, transfer = %transfer, "Copied file sent");
                        }
                        Err(e) => warn!(session = %id, error = %e, "Copied file not sent"),
                    }
                }
                return;
            }
        }

        let message = Message::Clipboard { text };
        for id in targets {
            match self.send(id, &message).await {
                Ok(()) => debug!(session = %id, "Clipboard change sent"),
                Err(e) => warn!(session = %id, error = %e, "Clipboard change not sent"),
            }
        }
    }
}
