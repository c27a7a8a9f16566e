//! Cloneable front door to a running [`SessionEngine`](super::SessionEngine).

use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc, oneshot};

use super::SessionNotice;
use crate::capability::DropHint;
use crate::error::{Error, Result};
use crate::protocol::{DesktopSource, InputEvent};
use crate::session::{SessionId, SessionSnapshot};
use crate::transfer::FileTransferRecord;
use crate::transport::MediaStream;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Options for an outgoing connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Handover token to present instead of a credential
    pub handover_token: Option<String>,
    /// Credential to send; defaults to the contact's remembered one
    pub credential: Option<String>,
    /// Save the credential to the contact once accepted
    pub remember: bool,
    /// Open only the data conduit; invite media after authentication
    pub data_first: bool,
}

impl ConnectOptions {
    /// Connect with an explicit credential.
    #[must_use]
    pub fn with_credential(credential: impl Into<String>) -> Self {
        Self {
            credential: Some(credential.into()),
            ..Self::default()
        }
    }

    /// Reconnect under a handover token.
    #[must_use]
    pub fn with_handover(token: impl Into<String>) -> Self {
        Self {
            handover_token: Some(token.into()),
            ..Self::default()
        }
    }
}

/// Host-side capture state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    /// Stream offered to clients
    pub stream: Option<MediaStream>,
    /// Capture sources clients may switch between
    pub sources: Vec<DesktopSource>,
    /// Source currently captured
    pub active_source: Option<String>,
}

pub(crate) enum Command {
    Listen {
        reply: Reply<String>,
    },
    ConnectTo {
        remote: String,
        options: ConnectOptions,
        reply: Reply<SessionId>,
    },
    SubmitCredential {
        session: SessionId,
        credential: String,
        remember: bool,
        reply: Reply<()>,
    },
    Approve {
        session: SessionId,
        reply: Reply<()>,
    },
    Reject {
        session: SessionId,
        reply: Reply<()>,
    },
    Close {
        session: SessionId,
        reply: Reply<()>,
    },
    SendClipboard {
        session: SessionId,
        text: Option<String>,
        reply: Reply<()>,
    },
    SendFile {
        session: SessionId,
        path: PathBuf,
        hint: Option<DropHint>,
        reply: Reply<String>,
    },
    SendInput {
        session: SessionId,
        event: InputEvent,
        reply: Reply<()>,
    },
    SwitchMonitor {
        session: SessionId,
        source_id: String,
        reply: Reply<()>,
    },
    SendChat {
        session: SessionId,
        text: String,
        reply: Reply<()>,
    },
    PrepareHandover {
        session: SessionId,
        reply: Reply<String>,
    },
    SetLocalMedia {
        media: LocalMedia,
        reply: Reply<()>,
    },
    RotateSessionSecret {
        reply: oneshot::Sender<String>,
    },
    SetUnattendedSecret {
        secret: Option<String>,
        reply: oneshot::Sender<()>,
    },
    SessionSecret {
        reply: oneshot::Sender<Option<String>>,
    },
    Snapshot {
        session: SessionId,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    Transfers {
        reply: oneshot::Sender<Vec<FileTransferRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Sends commands to the engine and subscribes to its notices.
///
/// Every method waits for the engine to process the command, so a returned
/// call also means every transport event queued before it was handled.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<SessionNotice>,
}

impl EngineHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self { commands, notices }
    }

    /// Receive notices published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::EngineClosed)?;
        rx.await.map_err(|_| Error::EngineClosed)
    }

    /// Open the shared inbound endpoint under the local identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier cannot be resolved or the
    /// transport refuses the endpoint.
    pub async fn listen(&self) -> Result<String> {
        self.request(|reply| Command::Listen { reply }).await?
    }

    /// Start an outgoing session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSession`] when an outgoing session to
    /// `remote` already exists, or a transport error if the scoped endpoint
    /// cannot be opened.
    pub async fn connect_to(&self, remote: &str, options: ConnectOptions) -> Result<SessionId> {
        let remote = remote.to_string();
        self.request(|reply| Command::ConnectTo {
            remote,
            options,
            reply,
        })
        .await?
    }

    /// Offer a credential on an outgoing session.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or incoming sessions.
    pub async fn submit_credential(
        &self,
        session: SessionId,
        credential: &str,
        remember: bool,
    ) -> Result<()> {
        let credential = credential.to_string();
        self.request(|reply| Command::SubmitCredential {
            session,
            credential,
            remember,
            reply,
        })
        .await?
    }

    /// Approve an incoming session.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or outgoing sessions.
    pub async fn approve(&self, session: SessionId) -> Result<()> {
        self.request(|reply| Command::Approve { session, reply })
            .await?
    }

    /// Reject an incoming session.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or outgoing sessions.
    pub async fn reject(&self, session: SessionId) -> Result<()> {
        self.request(|reply| Command::Reject { session, reply })
            .await?
    }

    /// Close a session.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown sessions.
    pub async fn close(&self, session: SessionId) -> Result<()> {
        self.request(|reply| Command::Close { session, reply })
            .await?
    }

    /// Push clipboard text to the peer, reading the local clipboard when
    /// `text` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not authenticated, its conduit is
    /// closed, or the clipboard cannot be read.
    pub async fn send_clipboard(&self, session: SessionId, text: Option<String>) -> Result<()> {
        self.request(|reply| Command::SendClipboard {
            session,
            text,
            reply,
        })
        .await?
    }

    /// Start sending a file and return its transfer id.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot carry data or the file cannot
    /// be described.
    pub async fn send_file(
        &self,
        session: SessionId,
        path: impl Into<PathBuf>,
        hint: Option<DropHint>,
    ) -> Result<String> {
        let path = path.into();
        self.request(|reply| Command::SendFile {
            session,
            path,
            hint,
            reply,
        })
        .await?
    }

    /// Send a remote-input event to the host.
    ///
    /// # Errors
    ///
    /// Returns an error unless the session is an authenticated outgoing one.
    pub async fn send_input(&self, session: SessionId, event: InputEvent) -> Result<()> {
        self.request(|reply| Command::SendInput {
            session,
            event,
            reply,
        })
        .await?
    }

    /// Ask the host to stream another capture source.
    ///
    /// # Errors
    ///
    /// Returns an error unless the session is an authenticated outgoing one.
    pub async fn switch_monitor(&self, session: SessionId, source_id: &str) -> Result<()> {
        let source_id = source_id.to_string();
        self.request(|reply| Command::SwitchMonitor {
            session,
            source_id,
            reply,
        })
        .await?
    }

    /// Send a chat line.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not authenticated.
    pub async fn send_chat(&self, session: SessionId, text: &str) -> Result<()> {
        let text = text.to_string();
        self.request(|reply| Command::SendChat {
            session,
            text,
            reply,
        })
        .await?
    }

    /// Mint a handover token and announce it to the host.
    ///
    /// The returned token is handed to the endpoint that will take the
    /// session over, which passes it in [`ConnectOptions::handover_token`].
    ///
    /// # Errors
    ///
    /// Returns an error unless the session is an authenticated outgoing one.
    pub async fn prepare_handover(&self, session: SessionId) -> Result<String> {
        self.request(|reply| Command::PrepareHandover { session, reply })
            .await?
    }

    /// Replace the host's local stream and capture sources.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has shut down.
    pub async fn set_local_media(&self, media: LocalMedia) -> Result<()> {
        self.request(|reply| Command::SetLocalMedia { media, reply })
            .await?
    }

    /// Generate a new session secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has shut down.
    pub async fn rotate_session_secret(&self) -> Result<String> {
        self.request(|reply| Command::RotateSessionSecret { reply })
            .await
    }

    /// Replace or clear the unattended secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has shut down.
    pub async fn set_unattended_secret(&self, secret: Option<String>) -> Result<()> {
        self.request(|reply| Command::SetUnattendedSecret { secret, reply })
            .await
    }

    /// Current session secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has shut down.
    pub async fn session_secret(&self) -> Result<Option<String>> {
        self.request(|reply| Command::SessionSecret { reply }).await
    }

    /// Read model of one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has shut down.
    pub async fn snapshot(&self, session: SessionId) -> Result<Option<SessionSnapshot>> {
        self.request(|reply| Command::Snapshot { session, reply })
            .await
    }

    /// Read models of every session.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has shut down.
    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    /// Every file transfer record.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has shut down.
    pub async fn transfers(&self) -> Result<Vec<FileTransferRecord>> {
        self.request(|reply| Command::Transfers { reply }).await
    }

    /// Close every session and stop the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has already shut down.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
