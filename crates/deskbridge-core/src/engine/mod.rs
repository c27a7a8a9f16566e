//! Session engine.
//!
//! [`SessionEngine`] is an actor that owns every piece of mutable session
//! state: the [`SessionRegistry`], the handover token set, the file
//! transfer engine, the address book and the host's secrets. It drains
//! three queues and handles one event at a time:
//!
//! - transport events pushed by endpoints and channels (always first),
//! - commands sent through an [`EngineHandle`],
//! - internal events (connect timer expiry, transfer continuation).
//!
//! A heartbeat interval runs alongside, and so does clipboard polling when
//! clipboard sync is enabled. Nothing outside the actor touches a
//! session, so there are no locks and no stale snapshots.
//!
//! The engine publishes [`SessionNotice`]s on a broadcast channel; the UI
//! subscribes through [`EngineHandle::subscribe`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let (engine, handle) = SessionEngine::builder(config, transport, capabilities)
//!     .identity(Arc::new(StoredIdentity::default_location()))
//!     .build();
//! tokio::spawn(engine.run());
//!
//! let session = handle.connect_to("123456789", ConnectOptions::default()).await?;
//! ```

mod broker;
mod clipboard_sync;
mod handle;
mod router;

pub use handle::{ConnectOptions, EngineHandle, LocalMedia};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::capability::Capabilities;
use crate::config::Config;
use crate::contacts::AddressBook;
use crate::error::{Error, Result};
use crate::handover::HandoverTokens;
use crate::identity::{IdentityProvider, StoredIdentity};
use crate::protocol::{self, DesktopSource, Message};
use crate::session::{
    ChatEntry, CloseReason, Direction, Session, SessionId, SessionRegistry, SessionSnapshot,
    SessionUpdate,
};
use crate::transfer::{FileTransferEngine, FileTransferRecord, Pump};
use crate::transport::{Conduit, Endpoint, EventSink, MediaStream, Transport, TransportEvent};

use handle::Command;

const NOTICE_CAPACITY: usize = 256;
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
const MAX_HELD_PROBES: usize = 32;

/// Events published by the engine.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// The shared inbound endpoint is registered
    HostReady {
        /// Identifier clients connect to
        identifier: String,
    },
    /// Broker connectivity changed
    TransportStatus {
        /// Transport message
        message: String,
        /// Whether the affected endpoint is gone
        fatal: bool,
    },
    /// A session was created
    SessionOpened(SessionSnapshot),
    /// A session changed
    SessionUpdated(SessionSnapshot),
    /// A session ended and was removed
    SessionClosed {
        /// Session id
        id: SessionId,
        /// Peer identifier
        remote_identifier: String,
        /// Why it ended
        reason: CloseReason,
    },
    /// An incoming session waits for the local user's decision
    ApprovalRequired {
        /// Session id
        id: SessionId,
        /// Peer identifier
        remote_identifier: String,
    },
    /// An outgoing session needs a credential
    CredentialRequired {
        /// Session id
        id: SessionId,
        /// Peer identifier
        remote_identifier: String,
    },
    /// The host rejected our credential
    AuthenticationFailed {
        /// Session id
        id: SessionId,
        /// Peer identifier
        remote_identifier: String,
    },
    /// A chat line was sent or received
    Chat {
        /// Session id
        id: SessionId,
        /// The line
        entry: ChatEntry,
    },
    /// File transfer progress
    Transfer(FileTransferRecord),
}

enum Internal {
    ConnectTimeout(SessionId),
    ContinueTransfer(String),
}

/// Builder for [`SessionEngine`].
pub struct SessionEngineBuilder {
    config: Config,
    transport: Arc<dyn Transport>,
    capabilities: Capabilities,
    identity: Option<Arc<dyn IdentityProvider>>,
    contacts: Option<AddressBook>,
    session_secret: Option<Option<String>>,
}

impl SessionEngineBuilder {
    /// Use a specific identity provider instead of the stored identifier.
    #[must_use]
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use a loaded address book instead of an empty in-memory one.
    #[must_use]
    pub fn contacts(mut self, contacts: AddressBook) -> Self {
        self.contacts = Some(contacts);
        self
    }

    /// Fix the session secret (`None` disables it) instead of generating one.
    #[must_use]
    pub fn session_secret(mut self, secret: Option<String>) -> Self {
        self.session_secret = Some(secret);
        self
    }

    /// Build the engine and a handle to it.
    #[must_use]
    pub fn build(self) -> (SessionEngine, EngineHandle) {
        let (sink, transport_rx) = EventSink::channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let mut auth = Authenticator::from_config(&self.config.security);
        if let Some(secret) = self.session_secret {
            auth.set_session_secret(secret);
        }

        let engine = SessionEngine {
            transfers: FileTransferEngine::new(&self.config.transfer),
            handover: HandoverTokens::new(self.config.session.handover_grace),
            identity: self
                .identity
                .unwrap_or_else(|| Arc::new(StoredIdentity::default_location())),
            contacts: self.contacts.unwrap_or_else(AddressBook::in_memory),
            auth,
            config: self.config,
            transport: self.transport,
            caps: self.capabilities,
            registry: SessionRegistry::new(),
            host: None,
            probes: Vec::new(),
            local_stream: None,
            local_sources: Vec::new(),
            active_source: None,
            last_clipboard: None,
            sink,
            transport_rx,
            commands,
            internal_tx,
            internal_rx,
            notices: notices.clone(),
        };

        (engine, EngineHandle::new(commands_tx, notices))
    }
}

/// The session lifecycle and data-channel protocol actor.
pub struct SessionEngine {
    config: Config,
    transport: Arc<dyn Transport>,
    caps: Capabilities,
    identity: Arc<dyn IdentityProvider>,
    contacts: AddressBook,
    auth: Authenticator,
    handover: HandoverTokens,
    transfers: FileTransferEngine,
    registry: SessionRegistry,

    /// Shared inbound endpoint
    host: Option<Box<dyn Endpoint>>,
    /// Liveness probe conduits held until the prober closes them
    probes: Vec<(Instant, Box<dyn Conduit>)>,

    local_stream: Option<MediaStream>,
    local_sources: Vec<DesktopSource>,
    active_source: Option<String>,
    /// Last clipboard text sent or received
    last_clipboard: Option<String>,

    sink: EventSink,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionEngine {
    /// Start building an engine.
    #[must_use]
    pub fn builder(
        config: Config,
        transport: Arc<dyn Transport>,
        capabilities: Capabilities,
    ) -> SessionEngineBuilder {
        SessionEngineBuilder {
            config,
            transport,
            capabilities,
            identity: None,
            contacts: None,
            session_secret: None,
        }
    }

    /// Process events until shut down or every handle is dropped.
    pub async fn run(mut self) {
        let period = self
            .config
            .session
            .heartbeat_interval
            .max(MIN_HEARTBEAT_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let clipboard_sync = self.config.session.clipboard_sync;
        let poll = self
            .config
            .session
            .clipboard_poll_interval
            .max(MIN_HEARTBEAT_INTERVAL);
        let mut clipboard = tokio::time::interval_at(Instant::now() + poll, poll);
        clipboard.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(clipboard_sync, "Session engine started");

        loop {
            tokio::select! {
                biased;

                Some(event) = self.transport_rx.recv() => {
                    self.on_transport_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.internal_rx.recv() => match event {
                    Internal::ConnectTimeout(id) => self.on_connect_timeout(id).await,
                    Internal::ContinueTransfer(transfer) => self.continue_transfer(transfer).await,
                },
                _ = heartbeat.tick() => self.on_heartbeat().await,
                _ = clipboard.tick(), if clipboard_sync => self.on_clipboard_tick().await,
            }
        }

        info!("Session engine stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Listen { reply } => {
                let _ = reply.send(self.listen().await);
            }
            Command::ConnectTo {
                remote,
                options,
                reply,
            } => {
                let _ = reply.send(self.connect_to(&remote, options).await);
            }
            Command::SubmitCredential {
                session,
                credential,
                remember,
                reply,
            } => {
                let _ = reply.send(self.submit_credential(session, credential, remember).await);
            }
            Command::Approve { session, reply } => {
                let _ = reply.send(self.approve(session).await);
            }
            Command::Reject { session, reply } => {
                let _ = reply.send(self.reject(session).await);
            }
            Command::Close { session, reply } => {
                let _ = reply.send(self.close(session).await);
            }
            Command::SendClipboard {
                session,
                text,
                reply,
            } => {
                let _ = reply.send(self.send_clipboard(session, text).await);
            }
            Command::SendFile {
                session,
                path,
                hint,
                reply,
            } => {
                let _ = reply.send(self.send_file(session, &path, hint).await);
            }
            Command::SendInput {
                session,
                event,
                reply,
            } => {
                let _ = reply.send(self.send_input(session, event).await);
            }
            Command::SwitchMonitor {
                session,
                source_id,
                reply,
            } => {
                let _ = reply.send(self.request_monitor(session, source_id).await);
            }
            Command::SendChat {
                session,
                text,
                reply,
            } => {
                let _ = reply.send(self.send_chat(session, text).await);
            }
            Command::PrepareHandover { session, reply } => {
                let _ = reply.send(self.prepare_handover(session).await);
            }
            Command::SetLocalMedia { media, reply } => {
                self.set_local_media(media).await;
                let _ = reply.send(Ok(()));
            }
            Command::RotateSessionSecret { reply } => {
                info!("Session secret rotated");
                let _ = reply.send(self.auth.rotate());
            }
            Command::SetUnattendedSecret { secret, reply } => {
                info!(enabled = secret.is_some(), "Unattended secret updated");
                self.auth.set_unattended_secret(secret);
                let _ = reply.send(());
            }
            Command::SessionSecret { reply } => {
                let _ = reply.send(self.auth.session_secret().map(str::to_string));
            }
            Command::Snapshot { session, reply } => {
                let _ = reply.send(self.registry.get(session).map(Session::snapshot));
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.registry.snapshots());
            }
            Command::Transfers { reply } => {
                let _ = reply.send(self.transfers.records());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn publish(&self, id: SessionId) {
        if let Some(session) = self.registry.get(id) {
            self.notify(SessionNotice::SessionUpdated(session.snapshot()));
        }
    }

    fn update(&mut self, id: SessionId, update: SessionUpdate) {
        if let Err(e) = self.registry.update(id, update) {
            debug!(session = %id, error = %e, "Update for a session that is gone");
        }
    }

    fn session(&self, id: SessionId) -> Result<&Session> {
        self.registry.get(id).ok_or(Error::SessionNotFound(id))
    }

    fn session_in(&self, id: SessionId, direction: Direction) -> Result<&Session> {
        let session = self.session(id)?;
        if session.direction() != direction {
            return Err(Error::WrongDirection {
                session: id,
                direction: session.direction().to_string(),
            });
        }
        Ok(session)
    }

    fn authenticated_session(&self, id: SessionId) -> Result<&Session> {
        let session = self.session(id)?;
        if !session.is_authenticated() {
            return Err(Error::SessionNotReady {
                session: id,
                reason: "not authenticated".to_string(),
            });
        }
        Ok(session)
    }

    /// Send a message over a session's conduit.
    async fn send(&self, id: SessionId, message: &Message) -> Result<()> {
        let session = self.session(id)?;
        let conduit = session
            .conduit()
            .filter(|_| session.is_conduit_open())
            .ok_or_else(|| Error::SessionNotReady {
                session: id,
                reason: "data conduit is not open".to_string(),
            })?;
        debug!(session = %id, kind = message.kind(), "Sending message");
        conduit.send(protocol::encode(message)?).await
    }

    /// Answer the pending media invitation once the session is authenticated
    /// and a local stream exists, whichever happened last.
    async fn try_answer_pending(&mut self, id: SessionId) {
        let Some(stream) = self.local_stream.clone() else {
            return;
        };
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if !session.is_incoming() || !session.is_authenticated() {
            return;
        }
        let Some(invitation) = session.pending_media() else {
            return;
        };

        let result = invitation.answer(&stream).await;
        match result {
            Ok(()) => {
                info!(session = %id, "Media invitation answered");
                self.update(id, SessionUpdate::new().answer_pending_media());
                self.publish(id);
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Failed to answer media invitation");
                self.close_session(id, CloseReason::ChannelError(e.to_string()))
                    .await;
            }
        }
    }

    /// Remove a session and release everything it owns.
    async fn close_session(&mut self, id: SessionId, reason: CloseReason) {
        let Some(mut session) = self.registry.remove(id) else {
            return;
        };

        if session.is_incoming() {
            if let Err(e) = self.caps.input.reset().await {
                warn!(session = %id, error = %e, "Failed to reset input state");
            }
        }

        for record in self
            .transfers
            .abort_session(id, self.caps.files.as_ref())
            .await
        {
            self.notify(SessionNotice::Transfer(record));
        }

        session.release();

        info!(
            session = %id,
            remote = %session.remote_identifier(),
            reason = %reason,
            "Session closed"
        );
        self.notify(SessionNotice::SessionClosed {
            id,
            remote_identifier: session.remote_identifier().to_string(),
            reason,
        });
    }

    async fn on_heartbeat(&mut self) {
        let now = Instant::now();
        self.sweep_probes(now);
        let timeout = self.config.session.heartbeat_timeout;

        let targets: Vec<(SessionId, bool)> = self
            .registry
            .iter()
            .filter(|s| !s.is_incoming() && s.is_conduit_open())
            .map(|s| {
                let stale = !s.heartbeat_stale()
                    && s.last_heartbeat()
                        .is_some_and(|at| now.duration_since(at) > timeout);
                (s.id(), stale)
            })
            .collect();

        for (id, stale) in targets {
            if let Err(e) = self.send(id, &Message::Ping).await {
                debug!(session = %id, error = %e, "Heartbeat not sent");
            }
            if stale {
                warn!(session = %id, "Heartbeat replies stopped");
                self.update(id, SessionUpdate::new().heartbeat_stale(true));
                self.publish(id);
            }
        }
    }

    /// Close probe conduits their prober should have closed by now.
    fn sweep_probes(&mut self, now: Instant) {
        let hold = self.config.status.probe_timeout;
        self.probes.retain(|(since, probe)| {
            let keep = now.duration_since(*since) <= hold;
            if !keep {
                debug!(channel = %probe.id(), "Abandoned liveness probe closed");
                probe.close();
            }
            keep
        });
        while self.probes.len() > MAX_HELD_PROBES {
            let (_, oldest) = self.probes.remove(0);
            oldest.close();
        }
    }

    async fn continue_transfer(&mut self, transfer_id: String) {
        if !self
            .transfers
            .get(&transfer_id)
            .is_some_and(FileTransferRecord::is_active)
        {
            return;
        }
        let Some(session_id) = self.transfers.session_of(&transfer_id) else {
            return;
        };

        let conduit = self
            .registry
            .get(session_id)
            .and_then(|s| s.conduit().filter(|_| s.is_conduit_open()));
        let outcome = match conduit {
            Some(conduit) => {
                self.transfers
                    .pump(&transfer_id, self.caps.files.as_ref(), conduit)
                    .await
            }
            None => Err(Error::SessionNotReady {
                session: session_id,
                reason: "data conduit is not open".to_string(),
            }),
        };

        match outcome {
            Ok(Pump::More) => {
                let _ = self
                    .internal_tx
                    .send(Internal::ContinueTransfer(transfer_id.clone()));
            }
            Ok(Pump::Done) => {}
            Err(e) => {
                self.transfers.fail(&transfer_id, &e.to_string());
            }
        }

        if let Some(record) = self.transfers.get(&transfer_id) {
            self.notify(SessionNotice::Transfer(record.clone()));
        }
    }

    async fn set_local_media(&mut self, media: LocalMedia) {
        let stream_changed = media.stream.is_some() && media.stream != self.local_stream;
        self.local_stream = media.stream;
        self.local_sources = media.sources;
        self.active_source = media.active_source;
        debug!(
            sources = self.local_sources.len(),
            active = ?self.active_source,
            "Local media updated"
        );

        let incoming: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|s| s.is_incoming())
            .map(Session::id)
            .collect();

        for id in incoming {
            if stream_changed {
                self.replace_outgoing_stream(id).await;
            }
            if let Some(active) = self.active_source.clone() {
                self.update(id, SessionUpdate::new().active_source(Some(active)));
            }
            self.try_answer_pending(id).await;
            self.announce_sources(id).await;
        }
    }

    /// Swap the stream we send on an established media channel.
    async fn replace_outgoing_stream(&self, id: SessionId) {
        let (Some(stream), Some(media)) = (
            self.local_stream.as_ref(),
            self.registry.get(id).and_then(Session::media),
        ) else {
            return;
        };
        if let Err(e) = media.replace_stream(stream).await {
            warn!(session = %id, error = %e, "Failed to replace media stream");
        }
    }

    /// Tell an authenticated client which sources it can switch to.
    async fn announce_sources(&self, id: SessionId) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if !session.is_authenticated() || !session.is_conduit_open() || self.local_sources.is_empty()
        {
            return;
        }
        let message = Message::SourcesList {
            sources: self.local_sources.clone(),
            active_source_id: self.active_source.clone(),
        };
        if let Err(e) = self.send(id, &message).await {
            warn!(session = %id, error = %e, "Failed to send sources list");
        }
    }

    async fn shutdown(&mut self) {
        for id in self.registry.ids() {
            self.close_session(id, CloseReason::Shutdown).await;
        }
        for (_, probe) in self.probes.drain(..) {
            probe.close();
        }
        if let Some(host) = self.host.take() {
            host.dispose();
        }
    }
}
