//! Connection broker: turns outbound intents and inbound transport events
//! into correlated sessions and drives them through their lifecycle.
//!
//! Outbound, each attempt gets its own scoped endpoint so a failing or
//! timed-out attempt cannot disturb any other. Inbound, a media invitation
//! and a data conduit from the same remote identifier may arrive in either
//! order (or only one of them arrives) and are folded into one session.

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ConnectOptions, Internal, SessionEngine, SessionNotice};
use crate::error::{Error, Result};
use crate::protocol::{AuthVerdict, Message};
use crate::session::{
    ChannelRole, CloseReason, Direction, LifecycleState, Session, SessionId, SessionUpdate,
};
use crate::transport::{
    ChannelId, Conduit, EndpointConfig, EndpointId, IceState, InvitationMetadata, MediaChannel,
    MediaStream, TransportErrorKind, TransportEvent,
};

impl SessionEngine {
    /// Open the shared inbound endpoint.
    pub(super) async fn listen(&mut self) -> Result<String> {
        if let Some(host) = &self.host {
            return Ok(host.identifier().to_string());
        }

        let identifier = self.identity.resolve()?;
        let endpoint = self
            .transport
            .open(
                &identifier,
                &EndpointConfig::from(&self.config.broker),
                self.sink.clone(),
            )
            .await?;

        info!(identifier = %identifier, endpoint = %endpoint.id(), "Listening for incoming sessions");
        self.host = Some(endpoint);
        Ok(identifier)
    }

    /// Start an outgoing session.
    pub(super) async fn connect_to(
        &mut self,
        remote: &str,
        options: ConnectOptions,
    ) -> Result<SessionId> {
        let remote = remote.trim();
        if remote.is_empty() {
            return Err(Error::PeerUnavailable(remote.to_string()));
        }
        if self
            .registry
            .find_by_remote(remote, Direction::Outgoing)
            .is_some()
        {
            warn!(remote = %remote, "Outgoing session already exists");
            return Err(Error::DuplicateSession(remote.to_string()));
        }

        let id = self.registry.create(remote, Direction::Outgoing);
        self.contacts.ensure(remote);
        self.contacts
            .push_recent(remote, self.config.session.recent_limit);
        self.save_contacts();

        let credential = options
            .credential
            .or_else(|| self.contacts.remembered_credential(remote).map(str::to_string));
        self.update(
            id,
            SessionUpdate::new()
                .pending_credential(credential)
                .remember_credential(options.remember)
                .handover_token(options.handover_token)
                .data_first(options.data_first),
        );
        if let Some(session) = self.registry.get(id) {
            self.notify(SessionNotice::SessionOpened(session.snapshot()));
        }

        let scoped = format!("{}-{}", id.short(), chrono::Utc::now().timestamp_millis());
        let opened = self
            .transport
            .open(
                &scoped,
                &EndpointConfig::from(&self.config.broker),
                self.sink.clone(),
            )
            .await;
        let endpoint = match opened {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(session = %id, error = %e, "Failed to open scoped endpoint");
                self.close_session(id, CloseReason::Transport(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        info!(session = %id, remote = %remote, endpoint = %scoped, "Connecting");
        let timer = self.arm_connect_timer(id);
        self.update(
            id,
            SessionUpdate::new().endpoint(endpoint).connect_timer(timer),
        );
        Ok(id)
    }

    fn arm_connect_timer(&self, id: SessionId) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        let timeout = self.config.session.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::ConnectTimeout(id));
        })
    }

    pub(super) async fn on_connect_timeout(&mut self, id: SessionId) {
        // A timer cancelled after it already fired leaves no handle behind.
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if !session.has_connect_timer() {
            return;
        }
        let error = Error::ConnectTimeout {
            remote: session.remote_identifier().to_string(),
            secs: self.config.session.connect_timeout.as_secs(),
        };
        warn!(session = %id, error = %error, "No channel opened in time");
        self.close_session(id, CloseReason::ConnectTimeout).await;
    }

    pub(super) async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready {
                endpoint,
                identifier,
            } => self.on_endpoint_ready(endpoint, identifier).await,
            TransportEvent::IncomingMedia { endpoint, channel } => {
                self.on_incoming_media(endpoint, channel).await;
            }
            TransportEvent::IncomingConduit { endpoint, conduit } => {
                self.on_incoming_conduit(endpoint, conduit).await;
            }
            TransportEvent::Disconnected { endpoint } => {
                warn!(endpoint = %endpoint, "Endpoint lost the broker");
                self.notify(SessionNotice::TransportStatus {
                    message: "disconnected from the broker".to_string(),
                    fatal: false,
                });
            }
            TransportEvent::Error {
                endpoint,
                kind,
                message,
            } => self.on_endpoint_error(endpoint, kind, message).await,
            TransportEvent::MediaOpen { channel } => self.on_media_open(channel),
            TransportEvent::MediaStream { channel, stream } => {
                self.on_media_stream(channel, stream);
            }
            TransportEvent::Connectivity { channel, state } => {
                self.on_connectivity(channel, state);
            }
            TransportEvent::ConduitOpen { channel } => self.on_conduit_open(channel).await,
            TransportEvent::ConduitData { channel, payload } => {
                self.on_conduit_data(channel, &payload).await;
            }
            TransportEvent::MediaClosed { channel } | TransportEvent::ConduitClosed { channel } => {
                self.on_channel_gone(channel, CloseReason::ChannelClosed)
                    .await;
            }
            TransportEvent::MediaError { channel, message }
            | TransportEvent::ConduitError { channel, message } => {
                self.on_channel_gone(channel, CloseReason::ChannelError(message))
                    .await;
            }
        }
    }

    fn is_host_endpoint(&self, endpoint: EndpointId) -> bool {
        self.host.as_ref().is_some_and(|h| h.id() == endpoint)
    }

    async fn on_endpoint_ready(&mut self, endpoint: EndpointId, identifier: String) {
        if self.is_host_endpoint(endpoint) {
            info!(identifier = %identifier, "Host endpoint ready");
            self.notify(SessionNotice::HostReady { identifier });
            return;
        }

        let Some(id) = self.registry.find_by_endpoint(endpoint) else {
            debug!(endpoint = %endpoint, "Ready event for an unowned endpoint");
            return;
        };
        debug!(session = %id, identifier = %identifier, "Scoped endpoint ready");

        let data_first = self.registry.get(id).is_some_and(Session::data_first);
        if !data_first {
            self.invite_media(id).await;
        }
        self.open_conduit(id).await;
    }

    /// Originate the media invitation of an outgoing session.
    pub(super) async fn invite_media(&mut self, id: SessionId) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if session.media().is_some() {
            return;
        }
        let Some(endpoint) = session.endpoint() else {
            return;
        };

        // The client only receives video; it offers an empty stream.
        let stream = MediaStream::new(format!("recv-{}", id.short()));
        let metadata = session.handover_token().map(InvitationMetadata::handover);
        let result = endpoint
            .call_media(session.remote_identifier(), &stream, metadata)
            .await;

        match result {
            Ok(media) => {
                debug!(session = %id, channel = %media.id(), "Media invitation sent");
                self.update(id, SessionUpdate::new().media(media));
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Media invitation failed");
                self.close_session(id, CloseReason::ChannelError(e.to_string()))
                    .await;
            }
        }
    }

    async fn open_conduit(&mut self, id: SessionId) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let Some(endpoint) = session.endpoint() else {
            return;
        };

        let metadata = session.handover_token().map(InvitationMetadata::handover);
        let result = endpoint
            .open_conduit(session.remote_identifier(), metadata)
            .await;

        match result {
            Ok(conduit) => {
                debug!(session = %id, channel = %conduit.id(), "Data conduit requested");
                let open = conduit.is_open();
                self.update(id, SessionUpdate::new().conduit(conduit).conduit_open(open));
                if open {
                    self.update(id, SessionUpdate::new().cancel_connect_timer());
                    self.on_conduit_ready(id).await;
                }
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Data conduit request failed");
                self.close_session(id, CloseReason::ChannelError(e.to_string()))
                    .await;
            }
        }
    }

    /// Find or create the incoming session for `remote`.
    fn incoming_session(&mut self, remote: &str) -> (SessionId, bool) {
        match self.registry.find_by_remote(remote, Direction::Incoming) {
            Some(id) => (id, false),
            None => (self.registry.create(remote, Direction::Incoming), true),
        }
    }

    /// Validate a handover token carried in invitation metadata.
    fn check_handover(&mut self, metadata: Option<&InvitationMetadata>) -> bool {
        let Some(token) = metadata.and_then(|m| m.handover_token.as_deref()) else {
            return false;
        };
        let valid = self.handover.validate(token, Instant::now());
        if valid {
            info!("Handover token accepted");
        } else {
            warn!("Unknown or expired handover token presented");
        }
        valid
    }

    async fn on_incoming_media(&mut self, endpoint: EndpointId, channel: Box<dyn MediaChannel>) {
        if !self.is_host_endpoint(endpoint) {
            debug!(endpoint = %endpoint, "Media invitation on a scoped endpoint refused");
            channel.close();
            return;
        }

        let remote = channel.remote_identifier().to_string();
        let handed_over = self.check_handover(channel.metadata());
        let (id, created) = self.incoming_session(&remote);
        info!(session = %id, remote = %remote, "Incoming media invitation");

        let mut update = SessionUpdate::new().pending_media(channel);
        if handed_over {
            update = update.authenticated(true);
        }
        self.update(id, update);
        self.after_incoming(id, created).await;
    }

    async fn on_incoming_conduit(&mut self, endpoint: EndpointId, conduit: Box<dyn Conduit>) {
        if !self.is_host_endpoint(endpoint) {
            debug!(endpoint = %endpoint, "Data conduit on a scoped endpoint refused");
            conduit.close();
            return;
        }

        if conduit
            .metadata()
            .is_some_and(InvitationMetadata::is_status_probe)
        {
            debug!(remote = %conduit.remote_identifier(), "Liveness probe");
            let now = Instant::now();
            self.probes.push((now, conduit));
            self.sweep_probes(now);
            return;
        }

        let remote = conduit.remote_identifier().to_string();
        let handed_over = self.check_handover(conduit.metadata());
        let open = conduit.is_open();
        let (id, created) = self.incoming_session(&remote);
        info!(session = %id, remote = %remote, "Incoming data conduit");

        let mut update = SessionUpdate::new().conduit(conduit).conduit_open(open);
        if handed_over {
            update = update.authenticated(true);
        }
        self.update(id, update);
        self.after_incoming(id, created).await;

        if open {
            self.on_conduit_ready(id).await;
        }
    }

    async fn after_incoming(&mut self, id: SessionId, created: bool) {
        if created {
            if let Some(session) = self.registry.get(id) {
                self.notify(SessionNotice::SessionOpened(session.snapshot()));
            }
        }
        self.request_approval(id);
        self.try_answer_pending(id).await;
        self.publish(id);
    }

    /// Surface the approval prompt, once per session.
    fn request_approval(&mut self, id: SessionId) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if session.is_authenticated() || session.approval_requested() || self.auth.is_passwordless()
        {
            return;
        }

        let remote_identifier = session.remote_identifier().to_string();
        self.update(id, SessionUpdate::new().approval_requested(true));
        info!(session = %id, remote = %remote_identifier, "Awaiting approval");
        self.notify(SessionNotice::ApprovalRequired {
            id,
            remote_identifier,
        });
    }

    async fn on_endpoint_error(
        &mut self,
        endpoint: EndpointId,
        kind: TransportErrorKind,
        message: String,
    ) {
        if self.is_host_endpoint(endpoint) {
            let fatal = kind == TransportErrorKind::UnavailableId;
            warn!(kind = ?kind, message = %message, "Host endpoint error");
            if fatal {
                if let Some(host) = self.host.take() {
                    host.dispose();
                }
            }
            self.notify(SessionNotice::TransportStatus { message, fatal });
            return;
        }

        let Some(id) = self.registry.find_by_endpoint(endpoint) else {
            debug!(endpoint = %endpoint, kind = ?kind, "Error on an unowned endpoint");
            return;
        };

        match kind {
            TransportErrorKind::PeerUnavailable => {
                warn!(session = %id, message = %message, "Remote peer unavailable");
                self.close_session(id, CloseReason::PeerUnavailable).await;
            }
            kind if kind.is_fatal() => {
                warn!(session = %id, kind = ?kind, message = %message, "Scoped endpoint failed");
                self.close_session(id, CloseReason::Transport(message)).await;
            }
            kind => {
                // The transport reconnects on its own; only reflect it.
                warn!(session = %id, kind = ?kind, message = %message, "Transient transport error");
                self.notify(SessionNotice::TransportStatus {
                    message,
                    fatal: false,
                });
            }
        }
    }

    fn on_media_open(&mut self, channel: ChannelId) {
        let Some((id, role)) = self.registry.find_by_channel(channel) else {
            return;
        };
        if role == ChannelRole::PendingMedia {
            return;
        }
        debug!(session = %id, "Media channel open");
        self.update(id, SessionUpdate::new().cancel_connect_timer());
        self.publish(id);
    }

    fn on_media_stream(&mut self, channel: ChannelId, stream: MediaStream) {
        let Some((id, _)) = self.registry.find_by_channel(channel) else {
            return;
        };
        let Some(session) = self.registry.get(id) else {
            return;
        };

        let mut update = SessionUpdate::new()
            .remote_stream(stream)
            .cancel_connect_timer();
        // The host skipped the credential exchange for a handover.
        if !session.is_incoming() && !session.is_authenticated() && session.handover_token().is_some() {
            info!(session = %id, "Session resumed through handover");
            update = update.authenticated(true);
        }
        info!(session = %id, "Remote stream received");
        self.update(id, update);
        self.publish(id);
    }

    fn on_connectivity(&mut self, channel: ChannelId, state: IceState) {
        let Some((id, _)) = self.registry.find_by_channel(channel) else {
            return;
        };
        let before = self.registry.get(id).map(Session::state);
        self.update(
            id,
            SessionUpdate::new().ice_interrupted(state.is_interrupted()),
        );
        let after = self.registry.get(id).map(Session::state);
        if before != after {
            info!(session = %id, state = ?state, "Connectivity changed");
            self.publish(id);
        }
    }

    async fn on_conduit_open(&mut self, channel: ChannelId) {
        let Some((id, role)) = self.registry.find_by_channel(channel) else {
            return;
        };
        if role != ChannelRole::Conduit {
            return;
        }
        info!(session = %id, "Data conduit open");
        self.update(
            id,
            SessionUpdate::new()
                .conduit_open(true)
                .cancel_connect_timer(),
        );
        self.on_conduit_ready(id).await;
    }

    /// Start the credential exchange on a freshly opened conduit.
    async fn on_conduit_ready(&mut self, id: SessionId) {
        let Some(session) = self.registry.get(id) else {
            return;
        };

        if session.is_incoming() {
            if !session.is_authenticated() && self.auth.is_passwordless() {
                info!(session = %id, "No secret configured, session accepted");
                self.update(id, SessionUpdate::new().authenticated(true));
            }
            if self.registry.get(id).is_some_and(Session::is_authenticated) {
                self.acknowledge(id).await;
                self.try_answer_pending(id).await;
            }
        } else if let Some(token) = session.handover_token().map(str::to_string) {
            let message = Message::HandoverValidation { token };
            if let Err(e) = self.send(id, &message).await {
                warn!(session = %id, error = %e, "Failed to send handover validation");
            }
        } else if let Some(credential) = session.pending_credential().map(str::to_string) {
            debug!(session = %id, "Sending credential");
            if let Err(e) = self.send(id, &Message::Auth { credential }).await {
                warn!(session = %id, error = %e, "Failed to send credential");
            }
        } else {
            let remote_identifier = session.remote_identifier().to_string();
            self.notify(SessionNotice::CredentialRequired {
                id,
                remote_identifier,
            });
        }

        self.publish(id);
    }

    /// Authenticate an incoming session and tell the client.
    pub(super) async fn grant(&mut self, id: SessionId) {
        self.update(
            id,
            SessionUpdate::new().authenticated(true).auth_error(None),
        );
        self.acknowledge(id).await;
        self.try_answer_pending(id).await;
        self.publish(id);
    }

    /// Send `AUTH_STATUS OK` and the source list over an open conduit.
    async fn acknowledge(&self, id: SessionId) {
        if !self.registry.get(id).is_some_and(Session::is_conduit_open) {
            return;
        }
        let ok = Message::AuthStatus {
            status: AuthVerdict::Ok,
        };
        if let Err(e) = self.send(id, &ok).await {
            warn!(session = %id, error = %e, "Failed to confirm authentication");
        }
        self.announce_sources(id).await;
    }

    async fn on_channel_gone(&mut self, channel: ChannelId, reason: CloseReason) {
        if let Some(index) = self.probes.iter().position(|(_, p)| p.id() == channel) {
            debug!(channel = %channel, "Liveness probe finished");
            self.probes.swap_remove(index);
            return;
        }
        let Some((id, role)) = self.registry.find_by_channel(channel) else {
            return;
        };
        info!(session = %id, role = ?role, reason = %reason, "Channel ended");
        self.close_session(id, reason).await;
    }

    pub(super) async fn approve(&mut self, id: SessionId) -> Result<()> {
        let session = self.session_in(id, Direction::Incoming)?;
        if session.is_authenticated() {
            return Ok(());
        }
        info!(session = %id, remote = %session.remote_identifier(), "Session approved");
        self.grant(id).await;
        Ok(())
    }

    pub(super) async fn reject(&mut self, id: SessionId) -> Result<()> {
        let session = self.session_in(id, Direction::Incoming)?;
        info!(session = %id, remote = %session.remote_identifier(), "Session rejected");
        if session.is_conduit_open() {
            if let Err(e) = self.send(id, &Message::CallRejected).await {
                debug!(session = %id, error = %e, "Rejection not delivered");
            }
        }
        self.close_session(id, CloseReason::Rejected).await;
        Ok(())
    }

    pub(super) async fn close(&mut self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        let live = matches!(
            session.state(),
            LifecycleState::Connected | LifecycleState::Reconnecting
        );
        if !session.is_incoming() && !live && session.is_conduit_open() {
            if let Err(e) = self.send(id, &Message::CallCancelled).await {
                debug!(session = %id, error = %e, "Cancellation not delivered");
            }
        }
        self.close_session(id, CloseReason::Local).await;
        Ok(())
    }

    pub(super) fn save_contacts(&self) {
        if let Err(e) = self.contacts.save() {
            warn!(error = %e, "Failed to save address book");
        }
    }
}
