//! Data-channel protocol router.
//!
//! Every inbound conduit message passes through [`SessionEngine::dispatch`]
//! in arrival order. Each message type is honoured only in the role that
//! may send it:
//!
//! | type                         | honoured on                    |
//! |------------------------------|--------------------------------|
//! | `AUTH`                       | host                           |
//! | `AUTH_STATUS`                | client                         |
//! | `CLIPBOARD`, `FILE_*`, chat  | either side, once authenticated|
//! | `SOURCES_LIST`               | client                         |
//! | `SWITCH_MONITOR`             | authenticated host             |
//! | `MONITOR_CHANGED`            | client                         |
//! | input events                 | authenticated host             |
//! | `CALL_REJECTED/CANCELLED`    | either side                    |
//! | `HANDOVER_PREPARATION`       | authenticated host             |
//! | `HANDOVER_VALIDATION`        | host, logged only              |
//! | `PING`, `PONG`               | either side                    |
//!
//! Anything else is dropped. Input on an unauthenticated host session is
//! dropped, never queued.

use std::path::Path;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Internal, SessionEngine, SessionNotice};
use crate::capability::{DropHint, InputCommand};
use crate::crypto::generate_handover_token;
use crate::error::{Error, Result};
use crate::protocol::{self, AuthVerdict, InputEvent, Message};
use crate::session::{
    ChannelRole, ChatEntry, ChatSender, CloseReason, Direction, Session, SessionId, SessionUpdate,
};
use crate::transfer::FileTransferRecord;
use crate::transport::ChannelId;

impl SessionEngine {
    pub(super) async fn on_conduit_data(&mut self, channel: ChannelId, payload: &[u8]) {
        let Some((id, ChannelRole::Conduit)) = self.registry.find_by_channel(channel) else {
            debug!(channel = %channel, "Data on an unowned channel dropped");
            return;
        };

        let message = match protocol::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(session = %id, error = %e, "Malformed message dropped");
                return;
            }
        };
        debug!(session = %id, kind = message.kind(), "Message received");
        self.dispatch(id, message).await;
    }

    async fn dispatch(&mut self, id: SessionId, message: Message) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let incoming = session.is_incoming();
        let authenticated = session.is_authenticated();

        let message = match message.into_input() {
            Ok(event) => {
                if incoming && authenticated {
                    self.on_input(id, event).await;
                } else {
                    debug!(session = %id, incoming, authenticated, "Input dropped");
                }
                return;
            }
            Err(message) => message,
        };

        match message {
            Message::Auth { credential } if incoming => self.on_auth(id, &credential).await,
            Message::AuthStatus { status } if !incoming => self.on_auth_status(id, status).await,
            Message::Clipboard { text } if authenticated => {
                if let Err(e) = self.caps.clipboard.write(&text).await {
                    warn!(session = %id, error = %e, "Failed to write clipboard");
                } else {
                    debug!(session = %id, len = text.len(), "Clipboard updated");
                    self.last_clipboard = Some(text);
                }
            }
            Message::FileStart {
                transfer_id,
                name,
                size,
                drop_x,
                drop_y,
            } if authenticated => {
                let hint = DropHint::from_parts(drop_x, drop_y);
                let files = self.caps.files.as_ref();
                let result = self
                    .transfers
                    .start_inbound(id, &transfer_id, &name, size, hint, files)
                    .await
                    .cloned();
                self.report_transfer(&transfer_id, result);
            }
            Message::FileChunk {
                transfer_id,
                chunk,
                seq,
            } if authenticated => {
                let result = self
                    .transfers
                    .accept_chunk(id, &transfer_id, seq, &chunk, self.caps.files.as_ref())
                    .await
                    .cloned();
                self.report_transfer(&transfer_id, result);
            }
            Message::FileEnd { transfer_id } if authenticated => {
                let result = self
                    .transfers
                    .finish_inbound(id, &transfer_id, self.caps.files.as_ref())
                    .await
                    .cloned();
                self.report_transfer(&transfer_id, result);
            }
            Message::SourcesList {
                sources,
                active_source_id,
            } if !incoming => {
                debug!(session = %id, count = sources.len(), "Host sources received");
                self.update(
                    id,
                    SessionUpdate::new()
                        .sources(sources)
                        .active_source(active_source_id),
                );
                self.publish(id);
            }
            Message::SwitchMonitor { source_id } if incoming && authenticated => {
                self.on_switch_monitor(id, source_id).await;
            }
            Message::MonitorChanged { active_source_id } if !incoming => {
                info!(session = %id, source = %active_source_id, "Host switched source");
                self.update(
                    id,
                    SessionUpdate::new().active_source(Some(active_source_id)),
                );
                self.publish(id);
            }
            Message::CallRejected => {
                info!(session = %id, "Peer rejected the session");
                self.close_session(id, CloseReason::Rejected).await;
            }
            Message::CallCancelled => {
                info!(session = %id, "Peer cancelled the session");
                self.close_session(id, CloseReason::Cancelled).await;
            }
            Message::HandoverPreparation { token } if incoming && authenticated => {
                info!(session = %id, "Handover token recorded");
                self.handover.record(token, Instant::now());
            }
            Message::HandoverValidation { token } if incoming => {
                if self.handover.contains(&token, Instant::now()) {
                    info!(session = %id, "Peer confirmed handover");
                } else {
                    warn!(session = %id, "Handover confirmation with an unknown token");
                }
            }
            Message::ChatMessage { text, timestamp } if authenticated => {
                let entry = ChatEntry {
                    sender: ChatSender::Remote,
                    text,
                    timestamp,
                };
                self.update(id, SessionUpdate::new().chat(entry.clone()));
                self.notify(SessionNotice::Chat { id, entry });
            }
            Message::Ping => {
                if let Err(e) = self.send(id, &Message::Pong).await {
                    debug!(session = %id, error = %e, "Heartbeat reply not sent");
                }
            }
            Message::Pong => {
                let was_stale = self
                    .registry
                    .get(id)
                    .is_some_and(Session::heartbeat_stale);
                self.update(id, SessionUpdate::new().heartbeat(Instant::now()));
                if was_stale {
                    info!(session = %id, "Heartbeat restored");
                    self.publish(id);
                }
            }
            Message::Unknown => debug!(session = %id, "Unknown message type dropped"),
            other => {
                warn!(
                    session = %id,
                    kind = other.kind(),
                    incoming,
                    authenticated,
                    "Message not allowed on this session, dropped"
                );
            }
        }
    }

    async fn on_input(&self, id: SessionId, event: InputEvent) {
        let source_bounds = self
            .active_source
            .as_deref()
            .and_then(|active| self.local_sources.iter().find(|s| s.id == active))
            .and_then(|s| s.bounds);
        let command = InputCommand {
            event,
            source_bounds,
        };
        if let Err(e) = self.caps.input.execute(command).await {
            warn!(session = %id, error = %e, "Input injection failed");
        }
    }

    async fn on_auth(&mut self, id: SessionId, credential: &str) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let remote = session.remote_identifier().to_string();
        let evaluation = self.auth.evaluate(&remote, credential, Instant::now());

        if let Some(left) = evaluation.locked_for {
            let secs = left.as_secs().max(1);
            warn!(
                session = %id,
                remote = %remote,
                error = %Error::AuthLocked(secs),
                "Credential ignored"
            );
        }

        match evaluation.verdict {
            AuthVerdict::Ok => {
                info!(session = %id, "Credential accepted");
                self.grant(id).await;
            }
            AuthVerdict::Fail => {
                warn!(session = %id, failures = evaluation.failures, "Credential rejected");
                let fail = Message::AuthStatus {
                    status: AuthVerdict::Fail,
                };
                if let Err(e) = self.send(id, &fail).await {
                    warn!(session = %id, error = %e, "Failed to send verdict");
                }
            }
        }
    }

    async fn on_auth_status(&mut self, id: SessionId, status: AuthVerdict) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let remote = session.remote_identifier().to_string();

        match status {
            AuthVerdict::Ok => {
                if session.remember_credential() {
                    if let Some(credential) = session.pending_credential().map(str::to_string) {
                        self.contacts.remember_credential(&remote, &credential);
                    }
                }
                info!(session = %id, remote = %remote, "Authenticated by host");
                self.contacts.mark_connected(&remote);
                self.save_contacts();
                self.update(
                    id,
                    SessionUpdate::new()
                        .authenticated(true)
                        .auth_error(None)
                        .pending_credential(None),
                );
                // The client originates media once authenticated.
                self.invite_media(id).await;
                self.publish(id);
            }
            AuthVerdict::Fail => {
                warn!(session = %id, remote = %remote, "Host rejected credential");
                self.update(
                    id,
                    SessionUpdate::new()
                        .pending_credential(None)
                        .auth_error(Some(Error::AuthenticationRejected.to_string())),
                );
                self.notify(SessionNotice::AuthenticationFailed {
                    id,
                    remote_identifier: remote,
                });
                self.publish(id);
            }
        }
    }

    async fn on_switch_monitor(&mut self, id: SessionId, source_id: String) {
        let result = self.caps.sources.select(&source_id).await;
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = %id, source = %source_id, error = %e, "Source switch failed");
                return;
            }
        };

        info!(session = %id, source = %source_id, "Capture source switched");
        self.local_stream = Some(stream);
        self.active_source = Some(source_id.clone());

        let incoming: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|s| s.is_incoming())
            .map(Session::id)
            .collect();
        let changed = Message::MonitorChanged {
            active_source_id: source_id.clone(),
        };
        for sid in incoming {
            self.replace_outgoing_stream(sid).await;
            self.update(sid, SessionUpdate::new().active_source(Some(source_id.clone())));
            if self
                .registry
                .get(sid)
                .is_some_and(|s| s.is_authenticated() && s.is_conduit_open())
            {
                if let Err(e) = self.send(sid, &changed).await {
                    warn!(session = %sid, error = %e, "Failed to confirm source switch");
                }
            }
            self.publish(sid);
        }
    }

    fn report_transfer(&self, transfer_id: &str, result: Result<FileTransferRecord>) {
        match result {
            Ok(record) => self.notify(SessionNotice::Transfer(record)),
            Err(e) => {
                warn!(transfer = %transfer_id, error = %e, "File transfer message rejected");
                if let Some(record) = self.transfers.get(transfer_id) {
                    self.notify(SessionNotice::Transfer(record.clone()));
                }
            }
        }
    }

    fn outgoing_authenticated(&self, id: SessionId) -> Result<&Session> {
        self.session_in(id, Direction::Outgoing)?;
        self.authenticated_session(id)
    }

    pub(super) async fn submit_credential(
        &mut self,
        id: SessionId,
        credential: String,
        remember: bool,
    ) -> Result<()> {
        let open = self.session_in(id, Direction::Outgoing)?.is_conduit_open();
        self.update(
            id,
            SessionUpdate::new()
                .pending_credential(Some(credential.clone()))
                .remember_credential(remember)
                .auth_error(None),
        );
        if open {
            self.send(id, &Message::Auth { credential }).await?;
        }
        self.publish(id);
        Ok(())
    }

    pub(super) async fn send_clipboard(
        &mut self,
        id: SessionId,
        text: Option<String>,
    ) -> Result<()> {
        self.authenticated_session(id)?;
        let text = match text {
            Some(text) => text,
            None => self.caps.clipboard.read().await?,
        };
        self.send(id, &Message::Clipboard { text: text.clone() })
            .await?;
        self.last_clipboard = Some(text);
        Ok(())
    }

    pub(super) async fn send_file(
        &mut self,
        id: SessionId,
        path: &Path,
        hint: Option<DropHint>,
    ) -> Result<String> {
        if !self.authenticated_session(id)?.is_conduit_open() {
            return Err(Error::SessionNotReady {
                session: id,
                reason: "data conduit is not open".to_string(),
            });
        }

        let description = self.caps.files.describe(path).await?;
        let (transfer_id, start) = self
            .transfers
            .start_outbound(id, path, description, hint);

        if let Err(e) = self.send(id, &start).await {
            self.transfers.fail(&transfer_id, &e.to_string());
            return Err(e);
        }
        if let Some(record) = self.transfers.get(&transfer_id) {
            self.notify(SessionNotice::Transfer(record.clone()));
        }

        let _ = self
            .internal_tx
            .send(Internal::ContinueTransfer(transfer_id.clone()));
        Ok(transfer_id)
    }

    pub(super) async fn send_input(&self, id: SessionId, event: InputEvent) -> Result<()> {
        self.outgoing_authenticated(id)?;
        self.send(id, &Message::from(event)).await
    }

    pub(super) async fn request_monitor(&self, id: SessionId, source_id: String) -> Result<()> {
        self.outgoing_authenticated(id)?;
        self.send(id, &Message::SwitchMonitor { source_id }).await
    }

    pub(super) async fn send_chat(&mut self, id: SessionId, text: String) -> Result<()> {
        self.authenticated_session(id)?;
        let entry = ChatEntry {
            sender: ChatSender::Me,
            text,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let message = Message::ChatMessage {
            text: entry.text.clone(),
            timestamp: entry.timestamp,
        };
        self.send(id, &message).await?;
        self.update(id, SessionUpdate::new().chat(entry.clone()));
        self.notify(SessionNotice::Chat { id, entry });
        Ok(())
    }

    pub(super) async fn prepare_handover(&self, id: SessionId) -> Result<String> {
        self.outgoing_authenticated(id)?;
        let token = generate_handover_token();
        self.send(
            id,
            &Message::HandoverPreparation {
                token: token.clone(),
            },
        )
        .await?;
        info!(session = %id, "Handover prepared");
        Ok(token)
    }
}
