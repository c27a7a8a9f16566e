//! Session records.
//!
//! A [`Session`] is one logical host/client conversation. It exclusively
//! owns its transport handles (scoped endpoint, media channel, pending media
//! invitation, data conduit) and its connect timer; [`Session::release`]
//! frees each of them exactly once.
//!
//! Sessions are only mutated through [`SessionRegistry::update`] with a
//! [`SessionUpdate`]; the UI reads cloneable [`SessionSnapshot`]s.
//!
//! ## Lifecycle
//!
//! ```text
//! connecting ──► authenticating ──► connected ◄──► reconnecting
//!      │                │               │               │
//!      └────────────────┴───────┬───────┴───────────────┘
//!                               ▼
//!                             closed
//! ```
//!
//! The state is derived from the session's flags rather than stored:
//! incoming sessions skip `authenticating`, and `reconnecting` overlays
//! `connected` while connectivity is interrupted or heartbeats are stale.

mod registry;

pub use registry::SessionRegistry;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::DesktopSource;
use crate::transport::{ChannelId, Conduit, Endpoint, EndpointId, MediaChannel, MediaStream};

/// Locally generated session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used in scoped endpoint identifiers.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which side of the conversation we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// We are the host being controlled
    Incoming,
    /// We are the client controlling a remote host
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Endpoint being established
    Connecting,
    /// Conduit open, credential exchange outstanding
    Authenticating,
    /// Live
    Connected,
    /// Live but connectivity is interrupted
    Reconnecting,
    /// Terminal
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Author of a chat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    /// Sent from this process
    Me,
    /// Received from the peer
    Remote,
}

/// One chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// Author
    pub sender: ChatSender,
    /// Text
    pub text: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum CloseReason {
    /// Closed by the local user
    Local,
    /// Host declined the connection
    Rejected,
    /// Client abandoned the attempt
    Cancelled,
    /// Media channel or conduit closed
    ChannelClosed,
    /// Media channel or conduit failed
    ChannelError(String),
    /// Remote identifier unknown or offline
    PeerUnavailable,
    /// No channel opened in time
    ConnectTimeout,
    /// Transport refused to open an endpoint
    Transport(String),
    /// Engine shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Rejected => write!(f, "the remote host rejected the connection"),
            Self::Cancelled => write!(f, "the remote client cancelled the connection"),
            Self::ChannelClosed => write!(f, "the connection was closed"),
            Self::ChannelError(e) => write!(f, "connection error: {e}"),
            Self::PeerUnavailable => write!(f, "the remote device is unavailable or offline"),
            Self::ConnectTimeout => write!(f, "connection timeout"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Shutdown => write!(f, "shutting down"),
        }
    }
}

/// Which handle of a session a channel id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Answered or originated media channel
    Media,
    /// Media invitation waiting for authentication
    PendingMedia,
    /// Data conduit
    Conduit,
}

/// One logical remote-desktop conversation.
pub struct Session {
    id: SessionId,
    remote_identifier: String,
    direction: Direction,
    created_at: DateTime<Utc>,

    authenticated: bool,
    conduit_open: bool,
    call_answered: bool,
    ice_interrupted: bool,
    heartbeat_stale: bool,
    last_heartbeat: Option<Instant>,

    pending_credential: Option<String>,
    remember_credential: bool,
    auth_error: Option<String>,
    approval_requested: bool,
    handover_token: Option<String>,
    data_first: bool,

    sources: Vec<DesktopSource>,
    active_source: Option<String>,
    messages: Vec<ChatEntry>,

    endpoint: Option<Box<dyn Endpoint>>,
    media: Option<Box<dyn MediaChannel>>,
    pending_media: Option<Box<dyn MediaChannel>>,
    conduit: Option<Box<dyn Conduit>>,
    remote_stream: Option<MediaStream>,
    connect_timer: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, remote_identifier: String, direction: Direction) -> Self {
        Self {
            id,
            remote_identifier,
            direction,
            created_at: Utc::now(),
            authenticated: false,
            conduit_open: false,
            call_answered: false,
            ice_interrupted: false,
            heartbeat_stale: false,
            last_heartbeat: None,
            pending_credential: None,
            remember_credential: false,
            auth_error: None,
            approval_requested: false,
            handover_token: None,
            data_first: false,
            sources: Vec::new(),
            active_source: None,
            messages: Vec::new(),
            endpoint: None,
            media: None,
            pending_media: None,
            conduit: None,
            remote_stream: None,
            connect_timer: None,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The peer's identifier.
    pub fn remote_identifier(&self) -> &str {
        &self.remote_identifier
    }

    /// Host or client role.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether we are the host side.
    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }

    /// Authorization gate for remote input and data traffic.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether the data conduit accepts traffic.
    pub fn is_conduit_open(&self) -> bool {
        self.conduit_open && self.conduit.is_some()
    }

    /// Whether the pending media invitation has been answered.
    pub fn call_answered(&self) -> bool {
        self.call_answered
    }

    /// Credential waiting to be sent or confirmed.
    pub fn pending_credential(&self) -> Option<&str> {
        self.pending_credential.as_deref()
    }

    /// Whether a confirmed credential should be saved to the contact.
    pub fn remember_credential(&self) -> bool {
        self.remember_credential
    }

    /// Whether the approval prompt has been surfaced.
    pub fn approval_requested(&self) -> bool {
        self.approval_requested
    }

    /// Handover token this session reconnects with (client side).
    pub fn handover_token(&self) -> Option<&str> {
        self.handover_token.as_deref()
    }

    /// Whether the media invitation waits for authentication (client side).
    pub fn data_first(&self) -> bool {
        self.data_first
    }

    /// Time of the last heartbeat reply.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Whether heartbeats have gone stale.
    pub fn heartbeat_stale(&self) -> bool {
        self.heartbeat_stale
    }

    /// Capture sources the host advertised.
    pub fn sources(&self) -> &[DesktopSource] {
        &self.sources
    }

    /// Source the host is streaming.
    pub fn active_source(&self) -> Option<&str> {
        self.active_source.as_deref()
    }

    /// Scoped endpoint (outgoing sessions only).
    pub fn endpoint(&self) -> Option<&dyn Endpoint> {
        self.endpoint.as_deref()
    }

    /// Established media channel.
    pub fn media(&self) -> Option<&dyn MediaChannel> {
        self.media.as_deref()
    }

    /// Media invitation waiting for authentication.
    pub fn pending_media(&self) -> Option<&dyn MediaChannel> {
        self.pending_media.as_deref()
    }

    /// Data conduit.
    pub fn conduit(&self) -> Option<&dyn Conduit> {
        self.conduit.as_deref()
    }

    /// Whether a connect timer is armed.
    pub fn has_connect_timer(&self) -> bool {
        self.connect_timer.is_some()
    }

    /// Whether `endpoint` is this session's scoped endpoint.
    pub fn owns_endpoint(&self, endpoint: EndpointId) -> bool {
        self.endpoint.as_ref().is_some_and(|e| e.id() == endpoint)
    }

    /// Which handle `channel` refers to, if any.
    pub fn channel_role(&self, channel: ChannelId) -> Option<ChannelRole> {
        if self.conduit.as_ref().is_some_and(|c| c.id() == channel) {
            Some(ChannelRole::Conduit)
        } else if self.media.as_ref().is_some_and(|m| m.id() == channel) {
            Some(ChannelRole::Media)
        } else if self.pending_media.as_ref().is_some_and(|m| m.id() == channel) {
            Some(ChannelRole::PendingMedia)
        } else {
            None
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        let live = match self.direction {
            Direction::Outgoing if self.authenticated => true,
            Direction::Outgoing => {
                return if self.is_conduit_open() {
                    LifecycleState::Authenticating
                } else {
                    LifecycleState::Connecting
                };
            }
            Direction::Incoming => self.authenticated,
        };

        if !live {
            LifecycleState::Connecting
        } else if self.ice_interrupted || self.heartbeat_stale {
            LifecycleState::Reconnecting
        } else {
            LifecycleState::Connected
        }
    }

    /// Read model for the UI.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            remote_identifier: self.remote_identifier.clone(),
            direction: self.direction,
            state: self.state(),
            is_authenticated: self.authenticated,
            has_media: self.media.is_some(),
            has_conduit: self.is_conduit_open(),
            awaiting_approval: self.approval_requested && !self.authenticated,
            remote_stream: self.remote_stream.clone(),
            sources: self.sources.clone(),
            active_source: self.active_source.clone(),
            messages: self.messages.clone(),
            auth_error: self.auth_error.clone(),
            created_at: self.created_at,
        }
    }

    fn apply(&mut self, update: SessionUpdate) {
        let SessionUpdate {
            remote_identifier,
            authenticated,
            conduit_open,
            ice_interrupted,
            heartbeat,
            heartbeat_stale,
            pending_credential,
            remember_credential,
            auth_error,
            approval_requested,
            handover_token,
            data_first,
            sources,
            active_source,
            chat,
            endpoint,
            media,
            pending_media,
            conduit,
            remote_stream,
            connect_timer,
            cancel_connect_timer,
            answer_pending_media,
        } = update;

        if let Some(v) = remote_identifier {
            self.remote_identifier = v;
        }
        if let Some(v) = authenticated {
            self.authenticated = v;
        }
        if let Some(v) = conduit_open {
            self.conduit_open = v;
        }
        if let Some(v) = ice_interrupted {
            self.ice_interrupted = v;
        }
        if let Some(v) = heartbeat {
            self.last_heartbeat = Some(v);
        }
        if let Some(v) = heartbeat_stale {
            self.heartbeat_stale = v;
        }
        if let Some(v) = pending_credential {
            self.pending_credential = v;
        }
        if let Some(v) = remember_credential {
            self.remember_credential = v;
        }
        if let Some(v) = auth_error {
            self.auth_error = v;
        }
        if let Some(v) = approval_requested {
            self.approval_requested = v;
        }
        if let Some(v) = handover_token {
            self.handover_token = v;
        }
        if let Some(v) = data_first {
            self.data_first = v;
        }
        if let Some(v) = sources {
            self.sources = v;
        }
        if let Some(v) = active_source {
            self.active_source = v;
        }
        if let Some(entry) = chat {
            self.messages.push(entry);
        }
        if let Some(v) = remote_stream {
            self.remote_stream = Some(v);
        }

        // Superseded handles are released as they are replaced.
        if let Some(v) = endpoint {
            if let Some(old) = self.endpoint.replace(v) {
                old.dispose();
            }
        }
        if let Some(v) = media {
            if let Some(old) = self.media.replace(v) {
                old.close();
            }
        }
        if let Some(v) = pending_media {
            if let Some(old) = self.pending_media.replace(v) {
                old.close();
            }
        }
        if let Some(v) = conduit {
            if let Some(old) = self.conduit.replace(v) {
                old.close();
            }
        }
        if cancel_connect_timer {
            if let Some(timer) = self.connect_timer.take() {
                timer.abort();
            }
        }
        if let Some(v) = connect_timer {
            if let Some(old) = self.connect_timer.replace(v) {
                old.abort();
            }
        }
        if answer_pending_media {
            if let Some(invitation) = self.pending_media.take() {
                if let Some(old) = self.media.replace(invitation) {
                    old.close();
                }
                self.call_answered = true;
            }
        }
    }

    /// Release every owned handle. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
        if let Some(conduit) = self.conduit.take() {
            conduit.close();
        }
        if let Some(media) = self.media.take() {
            media.close();
        }
        if let Some(media) = self.pending_media.take() {
            media.close();
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.dispose();
        }
        self.conduit_open = false;
        self.remote_stream = None;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_identifier", &self.remote_identifier)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("authenticated", &self.authenticated)
            .field("has_endpoint", &self.endpoint.is_some())
            .field("has_media", &self.media.is_some())
            .field("has_pending_media", &self.pending_media.is_some())
            .field("has_conduit", &self.conduit.is_some())
            .finish_non_exhaustive()
    }
}

/// Partial update merged into a session by [`SessionRegistry::update`].
///
/// `Option<Option<T>>` fields distinguish "leave alone" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Default)]
#[allow(clippy::struct_excessive_bools, clippy::option_option)]
pub struct SessionUpdate {
    remote_identifier: Option<String>,
    authenticated: Option<bool>,
    conduit_open: Option<bool>,
    ice_interrupted: Option<bool>,
    heartbeat: Option<Instant>,
    heartbeat_stale: Option<bool>,
    pending_credential: Option<Option<String>>,
    remember_credential: Option<bool>,
    auth_error: Option<Option<String>>,
    approval_requested: Option<bool>,
    handover_token: Option<Option<String>>,
    data_first: Option<bool>,
    sources: Option<Vec<DesktopSource>>,
    active_source: Option<Option<String>>,
    chat: Option<ChatEntry>,
    endpoint: Option<Box<dyn Endpoint>>,
    media: Option<Box<dyn MediaChannel>>,
    pending_media: Option<Box<dyn MediaChannel>>,
    conduit: Option<Box<dyn Conduit>>,
    remote_stream: Option<MediaStream>,
    connect_timer: Option<JoinHandle<()>>,
    cancel_connect_timer: bool,
    answer_pending_media: bool,
}

#[allow(clippy::option_option)]
impl SessionUpdate {
    /// An empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Correct the remote identifier.
    #[must_use]
    pub fn remote_identifier(mut self, v: impl Into<String>) -> Self {
        self.remote_identifier = Some(v.into());
        self
    }

    /// Set the authorization flag.
    #[must_use]
    pub fn authenticated(mut self, v: bool) -> Self {
        self.authenticated = Some(v);
        self
    }

    /// Mark the conduit open or closed.
    #[must_use]
    pub fn conduit_open(mut self, v: bool) -> Self {
        self.conduit_open = Some(v);
        self
    }

    /// Flag interrupted ICE connectivity.
    #[must_use]
    pub fn ice_interrupted(mut self, v: bool) -> Self {
        self.ice_interrupted = Some(v);
        self
    }

    /// Record a heartbeat reply.
    #[must_use]
    pub fn heartbeat(mut self, at: Instant) -> Self {
        self.heartbeat = Some(at);
        self.heartbeat_stale = Some(false);
        self
    }

    /// Flag stale heartbeats.
    #[must_use]
    pub fn heartbeat_stale(mut self, v: bool) -> Self {
        self.heartbeat_stale = Some(v);
        self
    }

    /// Set or clear the pending credential.
    #[must_use]
    pub fn pending_credential(mut self, v: Option<String>) -> Self {
        self.pending_credential = Some(v);
        self
    }

    /// Whether to save the credential once confirmed.
    #[must_use]
    pub fn remember_credential(mut self, v: bool) -> Self {
        self.remember_credential = Some(v);
        self
    }

    /// Set or clear the authentication error.
    #[must_use]
    pub fn auth_error(mut self, v: Option<String>) -> Self {
        self.auth_error = Some(v);
        self
    }

    /// Mark the approval prompt as surfaced.
    #[must_use]
    pub fn approval_requested(mut self, v: bool) -> Self {
        self.approval_requested = Some(v);
        self
    }

    /// Set or clear the handover token.
    #[must_use]
    pub fn handover_token(mut self, v: Option<String>) -> Self {
        self.handover_token = Some(v);
        self
    }

    /// Defer the media invitation until authenticated.
    #[must_use]
    pub fn data_first(mut self, v: bool) -> Self {
        self.data_first = Some(v);
        self
    }

    /// Replace the advertised sources.
    #[must_use]
    pub fn sources(mut self, v: Vec<DesktopSource>) -> Self {
        self.sources = Some(v);
        self
    }

    /// Set or clear the active source.
    #[must_use]
    pub fn active_source(mut self, v: Option<String>) -> Self {
        self.active_source = Some(v);
        self
    }

    /// Append a chat line.
    #[must_use]
    pub fn chat(mut self, entry: ChatEntry) -> Self {
        self.chat = Some(entry);
        self
    }

    /// Attach the scoped endpoint.
    #[must_use]
    pub fn endpoint(mut self, v: Box<dyn Endpoint>) -> Self {
        self.endpoint = Some(v);
        self
    }

    /// Attach an established media channel.
    #[must_use]
    pub fn media(mut self, v: Box<dyn MediaChannel>) -> Self {
        self.media = Some(v);
        self
    }

    /// Attach a media invitation awaiting authentication.
    #[must_use]
    pub fn pending_media(mut self, v: Box<dyn MediaChannel>) -> Self {
        self.pending_media = Some(v);
        self
    }

    /// Attach the data conduit.
    #[must_use]
    pub fn conduit(mut self, v: Box<dyn Conduit>) -> Self {
        self.conduit = Some(v);
        self
    }

    /// Record the remote stream.
    #[must_use]
    pub fn remote_stream(mut self, v: MediaStream) -> Self {
        self.remote_stream = Some(v);
        self
    }

    /// Arm the connect timer.
    #[must_use]
    pub fn connect_timer(mut self, v: JoinHandle<()>) -> Self {
        self.connect_timer = Some(v);
        self
    }

    /// Cancel the connect timer.
    #[must_use]
    pub fn cancel_connect_timer(mut self) -> Self {
        self.cancel_connect_timer = true;
        self
    }

    /// Promote the pending invitation to the media channel.
    #[must_use]
    pub fn answer_pending_media(mut self) -> Self {
        self.answer_pending_media = true;
        self
    }
}

/// Cloneable read model of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Peer identifier
    pub remote_identifier: String,
    /// Host or client role
    pub direction: Direction,
    /// Lifecycle state
    pub state: LifecycleState,
    /// Authorization flag
    pub is_authenticated: bool,
    /// Media channel established
    pub has_media: bool,
    /// Conduit open
    pub has_conduit: bool,
    /// Approval prompt outstanding
    pub awaiting_approval: bool,
    /// Remote screen stream
    pub remote_stream: Option<MediaStream>,
    /// Host capture sources
    pub sources: Vec<DesktopSource>,
    /// Streamed source
    pub active_source: Option<String>,
    /// Chat log
    pub messages: Vec<ChatEntry>,
    /// Last authentication error
    pub auth_error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
