//! Transport capability seam.
//!
//! The peer-brokering transport (signaling, NAT traversal, media and data
//! channels) lives outside this crate. The engine drives it through the
//! traits below and learns about progress exclusively through
//! [`TransportEvent`]s pushed into an [`EventSink`].
//!
//! Handles are identified by [`EndpointId`] / [`ChannelId`] so events can be
//! routed back to the session that owns them without holding references.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::error::Result;

/// Metadata purpose marking a liveness probe conduit.
pub const STATUS_PROBE_PURPOSE: &str = "status-check";

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies an endpoint opened through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u64);

impl EndpointId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// Identifies a media channel or data conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Opaque handle to a local or remote media stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    /// Stream id assigned by the capture layer
    pub id: String,
    /// Capture source feeding the stream, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl MediaStream {
    /// Create a stream handle.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_id: None,
        }
    }

    /// Attach the capture source id.
    #[must_use]
    pub fn from_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

/// Metadata attached to an outgoing media invitation or conduit request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationMetadata {
    /// Purpose tag (`status-check` for liveness probes)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Handover token presented by a reconnecting peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover_token: Option<String>,
}

impl InvitationMetadata {
    /// Metadata for a liveness probe conduit.
    #[must_use]
    pub fn status_probe() -> Self {
        Self {
            purpose: Some(STATUS_PROBE_PURPOSE.to_string()),
            handover_token: None,
        }
    }

    /// Metadata carrying a handover token.
    #[must_use]
    pub fn handover(token: impl Into<String>) -> Self {
        Self {
            purpose: None,
            handover_token: Some(token.into()),
        }
    }

    /// Whether this marks a liveness probe.
    #[must_use]
    pub fn is_status_probe(&self) -> bool {
        self.purpose.as_deref() == Some(STATUS_PROBE_PURPOSE)
    }
}

/// Broker connection settings handed to [`Transport::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Broker host (`cloud` for the public broker)
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Broker mount path
    pub path: String,
    /// STUN/TURN servers
    pub ice_servers: Vec<String>,
}

impl From<&BrokerConfig> for EndpointConfig {
    fn from(broker: &BrokerConfig) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            path: broker.path.clone(),
            ice_servers: broker.ice_servers.clone(),
        }
    }
}

/// Classification of endpoint-level transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Remote identifier does not exist or is offline
    PeerUnavailable,
    /// Network blip; the transport reconnects on its own
    Network,
    /// Signaling server hiccup; the transport reconnects on its own
    ServerError,
    /// The requested local identifier is taken
    UnavailableId,
    /// Anything else
    Other,
}

impl TransportErrorKind {
    /// Whether the failure ends any session that depends on it.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::PeerUnavailable | Self::UnavailableId)
    }
}

/// Connectivity state reported by the media channel's ICE agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    /// Gathering
    New,
    /// Checking candidates
    Checking,
    /// Connected
    Connected,
    /// All checks done
    Completed,
    /// Temporarily lost
    Disconnected,
    /// Gave up
    Failed,
    /// Shut down
    Closed,
}

impl IceState {
    /// Whether the path to the peer is currently interrupted.
    #[must_use]
    pub const fn is_interrupted(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Events pushed by the transport.
pub enum TransportEvent {
    /// Endpoint registered with the broker
    Ready {
        /// Endpoint
        endpoint: EndpointId,
        /// Identifier the broker confirmed
        identifier: String,
    },
    /// A peer invited us to a media session
    IncomingMedia {
        /// Receiving endpoint
        endpoint: EndpointId,
        /// The invitation
        channel: Box<dyn MediaChannel>,
    },
    /// A peer opened a data conduit to us
    IncomingConduit {
        /// Receiving endpoint
        endpoint: EndpointId,
        /// The conduit
        conduit: Box<dyn Conduit>,
    },
    /// Endpoint lost the broker
    Disconnected {
        /// Endpoint
        endpoint: EndpointId,
    },
    /// Endpoint-level error
    Error {
        /// Endpoint
        endpoint: EndpointId,
        /// Classification
        kind: TransportErrorKind,
        /// Transport message
        message: String,
    },
    /// Media channel negotiated
    MediaOpen {
        /// Channel
        channel: ChannelId,
    },
    /// Remote stream available
    MediaStream {
        /// Channel
        channel: ChannelId,
        /// Remote stream
        stream: MediaStream,
    },
    /// Media channel closed
    MediaClosed {
        /// Channel
        channel: ChannelId,
    },
    /// Media channel failed
    MediaError {
        /// Channel
        channel: ChannelId,
        /// Transport message
        message: String,
    },
    /// ICE connectivity change on a media channel
    Connectivity {
        /// Channel
        channel: ChannelId,
        /// New state
        state: IceState,
    },
    /// Conduit ready for traffic
    ConduitOpen {
        /// Channel
        channel: ChannelId,
    },
    /// Conduit payload
    ConduitData {
        /// Channel
        channel: ChannelId,
        /// Raw message bytes
        payload: Vec<u8>,
    },
    /// Conduit closed
    ConduitClosed {
        /// Channel
        channel: ChannelId,
    },
    /// Conduit failed
    ConduitError {
        /// Channel
        channel: ChannelId,
        /// Transport message
        message: String,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready {
                endpoint,
                identifier,
            } => write!(f, "Ready({endpoint}, {identifier})"),
            Self::IncomingMedia { endpoint, channel } => write!(
                f,
                "IncomingMedia({endpoint}, {} from {})",
                channel.id(),
                channel.remote_identifier()
            ),
            Self::IncomingConduit { endpoint, conduit } => write!(
                f,
                "IncomingConduit({endpoint}, {} from {})",
                conduit.id(),
                conduit.remote_identifier()
            ),
            Self::Disconnected { endpoint } => write!(f, "Disconnected({endpoint})"),
            Self::Error {
                endpoint, kind, ..
            } => write!(f, "Error({endpoint}, {kind:?})"),
            Self::MediaOpen { channel } => write!(f, "MediaOpen({channel})"),
            Self::MediaStream { channel, stream } => {
                write!(f, "MediaStream({channel}, {})", stream.id)
            }
            Self::MediaClosed { channel } => write!(f, "MediaClosed({channel})"),
            Self::MediaError { channel, .. } => write!(f, "MediaError({channel})"),
            Self::Connectivity { channel, state } => {
                write!(f, "Connectivity({channel}, {state:?})")
            }
            Self::ConduitOpen { channel } => write!(f, "ConduitOpen({channel})"),
            Self::ConduitData { channel, payload } => {
                write!(f, "ConduitData({channel}, {} bytes)", payload.len())
            }
            Self::ConduitClosed { channel } => write!(f, "ConduitClosed({channel})"),
            Self::ConduitError { channel, .. } => write!(f, "ConduitError({channel})"),
        }
    }
}

/// Where a transport delivers its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Events emitted after the receiver is gone are dropped.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }
}

/// Factory for endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register `identifier` with the broker.
    ///
    /// The endpoint reports [`TransportEvent::Ready`] through `events` once
    /// the broker confirms the registration.
    async fn open(
        &self,
        identifier: &str,
        config: &EndpointConfig,
        events: EventSink,
    ) -> Result<Box<dyn Endpoint>>;
}

/// A registered local identity.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Handle id used in events.
    fn id(&self) -> EndpointId;

    /// Identifier this endpoint registered under.
    fn identifier(&self) -> &str;

    /// Invite `remote` to a media session carrying `stream`.
    async fn call_media(
        &self,
        remote: &str,
        stream: &MediaStream,
        metadata: Option<InvitationMetadata>,
    ) -> Result<Box<dyn MediaChannel>>;

    /// Open a data conduit to `remote`.
    async fn open_conduit(
        &self,
        remote: &str,
        metadata: Option<InvitationMetadata>,
    ) -> Result<Box<dyn Conduit>>;

    /// Unregister and release everything the endpoint holds.
    fn dispose(&self);
}

/// A media invitation or established media channel.
#[async_trait]
pub trait MediaChannel: Send + Sync {
    /// Handle id used in events.
    fn id(&self) -> ChannelId;

    /// The peer on the other side.
    fn remote_identifier(&self) -> &str;

    /// Metadata the caller attached.
    fn metadata(&self) -> Option<&InvitationMetadata>;

    /// Accept an incoming invitation, sending `stream` back.
    async fn answer(&self, stream: &MediaStream) -> Result<()>;

    /// Swap the outgoing stream without renegotiating the session.
    async fn replace_stream(&self, stream: &MediaStream) -> Result<()>;

    /// Hang up.
    fn close(&self);
}

/// Ordered, reliable message channel.
#[async_trait]
pub trait Conduit: Send + Sync {
    /// Handle id used in events.
    fn id(&self) -> ChannelId;

    /// The peer on the other side.
    fn remote_identifier(&self) -> &str;

    /// Metadata the opener attached.
    fn metadata(&self) -> Option<&InvitationMetadata>;

    /// Whether the conduit currently accepts traffic.
    fn is_open(&self) -> bool;

    /// Send one message.
    async fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Close the conduit.
    fn close(&self);
}
