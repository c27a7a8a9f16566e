//! Data-channel wire protocol.
//!
//! Every session multiplexes its application traffic over one ordered,
//! reliable data conduit. Messages are JSON objects discriminated by a
//! `type` field:
//!
//! ```text
//! {"type":"AUTH","credential":"482913"}
//! {"type":"AUTH_STATUS","status":"OK"}
//! {"type":"FILE_CHUNK","transferId":"tf-1700000000000-k2j4h5g6f","chunk":"aGVsbG8=","seq":0}
//! {"type":"mousemove","x":0.42,"y":0.17}
//! ```
//!
//! Field names are camelCase on the wire. File chunks travel as base64
//! strings. Unknown `type` values decode to [`Message::Unknown`] so the
//! router can drop them without an error path.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Verdict carried by `AUTH_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthVerdict {
    /// Credential accepted
    Ok,
    /// Credential rejected
    Fail,
}

/// Screen rectangle of a capture source in desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBounds {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// A capturable screen or window advertised by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopSource {
    /// Source identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Position on the host desktop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<SourceBounds>,
    /// Preview image (data URL)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Mouse button named by input messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    /// Primary button
    Left,
    /// Secondary button
    Right,
    /// Wheel button
    Middle,
}

/// Every message exchanged over the data conduit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Message {
    /// Credential offered by the client
    #[serde(rename = "AUTH")]
    Auth {
        /// Candidate secret
        #[serde(alias = "password")]
        credential: String,
    },
    /// Host verdict on a credential
    #[serde(rename = "AUTH_STATUS")]
    AuthStatus {
        /// Accepted or rejected
        status: AuthVerdict,
    },
    /// Clipboard text pushed to the peer
    #[serde(rename = "CLIPBOARD")]
    Clipboard {
        /// Clipboard contents
        text: String,
    },
    /// Opens an inbound file transfer
    #[serde(rename = "FILE_START")]
    FileStart {
        /// Transfer id, unique per process
        transfer_id: String,
        /// File name
        name: String,
        /// Declared size in bytes
        size: u64,
        /// Horizontal drop position hint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drop_x: Option<f64>,
        /// Vertical drop position hint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drop_y: Option<f64>,
    },
    /// One slice of file data
    #[serde(rename = "FILE_CHUNK")]
    FileChunk {
        /// Transfer id
        transfer_id: String,
        /// Chunk bytes
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
        /// Zero-based chunk sequence number
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    /// Closes a file transfer
    #[serde(rename = "FILE_END")]
    FileEnd {
        /// Transfer id
        transfer_id: String,
    },
    /// Host's capture sources
    #[serde(rename = "SOURCES_LIST")]
    SourcesList {
        /// Available sources
        sources: Vec<DesktopSource>,
        /// Source currently streamed
        #[serde(default)]
        active_source_id: Option<String>,
    },
    /// Client asks the host to stream another source
    #[serde(rename = "SWITCH_MONITOR")]
    SwitchMonitor {
        /// Requested source
        source_id: String,
    },
    /// Host confirms a source switch
    #[serde(rename = "MONITOR_CHANGED")]
    MonitorChanged {
        /// Source now streamed
        active_source_id: String,
    },
    /// Pointer moved (coordinates normalised to 0..1)
    #[serde(rename = "mousemove")]
    MouseMove {
        /// Horizontal position
        x: f64,
        /// Vertical position
        y: f64,
    },
    /// Button pressed
    #[serde(rename = "mousedown")]
    MouseDown {
        /// Button
        button: MouseButton,
        /// Horizontal position
        x: f64,
        /// Vertical position
        y: f64,
    },
    /// Button released
    #[serde(rename = "mouseup")]
    MouseUp {
        /// Button
        button: MouseButton,
        /// Horizontal position
        x: f64,
        /// Vertical position
        y: f64,
    },
    /// Wheel scrolled
    #[serde(rename = "mousewheel")]
    MouseWheel {
        /// Horizontal delta
        delta_x: f64,
        /// Vertical delta
        delta_y: f64,
    },
    /// Key pressed
    #[serde(rename = "keydown")]
    KeyDown {
        /// Key name
        key: String,
    },
    /// Key released
    #[serde(rename = "keyup")]
    KeyUp {
        /// Key name
        key: String,
    },
    /// Host declined the connection
    #[serde(rename = "CALL_REJECTED")]
    CallRejected,
    /// Client abandoned the connection attempt
    #[serde(rename = "CALL_CANCELLED")]
    CallCancelled,
    /// Token the peer will present from a new endpoint
    #[serde(rename = "HANDOVER_PREPARATION")]
    HandoverPreparation {
        /// Handover token
        token: String,
    },
    /// Token presented after reconnecting
    #[serde(rename = "HANDOVER_VALIDATION")]
    HandoverValidation {
        /// Handover token
        token: String,
    },
    /// Chat line
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage {
        /// Message text
        text: String,
        /// Unix timestamp in milliseconds
        timestamp: i64,
    },
    /// Heartbeat request
    #[serde(rename = "PING")]
    Ping,
    /// Heartbeat reply
    #[serde(rename = "PONG")]
    Pong,
    /// Any type this build does not know
    #[serde(other)]
    Unknown,
}

/// A remote-input event, as handed to the input injection capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum InputEvent {
    /// Pointer moved
    MouseMove {
        /// Horizontal position (0..1)
        x: f64,
        /// Vertical position (0..1)
        y: f64,
    },
    /// Button pressed
    MouseDown {
        /// Button
        button: MouseButton,
        /// Horizontal position (0..1)
        x: f64,
        /// Vertical position (0..1)
        y: f64,
    },
    /// Button released
    MouseUp {
        /// Button
        button: MouseButton,
        /// Horizontal position (0..1)
        x: f64,
        /// Vertical position (0..1)
        y: f64,
    },
    /// Wheel scrolled
    MouseWheel {
        /// Horizontal delta
        delta_x: f64,
        /// Vertical delta
        delta_y: f64,
    },
    /// Key pressed
    KeyDown {
        /// Key name
        key: String,
    },
    /// Key released
    KeyUp {
        /// Key name
        key: String,
    },
}

impl Message {
    /// Wire name of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "AUTH",
            Self::AuthStatus { .. } => "AUTH_STATUS",
            Self::Clipboard { .. } => "CLIPBOARD",
            Self::FileStart { .. } => "FILE_START",
            Self::FileChunk { .. } => "FILE_CHUNK",
            Self::FileEnd { .. } => "FILE_END",
            Self::SourcesList { .. } => "SOURCES_LIST",
            Self::SwitchMonitor { .. } => "SWITCH_MONITOR",
            Self::MonitorChanged { .. } => "MONITOR_CHANGED",
            Self::MouseMove { .. } => "mousemove",
            Self::MouseDown { .. } => "mousedown",
            Self::MouseUp { .. } => "mouseup",
            Self::MouseWheel { .. } => "mousewheel",
            Self::KeyDown { .. } => "keydown",
            Self::KeyUp { .. } => "keyup",
            Self::CallRejected => "CALL_REJECTED",
            Self::CallCancelled => "CALL_CANCELLED",
            Self::HandoverPreparation { .. } => "HANDOVER_PREPARATION",
            Self::HandoverValidation { .. } => "HANDOVER_VALIDATION",
            Self::ChatMessage { .. } => "CHAT_MESSAGE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Unknown => "unknown",
        }
    }

    /// Split off the remote-input events.
    ///
    /// Returns the message unchanged when it is not an input event.
    pub fn into_input(self) -> std::result::Result<InputEvent, Self> {
        Ok(match self {
            Self::MouseMove { x, y } => InputEvent::MouseMove { x, y },
            Self::MouseDown { button, x, y } => InputEvent::MouseDown { button, x, y },
            Self::MouseUp { button, x, y } => InputEvent::MouseUp { button, x, y },
            Self::MouseWheel { delta_x, delta_y } => InputEvent::MouseWheel { delta_x, delta_y },
            Self::KeyDown { key } => InputEvent::KeyDown { key },
            Self::KeyUp { key } => InputEvent::KeyUp { key },
            other => return Err(other),
        })
    }
}

impl From<InputEvent> for Message {
    fn from(event: InputEvent) -> Self {
        match event {
            InputEvent::MouseMove { x, y } => Self::MouseMove { x, y },
            InputEvent::MouseDown { button, x, y } => Self::MouseDown { button, x, y },
            InputEvent::MouseUp { button, x, y } => Self::MouseUp { button, x, y },
            InputEvent::MouseWheel { delta_x, delta_y } => Self::MouseWheel { delta_x, delta_y },
            InputEvent::KeyDown { key } => Self::KeyDown { key },
            InputEvent::KeyUp { key } => Self::KeyUp { key },
        }
    }
}

/// Encode a message for the conduit.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a conduit payload.
///
/// Unknown message types decode to [`Message::Unknown`]; malformed JSON or a
/// known type with missing fields is an error.
///
/// # Errors
///
/// Returns an error if the payload is not a valid message.
pub fn decode(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload).map_err(|e| Error::ProtocolError(e.to_string()))
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
