//! Error types for DeskBridge.
//!
//! This module provides a unified error type for all DeskBridge operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

use crate::session::SessionId;

/// A specialized `Result` type for DeskBridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for DeskBridge.
#[derive(Error, Debug)]
pub enum Error {
    /// An outgoing session to this identifier already exists (E001)
    #[error("an outgoing session to '{0}' already exists")]
    DuplicateSession(String),

    /// Remote identifier does not exist or is offline (E002)
    #[error("remote identifier '{0}' is unavailable or offline")]
    PeerUnavailable(String),

    /// Neither channel opened within the connect window (E003)
    #[error("connection to '{remote}' timed out after {secs} seconds")]
    ConnectTimeout {
        /// Remote identifier
        remote: String,
        /// Timeout window in seconds
        secs: u64,
    },

    /// Credential was rejected by the remote host (E004)
    #[error("credential rejected by remote host")]
    AuthenticationRejected,

    /// Too many failed credential attempts (E005)
    #[error("too many failed attempts, locked for {0} seconds")]
    AuthLocked(u64),

    /// No session with this id
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// Session has no open data conduit or endpoint yet
    #[error("session {session} is not ready: {reason}")]
    SessionNotReady {
        /// Session id
        session: SessionId,
        /// What is missing
        reason: String,
    },

    /// Operation is not valid for this session's direction
    #[error("operation not allowed on {direction} session {session}")]
    WrongDirection {
        /// Session id
        session: SessionId,
        /// Direction of the session
        direction: String,
    },

    /// Transport capability failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A local capability (clipboard, input, sources) failed
    #[error("{capability} capability failed: {reason}")]
    Capability {
        /// Capability name
        capability: &'static str,
        /// Failure reason
        reason: String,
    },

    /// Clipboard is empty
    #[error("clipboard is empty")]
    ClipboardEmpty,

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Transfer id is not known to this process
    #[error("unknown transfer '{0}'")]
    UnknownTransfer(String),

    /// Chunk arrived out of sequence
    #[error("chunk {got} of transfer '{transfer}' arrived out of order, expected {expected}")]
    ChunkOutOfOrder {
        /// Transfer id
        transfer: String,
        /// Expected sequence number
        expected: u64,
        /// Received sequence number
        got: u64,
    },

    /// More bytes arrived than the transfer declared
    #[error("transfer '{transfer}' exceeded declared size of {size} bytes")]
    TransferOverflow {
        /// Transfer id
        transfer: String,
        /// Declared size
        size: u64,
    },

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Identity could not be resolved or persisted
    #[error("identity error: {0}")]
    IdentityError(String),

    /// Address book error
    #[error("address book error: {0}")]
    AddressBookError(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Engine mailbox is gone
    #[error("session engine has shut down")]
    EngineClosed,

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::DuplicateSession(_) => Some("E001"),
            Self::PeerUnavailable(_) => Some("E002"),
            Self::ConnectTimeout { .. } => Some("E003"),
            Self::AuthenticationRejected => Some("E004"),
            Self::AuthLocked(_) => Some("E005"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationRejected
                | Self::AuthLocked(_)
                | Self::Transport(_)
                | Self::SessionNotReady { .. }
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::PeerUnavailable(_) | Self::ConnectTimeout { .. } => Some(
                "Check that the remote device is running and online.\n\
                 You can check its status with: deskbridge status <id>",
            ),
            Self::AuthenticationRejected => {
                Some("Verify the session password shown on the remote device and try again.")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
