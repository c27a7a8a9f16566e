//! # DeskBridge Core Library
//!
//! `deskbridge-core` is the session engine behind DeskBridge, a peer-to-peer
//! remote desktop. It sits between a signaling broker transport and the
//! desktop-facing capabilities (screen capture, input injection, clipboard,
//! file storage) and owns everything in between.
//!
//! ## Features
//!
//! - **Two roles per process**: one shared inbound endpoint for hosting,
//!   one scoped endpoint per outbound connection
//! - **Order-independent setup**: media and data channels may open in any
//!   order and either one may fail first
//! - **Credential gate**: session and unattended secrets, passwordless
//!   approval, rate-limited attempts, handover tokens
//! - **Data-channel protocol**: input, clipboard, chat, monitor switching,
//!   chunked file transfer, heartbeats
//! - **Status probing**: bulk peer-list queries with per-identifier fallback
//!
//! ## Modules
//!
//! - [`auth`] - Credential verification and attempt limits
//! - [`capability`] - Traits for desktop integrations
//! - [`config`] - Configuration management
//! - [`contacts`] - Address book and recent identifiers
//! - [`engine`] - The session engine and its handle
//! - [`identity`] - Local identifier resolution
//! - [`protocol`] - Data-channel message codec
//! - [`session`] - Session records and the registry
//! - [`status`] - Liveness of remote identifiers
//! - [`transfer`] - Chunked file transfer
//! - [`transport`] - Broker transport abstraction
//!
//! ## Example
//!
//! ```rust,ignore
//! use deskbridge_core::{Capabilities, Config, ConnectOptions, SessionEngine};
//!
//! let (engine, handle) = SessionEngine::builder(Config::load()?, transport, Capabilities::headless(files))
//!     .build();
//! tokio::spawn(engine.run());
//!
//! let session = handle.connect_to("123456789", ConnectOptions::with_credential("482913")).await?;
//! handle.send_chat(session, "hello").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_self)]

pub mod auth;
pub mod capability;
#[cfg(feature = "system-clipboard")]
pub mod clipboard;
pub mod config;
pub mod contacts;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod file;
pub mod handover;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transfer;
pub mod transport;

pub use capability::Capabilities;
pub use config::Config;
pub use engine::{ConnectOptions, EngineHandle, LocalMedia, SessionEngine, SessionNotice};
pub use error::{Error, Result};
pub use session::{SessionId, SessionSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default signaling broker port
pub const DEFAULT_BROKER_PORT: u16 = 9000;

/// Default signaling broker mount path
pub const DEFAULT_BROKER_PATH: &str = "/peerjs";

/// Default window for an outbound attempt to open a channel
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default length of the recent-identifiers list
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Default file chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks sent before yielding to other engine work
pub const DEFAULT_YIELD_EVERY: usize = 10;
