//! Local capabilities the engine calls into.
//!
//! Input injection, clipboard access, file I/O, capture-source switching and
//! broker liveness queries are provided by the embedding application. The
//! engine only sees these traits; failures are logged at the call site and
//! never change protocol state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{InputEvent, SourceBounds};
use crate::transport::MediaStream;

/// A remote-input event resolved against the active capture source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputCommand {
    /// The event to replay
    #[serde(flatten)]
    pub event: InputEvent,
    /// Bounds of the streamed source, used to map normalised coordinates
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "activeSourceBounds")]
    pub source_bounds: Option<SourceBounds>,
}

/// Replays remote input on the host.
#[async_trait]
pub trait InputInjector: Send + Sync {
    /// Execute one input event.
    async fn execute(&self, command: InputCommand) -> Result<()>;

    /// Release every pressed key and button.
    async fn reset(&self) -> Result<()>;
}

/// Text clipboard access.
#[async_trait]
pub trait Clipboard: Send + Sync {
    /// Read the clipboard text.
    async fn read(&self) -> Result<String>;

    /// Replace the clipboard text.
    async fn write(&self, text: &str) -> Result<()>;
}

/// Drop position hint for a received file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropHint {
    /// Horizontal position
    pub x: f64,
    /// Vertical position
    pub y: f64,
}

impl DropHint {
    /// Build a hint when both coordinates are present.
    #[must_use]
    pub fn from_parts(x: Option<f64>, y: Option<f64>) -> Option<Self> {
        x.zip(y).map(|(x, y)| Self { x, y })
    }
}

/// Name and size of a local file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescription {
    /// File name without directories
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// File reads for outbound transfers and staging for inbound ones.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Read up to `size` bytes at `offset`.
    async fn read_chunk(&self, path: &Path, offset: u64, size: usize) -> Result<Vec<u8>>;

    /// Create an empty staging sink for `transfer_id`, replacing any left over.
    async fn begin(&self, transfer_id: &str) -> Result<()>;

    /// Append bytes to the staging sink of `transfer_id`.
    async fn persist_chunk(&self, transfer_id: &str, bytes: &[u8]) -> Result<()>;

    /// Move the staged bytes to their final destination.
    async fn finalize(&self, transfer_id: &str, name: &str, hint: Option<DropHint>)
        -> Result<PathBuf>;

    /// Drop whatever was staged for `transfer_id`.
    async fn discard(&self, transfer_id: &str) -> Result<()>;

    /// Name and size of a local file.
    async fn describe(&self, path: &Path) -> Result<FileDescription>;
}

/// Switches the host's capture source.
#[async_trait]
pub trait SourceSwitcher: Send + Sync {
    /// Start capturing `source_id` and return the new local stream.
    async fn select(&self, source_id: &str) -> Result<MediaStream>;
}

/// Bulk liveness lookup against the broker.
#[async_trait]
pub trait LivenessDiscovery: Send + Sync {
    /// Identifiers the broker reports online, or `None` when the query is
    /// not possible and per-identifier probing should be used instead.
    async fn query_online(&self, url: &str) -> Option<Vec<String>>;
}

/// Stand-in for a capability the embedding application does not provide.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl Unsupported {
    fn fail<T>(capability: &'static str) -> Result<T> {
        Err(Error::Capability {
            capability,
            reason: "not available on this platform".to_string(),
        })
    }
}

#[async_trait]
impl InputInjector for Unsupported {
    async fn execute(&self, _command: InputCommand) -> Result<()> {
        Self::fail("input")
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Clipboard for Unsupported {
    async fn read(&self) -> Result<String> {
        Self::fail("clipboard")
    }

    async fn write(&self, _text: &str) -> Result<()> {
        Self::fail("clipboard")
    }
}

#[async_trait]
impl SourceSwitcher for Unsupported {
    async fn select(&self, _source_id: &str) -> Result<MediaStream> {
        Self::fail("sources")
    }
}

#[async_trait]
impl LivenessDiscovery for Unsupported {
    async fn query_online(&self, _url: &str) -> Option<Vec<String>> {
        None
    }
}

/// The capability set handed to the engine.
#[derive(Clone)]
pub struct Capabilities {
    /// Input injection
    pub input: Arc<dyn InputInjector>,
    /// Clipboard
    pub clipboard: Arc<dyn Clipboard>,
    /// File I/O
    pub files: Arc<dyn FileStore>,
    /// Capture source switching
    pub sources: Arc<dyn SourceSwitcher>,
}

impl Capabilities {
    /// Capabilities with only file I/O available.
    #[must_use]
    pub fn headless(files: Arc<dyn FileStore>) -> Self {
        Self {
            input: Arc::new(Unsupported),
            clipboard: Arc::new(Unsupported),
            files,
            sources: Arc::new(Unsupported),
        }
    }

    /// Replace the input injector.
    #[must_use]
    pub fn with_input(mut self, input: Arc<dyn InputInjector>) -> Self {
        self.input = input;
        self
    }

    /// Replace the clipboard.
    #[must_use]
    pub fn with_clipboard(mut self, clipboard: Arc<dyn Clipboard>) -> Self {
        self.clipboard = clipboard;
        self
    }

    /// Replace the source switcher.
    #[must_use]
    pub fn with_sources(mut self, sources: Arc<dyn SourceSwitcher>) -> Self {
        self.sources = sources;
        self
    }
}
