//! Common test utilities for `DeskBridge` integration tests.
//!
//! [`MockTransport`] stands in for the broker transport: every endpoint,
//! media channel and conduit it hands out is recorded so tests can inspect
//! what the engine did and push transport events back at it.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use deskbridge_core::capability::{
    Capabilities, Clipboard, InputCommand, InputInjector, SourceSwitcher,
};
use deskbridge_core::config::Config;
use deskbridge_core::contacts::AddressBook;
use deskbridge_core::file::DiskFileStore;
use deskbridge_core::identity::FixedIdentity;
use deskbridge_core::protocol::{self, DesktopSource, Message, SourceBounds};
use deskbridge_core::transport::{
    ChannelId, Conduit, Endpoint, EndpointConfig, EndpointId, EventSink, IceState,
    InvitationMetadata, MediaChannel, MediaStream, Transport, TransportErrorKind, TransportEvent,
};
use deskbridge_core::{
    EngineHandle, Error, Result, SessionEngine, SessionId, SessionNotice, SessionSnapshot,
};

/// Identifier the engine under test registers as host.
pub const HOST_ID: &str = "100000001";

/// How long a test waits for a notice before failing.
pub const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A data conduit handed out by the mock transport.
pub struct ConduitRecord {
    pub id: ChannelId,
    pub remote: String,
    pub metadata: Option<InvitationMetadata>,
    sink: EventSink,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ConduitRecord {
    fn new(remote: &str, metadata: Option<InvitationMetadata>, sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            remote: remote.to_string(),
            metadata,
            sink,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Mark the conduit open and tell the engine.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.sink.emit(TransportEvent::ConduitOpen { channel: self.id });
    }

    /// Deliver a message from the remote side.
    pub fn deliver(&self, message: &Message) {
        self.sink.emit(TransportEvent::ConduitData {
            channel: self.id,
            payload: protocol::encode(message).expect("encode"),
        });
    }

    /// Deliver raw bytes from the remote side.
    pub fn deliver_raw(&self, payload: &[u8]) {
        self.sink.emit(TransportEvent::ConduitData {
            channel: self.id,
            payload: payload.to_vec(),
        });
    }

    /// The remote side hung up.
    pub fn hang_up(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.sink.emit(TransportEvent::ConduitClosed { channel: self.id });
    }

    /// Messages the engine sent, decoded.
    pub fn sent(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|p| protocol::decode(p).expect("decode"))
            .collect()
    }

    /// Sent messages other than heartbeats.
    pub fn sent_without_heartbeats(&self) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|m| !matches!(m, Message::Ping | Message::Pong))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockConduit(Arc<ConduitRecord>);

#[async_trait]
impl Conduit for MockConduit {
    fn id(&self) -> ChannelId {
        self.0.id
    }

    fn remote_identifier(&self) -> &str {
        &self.0.remote
    }

    fn metadata(&self) -> Option<&InvitationMetadata> {
        self.0.metadata.as_ref()
    }

    fn is_open(&self) -> bool {
        self.0.open.load(Ordering::SeqCst) && !self.0.is_closed()
    }

    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        if self.0.is_closed() {
            return Err(Error::Transport("conduit closed".to_string()));
        }
        self.0.sent.lock().unwrap().push(payload);
        Ok(())
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

/// A media channel handed out by the mock transport.
pub struct MediaRecord {
    pub id: ChannelId,
    pub remote: String,
    pub metadata: Option<InvitationMetadata>,
    /// Stream the engine offered when it placed the call
    pub offered: Option<MediaStream>,
    sink: EventSink,
    answered: Mutex<Option<MediaStream>>,
    replaced: Mutex<Vec<MediaStream>>,
    closed: AtomicBool,
}

impl MediaRecord {
    fn new(
        remote: &str,
        metadata: Option<InvitationMetadata>,
        offered: Option<MediaStream>,
        sink: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            remote: remote.to_string(),
            metadata,
            offered,
            sink,
            answered: Mutex::new(None),
            replaced: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Negotiation finished.
    pub fn open(&self) {
        self.sink.emit(TransportEvent::MediaOpen { channel: self.id });
    }

    /// The remote stream arrived.
    pub fn stream(&self, id: &str) {
        self.sink.emit(TransportEvent::MediaStream {
            channel: self.id,
            stream: MediaStream::new(id),
        });
    }

    /// ICE connectivity changed.
    pub fn connectivity(&self, state: IceState) {
        self.sink.emit(TransportEvent::Connectivity {
            channel: self.id,
            state,
        });
    }

    pub fn answered(&self) -> Option<MediaStream> {
        self.answered.lock().unwrap().clone()
    }

    pub fn replaced(&self) -> Vec<MediaStream> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockMedia(Arc<MediaRecord>);

#[async_trait]
impl MediaChannel for MockMedia {
    fn id(&self) -> ChannelId {
        self.0.id
    }

    fn remote_identifier(&self) -> &str {
        &self.0.remote
    }

    fn metadata(&self) -> Option<&InvitationMetadata> {
        self.0.metadata.as_ref()
    }

    async fn answer(&self, stream: &MediaStream) -> Result<()> {
        *self.0.answered.lock().unwrap() = Some(stream.clone());
        Ok(())
    }

    async fn replace_stream(&self, stream: &MediaStream) -> Result<()> {
        self.0.replaced.lock().unwrap().push(stream.clone());
        Ok(())
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

/// An endpoint handed out by the mock transport.
pub struct EndpointRecord {
    pub id: EndpointId,
    pub identifier: String,
    sink: EventSink,
    disposed: AtomicUsize,
    medias: Mutex<Vec<Arc<MediaRecord>>>,
    conduits: Mutex<Vec<Arc<ConduitRecord>>>,
    online: Option<HashSet<String>>,
}

impl EndpointRecord {
    /// The broker confirmed the registration.
    pub fn ready(&self) {
        self.sink.emit(TransportEvent::Ready {
            endpoint: self.id,
            identifier: self.identifier.clone(),
        });
    }

    /// Endpoint-level error.
    pub fn error(&self, kind: TransportErrorKind, message: &str) {
        self.sink.emit(TransportEvent::Error {
            endpoint: self.id,
            kind,
            message: message.to_string(),
        });
    }

    /// A remote peer opens a conduit to this endpoint.
    pub fn incoming_conduit(
        &self,
        remote: &str,
        metadata: Option<InvitationMetadata>,
    ) -> Arc<ConduitRecord> {
        let record = ConduitRecord::new(remote, metadata, self.sink.clone());
        self.sink.emit(TransportEvent::IncomingConduit {
            endpoint: self.id,
            conduit: Box::new(MockConduit(Arc::clone(&record))),
        });
        record
    }

    /// A remote peer invites this endpoint to a media session.
    pub fn incoming_media(
        &self,
        remote: &str,
        metadata: Option<InvitationMetadata>,
    ) -> Arc<MediaRecord> {
        let record = MediaRecord::new(remote, metadata, None, self.sink.clone());
        self.sink.emit(TransportEvent::IncomingMedia {
            endpoint: self.id,
            channel: Box::new(MockMedia(Arc::clone(&record))),
        });
        record
    }

    /// Media channels the engine opened from this endpoint.
    pub fn medias(&self) -> Vec<Arc<MediaRecord>> {
        self.medias.lock().unwrap().clone()
    }

    /// Conduits the engine opened from this endpoint.
    pub fn conduits(&self) -> Vec<Arc<ConduitRecord>> {
        self.conduits.lock().unwrap().clone()
    }

    /// The single conduit the engine opened from this endpoint.
    pub fn conduit(&self) -> Arc<ConduitRecord> {
        let conduits = self.conduits();
        assert_eq!(conduits.len(), 1, "expected exactly one conduit");
        Arc::clone(&conduits[0])
    }

    /// The single media channel the engine opened from this endpoint.
    pub fn media(&self) -> Arc<MediaRecord> {
        let medias = self.medias();
        assert_eq!(medias.len(), 1, "expected exactly one media channel");
        Arc::clone(&medias[0])
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

struct MockEndpoint(Arc<EndpointRecord>);

#[async_trait]
impl Endpoint for MockEndpoint {
    fn id(&self) -> EndpointId {
        self.0.id
    }

    fn identifier(&self) -> &str {
        &self.0.identifier
    }

    async fn call_media(
        &self,
        remote: &str,
        stream: &MediaStream,
        metadata: Option<InvitationMetadata>,
    ) -> Result<Box<dyn MediaChannel>> {
        let record = MediaRecord::new(remote, metadata, Some(stream.clone()), self.0.sink.clone());
        self.0.medias.lock().unwrap().push(Arc::clone(&record));
        Ok(Box::new(MockMedia(record)))
    }

    async fn open_conduit(
        &self,
        remote: &str,
        metadata: Option<InvitationMetadata>,
    ) -> Result<Box<dyn Conduit>> {
        let record = ConduitRecord::new(remote, metadata, self.0.sink.clone());
        self.0.conduits.lock().unwrap().push(Arc::clone(&record));

        // Auto-answering peers resolve probes without test involvement.
        if let Some(online) = &self.0.online {
            if online.contains(remote) {
                record.open();
            } else {
                self.0.error(TransportErrorKind::PeerUnavailable, "could not connect to peer");
            }
        }
        Ok(Box::new(MockConduit(record)))
    }

    fn dispose(&self) {
        self.0.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every endpoint the engine opens.
#[derive(Default)]
pub struct MockTransport {
    endpoints: Mutex<Vec<Arc<EndpointRecord>>>,
    fail_open: AtomicBool,
    /// When set, endpoints report ready on open and conduits resolve on
    /// their own: online identifiers open, others fail as unavailable
    online: Mutex<Option<HashSet<String>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose peers answer by themselves.
    pub fn auto_answering(online: &[&str]) -> Arc<Self> {
        let transport = Self::default();
        *transport.online.lock().unwrap() =
            Some(online.iter().map(|s| (*s).to_string()).collect());
        Arc::new(transport)
    }

    /// Refuse every subsequent `open`.
    pub fn fail_opens(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn endpoints(&self) -> Vec<Arc<EndpointRecord>> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Most recently opened endpoint.
    pub fn last(&self) -> Arc<EndpointRecord> {
        Arc::clone(self.endpoints.lock().unwrap().last().expect("no endpoint opened"))
    }

    /// The endpoint registered under `identifier`.
    pub fn named(&self, identifier: &str) -> Arc<EndpointRecord> {
        self.endpoints()
            .into_iter()
            .find(|e| e.identifier == identifier)
            .expect("no endpoint with that identifier")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        identifier: &str,
        _config: &EndpointConfig,
        events: EventSink,
    ) -> Result<Box<dyn Endpoint>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Transport("broker unreachable".to_string()));
        }
        let online = self.online.lock().unwrap().clone();
        let record = Arc::new(EndpointRecord {
            id: EndpointId::next(),
            identifier: identifier.to_string(),
            sink: events,
            disposed: AtomicUsize::new(0),
            medias: Mutex::new(Vec::new()),
            conduits: Mutex::new(Vec::new()),
            online: online.clone(),
        });
        if online.is_some() {
            record.ready();
        }
        self.endpoints.lock().unwrap().push(Arc::clone(&record));
        Ok(Box::new(MockEndpoint(record)))
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Records injected input.
#[derive(Default)]
pub struct RecordingInput {
    commands: Mutex<Vec<InputCommand>>,
    resets: AtomicUsize,
}

impl RecordingInput {
    pub fn commands(&self) -> Vec<InputCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InputInjector for RecordingInput {
    async fn execute(&self, command: InputCommand) -> Result<()> {
        self.commands.lock().unwrap().push(command);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Clipboard held in memory.
#[derive(Default)]
pub struct MemoryClipboard {
    text: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn text(&self) -> Option<String> {
        self.text.lock().unwrap().clone()
    }

    /// Simulate the local user copying `text`.
    pub fn copy(&self, text: &str) {
        *self.text.lock().unwrap() = Some(text.to_string());
    }
}

#[async_trait]
impl Clipboard for MemoryClipboard {
    async fn read(&self) -> Result<String> {
        self.text().ok_or(Error::ClipboardEmpty)
    }

    async fn write(&self, text: &str) -> Result<()> {
        *self.text.lock().unwrap() = Some(text.to_string());
        Ok(())
    }
}

/// Switches to any source and names the stream after it.
#[derive(Default)]
pub struct ScreenSources;

#[async_trait]
impl SourceSwitcher for ScreenSources {
    async fn select(&self, source_id: &str) -> Result<MediaStream> {
        if source_id.is_empty() {
            return Err(Error::Capability {
                capability: "sources",
                reason: "no such source".to_string(),
            });
        }
        Ok(MediaStream::new(format!("capture-{source_id}")).from_source(source_id))
    }
}

/// Two side-by-side screens.
pub fn two_screens() -> Vec<DesktopSource> {
    vec![
        DesktopSource {
            id: "screen:0".to_string(),
            name: "Built-in".to_string(),
            bounds: Some(SourceBounds {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
            }),
            thumbnail: None,
        },
        DesktopSource {
            id: "screen:1".to_string(),
            name: "External".to_string(),
            bounds: Some(SourceBounds {
                x: 1920,
                y: 0,
                width: 2560,
                height: 1440,
            }),
            thumbnail: None,
        },
    ]
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// Configuration with timers long enough to stay out of the way.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.heartbeat_interval = Duration::from_secs(3600);
    config.session.connect_timeout = Duration::from_secs(30);
    config.transfer.chunk_size = 4;
    config.transfer.yield_every = 2;
    config.session.clipboard_sync = false;
    config
}

/// A running engine wired to mocks.
pub struct Harness {
    pub handle: EngineHandle,
    pub transport: Arc<MockTransport>,
    pub input: Arc<RecordingInput>,
    pub clipboard: Arc<MemoryClipboard>,
    pub downloads: PathBuf,
    pub notices: broadcast::Receiver<SessionNotice>,
    dir: TempDir,
}

impl Harness {
    /// Start an engine whose session secret is `secret` (`None` for
    /// passwordless hosting).
    pub fn start(config: Config, secret: Option<&str>) -> Self {
        Self::start_with(config, secret, MockTransport::new())
    }

    pub fn start_with(config: Config, secret: Option<&str>, transport: Arc<MockTransport>) -> Self {
        let dir = create_temp_dir();
        let downloads = dir.path().join("downloads");
        let files = DiskFileStore::new(downloads.clone()).with_staging_dir(dir.path().join("staging"));

        let input = Arc::new(RecordingInput::default());
        let clipboard = Arc::new(MemoryClipboard::default());
        let capabilities = Capabilities::headless(Arc::new(files))
            .with_input(Arc::clone(&input) as Arc<dyn InputInjector>)
            .with_clipboard(Arc::clone(&clipboard) as Arc<dyn Clipboard>)
            .with_sources(Arc::new(ScreenSources));

        let (engine, handle) = SessionEngine::builder(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            capabilities,
        )
        .identity(Arc::new(FixedIdentity(HOST_ID.to_string())))
        .contacts(AddressBook::in_memory())
        .session_secret(secret.map(str::to_string))
        .build();
        let notices = handle.subscribe();
        tokio::spawn(engine.run());

        Self {
            handle,
            transport,
            input,
            clipboard,
            downloads,
            notices,
            dir,
        }
    }

    /// Write a file the engine can send.
    pub fn source_file(&self, name: &str, content: &[u8]) -> PathBuf {
        create_test_file(self.dir.path(), name, content)
    }

    /// Wait until every queued transport event is handled.
    pub async fn settle(&self) -> Vec<SessionSnapshot> {
        self.handle.sessions().await.expect("engine running")
    }

    pub async fn snapshot(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.handle.snapshot(id).await.expect("engine running")
    }

    /// Wait for the first notice matching `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&SessionNotice) -> bool) -> SessionNotice {
        let notices = &mut self.notices;
        tokio::time::timeout(NOTICE_TIMEOUT, async move {
            loop {
                match notices.recv().await {
                    Ok(notice) if pred(&notice) => return notice,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("engine stopped"),
                }
            }
        })
        .await
        .expect("notice did not arrive in time")
    }

    /// Notices already published, without waiting.
    pub fn drain(&mut self) -> Vec<SessionNotice> {
        let mut out = Vec::new();
        loop {
            match self.notices.try_recv() {
                Ok(notice) => out.push(notice),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return out,
            }
        }
    }

    /// Start hosting and return the shared endpoint.
    pub async fn host(&self) -> Arc<EndpointRecord> {
        let identifier = self.handle.listen().await.expect("listen");
        assert_eq!(identifier, HOST_ID);
        let endpoint = self.transport.named(HOST_ID);
        endpoint.ready();
        endpoint
    }

    /// Start an outgoing session and let its scoped endpoint register.
    pub async fn dial(
        &self,
        remote: &str,
        options: deskbridge_core::ConnectOptions,
    ) -> (SessionId, Arc<EndpointRecord>) {
        let id = self.handle.connect_to(remote, options).await.expect("connect");
        let endpoint = self.transport.last();
        endpoint.ready();
        self.settle().await;
        (id, endpoint)
    }

    /// An outgoing session the host has already accepted.
    pub async fn authenticated_client(&self, remote: &str) -> (SessionId, Arc<ConduitRecord>) {
        let (id, endpoint) = self
            .dial(remote, deskbridge_core::ConnectOptions::with_credential("000000"))
            .await;
        let conduit = endpoint.conduit();
        conduit.open();
        conduit.deliver(&Message::AuthStatus {
            status: protocol::AuthVerdict::Ok,
        });
        self.settle().await;
        (id, conduit)
    }

    /// An incoming session on a passwordless host with an open conduit.
    pub async fn accepted_guest(
        &self,
        host: &EndpointRecord,
        remote: &str,
    ) -> (SessionId, Arc<ConduitRecord>) {
        let conduit = host.incoming_conduit(remote, None);
        conduit.open();
        let sessions = self.settle().await;
        let session = sessions
            .iter()
            .find(|s| s.remote_identifier == remote)
            .expect("incoming session");
        assert!(session.is_authenticated);
        (session.id, conduit)
    }
}

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
