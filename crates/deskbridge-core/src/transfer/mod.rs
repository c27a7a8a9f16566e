//! File transfer engine.
//!
//! Transfers are multiplexed over a session's data conduit:
//!
//! ```text
//! FILE_START {transferId, name, size, dropX?, dropY?}
//! FILE_CHUNK {transferId, chunk, seq} × ceil(size / chunk_size)
//! FILE_END   {transferId}
//! ```
//!
//! The sender reads `chunk_size` bytes at a time and hands control back to
//! the engine every `yield_every` chunks so other sessions keep flowing.
//! The receiver appends chunks to a staging sink keyed by transfer id and
//! finalizes on `FILE_END`. A sequence gap, duplicate, or more bytes than
//! declared marks the transfer as failed and discards what was staged.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::{DropHint, FileDescription, FileStore};
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::file::format_size;
use crate::protocol::{self, Message};
use crate::session::SessionId;
use crate::transport::Conduit;

/// Status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// We are sending
    Sending,
    /// We are receiving
    Receiving,
    /// All bytes delivered
    Completed,
    /// Abandoned
    Error,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Progress record of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferRecord {
    /// Transfer id
    pub id: String,
    /// Session carrying the transfer
    pub session: SessionId,
    /// File name
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    /// Bytes sent or received so far
    pub bytes_transferred: u64,
    /// Status
    pub status: TransferStatus,
    /// Progress in percent
    pub percent: u8,
    /// Final location of a received file
    pub path: Option<PathBuf>,
    /// Failure reason
    pub error: Option<String>,
}

impl FileTransferRecord {
    fn new(id: String, session: SessionId, name: String, size: u64, status: TransferStatus) -> Self {
        Self {
            id,
            session,
            name,
            size,
            bytes_transferred: 0,
            status,
            percent: 0,
            path: None,
            error: None,
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;
        self.percent = percent(self.bytes_transferred, self.size);
    }

    fn complete(&mut self) {
        self.status = TransferStatus::Completed;
        self.percent = 100;
    }

    /// Whether the transfer is still moving bytes.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status, TransferStatus::Sending | TransferStatus::Receiving)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (u128::from(done.min(total)) * 100 / u128::from(total)) as u8
}

/// Outcome of one pumping round on an outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Yielded; call again
    More,
    /// `FILE_END` sent
    Done,
}

#[derive(Debug)]
struct Outbound {
    path: PathBuf,
    seq: u64,
}

#[derive(Debug)]
struct Inbound {
    next_seq: u64,
    hint: Option<DropHint>,
}

/// Finished records kept for the UI before the oldest are dropped.
const MAX_FINISHED_RECORDS: usize = 64;

/// Generate a process-unique transfer id (`tf-<millis>-<9 base36 chars>`).
#[must_use]
pub fn generate_transfer_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect();
    format!("tf-{}-{suffix}", chrono::Utc::now().timestamp_millis())
}

/// Tracks every transfer of the process.
#[derive(Debug)]
pub struct FileTransferEngine {
    records: HashMap<String, FileTransferRecord>,
    outbound: HashMap<String, Outbound>,
    inbound: HashMap<String, Inbound>,
    /// Ids of completed or failed records, oldest first
    finished: VecDeque<String>,
    chunk_size: usize,
    yield_every: usize,
}

impl FileTransferEngine {
    /// Create an engine with the configured pacing.
    #[must_use]
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            records: HashMap::new(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            finished: VecDeque::new(),
            chunk_size: config.chunk_size.max(1),
            yield_every: config.yield_every.max(1),
        }
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&FileTransferRecord> {
        self.records.get(id)
    }

    /// All records.
    #[must_use]
    pub fn records(&self) -> Vec<FileTransferRecord> {
        self.records.values().cloned().collect()
    }

    /// Remember a record that stopped moving and drop the oldest ones.
    fn retire(&mut self, id: &str) {
        self.finished.retain(|f| f != id);
        self.finished.push_back(id.to_string());
        while self.finished.len() > MAX_FINISHED_RECORDS {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if !self.records.get(&oldest).is_some_and(FileTransferRecord::is_active) {
                self.records.remove(&oldest);
            }
        }
    }

    /// Session carrying a transfer.
    #[must_use]
    pub fn session_of(&self, id: &str) -> Option<SessionId> {
        self.records.get(id).map(|r| r.session)
    }

    /// Register an outbound transfer and build its `FILE_START`.
    pub fn start_outbound(
        &mut self,
        session: SessionId,
        path: &Path,
        description: FileDescription,
        hint: Option<DropHint>,
    ) -> (String, Message) {
        let id = generate_transfer_id();
        let start = Message::FileStart {
            transfer_id: id.clone(),
            name: description.name.clone(),
            size: description.size,
            drop_x: hint.map(|h| h.x),
            drop_y: hint.map(|h| h.y),
        };

        info!(
            transfer = %id,
            session = %session,
            name = %description.name,
            size = %format_size(description.size),
            "Sending file"
        );
        self.records.insert(
            id.clone(),
            FileTransferRecord::new(
                id.clone(),
                session,
                description.name,
                description.size,
                TransferStatus::Sending,
            ),
        );
        self.outbound.insert(
            id.clone(),
            Outbound {
                path: path.to_path_buf(),
                seq: 0,
            },
        );
        (id, start)
    }

    /// Send up to `yield_every` chunks of an outbound transfer.
    ///
    /// Sends `FILE_END` and completes the record once every byte is out.
    pub async fn pump(
        &mut self,
        id: &str,
        files: &dyn FileStore,
        conduit: &dyn Conduit,
    ) -> Result<Pump> {
        for _ in 0..self.yield_every {
            let record = self
                .records
                .get_mut(id)
                .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;
            let state = self
                .outbound
                .get_mut(id)
                .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;

            let remaining = record.size.saturating_sub(record.bytes_transferred);
            if remaining == 0 {
                let end = Message::FileEnd {
                    transfer_id: id.to_string(),
                };
                conduit.send(protocol::encode(&end)?).await?;
                record.complete();
                self.outbound.remove(id);
                self.retire(id);
                info!(transfer = %id, "File sent");
                return Ok(Pump::Done);
            }

            let want = usize::try_from(remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));
            let chunk = files
                .read_chunk(&state.path, record.bytes_transferred, want)
                .await?;
            if chunk.is_empty() {
                return Err(Error::TransferOverflow {
                    transfer: id.to_string(),
                    size: record.size,
                });
            }

            let len = chunk.len() as u64;
            let message = Message::FileChunk {
                transfer_id: id.to_string(),
                chunk,
                seq: Some(state.seq),
            };
            conduit.send(protocol::encode(&message)?).await?;
            state.seq += 1;
            record.advance(len);
        }
        Ok(Pump::More)
    }

    /// Handle `FILE_START`.
    ///
    /// Any bytes staged earlier under the same id are thrown away.
    pub async fn start_inbound(
        &mut self,
        session: SessionId,
        id: &str,
        name: &str,
        size: u64,
        hint: Option<DropHint>,
        files: &dyn FileStore,
    ) -> Result<&FileTransferRecord> {
        if self.records.get(id).is_some_and(FileTransferRecord::is_active) {
            return Err(Error::ProtocolError(format!(
                "transfer '{id}' is already in progress"
            )));
        }
        files.begin(id).await?;

        info!(
            transfer = %id,
            session = %session,
            name = %name,
            size = %format_size(size),
            "Receiving file"
        );
        self.inbound.insert(id.to_string(), Inbound { next_seq: 0, hint });
        self.records.insert(
            id.to_string(),
            FileTransferRecord::new(
                id.to_string(),
                session,
                name.to_string(),
                size,
                TransferStatus::Receiving,
            ),
        );
        self.records
            .get(id)
            .ok_or_else(|| Error::Internal("record vanished".to_string()))
    }

    /// Handle `FILE_CHUNK`.
    ///
    /// A failure marks the record as failed and discards staged bytes.
    pub async fn accept_chunk(
        &mut self,
        session: SessionId,
        id: &str,
        seq: Option<u64>,
        chunk: &[u8],
        files: &dyn FileStore,
    ) -> Result<&FileTransferRecord> {
        if let Err(e) = self.try_accept_chunk(session, id, seq, chunk, files).await {
            self.abandon(id, &e, files).await;
            return Err(e);
        }
        self.records
            .get(id)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))
    }

    async fn try_accept_chunk(
        &mut self,
        session: SessionId,
        id: &str,
        seq: Option<u64>,
        chunk: &[u8],
        files: &dyn FileStore,
    ) -> Result<()> {
        let (record, state) = self.inbound_parts(session, id)?;

        if let Some(got) = seq {
            if got != state.next_seq {
                return Err(Error::ChunkOutOfOrder {
                    transfer: id.to_string(),
                    expected: state.next_seq,
                    got,
                });
            }
        }

        let len = chunk.len() as u64;
        if record.bytes_transferred + len > record.size {
            return Err(Error::TransferOverflow {
                transfer: id.to_string(),
                size: record.size,
            });
        }

        files.persist_chunk(id, chunk).await?;
        state.next_seq += 1;
        record.advance(len);
        debug!(transfer = %id, received = record.bytes_transferred, total = record.size, "Chunk stored");
        Ok(())
    }

    /// Handle `FILE_END`.
    pub async fn finish_inbound(
        &mut self,
        session: SessionId,
        id: &str,
        files: &dyn FileStore,
    ) -> Result<&FileTransferRecord> {
        match self.try_finish_inbound(session, id, files).await {
            Ok(path) => {
                self.inbound.remove(id);
                self.retire(id);
                let record = self
                    .records
                    .get_mut(id)
                    .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;
                record.complete();
                record.path = Some(path);
                info!(transfer = %id, name = %record.name, "File received");
                Ok(record)
            }
            Err(e) => {
                self.abandon(id, &e, files).await;
                Err(e)
            }
        }
    }

    async fn try_finish_inbound(
        &mut self,
        session: SessionId,
        id: &str,
        files: &dyn FileStore,
    ) -> Result<PathBuf> {
        let (record, state) = self.inbound_parts(session, id)?;
        if record.bytes_transferred != record.size {
            return Err(Error::ProtocolError(format!(
                "transfer '{id}' ended after {} of {} bytes",
                record.bytes_transferred, record.size
            )));
        }
        let name = record.name.clone();
        let hint = state.hint;
        files.finalize(id, &name, hint).await
    }

    fn inbound_parts(
        &mut self,
        session: SessionId,
        id: &str,
    ) -> Result<(&mut FileTransferRecord, &mut Inbound)> {
        let record = self
            .records
            .get_mut(id)
            .filter(|r| r.session == session && r.status == TransferStatus::Receiving)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;
        let state = self
            .inbound
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;
        Ok((record, state))
    }

    /// Mark a transfer failed and drop its working state.
    pub fn fail(&mut self, id: &str, reason: &str) -> Option<&FileTransferRecord> {
        self.outbound.remove(id);
        self.inbound.remove(id);
        let record = self.records.get_mut(id)?;
        if record.is_active() {
            warn!(transfer = %id, reason = %reason, "Transfer failed");
            record.status = TransferStatus::Error;
            record.error = Some(reason.to_string());
            self.retire(id);
        }
        self.records.get(id)
    }

    async fn abandon(&mut self, id: &str, error: &Error, files: &dyn FileStore) {
        // Never touch a transfer the message could not be matched to.
        if matches!(error, Error::UnknownTransfer(_)) {
            return;
        }
        let was_inbound = self.inbound.contains_key(id);
        if self.fail(id, &error.to_string()).is_some() && was_inbound {
            if let Err(e) = files.discard(id).await {
                warn!(transfer = %id, error = %e, "Failed to discard staged data");
            }
        }
    }

    /// Fail every active transfer of a closed session.
    pub async fn abort_session(
        &mut self,
        session: SessionId,
        files: &dyn FileStore,
    ) -> Vec<FileTransferRecord> {
        let ids: Vec<String> = self
            .records
            .values()
            .filter(|r| r.session == session && r.is_active())
            .map(|r| r.id.clone())
            .collect();

        let reason = Error::SessionNotReady {
            session,
            reason: "session closed".to_string(),
        };
        let mut aborted = Vec::with_capacity(ids.len());
        for id in ids {
            self.abandon(&id, &reason, files).await;
            if let Some(record) = self.records.get(&id) {
                aborted.push(record.clone());
            }
        }
        aborted
    }
}
