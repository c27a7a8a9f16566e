//! Disk-backed file I/O for transfers.
//!
//! Inbound chunks are appended to a per-transfer staging file under the
//! staging directory (`<staging>/<transfer id>`), truncated when the
//! transfer starts. Finalizing moves the
//! staged bytes into the download directory under the sender's file name,
//! stripped of any directory components and made unique with a ` (n)`
//! suffix when the name is taken.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::capability::{DropHint, FileDescription, FileStore};
use crate::error::{Error, Result};

/// [`FileStore`] writing to the local file system.
#[derive(Debug, Clone)]
pub struct DiskFileStore {
    download_dir: PathBuf,
    staging_dir: PathBuf,
}

impl DiskFileStore {
    /// Create a store finalizing into `download_dir`.
    ///
    /// Staging files live in the system temp directory.
    #[must_use]
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            staging_dir: std::env::temp_dir().join("deskbridge"),
        }
    }

    /// Use a specific staging directory.
    #[must_use]
    pub fn with_staging_dir(mut self, staging_dir: PathBuf) -> Self {
        self.staging_dir = staging_dir;
        self
    }

    /// Directory received files land in.
    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn staging_path(&self, transfer_id: &str) -> Result<PathBuf> {
        sanitize_path(&self.staging_dir, Path::new(transfer_id))
            .filter(|_| !transfer_id.is_empty() && !transfer_id.contains(['/', '\\']))
            .ok_or_else(|| Error::InvalidPath(format!("bad transfer id '{transfer_id}'")))
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn read_chunk(&self, path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = Vec::with_capacity(size);
        file.take(size as u64).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn begin(&self, transfer_id: &str) -> Result<()> {
        let path = self.staging_path(transfer_id)?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        tokio::fs::File::create(&path).await?;
        Ok(())
    }

    async fn persist_chunk(&self, transfer_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.staging_path(transfer_id)?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize(
        &self,
        transfer_id: &str,
        name: &str,
        hint: Option<DropHint>,
    ) -> Result<PathBuf> {
        let staged = self.staging_path(transfer_id)?;
        if !staged.exists() {
            // Empty files never persist a chunk.
            tokio::fs::create_dir_all(&self.staging_dir).await?;
            tokio::fs::File::create(&staged).await?;
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let target = unique_destination(&self.download_dir, &safe_file_name(name));

        if tokio::fs::rename(&staged, &target).await.is_err() {
            // Staging and downloads may sit on different file systems.
            tokio::fs::copy(&staged, &target).await?;
            tokio::fs::remove_file(&staged).await?;
        }

        debug!(
            transfer = %transfer_id,
            path = %target.display(),
            hint = ?hint,
            "Finalized received file"
        );
        Ok(target)
    }

    async fn discard(&self, transfer_id: &str) -> Result<()> {
        let staged = self.staging_path(transfer_id)?;
        match tokio::fs::remove_file(&staged).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn describe(&self, path: &Path) -> Result<FileDescription> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;

        Ok(FileDescription {
            name,
            size: metadata.len(),
        })
    }
}

/// Sanitize a relative path to prevent directory traversal.
///
/// Returns the joined path, or `None` if `relative` escapes `base`.
#[must_use]
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    for component in relative.components() {
        if component == std::path::Component::ParentDir {
            return None;
        }
    }

    let full_path = base.join(relative);

    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

/// Reduce a sender-supplied name to a bare file name.
#[must_use]
pub fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match base {
        "" | "." | ".." => "received-file".to_string(),
        other => other.to_string(),
    }
}

fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map_or_else(|| name.to_string(), |s| s.to_string_lossy().to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1u32..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Format a file size for display.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
