//! Channel over a locally mounted seedbox tree
//!
//! Serves a directory reachable through the file system (an sshfs, NFS or
//! SMB mount). I/O errors a dropped mount typically produces are reported as
//! retryable, so the transfer engine rides out a remount.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use anyhow::Result;

use super::{resolve_remote, RemoteChannel, RemoteEntry};
use crate::error::MirrorError;

/// Default read size, the SFTP request ceiling most servers use
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 32768;

/// Remote channel backed by a local directory
#[derive(Debug)]
pub struct LocalChannel {
    root: PathBuf,
    cwd: String,
    max_request_size: u64,
    generation: u32,
}

impl LocalChannel {
    /// Open a channel rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cwd: "/".to_string(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            generation: 0,
        }
    }

    /// Set the largest range served per request
    pub fn with_max_request_size(mut self, size: u64) -> Self {
        self.max_request_size = size.max(1);
        self
    }

    /// Number of reconnects so far
    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let absolute = resolve_remote(&self.cwd, path);
        let mut resolved = self.root.clone();
        resolved.extend(absolute.split('/').filter(|p| !p.is_empty()));
        resolved
    }
}

/// Map an I/O error to a transport error, retryable if a reconnect may cure it
fn classify(err: std::io::Error, path: &str) -> MirrorError {
    let retryable = matches!(
        err.kind(),
        ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    );
    if retryable {
        MirrorError::transient("Remote read interrupted", err.to_string()).with_path(path)
    } else {
        MirrorError::TransportError {
            message: err.to_string(),
            path: Some(path.to_string()),
            source: Some(err.kind().to_string()),
            is_retryable: false,
        }
    }
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    let base = if meta.is_dir() { 0o040755 } else { 0o100644 };
    if meta.permissions().readonly() {
        base & !0o222
    } else {
        base
    }
}

fn entry_from(name: String, meta: &std::fs::Metadata) -> RemoteEntry {
    RemoteEntry {
        relative_path: name,
        size: meta.len(),
        mode_bits: mode_of(meta),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

async fn open(path: &Path, remote: &str) -> Result<File> {
    Ok(File::open(path).await.map_err(|e| classify(e, remote))?)
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.resolve(path);
        let mut reader = fs::read_dir(&dir).await.map_err(|e| classify(e, path))?;

        let mut entries = Vec::new();
        while let Some(item) = reader.next_entry().await.map_err(|e| classify(e, path))? {
            // Follow symlinks, as a remote server would
            let meta = fs::metadata(item.path()).await.map_err(|e| classify(e, path))?;
            let name = item.file_name().to_string_lossy().into_owned();
            entries.push(entry_from(name, &meta));
        }

        trace!("Listed {} ({} entries)", dir.display(), entries.len());
        Ok(entries)
    }

    async fn read_file(
        &mut self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        on_chunk: &mut (dyn FnMut(usize) + Send),
    ) -> Result<u64> {
        let mut file = open(&self.resolve(path), path).await?;
        let mut buffer = vec![0u8; self.max_request_size as usize];
        let mut total = 0u64;

        loop {
            let n = file.read(&mut buffer).await.map_err(|e| classify(e, path))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buffer[..n]).await.map_err(|e| {
                MirrorError::storage_error_full("Failed to write local file", path, e.to_string())
            })?;
            total += n as u64;
            on_chunk(n);
        }

        Ok(total)
    }

    async fn read_ranges(&mut self, path: &str, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        let mut file = open(&self.resolve(path), path).await?;
        let mut chunks = Vec::with_capacity(ranges.len());

        for &(offset, length) in ranges {
            file.seek(SeekFrom::Start(offset)).await.map_err(|e| classify(e, path))?;
            let mut data = vec![0u8; length as usize];
            let mut filled = 0;
            while filled < data.len() {
                let n = file.read(&mut data[filled..]).await.map_err(|e| classify(e, path))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            // A short buffer tells the caller the file ended early
            data.truncate(filled);
            chunks.push(Bytes::from(data));
        }

        Ok(chunks)
    }

    fn max_request_size(&self) -> u64 {
        self.max_request_size
    }

    async fn current_dir(&mut self) -> Result<String> {
        Ok(self.cwd.clone())
    }

    async fn change_dir(&mut self, path: &str) -> Result<()> {
        let target = resolve_remote(&self.cwd, path);
        let meta = fs::metadata(self.resolve(path)).await.map_err(|e| classify(e, path))?;
        if !meta.is_dir() {
            return Err(MirrorError::transport_error_with_path("Not a directory", path).into());
        }
        debug!("Changed directory to {}", target);
        self.cwd = target;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        // A mount that is still away looks like a dropped connection
        fs::metadata(&self.root).await.map_err(|e| {
            MirrorError::transient("Mount point unavailable", e.to_string()).with_path(self.root.display().to_string())
        })?;
        self.cwd = "/".to_string();
        self.generation += 1;
        info!("Reopened {} (generation {})", self.root.display(), self.generation);
        Ok(())
    }
}
