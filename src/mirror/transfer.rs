//! Resumable transfer engine
//!
//! Copies remote files one at a time. Each file goes through a size check
//! that decides between leaving it alone, downloading it from scratch and
//! appending the missing tail. A transient transport error rewinds the local
//! file by a safety margin, reconnects the channel and starts over at the
//! size check; retries are unbounded.

use anyhow::Result;
use rand::Rng;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::cli::progress::TransferProgress;
use crate::error::{is_transient, MirrorError};
use crate::remote::{RemoteChannel, RemoteEntry, RemoteWalker};
use crate::storage::DirectoryCache;

/// Bytes dropped from the local tail before resuming after an error
pub const DEFAULT_REWIND_MARGIN: u64 = 10;

/// Ranges requested per vector read
pub const DEFAULT_RANGES_PER_BATCH: usize = 16;

/// Transfer behaviour knobs
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Append to partial local files instead of starting over
    pub resume: bool,
    /// Copy remote permission bits onto local files
    pub preserve_modes: bool,
    /// Copy remote access and modification times onto local files
    pub preserve_times: bool,
    /// Local bytes discarded before resuming after a transport error
    pub rewind_margin: u64,
    /// Ranges per `read_ranges` call
    pub ranges_per_batch: usize,
    /// Pause between reconnect attempts
    pub reconnect_delay: Duration,
    /// How often transfer progress is logged
    pub progress_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            resume: false,
            preserve_modes: true,
            preserve_times: true,
            rewind_margin: DEFAULT_REWIND_MARGIN,
            ranges_per_batch: DEFAULT_RANGES_PER_BATCH,
            reconnect_delay: Duration::from_secs(1),
            progress_interval: Duration::from_secs(60),
        }
    }
}

/// Size check outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPlan {
    /// Local size equals remote size
    UpToDate,
    /// Download from scratch into a truncated file
    Fresh,
    /// Append the bytes from `offset` on
    Resume { offset: u64 },
}

/// Decide what to do with a file given its local and remote sizes
pub fn plan_transfer(local_size: Option<u64>, remote_size: u64, resume: bool) -> TransferPlan {
    match local_size {
        None => TransferPlan::Fresh,
        Some(size) if size == remote_size => TransferPlan::UpToDate,
        Some(size) if resume && size < remote_size => TransferPlan::Resume { offset: size },
        Some(_) => TransferPlan::Fresh,
    }
}

/// Split `[start, end)` into consecutive ranges of at most `max` bytes
///
/// The ranges never overlap and the last one is the exact remainder.
pub fn resume_ranges(start: u64, end: u64, max: u64) -> Vec<(u64, u64)> {
    let max = max.max(1);
    let mut ranges = Vec::new();
    let mut offset = start;
    while offset < end {
        let length = std::cmp::min(max, end - offset);
        ranges.push((offset, length));
        offset += length;
    }
    ranges
}

/// Per-file transfer bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    /// Path relative to the channel's working directory
    pub remote_path: String,
    /// Destination on disk
    pub local_path: PathBuf,
    /// Remote size
    pub expected_size: u64,
    /// Offset the last transport error rewound to
    pub resume_offset: Option<u64>,
    /// Connection generation the current attempt runs on
    pub connection_generation: u32,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes", self.remote_path, self.expected_size)?;
        if let Some(offset) = self.resume_offset {
            write!(f, ", resume at {}", offset)?;
        }
        write!(f, ", connection {})", self.connection_generation)
    }
}

/// What happened to one remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Local copy already complete
    UpToDate,
    /// Bytes were moved
    Downloaded { bytes: u64 },
    /// A local directory occupies the destination
    Skipped,
}

/// Counters for a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files_transferred: usize,
    pub files_up_to_date: usize,
    pub files_skipped: usize,
    pub bytes_transferred: u64,
    pub reconnects: u32,
}

/// Moves files from a remote channel into a local tree
pub struct TransferEngine<'a, C: RemoteChannel + ?Sized> {
    channel: &'a mut C,
    dircache: &'a mut DirectoryCache,
    options: &'a TransferOptions,
    /// Working directory restored after every reconnect
    remote_cwd: String,
    generation: u32,
    stats: TransferStats,
}

async fn local_size(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(MirrorError::storage_error_full("Failed to stat local file", path.display().to_string(), e.to_string()).into()),
    }
}

fn storage_error(message: &str, path: &Path, err: std::io::Error) -> MirrorError {
    error!("{} {}: {}", message, path.display(), err);
    MirrorError::storage_error_full(message, path.display().to_string(), err.to_string())
}

/// Destination of `remote_path` (a `/`-separated relative path) under `local_root`
pub fn local_destination(local_root: &Path, remote_path: &str) -> PathBuf {
    let mut path = local_root.to_path_buf();
    path.extend(remote_path.split('/').filter(|p| !p.is_empty() && *p != "." && *p != ".."));
    path
}

impl<'a, C: RemoteChannel + ?Sized> TransferEngine<'a, C> {
    /// Create an engine bound to the channel's current working directory
    pub async fn new(channel: &'a mut C, dircache: &'a mut DirectoryCache, options: &'a TransferOptions) -> Result<Self> {
        let remote_cwd = channel.current_dir().await?;
        Ok(Self {
            channel,
            dircache,
            options,
            remote_cwd,
            generation: 0,
            stats: TransferStats::default(),
        })
    }

    /// Counters so far
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Consume the engine, returning its counters
    pub fn into_stats(self) -> TransferStats {
        self.stats
    }

    /// Walk `remote_root` and transfer every file under it into `local_root`
    pub async fn mirror_tree(&mut self, remote_root: &str, local_root: &Path, strict: bool) -> Result<()> {
        let mut walker = RemoteWalker::new(remote_root, strict);
        while let Some(entry) = walker.next(&mut *self.channel).await {
            let entry = entry?;
            self.transfer_file(&entry, local_root).await?;
        }
        Ok(())
    }

    /// Transfer one remote file into `local_root`, keeping its relative path
    pub async fn transfer_file(&mut self, entry: &RemoteEntry, local_root: &Path) -> Result<FileOutcome> {
        let dest = local_destination(local_root, &entry.relative_path);
        if let Some(parent) = dest.parent() {
            self.dircache.ensure(parent).await?;
        }

        if fs::metadata(&dest).await.map(|m| m.is_dir()).unwrap_or(false) {
            warn!("{} is a local directory, skipping {}", dest.display(), entry.relative_path);
            self.stats.files_skipped += 1;
            return Ok(FileOutcome::Skipped);
        }

        let mut state = TransferState {
            remote_path: entry.relative_path.clone(),
            local_path: dest,
            expected_size: entry.size,
            resume_offset: None,
            connection_generation: self.generation,
        };
        let mut moved = 0u64;
        let mut downloaded = false;

        loop {
            let plan = plan_transfer(local_size(&state.local_path).await?, state.expected_size, self.options.resume);
            debug!("{}: {:?}", state.remote_path, plan);

            let attempt = match plan {
                TransferPlan::UpToDate => break,
                TransferPlan::Fresh => self.fresh_download(&state).await,
                TransferPlan::Resume { offset } => self.resume_download(&state, offset).await,
            };

            match attempt {
                Ok(bytes) => {
                    moved += bytes;
                    downloaded = true;
                    let size = local_size(&state.local_path).await?.unwrap_or(0);
                    if size != state.expected_size {
                        warn!(
                            "{}: local size {} differs from listed size {}",
                            state.remote_path, size, state.expected_size
                        );
                    }
                    break;
                }
                Err(e) if is_transient(&e) => {
                    error!("{}: {:#}", state.remote_path, e);
                    self.rewind(&mut state).await?;
                    self.reconnect().await?;
                    state.connection_generation = self.generation;
                    warn!("Retrying {}", state);
                }
                Err(e) => return Err(e),
            }
        }

        self.preserve_attributes(&state.local_path, entry).await;

        if downloaded {
            self.stats.files_transferred += 1;
            self.stats.bytes_transferred += moved;
            Ok(FileOutcome::Downloaded { bytes: moved })
        } else {
            debug!("{} is up to date", state.remote_path);
            self.stats.files_up_to_date += 1;
            Ok(FileOutcome::UpToDate)
        }
    }

    /// Cut the local file back by the rewind margin
    async fn rewind(&mut self, state: &mut TransferState) -> Result<()> {
        let size = local_size(&state.local_path).await?.unwrap_or(0);
        let offset = size.saturating_sub(self.options.rewind_margin);

        if size > 0 {
            let file = OpenOptions::new()
                .write(true)
                .open(&state.local_path)
                .await
                .map_err(|e| storage_error("Failed to open local file", &state.local_path, e))?;
            file.set_len(offset)
                .await
                .map_err(|e| storage_error("Failed to truncate local file", &state.local_path, e))?;
        }

        state.resume_offset = Some(offset);
        info!("Resuming {} at {} bytes", state.remote_path, offset);
        Ok(())
    }

    /// Re-establish the channel and restore the working directory
    async fn reconnect(&mut self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.pause().await;

            match self.channel.reconnect().await {
                Ok(()) => {}
                Err(e) if is_transient(&e) => {
                    warn!("Reconnect attempt {} failed: {:#}", attempt, e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self.channel.change_dir(&self.remote_cwd).await {
                Ok(()) => break,
                Err(e) if is_transient(&e) => {
                    warn!("Restoring {} after reconnect failed: {:#}", self.remote_cwd, e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        self.generation += 1;
        self.stats.reconnects += 1;
        info!("Reconnected (generation {}, attempt {})", self.generation, attempt);
        Ok(())
    }

    /// Sleep the reconnect delay plus up to a quarter of it in jitter
    async fn pause(&self) {
        let base = self.options.reconnect_delay;
        if base.is_zero() {
            return;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
    }

    async fn fresh_download(&mut self, state: &TransferState) -> Result<u64> {
        info!("Downloading {} -> {}", state.remote_path, state.local_path.display());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&state.local_path)
            .await
            .map_err(|e| storage_error("Failed to create local file", &state.local_path, e))?;

        let mut progress = TransferProgress::new(
            state.remote_path.clone(),
            0,
            state.expected_size,
            self.options.progress_interval,
        );
        let result = self
            .channel
            .read_file(&state.remote_path, &mut file, &mut |n: usize| progress.record(n))
            .await;

        // Let in-flight writes land before the size is looked at again
        let flushed = file.flush().await;
        let bytes = result?;
        flushed.map_err(|e| storage_error("Failed to flush local file", &state.local_path, e))?;

        progress.finish();
        Ok(bytes)
    }

    async fn resume_download(&mut self, state: &TransferState, offset: u64) -> Result<u64> {
        info!("Resuming file {} at {} bytes", state.remote_path, offset);

        let ranges = resume_ranges(offset, state.expected_size, self.channel.max_request_size());
        let mut file = OpenOptions::new()
            .append(true)
            .open(&state.local_path)
            .await
            .map_err(|e| storage_error("Failed to open local file", &state.local_path, e))?;

        let mut progress = TransferProgress::new(
            state.remote_path.clone(),
            offset,
            state.expected_size,
            self.options.progress_interval,
        );
        let result = self.append_ranges(state, &ranges, &mut file, &mut progress).await;

        let flushed = file.flush().await;
        let bytes = result?;
        flushed.map_err(|e| storage_error("Failed to flush local file", &state.local_path, e))?;

        progress.finish();
        Ok(bytes)
    }

    async fn append_ranges(
        &mut self,
        state: &TransferState,
        ranges: &[(u64, u64)],
        file: &mut fs::File,
        progress: &mut TransferProgress,
    ) -> Result<u64> {
        let mut written = 0u64;

        for batch in ranges.chunks(self.options.ranges_per_batch.max(1)) {
            let chunks = self.channel.read_ranges(&state.remote_path, batch).await?;
            if chunks.len() != batch.len() {
                return Err(MirrorError::transient(
                    "Vector read returned the wrong number of chunks",
                    format!("{} ranges, {} chunks", batch.len(), chunks.len()),
                )
                .with_path(state.remote_path.as_str())
                .into());
            }

            for (&(range_offset, length), chunk) in batch.iter().zip(chunks) {
                if chunk.len() as u64 != length {
                    return Err(MirrorError::transport_error_with_path(
                        format!(
                            "Remote file ended early: {} of {} bytes at offset {}",
                            chunk.len(),
                            length,
                            range_offset
                        ),
                        state.remote_path.as_str(),
                    )
                    .into());
                }
                file.write_all(&chunk)
                    .await
                    .map_err(|e| storage_error("Failed to write local file", &state.local_path, e))?;
                written += length;
                progress.record(chunk.len());
            }
        }

        Ok(written)
    }

    /// Copy mode bits and timestamps; failures are only logged
    async fn preserve_attributes(&self, dest: &Path, entry: &RemoteEntry) {
        if self.options.preserve_times {
            let path = dest.to_path_buf();
            let (atime, mtime) = (entry.atime, entry.mtime);
            let result = tokio::task::spawn_blocking(move || set_times(&path, atime, mtime)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to set times on {}: {}", dest.display(), e),
                Err(e) => warn!("Failed to set times on {}: {}", dest.display(), e),
            }
        }

        if self.options.preserve_modes {
            if let Err(e) = set_mode(dest, entry.mode_bits).await {
                warn!("Failed to set mode {:o} on {}: {}", entry.mode_bits & 0o7777, dest.display(), e);
            }
        }
    }
}

fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    file.set_times(std::fs::FileTimes::new().set_accessed(atime).set_modified(mtime))
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode_bits: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode_bits & 0o7777)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode_bits: u32) -> std::io::Result<()> {
    Ok(())
}
