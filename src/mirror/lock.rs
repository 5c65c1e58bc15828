//! Run lock
//!
//! Keeps two mirror runs with the same host and arguments from working on
//! the same tree at once. The lock is a file in the temporary directory
//! holding the owner's PID; a lock whose owner is gone is broken.
//!
//! The PID is written to a staging file first and hard-linked into place,
//! so the lock file never exists without its owner.

use sha1::{Digest, Sha1};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::MirrorError;

/// Held run lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

/// Lock file path for a run against `host` with `arguments`
pub fn lock_path(host: &str, arguments: &[String]) -> PathBuf {
    lock_path_in(&std::env::temp_dir(), host, arguments)
}

/// Lock file path under `dir`
pub fn lock_path_in(dir: &Path, host: &str, arguments: &[String]) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(host.as_bytes());
    for arg in arguments {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    let digest: [u8; 20] = hasher.finalize().into();
    dir.join(format!("seedbox-mirror-{}.lock", hex::encode(digest)))
}

/// Whether a process with `pid` is running
fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    let proc_root = Path::new("/proc");
    if proc_root.is_dir() {
        return proc_root.join(pid.to_string()).exists();
    }

    // No procfs: ask ps, and assume the owner lives if that fails too
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(true)
}

/// How long a lock without a readable PID is still treated as held
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `path` was modified within the grace period
fn recently_written(path: &Path) -> bool {
    match fs::metadata(path).and_then(|meta| meta.modified()) {
        // An mtime in the future counts as recent
        Ok(modified) => modified.elapsed().map(|age| age < UNREADABLE_GRACE).unwrap_or(true),
        Err(_) => false,
    }
}

/// Per-process staging file next to the lock
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lock".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

impl RunLock {
    /// Take the lock at `path`
    ///
    /// A lock left by a dead process is removed and acquisition is retried
    /// once. A lock held by a live process is a [`MirrorError::LockError`].
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, MirrorError> {
        let path = path.into();

        match Self::create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(MirrorError::lock_error(
                    format!("Failed to create lock file: {}", e),
                    path.display().to_string(),
                ))
            }
        }

        match read_owner(&path) {
            Some(pid) if pid != std::process::id() && process_alive(pid) => {
                return Err(MirrorError::lock_error(
                    format!("Another mirror run is active (pid {})", pid),
                    path.display().to_string(),
                ));
            }
            None if recently_written(&path) => {
                return Err(MirrorError::lock_error(
                    "Lock file without a readable owner was just written, another run may be starting",
                    path.display().to_string(),
                ));
            }
            owner => {
                warn!("Breaking stale lock {} (owner {:?})", path.display(), owner);
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != ErrorKind::NotFound {
                        return Err(MirrorError::lock_error(
                            format!("Failed to remove stale lock: {}", e),
                            path.display().to_string(),
                        ));
                    }
                }
            }
        }

        Self::create(&path).map_err(|e| {
            MirrorError::lock_error(format!("Failed to take lock after breaking it: {}", e), path.display().to_string())
        })
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let staging = staging_path(path);
        let published = Self::publish(path, &staging);
        if let Err(e) = fs::remove_file(&staging) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove staging file {}: {}", staging.display(), e);
            }
        }
        published?;

        info!("Acquired run lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Write our PID to `staging`, then link it to `path`; the link fails
    /// with `AlreadyExists` if someone else holds the lock
    fn publish(path: &Path, staging: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(staging)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        drop(file);
        fs::hard_link(staging, path)
    }

    /// Lock file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now
    pub fn release(mut self) -> Result<(), MirrorError> {
        self.released = true;
        fs::remove_file(&self.path).map_err(|e| {
            MirrorError::lock_error(format!("Failed to remove lock file: {}", e), self.path.display().to_string())
        })?;
        debug!("Released run lock {}", self.path.display());
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released run lock {}", self.path.display()),
            Err(e) => warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
    }
}
