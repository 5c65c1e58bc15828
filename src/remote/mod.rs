//! Remote file-access channel
//!
//! This module abstracts the seedbox side of a mirror run. A channel lists
//! directories, streams whole files, reads byte ranges for resumption and can
//! be torn down and re-established when the connection drops.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;
use tokio::io::AsyncWrite;

use anyhow::Result;

#[cfg(feature = "http")]
pub mod http;
pub mod local;
pub mod walker;

#[cfg(feature = "http")]
pub use http::{HttpChannel, HttpChannelConfig};
pub use local::LocalChannel;
pub use walker::RemoteWalker;

/// Owner read, write and execute bits
pub const OWNER_RWX: u32 = 0o700;
/// File type bits of a POSIX mode
pub const S_IFMT: u32 = 0o170000;
/// Directory file type
pub const S_IFDIR: u32 = 0o040000;

/// A file or directory as reported by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Path relative to the directory the listing or walk started from
    pub relative_path: String,
    /// Size in bytes
    pub size: u64,
    /// POSIX mode bits
    pub mode_bits: u32,
    /// Last modification time
    pub mtime: SystemTime,
    /// Last access time
    pub atime: SystemTime,
}

impl RemoteEntry {
    /// Whether this entry is a directory
    ///
    /// Servers that report the file type are trusted. Otherwise an entry with
    /// all owner permission bits set is treated as a directory.
    pub fn is_dir(&self) -> bool {
        let kind = self.mode_bits & S_IFMT;
        if kind != 0 {
            return kind == S_IFDIR;
        }
        self.mode_bits & OWNER_RWX == OWNER_RWX
    }

    /// Last path component
    pub fn file_name(&self) -> &str {
        self.relative_path.rsplit('/').next().unwrap_or(&self.relative_path)
    }
}

/// Remote file-access channel
///
/// All paths are `/`-separated. Relative paths resolve against the channel's
/// current directory; paths starting with `/` resolve against its root.
///
/// Errors that a reconnect could cure are reported as retryable
/// [`MirrorError::TransportError`](crate::error::MirrorError) values.
#[async_trait]
pub trait RemoteChannel: Send {
    // ==================== Listing ====================

    /// List one directory level, in server order
    ///
    /// `relative_path` of each returned entry is its bare name.
    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    // ==================== Reading ====================

    /// Stream a whole file into `sink`, returning the bytes written
    ///
    /// `on_chunk` is called with the size of every chunk written.
    async fn read_file(
        &mut self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        on_chunk: &mut (dyn FnMut(usize) + Send),
    ) -> Result<u64>;

    /// Read `(offset, length)` ranges of a file, one buffer per range
    async fn read_ranges(&mut self, path: &str, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>>;

    /// Largest range the channel serves in one request
    fn max_request_size(&self) -> u64;

    // ==================== Session ====================

    /// Current directory, absolute
    async fn current_dir(&mut self) -> Result<String>;

    /// Change the current directory
    async fn change_dir(&mut self, path: &str) -> Result<()>;

    /// Drop the session and establish a new one
    ///
    /// The new session starts at the root; callers restore their directory.
    async fn reconnect(&mut self) -> Result<()>;
}

/// Join a relative `name` onto `base`
pub fn join_remote(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        return normalize_remote(name);
    }
    let base = base.trim_end_matches('/');
    if base.is_empty() || base == "." {
        normalize_relative(name)
    } else if base.starts_with('/') {
        normalize_remote(&format!("{}/{}", base, name))
    } else {
        normalize_relative(&format!("{}/{}", base, name))
    }
}

/// Resolve `path` against an absolute `cwd`
pub fn resolve_remote(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize_remote(path)
    } else {
        normalize_remote(&format!("{}/{}", cwd, path))
    }
}

/// Collapse `.`, `..` and repeated separators of an absolute path
pub fn normalize_remote(path: &str) -> String {
    format!("/{}", collapse(path).join("/"))
}

fn normalize_relative(path: &str) -> String {
    collapse(path).join("/")
}

fn collapse(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts
}
