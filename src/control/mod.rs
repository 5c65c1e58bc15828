//! Torrent control plane
//!
//! The seedbox's torrent client: which torrents exist and where their data
//! lives, plus the post-mirror moves and labels.

use async_trait::async_trait;

use anyhow::Result;

#[cfg(feature = "http")]
pub mod rutorrent;

#[cfg(feature = "http")]
pub use rutorrent::{RuTorrentClient, RuTorrentConfig};

/// One torrent as the control plane reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentSummary {
    /// Info hash, upper-case hex
    pub hash: String,
    /// Display name
    pub name: String,
    /// Directory or file holding the torrent's data on the seedbox
    pub base_path: String,
    /// Current label
    pub label: String,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Bytes still to download
    pub left_bytes: u64,
    /// Whether the client is re-checking the data
    pub is_hash_checking: bool,
}

impl TorrentSummary {
    /// Fully downloaded and not being re-checked
    pub fn is_complete(&self) -> bool {
        self.left_bytes == 0 && !self.is_hash_checking
    }

    /// Last component of the base path, the name the data has on disk
    pub fn base_name(&self) -> &str {
        self.base_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.base_path)
    }
}

/// Torrent client operations a mirror run needs
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// All torrents known to the client
    async fn list_torrents(&self) -> Result<Vec<TorrentSummary>>;

    /// Raw `.torrent` bytes for `hash`
    async fn get_torrent(&self, hash: &str) -> Result<Vec<u8>>;

    /// Move the data of `hash` to `target_dir` on the seedbox
    async fn move_torrent(&self, hash: &str, target_dir: &str) -> Result<()>;

    /// Set `label` on every torrent in `hashes`
    async fn set_label(&self, hashes: &[String], label: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(base_path: &str, left_bytes: u64, is_hash_checking: bool) -> TorrentSummary {
        TorrentSummary {
            hash: "AB".repeat(20),
            name: "x".to_string(),
            base_path: base_path.to_string(),
            label: String::new(),
            size_bytes: 10,
            left_bytes,
            is_hash_checking,
        }
    }

    #[test]
    fn test_is_complete() {
        assert!(summary("/a", 0, false).is_complete());
        assert!(!summary("/a", 1, false).is_complete());
        assert!(!summary("/a", 0, true).is_complete());
    }

    #[test]
    fn test_base_name() {
        assert_eq!(summary("/torrents/me/completed/Show", 0, false).base_name(), "Show");
        assert_eq!(summary("/torrents/me/completed/Show/", 0, false).base_name(), "Show");
        assert_eq!(summary("movie.mkv", 0, false).base_name(), "movie.mkv");
    }
}
