//! Torrent metadata structures
//!
//! The subset of a torrent's info dictionary needed to verify mirrored data.

use sha1::{Digest, Sha1};
use std::path::PathBuf;

use crate::error::MirrorError;

/// A file declared by the torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

impl FileEntry {
    /// Path relative to the mirror root
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// How the torrent's bytes are laid out on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// No file list; the torrent name is the file
    SingleFile(FileEntry),
    /// Files under a directory named after the torrent, hashed in list order
    MultiFile(Vec<FileEntry>),
}

/// Decoded torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// Torrent name (file name or top-level directory)
    pub name: String,
    /// Size of each piece in bytes
    pub piece_length: u32,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub piece_hashes: Vec<[u8; 20]>,
    /// Single- or multi-file layout
    pub layout: Layout,
    /// SHA1 of the bencoded info dictionary, when it could be located
    pub info_hash: Option<[u8; 20]>,
}

impl TorrentMetadata {
    /// Calculate total size of all files in torrent, saturating at `u64::MAX`
    pub fn total_size(&self) -> u64 {
        self.checked_total_size().unwrap_or(u64::MAX)
    }

    /// Total size of all files, or `None` when it does not fit a `u64`
    pub fn checked_total_size(&self) -> Option<u64> {
        match &self.layout {
            Layout::SingleFile(file) => Some(file.length),
            Layout::MultiFile(files) => files.iter().try_fold(0u64, |total, f| total.checked_add(f.length)),
        }
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        matches!(self.layout, Layout::MultiFile(_))
    }

    /// Files in hashing order, with paths relative to the mirror root
    ///
    /// Multi-file torrents live under a directory named after the torrent.
    pub fn files(&self) -> Vec<FileEntry> {
        match &self.layout {
            Layout::SingleFile(file) => vec![file.clone()],
            Layout::MultiFile(files) => files
                .iter()
                .map(|f| {
                    let mut path = Vec::with_capacity(f.path.len() + 1);
                    path.push(self.name.clone());
                    path.extend(f.path.iter().cloned());
                    FileEntry { path, length: f.length }
                })
                .collect(),
        }
    }

    /// Get info hash as an upper-case hex string, the form ruTorrent uses
    pub fn info_hash_hex(&self) -> Option<String> {
        self.info_hash.map(hex::encode_upper)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>, MirrorError> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(MirrorError::InvalidPieceHashTable {
                length: pieces_bytes.len(),
            });
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Number of pieces the declared file sizes call for
    pub fn expected_piece_count(&self) -> u64 {
        let total = self.total_size();
        let piece_length = u64::from(self.piece_length.max(1));
        total / piece_length + u64::from(total % piece_length != 0)
    }

    /// Whether the hash table length agrees with the declared file sizes
    pub fn is_consistent(&self) -> bool {
        self.checked_total_size().is_some() && self.expected_piece_count() == self.piece_count() as u64
    }
}
