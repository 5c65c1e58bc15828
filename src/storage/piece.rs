//! Piece reconstruction module
//!
//! Rebuilds torrent pieces from mirrored files. Pieces are cut from the
//! concatenation of the torrent's files in declared order, so a single
//! piece may span the tail of one file and the head of the next.

use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use crate::torrent::FileEntry;

/// A reconstructed piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    /// Piece index
    pub index: usize,
    /// Piece data
    pub data: Vec<u8>,
}

impl Piece {
    /// SHA1 digest of the piece data
    pub fn digest(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().into()
    }
}

/// A piece that could not be rebuilt because a backing file was unreadable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceReadError {
    /// Index of the affected piece
    pub index: usize,
    /// First unreadable file touching the piece
    pub path: PathBuf,
    /// What went wrong with that file
    pub message: String,
}

impl fmt::Display for PieceReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece {} unreadable: {} ({})", self.index, self.message, self.path.display())
    }
}

impl std::error::Error for PieceReadError {}

struct OpenFile {
    path: PathBuf,
    /// None once the file turned out to be unreadable
    handle: Option<File>,
    /// Declared bytes not yet consumed
    remaining: u64,
}

/// Lazily yields the pieces of a torrent from local files
///
/// Every declared byte is accounted for: bytes from a file that cannot be
/// opened, or that ends early, still advance the piece boundaries, and each
/// piece they fall in is yielded as an error instead of data.
pub struct PieceReader {
    root: PathBuf,
    files: std::vec::IntoIter<FileEntry>,
    current: Option<OpenFile>,
    piece_length: usize,
    buffer: Vec<u8>,
    remaining_in_piece: usize,
    /// Logical bytes in the current piece, readable or not
    filled: usize,
    poisoned: Option<(PathBuf, String)>,
    index: usize,
    finished: bool,
}

impl PieceReader {
    /// Create a reader over `files`, resolved against `root`
    pub fn new(root: impl Into<PathBuf>, files: Vec<FileEntry>, piece_length: u32) -> Self {
        let piece_length = piece_length.max(1) as usize;
        Self {
            root: root.into(),
            files: files.into_iter(),
            current: None,
            piece_length,
            buffer: Vec::with_capacity(piece_length),
            remaining_in_piece: piece_length,
            filled: 0,
            poisoned: None,
            index: 0,
            finished: false,
        }
    }

    fn open(root: &Path, entry: FileEntry) -> OpenFile {
        let path = root.join(entry.relative_path());
        let handle = match File::open(&path) {
            Ok(handle) => {
                trace!("Opened {} ({} bytes declared)", path.display(), entry.length);
                Some(handle)
            }
            Err(e) => {
                warn!("Cannot open {}: {}", path.display(), e);
                None
            }
        };
        OpenFile {
            path,
            handle,
            remaining: entry.length,
        }
    }

    fn poison(&mut self, path: &Path, message: impl Into<String>) {
        if self.poisoned.is_none() {
            self.poisoned = Some((path.to_path_buf(), message.into()));
        }
    }

    fn take_piece(&mut self) -> Result<Piece, PieceReadError> {
        let index = self.index;
        self.index += 1;
        self.remaining_in_piece = self.piece_length;
        self.filled = 0;

        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.piece_length));
        match self.poisoned.take() {
            Some((path, message)) => Err(PieceReadError { index, path, message }),
            None => {
                trace!("Piece {} rebuilt ({} bytes)", index, data.len());
                Ok(Piece { index, data })
            }
        }
    }

    /// Consume up to the rest of the current piece from the open file
    fn fill_from_current(&mut self) {
        let Some(mut current) = self.current.take() else {
            return;
        };

        let want = std::cmp::min(self.remaining_in_piece as u64, current.remaining) as usize;
        let consumed = match current.handle.as_mut() {
            Some(handle) => {
                let start = self.buffer.len();
                self.buffer.resize(start + want, 0);
                match handle.read(&mut self.buffer[start..]) {
                    Ok(0) => {
                        self.buffer.truncate(start);
                        let message = format!("file ends {} bytes short of its declared length", current.remaining);
                        warn!("{}: {}", current.path.display(), message);
                        self.poison(&current.path, message);
                        current.handle = None;
                        0
                    }
                    Ok(n) => {
                        self.buffer.truncate(start + n);
                        n
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {
                        self.buffer.truncate(start);
                        0
                    }
                    Err(e) => {
                        self.buffer.truncate(start);
                        warn!("Read error on {}: {}", current.path.display(), e);
                        self.poison(&current.path, e.to_string());
                        current.handle = None;
                        0
                    }
                }
            }
            None => {
                self.poison(&current.path, "unable to open file");
                want
            }
        };

        current.remaining -= consumed as u64;
        self.remaining_in_piece -= consumed;
        self.filled += consumed;

        if current.remaining > 0 {
            self.current = Some(current);
        }
    }
}

impl Iterator for PieceReader {
    type Item = Result<Piece, PieceReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.current.is_none() {
                match self.files.next() {
                    Some(entry) if entry.length == 0 => continue,
                    Some(entry) => self.current = Some(Self::open(&self.root, entry)),
                    None => {
                        self.finished = true;
                        if self.filled > 0 {
                            debug!("Final piece {} is {} bytes", self.index, self.filled);
                            return Some(self.take_piece());
                        }
                        return None;
                    }
                }
            }

            self.fill_from_current();

            if self.remaining_in_piece == 0 {
                return Some(self.take_piece());
            }
        }
    }
}
