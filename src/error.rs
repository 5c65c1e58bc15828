//! Error types for the seedbox mirror
//!
//! This module defines the error taxonomy shared by the metadata decoder,
//! the transfer engine, the verification engine and the orchestrator.

use std::fmt;

/// Reason a torrent failed verification against its piece-hash table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    /// Neither a file nor a directory exists at the torrent's local path
    MissingPath,
    /// A reconstructed piece hashed to something other than the expected digest
    HashMismatch,
    /// A piece could not be reconstructed because a backing file was unreadable
    UnreadablePiece,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationFailure::MissingPath => write!(f, "missing/invalid path"),
            VerificationFailure::HashMismatch => write!(f, "hash mismatch"),
            VerificationFailure::UnreadablePiece => write!(f, "unable to read piece"),
        }
    }
}

/// Error type for mirror operations
#[derive(Debug, Clone)]
pub enum MirrorError {
    /// Bencoded metadata could not be decoded
    MalformedMetadata {
        message: String,
        offset: Option<usize>,
    },

    /// `piece length` is missing, zero, negative or too large
    InvalidPieceLength {
        value: i64,
    },

    /// `pieces` is not a whole number of 20-byte digests
    InvalidPieceHashTable {
        length: usize,
    },

    /// Local data does not match the torrent
    Verification {
        failure: VerificationFailure,
        piece: Option<usize>,
    },

    /// Remote file-access channel errors
    TransportError {
        message: String,
        path: Option<String>,
        source: Option<String>,
        is_retryable: bool,
    },

    /// Local file I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Torrent control-plane errors
    ControlPlaneError {
        message: String,
        source: Option<String>,
    },

    /// Run lock contention or lock file I/O
    LockError {
        message: String,
        path: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl MirrorError {
    /// Create a new MalformedMetadata error
    pub fn malformed(message: impl Into<String>) -> Self {
        MirrorError::MalformedMetadata {
            message: message.into(),
            offset: None,
        }
    }

    /// Create a new MalformedMetadata error at a byte offset
    pub fn malformed_at(message: impl Into<String>, offset: usize) -> Self {
        MirrorError::MalformedMetadata {
            message: message.into(),
            offset: Some(offset),
        }
    }

    /// Create a new Verification error
    pub fn verification(failure: VerificationFailure) -> Self {
        MirrorError::Verification {
            failure,
            piece: None,
        }
    }

    /// Create a new Verification error for a specific piece
    pub fn verification_at(failure: VerificationFailure, piece: usize) -> Self {
        MirrorError::Verification {
            failure,
            piece: Some(piece),
        }
    }

    /// Create a new retryable TransportError
    pub fn transient(message: impl Into<String>, source: impl Into<String>) -> Self {
        MirrorError::TransportError {
            message: message.into(),
            path: None,
            source: Some(source.into()),
            is_retryable: true,
        }
    }

    /// Create a new non-retryable TransportError for a remote path
    pub fn transport_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        MirrorError::TransportError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
            is_retryable: false,
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        MirrorError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        MirrorError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ControlPlaneError
    pub fn control_plane_error(message: impl Into<String>) -> Self {
        MirrorError::ControlPlaneError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ControlPlaneError with source
    pub fn control_plane_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        MirrorError::ControlPlaneError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new LockError
    pub fn lock_error(message: impl Into<String>, path: impl Into<String>) -> Self {
        MirrorError::LockError {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        MirrorError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        MirrorError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Attach the remote path a transport error concerns
    pub fn with_path(mut self, remote: impl Into<String>) -> Self {
        match &mut self {
            MirrorError::TransportError { path, .. } | MirrorError::StorageError { path, .. } => {
                *path = Some(remote.into());
            }
            _ => {}
        }
        self
    }

    /// Whether the transfer engine should reconnect and try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, MirrorError::TransportError { is_retryable: true, .. })
    }

    /// Whether this error is fatal for a single torrent only
    pub fn is_torrent_scoped(&self) -> bool {
        matches!(
            self,
            MirrorError::MalformedMetadata { .. }
                | MirrorError::InvalidPieceLength { .. }
                | MirrorError::InvalidPieceHashTable { .. }
                | MirrorError::Verification { .. }
        )
    }
}

/// Returns true if an `anyhow` error wraps a retryable transport error
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<MirrorError>())
        .any(MirrorError::is_retryable)
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::MalformedMetadata { message, offset } => match offset {
                Some(o) => write!(f, "Malformed metadata: {} (offset: {})", message, o),
                None => write!(f, "Malformed metadata: {}", message),
            },
            MirrorError::InvalidPieceLength { value } => {
                write!(f, "Invalid piece length: {}", value)
            }
            MirrorError::InvalidPieceHashTable { length } => {
                write!(f, "Invalid piece hash table: {} bytes is not a multiple of 20", length)
            }
            MirrorError::Verification { failure, piece } => match piece {
                Some(p) => write!(f, "Verification failed: {} (piece: {})", failure, p),
                None => write!(f, "Verification failed: {}", failure),
            },
            MirrorError::TransportError { message, path, source, is_retryable } => {
                let label = if *is_retryable { "Transport error (retryable)" } else { "Transport error" };
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "{}: {} (path: {}, source: {})", label, message, p, s),
                    (Some(p), None) => write!(f, "{}: {} (path: {})", label, message, p),
                    (None, Some(s)) => write!(f, "{}: {} (source: {})", label, message, s),
                    (None, None) => write!(f, "{}: {}", label, message),
                }
            }
            MirrorError::StorageError { message, path, source } => match (path, source) {
                (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                (None, None) => write!(f, "Storage error: {}", message),
            },
            MirrorError::ControlPlaneError { message, source } => match source {
                Some(s) => write!(f, "Control plane error: {} (source: {})", message, s),
                None => write!(f, "Control plane error: {}", message),
            },
            MirrorError::LockError { message, path } => match path {
                Some(p) => write!(f, "Lock error: {} (path: {})", message, p),
                None => write!(f, "Lock error: {}", message),
            },
            MirrorError::ConfigError { message, field } => match field {
                Some(field_val) => write!(f, "Config error: {} (field: {})", message, field_val),
                None => write!(f, "Config error: {}", message),
            },
        }
    }
}

impl std::error::Error for MirrorError {}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::StorageError {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        let server_side = err.status().map_or(false, |s| s.is_server_error());
        let retryable = err.is_timeout()
            || err.is_connect()
            || err.is_body()
            || err.is_request()
            || err.is_decode()
            || server_side;
        let message = if err.is_timeout() {
            "Connection timed out".to_string()
        } else if let Some(status) = err.status() {
            format!("HTTP status {}", status)
        } else {
            "HTTP request failed".to_string()
        };

        MirrorError::TransportError {
            message,
            path: err.url().map(|u| u.path().to_string()),
            source: Some(err.to_string()),
            is_retryable: retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_at() {
        let err = MirrorError::malformed_at("unterminated list", 17);
        assert_eq!(err.to_string(), "Malformed metadata: unterminated list (offset: 17)");
        assert!(err.is_torrent_scoped());
    }

    #[test]
    fn test_verification_reasons() {
        let err = MirrorError::verification(VerificationFailure::MissingPath);
        assert_eq!(err.to_string(), "Verification failed: missing/invalid path");

        let err = MirrorError::verification_at(VerificationFailure::HashMismatch, 3);
        assert!(err.to_string().contains("hash mismatch"));
        assert!(err.to_string().contains("piece: 3"));

        let err = MirrorError::verification(VerificationFailure::UnreadablePiece);
        assert!(err.to_string().contains("unable to read piece"));
    }

    #[test]
    fn test_transient_is_retryable() {
        let err = MirrorError::transient("Connection timed out", "read timeout");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("(retryable)"));

        let err = MirrorError::transport_error_with_path("Not found", "/downloads/x");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("/downloads/x"));
    }

    #[test]
    fn test_with_path() {
        let err = MirrorError::transient("reset", "connection reset").with_path("a/b.bin");
        assert!(err.to_string().contains("path: a/b.bin"));
    }

    #[test]
    fn test_is_transient_through_context() {
        use anyhow::Context;

        let result: anyhow::Result<()> = Err(MirrorError::transient("timeout", "elapsed"))
            .context("while reading ranges");
        assert!(is_transient(&result.unwrap_err()));

        let fatal = anyhow::Error::from(MirrorError::storage_error("disk full"));
        assert!(!is_transient(&fatal));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: MirrorError = io_err.into();
        assert!(matches!(err, MirrorError::StorageError { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_config_error_with_field() {
        let err = MirrorError::config_error_with_field("Invalid value", "rewind_margin");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("rewind_margin"));
    }

    #[test]
    fn test_lock_error() {
        let err = MirrorError::lock_error("Another mirror is running (pid 42)", "/tmp/x.lock");
        assert!(err.to_string().contains("pid 42"));
        assert!(!err.is_torrent_scoped());
    }
}
