//! Storage module
//!
//! Local-side concerns of a mirror run: directory creation, piece
//! reconstruction and verification of mirrored files.

pub mod dircache;
pub mod piece;
pub mod verify;

pub use dircache::{create_if_absent, DirStatus, DirectoryCache};
pub use piece::{Piece, PieceReadError, PieceReader};
pub use verify::{constant_time_eq, verify, VerifyReport};
