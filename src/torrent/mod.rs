//! Torrent metadata module
//!
//! Decoding of `.torrent` files into the data needed for verification.

pub mod parser;
pub mod info;

pub use parser::{decode, BencodeValue, TorrentParser};
pub use info::{FileEntry, Layout, TorrentMetadata};
