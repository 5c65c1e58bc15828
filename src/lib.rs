//! seedbox-mirror
//!
//! Mirror completed torrents from a seedbox to local storage, resuming
//! interrupted transfers and verifying every piece against the torrent's
//! hash table before the torrent is moved and labelled on the seedbox.

pub mod cli;
pub mod control;
pub mod error;
pub mod mirror;
pub mod remote;
pub mod storage;
pub mod torrent;

pub use error::MirrorError;

pub use cli::{CliArgs, Config, TransferProgress};
pub use control::{ControlPlane, TorrentSummary};
pub use mirror::{MirrorReport, MirrorSettings, Orchestrator, RunLock, TransferEngine, TransferOptions};
pub use remote::{LocalChannel, RemoteChannel, RemoteEntry, RemoteWalker};
pub use storage::{verify, DirectoryCache, PieceReader, VerifyReport};
pub use torrent::{TorrentMetadata, TorrentParser};
