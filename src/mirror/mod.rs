//! Mirror run
//!
//! Transfer engine, run lock and the orchestrator tying them to the
//! control plane.

pub mod lock;
pub mod orchestrator;
pub mod transfer;

pub use lock::{lock_path, RunLock};
pub use orchestrator::{select_torrents, MatchedTorrent, MirrorReport, MirrorSettings, Orchestrator};
pub use transfer::{
    plan_transfer, resume_ranges, FileOutcome, TransferEngine, TransferOptions, TransferPlan, TransferStats,
};
