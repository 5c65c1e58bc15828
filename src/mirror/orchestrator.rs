//! Mirror orchestrator
//!
//! Drives one mirror run: pick the completed torrents under the remote
//! directory, transfer their data, verify it against the `.torrent` files,
//! then move and label the torrents that verified.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::lock::RunLock;
use super::transfer::{TransferEngine, TransferOptions, TransferStats};
use crate::control::{ControlPlane, TorrentSummary};
use crate::remote::{RemoteChannel, RemoteEntry};
use crate::storage::{verify, DirectoryCache};
use crate::torrent::TorrentParser;

/// What a run should mirror and where
#[derive(Debug, Clone)]
pub struct MirrorSettings {
    /// Remote directory holding the data, relative to the channel root
    pub remote_dir: String,
    /// Local directory receiving the data
    pub local_root: PathBuf,
    /// Seedbox path the control plane reports data under, e.g. `/torrents/<user>`
    pub path_prefix: String,
    /// Directory under `path_prefix` verified torrents are moved to
    pub move_to: String,
    /// Label set on verified torrents
    pub label: String,
    /// Fail the run on unlistable subdirectories
    pub strict: bool,
    /// Transfer behaviour
    pub transfer: TransferOptions,
}

impl MirrorSettings {
    /// Base-path prefix of torrents that live in the remote directory
    pub fn look_for(&self) -> String {
        format!(
            "{}/{}/",
            self.path_prefix.trim_end_matches('/'),
            self.remote_dir.trim_matches('/')
        )
    }

    /// Seedbox directory verified torrents are moved to
    pub fn move_target(&self) -> String {
        format!(
            "{}/{}",
            self.path_prefix.trim_end_matches('/'),
            self.move_to.trim_start_matches('/')
        )
    }
}

/// A completed torrent whose data sits in the remote directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedTorrent {
    /// Info hash as the control plane reports it
    pub hash: String,
    /// Name of its data in the remote directory
    pub name: String,
}

/// Result of a mirror run
#[derive(Debug, Clone, Default)]
pub struct MirrorReport {
    /// Torrents selected for mirroring
    pub matched: Vec<MatchedTorrent>,
    /// Hashes whose local data verified
    pub verified: Vec<String>,
    /// Hashes that failed to decode or verify
    pub bad: BTreeSet<String>,
    /// Hashes moved on the seedbox
    pub moved: Vec<String>,
    /// Transfer counters
    pub transfer: TransferStats,
    /// Wall time of the run
    pub elapsed: Duration,
}

impl MirrorReport {
    /// True when no torrent failed verification
    pub fn is_success(&self) -> bool {
        self.bad.is_empty()
    }

    /// Process exit status for this report
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// One mirror run
///
/// Owns the run lock and the directory cache for the duration of the run;
/// both are released when the orchestrator is dropped, including when the
/// run future is cancelled.
pub struct Orchestrator<'a, C: RemoteChannel + ?Sized, P: ControlPlane + ?Sized> {
    channel: &'a mut C,
    control: &'a P,
    settings: &'a MirrorSettings,
    dircache: DirectoryCache,
    lock: Option<RunLock>,
}

/// Completed torrents under `look_for`, in control-plane order
pub fn select_torrents(torrents: &[TorrentSummary], look_for: &str) -> Vec<MatchedTorrent> {
    let mut matched = Vec::new();
    for torrent in torrents {
        if !torrent.base_path.starts_with(look_for) {
            continue;
        }
        if torrent.is_hash_checking {
            debug!("Skipping {}: hash check in progress", torrent.hash);
            continue;
        }
        if torrent.left_bytes > 0 {
            debug!("Skipping {}: {} bytes left", torrent.hash, torrent.left_bytes);
            continue;
        }
        info!("Completed torrent \"{}\" found with hash {}", torrent.name, torrent.hash);
        matched.push(MatchedTorrent {
            hash: torrent.hash.clone(),
            name: torrent.base_name().to_string(),
        });
    }
    matched
}

impl<'a, C: RemoteChannel + ?Sized, P: ControlPlane + ?Sized> Orchestrator<'a, C, P> {
    /// Prepare a run; `lock` is held until the orchestrator is dropped
    pub fn new(channel: &'a mut C, control: &'a P, settings: &'a MirrorSettings, lock: Option<RunLock>) -> Self {
        Self {
            channel,
            control,
            settings,
            dircache: DirectoryCache::new(),
            lock,
        }
    }

    /// Run the whole mirror pass
    pub async fn run(mut self) -> Result<MirrorReport> {
        let started = Instant::now();
        let mut report = MirrorReport::default();
        if let Some(lock) = &self.lock {
            debug!("Running under lock {}", lock.path().display());
        }

        let look_for = self.settings.look_for();
        let torrents = self.control.list_torrents().await.context("Failed to list torrents")?;
        report.matched = select_torrents(&torrents, &look_for);

        if report.matched.is_empty() {
            info!("Nothing found to mirror under {}", look_for);
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        report.transfer = self.transfer_matched(&report.matched).await?;
        report.bad = self.verify_matched(&report.matched).await?;
        for torrent in &report.matched {
            if !report.bad.contains(&torrent.hash) {
                report.verified.push(torrent.hash.clone());
            }
        }

        report.moved = self.move_and_label(&report.verified).await;

        if !report.bad.is_empty() {
            let hashes: Vec<&str> = report.bad.iter().map(String::as_str).collect();
            error!("Could not verify torrent checksums: {}", hashes.join(", "));
        }

        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        report.elapsed = started.elapsed();
        info!("Mirror run finished in {:?}", report.elapsed);
        Ok(report)
    }

    /// Transfer the remote entries that belong to matched torrents
    async fn transfer_matched(&mut self, matched: &[MatchedTorrent]) -> Result<TransferStats> {
        let settings = self.settings;
        let remote_dir = &settings.remote_dir;
        self.channel
            .change_dir(remote_dir)
            .await
            .with_context(|| format!("Failed to enter remote directory {}", remote_dir))?;
        let listing = self
            .channel
            .list_dir(".")
            .await
            .with_context(|| format!("Failed to list remote directory {}", remote_dir))?;

        let wanted: HashMap<&str, &str> = matched.iter().map(|t| (t.name.as_str(), t.hash.as_str())).collect();
        let mut selected: Vec<RemoteEntry> = Vec::new();
        for entry in listing {
            match wanted.get(entry.relative_path.as_str()) {
                Some(hash) => {
                    debug!("{} belongs to {}", entry.relative_path, hash);
                    selected.push(entry);
                }
                None => error!(
                    "File or directory \"{}\" not found in the torrent list",
                    entry.relative_path
                ),
            }
        }
        for torrent in matched {
            if !selected.iter().any(|e| e.relative_path == torrent.name) {
                warn!("No remote data named \"{}\" for {}", torrent.name, torrent.hash);
            }
        }

        let local_root = &settings.local_root;
        let mut engine = TransferEngine::new(&mut *self.channel, &mut self.dircache, &settings.transfer).await?;
        for entry in &selected {
            if entry.is_dir() {
                info!("Mirroring directory {}", entry.relative_path);
                engine.mirror_tree(&entry.relative_path, local_root, settings.strict).await?;
            } else {
                engine.transfer_file(entry, local_root).await?;
            }
        }

        Ok(engine.into_stats())
    }

    /// Verify every matched torrent, returning the hashes that failed
    async fn verify_matched(&self, matched: &[MatchedTorrent]) -> Result<BTreeSet<String>> {
        let mut bad = BTreeSet::new();

        for torrent in matched {
            let bytes = match self.control.get_torrent(&torrent.hash).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Could not fetch metadata for {}: {:#}", torrent.hash, e);
                    bad.insert(torrent.hash.clone());
                    continue;
                }
            };

            let metadata = match TorrentParser::parse_bytes(&bytes) {
                Ok(metadata) => metadata,
                Err(e) => {
                    error!("Could not decode metadata for {}: {}", torrent.hash, e);
                    bad.insert(torrent.hash.clone());
                    continue;
                }
            };

            if let Some(info_hash) = metadata.info_hash_hex() {
                if !info_hash.eq_ignore_ascii_case(&torrent.hash) {
                    warn!("Metadata for {} hashes to {}", torrent.hash, info_hash);
                }
            }

            info!("Verifying {} ({})", metadata.name, torrent.hash);
            let local_root = self.settings.local_root.clone();
            let outcome = tokio::task::spawn_blocking(move || verify(&metadata, &local_root)).await;

            match outcome {
                Ok(Ok(report)) => debug!("{}: {} pieces verified", torrent.hash, report.pieces_checked),
                Ok(Err(e)) => {
                    error!("{}: {}", torrent.hash, e);
                    bad.insert(torrent.hash.clone());
                }
                Err(e) => {
                    error!("{}: verification task failed: {}", torrent.hash, e);
                    bad.insert(torrent.hash.clone());
                }
            }
        }

        Ok(bad)
    }

    /// Move verified torrents and label them; failures are logged
    async fn move_and_label(&self, verified: &[String]) -> Vec<String> {
        if verified.is_empty() {
            return Vec::new();
        }

        let target = self.settings.move_target();
        let mut moved = Vec::new();
        for hash in verified {
            match self.control.move_torrent(hash, &target).await {
                Ok(()) => moved.push(hash.clone()),
                Err(e) => error!("Failed to move {} to {}: {:#}", hash, target, e),
            }
        }

        if let Err(e) = self.control.set_label(verified, &self.settings.label).await {
            error!("Failed to label {} torrents: {:#}", verified.len(), e);
        }
        moved
    }
}
