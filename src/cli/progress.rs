//! Progress reporting module
//!
//! Periodic transfer progress goes to the log; the end-of-run summary goes
//! to stdout.

use std::time::{Duration, Instant};
use tracing::info;

use crate::mirror::MirrorReport;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Calculate ETA based on transfer speed and remaining bytes
pub fn calculate_eta(transferred: u64, total: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || transferred >= total {
        return None;
    }

    let remaining = total.saturating_sub(transferred) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

/// Progress of a single file transfer, logged at a fixed interval
#[derive(Debug)]
pub struct TransferProgress {
    /// Remote path being transferred
    name: String,
    /// Bytes already present locally when the attempt started
    base: u64,
    /// Bytes received during this attempt
    received: u64,
    /// Expected file size
    total: u64,
    started: Instant,
    last_report: Instant,
    interval: Duration,
}

impl TransferProgress {
    /// Start tracking a transfer of `total` bytes, `base` of which are already local
    pub fn new(name: impl Into<String>, base: u64, total: u64, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            base,
            received: 0,
            total,
            started: now,
            last_report: now,
            interval,
        }
    }

    /// Account for `bytes` more received; logs once per interval
    pub fn record(&mut self, bytes: usize) {
        self.received += bytes as u64;
        if self.last_report.elapsed() >= self.interval {
            self.last_report = Instant::now();
            self.report();
        }
    }

    /// Bytes received during this attempt
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Average speed of this attempt in bytes per second
    pub fn speed(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.received as f64 / secs
        } else {
            0.0
        }
    }

    fn report(&self) {
        let done = self.base + self.received;
        let eta = calculate_eta(done, self.total, self.speed())
            .map(format_duration)
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "{}: Downloaded {} / {} in {} ({}, ETA {})",
            self.name,
            format_bytes(done),
            format_bytes(self.total),
            format_duration(self.started.elapsed()),
            format_speed(self.speed()),
            eta
        );
    }

    /// Log the final figures of this attempt
    pub fn finish(&self) {
        info!(
            "{}: Downloaded {} in {} ({})",
            self.name,
            format_bytes(self.received),
            format_duration(self.started.elapsed()),
            format_speed(self.speed())
        );
    }
}

/// Print the end-of-run summary
pub fn print_summary(report: &MirrorReport) {
    println!();
    println!("Mirror Summary:");
    println!("  Torrents matched: {}", report.matched.len());
    println!(
        "  Files transferred: {} ({})",
        report.transfer.files_transferred,
        format_bytes(report.transfer.bytes_transferred)
    );
    println!("  Files up to date: {}", report.transfer.files_up_to_date);
    if report.transfer.files_skipped > 0 {
        println!("  Files skipped: {}", report.transfer.files_skipped);
    }
    if report.transfer.reconnects > 0 {
        println!("  Reconnects: {}", report.transfer.reconnects);
    }
    println!("  Verified: {}", report.verified.len());
    println!("  Moved: {}", report.moved.len());
    if !report.bad.is_empty() {
        println!("  Failed verification:");
        for hash in &report.bad {
            println!("    {}", hash);
        }
    }
    println!("  Elapsed Time: {}", format_duration(report.elapsed));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(calculate_eta(50, 100, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(calculate_eta(100, 100, 10.0), None);
        assert_eq!(calculate_eta(50, 100, 0.0), None);
    }

    #[test]
    fn test_transfer_progress_counts() {
        let mut progress = TransferProgress::new("a.bin", 100, 1000, Duration::from_secs(60));
        progress.record(300);
        progress.record(200);
        assert_eq!(progress.received(), 500);
    }
}
