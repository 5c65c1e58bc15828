//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the seedbox mirror
#[derive(Debug, Clone, Parser)]
#[command(name = "seedbox-mirror")]
#[command(
    about = "Mirror completed torrents from a seedbox and verify them against their piece hashes",
    long_about = None
)]
pub struct CliArgs {
    /// Remote directory holding finished downloads, e.g. `completed`
    #[arg(value_name = "REMOTE_DIR")]
    pub remote_dir: String,

    /// Local directory receiving the mirror
    #[arg(value_name = "LOCAL_DIR")]
    pub local_dir: PathBuf,

    /// Seedbox host name
    #[arg(short = 'H', long)]
    pub host: String,

    /// HTTPS port of the seedbox
    #[arg(short = 'P', long, default_value_t = 443)]
    pub port: u16,

    /// netrc file holding the seedbox credentials (default: ~/.netrc)
    #[arg(short = 'c', long, value_name = "FILE")]
    pub netrc: Option<PathBuf>,

    /// User name, overrides netrc
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password, overrides netrc
    #[arg(short, long)]
    pub password: Option<String>,

    /// Seedbox directory verified torrents are moved to, relative to the path prefix
    #[arg(short = 'T', long, value_name = "DIR")]
    pub move_to: String,

    /// Label set on verified torrents
    #[arg(short = 'L', long, default_value = "Seeding")]
    pub label: String,

    /// Resume partial local files instead of downloading them again
    #[arg(short, long)]
    pub resume: bool,

    /// Do not copy remote permission bits
    #[arg(long)]
    pub no_preserve_permissions: bool,

    /// Do not copy remote access and modification times
    #[arg(long)]
    pub no_preserve_times: bool,

    /// Fail the run when a remote subdirectory cannot be listed
    #[arg(long)]
    pub strict: bool,

    /// Network timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// TCP keepalive interval in seconds
    #[arg(long, default_value_t = 30)]
    pub keepalive: u64,

    /// Bytes discarded from a partial file before resuming after an error
    #[arg(long, default_value_t = 10)]
    pub rewind_margin: u64,

    /// Largest chunk requested from the remote in one read
    #[arg(long, default_value_t = 32768)]
    pub max_request_size: u64,

    /// Retries for failed control-plane requests
    #[arg(long, default_value_t = 10)]
    pub max_retries: u32,

    /// Read the remote tree from this mounted directory instead of HTTPS
    #[arg(long, value_name = "DIR")]
    pub local_source: Option<PathBuf>,

    /// URL of the seedbox download area (default: https://HOST:PORT/downloads/)
    #[arg(long, value_name = "URL")]
    pub downloads_url: Option<String>,

    /// Seedbox path torrents report their data under (default: /torrents/USER)
    #[arg(long, value_name = "PATH")]
    pub path_prefix: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Arguments that identify a run, used to key the run lock
    pub fn lock_key(&self) -> Vec<String> {
        vec![
            self.remote_dir.clone(),
            self.local_dir.display().to_string(),
            self.move_to.clone(),
            self.label.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["seedbox-mirror", "-H", "box.example", "-T", "_completed"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["completed", "/srv/mirror"]);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_values() {
        let args = parse(&[]);

        assert_eq!(args.remote_dir, "completed");
        assert_eq!(args.local_dir, PathBuf::from("/srv/mirror"));
        assert_eq!(args.host, "box.example");
        assert_eq!(args.port, 443);
        assert_eq!(args.label, "Seeding");
        assert_eq!(args.rewind_margin, 10);
        assert_eq!(args.max_request_size, 32768);
        assert!(!args.resume);
        assert!(!args.strict);
        assert!(!args.no_preserve_permissions);
        assert!(args.local_source.is_none());
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_flags() {
        let args = parse(&["-r", "-v", "-u", "me", "-p", "secret", "-L", "Mirrored", "--strict", "--rewind-margin", "0"]);

        assert!(args.resume);
        assert!(args.is_verbose());
        assert_eq!(args.username.as_deref(), Some("me"));
        assert_eq!(args.password.as_deref(), Some("secret"));
        assert_eq!(args.label, "Mirrored");
        assert!(args.strict);
        assert_eq!(args.rewind_margin, 0);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_move_to_is_required() {
        let result = CliArgs::try_parse_from(["seedbox-mirror", "-H", "box.example", "completed", "/srv/mirror"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_lock_key_changes_with_arguments() {
        let a = parse(&[]);
        let mut b = a.clone();
        b.remote_dir = "other".to_string();

        assert_eq!(a.lock_key(), parse(&["-v"]).lock_key());
        assert_ne!(a.lock_key(), b.lock_key());
    }
}
