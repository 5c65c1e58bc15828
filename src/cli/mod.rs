//! CLI module
//!
//! Command-line interface for the seedbox mirror.

pub mod args;
pub mod config;
pub mod netrc;
pub mod progress;

pub use args::CliArgs;
pub use config::Config;
pub use netrc::{credentials_for, Credentials};
pub use progress::{format_bytes, format_duration, format_speed, print_summary, TransferProgress};
