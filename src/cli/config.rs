//! CLI configuration module
//!
//! Turns parsed arguments and the netrc file into the validated runtime
//! configuration.

use crate::cli::args::CliArgs;
use crate::cli::netrc;
use crate::error::MirrorError;
use crate::mirror::{lock_path, MirrorSettings, TransferOptions};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

#[cfg(feature = "http")]
use crate::control::RuTorrentConfig;
#[cfg(feature = "http")]
use crate::remote::HttpChannelConfig;

/// Extra rounds for labels the server drops
const LABEL_RETRIES: u32 = 5;

/// Configuration for a mirror run
#[derive(Debug, Clone)]
pub struct Config {
    /// Seedbox host name
    pub host: String,
    /// HTTPS port
    pub port: u16,
    /// Seedbox user
    pub username: String,
    /// Seedbox password
    pub password: String,
    /// Remote directory to mirror
    pub remote_dir: String,
    /// Local mirror root
    pub local_dir: PathBuf,
    /// Seedbox directory verified torrents are moved to
    pub move_to: String,
    /// Label set on verified torrents
    pub label: String,
    /// Resume partial files
    pub resume: bool,
    /// Copy remote permission bits
    pub preserve_permissions: bool,
    /// Copy remote times
    pub preserve_times: bool,
    /// Fail on unlistable subdirectories
    pub strict: bool,
    /// Network timeout
    pub timeout: Duration,
    /// TCP keepalive interval
    pub keepalive: Duration,
    /// Bytes discarded before resuming after an error
    pub rewind_margin: u64,
    /// Largest chunk per remote read
    pub max_request_size: u64,
    /// Retries for control-plane requests
    pub max_retries: u32,
    /// Mounted remote tree used instead of HTTPS
    pub local_source: Option<PathBuf>,
    /// Web root of the seedbox, where ruTorrent lives
    pub web_root: Url,
    /// Download area of the seedbox
    pub downloads_url: Url,
    /// Seedbox path torrents report their data under
    pub path_prefix: String,
    /// Arguments keying the run lock
    pub lock_key: Vec<String>,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

fn config_error(message: String, field: &str) -> MirrorError {
    error!("{}", message);
    MirrorError::config_error_with_field(message, field)
}

fn parse_url(raw: &str, field: &str) -> Result<Url, MirrorError> {
    let mut raw = raw.to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| config_error(format!("Invalid URL {}: {}", raw, e), field))
}

impl Config {
    /// Create configuration from CLI arguments, reading the netrc file when
    /// the credentials are not all given as flags
    pub fn from_args(args: &CliArgs) -> Result<Self, MirrorError> {
        let netrc = if args.username.is_some() && args.password.is_some() {
            None
        } else {
            let path = match &args.netrc {
                Some(path) => path.clone(),
                None => std::env::var_os("HOME")
                    .map(|home| PathBuf::from(home).join(".netrc"))
                    .ok_or_else(|| config_error("HOME is not set, pass --netrc".to_string(), "netrc"))?,
            };
            debug!("Reading credentials from {}", path.display());
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| config_error(format!("Failed to read {}: {}", path.display(), e), "netrc"))?;
            Some(contents)
        };

        Self::from_args_with_netrc(args, netrc.as_deref())
    }

    /// Create configuration from CLI arguments and netrc contents
    pub fn from_args_with_netrc(args: &CliArgs, netrc: Option<&str>) -> Result<Self, MirrorError> {
        let from_netrc = netrc.and_then(|contents| netrc::credentials_for(contents, &args.host));
        let username = args
            .username
            .clone()
            .or_else(|| from_netrc.as_ref().map(|c| c.login.clone()))
            .ok_or_else(|| config_error(format!("No login for {}", args.host), "username"))?;
        let password = args
            .password
            .clone()
            .or_else(|| from_netrc.as_ref().map(|c| c.password.clone()))
            .ok_or_else(|| config_error(format!("No password for {}", args.host), "password"))?;

        let web_root = parse_url(&format!("https://{}:{}", args.host, args.port), "host")?;
        let downloads_url = match &args.downloads_url {
            Some(raw) => parse_url(raw, "downloads_url")?,
            None => web_root
                .join("downloads/")
                .map_err(|e| config_error(format!("Invalid download URL: {}", e), "downloads_url"))?,
        };
        let path_prefix = args
            .path_prefix
            .clone()
            .unwrap_or_else(|| format!("/torrents/{}", username));

        Ok(Self {
            host: args.host.clone(),
            port: args.port,
            username,
            password,
            remote_dir: args.remote_dir.trim_matches('/').to_string(),
            local_dir: args.local_dir.clone(),
            move_to: args.move_to.clone(),
            label: args.label.clone(),
            resume: args.resume,
            preserve_permissions: !args.no_preserve_permissions,
            preserve_times: !args.no_preserve_times,
            strict: args.strict,
            timeout: Duration::from_secs(args.timeout),
            keepalive: Duration::from_secs(args.keepalive),
            rewind_margin: args.rewind_margin,
            max_request_size: args.max_request_size,
            max_retries: args.max_retries,
            local_source: args.local_source.clone(),
            web_root,
            downloads_url,
            path_prefix,
            lock_key: args.lock_key(),
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(config_error("host cannot be empty".to_string(), "host").into());
        }

        if self.remote_dir.is_empty() {
            return Err(config_error("remote directory cannot be the download root".to_string(), "remote_dir").into());
        }

        if self.remote_dir.split('/').any(|part| part == "..") {
            return Err(config_error(format!("remote directory {} leaves the download area", self.remote_dir), "remote_dir").into());
        }

        if self.local_dir.as_os_str().is_empty() {
            return Err(config_error("local directory cannot be empty".to_string(), "local_dir").into());
        }

        if self.move_to.trim_matches('/').is_empty() {
            return Err(config_error("move target cannot be empty".to_string(), "move_to").into());
        }

        if self.max_request_size == 0 {
            return Err(config_error("max_request_size must be at least 1".to_string(), "max_request_size").into());
        }

        if self.timeout == Duration::ZERO {
            return Err(config_error("timeout must be at least 1 second".to_string(), "timeout").into());
        }

        if let Some(source) = &self.local_source {
            if !source.is_dir() {
                return Err(config_error(format!("{} is not a directory", source.display()), "local_source").into());
            }
        }

        Ok(())
    }

    /// Transfer engine options
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            resume: self.resume,
            preserve_modes: self.preserve_permissions,
            preserve_times: self.preserve_times,
            rewind_margin: self.rewind_margin,
            ..TransferOptions::default()
        }
    }

    /// Settings for the orchestrator
    pub fn mirror_settings(&self) -> MirrorSettings {
        MirrorSettings {
            remote_dir: self.remote_dir.clone(),
            local_root: self.local_dir.clone(),
            path_prefix: self.path_prefix.clone(),
            move_to: self.move_to.clone(),
            label: self.label.clone(),
            strict: self.strict,
            transfer: self.transfer_options(),
        }
    }

    /// Run lock location for this host and these arguments
    pub fn lock_path(&self) -> PathBuf {
        lock_path(&self.host, &self.lock_key)
    }

    /// ruTorrent client settings
    #[cfg(feature = "http")]
    pub fn rutorrent_config(&self) -> RuTorrentConfig {
        RuTorrentConfig {
            base_url: self.web_root.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: self.timeout,
            max_retries: self.max_retries,
            backoff: Duration::from_secs(1),
            label_retries: LABEL_RETRIES,
        }
    }

    /// HTTPS remote channel settings
    #[cfg(feature = "http")]
    pub fn http_channel_config(&self) -> HttpChannelConfig {
        HttpChannelConfig {
            base_url: self.downloads_url.clone(),
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            timeout: self.timeout,
            keepalive: self.keepalive,
            max_request_size: self.max_request_size,
        }
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const NETRC: &str = "machine box.example login alice password s3cret\n";

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["seedbox-mirror", "-H", "box.example", "-T", "_completed"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["/completed/", "/srv/mirror"]);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_from_netrc() {
        let config = Config::from_args_with_netrc(&args(&[]), Some(NETRC)).unwrap();

        assert_eq!(config.username, "alice");
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.remote_dir, "completed");
        assert_eq!(config.path_prefix, "/torrents/alice");
        assert_eq!(config.web_root.as_str(), "https://box.example/");
        assert_eq!(config.downloads_url.as_str(), "https://box.example/downloads/");
        assert!(config.preserve_permissions);
        assert!(config.preserve_times);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_netrc() {
        let config = Config::from_args_with_netrc(&args(&["-u", "bob", "--path-prefix", "/data"]), Some(NETRC)).unwrap();

        assert_eq!(config.username, "bob");
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.path_prefix, "/data");
    }

    #[test]
    fn test_missing_credentials() {
        let err = Config::from_args_with_netrc(&args(&[]), Some("machine elsewhere login x password y")).unwrap_err();
        assert!(matches!(err, MirrorError::ConfigError { .. }));

        let err = Config::from_args_with_netrc(&args(&["-u", "bob"]), None).unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_urls() {
        let config = Config::from_args_with_netrc(
            &args(&["-P", "8443", "--downloads-url", "https://cdn.example/files"]),
            Some(NETRC),
        )
        .unwrap();

        assert_eq!(config.web_root.as_str(), "https://box.example:8443/");
        assert_eq!(config.downloads_url.as_str(), "https://cdn.example/files/");
    }

    #[test]
    fn test_mirror_settings() {
        let config = Config::from_args_with_netrc(
            &args(&["-r", "--no-preserve-times", "--rewind-margin", "64"]),
            Some(NETRC),
        )
        .unwrap();
        let settings = config.mirror_settings();

        assert_eq!(settings.look_for(), "/torrents/alice/completed/");
        assert_eq!(settings.move_target(), "/torrents/alice/_completed");
        assert!(settings.transfer.resume);
        assert!(settings.transfer.preserve_modes);
        assert!(!settings.transfer.preserve_times);
        assert_eq!(settings.transfer.rewind_margin, 64);
    }

    #[test]
    fn test_config_validate_invalid() {
        let base = Config::from_args_with_netrc(&args(&[]), Some(NETRC)).unwrap();

        let mut config = base.clone();
        config.remote_dir = String::new();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.remote_dir = "completed/../..".to_string();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.max_request_size = 0;
        assert!(config.validate().is_err());

        let mut config = base;
        config.local_source = Some(PathBuf::from("/definitely/not/here"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_path_follows_arguments() {
        let a = Config::from_args_with_netrc(&args(&[]), Some(NETRC)).unwrap();
        let b = Config::from_args_with_netrc(&args(&["-v"]), Some(NETRC)).unwrap();
        let c = Config::from_args_with_netrc(&args(&["-L", "Other"]), Some(NETRC)).unwrap();

        assert_eq!(a.lock_path(), b.lock_path());
        assert_ne!(a.lock_path(), c.lock_path());
    }
}
