//! HTTPS channel to a seedbox download area
//!
//! Directories are listed through the web server's JSON autoindex (nginx
//! `autoindex_format json`). Whole files are streamed with plain GETs and
//! resumption uses `Range` requests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use reqwest::header::{ACCEPT, RANGE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};
use url::Url;

use anyhow::Result;

use super::{resolve_remote, RemoteChannel, RemoteEntry};
use crate::error::MirrorError;

/// Mode reported for autoindex directories
const DIRECTORY_MODE: u32 = 0o040755;
/// Mode reported for autoindex files
const FILE_MODE: u32 = 0o100644;

/// Connection settings for [`HttpChannel`]
#[derive(Debug, Clone)]
pub struct HttpChannelConfig {
    /// Root of the download area, e.g. `https://host/downloads/`
    pub base_url: Url,
    /// Basic auth user
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Connect and read timeout
    pub timeout: Duration,
    /// TCP keepalive interval
    pub keepalive: Duration,
    /// Largest range fetched per request
    pub max_request_size: u64,
}

/// One entry of an nginx JSON autoindex
#[derive(Debug, Deserialize)]
struct AutoindexEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mtime: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Remote channel over HTTPS
pub struct HttpChannel {
    config: HttpChannelConfig,
    client: reqwest::Client,
    cwd: String,
    generation: u32,
}

fn build_client(config: &HttpChannelConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(config.timeout)
        .read_timeout(config.timeout)
        .tcp_keepalive(config.keepalive)
        .build()
        .map_err(MirrorError::from)?;
    Ok(client)
}

/// Build the URL of `path`, resolved against `cwd`, under `base`
///
/// Every path segment is percent-encoded, so names containing `#`, `?` or
/// spaces survive. Directory URLs get a trailing slash.
fn url_for(base: &Url, cwd: &str, path: &str, directory: bool) -> Result<Url> {
    let absolute = resolve_remote(cwd, path);
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| MirrorError::config_error_with_field("URL cannot be a base", "downloads_url"))?;
        segments.pop_if_empty();
        for part in absolute.split('/').filter(|p| !p.is_empty()) {
            segments.push(part);
        }
        if directory {
            segments.push("");
        }
    }
    Ok(url)
}

fn parse_mtime(value: Option<&str>) -> SystemTime {
    value
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(SystemTime::from)
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Decode an autoindex body into entries, in server order
fn parse_listing(body: &[u8], path: &str) -> Result<Vec<RemoteEntry>> {
    let raw: Vec<AutoindexEntry> = serde_json::from_slice(body).map_err(|e| {
        MirrorError::TransportError {
            message: "Directory listing is not a JSON autoindex".to_string(),
            path: Some(path.to_string()),
            source: Some(e.to_string()),
            is_retryable: false,
        }
    })?;

    Ok(raw
        .into_iter()
        .filter_map(|item| {
            let mode_bits = match item.kind.as_str() {
                "directory" => DIRECTORY_MODE,
                "file" => FILE_MODE,
                other => {
                    debug!("Ignoring {} entry {}", other, item.name);
                    return None;
                }
            };
            let mtime = parse_mtime(item.mtime.as_deref());
            Some(RemoteEntry {
                relative_path: item.name,
                size: item.size.unwrap_or(0),
                mode_bits,
                mtime,
                atime: mtime,
            })
        })
        .collect())
}

impl HttpChannel {
    /// Create a channel
    ///
    /// # Arguments
    /// * `config` - Base URL, credentials and timeouts
    ///
    /// # Example
    /// ```ignore
    /// let channel = HttpChannel::connect(config)?;
    /// ```
    pub fn connect(config: HttpChannelConfig) -> Result<Self> {
        let client = build_client(&config)?;
        info!("Using download area {}", config.base_url);
        Ok(Self {
            config,
            client,
            cwd: "/".to_string(),
            generation: 0,
        })
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.config.username {
            Some(user) => request.basic_auth(user, self.config.password.as_ref()),
            None => request,
        }
    }

    async fn fetch(&self, url: Url, path: &str) -> Result<reqwest::Response> {
        let response = self
            .get(url)
            .send()
            .await
            .map_err(|e| MirrorError::from(e).with_path(path))?;
        let response = response
            .error_for_status()
            .map_err(|e| MirrorError::from(e).with_path(path))?;
        Ok(response)
    }
}

#[async_trait]
impl RemoteChannel for HttpChannel {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let url = url_for(&self.config.base_url, &self.cwd, path, true)?;
        trace!("GET {}", url);
        let response = self
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| MirrorError::from(e).with_path(path))?
            .error_for_status()
            .map_err(|e| MirrorError::from(e).with_path(path))?;
        let body = response.bytes().await.map_err(|e| MirrorError::from(e).with_path(path))?;
        parse_listing(&body, path)
    }

    async fn read_file(
        &mut self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        on_chunk: &mut (dyn FnMut(usize) + Send),
    ) -> Result<u64> {
        let url = url_for(&self.config.base_url, &self.cwd, path, false)?;
        debug!("GET {}", url);
        let mut response = self.fetch(url, path).await?;
        let mut total = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MirrorError::from(e).with_path(path))?
        {
            sink.write_all(&chunk).await.map_err(|e| {
                MirrorError::storage_error_full("Failed to write local file", path, e.to_string())
            })?;
            total += chunk.len() as u64;
            on_chunk(chunk.len());
        }

        Ok(total)
    }

    async fn read_ranges(&mut self, path: &str, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        let url = url_for(&self.config.base_url, &self.cwd, path, false)?;
        let mut chunks = Vec::with_capacity(ranges.len());

        for &(offset, length) in ranges {
            if length == 0 {
                chunks.push(Bytes::new());
                continue;
            }
            let response = self
                .get(url.clone())
                .header(RANGE, format!("bytes={}-{}", offset, offset + length - 1))
                .send()
                .await
                .map_err(|e| MirrorError::from(e).with_path(path))?;

            match response.status() {
                StatusCode::PARTIAL_CONTENT => {}
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    // Past the end of the file
                    chunks.push(Bytes::new());
                    continue;
                }
                status if status.is_success() => {
                    warn!("Server ignored Range header for {} ({})", path, status);
                    return Err(MirrorError::transport_error_with_path("Server does not support range requests", path).into());
                }
                status => {
                    response.error_for_status_ref().map_err(|e| MirrorError::from(e).with_path(path))?;
                    return Err(MirrorError::transport_error_with_path(format!("Unexpected status {}", status), path).into());
                }
            }

            let body = response.bytes().await.map_err(|e| MirrorError::from(e).with_path(path))?;
            chunks.push(body);
        }

        Ok(chunks)
    }

    fn max_request_size(&self) -> u64 {
        self.config.max_request_size
    }

    async fn current_dir(&mut self) -> Result<String> {
        Ok(self.cwd.clone())
    }

    async fn change_dir(&mut self, path: &str) -> Result<()> {
        let target = resolve_remote(&self.cwd, path);
        debug!("Changed directory to {}", target);
        self.cwd = target;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        // A fresh client drops every pooled connection
        self.client = build_client(&self.config)?;
        self.cwd = "/".to_string();
        self.generation += 1;
        info!("Reconnected to {} (generation {})", self.config.base_url, self.generation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://seedbox.example/downloads/").unwrap()
    }

    #[test]
    fn test_url_for_encodes_segments() {
        let url = url_for(&base(), "/completed", "Show #1/e 01.mkv", false).unwrap();
        assert_eq!(url.as_str(), "https://seedbox.example/downloads/completed/Show%20%231/e%2001.mkv");
    }

    #[test]
    fn test_url_for_directory_has_trailing_slash() {
        let url = url_for(&base(), "/", "completed", true).unwrap();
        assert_eq!(url.as_str(), "https://seedbox.example/downloads/completed/");

        let url = url_for(&base(), "/completed", ".", true).unwrap();
        assert_eq!(url.as_str(), "https://seedbox.example/downloads/completed/");
    }

    #[test]
    fn test_url_for_absolute_path() {
        let url = url_for(&base(), "/completed", "/other/a.bin", false).unwrap();
        assert_eq!(url.path(), "/downloads/other/a.bin");
    }

    #[test]
    fn test_parse_listing() {
        let body = br#"[
            {"name":"Show","type":"directory","mtime":"Thu, 06 Oct 2022 13:45:12 GMT"},
            {"name":"movie.mkv","type":"file","mtime":"Thu, 06 Oct 2022 13:45:12 GMT","size":1234},
            {"name":"socket","type":"other"}
        ]"#;
        let entries = parse_listing(body, "/completed").unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].relative_path, "movie.mkv");
        assert_eq!(entries[1].size, 1234);
        assert!(!entries[1].is_dir());

        let secs = entries[1].mtime.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1665063912);
    }

    #[test]
    fn test_parse_listing_rejects_html() {
        let err = parse_listing(b"<html>Index of /</html>", "/").unwrap_err();
        assert!(err.to_string().contains("JSON autoindex"));
    }

    #[test]
    fn test_bad_mtime_falls_back_to_epoch() {
        assert_eq!(parse_mtime(Some("yesterday")), SystemTime::UNIX_EPOCH);
        assert_eq!(parse_mtime(None), SystemTime::UNIX_EPOCH);
    }
}
