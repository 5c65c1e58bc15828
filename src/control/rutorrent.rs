//! ruTorrent control plane client
//!
//! Talks to the ruTorrent web UI of a seedbox through its plugin endpoints:
//! `multirpc` for listing and labelling, `source` for `.torrent` files and
//! `datadir` for moving data.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use anyhow::Result;

use super::{ControlPlane, TorrentSummary};
use crate::error::MirrorError;

/// Positions within a `d.multicall` row, counted after the hash key
const FIELD_IS_HASH_CHECKING: usize = 1;
const FIELD_NAME: usize = 4;
const FIELD_SIZE_BYTES: usize = 5;
const FIELD_LABEL: usize = 14;
const FIELD_LEFT_BYTES: usize = 19;
const FIELD_BASE_PATH: usize = 25;

/// Connection settings for [`RuTorrentClient`]
#[derive(Debug, Clone)]
pub struct RuTorrentConfig {
    /// Web root of the seedbox, e.g. `https://host/`
    pub base_url: Url,
    /// Basic auth user
    pub username: String,
    /// Basic auth password
    pub password: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries for failed requests
    pub max_retries: u32,
    /// First retry delay, doubled on each further retry
    pub backoff: Duration,
    /// Extra rounds for labels the server silently dropped
    pub label_retries: u32,
}

/// ruTorrent HTTP client
pub struct RuTorrentClient {
    config: RuTorrentConfig,
    client: reqwest::Client,
}

fn field<'a>(row: &'a [Value], index: usize, hash: &str) -> Result<&'a str> {
    row.get(index).and_then(Value::as_str).map(str::trim).ok_or_else(|| {
        MirrorError::control_plane_error(format!("Torrent {} is missing field {}", hash, index)).into()
    })
}

fn number(row: &[Value], index: usize, hash: &str) -> Result<u64> {
    let raw = field(row, index, hash)?;
    raw.parse::<u64>().map_err(|e| {
        MirrorError::control_plane_error_with_source(format!("Torrent {} field {} is not a number: {}", hash, index, raw), e.to_string())
            .into()
    })
}

/// Decode the body of a `mode=list` request
pub fn parse_torrent_list(body: &Value) -> Result<Vec<TorrentSummary>> {
    let rows = body.get("t").and_then(Value::as_object).ok_or_else(|| {
        debug!("Returned: {}", body);
        MirrorError::control_plane_error("Unexpected type in torrent list response")
    })?;

    let mut torrents = Vec::with_capacity(rows.len());
    for (hash, row) in rows {
        let row = row.as_array().ok_or_else(|| {
            MirrorError::control_plane_error(format!("Torrent {} is not an array", hash))
        })?;
        torrents.push(TorrentSummary {
            hash: hash.clone(),
            name: field(row, FIELD_NAME, hash)?.to_string(),
            base_path: field(row, FIELD_BASE_PATH, hash)?.to_string(),
            label: field(row, FIELD_LABEL, hash)?.to_string(),
            size_bytes: number(row, FIELD_SIZE_BYTES, hash)?,
            left_bytes: number(row, FIELD_LEFT_BYTES, hash)?,
            is_hash_checking: number(row, FIELD_IS_HASH_CHECKING, hash)? != 0,
        });
    }
    Ok(torrents)
}

/// Whether a `datadir` reply carries a non-empty `errors` field
fn has_errors(body: &Value) -> bool {
    match body.get("errors") {
        None | Some(Value::Null) => false,
        Some(Value::Array(errors)) => !errors.is_empty(),
        Some(Value::String(error)) => !error.is_empty(),
        Some(Value::Bool(flag)) => *flag,
        Some(_) => true,
    }
}

/// Whether a `setlabel` reply has an entry for every hash sent
fn label_reply_complete(reply: &Value, sent: usize) -> bool {
    reply.as_array().map_or(0, Vec::len) == sent
}

/// Hashes among `wanted` that the listing shows without `label`
///
/// Hashes missing from the listing are left alone; the torrent is gone.
fn still_unlabelled(torrents: &[TorrentSummary], wanted: &[String], label: &str) -> Vec<String> {
    torrents
        .iter()
        .filter(|t| wanted.contains(&t.hash) && t.label != label)
        .map(|t| t.hash.clone())
        .collect()
}

/// Body of a `mode=setlabel` request
///
/// Every hash gets a `hash=` pair, then one `v=<label>` and one `s=label`
/// pair per hash.
pub fn set_label_body(hashes: &[String], label: &str) -> String {
    let mut body = String::from("mode=setlabel");
    for hash in hashes {
        body.push_str("&hash=");
        body.push_str(&urlencoding::encode(hash));
    }
    let value = urlencoding::encode(label);
    for _ in hashes {
        body.push_str("&v=");
        body.push_str(&value);
    }
    for _ in hashes {
        body.push_str("&s=label");
    }
    body
}

impl RuTorrentClient {
    /// Create a client
    pub fn new(config: RuTorrentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(MirrorError::from)?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config.base_url.join(path).map_err(|e| {
            MirrorError::config_error_with_field(format!("Invalid endpoint {}: {}", path, e), "host").into()
        })
    }

    fn multirpc(&self) -> Result<Url> {
        self.endpoint("rtorrent/plugins/multirpc/action.php")
    }

    /// Send a request, retrying retryable failures with exponential backoff
    async fn send<F>(&self, what: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut delay = self.config.backoff;
        let mut attempt = 0u32;

        loop {
            let result = build()
                .basic_auth(&self.config.username, Some(&self.config.password))
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let err = MirrorError::from(e);
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(MirrorError::control_plane_error_with_source(
                            format!("{} failed", what),
                            err.to_string(),
                        )
                        .into());
                    }
                    attempt += 1;
                    warn!("{} failed ({}), retry {} of {} in {:?}", what, err, attempt, self.config.max_retries, delay);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn post_label(&self, hashes: &[String], label: &str) -> Result<Value> {
        let url = self.multirpc()?;
        let body = set_label_body(hashes, label);
        debug!("set_label with data: {}", body);
        let response = self
            .send("Set label", || {
                self.client
                    .request(Method::POST, url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body.clone())
            })
            .await?;
        Ok(response.json::<Value>().await.map_err(MirrorError::from)?)
    }
}

#[async_trait]
impl ControlPlane for RuTorrentClient {
    async fn list_torrents(&self) -> Result<Vec<TorrentSummary>> {
        let url = self.multirpc()?;
        let response = self
            .send("List torrents", || {
                self.client
                    .post(url.clone())
                    .form(&[("mode", "list"), ("cmd", "d.custom=seedingtime")])
            })
            .await?;
        let body: Value = response.json().await.map_err(MirrorError::from)?;
        let torrents = parse_torrent_list(&body)?;
        debug!("Control plane reports {} torrents", torrents.len());
        Ok(torrents)
    }

    async fn get_torrent(&self, hash: &str) -> Result<Vec<u8>> {
        let mut url = self.endpoint("rtorrent/plugins/source/action.php")?;
        url.set_query(Some(&format!("hash={}", urlencoding::encode(hash))));
        let response = self.send("Get torrent", || self.client.get(url.clone())).await?;
        let bytes = response.bytes().await.map_err(MirrorError::from)?;
        debug!("Fetched {} bytes of metadata for {}", bytes.len(), hash);
        Ok(bytes.to_vec())
    }

    async fn move_torrent(&self, hash: &str, target_dir: &str) -> Result<()> {
        let url = self.endpoint("rtorrent/plugins/datadir/action.php")?;
        let form = [
            ("hash", hash),
            ("datadir", target_dir),
            ("move_addpath", "1"),
            ("move_datafiles", "1"),
            ("move_fastresume", "1"),
        ];
        let response = self
            .send("Move torrent", || self.client.post(url.clone()).form(&form))
            .await?;
        let body: Value = response.json().await.map_err(MirrorError::from)?;

        if has_errors(&body) {
            return Err(MirrorError::control_plane_error(format!("Move of {} rejected: {}", hash, body["errors"])).into());
        }
        info!("Moved {} to {}", hash, target_dir);
        Ok(())
    }

    async fn set_label(&self, hashes: &[String], label: &str) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }

        let mut pending = hashes.to_vec();
        let mut round = 0u32;
        loop {
            let reply = self.post_label(&pending, label).await?;
            if label_reply_complete(&reply, pending.len()) {
                info!("Labelled {} torrents '{}'", pending.len(), label);
                return Ok(());
            }

            // The server sometimes drops part of a batch without complaint
            warn!("Label reply covered only part of {} torrents: {}", pending.len(), reply);
            if round >= self.config.label_retries {
                warn!("Giving up on labels after {} retries", round);
                return Ok(());
            }
            round += 1;

            pending = still_unlabelled(&self.list_torrents().await?, hashes, label);
            if pending.is_empty() {
                debug!("All labels are in place");
                return Ok(());
            }
            info!("Labelling {} torrents again ({} of {})", pending.len(), round, self.config.label_retries);
        }
    }
}
