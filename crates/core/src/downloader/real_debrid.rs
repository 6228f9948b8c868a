//! Real-Debrid client.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DownloadClient, DownloadError, DownloadRequest, DownloadStatus};
use crate::metrics;
use crate::retry::{retry_with_backoff, FetchRetryConfig, RetryPolicy};

const SERVICE: &str = "real_debrid";

/// Real-Debrid client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealDebridConfig {
    /// API token (required).
    pub api_key: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Where the service's files are mounted locally (rclone or similar).
    pub mount_path: PathBuf,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: FetchRetryConfig,
}

fn default_base_url() -> String {
    "https://api.real-debrid.com/rest/1.0".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Real-Debrid implementation of [`DownloadClient`].
pub struct RealDebridClient {
    client: Client,
    config: RealDebridConfig,
    retry: RetryPolicy,
}

impl RealDebridClient {
    pub fn new(config: RealDebridConfig) -> Result<Self, DownloadError> {
        if config.api_key.is_empty() {
            return Err(DownloadError::NotConfigured(
                "Real-Debrid API key is required".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let retry = RetryPolicy::for_fetch(&config.retry);
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn call<T, F>(&self, operation: &str, build: F) -> Result<Option<T>, DownloadError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        retry_with_backoff(&self.retry, SERVICE, || async {
            let started = Instant::now();
            let result = self.send::<T>(build()).await;
            metrics::observe_external(
                SERVICE,
                operation,
                result.is_ok(),
                started.elapsed().as_secs_f64(),
            );
            result
        })
        .await
    }

    /// `Ok(None)` for empty (204) responses.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<T>, DownloadError> {
        let response = request.bearer_auth(&self.config.api_key).send().await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DownloadError::NotConfigured(
                "Invalid Real-Debrid API key".to_string(),
            ));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DownloadError::RateLimitExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DownloadError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| DownloadError::ParseError(e.to_string()))
    }

    async fn find_torrent(&self, hash: &str) -> Result<Option<String>, DownloadError> {
        let torrents: Option<Vec<TorrentSummary>> = self
            .call("list", || {
                self.client
                    .get(self.url("/torrents"))
                    .query(&[("limit", "100")])
            })
            .await?;
        Ok(torrents
            .unwrap_or_default()
            .into_iter()
            .find(|t| t.hash.eq_ignore_ascii_case(hash))
            .map(|t| t.id))
    }

    async fn add_magnet(&self, hash: &str, title: &str) -> Result<String, DownloadError> {
        let magnet = magnet_uri(hash, title);
        let added: Option<AddMagnetResponse> = self
            .call("add_magnet", || {
                self.client
                    .post(self.url("/torrents/addMagnet"))
                    .form(&[("magnet", magnet.as_str())])
            })
            .await?;
        added
            .map(|a| a.id)
            .ok_or_else(|| DownloadError::ParseError("addMagnet returned no body".to_string()))
    }

    async fn info(&self, id: &str) -> Result<TorrentInfo, DownloadError> {
        let path = format!("/torrents/info/{}", id);
        let info: Option<TorrentInfo> = self
            .call("info", || self.client.get(self.url(&path)))
            .await?;
        info.ok_or_else(|| DownloadError::ParseError("info returned no body".to_string()))
    }

    async fn select_all_files(&self, id: &str) -> Result<(), DownloadError> {
        let path = format!("/torrents/selectFiles/{}", id);
        let _: Option<serde_json::Value> = self
            .call("select_files", || {
                self.client
                    .post(self.url(&path))
                    .form(&[("files", "all")])
            })
            .await?;
        Ok(())
    }

    fn status_of(&self, info: &TorrentInfo) -> DownloadStatus {
        match info.status.as_str() {
            "downloaded" => DownloadStatus::Ready {
                local_path: self
                    .config
                    .mount_path
                    .join(&info.filename)
                    .to_string_lossy()
                    .into_owned(),
            },
            "magnet_conversion" | "waiting_files_selection" | "queued" => DownloadStatus::Queued,
            "downloading" | "compressing" | "uploading" => DownloadStatus::Pending {
                progress: info.progress,
            },
            other => DownloadStatus::Failed {
                reason: other.to_string(),
            },
        }
    }
}

/// Magnet link for an info hash, with the release title as display name.
fn magnet_uri(hash: &str, title: &str) -> String {
    if title.is_empty() {
        return format!("magnet:?xt=urn:btih:{}", hash);
    }
    format!(
        "magnet:?xt=urn:btih:{}&dn={}",
        hash,
        urlencoding::encode(title)
    )
}

#[async_trait]
impl DownloadClient for RealDebridClient {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn resolve(&self, request: &DownloadRequest) -> Result<DownloadStatus, DownloadError> {
        let hash = request.source_identifier.as_str();
        let id = match self.find_torrent(hash).await? {
            Some(id) => id,
            None => {
                let id = self.add_magnet(hash, &request.title).await?;
                info!(hash, title = %request.title, torrent_id = %id, "Added magnet");
                id
            }
        };

        let mut info = self.info(&id).await?;
        if info.status == "waiting_files_selection" {
            self.select_all_files(&id).await?;
            info = self.info(&id).await?;
        }

        let status = self.status_of(&info);
        debug!(hash, torrent_id = %id, status = %info.status, "Debrid status");
        Ok(status)
    }
}

#[derive(Debug, Deserialize)]
struct TorrentSummary {
    id: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct AddMagnetResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TorrentInfo {
    #[serde(default)]
    filename: String,
    status: String,
    #[serde(default)]
    progress: f32,
}
