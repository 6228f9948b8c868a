//! Torrentio-style stream endpoint client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::config::TorrentioConfig;
use super::throttle::RequestThrottle;
use super::{CandidateQuery, CandidateSource, SourceError};
use crate::item::MediaKind;
use crate::metrics;
use crate::ranking::RawRelease;
use crate::retry::{retry_with_backoff, RetryPolicy};

const SERVICE: &str = "torrentio";

/// Fetches streams from `{url}[/{options}]/stream/{movie|series}/{id}.json`.
pub struct TorrentioSource {
    client: Client,
    config: TorrentioConfig,
    throttle: RequestThrottle,
    retry: RetryPolicy,
}

impl TorrentioSource {
    pub fn new(config: TorrentioConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let throttle = RequestThrottle::new(
            SERVICE,
            Duration::from_millis(config.min_interval_ms),
            Duration::from_millis(config.max_interval_ms),
        );
        let retry = RetryPolicy::for_fetch(&config.retry);

        Ok(Self {
            client,
            config,
            throttle,
            retry,
        })
    }

    /// Build the stream URL. Series queries address one episode; a season
    /// pack query asks for the first episode, whose listing carries packs.
    pub fn stream_url(&self, query: &CandidateQuery) -> Result<String, SourceError> {
        let id = match (&query.imdb_id, query.tmdb_id) {
            (Some(imdb), _) if !imdb.is_empty() => imdb.clone(),
            (_, Some(tmdb)) => format!("tmdb:{}", tmdb),
            _ => return Err(SourceError::MissingId(query.label())),
        };

        let base = self.config.url.trim_end_matches('/');
        let prefix = match self.config.options.as_deref().map(|o| o.trim_matches('/')) {
            Some(options) if !options.is_empty() => format!("{}/{}", base, options),
            _ => base.to_string(),
        };

        let url = match query.media_kind {
            MediaKind::Movie => format!("{}/stream/movie/{}.json", prefix, id),
            MediaKind::Series => {
                let season = query.season.unwrap_or(1);
                let episode = query.episode.unwrap_or(1);
                format!("{}/stream/series/{}:{}:{}.json", prefix, id, season, episode)
            }
        };
        Ok(url)
    }

    async fn request(&self, url: &str) -> Result<Vec<RawRelease>, SourceError> {
        self.throttle.acquire().await;
        let started = Instant::now();

        let result = self.send(url).await;
        metrics::observe_external(
            SERVICE,
            "stream",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        match &result {
            Ok(_) => self.throttle.on_success().await,
            Err(SourceError::RateLimited(_)) => self.throttle.on_rate_limited().await,
            Err(_) => {}
        }
        result
    }

    async fn send(&self, url: &str) -> Result<Vec<RawRelease>, SourceError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout
            } else {
                SourceError::ConnectionFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited(SERVICE.to_string()));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::ApiError {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let body: StreamResponse = response
            .json()
            .await
            .map_err(|e| SourceError::ParseError(e.to_string()))?;
        Ok(body.into_releases())
    }
}

#[async_trait]
impl CandidateSource for TorrentioSource {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn fetch(&self, query: &CandidateQuery) -> Result<Vec<RawRelease>, SourceError> {
        let url = self.stream_url(query)?;
        debug!(query = %query.label(), url = %url, "Fetching streams");

        let releases = retry_with_backoff(&self.retry, SERVICE, || self.request(&url)).await?;
        debug!(query = %query.label(), count = releases.len(), "Streams fetched");
        Ok(releases)
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    streams: Vec<Stream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stream {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    info_hash: Option<String>,
    #[serde(default)]
    behavior_hints: Option<BehaviorHints>,
}

#[derive(Debug, Deserialize)]
struct BehaviorHints {
    #[serde(default)]
    filename: Option<String>,
}

impl StreamResponse {
    /// Streams without an info hash cannot be downloaded and are dropped.
    fn into_releases(self) -> Vec<RawRelease> {
        self.streams
            .into_iter()
            .filter_map(|stream| {
                let hash = stream.info_hash.filter(|h| !h.is_empty())?;
                Some(RawRelease {
                    source_identifier: hash.to_ascii_lowercase(),
                    title: stream.title,
                    name: stream.name,
                    filename: stream.behavior_hints.and_then(|h| h.filename),
                    seeders: None,
                    size_bytes: None,
                })
            })
            .collect()
    }
}
