//! TMDB (The Movie Database) indexer.
//!
//! TMDB requires an API key for access.
//! Rate limits are generous (around 40 requests per second).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{IndexedMetadata, MetadataError, MetadataIndexer};
use crate::item::{
    ExternalIds, Item, ItemMetadata, MediaKind, MetadataUpdate, NewEpisode, NewSeason,
};
use crate::metrics;
use crate::retry::{retry_with_backoff, FetchRetryConfig, RetryPolicy};

const SERVICE: &str = "tmdb";

/// TMDB API client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmdbConfig {
    /// TMDB API key (required).
    pub api_key: String,
    /// Base URL (default: https://api.themoviedb.org/3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Image base URL for posters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base_url: Option<String>,
    /// Country used to pick the content rating.
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: FetchRetryConfig,
}

fn default_region() -> String {
    "US".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// TMDB-backed metadata indexer.
pub struct TmdbIndexer {
    client: Client,
    base_url: String,
    api_key: String,
    image_base_url: String,
    region: String,
    retry: RetryPolicy,
}

impl TmdbIndexer {
    pub fn new(config: TmdbConfig) -> Result<Self, MetadataError> {
        if config.api_key.is_empty() {
            return Err(MetadataError::NotConfigured(
                "TMDB API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let base_url = config
            .base_url
            .unwrap_or_else(|| "https://api.themoviedb.org/3".to_string());
        let image_base_url = config
            .image_base_url
            .unwrap_or_else(|| "https://image.tmdb.org/t/p".to_string());

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            image_base_url: image_base_url.trim_end_matches('/').to_string(),
            region: config.region,
            retry: RetryPolicy::for_fetch(&config.retry),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, MetadataError> {
        retry_with_backoff(&self.retry, SERVICE, || async {
            let started = Instant::now();
            let result = self.send::<T>(path, query).await;
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

    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, MetadataError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "TMDB request");

        let response = self
            .client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str()), ("language", "en-US")])
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(MetadataError::NotConfigured(
                "Invalid TMDB API key".to_string(),
            ));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(MetadataError::NotFound(path.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(MetadataError::RateLimitExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MetadataError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| MetadataError::ParseError(format!("{}: {}", path, e)))
    }

    /// Resolve the TMDB id from the item's ids, then by title search.
    async fn resolve_id(&self, item: &Item) -> Result<u64, MetadataError> {
        if let Some(id) = item.external_ids.tmdb {
            return Ok(id);
        }

        let lookups = [
            (item.external_ids.imdb.clone(), "imdb_id"),
            (item.external_ids.tvdb.map(|id| id.to_string()), "tvdb_id"),
        ];
        for (external_id, source) in lookups {
            let Some(external_id) = external_id else {
                continue;
            };
            let found: FindResponse = self
                .get_json(
                    "find",
                    &format!("/find/{}", external_id),
                    &[("external_source", source)],
                )
                .await?;
            let hit = match item.media_kind {
                MediaKind::Movie => found.movie_results.first(),
                MediaKind::Series => found.tv_results.first(),
            };
            if let Some(hit) = hit {
                return Ok(hit.id);
            }
        }

        let year = item.year.map(|y| y.to_string());
        let (path, year_key) = match item.media_kind {
            MediaKind::Movie => ("/search/movie", "year"),
            MediaKind::Series => ("/search/tv", "first_air_date_year"),
        };
        let mut query = vec![("query", item.title.as_str())];
        if let Some(ref year) = year {
            query.push((year_key, year.as_str()));
        }

        let results: SearchResponse = self.get_json("search", path, &query).await?;
        results
            .results
            .first()
            .map(|hit| hit.id)
            .ok_or_else(|| MetadataError::NotFound(item.display_name()))
    }

    fn poster_url(&self, path: Option<String>) -> Option<String> {
        path.filter(|p| !p.is_empty())
            .map(|p| format!("{}/w500{}", self.image_base_url, p))
    }

    async fn index_movie(&self, tmdb_id: u64) -> Result<IndexedMetadata, MetadataError> {
        let movie: MovieDetails = self
            .get_json(
                "movie",
                &format!("/movie/{}", tmdb_id),
                &[("append_to_response", "external_ids,release_dates")],
            )
            .await?;

        let release_date = parse_date(movie.release_date.as_deref());
        let rating = movie.release_dates.and_then(|dates| {
            dates
                .results
                .into_iter()
                .find(|r| r.iso_3166_1.eq_ignore_ascii_case(&self.region))
                .and_then(|r| {
                    r.release_dates
                        .into_iter()
                        .map(|d| d.certification)
                        .find(|c| !c.is_empty())
                })
        });

        Ok(IndexedMetadata {
            update: MetadataUpdate {
                title: Some(movie.title),
                year: release_date.map(|d| d.year()),
                external_ids: ExternalIds {
                    imdb: movie
                        .external_ids
                        .as_ref()
                        .and_then(|ids| ids.imdb_id.clone())
                        .or(movie.imdb_id),
                    tmdb: Some(tmdb_id),
                    tvdb: movie.external_ids.and_then(|ids| ids.tvdb_id),
                },
                release_date,
                metadata: ItemMetadata {
                    original_title: movie.original_title,
                    description: movie.overview.filter(|o| !o.is_empty()),
                    poster_url: self.poster_url(movie.poster_path),
                    genres: movie.genres.into_iter().map(|g| g.name).collect(),
                    rating,
                    show_status: None,
                },
            },
            seasons: Vec::new(),
        })
    }

    async fn index_series(&self, tmdb_id: u64) -> Result<IndexedMetadata, MetadataError> {
        let show: TvDetails = self
            .get_json(
                "tv",
                &format!("/tv/{}", tmdb_id),
                &[("append_to_response", "external_ids,content_ratings")],
            )
            .await?;

        let mut seasons = Vec::new();
        // Season 0 holds specials; they never gate the pipeline.
        for summary in show.seasons.iter().filter(|s| s.season_number > 0) {
            let season: SeasonDetails = self
                .get_json(
                    "season",
                    &format!("/tv/{}/season/{}", tmdb_id, summary.season_number),
                    &[],
                )
                .await?;
            seasons.push(NewSeason {
                season_number: summary.season_number,
                air_date: parse_date(season.air_date.as_deref()),
                episodes: season
                    .episodes
                    .into_iter()
                    .map(|e| NewEpisode {
                        episode_number: e.episode_number,
                        title: e.name.filter(|n| !n.is_empty()),
                        air_date: parse_date(e.air_date.as_deref()),
                    })
                    .collect(),
            });
        }

        let first_aired = parse_date(show.first_air_date.as_deref());
        let rating = show.content_ratings.and_then(|ratings| {
            ratings
                .results
                .into_iter()
                .find(|r| r.iso_3166_1.eq_ignore_ascii_case(&self.region))
                .map(|r| r.rating)
                .filter(|r| !r.is_empty())
        });

        Ok(IndexedMetadata {
            update: MetadataUpdate {
                title: Some(show.name),
                year: first_aired.map(|d| d.year()),
                external_ids: ExternalIds {
                    imdb: show.external_ids.as_ref().and_then(|ids| ids.imdb_id.clone()),
                    tmdb: Some(tmdb_id),
                    tvdb: show.external_ids.and_then(|ids| ids.tvdb_id),
                },
                release_date: first_aired,
                metadata: ItemMetadata {
                    original_title: show.original_name,
                    description: show.overview.filter(|o| !o.is_empty()),
                    poster_url: self.poster_url(show.poster_path),
                    genres: show.genres.into_iter().map(|g| g.name).collect(),
                    rating,
                    show_status: show.status,
                },
            },
            seasons,
        })
    }
}

#[async_trait]
impl MetadataIndexer for TmdbIndexer {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn index(&self, item: &Item) -> Result<IndexedMetadata, MetadataError> {
        let tmdb_id = self.resolve_id(item).await?;
        debug!(item_id = %item.id, tmdb_id, kind = %item.media_kind, "Indexing item");
        match item.media_kind {
            MediaKind::Movie => self.index_movie(tmdb_id).await,
            MediaKind::Series => self.index_series(tmdb_id).await,
        }
    }
}

/// TMDB sends "" for unknown dates.
fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    value.and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
}

// TMDB API response types (internal)

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    movie_results: Vec<IdOnly>,
    #[serde(default)]
    tv_results: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Genre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExternalIdsResponse {
    imdb_id: Option<String>,
    tvdb_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MovieDetails {
    title: String,
    original_title: Option<String>,
    release_date: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    imdb_id: Option<String>,
    #[serde(default)]
    genres: Vec<Genre>,
    external_ids: Option<ExternalIdsResponse>,
    release_dates: Option<ReleaseDates>,
}

#[derive(Debug, Deserialize)]
struct ReleaseDates {
    #[serde(default)]
    results: Vec<CountryReleases>,
}

#[derive(Debug, Deserialize)]
struct CountryReleases {
    iso_3166_1: String,
    #[serde(default)]
    release_dates: Vec<Certification>,
}

#[derive(Debug, Deserialize)]
struct Certification {
    #[serde(default)]
    certification: String,
}

#[derive(Debug, Deserialize)]
struct TvDetails {
    name: String,
    original_name: Option<String>,
    first_air_date: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    status: Option<String>,
    #[serde(default)]
    genres: Vec<Genre>,
    #[serde(default)]
    seasons: Vec<SeasonSummary>,
    external_ids: Option<ExternalIdsResponse>,
    content_ratings: Option<ContentRatings>,
}

#[derive(Debug, Deserialize)]
struct SeasonSummary {
    season_number: u32,
}

#[derive(Debug, Deserialize)]
struct ContentRatings {
    #[serde(default)]
    results: Vec<ContentRating>,
}

#[derive(Debug, Deserialize)]
struct ContentRating {
    iso_3166_1: String,
    #[serde(default)]
    rating: String,
}

#[derive(Debug, Deserialize)]
struct SeasonDetails {
    air_date: Option<String>,
    #[serde(default)]
    episodes: Vec<EpisodeDetails>,
}

#[derive(Debug, Deserialize)]
struct EpisodeDetails {
    episode_number: u32,
    name: Option<String>,
    air_date: Option<String>,
}
