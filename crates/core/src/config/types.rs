use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::downloader::RealDebridConfig;
use crate::library::LibraryConfig;
use crate::metadata::TmdbConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::ranking::RankingConfig;
use crate::source::TorrentioConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    /// Metadata indexer. Without it the index stage is not scheduled.
    #[serde(default)]
    pub tmdb: Option<TmdbConfig>,
    #[serde(default)]
    pub torrentio: TorrentioConfig,
    /// Debrid service. Without it the download stage is not scheduled.
    #[serde(default)]
    pub real_debrid: Option<RealDebridConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("reelflow.db")
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub ranking: RankingConfig,
    pub library: LibraryConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<SanitizedTmdbConfig>,
    pub torrentio: TorrentioConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_debrid: Option<SanitizedRealDebridConfig>,
}

/// Sanitized TMDB config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedTmdbConfig {
    pub api_key_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub region: String,
    pub timeout_secs: u64,
}

/// Sanitized Real-Debrid config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedRealDebridConfig {
    pub api_key_configured: bool,
    pub base_url: String,
    pub mount_path: PathBuf,
    pub timeout_secs: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            orchestrator: config.orchestrator.clone(),
            ranking: config.ranking.clone(),
            library: config.library.clone(),
            tmdb: config.tmdb.as_ref().map(|t| SanitizedTmdbConfig {
                api_key_configured: !t.api_key.is_empty(),
                base_url: t.base_url.clone(),
                region: t.region.clone(),
                timeout_secs: t.timeout_secs,
            }),
            torrentio: config.torrentio.clone(),
            real_debrid: config.real_debrid.as_ref().map(|rd| SanitizedRealDebridConfig {
                api_key_configured: !rd.api_key.is_empty(),
                base_url: rd.base_url.clone(),
                mount_path: rd.mount_path.clone(),
                timeout_secs: rd.timeout_secs,
            }),
        }
    }
}
