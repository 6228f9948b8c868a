//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

use crate::item::PipelineStage;
use crate::retry::BackoffConfig;

/// Scheduling settings for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Whether the stage loop is spawned at all.
    #[serde(default = "default_true")]
    pub active: bool,

    /// How often to resolve and dispatch a batch (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Failures tolerated before the item freezes in `failed_<stage>`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Work units claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_max_retries() -> u32 {
    3
}

fn default_batch_size() -> usize {
    10
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            active: true,
            poll_interval_ms: default_poll_interval(),
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
        }
    }
}

impl StageSettings {
    fn with_poll_interval(poll_interval_ms: u64) -> Self {
        Self {
            poll_interval_ms,
            ..Default::default()
        }
    }
}

fn default_index_stage() -> StageSettings {
    StageSettings::with_poll_interval(5_000)
}

fn default_match_stage() -> StageSettings {
    StageSettings {
        batch_size: 20,
        ..StageSettings::with_poll_interval(5_000)
    }
}

fn default_scrape_stage() -> StageSettings {
    StageSettings::with_poll_interval(10_000)
}

fn default_download_stage() -> StageSettings {
    StageSettings {
        max_retries: 10,
        ..StageSettings::with_poll_interval(30_000)
    }
}

fn default_publish_stage() -> StageSettings {
    StageSettings::with_poll_interval(10_000)
}

/// Settings for all five stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_index_stage")]
    pub index: StageSettings,

    #[serde(default = "default_match_stage", rename = "match")]
    pub matching: StageSettings,

    #[serde(default = "default_scrape_stage")]
    pub scrape: StageSettings,

    #[serde(default = "default_download_stage")]
    pub download: StageSettings,

    #[serde(default = "default_publish_stage")]
    pub publish: StageSettings,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            index: default_index_stage(),
            matching: default_match_stage(),
            scrape: default_scrape_stage(),
            download: default_download_stage(),
            publish: default_publish_stage(),
        }
    }
}

impl StagesConfig {
    pub fn get(&self, stage: PipelineStage) -> &StageSettings {
        match stage {
            PipelineStage::Index => &self.index,
            PipelineStage::Match => &self.matching,
            PipelineStage::Scrape => &self.scrape,
            PipelineStage::Download => &self.download,
            PipelineStage::Publish => &self.publish,
        }
    }

    pub fn get_mut(&mut self, stage: PipelineStage) -> &mut StageSettings {
        match stage {
            PipelineStage::Index => &mut self.index,
            PipelineStage::Match => &mut self.matching,
            PipelineStage::Scrape => &mut self.scrape,
            PipelineStage::Download => &mut self.download,
            PipelineStage::Publish => &mut self.publish,
        }
    }
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enable/disable the stage loops.
    /// When disabled, stages only run through `run_stage_once`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub stages: StagesConfig,

    /// Work units run concurrently within one batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Lifetime of a stage claim. Must outlast `worker_timeout_secs`.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,

    /// Upper bound for one worker run; a timeout counts as a retryable failure.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,

    /// How long `stop()` waits for stage loops to drain.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Interval of the series rescan. 0 disables it.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,

    /// Re-index airing series before looking for new episodes.
    #[serde(default)]
    pub refresh_metadata_on_rescan: bool,

    /// Backoff between stage retries.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Only download a season once every aired episode has a selection.
    #[serde(default)]
    pub require_complete_season: bool,

    /// Blacklist a download that shows no completion after this long.
    /// 0 disables stall detection.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Delay before polling a transfer that is still in progress. Polls do
    /// not count against `max_retries`.
    #[serde(default = "default_waiting_poll")]
    pub waiting_poll_secs: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_claim_lease() -> u64 {
    900 // 15 minutes
}

fn default_worker_timeout() -> u64 {
    600 // 10 minutes
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_rescan_interval() -> u64 {
    86_400 // daily
}

fn default_stall_timeout() -> u64 {
    21_600 // 6 hours
}

fn default_waiting_poll() -> u64 {
    300 // 5 minutes
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stages: StagesConfig::default(),
            max_concurrency: default_max_concurrency(),
            claim_lease_secs: default_claim_lease(),
            worker_timeout_secs: default_worker_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            rescan_interval_secs: default_rescan_interval(),
            refresh_metadata_on_rescan: false,
            backoff: BackoffConfig::default(),
            require_complete_season: false,
            stall_timeout_secs: default_stall_timeout(),
            waiting_poll_secs: default_waiting_poll(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.rescan_interval_secs, 86_400);
        assert_eq!(config.stages.index.batch_size, 10);
        assert_eq!(config.stages.matching.batch_size, 20);
        assert_eq!(config.stages.get(PipelineStage::Download).max_retries, 10);
        assert_eq!(config.waiting_poll_secs, 300);
        assert!(PipelineStage::ALL
            .iter()
            .all(|stage| config.stages.get(*stage).active));
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: OrchestratorConfig = toml::from_str("enabled = false").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.stages, StagesConfig::default());
        assert_eq!(config.claim_lease_secs, 900);
    }

    #[test]
    fn test_deserialize_stage_overrides() {
        let toml = r#"
            max_concurrency = 2
            stall_timeout_secs = 0

            [stages.match]
            batch_size = 5

            [stages.download]
            active = false
            poll_interval_ms = 60000

            [backoff]
            initial_delay_ms = 1000
        "#;
        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.stall_timeout_secs, 0);
        assert_eq!(config.stages.matching.batch_size, 5);
        assert_eq!(config.stages.matching.poll_interval_ms, 10_000);
        assert!(!config.stages.download.active);
        assert_eq!(config.stages.download.poll_interval_ms, 60_000);
        assert_eq!(config.stages.download.max_retries, 3);
        assert_eq!(config.backoff.initial_delay_ms, 1000);
        assert_eq!(config.stages.index, default_index_stage());
    }
}
