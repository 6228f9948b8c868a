use std::collections::HashSet;

use super::{types::Config, ConfigError};
use crate::item::PipelineStage;
use crate::ranking::SizeRange;

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Orchestrator batch sizes, concurrency, timeouts and backoff
/// - File size ranges
/// - API keys of configured collaborators
/// - Library profile names
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    validate_orchestrator(config)?;
    validate_ranking(config)?;

    if let Some(ref tmdb) = config.tmdb {
        if tmdb.api_key.trim().is_empty() {
            return Err(invalid("tmdb.api_key cannot be empty"));
        }
    }
    if let Some(ref rd) = config.real_debrid {
        if rd.api_key.trim().is_empty() {
            return Err(invalid("real_debrid.api_key cannot be empty"));
        }
    }

    let torrentio = &config.torrentio;
    if torrentio.url.trim().is_empty() {
        return Err(invalid("torrentio.url cannot be empty"));
    }
    if torrentio.min_interval_ms > torrentio.max_interval_ms {
        return Err(invalid(
            "torrentio.min_interval_ms cannot exceed torrentio.max_interval_ms",
        ));
    }

    let mut names = HashSet::new();
    for profile in &config.library.profiles {
        if profile.name.trim().is_empty() {
            return Err(invalid("library profile name cannot be empty"));
        }
        if !names.insert(profile.name.as_str()) {
            return Err(invalid(format!(
                "duplicate library profile: {}",
                profile.name
            )));
        }
    }

    Ok(())
}

fn validate_orchestrator(config: &Config) -> Result<(), ConfigError> {
    let orchestrator = &config.orchestrator;

    if orchestrator.max_concurrency == 0 {
        return Err(invalid("orchestrator.max_concurrency cannot be 0"));
    }
    if orchestrator.worker_timeout_secs == 0 {
        return Err(invalid("orchestrator.worker_timeout_secs cannot be 0"));
    }
    if orchestrator.claim_lease_secs <= orchestrator.worker_timeout_secs {
        return Err(invalid(
            "orchestrator.claim_lease_secs must exceed orchestrator.worker_timeout_secs",
        ));
    }

    for stage in PipelineStage::ALL {
        let settings = orchestrator.stages.get(stage);
        if settings.batch_size == 0 {
            return Err(invalid(format!(
                "orchestrator.stages.{}.batch_size cannot be 0",
                stage
            )));
        }
        if settings.active && settings.poll_interval_ms == 0 {
            return Err(invalid(format!(
                "orchestrator.stages.{}.poll_interval_ms cannot be 0",
                stage
            )));
        }
    }

    let backoff = &orchestrator.backoff;
    if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
        return Err(invalid(
            "orchestrator.backoff.multiplier must be a finite number >= 1.0",
        ));
    }
    if backoff.initial_delay_ms > backoff.max_delay_ms {
        return Err(invalid(
            "orchestrator.backoff.initial_delay_ms cannot exceed max_delay_ms",
        ));
    }

    Ok(())
}

fn validate_ranking(config: &Config) -> Result<(), ConfigError> {
    let filesize = &config.ranking.filesize;
    check_range("ranking.filesize.movie", filesize.movie)?;
    check_range("ranking.filesize.series", filesize.series)?;

    if config.ranking.max_results_per_resolution == Some(0) {
        return Err(invalid(
            "ranking.max_results_per_resolution cannot be 0",
        ));
    }
    Ok(())
}

fn check_range(key: &str, range: SizeRange) -> Result<(), ConfigError> {
    if !range.min.is_finite() || !range.max.is_finite() || range.min < 0.0 {
        return Err(invalid(format!("{} must be non-negative numbers", key)));
    }
    if range.min > range.max {
        return Err(invalid(format!("{}.min cannot exceed {}.max", key, key)));
    }
    Ok(())
}
