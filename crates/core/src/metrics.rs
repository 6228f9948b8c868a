//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Orchestrator (dispatches, outcomes, claims, rescans)
//! - Ranking (candidates considered, blacklists)
//! - External services (metadata, candidate source, debrid, publisher)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Orchestrator Metrics
// =============================================================================

/// Work units dispatched per stage.
pub static STAGE_DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reelflow_stage_dispatches_total",
            "Work units dispatched to stage workers",
        ),
        &["stage", "mode"], // mode: "advance", "subject"
    )
    .unwrap()
});

/// Applied outcomes per stage.
pub static STAGE_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reelflow_stage_outcomes_total", "Stage worker outcomes"),
        &["stage", "outcome"], // "advanced", "retry", "exhausted", "unchanged", "waiting"
    )
    .unwrap()
});

/// Stage worker duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "reelflow_stage_duration_seconds",
            "Duration of one stage worker run",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["stage"],
    )
    .unwrap()
});

/// Claims lost to another dispatcher or to a concurrent stage change.
pub static CLAIMS_LOST: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reelflow_claims_lost_total",
            "Work units dropped because the claim or stage moved",
        ),
        &["stage"],
    )
    .unwrap()
});

/// Worker runs cut off by the per-unit timeout.
pub static WORKER_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reelflow_worker_timeouts_total",
            "Stage worker runs that exceeded the timeout",
        ),
        &["stage"],
    )
    .unwrap()
});

/// Series re-admitted by the rescan.
pub static READMISSIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "reelflow_readmissions_total",
        "Series re-admitted to scraping for newly aired episodes",
    )
    .unwrap()
});

// =============================================================================
// Ranking Metrics
// =============================================================================

/// Candidates considered per selection.
pub static CANDIDATES_CONSIDERED: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "reelflow_candidates_considered",
            "Number of releases considered per selection",
        )
        .buckets(vec![0.0, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
        &["subject"], // "movie", "episode", "season"
    )
    .unwrap()
});

/// Selections that had to fall back to the unfiltered set.
pub static SIZE_FALLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "reelflow_size_fallbacks_total",
        "Selections made from the unfiltered set",
    )
    .unwrap()
});

/// Candidates blacklisted after a download failure.
pub static BLACKLISTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reelflow_blacklisted_total", "Blacklisted candidates"),
        &["reason"], // "failed", "stalled"
    )
    .unwrap()
});

// =============================================================================
// External Service Metrics
// =============================================================================

/// External service request duration.
pub static EXTERNAL_SERVICE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "reelflow_external_service_duration_seconds",
            "Duration of external service calls",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["service", "operation"],
    )
    .unwrap()
});

/// External service requests total.
pub static EXTERNAL_SERVICE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reelflow_external_service_requests_total",
            "Total external service requests",
        ),
        &["service", "operation", "status"], // status: "success", "error"
    )
    .unwrap()
});

/// Rate-limit responses that widened the request spacing.
pub static THROTTLE_BACKOFFS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reelflow_throttle_backoffs_total",
            "Rate-limit responses that doubled the request interval",
        ),
        &["service"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Record one external call.
pub fn observe_external(service: &str, operation: &str, ok: bool, elapsed_secs: f64) {
    let status = if ok { "success" } else { "error" };
    EXTERNAL_SERVICE_REQUESTS
        .with_label_values(&[service, operation, status])
        .inc();
    EXTERNAL_SERVICE_DURATION
        .with_label_values(&[service, operation])
        .observe(elapsed_secs);
}

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Orchestrator
        Box::new(STAGE_DISPATCHES.clone()),
        Box::new(STAGE_OUTCOMES.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(CLAIMS_LOST.clone()),
        Box::new(WORKER_TIMEOUTS.clone()),
        Box::new(READMISSIONS.clone()),
        // Ranking
        Box::new(CANDIDATES_CONSIDERED.clone()),
        Box::new(SIZE_FALLBACKS.clone()),
        Box::new(BLACKLISTED.clone()),
        // External services
        Box::new(EXTERNAL_SERVICE_DURATION.clone()),
        Box::new(EXTERNAL_SERVICE_REQUESTS.clone()),
        Box::new(THROTTLE_BACKOFFS.clone()),
    ]
}
