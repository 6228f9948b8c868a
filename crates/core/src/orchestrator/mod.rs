//! Pipeline orchestrator.
//!
//! The orchestrator drives items through the stage machine automatically:
//! - **Stage loops**: one per stage, resolving eligible items on a timer
//! - **Dispatch**: claimed batches run with bounded parallelism and a
//!   per-unit timeout; the outcome is applied as exactly one stage change
//! - **Rescan**: periodically re-admits series with aired but unscraped episodes

mod config;
mod runner;
mod types;

pub use config::{OrchestratorConfig, StageSettings, StagesConfig};
pub use runner::PipelineOrchestrator;
pub use types::{OrchestratorError, OrchestratorStatus, RescanReport, TickReport, UnitResult};
