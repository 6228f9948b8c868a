//! Stage eligibility.
//!
//! Each pipeline stage has one predicate over persisted state. The resolver
//! evaluates it per item and returns work units for the orchestrator; the
//! pure helpers in `predicates` are shared with the stage workers so both
//! sides agree on what a stage should touch.

mod predicates;
mod resolver;

pub use predicates::{download_targets, needs_rescrape, publish_targets, scrape_episodes};
pub use resolver::{DispatchMode, StageResolver, WorkUnit};
