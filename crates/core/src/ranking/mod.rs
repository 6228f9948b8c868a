//! Candidate ranking.
//!
//! Parses raw release listings, scores them against configured weights,
//! filters by size and picks a winner. Season packs are handled as a
//! separate pass so callers can prefer them over per-episode releases.

mod config;
mod engine;
mod parser;
mod scorer;
mod types;

pub use config::{FileSizeLimits, LanguagePreferences, RankingConfig, ScoringWeights, SizeRange};
pub use engine::RankingEngine;
pub use parser::{decode_flags, parse_release, to_gb};
pub use scorer::{size_bonuses, Scorer};
pub use types::{
    CodecFamily, ParsedRelease, RankingError, RawRelease, Resolution, ScoredRelease,
    SeasonContext, Selection,
};
