//! Candidate sources.
//!
//! A source turns a subject query into raw release listings. The ranking
//! engine does the rest.

mod config;
mod throttle;
mod torrentio;
mod types;

pub use config::TorrentioConfig;
pub use throttle::RequestThrottle;
pub use torrentio::TorrentioSource;
pub use types::{CandidateQuery, CandidateSource, SourceError};
