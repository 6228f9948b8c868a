//! Release and score types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A release as returned by a candidate source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRelease {
    /// Stable identifier of the release (info hash).
    pub source_identifier: String,
    /// Free text title. Extra lines may carry embedded metadata
    /// (seeders, size, tracker, flag emoji).
    pub title: String,
    /// Source tag line as published by the source, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Structured seed count, preferred over the embedded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeders: Option<u32>,
    /// Structured size, preferred over the embedded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl RawRelease {
    pub fn new(source_identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_identifier: source_identifier.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_seeders(mut self, seeders: u32) -> Self {
        self.seeders = Some(seeders);
        self
    }

    pub fn with_size_gb(mut self, size_gb: f64) -> Self {
        self.size_bytes = Some((size_gb * 1024.0 * 1024.0 * 1024.0).round() as u64);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "2160p")]
    Uhd2160,
    #[serde(rename = "1080p")]
    Fhd1080,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "480p")]
    Sd480,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Uhd2160 => "2160p",
            Resolution::Fhd1080 => "1080p",
            Resolution::Hd720 => "720p",
            Resolution::Sd480 => "480p",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    Hevc,
    Avc,
}

impl CodecFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecFamily::Hevc => "hevc",
            CodecFamily::Avc => "avc",
        }
    }
}

impl fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes extracted from a raw release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedRelease {
    pub release_name: String,
    pub resolution: Option<Resolution>,
    pub codec: Option<CodecFamily>,
    pub quality: Option<String>,
    pub source: Option<String>,
    pub size_gb: Option<f64>,
    pub seeders: u32,
    pub languages: Vec<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub is_season_pack: bool,
    pub pack_episode_count: Option<u32>,
}

/// A release with its score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRelease {
    pub raw: RawRelease,
    pub parsed: ParsedRelease,
    pub base_score: i64,
    pub size_bonus: i64,
    pub score: i64,
    /// Position in the input list; lower wins ties.
    pub first_seen: usize,
}

/// Outcome of ranking one subject's releases.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Ranked releases, best first. The winner is `ranked[0]`.
    pub ranked: Vec<ScoredRelease>,
    /// Nothing fit the size window, so the unfiltered set was used.
    pub used_fallback: bool,
}

impl Selection {
    pub fn winner(&self) -> &ScoredRelease {
        &self.ranked[0]
    }
}

/// Season being considered for a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonContext {
    pub season_number: u32,
    pub episode_count: u32,
    pub fully_aired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankingError {
    #[error("no candidates retrieved")]
    NoCandidates,

    #[error("all {0} candidates are blacklisted")]
    AllExcluded(usize),

    #[error("no candidates match the requested episode")]
    NoMatchingEpisode,
}
