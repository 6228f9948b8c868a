//! Ranking configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::item::MediaKind;

/// Weights and limits used to score release candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default)]
    pub scoring: ScoringWeights,

    #[serde(default)]
    pub filesize: FileSizeLimits,

    /// Uploader tag groups, each a comma-separated list ("NTB,FLUX").
    #[serde(default)]
    pub preferred_uploaders: Vec<String>,

    #[serde(default)]
    pub languages: LanguagePreferences,

    /// Cap on alternates kept per resolution in the persisted candidate
    /// pool. The winner is always kept. Unset keeps everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results_per_resolution: Option<usize>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringWeights::default(),
            filesize: FileSizeLimits::default(),
            preferred_uploaders: Vec::new(),
            languages: LanguagePreferences::default(),
            max_results_per_resolution: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Score per resolution label ("2160p", "1080p", "720p", "480p").
    #[serde(default = "default_resolution_scores")]
    pub resolution_scores: BTreeMap<String, i64>,

    /// Score per codec family ("hevc", "avc").
    #[serde(default = "default_codec_scores")]
    pub codec_scores: BTreeMap<String, i64>,

    /// Seed count contributes one point per seeder up to this cap.
    #[serde(default = "default_max_seeder_score")]
    pub max_seeder_score: i64,

    /// Bonus for the release closest to the size ceiling.
    #[serde(default = "default_max_size_score")]
    pub max_size_score: i64,

    #[serde(default = "default_preferred_uploader_score")]
    pub preferred_uploader_score: i64,

    /// Added once per matched include language.
    #[serde(default = "default_language_include_score")]
    pub language_include_score: i64,

    /// Applied once per matched exclude language. Always subtracts.
    #[serde(default = "default_language_exclude_penalty")]
    pub language_exclude_penalty: i64,
}

fn default_resolution_scores() -> BTreeMap<String, i64> {
    BTreeMap::from([
        ("2160p".to_string(), 4000),
        ("1080p".to_string(), 3000),
        ("720p".to_string(), 2000),
        ("480p".to_string(), 1000),
    ])
}

fn default_codec_scores() -> BTreeMap<String, i64> {
    BTreeMap::from([("hevc".to_string(), 500), ("avc".to_string(), 250)])
}

fn default_max_seeder_score() -> i64 {
    1000
}

fn default_max_size_score() -> i64 {
    1000
}

fn default_preferred_uploader_score() -> i64 {
    500
}

fn default_language_include_score() -> i64 {
    300
}

fn default_language_exclude_penalty() -> i64 {
    -1000
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            resolution_scores: default_resolution_scores(),
            codec_scores: default_codec_scores(),
            max_seeder_score: default_max_seeder_score(),
            max_size_score: default_max_size_score(),
            preferred_uploader_score: default_preferred_uploader_score(),
            language_include_score: default_language_include_score(),
            language_exclude_penalty: default_language_exclude_penalty(),
        }
    }
}

/// Accepted size window in GB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: f64,
    pub max: f64,
}

impl SizeRange {
    pub fn contains(&self, size_gb: f64) -> bool {
        size_gb >= self.min && size_gb <= self.max
    }

    /// Window for a pack covering `episodes` episodes.
    pub fn scaled(&self, episodes: u32) -> SizeRange {
        let factor = f64::from(episodes.max(1));
        SizeRange {
            min: self.min * factor,
            max: self.max * factor,
        }
    }
}

/// Size windows per media kind. Series windows are per episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSizeLimits {
    #[serde(default = "default_movie_range")]
    pub movie: SizeRange,
    #[serde(default = "default_series_range", alias = "show")]
    pub series: SizeRange,
}

fn default_movie_range() -> SizeRange {
    SizeRange { min: 1.0, max: 20.0 }
}

fn default_series_range() -> SizeRange {
    SizeRange { min: 0.1, max: 5.0 }
}

impl Default for FileSizeLimits {
    fn default() -> Self {
        Self {
            movie: default_movie_range(),
            series: default_series_range(),
        }
    }
}

impl FileSizeLimits {
    pub fn for_kind(&self, kind: MediaKind) -> SizeRange {
        match kind {
            MediaKind::Movie => self.movie,
            MediaKind::Series => self.series,
        }
    }
}

/// Two-letter language tags decoded from flag emoji.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePreferences {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}
