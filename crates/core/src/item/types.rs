//! Item, season, episode and candidate types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Kind of media tracked by an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Movie,
    Series,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "series",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(MediaKind::Movie),
            "series" | "show" => Ok(MediaKind::Series),
            other => Err(ParseValueError::new("media kind", other)),
        }
    }
}

/// Error returned when a persisted enum value cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseValueError {
    kind: &'static str,
    value: String,
}

impl ParseValueError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseValueError {}

/// The five pipeline stages, in scheduling preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Index,
    Match,
    Scrape,
    Download,
    Publish,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::Index,
        PipelineStage::Match,
        PipelineStage::Scrape,
        PipelineStage::Download,
        PipelineStage::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Index => "index",
            PipelineStage::Match => "match",
            PipelineStage::Scrape => "scrape",
            PipelineStage::Download => "download",
            PipelineStage::Publish => "publish",
        }
    }

    /// Item stage that makes an item eligible for this pipeline stage.
    pub fn pending(&self) -> ItemStage {
        match self {
            PipelineStage::Index => ItemStage::New,
            PipelineStage::Match => ItemStage::Indexed,
            PipelineStage::Scrape => ItemStage::LibraryMatched,
            PipelineStage::Download => ItemStage::Scraped,
            PipelineStage::Publish => ItemStage::Downloaded,
        }
    }

    /// Failure substate of this pipeline stage.
    pub fn failure(&self) -> ItemStage {
        match self {
            PipelineStage::Index => ItemStage::IndexFailed,
            PipelineStage::Match => ItemStage::MatchFailed,
            PipelineStage::Scrape => ItemStage::ScrapeFailed,
            PipelineStage::Download => ItemStage::DownloadFailed,
            PipelineStage::Publish => ItemStage::PublishFailed,
        }
    }

    /// Item stage reached when this pipeline stage succeeds.
    pub fn done(&self) -> ItemStage {
        match self {
            PipelineStage::Index => ItemStage::Indexed,
            PipelineStage::Match => ItemStage::LibraryMatched,
            PipelineStage::Scrape => ItemStage::Scraped,
            PipelineStage::Download => ItemStage::Downloaded,
            PipelineStage::Publish => ItemStage::Published,
        }
    }

    /// Terminal failed stage for this pipeline stage.
    pub fn terminal(&self) -> ItemStage {
        ItemStage::Failed(*self)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ParseValueError::new("pipeline stage", s))
    }
}

/// Current position of an item in the pipeline.
///
/// ```text
/// new ─► indexed ─► library_matched ─► scraped ─► downloaded ─► published
///  │  ▲     │  ▲          │  ▲            │  ▲          │  ▲
///  ▼  │     ▼  │          ▼  │            ▼  │          ▼  │
/// index_   match_       scrape_        download_     publish_
/// failed   failed       failed         failed        failed
///  │          │            │              │             │
///  ▼          ▼            ▼              ▼             ▼
/// failed_index ...                                  failed_publish
/// ```
///
/// A failure substate loops back into its own stage. Terminal `failed_*`
/// stages only leave through an external reset. The rescan may move a
/// series from `scraped`, `downloaded` or `published` back to
/// `library_matched` when new episodes air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ItemStage {
    New,
    IndexFailed,
    Indexed,
    MatchFailed,
    LibraryMatched,
    ScrapeFailed,
    Scraped,
    DownloadFailed,
    Downloaded,
    PublishFailed,
    Published,
    Failed(PipelineStage),
}

/// Kind of edge taken by a stage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Advance,
    Fail,
    Exhaust,
    Reset,
    Readmit,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Advance => "advance",
            TransitionKind::Fail => "fail",
            TransitionKind::Exhaust => "exhaust",
            TransitionKind::Reset => "reset",
            TransitionKind::Readmit => "readmit",
        }
    }
}

impl ItemStage {
    pub const ALL: [ItemStage; 16] = [
        ItemStage::New,
        ItemStage::IndexFailed,
        ItemStage::Indexed,
        ItemStage::MatchFailed,
        ItemStage::LibraryMatched,
        ItemStage::ScrapeFailed,
        ItemStage::Scraped,
        ItemStage::DownloadFailed,
        ItemStage::Downloaded,
        ItemStage::PublishFailed,
        ItemStage::Published,
        ItemStage::Failed(PipelineStage::Index),
        ItemStage::Failed(PipelineStage::Match),
        ItemStage::Failed(PipelineStage::Scrape),
        ItemStage::Failed(PipelineStage::Download),
        ItemStage::Failed(PipelineStage::Publish),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStage::New => "new",
            ItemStage::IndexFailed => "index_failed",
            ItemStage::Indexed => "indexed",
            ItemStage::MatchFailed => "match_failed",
            ItemStage::LibraryMatched => "library_matched",
            ItemStage::ScrapeFailed => "scrape_failed",
            ItemStage::Scraped => "scraped",
            ItemStage::DownloadFailed => "download_failed",
            ItemStage::Downloaded => "downloaded",
            ItemStage::PublishFailed => "publish_failed",
            ItemStage::Published => "published",
            ItemStage::Failed(PipelineStage::Index) => "failed_index",
            ItemStage::Failed(PipelineStage::Match) => "failed_match",
            ItemStage::Failed(PipelineStage::Scrape) => "failed_scrape",
            ItemStage::Failed(PipelineStage::Download) => "failed_download",
            ItemStage::Failed(PipelineStage::Publish) => "failed_publish",
        }
    }

    /// The pipeline stage this value waits on, fails in, or froze in.
    ///
    /// `published` has none.
    pub fn pipeline_stage(&self) -> Option<PipelineStage> {
        match self {
            ItemStage::New | ItemStage::IndexFailed => Some(PipelineStage::Index),
            ItemStage::Indexed | ItemStage::MatchFailed => Some(PipelineStage::Match),
            ItemStage::LibraryMatched | ItemStage::ScrapeFailed => Some(PipelineStage::Scrape),
            ItemStage::Scraped | ItemStage::DownloadFailed => Some(PipelineStage::Download),
            ItemStage::Downloaded | ItemStage::PublishFailed => Some(PipelineStage::Publish),
            ItemStage::Published => None,
            ItemStage::Failed(stage) => Some(*stage),
        }
    }

    pub fn is_failure_substate(&self) -> bool {
        matches!(
            self,
            ItemStage::IndexFailed
                | ItemStage::MatchFailed
                | ItemStage::ScrapeFailed
                | ItemStage::DownloadFailed
                | ItemStage::PublishFailed
        )
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, ItemStage::Failed(_))
    }

    /// Whether the item is waiting on (or retrying) the given stage.
    pub fn awaits(&self, stage: PipelineStage) -> bool {
        *self == stage.pending() || *self == stage.failure()
    }

    /// Classify a stage change, returning `None` for illegal edges.
    pub fn transition_kind(&self, to: ItemStage) -> Option<TransitionKind> {
        if let ItemStage::Failed(stage) = self {
            return (to == stage.pending()).then_some(TransitionKind::Reset);
        }

        if matches!(
            self,
            ItemStage::Scraped | ItemStage::Downloaded | ItemStage::Published
        ) && to == ItemStage::LibraryMatched
        {
            return Some(TransitionKind::Readmit);
        }

        let stage = self.pipeline_stage()?;
        if to == stage.done() {
            Some(TransitionKind::Advance)
        } else if to == stage.failure() {
            Some(TransitionKind::Fail)
        } else if to == stage.terminal() {
            Some(TransitionKind::Exhaust)
        } else {
            None
        }
    }

    pub fn can_transition_to(&self, to: ItemStage) -> bool {
        self.transition_kind(to).is_some()
    }
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStage {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ParseValueError::new("item stage", s))
    }
}

impl From<ItemStage> for String {
    fn from(stage: ItemStage) -> Self {
        stage.as_str().to_string()
    }
}

impl TryFrom<String> for ItemStage {
    type Error = ParseValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// External catalog identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvdb: Option<u64>,
}

impl ExternalIds {
    pub fn is_empty(&self) -> bool {
        self.imdb.is_none() && self.tmdb.is_none() && self.tvdb.is_none()
    }

    /// Fill ids missing here from `other`.
    pub fn merge(&mut self, other: &ExternalIds) {
        if self.imdb.is_none() {
            self.imdb = other.imdb.clone();
        }
        if self.tmdb.is_none() {
            self.tmdb = other.tmdb;
        }
        if self.tvdb.is_none() {
            self.tvdb = other.tvdb;
        }
    }
}

/// Canonical metadata written back by the index stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
    /// Airing status for series ("Returning Series", "Ended", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_status: Option<String>,
}

impl ItemMetadata {
    /// Whether the series is still producing episodes.
    pub fn is_airing(&self) -> bool {
        self.show_status.as_deref().is_some_and(|status| {
            let status = status.to_ascii_lowercase();
            status == "returning series" || status == "in production" || status == "planned"
        })
    }
}

/// A movie or series tracked through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub year: Option<i32>,
    pub media_kind: MediaKind,
    pub category: Option<String>,
    pub external_ids: ExternalIds,
    pub current_stage: ItemStage,
    pub retry_count: u32,
    /// Earliest time a failed stage may be retried.
    pub retry_after: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,
    pub release_date: Option<NaiveDate>,
    pub assigned_library: Option<String>,
    pub duplicate_in_main_library: bool,
    pub metadata: Option<ItemMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn is_series(&self) -> bool {
        self.media_kind == MediaKind::Series
    }

    /// Title with year, as used in logs and placement paths.
    pub fn display_name(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }

    pub fn is_airing(&self) -> bool {
        self.metadata.as_ref().is_some_and(ItemMetadata::is_airing)
    }
}

/// A season of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub id: String,
    pub item_id: String,
    pub season_number: u32,
    pub air_date: Option<NaiveDate>,
    pub expected_episode_count: u32,
}

/// An episode of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub season_id: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub title: Option<String>,
    pub air_date: Option<NaiveDate>,
    pub scraped: bool,
    pub chosen_candidate_id: Option<String>,
}

impl Episode {
    /// Release-eligible once the air date has passed. Unknown dates never are.
    pub fn is_aired(&self, today: NaiveDate) -> bool {
        self.air_date.is_some_and(|date| date <= today)
    }
}

/// A season together with its episodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonWithEpisodes {
    pub season: Season,
    pub episodes: Vec<Episode>,
}

impl SeasonWithEpisodes {
    /// All known episodes have aired.
    pub fn fully_aired(&self, today: NaiveDate) -> bool {
        !self.episodes.is_empty() && self.episodes.iter().all(|e| e.is_aired(today))
    }
}

/// Input for the intake upsert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewItem {
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub media_kind: MediaKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    #[serde(default)]
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

impl NewItem {
    pub fn movie(title: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            title: title.into(),
            year,
            media_kind: MediaKind::Movie,
            ..Default::default()
        }
    }

    pub fn series(title: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            title: title.into(),
            year,
            media_kind: MediaKind::Series,
            ..Default::default()
        }
    }

    pub fn with_imdb(mut self, imdb: impl Into<String>) -> Self {
        self.external_ids.imdb = Some(imdb.into());
        self
    }

    pub fn with_tmdb(mut self, tmdb: u64) -> Self {
        self.external_ids.tmdb = Some(tmdb);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Metadata to write back after indexing.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub external_ids: ExternalIds,
    pub release_date: Option<NaiveDate>,
    pub metadata: ItemMetadata,
}

/// Season tree written back after indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSeason {
    pub season_number: u32,
    pub air_date: Option<NaiveDate>,
    pub episodes: Vec<NewEpisode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEpisode {
    pub episode_number: u32,
    pub title: Option<String>,
    pub air_date: Option<NaiveDate>,
}

/// What a candidate was selected for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubjectRef {
    /// The item itself (movies).
    Movie,
    /// One episode.
    Episode { episode_id: String },
    /// A season pack covering every episode of a season.
    Season { season_number: u32 },
}

impl SubjectRef {
    /// Stable key used to group candidates of the same subject.
    pub fn key(&self) -> String {
        match self {
            SubjectRef::Movie => "movie".to_string(),
            SubjectRef::Episode { episode_id } => format!("episode:{}", episode_id),
            SubjectRef::Season { season_number } => format!("season:{}", season_number),
        }
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        match key.split_once(':') {
            None if key == "movie" => Some(SubjectRef::Movie),
            Some(("episode", id)) => Some(SubjectRef::Episode {
                episode_id: id.to_string(),
            }),
            Some(("season", number)) => number
                .parse()
                .ok()
                .map(|season_number| SubjectRef::Season { season_number }),
            _ => None,
        }
    }
}

/// Lifecycle of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Selected,
    Rejected,
    Blacklisted,
    Downloading,
    Downloaded,
    Published,
    Failed,
}

impl CandidateStatus {
    pub const ALL: [CandidateStatus; 7] = [
        CandidateStatus::Selected,
        CandidateStatus::Rejected,
        CandidateStatus::Blacklisted,
        CandidateStatus::Downloading,
        CandidateStatus::Downloaded,
        CandidateStatus::Published,
        CandidateStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Selected => "selected",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Blacklisted => "blacklisted",
            CandidateStatus::Downloading => "downloading",
            CandidateStatus::Downloaded => "downloaded",
            CandidateStatus::Published => "published",
            CandidateStatus::Failed => "failed",
        }
    }

    /// The candidate currently stands for its subject.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CandidateStatus::Selected
                | CandidateStatus::Downloading
                | CandidateStatus::Downloaded
                | CandidateStatus::Published
        )
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CandidateStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseValueError::new("candidate status", s))
    }
}

/// Parsed release attributes persisted with a candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// Quality tag such as "bluray" or "web-dl".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    /// Tracker or indexer the release was listed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<f64>,
    #[serde(default)]
    pub seed_count: u32,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub is_season_pack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_episode_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A persisted, scored release option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub item_id: String,
    pub subject: SubjectRef,
    pub source_identifier: String,
    pub raw_title: String,
    pub attributes: CandidateAttributes,
    pub score: i64,
    /// Position in the ranked list the candidate came from.
    pub rank: u32,
    pub status: CandidateStatus,
    pub local_path: Option<String>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A ranked candidate about to be persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCandidate {
    pub source_identifier: String,
    pub raw_title: String,
    pub attributes: CandidateAttributes,
    pub score: i64,
}

/// Outcome of ranking one subject, persisted atomically.
#[derive(Debug, Clone)]
pub struct SelectionRecord {
    pub subject: SubjectRef,
    /// Ranked candidates, best first.
    pub candidates: Vec<NewCandidate>,
    /// Index into `candidates` of the winner.
    pub selected: usize,
    /// Episodes the winner covers (one for an episode, all for a pack).
    pub episode_ids: Vec<String>,
}

/// An optimistic in-progress marker for one item at one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub item_id: String,
    pub stage: PipelineStage,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Stage change applied by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    /// Stage the caller observed; the update fails if it changed since.
    pub from: ItemStage,
    pub to: ItemStage,
    pub retry_count: u32,
    pub retry_after: Option<DateTime<Utc>>,
}
