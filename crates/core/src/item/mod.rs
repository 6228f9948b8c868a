//! Pipeline items and their persisted state.
//!
//! An item is a movie or a series. Series carry a season/episode tree; the
//! unit a release candidate is selected for is the item itself (movies) or
//! an episode (series).

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteItemStore;
pub use store::{covered_by, ItemFilter, ItemStore, StoreError, UpsertOutcome};
pub use types::{
    Candidate, CandidateAttributes, CandidateStatus, Claim, Episode, ExternalIds, Item,
    ItemMetadata, ItemStage, MediaKind, MetadataUpdate, NewCandidate, NewEpisode, NewItem,
    NewSeason, ParseValueError, PipelineStage, Season, SeasonWithEpisodes, SelectionRecord,
    StageUpdate, SubjectRef, TransitionKind,
};
