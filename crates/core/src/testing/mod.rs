//! Testing utilities and mock implementations for end-to-end tests.
//!
//! This module provides mock implementations of every collaborator trait,
//! so the orchestrator can be driven without network access.
//!
//! # Example
//!
//! ```rust,ignore
//! use reelflow_core::testing::{fixtures, MockDownloadClient, MockSource};
//!
//! let source = MockSource::new();
//! source.set_releases(None, None, vec![fixtures::release("abc", "Film.2020.1080p.x264", 50, 8.0)]).await;
//!
//! let downloads = MockDownloadClient::new();
//! downloads.set_status("abc", DownloadStatus::Queued).await;
//! ```

mod mock_download_client;
mod mock_indexer;
mod mock_library_matcher;
mod mock_publisher;
mod mock_source;

pub use mock_download_client::MockDownloadClient;
pub use mock_indexer::MockIndexer;
pub use mock_library_matcher::MockLibraryMatcher;
pub use mock_publisher::{MockPublisher, RecordedPublish};
pub use mock_source::MockSource;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::{Duration, NaiveDate, Utc};

    use crate::item::{
        Candidate, CandidateAttributes, CandidateStatus, ExternalIds, Item, ItemStage, MediaKind,
        NewEpisode, NewSeason, SubjectRef,
    };
    use crate::ranking::RawRelease;

    /// An in-memory item at `new`. Not persisted.
    pub fn item(title: &str, media_kind: MediaKind) -> Item {
        let now = Utc::now();
        Item {
            id: format!("item-{}", title.to_lowercase().replace(' ', "-")),
            title: title.to_string(),
            year: None,
            media_kind,
            category: None,
            external_ids: ExternalIds::default(),
            current_stage: ItemStage::New,
            retry_count: 0,
            retry_after: None,
            requested_at: now,
            release_date: None,
            assigned_library: None,
            duplicate_in_main_library: false,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An in-memory selected candidate. Not persisted.
    pub fn candidate(item_id: &str, subject: SubjectRef, source_identifier: &str) -> Candidate {
        let now = Utc::now();
        Candidate {
            id: format!("cand-{}", source_identifier),
            item_id: item_id.to_string(),
            subject,
            source_identifier: source_identifier.to_string(),
            raw_title: format!("Release {}", source_identifier),
            attributes: CandidateAttributes::default(),
            score: 0,
            rank: 0,
            status: CandidateStatus::Selected,
            local_path: None,
            download_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A release with structured seeders and size.
    pub fn release(hash: &str, title: &str, seeders: u32, size_gb: f64) -> RawRelease {
        RawRelease::new(hash, title)
            .with_seeders(seeders)
            .with_size_gb(size_gb)
    }

    /// A season whose episodes aired weekly starting `first_air_date`.
    pub fn season(season_number: u32, episodes: u32, first_air_date: NaiveDate) -> NewSeason {
        NewSeason {
            season_number,
            air_date: Some(first_air_date),
            episodes: (1..=episodes)
                .map(|e| NewEpisode {
                    episode_number: e,
                    title: Some(format!("Episode {}", e)),
                    air_date: Some(first_air_date + Duration::weeks(i64::from(e) - 1)),
                })
                .collect(),
        }
    }

    /// A season that finished airing well before today.
    pub fn aired_season(season_number: u32, episodes: u32) -> NewSeason {
        season(
            season_number,
            episodes,
            Utc::now().date_naive() - Duration::days(365),
        )
    }
}
