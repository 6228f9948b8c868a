//! Profile-based library matching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::config::{FilterKind, LibraryFilter, LibraryProfile};
use crate::item::{CandidateAttributes, Item};

/// Library chosen for an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryAssignment {
    /// Custom library name. `None` means the main library only.
    pub library: Option<String>,
    pub duplicate_in_main_library: bool,
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Library matcher misconfigured: {0}")]
    Configuration(String),
}

/// Assigns zero or one custom library to an item.
#[async_trait]
pub trait LibraryMatcher: Send + Sync {
    fn name(&self) -> &str;

    /// `hints` carries release attributes when a candidate is already known.
    async fn assign(
        &self,
        item: &Item,
        hints: Option<&CandidateAttributes>,
    ) -> Result<LibraryAssignment, LibraryError>;
}

/// Matches items against configured profiles. The first active profile
/// whose include filters all hold and no exclude filter holds wins.
pub struct ProfileLibraryMatcher {
    profiles: Vec<LibraryProfile>,
}

impl ProfileLibraryMatcher {
    pub fn new(profiles: Vec<LibraryProfile>) -> Result<Self, LibraryError> {
        for profile in &profiles {
            if profile.name.trim().is_empty() {
                return Err(LibraryError::Configuration(
                    "library profile name is empty".to_string(),
                ));
            }
        }
        Ok(Self { profiles })
    }

    fn matches(profile: &LibraryProfile, item: &Item, hints: Option<&CandidateAttributes>) -> bool {
        profile
            .filters
            .include
            .iter()
            .all(|f| filter_holds(f, item, hints))
            && !profile
                .filters
                .exclude
                .iter()
                .any(|f| filter_holds(f, item, hints))
    }
}

#[async_trait]
impl LibraryMatcher for ProfileLibraryMatcher {
    fn name(&self) -> &str {
        "profiles"
    }

    async fn assign(
        &self,
        item: &Item,
        hints: Option<&CandidateAttributes>,
    ) -> Result<LibraryAssignment, LibraryError> {
        let matched = self
            .profiles
            .iter()
            .filter(|p| p.active)
            .find(|p| Self::matches(p, item, hints));

        let assignment = match matched {
            Some(profile) => LibraryAssignment {
                library: Some(profile.name.clone()),
                duplicate_in_main_library: profile.duplicate_in_main_library,
            },
            None => LibraryAssignment::default(),
        };
        debug!(
            item_id = %item.id,
            library = ?assignment.library,
            "Library assignment"
        );
        Ok(assignment)
    }
}

fn values(filter: &LibraryFilter) -> impl Iterator<Item = String> + '_ {
    filter
        .value
        .split(',')
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

fn filter_holds(filter: &LibraryFilter, item: &Item, hints: Option<&CandidateAttributes>) -> bool {
    let metadata = item.metadata.as_ref();
    match filter.kind {
        FilterKind::Genre => {
            let genres: Vec<String> = metadata
                .map(|m| m.genres.iter().map(|g| g.trim().to_lowercase()).collect())
                .unwrap_or_default();
            values(filter).any(|v| genres.contains(&v))
        }
        FilterKind::Rating => {
            let rating = metadata
                .and_then(|m| m.rating.as_deref())
                .unwrap_or_default()
                .to_lowercase();
            values(filter).any(|v| v == rating)
        }
        FilterKind::Category => item
            .category
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(filter.value.trim())),
        FilterKind::Resolution => {
            let resolution = hints
                .and_then(|h| h.resolution.as_deref())
                .unwrap_or_default()
                .to_lowercase();
            values(filter).any(|v| resolution.contains(&v))
        }
        FilterKind::Codec => {
            let haystack = hints
                .map(|h| {
                    format!(
                        "{} {}",
                        h.codec.as_deref().unwrap_or_default(),
                        h.filename.as_deref().unwrap_or_default()
                    )
                })
                .unwrap_or_default()
                .to_lowercase();
            values(filter).any(|v| haystack.contains(&v))
        }
    }
}
