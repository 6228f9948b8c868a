//! Per-stage predicates over an item's persisted season tree and candidates.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::item::{Candidate, CandidateStatus, Episode, SeasonWithEpisodes, SubjectRef};

/// Aired episodes that still need a selection.
pub fn scrape_episodes(seasons: &[SeasonWithEpisodes], today: NaiveDate) -> Vec<&Episode> {
    seasons
        .iter()
        .flat_map(|s| s.episodes.iter())
        .filter(|e| !e.scraped && e.is_aired(today))
        .collect()
}

/// Whether a subject lost its selection to the blacklist and has nothing
/// active left.
///
/// For movies this looks at the movie subject. For series it looks for an
/// aired, unscraped episode whose episode or season subject has a
/// blacklisted candidate.
pub fn needs_rescrape(
    is_series: bool,
    seasons: &[SeasonWithEpisodes],
    candidates: &[Candidate],
    today: NaiveDate,
) -> bool {
    if !is_series {
        let movie = candidates.iter().filter(|c| c.subject == SubjectRef::Movie);
        let blacklisted = movie
            .clone()
            .any(|c| c.status == CandidateStatus::Blacklisted);
        return blacklisted && !movie.clone().any(|c| c.status.is_active());
    }

    let blacklisted: HashSet<String> = candidates
        .iter()
        .filter(|c| c.status == CandidateStatus::Blacklisted)
        .map(|c| c.subject.key())
        .collect();
    if blacklisted.is_empty() {
        return false;
    }

    scrape_episodes(seasons, today).into_iter().any(|e| {
        let episode_key = SubjectRef::Episode {
            episode_id: e.id.clone(),
        }
        .key();
        let season_key = SubjectRef::Season {
            season_number: e.season_number,
        }
        .key();
        blacklisted.contains(&episode_key) || blacklisted.contains(&season_key)
    })
}

/// Seasons in which every aired episode has an active candidate.
fn complete_seasons(
    seasons: &[SeasonWithEpisodes],
    candidates: &[Candidate],
    today: NaiveDate,
) -> HashSet<u32> {
    let active: HashSet<&str> = candidates
        .iter()
        .filter(|c| c.status.is_active())
        .map(|c| c.id.as_str())
        .collect();

    seasons
        .iter()
        .filter(|s| {
            let mut aired = s.episodes.iter().filter(|e| e.is_aired(today)).peekable();
            aired.peek().is_some()
                && aired.all(|e| {
                    e.chosen_candidate_id
                        .as_deref()
                        .is_some_and(|id| active.contains(id))
                })
        })
        .map(|s| s.season.season_number)
        .collect()
}

/// Candidates the download stage should work on.
///
/// With `require_complete_season`, episode and pack candidates only count
/// once their whole season (aired part) has a selection.
pub fn download_targets<'a>(
    seasons: &[SeasonWithEpisodes],
    candidates: &'a [Candidate],
    require_complete_season: bool,
    today: NaiveDate,
) -> Vec<&'a Candidate> {
    let season_of: HashMap<&str, u32> = seasons
        .iter()
        .flat_map(|s| s.episodes.iter())
        .map(|e| (e.id.as_str(), e.season_number))
        .collect();
    let complete = if require_complete_season {
        Some(complete_seasons(seasons, candidates, today))
    } else {
        None
    };

    candidates
        .iter()
        .filter(|c| {
            matches!(
                c.status,
                CandidateStatus::Selected | CandidateStatus::Downloading
            )
        })
        .filter(|c| {
            let Some(ref complete) = complete else {
                return true;
            };
            match &c.subject {
                SubjectRef::Movie => true,
                SubjectRef::Season { season_number } => complete.contains(season_number),
                SubjectRef::Episode { episode_id } => season_of
                    .get(episode_id.as_str())
                    .is_some_and(|n| complete.contains(n)),
            }
        })
        .collect()
}

/// Downloaded candidates waiting to be published.
pub fn publish_targets(candidates: &[Candidate]) -> Vec<&Candidate> {
    candidates
        .iter()
        .filter(|c| c.status == CandidateStatus::Downloaded)
        .collect()
}
