//! Candidate selection.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::config::{RankingConfig, SizeRange};
use super::parser::parse_release;
use super::scorer::{size_bonuses, Scorer};
use super::types::{RankingError, RawRelease, ScoredRelease, SeasonContext, Selection};
use crate::item::MediaKind;

/// Turns raw release listings into one deterministic choice.
///
/// Pure and synchronous: the same input always yields the same ranking.
#[derive(Debug, Clone)]
pub struct RankingEngine {
    config: RankingConfig,
    scorer: Scorer,
}

impl RankingEngine {
    pub fn new(config: RankingConfig) -> Self {
        let scorer = Scorer::new(
            config.scoring.clone(),
            config.languages.clone(),
            &config.preferred_uploaders,
        );
        Self { config, scorer }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Parse and score releases in input order. Size tiers are computed
    /// against `range.max` across the whole list.
    pub fn score_all(&self, releases: &[RawRelease], range: SizeRange) -> Vec<ScoredRelease> {
        let parsed: Vec<_> = releases.iter().map(parse_release).collect();
        let sizes: Vec<Option<f64>> = parsed.iter().map(|p| p.size_gb).collect();
        let bonuses = size_bonuses(&sizes, range.max, self.scorer.max_size_score());

        releases
            .iter()
            .zip(parsed)
            .zip(bonuses)
            .enumerate()
            .map(|(first_seen, ((raw, parsed), size_bonus))| {
                let base_score = self.scorer.base_score(&parsed);
                ScoredRelease {
                    raw: raw.clone(),
                    parsed,
                    base_score,
                    size_bonus,
                    score: base_score + size_bonus,
                    first_seen,
                }
            })
            .collect()
    }

    /// Select the best release for a movie or a whole-item query.
    pub fn select(
        &self,
        kind: MediaKind,
        releases: &[RawRelease],
        excluded: &HashSet<String>,
    ) -> Result<Selection, RankingError> {
        let usable = prepare(releases, excluded)?;
        let range = self.config.filesize.for_kind(kind);
        Ok(self.rank(self.score_all(&usable, range), range))
    }

    /// Select the best release for one episode. Releases naming a different
    /// episode, or a whole season, are dropped first.
    pub fn select_episode(
        &self,
        releases: &[RawRelease],
        season: u32,
        episode: u32,
        excluded: &HashSet<String>,
    ) -> Result<Selection, RankingError> {
        let usable = prepare(releases, excluded)?;
        let range = self.config.filesize.for_kind(MediaKind::Series);

        // Size tiers are relative to the episode's own releases
        let matching: Vec<RawRelease> = usable
            .into_iter()
            .filter(|raw| {
                let parsed = parse_release(raw);
                match (parsed.season, parsed.episode) {
                    (Some(s), Some(e)) => s == season && e == episode,
                    (Some(_), None) => false,
                    (None, _) => true,
                }
            })
            .collect();

        if matching.is_empty() {
            return Err(RankingError::NoMatchingEpisode);
        }
        Ok(self.rank(self.score_all(&matching, range), range))
    }

    /// Pick a season pack when the season has fully aired.
    ///
    /// Packs are ranked among themselves, with the per-episode size window
    /// scaled by the season's episode count. Returns `None` when the season
    /// is still airing or no pack for it was offered.
    pub fn select_season_pack(
        &self,
        releases: &[RawRelease],
        season: SeasonContext,
        excluded: &HashSet<String>,
    ) -> Option<Selection> {
        if !season.fully_aired {
            return None;
        }

        let usable = prepare(releases, excluded).ok()?;
        let packs: Vec<RawRelease> = usable
            .into_iter()
            .filter(|raw| {
                let parsed = parse_release(raw);
                parsed.is_season_pack && parsed.season == Some(season.season_number)
            })
            .collect();

        if packs.is_empty() {
            return None;
        }

        let range = self
            .config
            .filesize
            .for_kind(MediaKind::Series)
            .scaled(season.episode_count);
        Some(self.rank(self.score_all(&packs, range), range))
    }

    /// Filter to the size window (falling back to everything when that
    /// leaves nothing), then order best first. Ties keep input order.
    fn rank(&self, scored: Vec<ScoredRelease>, range: SizeRange) -> Selection {
        let total = scored.len();
        let (inside, outside): (Vec<_>, Vec<_>) = scored
            .into_iter()
            .partition(|r| r.parsed.size_gb.is_some_and(|size| range.contains(size)));

        let used_fallback = inside.is_empty();
        let mut ranked = if used_fallback {
            debug!(
                total,
                min_gb = range.min,
                max_gb = range.max,
                "No candidate inside size range, falling back to unfiltered set"
            );
            let mut all = outside;
            all.sort_by_key(|r| r.first_seen);
            all
        } else {
            inside
        };

        ranked.sort_by(|a, b| b.score.cmp(&a.score).then(a.first_seen.cmp(&b.first_seen)));
        let ranked = self.trim_pool(ranked);

        Selection {
            ranked,
            used_fallback,
        }
    }

    /// Apply `max_results_per_resolution` to the alternates. The winner stays.
    fn trim_pool(&self, ranked: Vec<ScoredRelease>) -> Vec<ScoredRelease> {
        let Some(cap) = self.config.max_results_per_resolution else {
            return ranked;
        };

        let mut per_resolution: HashMap<Option<&'static str>, usize> = HashMap::new();
        ranked
            .into_iter()
            .enumerate()
            .filter(|(position, release)| {
                let key = release.parsed.resolution.map(|r| r.as_str());
                let seen = per_resolution.entry(key).or_insert(0);
                *seen += 1;
                *position == 0 || *seen <= cap
            })
            .map(|(_, release)| release)
            .collect()
    }
}

/// Drop duplicates (first one wins) and excluded sources.
fn prepare(
    releases: &[RawRelease],
    excluded: &HashSet<String>,
) -> Result<Vec<RawRelease>, RankingError> {
    if releases.is_empty() {
        return Err(RankingError::NoCandidates);
    }

    let mut seen = HashSet::new();
    let unique: Vec<&RawRelease> = releases
        .iter()
        .filter(|r| seen.insert(r.source_identifier.to_ascii_lowercase()))
        .collect();

    let usable: Vec<RawRelease> = unique
        .iter()
        .filter(|r| !excluded.contains(&r.source_identifier))
        .map(|r| (*r).clone())
        .collect();

    if usable.is_empty() {
        return Err(RankingError::AllExcluded(unique.len()));
    }
    Ok(usable)
}
