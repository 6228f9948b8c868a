//! Stage eligibility resolution.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::predicates::{download_targets, needs_rescrape, publish_targets, scrape_episodes};
use crate::item::{Item, ItemFilter, ItemStage, ItemStore, PipelineStage, StoreError};

/// How a work unit relates to the item's stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// The item awaits this stage; success advances it.
    Advance,
    /// The item sits past this stage but one of its subjects needs the
    /// stage again (blacklisted selection). Success leaves the stage alone.
    Subject,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Advance => "advance",
            DispatchMode::Subject => "subject",
        }
    }
}

/// One item dispatched to one stage worker.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub item: Item,
    pub stage: PipelineStage,
    pub mode: DispatchMode,
}

/// Evaluates per-stage readiness against the store.
pub struct StageResolver {
    store: Arc<dyn ItemStore>,
    require_complete_season: bool,
}

impl StageResolver {
    pub fn new(store: Arc<dyn ItemStore>, require_complete_season: bool) -> Self {
        Self {
            store,
            require_complete_season,
        }
    }

    /// Items ready for `stage` right now, at most `limit`.
    ///
    /// Items waiting out a backoff or holding a live claim for any stage are
    /// excluded.
    pub fn resolve(
        &self,
        stage: PipelineStage,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        let mut stages = vec![stage.pending(), stage.failure()];
        if stage == PipelineStage::Scrape {
            stages.extend([ItemStage::Scraped, ItemStage::DownloadFailed]);
        }

        let filter = ItemFilter::new()
            .with_stages(stages)
            .ready_at(now)
            .unclaimed_at(now)
            .with_limit(-1);

        let mut units = Vec::new();
        for item in self.store.list_items(&filter)? {
            if units.len() >= limit {
                break;
            }
            if let Some(mode) = self.mode_for(&item, stage, now)? {
                units.push(WorkUnit { item, stage, mode });
            }
        }
        Ok(units)
    }

    /// Re-evaluate one item, e.g. after a claim was taken.
    pub fn check(
        &self,
        item: &Item,
        stage: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchMode>, StoreError> {
        if item.retry_after.is_some_and(|at| at > now) {
            return Ok(None);
        }
        self.mode_for(item, stage, now)
    }

    fn mode_for(
        &self,
        item: &Item,
        stage: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchMode>, StoreError> {
        let today = now.date_naive();
        let awaits = item.current_stage.awaits(stage);

        let ready = match stage {
            PipelineStage::Index | PipelineStage::Match => {
                return Ok(awaits.then_some(DispatchMode::Advance));
            }
            PipelineStage::Scrape => {
                let seasons = if item.is_series() {
                    self.store.list_seasons(&item.id)?
                } else {
                    Vec::new()
                };

                if awaits {
                    let ready = !item.is_series() || !scrape_episodes(&seasons, today).is_empty();
                    return Ok(ready.then_some(DispatchMode::Advance));
                }

                if !matches!(
                    item.current_stage,
                    ItemStage::Scraped | ItemStage::DownloadFailed
                ) {
                    return Ok(None);
                }
                let candidates = self.store.list_candidates(&item.id, None)?;
                let lost = needs_rescrape(item.is_series(), &seasons, &candidates, today);
                return Ok(lost.then_some(DispatchMode::Subject));
            }
            PipelineStage::Download => {
                if !awaits {
                    return Ok(None);
                }
                let seasons = if item.is_series() {
                    self.store.list_seasons(&item.id)?
                } else {
                    Vec::new()
                };
                let candidates = self.store.list_candidates(&item.id, None)?;
                !download_targets(&seasons, &candidates, self.require_complete_season, today)
                    .is_empty()
            }
            PipelineStage::Publish => {
                if !awaits {
                    return Ok(None);
                }
                let candidates = self.store.list_candidates(&item.id, None)?;
                !publish_targets(&candidates).is_empty()
            }
        };

        Ok(ready.then_some(DispatchMode::Advance))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};

    use super::*;
    use crate::item::{
        CandidateStatus, NewCandidate, NewEpisode, NewItem, NewSeason, SelectionRecord,
        SqliteItemStore, StageUpdate, SubjectRef,
    };

    fn store() -> Arc<SqliteItemStore> {
        Arc::new(SqliteItemStore::in_memory().unwrap())
    }

    fn move_to(store: &SqliteItemStore, item: &Item, path: &[ItemStage]) -> Item {
        let mut current = item.clone();
        for to in path {
            current = store
                .apply_stage_update(
                    &current.id,
                    &StageUpdate {
                        from: current.current_stage,
                        to: *to,
                        retry_count: 0,
                        retry_after: None,
                    },
                )
                .unwrap();
        }
        current
    }

    fn select_movie(store: &SqliteItemStore, item: &Item, sources: &[&str]) {
        store
            .record_selection(
                &item.id,
                &SelectionRecord {
                    subject: SubjectRef::Movie,
                    candidates: sources
                        .iter()
                        .map(|s| NewCandidate {
                            source_identifier: s.to_string(),
                            raw_title: s.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                    selected: 0,
                    episode_ids: vec![],
                },
            )
            .unwrap();
    }

    const TO_SCRAPED: [ItemStage; 4] = [
        ItemStage::Indexed,
        ItemStage::LibraryMatched,
        ItemStage::Scraped,
        ItemStage::Downloaded,
    ];

    #[test]
    fn test_index_picks_new_and_ready_failures() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        let now = Utc::now();

        let fresh = store.upsert_item(NewItem::movie("Fresh", None)).unwrap().item;
        let waiting = store.upsert_item(NewItem::movie("Waiting", None)).unwrap().item;
        store
            .apply_stage_update(
                &waiting.id,
                &StageUpdate {
                    from: ItemStage::New,
                    to: ItemStage::IndexFailed,
                    retry_count: 1,
                    retry_after: Some(now + Duration::minutes(5)),
                },
            )
            .unwrap();

        let units = resolver.resolve(PipelineStage::Index, now, 10).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].item.id, fresh.id);
        assert_eq!(units[0].mode, DispatchMode::Advance);

        let later = resolver
            .resolve(PipelineStage::Index, now + Duration::minutes(6), 10)
            .unwrap();
        assert_eq!(later.len(), 2);
    }

    #[test]
    fn test_claimed_items_are_excluded() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        let now = Utc::now();
        let item = store.upsert_item(NewItem::movie("A", None)).unwrap().item;

        store
            .try_claim(&item.id, PipelineStage::Index, now, Duration::seconds(60))
            .unwrap()
            .unwrap();
        assert!(resolver.resolve(PipelineStage::Index, now, 10).unwrap().is_empty());

        let after_lease = now + Duration::seconds(61);
        assert_eq!(
            resolver
                .resolve(PipelineStage::Index, after_lease, 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_claim_on_one_stage_hides_item_from_others() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        let now = Utc::now();
        let item = store.upsert_item(NewItem::movie("A", None)).unwrap().item;
        move_to(&store, &item, &[ItemStage::Indexed, ItemStage::LibraryMatched]);
        assert_eq!(resolver.resolve(PipelineStage::Scrape, now, 10).unwrap().len(), 1);

        store
            .try_claim(&item.id, PipelineStage::Download, now, Duration::seconds(60))
            .unwrap()
            .unwrap();
        assert!(resolver.resolve(PipelineStage::Scrape, now, 10).unwrap().is_empty());
        assert!(store
            .try_claim(&item.id, PipelineStage::Scrape, now, Duration::seconds(60))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_limit_caps_batch() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        for n in 0..5 {
            store
                .upsert_item(NewItem::movie(format!("Movie {}", n), None))
                .unwrap();
        }
        let units = resolver.resolve(PipelineStage::Index, Utc::now(), 3).unwrap();
        assert_eq!(units.len(), 3);
    }

    #[test]
    fn test_series_scrape_waits_for_air_date() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        let now = Utc::now();
        let item = store.upsert_item(NewItem::series("Show", None)).unwrap().item;
        let item = move_to(&store, &item, &TO_SCRAPED[..2]);

        let future = (now + Duration::days(30)).date_naive();
        store
            .upsert_seasons(
                &item.id,
                &[NewSeason {
                    season_number: 1,
                    air_date: Some(future),
                    episodes: vec![NewEpisode {
                        episode_number: 1,
                        title: None,
                        air_date: Some(future),
                    }],
                }],
            )
            .unwrap();
        assert!(resolver.resolve(PipelineStage::Scrape, now, 10).unwrap().is_empty());

        let aired = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        store
            .upsert_seasons(
                &item.id,
                &[NewSeason {
                    season_number: 1,
                    air_date: Some(aired),
                    episodes: vec![NewEpisode {
                        episode_number: 1,
                        title: None,
                        air_date: Some(aired),
                    }],
                }],
            )
            .unwrap();
        assert_eq!(resolver.resolve(PipelineStage::Scrape, now, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_blacklisted_movie_returns_to_scrape_in_subject_mode() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        let now = Utc::now();
        let item = store.upsert_item(NewItem::movie("A", None)).unwrap().item;
        let item = move_to(&store, &item, &TO_SCRAPED[..3]);
        select_movie(&store, &item, &["h1"]);

        assert!(resolver.resolve(PipelineStage::Scrape, now, 10).unwrap().is_empty());
        assert_eq!(
            resolver.resolve(PipelineStage::Download, now, 10).unwrap().len(),
            1
        );

        let selected = store
            .list_candidates(&item.id, Some(CandidateStatus::Selected))
            .unwrap();
        store.blacklist_candidate(&selected[0].id, "dead torrent").unwrap();

        let units = resolver.resolve(PipelineStage::Scrape, now, 10).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].mode, DispatchMode::Subject);
        assert!(resolver.resolve(PipelineStage::Download, now, 10).unwrap().is_empty());
    }

    #[test]
    fn test_publish_needs_downloaded_candidate() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        let now = Utc::now();
        let item = store.upsert_item(NewItem::movie("A", None)).unwrap().item;
        let item = move_to(&store, &item, &TO_SCRAPED);
        select_movie(&store, &item, &["h1"]);

        assert!(resolver.resolve(PipelineStage::Publish, now, 10).unwrap().is_empty());

        let selected = store
            .list_candidates(&item.id, Some(CandidateStatus::Selected))
            .unwrap();
        store
            .update_candidate_status(&selected[0].id, CandidateStatus::Downloaded, Some("/m/a"))
            .unwrap();
        assert_eq!(
            resolver.resolve(PipelineStage::Publish, now, 10).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_terminal_failures_are_never_eligible() {
        let store = store();
        let resolver = StageResolver::new(store.clone(), false);
        let item = store.upsert_item(NewItem::movie("A", None)).unwrap().item;
        move_to(&store, &item, &[ItemStage::Failed(PipelineStage::Index)]);

        for stage in PipelineStage::ALL {
            assert!(resolver.resolve(stage, Utc::now(), 10).unwrap().is_empty());
        }
    }
}
