use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use super::{StageOutcome, StageWorker};
use crate::audit::{AuditEvent, AuditHandle};
use crate::eligibility::{scrape_episodes, WorkUnit};
use crate::item::{
    CandidateAttributes, Episode, Item, ItemStore, NewCandidate, PipelineStage,
    SeasonWithEpisodes, SelectionRecord, StoreError, SubjectRef,
};
use crate::metrics;
use crate::ranking::{RankingEngine, RawRelease, ScoredRelease, SeasonContext, Selection};
use crate::source::{CandidateQuery, CandidateSource};

/// `Ok(Err(reason))` means nothing was selected for the subject.
type SubjectResult = Result<Result<(), String>, StoreError>;

impl From<&ScoredRelease> for NewCandidate {
    fn from(release: &ScoredRelease) -> Self {
        let parsed = &release.parsed;
        Self {
            source_identifier: release.raw.source_identifier.clone(),
            raw_title: release.raw.title.clone(),
            attributes: CandidateAttributes {
                resolution: parsed.resolution.map(|r| r.as_str().to_string()),
                codec: parsed.codec.map(|c| c.as_str().to_string()),
                quality: parsed.quality.clone(),
                source: parsed.source.clone(),
                size_gb: parsed.size_gb,
                seed_count: parsed.seeders,
                languages: parsed.languages.clone(),
                is_season_pack: parsed.is_season_pack,
                pack_episode_count: parsed.pack_episode_count,
                filename: release.raw.filename.clone(),
            },
            score: release.score,
        }
    }
}

/// Fetches releases and persists the ranked candidates per subject.
///
/// Movies are one subject. Series are scraped per season: a fully aired
/// season with no selection yet tries a season pack first, anything else
/// goes episode by episode.
pub struct ScrapeWorker {
    store: Arc<dyn ItemStore>,
    source: Arc<dyn CandidateSource>,
    engine: Arc<RankingEngine>,
    audit: Option<AuditHandle>,
}

impl ScrapeWorker {
    pub fn new(
        store: Arc<dyn ItemStore>,
        source: Arc<dyn CandidateSource>,
        engine: Arc<RankingEngine>,
    ) -> Self {
        Self {
            store,
            source,
            engine,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    async fn fetch(&self, query: &CandidateQuery) -> Result<Vec<RawRelease>, String> {
        self.source.fetch(query).await.map_err(|e| {
            warn!(query = %query.label(), source = self.source.name(), error = %e, "Candidate fetch failed");
            format!("candidate source: {}", e)
        })
    }

    async fn scrape_movie(&self, item: &Item) -> Result<StageOutcome, StoreError> {
        let excluded = self.store.blacklisted_sources(&item.id)?;
        let releases = match self.fetch(&CandidateQuery::movie(item)).await {
            Ok(releases) => releases,
            Err(reason) => return Ok(StageOutcome::Retryable(reason)),
        };
        observe_considered("movie", releases.len());

        match self.engine.select(item.media_kind, &releases, &excluded) {
            Ok(selection) => {
                self.persist(item, SubjectRef::Movie, &selection, Vec::new(), releases.len())
                    .await?;
                Ok(StageOutcome::Success)
            }
            Err(e) => Ok(StageOutcome::Retryable(e.to_string())),
        }
    }

    async fn scrape_series(&self, item: &Item, today: NaiveDate) -> Result<StageOutcome, StoreError> {
        let seasons = self.store.list_seasons(&item.id)?;
        let wanted = scrape_episodes(&seasons, today);
        if wanted.is_empty() {
            let any_scraped = seasons
                .iter()
                .flat_map(|s| s.episodes.iter())
                .any(|e| e.scraped);
            return Ok(if any_scraped {
                StageOutcome::Success
            } else {
                StageOutcome::Retryable("no aired episodes awaiting a release".to_string())
            });
        }

        let excluded = self.store.blacklisted_sources(&item.id)?;
        let mut by_season: BTreeMap<u32, Vec<&Episode>> = BTreeMap::new();
        for episode in wanted {
            by_season
                .entry(episode.season_number)
                .or_default()
                .push(episode);
        }

        let mut selected = 0usize;
        let mut last_error = None;

        for (season_number, episodes) in by_season {
            let Some(season) = seasons
                .iter()
                .find(|s| s.season.season_number == season_number)
            else {
                continue;
            };

            // A pack would re-download episodes that already have a release.
            if episodes.len() == season.episodes.len() {
                match self.try_season_pack(item, season, &excluded, today).await? {
                    Ok(true) => {
                        selected += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(reason) => last_error = Some(reason),
                }
            }

            for episode in episodes {
                match self.scrape_episode(item, episode, &excluded).await? {
                    Ok(()) => selected += 1,
                    Err(reason) => {
                        debug!(
                            item_id = %item.id,
                            season = episode.season_number,
                            episode = episode.episode_number,
                            reason = %reason,
                            "No selection for episode"
                        );
                        last_error = Some(reason);
                    }
                }
            }
        }

        if selected == 0 {
            return Ok(StageOutcome::Retryable(
                last_error.unwrap_or_else(|| "no candidates selected".to_string()),
            ));
        }
        Ok(StageOutcome::Success)
    }

    /// `Ok(Ok(false))` when the season is still airing or no pack was offered.
    async fn try_season_pack(
        &self,
        item: &Item,
        season: &SeasonWithEpisodes,
        excluded: &HashSet<String>,
        today: NaiveDate,
    ) -> Result<Result<bool, String>, StoreError> {
        let context = SeasonContext {
            season_number: season.season.season_number,
            episode_count: season.episodes.len() as u32,
            fully_aired: season.fully_aired(today),
        };
        if !context.fully_aired {
            return Ok(Ok(false));
        }

        let query = CandidateQuery::season_pack(item, context.season_number);
        let releases = match self.fetch(&query).await {
            Ok(releases) => releases,
            Err(reason) => return Ok(Err(reason)),
        };
        observe_considered("season", releases.len());

        let Some(selection) = self.engine.select_season_pack(&releases, context, excluded) else {
            return Ok(Ok(false));
        };

        let episode_ids = season.episodes.iter().map(|e| e.id.clone()).collect();
        let subject = SubjectRef::Season {
            season_number: context.season_number,
        };
        self.persist(item, subject, &selection, episode_ids, releases.len())
            .await?;
        Ok(Ok(true))
    }

    async fn scrape_episode(
        &self,
        item: &Item,
        episode: &Episode,
        excluded: &HashSet<String>,
    ) -> SubjectResult {
        let query = CandidateQuery::episode(item, episode.season_number, episode.episode_number);
        let releases = match self.fetch(&query).await {
            Ok(releases) => releases,
            Err(reason) => return Ok(Err(reason)),
        };
        observe_considered("episode", releases.len());

        let selection = match self.engine.select_episode(
            &releases,
            episode.season_number,
            episode.episode_number,
            excluded,
        ) {
            Ok(selection) => selection,
            Err(e) => return Ok(Err(format!("{}: {}", query.label(), e))),
        };

        let subject = SubjectRef::Episode {
            episode_id: episode.id.clone(),
        };
        self.persist(item, subject, &selection, vec![episode.id.clone()], releases.len())
            .await?;
        Ok(Ok(()))
    }

    async fn persist(
        &self,
        item: &Item,
        subject: SubjectRef,
        selection: &Selection,
        episode_ids: Vec<String>,
        considered: usize,
    ) -> Result<(), StoreError> {
        let record = SelectionRecord {
            subject: subject.clone(),
            candidates: selection.ranked.iter().map(NewCandidate::from).collect(),
            selected: 0,
            episode_ids,
        };
        let winner = self.store.record_selection(&item.id, &record)?;

        if selection.used_fallback {
            metrics::SIZE_FALLBACKS.inc();
        }
        info!(
            item_id = %item.id,
            subject = %subject.key(),
            source_identifier = %winner.source_identifier,
            score = winner.score,
            pool = record.candidates.len(),
            "Candidate selected"
        );

        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::CandidateSelected {
                    item_id: item.id.clone(),
                    subject: subject.key(),
                    candidate_id: winner.id.clone(),
                    source_identifier: winner.source_identifier.clone(),
                    score: winner.score,
                    candidates_considered: considered as u32,
                    used_fallback: selection.used_fallback,
                })
                .await;
        }
        Ok(())
    }
}

fn observe_considered(subject: &str, count: usize) {
    metrics::CANDIDATES_CONSIDERED
        .with_label_values(&[subject])
        .observe(count as f64);
}

#[async_trait]
impl StageWorker for ScrapeWorker {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Scrape
    }

    async fn run(&self, unit: &WorkUnit) -> StageOutcome {
        let item = &unit.item;
        let result = if item.is_series() {
            self.scrape_series(item, Utc::now().date_naive()).await
        } else {
            self.scrape_movie(item).await
        };
        result.unwrap_or_else(StageOutcome::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::DispatchMode;
    use crate::item::{CandidateStatus, NewItem, SqliteItemStore};
    use crate::ranking::RankingConfig;
    use crate::source::SourceError;
    use crate::testing::{fixtures, MockSource};

    struct Setup {
        store: Arc<SqliteItemStore>,
        source: Arc<MockSource>,
        worker: ScrapeWorker,
    }

    fn setup() -> Setup {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let source = Arc::new(MockSource::new());
        let worker = ScrapeWorker::new(
            store.clone(),
            source.clone(),
            Arc::new(RankingEngine::new(RankingConfig::default())),
        );
        Setup {
            store,
            source,
            worker,
        }
    }

    fn unit(item: Item) -> WorkUnit {
        WorkUnit {
            item,
            stage: PipelineStage::Scrape,
            mode: DispatchMode::Advance,
        }
    }

    #[tokio::test]
    async fn test_movie_persists_ranked_pool() {
        let s = setup();
        let item = s.store.upsert_item(NewItem::movie("Film", Some(2020))).unwrap().item;
        s.source
            .set_releases(
                None,
                None,
                vec![
                    fixtures::release("aaa", "Film.2020.720p.x264", 10, 4.0),
                    fixtures::release("bbb", "Film.2020.1080p.x265", 10, 8.0),
                ],
            )
            .await;

        assert_eq!(s.worker.run(&unit(item.clone())).await, StageOutcome::Success);

        let candidates = s.store.list_candidates(&item.id, None).unwrap();
        assert_eq!(candidates.len(), 2);
        let selected: Vec<_> = candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Selected)
            .collect();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].source_identifier, "bbb");
        assert_eq!(selected[0].attributes.resolution.as_deref(), Some("1080p"));
    }

    #[tokio::test]
    async fn test_empty_results_and_fetch_errors_are_retryable() {
        let s = setup();
        let item = s.store.upsert_item(NewItem::movie("Film", None)).unwrap().item;

        assert!(matches!(
            s.worker.run(&unit(item.clone())).await,
            StageOutcome::Retryable(_)
        ));

        s.source.push_error(SourceError::Timeout).await;
        let outcome = s.worker.run(&unit(item)).await;
        assert!(matches!(outcome, StageOutcome::Retryable(ref r) if r.contains("candidate source")));
    }

    #[tokio::test]
    async fn test_fully_aired_season_prefers_pack() {
        let s = setup();
        let item = s.store.upsert_item(NewItem::series("Show", None)).unwrap().item;
        s.store
            .upsert_seasons(&item.id, &[fixtures::aired_season(1, 3)])
            .unwrap();
        s.source
            .set_releases(
                Some(1),
                None,
                vec![
                    fixtures::release("pack", "Show.S01.COMPLETE.1080p.x265", 50, 9.0),
                    fixtures::release("ep1", "Show.S01E01.1080p.x265", 50, 3.0),
                ],
            )
            .await;

        assert_eq!(s.worker.run(&unit(item.clone())).await, StageOutcome::Success);

        let seasons = s.store.list_seasons(&item.id).unwrap();
        let pack = s
            .store
            .list_candidates(&item.id, Some(CandidateStatus::Selected))
            .unwrap();
        assert_eq!(pack.len(), 1);
        assert_eq!(pack[0].subject, SubjectRef::Season { season_number: 1 });
        for episode in &seasons[0].episodes {
            assert!(episode.scraped);
            assert_eq!(episode.chosen_candidate_id.as_deref(), Some(pack[0].id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_episodes_and_accepts_partial_success() {
        let s = setup();
        let item = s.store.upsert_item(NewItem::series("Show", None)).unwrap().item;
        s.store
            .upsert_seasons(&item.id, &[fixtures::aired_season(1, 2)])
            .unwrap();
        s.source
            .set_releases(
                Some(1),
                Some(1),
                vec![fixtures::release("ep1", "Show.S01E01.1080p.x264", 20, 2.0)],
            )
            .await;

        assert_eq!(s.worker.run(&unit(item.clone())).await, StageOutcome::Success);

        let seasons = s.store.list_seasons(&item.id).unwrap();
        let scraped: Vec<bool> = seasons[0].episodes.iter().map(|e| e.scraped).collect();
        assert_eq!(scraped, vec![true, false]);
    }

    #[tokio::test]
    async fn test_unaired_episodes_are_not_queried() {
        let s = setup();
        let item = s.store.upsert_item(NewItem::series("Show", None)).unwrap().item;
        let future = Utc::now().date_naive() + chrono::Duration::days(30);
        s.store
            .upsert_seasons(&item.id, &[fixtures::season(1, 2, future)])
            .unwrap();

        assert!(matches!(
            s.worker.run(&unit(item)).await,
            StageOutcome::Retryable(_)
        ));
        assert!(s.source.recorded_queries().await.is_empty());
    }
}
