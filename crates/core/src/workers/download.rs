use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::{StageOutcome, StageWorker};
use crate::audit::{AuditEvent, AuditHandle};
use crate::downloader::{DownloadClient, DownloadRequest, DownloadStatus};
use crate::eligibility::{download_targets, WorkUnit};
use crate::item::{
    covered_by, Candidate, CandidateStatus, Item, ItemStore, PipelineStage, SeasonWithEpisodes,
    StoreError,
};
use crate::metrics;

/// Counts for one download pass.
#[derive(Debug, Default)]
struct Pass {
    ready: usize,
    waiting: usize,
    blacklisted: usize,
    errors: Vec<String>,
}

/// Resolves selected candidates at the debrid service.
///
/// A candidate the service reports as failed, or that stays in progress for
/// longer than the stall timeout, is blacklisted and replaced by the next
/// candidate of its pool. When the pool is empty the covered episodes are
/// cleared so the scrape stage picks them up again.
pub struct DownloadWorker {
    store: Arc<dyn ItemStore>,
    client: Arc<dyn DownloadClient>,
    require_complete_season: bool,
    /// `None` disables stall detection.
    stall_timeout: Option<Duration>,
    audit: Option<AuditHandle>,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<dyn ItemStore>,
        client: Arc<dyn DownloadClient>,
        require_complete_season: bool,
        stall_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            client,
            require_complete_season,
            stall_timeout: (stall_timeout_secs > 0)
                .then(|| Duration::seconds(stall_timeout_secs as i64)),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    fn stalled(&self, candidate: &Candidate, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.stall_timeout else {
            return false;
        };
        candidate.status == CandidateStatus::Downloading
            && candidate
                .download_started_at
                .is_some_and(|started| now - started > timeout)
    }

    async fn execute(&self, item: &Item) -> Result<StageOutcome, StoreError> {
        let now = Utc::now();
        let seasons = if item.is_series() {
            self.store.list_seasons(&item.id)?
        } else {
            Vec::new()
        };
        let candidates = self.store.list_candidates(&item.id, None)?;
        let targets = download_targets(
            &seasons,
            &candidates,
            self.require_complete_season,
            now.date_naive(),
        );

        let mut pass = Pass::default();
        for candidate in targets {
            self.resolve_one(item, candidate, &seasons, now, &mut pass)
                .await?;
        }

        let candidates = self.store.list_candidates(&item.id, None)?;
        let pending = candidates.iter().any(|c| {
            matches!(
                c.status,
                CandidateStatus::Selected | CandidateStatus::Downloading
            )
        });
        let done = candidates.iter().any(|c| {
            matches!(
                c.status,
                CandidateStatus::Downloaded | CandidateStatus::Published
            )
        });

        if !pending && done {
            return Ok(StageOutcome::Success);
        }

        // Transfers still running; the stall timeout decides when to give up.
        if pass.waiting > 0 && pass.blacklisted == 0 && pass.errors.is_empty() {
            return Ok(StageOutcome::Waiting(format!(
                "{} ready, {} in progress",
                pass.ready, pass.waiting
            )));
        }

        let reason = if pass.ready + pass.waiting + pass.blacklisted == 0 && pass.errors.is_empty() {
            if pending {
                "waiting for a complete season selection".to_string()
            } else {
                "no selected candidate to download".to_string()
            }
        } else {
            let mut reason = format!(
                "{} ready, {} in progress, {} blacklisted",
                pass.ready, pass.waiting, pass.blacklisted
            );
            if let Some(error) = pass.errors.last() {
                reason.push_str(&format!("; last error: {}", error));
            }
            reason
        };
        Ok(StageOutcome::Retryable(reason))
    }

    async fn resolve_one(
        &self,
        item: &Item,
        candidate: &Candidate,
        seasons: &[SeasonWithEpisodes],
        now: DateTime<Utc>,
        pass: &mut Pass,
    ) -> Result<(), StoreError> {
        let request = DownloadRequest::from(candidate);
        let status = match self.client.resolve(&request).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    item_id = %item.id,
                    source_identifier = %candidate.source_identifier,
                    client = self.client.name(),
                    error = %e,
                    "Download lookup failed"
                );
                pass.errors.push(e.to_string());
                return Ok(());
            }
        };

        match status {
            DownloadStatus::Ready { local_path } => {
                self.store.update_candidate_status(
                    &candidate.id,
                    CandidateStatus::Downloaded,
                    Some(&local_path),
                )?;
                info!(item_id = %item.id, local_path = %local_path, "Download ready");
                pass.ready += 1;
            }
            DownloadStatus::Pending { .. } | DownloadStatus::Queued
                if self.stalled(candidate, now) =>
            {
                self.blacklist(item, candidate, seasons, "stalled").await?;
                pass.blacklisted += 1;
            }
            DownloadStatus::Pending { progress } => {
                self.store
                    .update_candidate_status(&candidate.id, CandidateStatus::Downloading, None)?;
                debug!(item_id = %item.id, progress, "Download in progress");
                pass.waiting += 1;
            }
            DownloadStatus::Queued => {
                self.store
                    .update_candidate_status(&candidate.id, CandidateStatus::Downloading, None)?;
                pass.waiting += 1;
            }
            DownloadStatus::Failed { reason } => {
                warn!(
                    item_id = %item.id,
                    source_identifier = %candidate.source_identifier,
                    reason = %reason,
                    "Download failed at the service"
                );
                self.blacklist(item, candidate, seasons, "failed").await?;
                pass.blacklisted += 1;
            }
        }
        Ok(())
    }

    /// Blacklist the source and promote the next pooled candidate, or clear
    /// the covered episodes when nothing is left.
    async fn blacklist(
        &self,
        item: &Item,
        candidate: &Candidate,
        seasons: &[SeasonWithEpisodes],
        reason: &str,
    ) -> Result<(), StoreError> {
        self.store.blacklist_candidate(&candidate.id, reason)?;
        metrics::BLACKLISTED.with_label_values(&[reason]).inc();

        let episode_ids: Vec<String> = covered_by(&candidate.subject, seasons)
            .into_iter()
            .map(String::from)
            .collect();

        // list_candidates orders by subject then rank.
        let next = self
            .store
            .list_candidates(&item.id, Some(CandidateStatus::Rejected))?
            .into_iter()
            .find(|c| c.subject == candidate.subject);

        let replacement = match next {
            Some(next) => Some(self.store.promote_candidate(&next.id, &episode_ids)?),
            None => {
                self.store.clear_episode_selection(&episode_ids)?;
                None
            }
        };

        info!(
            item_id = %item.id,
            subject = %candidate.subject.key(),
            source_identifier = %candidate.source_identifier,
            reason,
            replacement = replacement.as_ref().map(|c| c.source_identifier.as_str()).unwrap_or("none"),
            "Candidate blacklisted"
        );

        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::CandidateBlacklisted {
                    item_id: item.id.clone(),
                    subject: candidate.subject.key(),
                    candidate_id: candidate.id.clone(),
                    source_identifier: candidate.source_identifier.clone(),
                    reason: reason.to_string(),
                    replacement_id: replacement.as_ref().map(|c| c.id.clone()),
                })
                .await;
            if let Some(ref promoted) = replacement {
                audit
                    .emit(AuditEvent::CandidateSelected {
                        item_id: item.id.clone(),
                        subject: promoted.subject.key(),
                        candidate_id: promoted.id.clone(),
                        source_identifier: promoted.source_identifier.clone(),
                        score: promoted.score,
                        candidates_considered: 0,
                        used_fallback: false,
                    })
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StageWorker for DownloadWorker {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Download
    }

    async fn run(&self, unit: &WorkUnit) -> StageOutcome {
        self.execute(&unit.item)
            .await
            .unwrap_or_else(StageOutcome::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::DispatchMode;
    use crate::item::{NewCandidate, NewItem, SelectionRecord, SqliteItemStore, SubjectRef};
    use crate::testing::{fixtures, MockDownloadClient};

    fn pool(sources: &[&str]) -> SelectionRecord {
        SelectionRecord {
            subject: SubjectRef::Movie,
            candidates: sources
                .iter()
                .enumerate()
                .map(|(i, s)| NewCandidate {
                    source_identifier: s.to_string(),
                    raw_title: format!("Film {}", s),
                    score: 100 - i as i64,
                    ..Default::default()
                })
                .collect(),
            selected: 0,
            episode_ids: Vec::new(),
        }
    }

    fn movie(store: &SqliteItemStore, sources: &[&str]) -> WorkUnit {
        let item = store.upsert_item(NewItem::movie("Film", None)).unwrap().item;
        store.record_selection(&item.id, &pool(sources)).unwrap();
        WorkUnit {
            item,
            stage: PipelineStage::Download,
            mode: DispatchMode::Advance,
        }
    }

    fn selected(store: &SqliteItemStore, item_id: &str) -> Vec<String> {
        store
            .list_candidates(item_id, Some(CandidateStatus::Selected))
            .unwrap()
            .into_iter()
            .map(|c| c.source_identifier)
            .collect()
    }

    #[tokio::test]
    async fn test_ready_marks_downloaded() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let client = Arc::new(MockDownloadClient::new());
        let worker = DownloadWorker::new(store.clone(), client, false, 0);
        let unit = movie(&store, &["aaa"]);

        assert_eq!(worker.run(&unit).await, StageOutcome::Success);
        let downloaded = store
            .list_candidates(&unit.item.id, Some(CandidateStatus::Downloaded))
            .unwrap();
        assert_eq!(downloaded[0].local_path.as_deref(), Some("/mnt/mock/aaa"));

        // A second run finds nothing left to do and still succeeds.
        assert_eq!(worker.run(&unit).await, StageOutcome::Success);
    }

    #[tokio::test]
    async fn test_pending_waits_and_marks_downloading() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let client = Arc::new(MockDownloadClient::new());
        client
            .set_status("aaa", DownloadStatus::Pending { progress: 0.4 })
            .await;
        let worker = DownloadWorker::new(store.clone(), client, false, 3600);
        let unit = movie(&store, &["aaa"]);

        assert!(matches!(worker.run(&unit).await, StageOutcome::Waiting(_)));
        let downloading = store
            .list_candidates(&unit.item.id, Some(CandidateStatus::Downloading))
            .unwrap();
        assert_eq!(downloading.len(), 1);
        assert!(downloading[0].download_started_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_download_promotes_next_candidate() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let client = Arc::new(MockDownloadClient::new());
        client
            .set_status(
                "aaa",
                DownloadStatus::Failed {
                    reason: "dead torrent".to_string(),
                },
            )
            .await;
        let worker = DownloadWorker::new(store.clone(), client.clone(), false, 0);
        let unit = movie(&store, &["aaa", "bbb", "ccc"]);

        assert!(matches!(worker.run(&unit).await, StageOutcome::Retryable(_)));
        assert_eq!(selected(&store, &unit.item.id), vec!["bbb".to_string()]);
        assert!(store
            .blacklisted_sources(&unit.item.id)
            .unwrap()
            .contains("aaa"));

        assert_eq!(worker.run(&unit).await, StageOutcome::Success);
        assert_eq!(client.requested_sources().await, vec!["aaa", "bbb"]);
    }

    #[tokio::test]
    async fn test_stalled_download_is_blacklisted() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let client = Arc::new(MockDownloadClient::new());
        client.set_status("aaa", DownloadStatus::Queued).await;
        let worker = DownloadWorker::new(store.clone(), client, false, 3600);
        let unit = movie(&store, &["aaa", "bbb"]);

        let mut candidate = store
            .list_candidates(&unit.item.id, Some(CandidateStatus::Selected))
            .unwrap()
            .remove(0);
        assert!(!worker.stalled(&candidate, Utc::now()));

        candidate.status = CandidateStatus::Downloading;
        candidate.download_started_at = Some(Utc::now() - Duration::hours(2));
        assert!(worker.stalled(&candidate, Utc::now()));

        let seasons = Vec::new();
        let mut pass = Pass::default();
        worker
            .resolve_one(&unit.item, &candidate, &seasons, Utc::now(), &mut pass)
            .await
            .unwrap();
        assert_eq!(pass.blacklisted, 1);
        assert_eq!(selected(&store, &unit.item.id), vec!["bbb".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_pool_clears_episode_selection() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let client = Arc::new(MockDownloadClient::new());
        client
            .set_status(
                "ep1",
                DownloadStatus::Failed {
                    reason: "gone".to_string(),
                },
            )
            .await;
        let worker = DownloadWorker::new(store.clone(), client, false, 0);

        let item = store.upsert_item(NewItem::series("Show", None)).unwrap().item;
        store
            .upsert_seasons(&item.id, &[fixtures::aired_season(1, 1)])
            .unwrap();
        let episode_id = store.list_seasons(&item.id).unwrap()[0].episodes[0].id.clone();
        store
            .record_selection(
                &item.id,
                &SelectionRecord {
                    subject: SubjectRef::Episode {
                        episode_id: episode_id.clone(),
                    },
                    candidates: vec![NewCandidate {
                        source_identifier: "ep1".to_string(),
                        ..Default::default()
                    }],
                    selected: 0,
                    episode_ids: vec![episode_id],
                },
            )
            .unwrap();

        let unit = WorkUnit {
            item: item.clone(),
            stage: PipelineStage::Download,
            mode: DispatchMode::Advance,
        };
        assert!(matches!(worker.run(&unit).await, StageOutcome::Retryable(_)));

        let episode = &store.list_seasons(&item.id).unwrap()[0].episodes[0];
        assert!(!episode.scraped);
        assert!(episode.chosen_candidate_id.is_none());
    }
}
