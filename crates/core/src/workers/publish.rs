use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{StageOutcome, StageWorker};
use crate::eligibility::{publish_targets, WorkUnit};
use crate::item::{
    CandidateStatus, Item, ItemStore, PipelineStage, SeasonWithEpisodes, StoreError, SubjectRef,
};
use crate::publisher::{PublishError, PublishRequest, Publisher};

/// Places every downloaded candidate into its libraries.
pub struct PublishWorker {
    store: Arc<dyn ItemStore>,
    publisher: Arc<dyn Publisher>,
}

impl PublishWorker {
    pub fn new(store: Arc<dyn ItemStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    async fn execute(&self, item: &Item) -> Result<StageOutcome, StoreError> {
        let seasons = if item.is_series() {
            self.store.list_seasons(&item.id)?
        } else {
            Vec::new()
        };
        let candidates = self.store.list_candidates(&item.id, None)?;
        let targets = publish_targets(&candidates);

        let mut failure = None;
        for candidate in targets {
            let request = PublishRequest {
                item: item.clone(),
                candidate: candidate.clone(),
                season_number: season_of(&candidate.subject, &seasons),
            };

            match self.publisher.publish(&request).await {
                Ok(result) => {
                    self.store.update_candidate_status(
                        &candidate.id,
                        CandidateStatus::Published,
                        None,
                    )?;
                    info!(
                        item_id = %item.id,
                        candidate_id = %candidate.id,
                        links = result.links.len(),
                        "Candidate published"
                    );
                }
                Err(e) => {
                    warn!(
                        item_id = %item.id,
                        candidate_id = %candidate.id,
                        publisher = self.publisher.name(),
                        error = %e,
                        "Publish failed"
                    );
                    let outcome = match e {
                        PublishError::UnknownLibrary(_)
                        | PublishError::NoDestination(_)
                        | PublishError::DestinationExists { .. } => {
                            StageOutcome::Terminal(e.to_string())
                        }
                        _ => StageOutcome::Retryable(e.to_string()),
                    };
                    failure = Some(outcome);
                }
            }
        }

        if let Some(outcome) = failure {
            return Ok(outcome);
        }

        let published = self
            .store
            .list_candidates(&item.id, Some(CandidateStatus::Published))?;
        if published.is_empty() {
            return Ok(StageOutcome::Retryable(
                "no downloaded candidate to publish".to_string(),
            ));
        }
        Ok(StageOutcome::Success)
    }
}

/// Season folder for a candidate's subject.
fn season_of(subject: &SubjectRef, seasons: &[SeasonWithEpisodes]) -> Option<u32> {
    match subject {
        SubjectRef::Movie => None,
        SubjectRef::Season { season_number } => Some(*season_number),
        SubjectRef::Episode { episode_id } => seasons
            .iter()
            .flat_map(|s| s.episodes.iter())
            .find(|e| &e.id == episode_id)
            .map(|e| e.season_number),
    }
}

#[async_trait]
impl StageWorker for PublishWorker {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Publish
    }

    async fn run(&self, unit: &WorkUnit) -> StageOutcome {
        self.execute(&unit.item)
            .await
            .unwrap_or_else(StageOutcome::from)
    }
}
