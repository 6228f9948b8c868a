//! Pipeline orchestrator implementation.
//!
//! Drives items through the stage machine automatically:
//! - One loop per stage, each on its own poll interval
//! - Batches are claimed up front and run with bounded fan-out
//! - A periodic rescan re-admits series with aired but unscraped episodes

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::eligibility::{scrape_episodes, DispatchMode, StageResolver, WorkUnit};
use crate::item::{
    Claim, Item, ItemFilter, ItemStage, ItemStore, MediaKind, PipelineStage, StageUpdate,
    StoreError,
};
use crate::metadata::MetadataIndexer;
use crate::metrics::{
    CLAIMS_LOST, READMISSIONS, STAGE_DISPATCHES, STAGE_DURATION, STAGE_OUTCOMES, WORKER_TIMEOUTS,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::workers::{StageOutcome, StageWorker};

use super::config::OrchestratorConfig;
use super::types::{
    OrchestratorError, OrchestratorStatus, RescanReport, TickReport, UnitResult,
};

/// State shared between the orchestrator handle and its spawned loops.
#[derive(Clone)]
struct Pipeline {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn ItemStore>,
    resolver: Arc<StageResolver>,
    workers: Arc<BTreeMap<PipelineStage, Arc<dyn StageWorker>>>,
    indexer: Option<Arc<dyn MetadataIndexer>>,
    audit: Option<AuditHandle>,
    last_ticks: Arc<RwLock<BTreeMap<PipelineStage, DateTime<Utc>>>>,
    last_rescan: Arc<RwLock<Option<DateTime<Utc>>>>,
}

/// The pipeline orchestrator - sole mutator of item stage and retry state.
pub struct PipelineOrchestrator {
    pipeline: Pipeline,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineOrchestrator {
    /// Create a new orchestrator. Workers are keyed by the stage they report;
    /// a later worker for the same stage replaces an earlier one.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn ItemStore>,
        workers: Vec<Arc<dyn StageWorker>>,
        audit: Option<AuditHandle>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let resolver = StageResolver::new(Arc::clone(&store), config.require_complete_season);
        let workers = workers
            .into_iter()
            .map(|worker| (worker.stage(), worker))
            .collect();

        Self {
            pipeline: Pipeline {
                config: Arc::new(config),
                store,
                resolver: Arc::new(resolver),
                workers: Arc::new(workers),
                indexer: None,
                audit,
                last_ticks: Arc::new(RwLock::new(BTreeMap::new())),
                last_rescan: Arc::new(RwLock::new(None)),
            },
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Indexer used to refresh series metadata before a rescan.
    pub fn with_indexer(mut self, indexer: Arc<dyn MetadataIndexer>) -> Self {
        self.pipeline.indexer = Some(indexer);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.pipeline.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start the orchestrator (spawns background tasks).
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!("Starting pipeline orchestrator");

        let mut tasks = self.tasks.lock().await;
        for stage in self.pipeline.active_stages() {
            tasks.push(self.spawn_stage_loop(stage));
        }
        if self.pipeline.config.rescan_interval_secs > 0 {
            tasks.push(self.spawn_rescan_loop());
        }

        info!(loops = tasks.len(), "Pipeline orchestrator started");
    }

    /// Stop the orchestrator gracefully.
    ///
    /// Stage loops finish their current batch; each worker run is bounded by
    /// the worker timeout. Loops still busy after the grace window are
    /// aborted, so nothing they hold (audit handles included) outlives stop.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping pipeline orchestrator");

        // Signal shutdown to all loops
        let _ = self.shutdown_tx.send(());

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let grace = Duration::from_secs(self.pipeline.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, futures::future::join_all(tasks.iter_mut()))
            .await
            .is_ok();

        if !drained {
            tasks.retain(|task| !task.is_finished());
            warn!(
                grace_secs = grace.as_secs(),
                aborted = tasks.len(),
                "Stage loops did not drain within the grace window, aborting"
            );
            for task in &tasks {
                task.abort();
            }
            // Cancelled loops drop their state once joined.
            futures::future::join_all(tasks).await;
        }

        info!("Pipeline orchestrator stopped");
    }

    /// Get current orchestrator status.
    pub async fn status(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        let items_by_stage = self
            .pipeline
            .store
            .count_by_stage()?
            .into_iter()
            .map(|(stage, count)| (stage.to_string(), count))
            .collect();

        Ok(OrchestratorStatus {
            running: self.is_running(),
            active_stages: self.pipeline.active_stages(),
            last_ticks: self.pipeline.last_ticks.read().await.clone(),
            last_rescan: *self.pipeline.last_rescan.read().await,
            items_by_stage,
        })
    }

    /// Resolve, claim and dispatch one batch for `stage`.
    pub async fn run_stage_once(&self, stage: PipelineStage) -> Result<TickReport, OrchestratorError> {
        self.pipeline.run_stage(stage).await
    }

    /// Run the series rescan now.
    pub async fn rescan_now(&self) -> Result<RescanReport, OrchestratorError> {
        Ok(self.pipeline.rescan().await?)
    }

    /// Move a terminally failed item back to its stage's pending value.
    pub async fn reset_item(&self, item_id: &str, actor: &str) -> Result<Item, OrchestratorError> {
        let store = &self.pipeline.store;
        let item = store
            .get_item(item_id)?
            .ok_or_else(|| OrchestratorError::ItemNotFound(item_id.to_string()))?;

        let ItemStage::Failed(stage) = item.current_stage else {
            return Err(OrchestratorError::InvalidState {
                expected: "failed_*".to_string(),
                actual: item.current_stage,
            });
        };

        let update = StageUpdate {
            from: item.current_stage,
            to: stage.pending(),
            retry_count: 0,
            retry_after: None,
        };
        let reset = store.apply_stage_update(item_id, &update)?;

        info!(item_id, stage = %stage, actor, "Reset terminally failed item");

        if let Some(ref audit) = self.pipeline.audit {
            audit
                .emit(AuditEvent::ItemReset {
                    item_id: item_id.to_string(),
                    reset_by: actor.to_string(),
                    previous_stage: item.current_stage.to_string(),
                })
                .await;
            audit
                .emit(stage_changed(&item, &reset, Some(format!("reset by {}", actor))))
                .await;
        }

        Ok(reset)
    }

    /// Spawn the loop task for one stage.
    fn spawn_stage_loop(&self, stage: PipelineStage) -> JoinHandle<()> {
        let running = Arc::clone(&self.running);
        let pipeline = self.pipeline.clone();
        let interval = Duration::from_millis(pipeline.config.stages.get(stage).poll_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!(stage = %stage, "Stage loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(stage = %stage, "Stage loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        match pipeline.run_stage(stage).await {
                            Ok(report) if report.resolved > 0 => {
                                debug!(stage = %stage, ?report, "Stage tick finished");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(stage = %stage, error = %e, "Stage tick failed"),
                        }
                    }
                }
            }
            info!(stage = %stage, "Stage loop stopped");
        })
    }

    /// Spawn the periodic rescan task.
    fn spawn_rescan_loop(&self) -> JoinHandle<()> {
        let running = Arc::clone(&self.running);
        let pipeline = self.pipeline.clone();
        let interval = Duration::from_secs(pipeline.config.rescan_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Rescan loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Rescan loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = pipeline.rescan().await {
                            error!(error = %e, "Rescan failed");
                        }
                    }
                }
            }
            info!("Rescan loop stopped");
        })
    }
}

impl Pipeline {
    fn active_stages(&self) -> Vec<PipelineStage> {
        PipelineStage::ALL
            .into_iter()
            .filter(|stage| self.config.stages.get(*stage).active && self.workers.contains_key(stage))
            .collect()
    }

    fn policy(&self, stage: PipelineStage) -> RetryPolicy {
        RetryPolicy::new(self.config.stages.get(stage).max_retries, &self.config.backoff)
    }

    async fn run_stage(&self, stage: PipelineStage) -> Result<TickReport, OrchestratorError> {
        let worker = self
            .workers
            .get(&stage)
            .cloned()
            .ok_or(OrchestratorError::NoWorker(stage))?;

        let now = Utc::now();
        self.last_ticks.write().await.insert(stage, now);

        let settings = self.config.stages.get(stage);
        let units = self.resolver.resolve(stage, now, settings.batch_size)?;
        let mut report = TickReport {
            resolved: units.len(),
            ..Default::default()
        };
        if units.is_empty() {
            return Ok(report);
        }

        // Claim the whole batch before running any of it.
        let lease = chrono::Duration::seconds(self.config.claim_lease_secs.min(u32::MAX as u64) as i64);
        let mut claimed = Vec::with_capacity(units.len());
        for unit in units {
            match self.store.try_claim(&unit.item.id, stage, now, lease)? {
                Some(claim) => claimed.push((unit, claim)),
                None => {
                    CLAIMS_LOST.with_label_values(&[stage.as_str()]).inc();
                    report.record(UnitResult::Lost);
                }
            }
        }

        let results: Vec<UnitResult> = stream::iter(claimed)
            .map(|(unit, claim)| {
                let pipeline = self.clone();
                let worker = Arc::clone(&worker);
                async move { pipeline.dispatch(worker, unit, claim).await }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            report.record(result);
        }
        Ok(report)
    }

    /// Run one claimed unit and release the claim, whatever happens.
    async fn dispatch(&self, worker: Arc<dyn StageWorker>, unit: WorkUnit, claim: Claim) -> UnitResult {
        let stage = unit.stage;
        let item_id = unit.item.id.clone();

        let result = match self.run_claimed(worker, unit).await {
            Ok(result) => result,
            Err(e) => {
                error!(item_id = %item_id, stage = %stage, error = %e, "Failed to apply stage outcome");
                UnitResult::Lost
            }
        };

        if let Err(e) = self.store.release_claim(&claim) {
            warn!(item_id = %item_id, stage = %stage, error = %e, "Failed to release claim");
        }

        STAGE_OUTCOMES
            .with_label_values(&[stage.as_str(), result.as_str()])
            .inc();
        result
    }

    async fn run_claimed(
        &self,
        worker: Arc<dyn StageWorker>,
        unit: WorkUnit,
    ) -> Result<UnitResult, StoreError> {
        let stage = unit.stage;

        // The listing may be stale by the time the claim is held.
        let Some(item) = self.store.get_item(&unit.item.id)? else {
            return Ok(UnitResult::Lost);
        };
        let Some(mode) = self.resolver.check(&item, stage, Utc::now())? else {
            debug!(item_id = %item.id, stage = %stage, "Item no longer eligible after claim");
            CLAIMS_LOST.with_label_values(&[stage.as_str()]).inc();
            return Ok(UnitResult::Lost);
        };
        let unit = WorkUnit { item, stage, mode };

        STAGE_DISPATCHES
            .with_label_values(&[stage.as_str(), mode.as_str()])
            .inc();
        debug!(item_id = %unit.item.id, stage = %stage, mode = mode.as_str(), "Dispatching");

        let timeout_secs = self.config.worker_timeout_secs;
        let timer = STAGE_DURATION.with_label_values(&[stage.as_str()]).start_timer();
        let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), worker.run(&unit)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                WORKER_TIMEOUTS.with_label_values(&[stage.as_str()]).inc();
                warn!(item_id = %unit.item.id, stage = %stage, timeout_secs, "Worker timed out");
                StageOutcome::Retryable(format!("worker timed out after {}s", timeout_secs))
            }
        };
        timer.observe_duration();

        self.apply_outcome(&unit, &outcome, Utc::now()).await
    }

    /// Translate a worker outcome into exactly one stage change.
    async fn apply_outcome(
        &self,
        unit: &WorkUnit,
        outcome: &StageOutcome,
        now: DateTime<Utc>,
    ) -> Result<UnitResult, StoreError> {
        let Some(current) = self.store.get_item(&unit.item.id)? else {
            return Ok(UnitResult::Lost);
        };

        let stage = match unit.mode {
            DispatchMode::Advance => {
                if !current.current_stage.awaits(unit.stage) {
                    return Ok(UnitResult::Lost);
                }
                unit.stage
            }
            DispatchMode::Subject => {
                if !matches!(
                    current.current_stage,
                    ItemStage::Scraped | ItemStage::DownloadFailed
                ) {
                    return Ok(UnitResult::Lost);
                }
                if outcome.is_success() {
                    debug!(item_id = %current.id, stage = %unit.stage, "Subject re-selected");
                    return Ok(UnitResult::Unchanged);
                }
                // Recorded against the stage the item is waiting on.
                PipelineStage::Download
            }
        };

        let (to, retry_count, retry_after, result) = match outcome {
            StageOutcome::Success => (stage.done(), 0, None, UnitResult::Advanced),
            StageOutcome::Retryable(_) => match self.policy(stage).decide(current.retry_count, now) {
                RetryDecision::Retry {
                    retry_count,
                    retry_after,
                } => (
                    stage.failure(),
                    retry_count,
                    Some(retry_after),
                    UnitResult::Retrying,
                ),
                RetryDecision::Exhausted { retry_count } => {
                    (stage.terminal(), retry_count, None, UnitResult::Exhausted)
                }
            },
            StageOutcome::Waiting(reason) => return self.defer(unit, &current, stage, reason, now),
            StageOutcome::Terminal(_) => {
                let max_retries = self.config.stages.get(stage).max_retries;
                let retry_count = current
                    .retry_count
                    .saturating_add(1)
                    .max(max_retries.saturating_add(1));
                (stage.terminal(), retry_count, None, UnitResult::Exhausted)
            }
        };

        let update = StageUpdate {
            from: current.current_stage,
            to,
            retry_count,
            retry_after,
        };
        let updated = match self.store.apply_stage_update(&current.id, &update) {
            Ok(updated) => updated,
            Err(StoreError::StageConflict { .. }) => {
                CLAIMS_LOST.with_label_values(&[unit.stage.as_str()]).inc();
                return Ok(UnitResult::Lost);
            }
            Err(e) => return Err(e),
        };

        match result {
            UnitResult::Advanced => info!(
                item_id = %updated.id,
                from = %current.current_stage,
                to = %updated.current_stage,
                "Stage advanced"
            ),
            UnitResult::Exhausted => warn!(
                item_id = %updated.id,
                stage = %stage,
                retry_count,
                reason = outcome.reason().unwrap_or_default(),
                "Stage failed terminally"
            ),
            _ => info!(
                item_id = %updated.id,
                stage = %stage,
                retry_count,
                reason = outcome.reason().unwrap_or_default(),
                "Stage failed, will retry"
            ),
        }

        if let Some(ref audit) = self.audit {
            audit
                .emit(stage_changed(
                    &current,
                    &updated,
                    outcome.reason().map(str::to_string),
                ))
                .await;
        }

        Ok(result)
    }

    /// Re-poll later at the same stage and retry count.
    fn defer(
        &self,
        unit: &WorkUnit,
        current: &Item,
        stage: PipelineStage,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<UnitResult, StoreError> {
        let poll = chrono::Duration::seconds(self.config.waiting_poll_secs.min(u32::MAX as u64) as i64);
        if !self
            .store
            .defer_item(&current.id, current.current_stage, now + poll)?
        {
            CLAIMS_LOST.with_label_values(&[unit.stage.as_str()]).inc();
            return Ok(UnitResult::Lost);
        }
        debug!(
            item_id = %current.id,
            stage = %stage,
            retry_count = current.retry_count,
            reason,
            "Stage still in progress, polling later"
        );
        Ok(UnitResult::Waiting)
    }

    async fn rescan(&self) -> Result<RescanReport, StoreError> {
        let now = Utc::now();
        *self.last_rescan.write().await = Some(now);

        let mut busy = HashSet::new();
        for stage in PipelineStage::ALL {
            busy.extend(self.store.claimed_items(stage, now)?);
        }

        let filter = ItemFilter::new()
            .with_media_kind(MediaKind::Series)
            .with_stages([ItemStage::Scraped, ItemStage::Downloaded, ItemStage::Published])
            .with_limit(-1);

        let mut report = RescanReport::default();
        for item in self.store.list_items(&filter)? {
            if busy.contains(&item.id) {
                continue;
            }
            report.examined += 1;

            // Ended series keep their tree; only airing ones gain episodes.
            let item = match self.indexer {
                Some(ref indexer) if self.config.refresh_metadata_on_rescan && item.is_airing() => {
                    self.refresh_metadata(indexer.as_ref(), item).await?
                }
                _ => item,
            };

            let seasons = self.store.list_seasons(&item.id)?;
            let fresh = scrape_episodes(&seasons, now.date_naive()).len() as u32;
            if fresh == 0 {
                continue;
            }

            let update = StageUpdate {
                from: item.current_stage,
                to: ItemStage::LibraryMatched,
                retry_count: item.retry_count,
                retry_after: None,
            };
            let readmitted = match self.store.apply_stage_update(&item.id, &update) {
                Ok(readmitted) => readmitted,
                Err(StoreError::StageConflict { .. }) => continue,
                Err(e) => return Err(e),
            };

            READMISSIONS.inc();
            info!(
                item_id = %item.id,
                from = %item.current_stage,
                episodes = fresh,
                "Re-admitted series with unscraped aired episodes"
            );
            if let Some(ref audit) = self.audit {
                audit
                    .emit(stage_changed(
                        &item,
                        &readmitted,
                        Some(format!("{} aired episodes awaiting a release", fresh)),
                    ))
                    .await;
            }

            report.readmitted.push(item.id);
            report.episodes += fresh;
        }

        if !report.readmitted.is_empty() {
            if let Some(ref audit) = self.audit {
                audit
                    .emit(AuditEvent::ItemsReadmitted {
                        item_ids: report.readmitted.clone(),
                        episodes: report.episodes,
                    })
                    .await;
            }
        }

        debug!(
            examined = report.examined,
            readmitted = report.readmitted.len(),
            "Rescan finished"
        );
        Ok(report)
    }

    /// Re-index one series. Indexer errors keep the stored tree.
    async fn refresh_metadata(
        &self,
        indexer: &dyn MetadataIndexer,
        item: Item,
    ) -> Result<Item, StoreError> {
        let indexed = match indexer.index(&item).await {
            Ok(indexed) => indexed,
            Err(e) => {
                warn!(item_id = %item.id, indexer = indexer.name(), error = %e, "Metadata refresh failed");
                return Ok(item);
            }
        };

        self.store.save_metadata(&item.id, &indexed.update)?;
        if !indexed.seasons.is_empty() {
            self.store.upsert_seasons(&item.id, &indexed.seasons)?;
        }
        Ok(self.store.get_item(&item.id)?.unwrap_or(item))
    }
}

fn stage_changed(before: &Item, after: &Item, reason: Option<String>) -> AuditEvent {
    let transition = before
        .current_stage
        .transition_kind(after.current_stage)
        .map(|kind| kind.as_str())
        .unwrap_or("unknown");

    AuditEvent::StageChanged {
        item_id: after.id.clone(),
        from_stage: before.current_stage.to_string(),
        to_stage: after.current_stage.to_string(),
        transition: transition.to_string(),
        retry_count: after.retry_count,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::audit::{create_audit_system, SqliteAuditStore};
    use crate::item::{NewItem, SqliteItemStore};
    use crate::retry::BackoffConfig;

    /// Worker that replays a script of outcomes, then succeeds.
    struct ScriptedWorker {
        stage: PipelineStage,
        script: std::sync::Mutex<VecDeque<StageOutcome>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedWorker {
        fn new(stage: PipelineStage, script: Vec<StageOutcome>) -> Arc<Self> {
            Arc::new(Self {
                stage,
                script: std::sync::Mutex::new(script.into()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(stage: PipelineStage, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                stage,
                script: std::sync::Mutex::new(VecDeque::new()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageWorker for ScriptedWorker {
        fn stage(&self) -> PipelineStage {
            self.stage
        }

        async fn run(&self, _unit: &WorkUnit) -> StageOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(StageOutcome::Success)
        }
    }

    fn config(max_retries: u32) -> OrchestratorConfig {
        let mut config = OrchestratorConfig {
            backoff: BackoffConfig {
                initial_delay_ms: 0,
                max_delay_ms: 0,
                multiplier: 2.0,
            },
            rescan_interval_secs: 0,
            ..Default::default()
        };
        for stage in PipelineStage::ALL {
            let settings = config.stages.get_mut(stage);
            settings.max_retries = max_retries;
            settings.poll_interval_ms = 10;
        }
        config
    }

    fn setup(
        config: OrchestratorConfig,
        worker: Arc<ScriptedWorker>,
    ) -> (Arc<SqliteItemStore>, PipelineOrchestrator, Item) {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let item = store
            .upsert_item(NewItem::movie("Heat", Some(1995)))
            .unwrap()
            .item;
        let orchestrator = PipelineOrchestrator::new(
            config,
            store.clone(),
            vec![worker as Arc<dyn StageWorker>],
            None,
        );
        (store, orchestrator, item)
    }

    #[tokio::test]
    async fn test_success_advances_with_zero_retries() {
        let worker = ScriptedWorker::new(PipelineStage::Index, vec![]);
        let (store, orchestrator, item) = setup(config(3), worker.clone());

        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.advanced, 1);

        let item = store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(item.current_stage, ItemStage::Indexed);
        assert_eq!(item.retry_count, 0);

        // Nothing left for the stage
        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.resolved, 0);
        assert_eq!(worker.calls(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_into_terminal_stage() {
        let worker = ScriptedWorker::new(
            PipelineStage::Index,
            vec![
                StageOutcome::Retryable("no match".to_string()),
                StageOutcome::Retryable("no match".to_string()),
                StageOutcome::Retryable("no match".to_string()),
            ],
        );
        let (store, orchestrator, item) = setup(config(2), worker);

        orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        let current = store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(current.current_stage, ItemStage::IndexFailed);
        assert_eq!(current.retry_count, 1);
        assert!(current.retry_after.is_some());

        orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        let current = store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(current.current_stage, ItemStage::IndexFailed);
        assert_eq!(current.retry_count, 2);

        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.exhausted, 1);
        let current = store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(current.current_stage, ItemStage::Failed(PipelineStage::Index));
        assert_eq!(current.retry_count, 3);

        // Frozen until reset
        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.resolved, 0);
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let worker = ScriptedWorker::new(
            PipelineStage::Index,
            vec![StageOutcome::Retryable("timeout".to_string())],
        );
        let mut config = config(3);
        config.backoff.initial_delay_ms = 60_000;
        config.backoff.max_delay_ms = 60_000;
        let (store, orchestrator, item) = setup(config, worker.clone());

        orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.resolved, 0);
        assert_eq!(worker.calls(), 1);

        let current = store.get_item(&item.id).unwrap().unwrap();
        assert!(current.retry_after.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_terminal_outcome_freezes_immediately() {
        let worker = ScriptedWorker::new(
            PipelineStage::Index,
            vec![StageOutcome::Terminal("not configured".to_string())],
        );
        let (store, orchestrator, item) = setup(config(5), worker);

        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.exhausted, 1);

        let current = store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(current.current_stage, ItemStage::Failed(PipelineStage::Index));
        assert_eq!(current.retry_count, 6);
    }

    #[tokio::test]
    async fn test_reset_item() {
        let worker = ScriptedWorker::new(
            PipelineStage::Index,
            vec![StageOutcome::Terminal("bad".to_string())],
        );
        let (store, orchestrator, item) = setup(config(1), worker);

        let err = orchestrator.reset_item(&item.id, "operator").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));

        orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        let reset = orchestrator.reset_item(&item.id, "operator").await.unwrap();
        assert_eq!(reset.current_stage, ItemStage::New);
        assert_eq!(reset.retry_count, 0);

        orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        let current = store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(current.current_stage, ItemStage::Indexed);

        let err = orchestrator.reset_item("missing", "operator").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_claimed_item_is_skipped() {
        let worker = ScriptedWorker::new(PipelineStage::Index, vec![]);
        let (store, orchestrator, item) = setup(config(3), worker.clone());

        store
            .try_claim(
                &item.id,
                PipelineStage::Index,
                Utc::now(),
                chrono::Duration::minutes(5),
            )
            .unwrap()
            .unwrap();

        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.dispatched(), 0);
        assert_eq!(worker.calls(), 0);
    }

    #[tokio::test]
    async fn test_worker_timeout_is_retryable() {
        let worker = ScriptedWorker::slow(PipelineStage::Index, Duration::from_secs(30));
        let mut config = config(3);
        config.worker_timeout_secs = 1;
        let (store, orchestrator, item) = setup(config, worker);

        let report = orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        assert_eq!(report.retrying, 1);

        let current = store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(current.current_stage, ItemStage::IndexFailed);

        // Claim released after the run
        let claimed = store
            .claimed_items(PipelineStage::Index, Utc::now())
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_worker() {
        let worker = ScriptedWorker::new(PipelineStage::Index, vec![]);
        let (_store, orchestrator, _item) = setup(config(3), worker);

        let err = orchestrator
            .run_stage_once(PipelineStage::Publish)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoWorker(PipelineStage::Publish)));
    }

    #[tokio::test]
    async fn test_status_reports_counts_and_ticks() {
        let worker = ScriptedWorker::new(PipelineStage::Index, vec![]);
        let (_store, orchestrator, _item) = setup(config(3), worker);

        let status = orchestrator.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.active_stages, vec![PipelineStage::Index]);
        assert_eq!(status.items_by_stage.get("new"), Some(&1));
        assert!(status.last_ticks.is_empty());

        orchestrator.run_stage_once(PipelineStage::Index).await.unwrap();
        let status = orchestrator.status().await.unwrap();
        assert_eq!(status.items_by_stage.get("indexed"), Some(&1));
        assert!(status.last_ticks.contains_key(&PipelineStage::Index));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let worker = ScriptedWorker::new(PipelineStage::Index, vec![]);
        let (store, orchestrator, item) = setup(config(3), worker);

        orchestrator.start().await;
        assert!(orchestrator.is_running());

        let mut advanced = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let current = store.get_item(&item.id).unwrap().unwrap();
            if current.current_stage == ItemStage::Indexed {
                advanced = true;
                break;
            }
        }
        assert!(advanced, "stage loop never advanced the item");

        orchestrator.stop().await;
        assert!(!orchestrator.is_running());
        assert!(orchestrator.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_aborts_loops_past_grace_window() {
        let worker = ScriptedWorker::slow(PipelineStage::Index, Duration::from_secs(30));
        let mut config = config(3);
        config.shutdown_grace_secs = 0;
        config.worker_timeout_secs = 60;

        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        store.upsert_item(NewItem::movie("Heat", Some(1995))).unwrap();
        let audit_store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (audit, writer) = create_audit_system(audit_store, 16);
        let writer_handle = tokio::spawn(writer.run());

        let orchestrator = PipelineOrchestrator::new(
            config,
            store,
            vec![worker.clone() as Arc<dyn StageWorker>],
            Some(audit),
        );
        orchestrator.start().await;
        for _ in 0..100 {
            if worker.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(worker.calls(), 1);

        // The worker is mid-run; stop must not wait the 30s out
        tokio::time::timeout(Duration::from_secs(5), orchestrator.stop())
            .await
            .expect("stop did not return");
        assert!(orchestrator.tasks.lock().await.is_empty());

        // With the loop gone, the last audit handle goes with the orchestrator
        drop(orchestrator);
        tokio::time::timeout(Duration::from_secs(5), writer_handle)
            .await
            .expect("audit writer never finished")
            .unwrap();
    }
}
