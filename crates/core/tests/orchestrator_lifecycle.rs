//! Orchestrator lifecycle integration tests.
//!
//! These tests run the background stage loops (or single ticks) against mock
//! collaborators and check the audit trail they leave behind.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use reelflow_core::{
    audit::{AuditFilter, AuditStore},
    item::CandidateStatus,
    orchestrator::OrchestratorConfig,
    ranking::RankingConfig,
    retry::BackoffConfig,
    testing::{
        fixtures, MockDownloadClient, MockIndexer, MockLibraryMatcher, MockPublisher, MockSource,
    },
    create_audit_system, DownloadStatus, DownloadWorker, IndexWorker, Item, ItemStage, ItemStore,
    MatchWorker, NewItem, PipelineOrchestrator, PipelineStage, PublishWorker, RankingEngine,
    ScrapeWorker, SourceError, SqliteAuditStore, SqliteItemStore, StageWorker,
};

struct TestHarness {
    store: Arc<SqliteItemStore>,
    audit_store: Arc<SqliteAuditStore>,
    source: Arc<MockSource>,
    downloads: Arc<MockDownloadClient>,
    orchestrator: PipelineOrchestrator,
    _temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let store = Arc::new(
            SqliteItemStore::new(&temp_dir.path().join("items.db"))
                .expect("Failed to create item store"),
        );
        let audit_store = Arc::new(
            SqliteAuditStore::new(&temp_dir.path().join("audit.db"))
                .expect("Failed to create audit store"),
        );
        let (audit, writer) = create_audit_system(audit_store.clone(), 256);
        tokio::spawn(writer.run());

        let source = Arc::new(MockSource::new());
        let downloads = Arc::new(MockDownloadClient::new());
        let engine = Arc::new(RankingEngine::new(RankingConfig::default()));

        let mut config = OrchestratorConfig {
            enabled: true,
            rescan_interval_secs: 0,
            shutdown_grace_secs: 5,
            backoff: BackoffConfig {
                initial_delay_ms: 0,
                max_delay_ms: 0,
                multiplier: 2.0,
            },
            ..Default::default()
        };
        for stage in PipelineStage::ALL {
            config.stages.get_mut(stage).poll_interval_ms = 20;
        }
        // In-progress transfers are polled every tick
        config.waiting_poll_secs = 0;

        let workers: Vec<Arc<dyn StageWorker>> = vec![
            Arc::new(IndexWorker::new(store.clone(), Arc::new(MockIndexer::new()))),
            Arc::new(MatchWorker::new(
                store.clone(),
                Arc::new(MockLibraryMatcher::new()),
            )),
            Arc::new(
                ScrapeWorker::new(store.clone(), source.clone(), engine).with_audit(audit.clone()),
            ),
            Arc::new(
                DownloadWorker::new(store.clone(), downloads.clone(), false, 0)
                    .with_audit(audit.clone()),
            ),
            Arc::new(PublishWorker::new(store.clone(), Arc::new(MockPublisher::new()))),
        ];
        let orchestrator = PipelineOrchestrator::new(config, store.clone(), workers, Some(audit));

        Self {
            store,
            audit_store,
            source,
            downloads,
            orchestrator,
            _temp_dir: temp_dir,
        }
    }

    fn get(&self, item: &Item) -> Item {
        self.store.get_item(&item.id).unwrap().unwrap()
    }

    /// Run one stage without the background loops.
    async fn step(&self, stage: PipelineStage, item: &Item) -> Item {
        self.orchestrator.run_stage_once(stage).await.unwrap();
        self.get(item)
    }

    /// Poll until the item reaches `stage` or the deadline passes.
    async fn wait_for_stage(&self, item: &Item, stage: ItemStage, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let current = self.store.get_item(&item.id).unwrap().unwrap();
            if current.current_stage == stage {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Poll until at least `count` audit records match.
    async fn wait_for_audit(&self, filter: &AuditFilter, count: i64) -> bool {
        for _ in 0..100 {
            if self.audit_store.count(filter).unwrap() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

#[tokio::test]
async fn test_loops_drive_movie_to_published() {
    let harness = TestHarness::new();
    let item = harness
        .store
        .upsert_item(NewItem::movie("Arrival", Some(2016)))
        .unwrap()
        .item;
    harness
        .source
        .set_releases(
            None,
            None,
            vec![fixtures::release("aaa", "Arrival.2016.1080p.x265", 90, 8.0)],
        )
        .await;

    harness.orchestrator.start().await;
    let published = harness
        .wait_for_stage(&item, ItemStage::Published, Duration::from_secs(10))
        .await;
    harness.orchestrator.stop().await;

    assert!(published, "item never reached published");
    assert!(!harness.orchestrator.is_running());

    let current = harness.store.get_item(&item.id).unwrap().unwrap();
    assert_eq!(current.retry_count, 0);

    // One advance per stage, recorded in order
    let filter = AuditFilter::new()
        .with_item_id(&item.id)
        .with_event_type("stage_changed");
    assert!(harness.wait_for_audit(&filter, 5).await);

    let history = harness.audit_store.item_history(&item.id, 100).unwrap();
    let path: Vec<String> = history
        .iter()
        .filter_map(|r| match &r.data {
            reelflow_core::AuditEvent::StageChanged {
                to_stage,
                transition,
                ..
            } => Some(format!("{}:{}", transition, to_stage)),
            _ => None,
        })
        .collect();
    assert_eq!(
        path,
        vec![
            "advance:indexed",
            "advance:library_matched",
            "advance:scraped",
            "advance:downloaded",
            "advance:published",
        ]
    );

    let selections = AuditFilter::new()
        .with_item_id(&item.id)
        .with_event_type("candidate_selected");
    assert!(harness.wait_for_audit(&selections, 1).await);
}

#[tokio::test]
async fn test_pending_download_waits_without_spending_retries() {
    let harness = TestHarness::new();
    let item = harness
        .store
        .upsert_item(NewItem::movie("Sicario", Some(2015)))
        .unwrap()
        .item;
    harness
        .source
        .set_releases(
            None,
            None,
            vec![fixtures::release("slow", "Sicario.2015.1080p.x264", 30, 6.0)],
        )
        .await;
    harness
        .downloads
        .set_status("slow", DownloadStatus::Pending { progress: 0.4 })
        .await;

    harness.orchestrator.start().await;
    assert!(
        harness
            .wait_for_stage(&item, ItemStage::Scraped, Duration::from_secs(10))
            .await
    );

    // Several polls go by while the transfer runs
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while harness.downloads.requested_sources().await.len() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "download never polled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let current = harness.get(&item);
    assert_eq!(current.current_stage, ItemStage::Scraped);
    assert_eq!(current.retry_count, 0);
    let slow = harness
        .store
        .list_candidates(&item.id, None)
        .unwrap()
        .into_iter()
        .find(|c| c.source_identifier == "slow")
        .unwrap();
    assert_eq!(slow.status, CandidateStatus::Downloading);

    harness
        .downloads
        .set_status(
            "slow",
            DownloadStatus::Ready {
                local_path: "/mnt/debrid/Sicario.2015.1080p.x264.mkv".to_string(),
            },
        )
        .await;
    let published = harness
        .wait_for_stage(&item, ItemStage::Published, Duration::from_secs(10))
        .await;
    harness.orchestrator.stop().await;
    assert!(published);

    let current = harness.get(&item);
    assert_eq!(current.retry_count, 0);
    let candidate = harness
        .store
        .list_candidates(&item.id, None)
        .unwrap()
        .into_iter()
        .find(|c| c.source_identifier == "slow")
        .unwrap();
    assert_eq!(
        candidate.local_path.as_deref(),
        Some("/mnt/debrid/Sicario.2015.1080p.x264.mkv")
    );

    // Waiting polls never reach the audit trail as failures
    let failures = AuditFilter::new()
        .with_item_id(&item.id)
        .with_transition("fail");
    assert_eq!(harness.audit_store.count(&failures).unwrap(), 0);
}

#[tokio::test]
async fn test_blacklisted_movie_is_rescraped_and_downloaded() {
    let harness = TestHarness::new();
    let item = harness
        .store
        .upsert_item(NewItem::movie("Prisoners", Some(2013)))
        .unwrap()
        .item;
    harness
        .source
        .set_releases(
            None,
            None,
            vec![fixtures::release("aaa", "Prisoners.2013.1080p.x265", 90, 8.0)],
        )
        .await;
    harness
        .downloads
        .set_status(
            "aaa",
            DownloadStatus::Failed {
                reason: "dead torrent".to_string(),
            },
        )
        .await;

    harness.step(PipelineStage::Index, &item).await;
    harness.step(PipelineStage::Match, &item).await;
    harness.step(PipelineStage::Scrape, &item).await;

    // The only release fails, leaving nothing to promote
    let current = harness.step(PipelineStage::Download, &item).await;
    assert_eq!(current.current_stage, ItemStage::DownloadFailed);
    assert_eq!(current.retry_count, 1);
    assert!(harness
        .store
        .list_candidates(&item.id, Some(CandidateStatus::Selected))
        .unwrap()
        .is_empty());

    harness
        .source
        .set_releases(
            None,
            None,
            vec![
                fixtures::release("aaa", "Prisoners.2013.1080p.x265", 90, 8.0),
                fixtures::release("ccc", "Prisoners.2013.1080p.x264", 40, 7.0),
            ],
        )
        .await;

    // Re-selection leaves the stage alone
    let report = harness
        .orchestrator
        .run_stage_once(PipelineStage::Scrape)
        .await
        .unwrap();
    assert_eq!(report.unchanged, 1);
    let current = harness.get(&item);
    assert_eq!(current.current_stage, ItemStage::DownloadFailed);
    assert_eq!(current.retry_count, 1);

    let selected: Vec<String> = harness
        .store
        .list_candidates(&item.id, Some(CandidateStatus::Selected))
        .unwrap()
        .into_iter()
        .map(|c| c.source_identifier)
        .collect();
    assert_eq!(selected, vec!["ccc"]);

    let current = harness.step(PipelineStage::Download, &item).await;
    assert_eq!(current.current_stage, ItemStage::Downloaded);
    assert_eq!(current.retry_count, 0);
    assert_eq!(harness.downloads.requested_sources().await, vec!["aaa", "ccc"]);

    let current = harness.step(PipelineStage::Publish, &item).await;
    assert_eq!(current.current_stage, ItemStage::Published);
}

#[tokio::test]
async fn test_failed_rescrape_counts_against_download() {
    let harness = TestHarness::new();
    let item = harness
        .store
        .upsert_item(NewItem::movie("Enemy", Some(2013)))
        .unwrap()
        .item;
    harness
        .source
        .set_releases(
            None,
            None,
            vec![fixtures::release("aaa", "Enemy.2013.1080p.x265", 50, 6.0)],
        )
        .await;
    harness
        .downloads
        .set_status(
            "aaa",
            DownloadStatus::Failed {
                reason: "dead torrent".to_string(),
            },
        )
        .await;

    harness.step(PipelineStage::Index, &item).await;
    harness.step(PipelineStage::Match, &item).await;
    harness.step(PipelineStage::Scrape, &item).await;
    let current = harness.step(PipelineStage::Download, &item).await;
    assert_eq!(current.current_stage, ItemStage::DownloadFailed);
    assert_eq!(current.retry_count, 1);

    harness
        .source
        .push_error(SourceError::ConnectionFailed("refused".to_string()))
        .await;
    let report = harness
        .orchestrator
        .run_stage_once(PipelineStage::Scrape)
        .await
        .unwrap();
    assert_eq!(report.retrying, 1);

    // Still waiting on a download, one retry further along
    let current = harness.get(&item);
    assert_eq!(current.current_stage, ItemStage::DownloadFailed);
    assert_eq!(current.retry_count, 2);

    // Only the blacklisted release is left, so the next attempt fails the same way
    let report = harness
        .orchestrator
        .run_stage_once(PipelineStage::Scrape)
        .await
        .unwrap();
    assert_eq!(report.retrying, 1);
    let current = harness.get(&item);
    assert_eq!(current.current_stage, ItemStage::DownloadFailed);
    assert_eq!(current.retry_count, 3);
}

#[tokio::test]
async fn test_start_twice_and_stop_twice_are_harmless() {
    let harness = TestHarness::new();

    harness.orchestrator.start().await;
    harness.orchestrator.start().await;
    assert!(harness.orchestrator.is_running());

    let status = harness.orchestrator.status().await.unwrap();
    assert_eq!(status.active_stages.len(), 5);

    harness.orchestrator.stop().await;
    harness.orchestrator.stop().await;
    assert!(!harness.orchestrator.is_running());
}
