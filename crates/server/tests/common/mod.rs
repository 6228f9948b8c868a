//! Common test utilities for API testing with mocks.
//!
//! Builds the router in-process with a real SQLite store in a temp dir and
//! mock collaborators behind the stage workers. The orchestrator is built
//! but its loops are not started; tests drive stages with `run_stage_once`.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use reelflow_core::{
    create_audit_system, retry::BackoffConfig, AuditStore, Config, DatabaseConfig, DownloadWorker,
    IndexWorker, ItemStore, MatchWorker, OrchestratorConfig, PipelineOrchestrator, PublishWorker,
    RankingEngine, ScrapeWorker, SqliteAuditStore, SqliteItemStore, StageWorker,
    testing::{MockDownloadClient, MockIndexer, MockLibraryMatcher, MockPublisher, MockSource},
};
use reelflow_server::state::AppState;

/// Re-export fixtures for test convenience
pub use reelflow_core::testing::fixtures;

/// In-process server with controllable collaborators.
pub struct TestFixture {
    pub router: Router,
    pub store: Arc<SqliteItemStore>,
    pub audit_store: Arc<SqliteAuditStore>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub indexer: Arc<MockIndexer>,
    pub source: Arc<MockSource>,
    pub downloads: Arc<MockDownloadClient>,
    pub publisher: Arc<MockPublisher>,
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    pub async fn new() -> Self {
        Self::build(true).await
    }

    /// A fixture whose state carries no orchestrator.
    pub async fn without_orchestrator() -> Self {
        Self::build(false).await
    }

    async fn build(with_orchestrator: bool) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let mut config = Config {
            database: DatabaseConfig {
                path: temp_dir.path().join("items.db"),
            },
            orchestrator: OrchestratorConfig {
                enabled: false,
                rescan_interval_secs: 0,
                stall_timeout_secs: 0,
                backoff: BackoffConfig {
                    initial_delay_ms: 0,
                    max_delay_ms: 0,
                    multiplier: 2.0,
                },
                ..Default::default()
            },
            ..Default::default()
        };
        config.server.host = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

        let store = Arc::new(
            SqliteItemStore::new(&config.database.path).expect("Failed to create item store"),
        );
        let audit_store = Arc::new(
            SqliteAuditStore::new(&temp_dir.path().join("audit.db"))
                .expect("Failed to create audit store"),
        );
        let (audit_handle, audit_writer) =
            create_audit_system(audit_store.clone() as Arc<dyn AuditStore>, 100);
        tokio::spawn(audit_writer.run());

        let indexer = Arc::new(MockIndexer::new());
        let source = Arc::new(MockSource::new());
        let downloads = Arc::new(MockDownloadClient::new());
        let publisher = Arc::new(MockPublisher::new());

        let item_store: Arc<dyn ItemStore> = store.clone();
        let workers: Vec<Arc<dyn StageWorker>> = vec![
            Arc::new(IndexWorker::new(item_store.clone(), indexer.clone())),
            Arc::new(MatchWorker::new(
                item_store.clone(),
                Arc::new(MockLibraryMatcher::new()),
            )),
            Arc::new(
                ScrapeWorker::new(
                    item_store.clone(),
                    source.clone(),
                    Arc::new(RankingEngine::new(config.ranking.clone())),
                )
                .with_audit(audit_handle.clone()),
            ),
            Arc::new(
                DownloadWorker::new(item_store.clone(), downloads.clone(), false, 0)
                    .with_audit(audit_handle.clone()),
            ),
            Arc::new(PublishWorker::new(item_store.clone(), publisher.clone())),
        ];
        let orchestrator = Arc::new(
            PipelineOrchestrator::new(
                config.orchestrator.clone(),
                item_store.clone(),
                workers,
                Some(audit_handle.clone()),
            )
            .with_indexer(indexer.clone()),
        );

        let state = Arc::new(AppState::new(
            config,
            item_store,
            audit_handle,
            audit_store.clone(),
            with_orchestrator.then(|| orchestrator.clone()),
        ));
        let router = reelflow_server::api::create_router(state);

        Self {
            router,
            store,
            audit_store,
            orchestrator,
            indexer,
            source,
            downloads,
            publisher,
            temp_dir,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Body and status of a non-JSON endpoint.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }

    /// Poll until the audit log holds at least `count` events of a type.
    pub async fn wait_for_audit(&self, event_type: &str, count: i64) -> bool {
        let filter = reelflow_core::AuditFilter::new().with_event_type(event_type);
        for _ in 0..100 {
            if self.audit_store.count(&filter).unwrap_or(0) >= count {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }
}
