use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reelflow_core::{
    config::CONFIG_PATH_ENV, create_audit_system, load_config, validate_config,
    AuditEvent, AuditStore, DownloadWorker, IndexWorker, ItemStore, MatchWorker,
    PipelineOrchestrator, ProfileLibraryMatcher, PublishWorker, RankingEngine, RealDebridClient,
    ScrapeWorker, SqliteAuditStore, SqliteItemStore, StageWorker, SymlinkPublisher, TmdbIndexer,
    TorrentioSource,
};
use reelflow_server::api::create_router;
use reelflow_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

/// How long shutdown waits for queued audit events to be written
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);

    // Compute config hash for audit
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    // Stores
    let item_store = Arc::new(
        SqliteItemStore::new(&config.database.path).context("Failed to create item store")?,
    );
    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );

    // Audit system
    let (audit_handle, audit_writer) = create_audit_system(audit_store.clone(), AUDIT_BUFFER_SIZE);
    let writer_handle = tokio::spawn(audit_writer.run());

    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;
    info!(version = VERSION, config_hash = config_hash_short, "Service started");

    // Collaborators and stage workers
    let store: Arc<dyn ItemStore> = item_store.clone();
    let mut workers: Vec<Arc<dyn StageWorker>> = Vec::new();

    let indexer = match config.tmdb.clone() {
        Some(tmdb) => {
            let indexer = Arc::new(TmdbIndexer::new(tmdb).context("Failed to create TMDB indexer")?);
            workers.push(Arc::new(IndexWorker::new(store.clone(), indexer.clone())));
            info!("Metadata indexer: tmdb");
            Some(indexer)
        }
        None => {
            warn!("TMDB not configured, index stage will not be scheduled");
            None
        }
    };

    let matcher = ProfileLibraryMatcher::new(config.library.profiles.clone())
        .context("Failed to create library matcher")?;
    workers.push(Arc::new(MatchWorker::new(store.clone(), Arc::new(matcher))));
    info!(profiles = config.library.profiles.len(), "Library matcher configured");

    let source = TorrentioSource::new(config.torrentio.clone())
        .context("Failed to create candidate source")?;
    let engine = Arc::new(RankingEngine::new(config.ranking.clone()));
    workers.push(Arc::new(
        ScrapeWorker::new(store.clone(), Arc::new(source), engine)
            .with_audit(audit_handle.clone()),
    ));
    info!("Candidate source: {}", config.torrentio.url);

    match config.real_debrid.clone() {
        Some(rd) => {
            let client = RealDebridClient::new(rd).context("Failed to create debrid client")?;
            workers.push(Arc::new(
                DownloadWorker::new(
                    store.clone(),
                    Arc::new(client),
                    config.orchestrator.require_complete_season,
                    config.orchestrator.stall_timeout_secs,
                )
                .with_audit(audit_handle.clone()),
            ));
            info!("Download client: real-debrid");
        }
        None => warn!("Real-Debrid not configured, download stage will not be scheduled"),
    }

    workers.push(Arc::new(PublishWorker::new(
        store.clone(),
        Arc::new(SymlinkPublisher::new(config.library.clone())),
    )));

    // Orchestrator
    let mut orchestrator = PipelineOrchestrator::new(
        config.orchestrator.clone(),
        store.clone(),
        workers,
        Some(audit_handle.clone()),
    );
    if let Some(indexer) = indexer {
        orchestrator = orchestrator.with_indexer(indexer);
    }
    let orchestrator = Arc::new(orchestrator);

    if config.orchestrator.enabled {
        orchestrator.start().await;
    } else {
        info!("Orchestrator disabled, stage loops not started");
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        audit_handle.clone(),
        audit_store,
        Some(orchestrator.clone()),
    ));
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if orchestrator.is_running() {
        info!("Stopping orchestrator...");
        orchestrator.stop().await;
    }

    info!("Server shutting down...");
    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // Workers hold AuditHandle clones through the orchestrator; all of them
    // must go before the writer sees its channel close.
    drop(orchestrator);
    drop(audit_handle);

    match tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer_handle).await {
        Ok(_) => info!("Audit writer stopped"),
        Err(_) => warn!(
            timeout_secs = AUDIT_DRAIN_TIMEOUT.as_secs(),
            "Audit writer still has open handles, exiting without it"
        ),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
