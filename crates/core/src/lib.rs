pub mod audit;
pub mod config;
pub mod downloader;
pub mod eligibility;
pub mod item;
pub mod library;
pub mod metadata;
pub mod metrics;
pub mod orchestrator;
pub mod publisher;
pub mod ranking;
pub mod retry;
pub mod source;
pub mod testing;
pub mod workers;

pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditFilter, AuditHandle, AuditOrder, AuditRecord,
    AuditStore, AuditWriter, SqliteAuditStore,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, DatabaseConfig,
    SanitizedConfig, ServerConfig,
};
pub use downloader::{
    DownloadClient, DownloadError, DownloadRequest, DownloadStatus, RealDebridClient,
    RealDebridConfig,
};
pub use eligibility::{DispatchMode, StageResolver, WorkUnit};
pub use item::{
    Candidate, CandidateStatus, Item, ItemFilter, ItemStage, ItemStore, MediaKind, NewItem,
    PipelineStage, SqliteItemStore, StoreError, SubjectRef, UpsertOutcome,
};
pub use library::{LibraryConfig, LibraryError, LibraryMatcher, ProfileLibraryMatcher};
pub use metadata::{MetadataError, MetadataIndexer, TmdbConfig, TmdbIndexer};
pub use orchestrator::{
    OrchestratorConfig, OrchestratorError, OrchestratorStatus, PipelineOrchestrator,
    RescanReport, TickReport,
};
pub use publisher::{PublishError, Publisher, SymlinkPublisher};
pub use ranking::{RankingConfig, RankingEngine, RankingError, RawRelease, Selection};
pub use retry::{BackoffConfig, RetryDecision, RetryPolicy};
pub use source::{CandidateSource, SourceError, TorrentioConfig, TorrentioSource};
pub use workers::{
    DownloadWorker, IndexWorker, MatchWorker, PublishWorker, ScrapeWorker, StageOutcome,
    StageWorker,
};
