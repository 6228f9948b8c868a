use std::sync::Arc;

use reelflow_core::{
    AuditHandle, AuditStore, Config, ItemStore, PipelineOrchestrator, SanitizedConfig,
};

/// Shared application state
pub struct AppState {
    config: Config,
    item_store: Arc<dyn ItemStore>,
    audit_handle: AuditHandle,
    audit_store: Arc<dyn AuditStore>,
    orchestrator: Option<Arc<PipelineOrchestrator>>,
}

impl AppState {
    pub fn new(
        config: Config,
        item_store: Arc<dyn ItemStore>,
        audit_handle: AuditHandle,
        audit_store: Arc<dyn AuditStore>,
        orchestrator: Option<Arc<PipelineOrchestrator>>,
    ) -> Self {
        Self {
            config,
            item_store,
            audit_handle,
            audit_store,
            orchestrator,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn item_store(&self) -> &dyn ItemStore {
        self.item_store.as_ref()
    }

    pub fn audit(&self) -> &AuditHandle {
        &self.audit_handle
    }

    pub fn audit_store(&self) -> &dyn AuditStore {
        self.audit_store.as_ref()
    }

    /// The orchestrator, when one was built at startup.
    pub fn orchestrator(&self) -> Option<&Arc<PipelineOrchestrator>> {
        self.orchestrator.as_ref()
    }
}
