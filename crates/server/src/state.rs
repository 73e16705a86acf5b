use std::sync::Arc;

use clusterback_core::{AuditStore, Config, OperationStore, RestoreOrchestrator, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Arc<RestoreOrchestrator>,
    operation_store: Arc<dyn OperationStore>,
    audit_store: Arc<dyn AuditStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        orchestrator: Arc<RestoreOrchestrator>,
        operation_store: Arc<dyn OperationStore>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            operation_store,
            audit_store,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn orchestrator(&self) -> &Arc<RestoreOrchestrator> {
        &self.orchestrator
    }

    pub fn operation_store(&self) -> &dyn OperationStore {
        self.operation_store.as_ref()
    }

    pub fn audit_store(&self) -> &dyn AuditStore {
        self.audit_store.as_ref()
    }
}
