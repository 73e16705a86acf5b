pub mod audit;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod notify;
pub mod operation;
pub mod provision;
pub mod resource;
pub mod secrets;
pub mod testing;

pub use audit::{
    AuditError, AuditEvent, AuditFilter, AuditOutcome, AuditRecord, AuditStore, SqliteAuditStore,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, ConfigProvider,
    ControlPlaneConfig, EnvProvider, LayeredConfig, MapProvider, SanitizedConfig,
};
pub use engine::{
    ArchiveFailurePolicy, Collaborators, DriveOutcome, OrchestratorConfig, OrchestratorError,
    OrchestratorStatus, RestoreOrchestrator, StepFailure, StepOutcome,
};
pub use notify::{
    FanoutNotificationSink, LogNotificationSink, Notification, NotificationSink, NotifyError,
    WebhookNotificationSink,
};
pub use operation::{
    CreateOperationRequest, ErrorKind, Location, Operation, OperationFilter, OperationStatus,
    OperationStore, RestoreParameters, SnapshotSelector, SqliteOperationStore, Step, StepError,
    StepOutputs, StoreError,
};
pub use provision::{ProvisionError, UserProvisioner};
pub use resource::{HttpControlPlane, ResourceControl, ResourceError};
pub use secrets::{Credentials, EnvSecretStore, SecretError, SecretStore};
