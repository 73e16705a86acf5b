//! Durable operation state: the restore operation model and its store.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteOperationStore;
pub use store::{CreateOperationRequest, Lease, OperationFilter, OperationStore, StoreError};
pub use types::{
    ArchiveResult, AsyncOperationRef, CopiedSnapshot, DeletedCluster, EngineOptions, ErrorKind,
    Location, NetworkPlacement, NotificationReceipt, Operation, OperationStatus, OutputConflict,
    ProvisionedUsers, RestoreParameters, RestoredCluster, SnapshotDescriptor, SnapshotSelector,
    Step, StepError, StepOutput, StepOutputs,
};
