//! Mock user provisioner for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::provision::{ProvisionError, ProvisionReport, ProvisionRequest, UserProvisioner};

/// A recorded provisioning call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedProvision {
    pub cluster_id: String,
    pub endpoint: String,
    pub port: u16,
    pub usernames: Vec<String>,
    pub success: bool,
}

/// Mock implementation of the `UserProvisioner` trait.
///
/// Queued errors are returned by successive calls in order; once the queue
/// is empty every call succeeds.
///
/// # Example
///
/// ```rust,ignore
/// let provisioner = MockProvisioner::new();
/// provisioner
///     .push_error(ProvisionError::ConnectionTimeout { endpoint: "db:5432".into() })
///     .await;
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockProvisioner {
    calls: Arc<RwLock<Vec<RecordedProvision>>>,
    errors: Arc<RwLock<VecDeque<ProvisionError>>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next call that has none queued before it.
    pub async fn push_error(&self, error: ProvisionError) {
        self.errors.write().await.push_back(error);
    }

    /// Get all recorded calls.
    pub async fn recorded_calls(&self) -> Vec<RecordedProvision> {
        self.calls.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }
}

#[async_trait]
impl UserProvisioner for MockProvisioner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionReport, ProvisionError> {
        let usernames: Vec<String> = request
            .users
            .iter()
            .map(|u| u.credentials.username.clone())
            .collect();
        let error = self.errors.write().await.pop_front();

        self.calls.write().await.push(RecordedProvision {
            cluster_id: request.cluster_id.clone(),
            endpoint: request.endpoint.clone(),
            port: request.port,
            usernames: usernames.clone(),
            success: error.is_none(),
        });

        match error {
            Some(error) => Err(error),
            None => Ok(ProvisionReport { usernames }),
        }
    }
}
