//! Database user provisioning on a restored cluster.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::ErrorKind;
use crate::secrets::Credentials;

#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("Connection to {endpoint} timed out")]
    ConnectionTimeout { endpoint: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Cluster temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Provisioning rejected: {0}")]
    Rejected(String),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            ProvisionError::AuthenticationFailed(_) => ErrorKind::AuthError,
            ProvisionError::Unavailable(_) => ErrorKind::TransientProviderError,
            ProvisionError::Rejected(_) => ErrorKind::PermissionDenied,
        }
    }
}

/// One user to create or update, with the privileges to grant.
#[derive(Debug, Clone)]
pub struct UserAccess {
    pub credentials: Credentials,
    pub privileges: Vec<String>,
}

/// Everything needed to connect to the cluster and create users.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub cluster_id: String,
    pub endpoint: String,
    pub port: u16,
    pub database: String,
    pub master: Credentials,
    pub users: Vec<UserAccess>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub usernames: Vec<String>,
}

/// Creates database users on a freshly restored cluster.
///
/// Implementations must tolerate being called again for users that already
/// exist (create-or-update).
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    fn name(&self) -> &str;

    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionReport, ProvisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_timeout_is_retryable_auth_is_not() {
        let timeout = ProvisionError::ConnectionTimeout {
            endpoint: "db:5432".to_string(),
        };
        assert!(timeout.kind().is_retryable());
        assert!(!ProvisionError::AuthenticationFailed("bad password".into())
            .kind()
            .is_retryable());
    }
}
