//! User provisioning through the control-plane gateway.

use async_trait::async_trait;
use serde_json::json;

use crate::resource::{HttpControlPlane, ResourceError};

use super::{ProvisionError, ProvisionReport, ProvisionRequest, UserProvisioner};

fn map_error(endpoint: &str, e: ResourceError) -> ProvisionError {
    match e {
        ResourceError::Timeout => ProvisionError::ConnectionTimeout {
            endpoint: endpoint.to_string(),
        },
        ResourceError::AuthenticationFailed(msg) => ProvisionError::AuthenticationFailed(msg),
        ResourceError::Transient(msg) => ProvisionError::Unavailable(msg),
        other => ProvisionError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl UserProvisioner for HttpControlPlane {
    fn name(&self) -> &str {
        "http"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionReport, ProvisionError> {
        let endpoint = format!("{}:{}", request.endpoint, request.port);
        let users: Vec<_> = request
            .users
            .iter()
            .map(|u| {
                json!({
                    "username": u.credentials.username,
                    "password": u.credentials.password,
                    "privileges": u.privileges,
                })
            })
            .collect();
        let body = json!({
            "endpoint": request.endpoint,
            "port": request.port,
            "database": request.database,
            "master": {
                "username": request.master.username,
                "password": request.master.password,
            },
            "users": users,
        });

        let path = format!(
            "/v1/clusters/{}/users",
            urlencoding::encode(&request.cluster_id)
        );
        // The gateway treats user provisioning as create-or-update.
        let token = format!("provision-{}", request.cluster_id);
        self.send_json("provision_users", self.post(&path, &token).json(&body))
            .await
            .map_err(|e| map_error(&endpoint, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_keeps_classification() {
        assert!(matches!(
            map_error("db:5432", ResourceError::Timeout),
            ProvisionError::ConnectionTimeout { .. }
        ));
        assert!(matches!(
            map_error("db:5432", ResourceError::AuthenticationFailed("x".into())),
            ProvisionError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            map_error("db:5432", ResourceError::NotFound("x".into())),
            ProvisionError::Rejected(_)
        ));
    }
}
