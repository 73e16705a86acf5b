//! Common test utilities for API testing with mocks.
//!
//! Builds an in-process router over file-backed stores and mock
//! collaborators. The worker loop is not started, so operations only move
//! when a test resumes them.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use clusterback_core::{
    config::DatabaseConfig,
    testing::{MockNotificationSink, MockProvisioner, MockResourceControl, MockSecretStore},
    AuditStore, Collaborators, Config, OperationStore, RestoreOrchestrator, SqliteAuditStore,
    SqliteOperationStore,
};
use clusterback_server::state::AppState;

/// Re-export fixtures for test convenience
pub use clusterback_core::testing::fixtures;

/// Test fixture for API testing with mock collaborators.
pub struct TestFixture {
    pub router: Router,
    pub orchestrator: Arc<RestoreOrchestrator>,
    pub resources: Arc<MockResourceControl>,
    pub provisioner: Arc<MockProvisioner>,
    pub notifier: Arc<MockNotificationSink>,
    /// Holds the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Fixture whose snapshot exists and whose target cluster does not.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let operation_store: Arc<dyn OperationStore> = Arc::new(
            SqliteOperationStore::new(&db_path).expect("Failed to create operation store"),
        );
        let audit_store: Arc<dyn AuditStore> =
            Arc::new(SqliteAuditStore::new(&db_path).expect("Failed to create audit store"));

        let resources = Arc::new(MockResourceControl::new());
        resources
            .add_snapshot(fixtures::SNAPSHOT_ID, "available")
            .await;
        let provisioner = Arc::new(MockProvisioner::new());
        let notifier = Arc::new(MockNotificationSink::new());

        let config = Config {
            database: DatabaseConfig { path: db_path },
            orchestrator: fixtures::fast_config(),
            ..Config::default()
        };

        let orchestrator = Arc::new(
            RestoreOrchestrator::new(
                config.orchestrator.clone(),
                Arc::clone(&operation_store),
                Arc::clone(&audit_store),
                Collaborators {
                    resources: resources.clone(),
                    secrets: Arc::new(MockSecretStore::with_defaults()),
                    provisioner: provisioner.clone(),
                    notifier: notifier.clone(),
                },
            )
            .with_executor_id("api-test")
            .with_env_prefix("CLUSTERBACK_API_TEST_"),
        );

        let state = Arc::new(AppState::new(
            config,
            Arc::clone(&orchestrator),
            operation_store,
            audit_store,
        ));

        Self {
            router: clusterback_server::api::create_router(state),
            orchestrator,
            resources,
            provisioner,
            notifier,
            temp_dir,
        }
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body), None).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None, None).await
    }

    /// Send a POST request on behalf of `requester`.
    pub async fn post_as(&self, path: &str, body: Option<Value>, requester: &str) -> TestResponse {
        self.request("POST", path, body, Some(requester)).await
    }

    /// Trigger a restore into `target` and return the new operation id.
    pub async fn trigger(&self, target: &str) -> String {
        let response = self.post("/api/v1/operations", restore_body(target)).await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.body["id"]
            .as_str()
            .expect("operation id in response")
            .to_string()
    }

    /// Resume inline until the operation settles.
    pub async fn resume_until_settled(&self, id: &str) -> TestResponse {
        let path = format!("/api/v1/operations/{}/resume?wait=true", id);
        for _ in 0..200 {
            let response = self.post_empty(&path).await;
            let settled = response.status != StatusCode::OK
                || !matches!(
                    response.body["outcome"]["outcome"].as_str(),
                    Some("suspended") | Some("superseded")
                );
            if settled {
                return response;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("operation {} did not settle", id);
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        requester: Option<&str>,
    ) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        if let Some(requester) = requester {
            request_builder = request_builder.header("x-requested-by", requester);
        }

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
}

/// Request body restoring the fixture snapshot into `target`.
pub fn restore_body(target: &str) -> Value {
    json!({
        "snapshot": { "type": "identifier", "id": fixtures::SNAPSHOT_ID },
        "source_cluster_id": fixtures::SOURCE_CLUSTER,
        "source": { "account": "111111111111", "region": "us-east-1" },
        "target": { "account": "222222222222", "region": "eu-west-1" },
        "target_cluster_id": target,
        "network": { "subnet_group": "restore-subnets", "security_group_ids": ["sg-0123"] },
        "engine": { "engine": "aurora-postgresql", "engine_version": "15.4" }
    })
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
