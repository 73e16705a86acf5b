//! Resource control over a REST control-plane gateway.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::ControlPlaneConfig;
use crate::metrics;
use crate::operation::Location;

use super::{
    ClusterInfo, CopySnapshotRequest, DeleteClusterRequest, OperationHandle, RemoteStatus,
    ResourceControl, ResourceError, RestoreClusterRequest, SnapshotInfo,
};

const SERVICE: &str = "control_plane";

/// Header carrying the idempotency token of start calls.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP client for the control-plane gateway.
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HandleResponse {
    operation_ref: String,
    resource_id: String,
}

impl HttpControlPlane {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ResourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ResourceError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    pub(crate) fn post(&self, path: &str, idempotency_token: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
            .header(IDEMPOTENCY_HEADER, idempotency_token)
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.delete(self.url(path)))
    }

    /// Send a request and decode a JSON body.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<T, ResourceError> {
        let response = self.send(operation, builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ResourceError::Internal(format!("invalid {} response: {}", operation, e)))
    }

    async fn send(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<reqwest::Response, ResourceError> {
        let start = Instant::now();
        let result = builder.send().await;
        let elapsed = start.elapsed().as_secs_f64();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::observe_external(SERVICE, operation, elapsed, false);
                return Err(map_transport_error(e));
            }
        };

        let status = response.status();
        if status.is_success() {
            metrics::observe_external(SERVICE, operation, elapsed, true);
            debug!(operation, status = %status, "Control plane call succeeded");
            return Ok(response);
        }

        metrics::observe_external(SERVICE, operation, elapsed, false);
        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }

    async fn start(
        &self,
        operation: &str,
        path: &str,
        token: &str,
        body: &impl serde::Serialize,
    ) -> Result<OperationHandle, ResourceError> {
        let handle: HandleResponse = self
            .send_json(operation, self.post(path, token).json(body))
            .await?;
        Ok(OperationHandle {
            operation_ref: handle.operation_ref,
            resource_id: handle.resource_id,
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> ResourceError {
    if e.is_timeout() {
        ResourceError::Timeout
    } else if e.is_connect() {
        ResourceError::Transient(format!("connection failed: {}", e))
    } else {
        ResourceError::Internal(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> ResourceError {
    let detail: String = body.chars().take(200).collect();
    match status {
        StatusCode::NOT_FOUND => ResourceError::NotFound(detail),
        StatusCode::UNAUTHORIZED => ResourceError::AuthenticationFailed(detail),
        StatusCode::FORBIDDEN => ResourceError::PermissionDenied(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ResourceError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ResourceError::Transient(format!("throttled: {}", detail)),
        s if s.is_server_error() => ResourceError::Transient(format!("HTTP {}: {}", s, detail)),
        s => ResourceError::Rejected(format!("HTTP {}: {}", s, detail)),
    }
}

fn enc(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn location_query(location: &Location) -> String {
    format!(
        "account={}&region={}",
        enc(&location.account),
        enc(&location.region)
    )
}

#[async_trait]
impl ResourceControl for HttpControlPlane {
    fn name(&self) -> &str {
        "http"
    }

    async fn describe_snapshot(
        &self,
        snapshot_id: &str,
        location: &Location,
    ) -> Result<SnapshotInfo, ResourceError> {
        let path = format!(
            "/v1/snapshots/{}?{}",
            enc(snapshot_id),
            location_query(location)
        );
        self.send_json("describe_snapshot", self.get(&path)).await
    }

    async fn start_copy(
        &self,
        request: &CopySnapshotRequest,
    ) -> Result<OperationHandle, ResourceError> {
        self.start(
            "start_copy",
            "/v1/snapshot-copies",
            &request.idempotency_token,
            request,
        )
        .await
    }

    async fn poll_copy(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError> {
        let path = format!("/v1/snapshot-copies/{}", enc(operation_ref));
        self.send_json("poll_copy", self.get(&path)).await
    }

    async fn describe_cluster(
        &self,
        cluster_id: &str,
        location: &Location,
    ) -> Result<Option<ClusterInfo>, ResourceError> {
        let path = format!(
            "/v1/clusters/{}?{}",
            enc(cluster_id),
            location_query(location)
        );
        match self.send_json("describe_cluster", self.get(&path)).await {
            Ok(info) => Ok(Some(info)),
            Err(ResourceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn start_delete(
        &self,
        request: &DeleteClusterRequest,
    ) -> Result<OperationHandle, ResourceError> {
        self.start(
            "start_delete",
            "/v1/cluster-deletions",
            &request.idempotency_token,
            request,
        )
        .await
    }

    async fn poll_delete(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError> {
        let path = format!("/v1/cluster-deletions/{}", enc(operation_ref));
        self.send_json("poll_delete", self.get(&path)).await
    }

    async fn start_restore(
        &self,
        request: &RestoreClusterRequest,
    ) -> Result<OperationHandle, ResourceError> {
        self.start(
            "start_restore",
            "/v1/cluster-restores",
            &request.idempotency_token,
            request,
        )
        .await
    }

    async fn poll_restore(&self, operation_ref: &str) -> Result<RemoteStatus, ResourceError> {
        let path = format!("/v1/cluster-restores/{}", enc(operation_ref));
        self.send_json("poll_restore", self.get(&path)).await
    }

    async fn delete_snapshot(
        &self,
        snapshot_id: &str,
        location: &Location,
    ) -> Result<(), ResourceError> {
        let path = format!(
            "/v1/snapshots/{}?{}",
            enc(snapshot_id),
            location_query(location)
        );
        self.send("delete_snapshot", self.delete(&path)).await?;
        Ok(())
    }
}
