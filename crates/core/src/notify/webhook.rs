//! Notification sink posting JSON to an HTTP endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::WebhookConfig;
use crate::metrics;

use super::{Notification, NotificationSink, NotifyError};

#[derive(Serialize)]
struct WebhookBody<'a> {
    topic: &'a str,
    #[serde(flatten)]
    notification: &'a Notification,
}

pub struct WebhookNotificationSink {
    client: Client,
    url: String,
    auth_header: Option<String>,
}

impl WebhookNotificationSink {
    pub fn new(config: &WebhookConfig) -> Result<Self, NotifyError> {
        if config.url.trim().is_empty() {
            return Err(NotifyError::Misconfigured("webhook url is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotifyError::Misconfigured(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            auth_header: config.auth_header.clone(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, topic: &str, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(&WebhookBody {
            topic,
            notification,
        });
        if let Some(ref header) = self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let start = Instant::now();
        let result = request.send().await;
        let elapsed = start.elapsed().as_secs_f64();

        let response = result.map_err(|e| {
            metrics::observe_external("webhook", "publish", elapsed, false);
            if e.is_timeout() {
                NotifyError::Timeout
            } else {
                NotifyError::DeliveryFailed(e.to_string())
            }
        })?;

        let status = response.status();
        metrics::observe_external("webhook", "publish", elapsed, status.is_success());
        if !status.is_success() {
            return Err(NotifyError::DeliveryFailed(format!("HTTP {}", status)));
        }

        debug!(operation_id = %notification.operation_id, "Webhook notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationStatus;
    use crate::testing::fixtures;

    #[test]
    fn test_empty_url_is_rejected() {
        let err = WebhookNotificationSink::new(&WebhookConfig {
            url: " ".to_string(),
            auth_header: None,
            timeout_secs: 5,
        })
        .err()
        .unwrap();
        assert!(matches!(err, NotifyError::Misconfigured(_)));
    }

    #[test]
    fn test_body_flattens_notification() {
        let n = Notification::for_operation(
            &fixtures::operation("orders-restored"),
            OperationStatus::Failed,
        );
        let json = serde_json::to_value(WebhookBody {
            topic: "restores",
            notification: &n,
        })
        .unwrap();
        assert_eq!(json["topic"], "restores");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["target_cluster_id"], "orders-restored");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_fails() {
        let sink = WebhookNotificationSink::new(&WebhookConfig {
            url: "http://127.0.0.1:1/hook".to_string(),
            auth_header: None,
            timeout_secs: 2,
        })
        .unwrap();
        let n = Notification::for_operation(
            &fixtures::operation("orders-restored"),
            OperationStatus::Succeeded,
        );
        assert!(sink.publish("restores", &n).await.is_err());
    }
}
