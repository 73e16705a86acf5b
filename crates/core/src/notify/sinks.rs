//! In-process notification sinks.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use super::{Notification, NotificationSink, NotifyError};

/// Writes notifications to the service log.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, topic: &str, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            topic,
            operation_id = %notification.operation_id,
            status = %notification.status,
            step = %notification.step,
            "{}",
            notification.subject
        );
        Ok(())
    }
}

/// Publishes to every inner sink concurrently.
///
/// Succeeds when at least one sink delivered.
pub struct FanoutNotificationSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutNotificationSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl NotificationSink for FanoutNotificationSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn publish(&self, topic: &str, notification: &Notification) -> Result<(), NotifyError> {
        if self.sinks.is_empty() {
            return Err(NotifyError::Misconfigured("no sinks configured".to_string()));
        }

        let results = join_all(self.sinks.iter().map(|s| s.publish(topic, notification))).await;

        let mut failures = Vec::new();
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                warn!(sink = sink.name(), error = %e, "Notification sink failed");
                failures.push(format!("{}: {}", sink.name(), e));
            }
        }

        if failures.len() == self.sinks.len() {
            Err(NotifyError::DeliveryFailed(failures.join("; ")))
        } else {
            Ok(())
        }
    }
}
