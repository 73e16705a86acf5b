//! Mock notification sink for testing.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::notify::{Notification, NotificationSink, NotifyError};

/// A notification the mock accepted.
#[derive(Debug, Clone)]
pub struct PublishedNotification {
    pub topic: String,
    pub notification: Notification,
}

/// Mock implementation of the `NotificationSink` trait.
///
/// Records delivered notifications. When failing, every publish returns
/// `DeliveryFailed` and nothing is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockNotificationSink {
    published: Arc<RwLock<Vec<PublishedNotification>>>,
    failing: Arc<RwLock<bool>>,
    attempts: Arc<RwLock<usize>>,
}

impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all delivered notifications.
    pub async fn published(&self) -> Vec<PublishedNotification> {
        self.published.read().await.clone()
    }

    /// Publish calls, delivered or not.
    pub async fn attempts(&self) -> usize {
        *self.attempts.read().await
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    fn name(&self) -> &str {
        "mock"
    }

    async fn publish(&self, topic: &str, notification: &Notification) -> Result<(), NotifyError> {
        *self.attempts.write().await += 1;

        if *self.failing.read().await {
            return Err(NotifyError::DeliveryFailed("mock sink failing".to_string()));
        }

        self.published.write().await.push(PublishedNotification {
            topic: topic.to_string(),
            notification: notification.clone(),
        });
        Ok(())
    }
}
