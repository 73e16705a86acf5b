//! Mock secret store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::secrets::{Credentials, SecretError, SecretStore};

use super::fixtures;

/// Mock implementation of the `SecretStore` trait.
///
/// Holds credentials in memory and records every lookup.
#[derive(Debug, Clone, Default)]
pub struct MockSecretStore {
    secrets: Arc<RwLock<HashMap<String, Credentials>>>,
    lookups: Arc<RwLock<Vec<String>>>,
    next_error: Arc<RwLock<Option<SecretError>>>,
}

impl MockSecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding [`fixtures::default_secrets`].
    pub fn with_defaults() -> Self {
        let secrets = fixtures::default_secrets()
            .into_iter()
            .map(|(id, (username, password))| (id, Credentials::new(username, password)))
            .collect();
        Self {
            secrets: Arc::new(RwLock::new(secrets)),
            ..Self::default()
        }
    }

    pub async fn insert(&self, id: &str, credentials: Credentials) {
        self.secrets.write().await.insert(id.to_string(), credentials);
    }

    pub async fn remove(&self, id: &str) {
        self.secrets.write().await.remove(id);
    }

    /// Configure the next lookup to fail with the given error.
    pub async fn set_next_error(&self, error: SecretError) {
        *self.next_error.write().await = Some(error);
    }

    /// Ids looked up so far, in order.
    pub async fn lookups(&self) -> Vec<String> {
        self.lookups.read().await.clone()
    }
}

#[async_trait]
impl SecretStore for MockSecretStore {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_secret(&self, id: &str) -> Result<Credentials, SecretError> {
        self.lookups.write().await.push(id.to_string());

        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }

        self.secrets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(id.to_string()))
    }
}
