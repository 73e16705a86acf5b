//! Secret store abstraction for database credentials.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::operation::ErrorKind;

#[derive(Debug, Clone, Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Access to secret {0} denied")]
    AccessDenied(String),

    #[error("Secret {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Secret store unavailable: {0}")]
    Unavailable(String),
}

impl SecretError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretError::NotFound(_) => ErrorKind::NotFound,
            SecretError::AccessDenied(_) => ErrorKind::PermissionDenied,
            SecretError::Malformed { .. } => ErrorKind::Internal,
            SecretError::Unavailable(_) => ErrorKind::TransientProviderError,
        }
    }
}

/// A username/password pair. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get_secret(&self, id: &str) -> Result<Credentials, SecretError>;
}

/// Reads credentials from environment variables holding
/// `{"username": "...", "password": "..."}`.
///
/// The secret id `prod/app-user` maps to `<prefix>PROD_APP_USER`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, id: &str) -> String {
        let normalized: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_secret(&self, id: &str) -> Result<Credentials, SecretError> {
        let raw = std::env::var(self.var_name(id))
            .map_err(|_| SecretError::NotFound(id.to_string()))?;

        serde_json::from_str(&raw).map_err(|e| SecretError::Malformed {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_var_name_normalization() {
        let store = EnvSecretStore::new("CLUSTERBACK_SECRET_");
        assert_eq!(
            store.var_name("prod/app-user"),
            "CLUSTERBACK_SECRET_PROD_APP_USER"
        );
    }

    #[tokio::test]
    async fn test_env_secret_store_reads_json() {
        let store = EnvSecretStore::new("CLUSTERBACK_SECRETS_TEST_");
        std::env::set_var(
            store.var_name("master"),
            r#"{"username":"postgres","password":"pw"}"#,
        );

        let creds = store.get_secret("master").await.unwrap();
        assert_eq!(creds, Credentials::new("postgres", "pw"));
        std::env::remove_var(store.var_name("master"));
    }

    #[test]
    fn test_env_secret_store_rejects_malformed_payload() {
        let store = EnvSecretStore::new("CLUSTERBACK_SECRETS_BAD_TEST_");
        std::env::set_var(store.var_name("replica"), "not json");

        let result = tokio_test::block_on(store.get_secret("replica"));
        tokio_test::assert_err!(result);
        std::env::remove_var(store.var_name("replica"));
    }

    #[tokio::test]
    async fn test_env_secret_store_errors() {
        let store = EnvSecretStore::new("CLUSTERBACK_SECRETS_ERR_TEST_");
        let err = store.get_secret("missing").await.unwrap_err();
        assert!(matches!(err, SecretError::NotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        std::env::set_var(store.var_name("broken"), "not json");
        let err = store.get_secret("broken").await.unwrap_err();
        assert!(matches!(err, SecretError::Malformed { .. }));
        std::env::remove_var(store.var_name("broken"));
    }
}
