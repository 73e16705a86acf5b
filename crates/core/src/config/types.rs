use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::engine::OrchestratorConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Resource control / provisioning gateway. Required to run restores.
    #[serde(default)]
    pub control_plane: Option<ControlPlaneConfig>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// Shared key/value settings, consulted below trigger input, step
    /// outputs and environment in the layered lookup.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("clusterback.db")
}

/// Control-plane gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlPlaneConfig {
    /// Gateway base URL (e.g., "https://control-plane.internal")
    pub url: String,
    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

/// Notification sinks. The log sink is always available.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub log: bool,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Secret store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// Prefix of environment variables holding credentials as JSON
    #[serde(default = "default_secret_prefix")]
    pub env_prefix: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_prefix: default_secret_prefix(),
        }
    }
}

fn default_secret_prefix() -> String {
    "CLUSTERBACK_SECRET_".to_string()
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<SanitizedControlPlaneConfig>,
    pub notifications: SanitizedNotificationsConfig,
    pub secrets: SecretsConfig,
    pub settings: BTreeMap<String, String>,
}

/// Sanitized control-plane config (token hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedControlPlaneConfig {
    pub url: String,
    pub api_token_configured: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedNotificationsConfig {
    pub log: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            orchestrator: config.orchestrator.clone(),
            control_plane: config
                .control_plane
                .as_ref()
                .map(|c| SanitizedControlPlaneConfig {
                    url: c.url.clone(),
                    api_token_configured: c.api_token.as_ref().is_some_and(|t| !t.is_empty()),
                    timeout_secs: c.timeout_secs,
                }),
            notifications: SanitizedNotificationsConfig {
                log: config.notifications.log,
                webhook_url: config.notifications.webhook.as_ref().map(|w| w.url.clone()),
            },
            secrets: config.secrets.clone(),
            settings: config.settings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.database.path.to_str().unwrap(), "clusterback.db");
        assert!(config.control_plane.is_none());
        assert!(config.notifications.log);
        assert_eq!(config.secrets.env_prefix, "CLUSTERBACK_SECRET_");
    }

    #[test]
    fn test_deserialize_control_plane() {
        let toml = r#"
[control_plane]
url = "https://cp.internal"
api_token = "tok"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let cp = config.control_plane.unwrap();
        assert_eq!(cp.url, "https://cp.internal");
        assert_eq!(cp.api_token.as_deref(), Some("tok"));
        assert_eq!(cp.timeout_secs, 30);
    }

    #[test]
    fn test_deserialize_settings_table() {
        let toml = r#"
[settings]
snapshot_name_template = "nightly-{cluster}-{date}"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.settings.get("snapshot_name_template").unwrap(),
            "nightly-{cluster}-{date}"
        );
    }

    #[test]
    fn test_sanitized_config_hides_tokens() {
        let config = Config {
            control_plane: Some(ControlPlaneConfig {
                url: "https://cp.internal".to_string(),
                api_token: Some("secret-token".to_string()),
                timeout_secs: 10,
            }),
            notifications: NotificationsConfig {
                log: true,
                webhook: Some(WebhookConfig {
                    url: "https://hooks.internal/restore".to_string(),
                    auth_header: Some("Bearer abc".to_string()),
                    timeout_secs: 5,
                }),
            },
            ..Default::default()
        };

        let sanitized = SanitizedConfig::from(&config);
        let cp = sanitized.control_plane.as_ref().unwrap();
        assert!(cp.api_token_configured);

        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("Bearer abc"));
        assert!(json.contains("hooks.internal"));
    }
}
