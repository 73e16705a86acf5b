use super::{types::Config, ConfigError};

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

/// Validate configuration values serde cannot rule out.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    let orchestrator = &config.orchestrator;
    let poll = &orchestrator.poll;
    if poll.base_interval_ms == 0 {
        return Err(invalid("orchestrator.poll.base_interval_ms must be positive"));
    }
    if poll.max_interval_ms < poll.base_interval_ms {
        return Err(invalid(
            "orchestrator.poll.max_interval_ms cannot be below base_interval_ms",
        ));
    }
    if poll.max_poll_attempts == 0 {
        return Err(invalid("orchestrator.poll.max_poll_attempts must be positive"));
    }

    let retry = &orchestrator.retry;
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(invalid(
            "orchestrator.retry.max_delay_ms cannot be below base_delay_ms",
        ));
    }

    if orchestrator.max_concurrent_operations == 0 {
        return Err(invalid(
            "orchestrator.max_concurrent_operations must be positive",
        ));
    }
    if orchestrator.lease_ttl_secs == 0 {
        return Err(invalid("orchestrator.lease_ttl_secs must be positive"));
    }
    if orchestrator.notification_topic.trim().is_empty() {
        return Err(invalid("orchestrator.notification_topic cannot be empty"));
    }

    if let Some(ref cp) = config.control_plane {
        if cp.url.trim().is_empty() {
            return Err(invalid("control_plane.url cannot be empty"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    use crate::config::ServerConfig;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".parse::<IpAddr>().unwrap(),
                port: 0,
            },
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_poll_bounds() {
        let mut config = Config::default();
        config.orchestrator.poll.base_interval_ms = 10_000;
        config.orchestrator.poll.max_interval_ms = 5_000;
        assert!(validate_config(&config).is_err());

        config.orchestrator.poll.max_interval_ms = 10_000;
        assert!(validate_config(&config).is_ok());

        config.orchestrator.poll.base_interval_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_empty_topic() {
        let mut config = Config::default();
        config.orchestrator.notification_topic = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }
}
