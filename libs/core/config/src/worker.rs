use crate::{env_or_default, ConfigError, FromEnv};

/// Process-level configuration shared by every worker, independent of which
/// queue or job kinds it serves (that lives in `broker::BrokerConfig`).
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Port the Prometheus exporter listens on.
    pub metrics_port: u16,
    /// Port the `/health` endpoint listens on.
    pub health_port: u16,
}

impl WorkerConfig {
    pub fn new(metrics_port: u16, health_port: u16) -> Self {
        Self {
            metrics_port,
            health_port,
        }
    }
}

impl FromEnv for WorkerConfig {
    /// Reads `METRICS_PORT` (default 9100) and `HEALTH_PORT` (default 8080).
    fn from_env() -> Result<Self, ConfigError> {
        let metrics_port = env_or_default("METRICS_PORT", "9100")
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "METRICS_PORT".to_string(),
                details: format!("{e}"),
            })?;
        let health_port =
            env_or_default("HEALTH_PORT", "8080")
                .parse()
                .map_err(|e| ConfigError::ParseError {
                    key: "HEALTH_PORT".to_string(),
                    details: format!("{e}"),
                })?;

        Ok(Self {
            metrics_port,
            health_port,
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            metrics_port: 9100,
            health_port: 8080,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        temp_env::with_vars(
            [("METRICS_PORT", None::<&str>), ("HEALTH_PORT", None::<&str>)],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.metrics_port, 9100);
                assert_eq!(config.health_port, 8080);
            },
        );
    }

    #[test]
    fn reads_custom_ports() {
        temp_env::with_vars(
            [("METRICS_PORT", Some("9200")), ("HEALTH_PORT", Some("8081"))],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.metrics_port, 9200);
                assert_eq!(config.health_port, 8081);
            },
        );
    }
}
