use crate::{env_or_default, env_required, ConfigError, FromEnv};

/// Configuration for the resilient store client: a primary Redis-compatible
/// endpoint and an optional secondary for failover.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub url: String,
    pub fallback_url: Option<String>,
    pub fallback_enabled: bool,
}

impl StoreConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            fallback_url: None,
            fallback_enabled: false,
        }
    }

    pub fn with_fallback(mut self, url: String) -> Self {
        self.fallback_url = Some(url);
        self.fallback_enabled = true;
        self
    }
}

impl FromEnv for StoreConfig {
    /// Requires `STORE_URL`. `STORE_FALLBACK_URL` and `STORE_FALLBACK_ENABLED`
    /// (default `false`) configure the secondary endpoint used for failover.
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("STORE_URL")?;
        let fallback_url = std::env::var("STORE_FALLBACK_URL").ok();
        let fallback_enabled = env_or_default("STORE_FALLBACK_ENABLED", "false")
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "STORE_FALLBACK_ENABLED".to_string(),
                details: format!("{e}"),
            })?;

        Ok(Self {
            url,
            fallback_enabled: fallback_enabled && fallback_url.is_some(),
            fallback_url,
        })
    }
}
