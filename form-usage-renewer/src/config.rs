use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::period::Slack;
use crate::retry::RetryConfig;
use crate::transport::ThrottlePolicy;

const DEFAULT_COLLECTOR: &str = "http://localhost:9080";

/// Settings of a renewer deployment
///
/// Every field has a default, so a config file only needs the values it changes:
///
/// | field | default |
/// |---|---|
/// | `collector_url` | `http://localhost:9080` |
/// | `secured` | `false` |
/// | `token` | none |
/// | `slack` | `2D` |
/// | `page_size` | `100` |
/// | `interval_secs` | `3600` |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewerConfig {
    /// Base url of the usage collector
    pub collector_url: String,
    /// Whether collector calls carry a bearer token
    pub secured: bool,
    /// Static bearer token used by the binary when secured
    pub token: Option<String>,
    /// Retention window of the aggregator
    pub slack: Slack,
    /// Carry-over records read per page
    pub page_size: usize,
    /// Seconds between two scheduled renewal passes
    pub interval_secs: u64,
    pub client: ClientSettings,
}

impl Default for RenewerConfig {
    fn default() -> Self {
        Self {
            collector_url: DEFAULT_COLLECTOR.to_string(),
            secured: false,
            token: None,
            slack: Slack::default(),
            page_size: 100,
            interval_secs: 3600,
            client: ClientSettings::default(),
        }
    }
}

impl RenewerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        log::info!("Reading renewer config from {}", path.as_ref().display());
        let config = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Resilience settings of the collector client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub failure_threshold: usize,
    pub reset_timeout_secs: u64,
    pub throttle: ThrottlePolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            failure_threshold: 5,
            reset_timeout_secs: 30,
            throttle: ThrottlePolicy::default(),
        }
    }
}

impl ClientSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..RetryConfig::default()
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            ..CircuitBreakerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::SlackUnit;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RenewerConfig = serde_json::from_str(
            r#"{ "collector_url": "http://collector", "secured": true, "slack": "1M", "client": { "max_retries": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.collector_url, "http://collector");
        assert!(config.secured);
        assert_eq!(config.slack.unit, SlackUnit::Months);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.interval(), Duration::from_secs(3600));
        assert_eq!(config.client.max_retries, 5);
        assert_eq!(config.client.timeout_ms, 5000);
        assert_eq!(config.client.throttle, ThrottlePolicy::default());
    }

    #[test]
    fn test_invalid_slack_is_rejected() {
        let result = serde_json::from_str::<RenewerConfig>(r#"{ "slack": "soon" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "page_size": 7, "interval_secs": 60 }}"#).unwrap();

        let config = RenewerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.page_size, 7);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert!(!config.secured);
    }

    #[test]
    fn test_client_settings_conversion() {
        let settings = ClientSettings::default();
        assert_eq!(settings.retry_config().initial_backoff, Duration::from_millis(100));
        assert_eq!(settings.circuit_breaker_config().reset_timeout, Duration::from_secs(30));
        assert_eq!(settings.circuit_breaker_config().failure_threshold, 5);
    }
}
