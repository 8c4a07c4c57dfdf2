//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Retry policies use the [`RetryPolicy`] table layout:
//!
//! ```toml
//! provider_timeout_secs = 90
//! max_concurrent_runs = 8
//!
//! [stage_retry]
//! max_attempts = 2
//! base_delay_ms = 1000
//!
//! [endpoints]
//! base_url = "https://frontend.example.com"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::BrandflowError;
use crate::pipeline::RetryPolicy;

/// Environment variable overriding [`EndpointConfig::base_url`].
pub const BASE_URL_ENV: &str = "FRONTEND_WEBHOOK_URL";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "brandflow=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

/// Where the HTTP state store and notifier send requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Frontend base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the webhook secret.
    #[serde(default = "default_secret_env")]
    pub webhook_secret_env: String,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_secret_env() -> String {
    "WEBHOOK_SECRET".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            webhook_secret_env: default_secret_env(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Policy for state-store reports.
    #[serde(default)]
    pub status_retry: RetryPolicy,
    /// Policy for the completion notifier.
    #[serde(default)]
    pub notify_retry: RetryPolicy,
    /// Policy for whole provider calls within a stage.
    #[serde(default = "RetryPolicy::stage_default")]
    pub stage_retry: RetryPolicy,
    /// Per-call provider timeout.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    /// Per-call notifier timeout.
    #[serde(default = "default_call_timeout")]
    pub notify_timeout_secs: u64,
    /// Per-call state-store timeout.
    #[serde(default = "default_call_timeout")]
    pub store_timeout_secs: u64,
    /// Upper bound on runs executing at once in a batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_runs: usize,
    /// HTTP endpoints.
    #[serde(default)]
    pub endpoints: EndpointConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_provider_timeout() -> u64 {
    120
}

fn default_call_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            status_retry: RetryPolicy::default(),
            notify_retry: RetryPolicy::default(),
            stage_retry: RetryPolicy::stage_default(),
            provider_timeout_secs: default_provider_timeout(),
            notify_timeout_secs: default_call_timeout(),
            store_timeout_secs: default_call_timeout(),
            max_concurrent_runs: default_max_concurrent(),
            endpoints: EndpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, BrandflowError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BrandflowError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&source)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `FRONTEND_WEBHOOK_URL` when it is set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = std::env::var(BASE_URL_ENV).ok().filter(|v| !v.trim().is_empty()) {
            self.endpoints.base_url = url;
        }
    }

    /// Reads the webhook secret from the configured environment variable.
    #[must_use]
    pub fn webhook_secret(&self) -> Option<String> {
        std::env::var(&self.endpoints.webhook_secret_env)
            .ok()
            .filter(|v| !v.is_empty())
    }

    /// Provider timeout as a [`Duration`].
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Notifier timeout as a [`Duration`].
    #[must_use]
    pub const fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    /// State-store timeout as a [`Duration`].
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Rejects values that would stall or never run anything.
    pub fn validate(&self) -> Result<(), BrandflowError> {
        for (name, policy) in [
            ("status_retry", &self.status_retry),
            ("notify_retry", &self.notify_retry),
            ("stage_retry", &self.stage_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(BrandflowError::Config(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
        }
        for (name, secs) in [
            ("provider_timeout_secs", self.provider_timeout_secs),
            ("notify_timeout_secs", self.notify_timeout_secs),
            ("store_timeout_secs", self.store_timeout_secs),
        ] {
            if secs == 0 {
                return Err(BrandflowError::Config(format!("{name} must be positive")));
            }
        }
        if self.max_concurrent_runs == 0 {
            return Err(BrandflowError::Config(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if !self.endpoints.base_url.starts_with("http://")
            && !self.endpoints.base_url.starts_with("https://")
        {
            return Err(BrandflowError::Config(format!(
                "endpoints.base_url must be an http(s) URL, got {:?}",
                self.endpoints.base_url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JitterStrategy;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.status_retry.max_attempts, 3);
        assert_eq!(config.status_retry.base_delay_ms, 1000);
        assert_eq!(config.stage_retry.max_attempts, 2);
        assert_eq!(config.provider_timeout(), Duration::from_secs(120));
        assert_eq!(config.notify_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_concurrent_runs, 4);
        assert_eq!(config.endpoints.base_url, "http://localhost:3000");
        assert_eq!(config.logging.filter, "brandflow=info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_equals_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = PipelineConfig::from_toml_str(
            r#"
            provider_timeout_secs = 60
            max_concurrent_runs = 2

            [notify_retry]
            max_attempts = 5
            jitter = "full"

            [endpoints]
            base_url = "https://frontend.example.com"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.provider_timeout_secs, 60);
        assert_eq!(config.max_concurrent_runs, 2);
        assert_eq!(config.notify_retry.max_attempts, 5);
        assert_eq!(config.notify_retry.base_delay_ms, 1000);
        assert_eq!(config.notify_retry.jitter, JitterStrategy::Full);
        assert_eq!(config.status_retry, RetryPolicy::default());
        assert_eq!(config.endpoints.base_url, "https://frontend.example.com");
        assert_eq!(config.endpoints.webhook_secret_env, "WEBHOOK_SECRET");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PipelineConfig::from_toml_str("max_concurrent_runs = 0").unwrap_err();
        assert!(matches!(err, BrandflowError::Config(_)));

        let err = PipelineConfig::from_toml_str("[stage_retry]\nmax_attempts = 0").unwrap_err();
        assert!(err.to_string().contains("stage_retry.max_attempts"));

        let err =
            PipelineConfig::from_toml_str("[endpoints]\nbase_url = \"ftp://x\"").unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = PipelineConfig::from_toml_str("provider_timeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, BrandflowError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "store_timeout_secs = 5").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.store_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = PipelineConfig::load("/nonexistent/brandflow.toml").unwrap_err();
        assert!(matches!(err, BrandflowError::Io(_)));
    }
}
