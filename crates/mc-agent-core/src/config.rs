// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::queue::backoff::RetryPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SERVER_ID: &str = "minecraft-01";
pub const DEFAULT_LOG_PATH: &str = "/mc/logs/latest.log";
pub const DEFAULT_QUEUE_DIR: &str = "/app/queue";
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TAIL_POLL_MS: u64 = 200;
pub const DEFAULT_DRAIN_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_DEAD_LETTER_MAX: usize = 1_000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_SHUTDOWN_DRAIN_SECS: u64 = 5;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors found while loading or validating the agent configuration.
///
/// All of these are fatal at startup: the agent refuses to enter its run loop.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("AGENT_KEY is not set; refusing to send unsigned events (set DRY_RUN=1 to run unsigned)")]
    MissingSigningKey,

    #[error("INGEST_URL is not set; it is required when DRY_RUN is disabled")]
    MissingIngestUrl,

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the agent, loaded from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier stamped on every event
    pub server_id: String,
    /// Pre-shared HMAC secret
    pub agent_key: Option<String>,
    /// Ingest endpoint receiving signed envelopes
    pub ingest_url: Option<String>,
    /// Server log file to tail
    pub log_path: PathBuf,
    /// Interval between metrics samples
    pub metrics_interval: Duration,
    /// Directory holding the on-disk delivery queue
    pub queue_dir: PathBuf,
    /// Print envelopes to the console instead of posting them
    pub dry_run: bool,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub tail_poll_interval: Duration,
    /// Read a log file that already exists at startup from its beginning
    pub tail_from_start: bool,
    pub drain_interval: Duration,
    pub retry: RetryPolicy,
    /// Number of dead-lettered entries kept for inspection
    pub dead_letter_max: usize,
    /// Per-attempt HTTP timeout
    pub http_timeout: Duration,
    /// Upper bound for the final drain pass on shutdown
    pub shutdown_drain_timeout: Duration,
    pub https_proxy: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_id: DEFAULT_SERVER_ID.to_string(),
            agent_key: None,
            ingest_url: None,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            queue_dir: PathBuf::from(DEFAULT_QUEUE_DIR),
            dry_run: true,
            log_level: "info".to_string(),
            tail_poll_interval: Duration::from_millis(DEFAULT_TAIL_POLL_MS),
            tail_from_start: false,
            drain_interval: Duration::from_millis(DEFAULT_DRAIN_INTERVAL_MS),
            retry: RetryPolicy::default(),
            dead_letter_max: DEFAULT_DEAD_LETTER_MAX,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            shutdown_drain_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_DRAIN_SECS),
            https_proxy: None,
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key lookup, falling back to defaults
    /// for unset keys. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let retry_defaults = defaults.retry;

        let config = Self {
            server_id: get("SERVER_ID").unwrap_or(defaults.server_id),
            agent_key: get("AGENT_KEY"),
            ingest_url: get("INGEST_URL"),
            log_path: get("MC_LOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_path),
            metrics_interval: parse_or(&get, "METRIC_INTERVAL", defaults.metrics_interval, secs)?,
            queue_dir: get("QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.queue_dir),
            dry_run: parse_or(&get, "DRY_RUN", defaults.dry_run, parse_bool)?,
            log_level: get("MC_AGENT_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            tail_poll_interval: parse_or(
                &get,
                "TAIL_POLL_MS",
                defaults.tail_poll_interval,
                millis,
            )?,
            tail_from_start: parse_or(
                &get,
                "TAIL_FROM_START",
                defaults.tail_from_start,
                parse_bool,
            )?,
            drain_interval: parse_or(&get, "DRAIN_INTERVAL_MS", defaults.drain_interval, millis)?,
            retry: RetryPolicy {
                base_delay: parse_or(&get, "RETRY_BASE_MS", retry_defaults.base_delay, millis)?,
                max_delay: parse_or(&get, "RETRY_MAX_MS", retry_defaults.max_delay, millis)?,
                fast_attempts: parse_or(
                    &get,
                    "RETRY_FAST_ATTEMPTS",
                    retry_defaults.fast_attempts,
                    number,
                )?,
                max_attempts: parse_or(
                    &get,
                    "RETRY_MAX_ATTEMPTS",
                    retry_defaults.max_attempts,
                    number,
                )?,
                max_age: parse_or(&get, "RETRY_MAX_AGE_SECS", retry_defaults.max_age, secs)?,
            },
            dead_letter_max: parse_or(&get, "DEAD_LETTER_MAX", defaults.dead_letter_max, number)?,
            http_timeout: parse_or(&get, "HTTP_TIMEOUT_SECS", defaults.http_timeout, secs)?,
            shutdown_drain_timeout: parse_or(
                &get,
                "SHUTDOWN_DRAIN_SECS",
                defaults.shutdown_drain_timeout,
                secs,
            )?,
            https_proxy: get("HTTPS_PROXY"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.trim().is_empty() {
            return Err(ConfigError::Invalid("SERVER_ID cannot be empty".to_string()));
        }

        if !self.dry_run {
            if self.agent_key.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingSigningKey);
            }
            match self.ingest_url.as_deref() {
                None | Some("") => return Err(ConfigError::MissingIngestUrl),
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    return Err(ConfigError::InvalidValue {
                        key: "INGEST_URL",
                        value: url.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        if self.metrics_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "METRIC_INTERVAL must be greater than 0".to_string(),
            ));
        }
        if self.tail_poll_interval.is_zero() || self.drain_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "TAIL_POLL_MS and DRAIN_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "HTTP_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        self.retry.validate()?;

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn parse_or<G, T, P>(get: &G, key: &'static str, default: T, parse: P) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => parse(value.trim()).ok_or(ConfigError::InvalidValue { key, value }),
    }
}

fn millis(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_millis)
}

fn secs(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_secs)
}

fn number<T: FromStr>(value: &str) -> Option<T> {
    value.parse().ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.server_id, DEFAULT_SERVER_ID);
        assert_eq!(config.log_path, PathBuf::from(DEFAULT_LOG_PATH));
        assert_eq!(config.queue_dir, PathBuf::from(DEFAULT_QUEUE_DIR));
        assert_eq!(config.metrics_interval, Duration::from_secs(30));
        assert!(config.dry_run);
        assert!(!config.tail_from_start);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("SERVER_ID", "survival-eu"),
            ("AGENT_KEY", "s3cret"),
            ("INGEST_URL", "https://ingest.example.com/api/ingest"),
            ("MC_LOG", "/srv/mc/logs/latest.log"),
            ("METRIC_INTERVAL", "10"),
            ("QUEUE_DIR", "/var/spool/mc-agent"),
            ("DRY_RUN", "0"),
            ("MC_AGENT_LOG_LEVEL", "DEBUG"),
            ("RETRY_BASE_MS", "250"),
            ("RETRY_MAX_ATTEMPTS", "7"),
        ]))
        .unwrap();
        assert_eq!(config.server_id, "survival-eu");
        assert_eq!(config.agent_key.as_deref(), Some("s3cret"));
        assert_eq!(config.metrics_interval, Duration::from_secs(10));
        assert!(!config.dry_run);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn test_missing_key_is_fatal_without_dry_run() {
        let result = AgentConfig::from_lookup(lookup(&[
            ("DRY_RUN", "0"),
            ("INGEST_URL", "https://ingest.example.com"),
        ]));
        assert!(matches!(result, Err(ConfigError::MissingSigningKey)));
    }

    #[test]
    fn test_empty_key_is_fatal_without_dry_run() {
        let result = AgentConfig::from_lookup(lookup(&[
            ("DRY_RUN", "0"),
            ("AGENT_KEY", ""),
            ("INGEST_URL", "https://ingest.example.com"),
        ]));
        assert!(matches!(result, Err(ConfigError::MissingSigningKey)));
    }

    #[test]
    fn test_missing_ingest_url_is_fatal_without_dry_run() {
        let result = AgentConfig::from_lookup(lookup(&[("DRY_RUN", "0"), ("AGENT_KEY", "k")]));
        assert!(matches!(result, Err(ConfigError::MissingIngestUrl)));
    }

    #[test]
    fn test_dry_run_allows_missing_key() {
        let config = AgentConfig::from_lookup(lookup(&[("DRY_RUN", "1")])).unwrap();
        assert!(config.dry_run);
        assert!(config.agent_key.is_none());
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let result = AgentConfig::from_lookup(lookup(&[("METRIC_INTERVAL", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                key: "METRIC_INTERVAL",
                ..
            })
        ));

        let result = AgentConfig::from_lookup(lookup(&[("DRY_RUN", "maybe")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key: "DRY_RUN", .. })
        ));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = AgentConfig {
            metrics_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = AgentConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ingest_url_scheme() {
        let config = AgentConfig {
            dry_run: false,
            agent_key: Some("k".to_string()),
            ingest_url: Some("ftp://ingest".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "INGEST_URL",
                ..
            })
        ));
    }
}
