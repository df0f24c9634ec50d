// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::errors::ConfigError;
use crate::lifecycle::FailurePolicy;

pub const DEFAULT_PORT: u16 = 8080;
/// 10MB in bytes
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Runtime configuration of the batcher, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address of the reverse proxy whose `X-Forwarded-For` header is trusted
    pub trusted_proxy: String,
    /// Collector URL batches are posted to
    pub post_endpoint: String,
    /// Total delivery attempts per batch
    pub max_retries: u32,
    /// Pause between delivery attempts
    pub retry_wait: Duration,
    /// How often the timer stimulus fires, in seconds
    pub check_frequency: u64,
    /// Elapsed seconds after which the timer stimulus flushes a non-empty store
    pub batch_interval: u64,
    /// Distinct users that make a batch due
    pub batch_size: usize,
    pub port: u16,
    /// Timeout for each POST to the collector
    pub request_timeout: Duration,
    pub max_request_content_length: usize,
    /// What to do with a batch whose delivery is exhausted
    pub failure_policy: FailurePolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trusted_proxy: "localhost".to_string(),
            post_endpoint: String::new(),
            max_retries: 3,
            retry_wait: Duration::from_secs(2),
            check_frequency: 10,
            batch_interval: 10,
            batch_size: 20,
            port: DEFAULT_PORT,
            request_timeout: Duration::from_secs(10),
            max_request_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            failure_policy: FailurePolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables.
    ///
    /// Unset or empty variables take their default. `POST_ENDPOINT` has none.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let post_endpoint = var("POST_ENDPOINT").ok_or(ConfigError::Missing("POST_ENDPOINT"))?;

        let config = Self {
            trusted_proxy: var("TRUSTED_PROXY").unwrap_or(defaults.trusted_proxy),
            post_endpoint,
            max_retries: parse_int(var("MAX_RETRIES"), "MAX_RETRIES", defaults.max_retries)?,
            retry_wait: Duration::from_secs(parse_int(
                var("RETRY_WAIT"),
                "RETRY_WAIT",
                defaults.retry_wait.as_secs(),
            )?),
            check_frequency: parse_int(
                var("CHECK_FREQUENCY"),
                "CHECK_FREQUENCY",
                defaults.check_frequency,
            )?,
            batch_interval: parse_int(
                var("BATCH_INTERVAL"),
                "BATCH_INTERVAL",
                defaults.batch_interval,
            )?,
            batch_size: parse_int(var("BATCH_SIZE"), "BATCH_SIZE", defaults.batch_size)?,
            port: parse_int(var("PORT"), "PORT", defaults.port)?,
            request_timeout: Duration::from_secs(parse_int(
                var("REQUEST_TIMEOUT"),
                "REQUEST_TIMEOUT",
                defaults.request_timeout.as_secs(),
            )?),
            max_request_content_length: defaults.max_request_content_length,
            failure_policy: match var("ON_DELIVERY_FAILURE") {
                Some(value) => value.parse()?,
                None => defaults.failure_policy,
            },
            log_level: var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match reqwest::Url::parse(&self.post_endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::Invalid(format!(
                    "POST_ENDPOINT must be an http or https URL, got scheme '{}'",
                    url.scheme()
                )))
            }
            Err(e) => {
                return Err(ConfigError::Invalid(format!(
                    "POST_ENDPOINT '{}' is not a valid URL: {e}",
                    self.post_endpoint
                )))
            }
        }

        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "MAX_RETRIES must be greater than 0".to_string(),
            ));
        }
        if self.check_frequency == 0 {
            return Err(ConfigError::Invalid(
                "CHECK_FREQUENCY must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "BATCH_SIZE must be greater than 0".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn parse_int<T: FromStr>(
    value: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => {
            debug!("{name} is not set, using default value");
            Ok(default)
        }
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidInteger { name, value }),
    }
}
