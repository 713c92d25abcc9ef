use std::env;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.nixtla.io";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_PARTITION_WORKERS: usize = 10;

/// How many trailing rows to send when the full history is not needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRestriction {
    /// Multiple of the model input size kept when intervals are requested.
    pub interval_multiplier: usize,
}

impl Default for InputRestriction {
    fn default() -> Self {
        Self {
            interval_multiplier: 3,
        }
    }
}

impl InputRestriction {
    pub fn rows(&self, with_intervals: bool, input_size: usize, model_horizon: usize, h: usize) -> usize {
        if with_intervals {
            self.interval_multiplier * input_size + model_horizon.max(h)
        } else {
            input_size
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    /// Per-attempt request timeout; `None` disables it.
    pub timeout: Option<Duration>,
    pub max_retries: usize,
    pub retry_interval: Duration,
    pub max_wait_time: Duration,
    pub max_partition_workers: usize,
    pub input_restriction: InputRestriction,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        let retry = RetryPolicy::default();
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_retries: retry.max_retries,
            retry_interval: retry.retry_interval,
            max_wait_time: retry.max_wait_time,
            max_partition_workers: DEFAULT_MAX_PARTITION_WORKERS,
            input_restriction: InputRestriction::default(),
        }
    }

    /// Loads `.env` if present, then reads `NIXTLA_*` variables.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(env_optional)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("NIXTLA_API_KEY")
            .ok_or_else(|| ClientError::configuration("missing env var NIXTLA_API_KEY"))?;
        let mut config = Self::new(api_key);
        if let Some(base_url) = lookup("NIXTLA_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(secs) = parse_u64(&lookup, "NIXTLA_TIMEOUT_SECS")? {
            config.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(retries) = parse_u64(&lookup, "NIXTLA_MAX_RETRIES")? {
            config.max_retries = retries as usize;
        }
        if let Some(secs) = parse_u64(&lookup, "NIXTLA_RETRY_INTERVAL_SECS")? {
            config.retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "NIXTLA_MAX_WAIT_TIME_SECS")? {
            config.max_wait_time = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    pub fn with_max_partition_workers(mut self, workers: usize) -> Self {
        self.max_partition_workers = workers.max(1);
        self
    }

    pub fn with_input_restriction(mut self, restriction: InputRestriction) -> Self {
        self.input_restriction = restriction;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_interval: self.retry_interval,
            max_wait_time: self.max_wait_time,
        }
    }

    pub fn is_azure(&self) -> bool {
        self.base_url.contains("ai.azure")
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| ClientError::configuration(format!("invalid {key}: {raw}")))
        })
        .transpose()
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_the_key_is_set() {
        let config = ClientConfig::from_lookup(lookup(&[("NIXTLA_API_KEY", "secret")])).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_retries, 6);
        assert_eq!(config.retry_interval, Duration::from_secs(10));
        assert_eq!(config.max_wait_time, Duration::from_secs(360));
        assert!(!config.is_azure());
    }

    #[test]
    fn env_values_override_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("NIXTLA_API_KEY", "secret"),
            ("NIXTLA_BASE_URL", "https://timegpt.eastus.inference.ai.azure.com"),
            ("NIXTLA_TIMEOUT_SECS", "0"),
            ("NIXTLA_MAX_RETRIES", "2"),
        ]))
        .unwrap();
        assert!(config.is_azure());
        assert_eq!(config.timeout, None);
        assert_eq!(config.retry_policy().max_retries, 2);
    }

    #[test]
    fn missing_key_and_bad_numbers_are_configuration_errors() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[])),
            Err(ClientError::Configuration(_))
        ));
        assert!(ClientConfig::from_lookup(lookup(&[
            ("NIXTLA_API_KEY", "secret"),
            ("NIXTLA_MAX_RETRIES", "many"),
        ]))
        .is_err());
    }

    #[test]
    fn restriction_sends_more_rows_for_intervals() {
        let policy = InputRestriction::default();
        assert_eq!(policy.rows(true, 100, 24, 48), 348);
        assert_eq!(policy.rows(false, 100, 24, 48), 100);
    }
}
