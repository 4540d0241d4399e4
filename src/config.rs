//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::worker::retry::{Backoff, RetryPolicy};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker endpoint.
    pub redis_url: String,
    /// Path of the job store database file.
    pub db_path: PathBuf,
    /// Maximum number of jobs processed at once, across all job types.
    pub max_concurrent: usize,
    /// Pause between items of a multi-item job.
    pub item_delay: Duration,
    /// Retry budget and backoff shape for transient failures.
    pub retry: RetryPolicy,
    /// Jobs in processing longer than this are failed by the sweeper.
    pub processing_timeout: Duration,
    /// How long terminal jobs are kept before they are purged.
    pub retention: Duration,
    /// Sweeper period.
    pub sweep_interval: Duration,
    /// Blocking-pop timeout for each priority topic.
    pub poll_timeout: Duration,
    /// Sleep after a poll cycle that found nothing.
    pub idle_backoff: Duration,
    /// Sleep after a broker error in a consumer loop.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            db_path: PathBuf::from("./data/analysis-worker.db"),
            max_concurrent: 5,
            item_delay: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            processing_timeout: Duration::from_secs(30 * 60), // 30 minutes
            retention: Duration::from_secs(24 * 3600),        // 24 hours
            sweep_interval: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(1),
            idle_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let redis_url = std::env::var("REDIS_URL").unwrap_or(defaults.redis_url);
        let db_path = std::env::var("WORKER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let max_concurrent = env_parse("MAX_CONCURRENT_JOBS", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_JOBS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let backoff = match std::env::var("JOB_RETRY_BACKOFF") {
            Ok(raw) => raw.parse::<Backoff>().map_err(|message| ConfigError::InvalidValue {
                key: "JOB_RETRY_BACKOFF".to_string(),
                message,
            })?,
            Err(_) => defaults.retry.backoff,
        };

        let retry = RetryPolicy {
            max_retries: env_parse("JOB_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay: env_secs("JOB_RETRY_BASE_SECS", defaults.retry.base_delay)?,
            backoff,
        };

        Ok(Self {
            redis_url,
            db_path,
            max_concurrent,
            item_delay: env_millis("JOB_ITEM_DELAY_MS", defaults.item_delay)?,
            retry,
            processing_timeout: env_scaled("JOB_TIMEOUT_MINUTES", defaults.processing_timeout, 60)?,
            retention: env_scaled("JOB_RETENTION_HOURS", defaults.retention, 3600)?,
            sweep_interval: require_nonzero(
                "JOB_SWEEP_INTERVAL_SECS",
                env_secs("JOB_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            )?,
            poll_timeout: env_millis("JOB_POLL_TIMEOUT_MS", defaults.poll_timeout)?,
            idle_backoff: defaults.idle_backoff,
            error_backoff: defaults.error_backoff,
        })
    }
}

/// Connection settings for the external AI analysis service.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
}

impl AnalysisConfig {
    /// Build config from environment variables.
    /// `ANALYSIS_SERVICE_URL` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("ANALYSIS_SERVICE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("ANALYSIS_SERVICE_URL".to_string()))?;
        let api_key = std::env::var("ANALYSIS_SERVICE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        let request_timeout =
            env_secs("ANALYSIS_REQUEST_TIMEOUT_SECS", Duration::from_secs(120))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            request_timeout,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

/// Read a duration given in units of `unit_secs` seconds (minutes, hours).
fn env_scaled(key: &str, default: Duration, unit_secs: u64) -> Result<Duration, ConfigError> {
    let units = env_parse(key, default.as_secs() / unit_secs)?;
    units
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{units} is out of range"),
        })
}

fn require_nonzero(key: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_queue_contract() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(30));
        assert_eq!(config.processing_timeout, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // SAFETY: key is unique to this test.
        unsafe { std::env::set_var("ANALYSIS_WORKER_TEST_GARBAGE", "five") };
        let err = env_parse::<usize>("ANALYSIS_WORKER_TEST_GARBAGE", 5).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ANALYSIS_WORKER_TEST_GARBAGE"));
        unsafe { std::env::remove_var("ANALYSIS_WORKER_TEST_GARBAGE") };
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let err = require_nonzero("JOB_SWEEP_INTERVAL_SECS", Duration::ZERO).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "JOB_SWEEP_INTERVAL_SECS"));
        assert_eq!(
            require_nonzero("JOB_SWEEP_INTERVAL_SECS", Duration::from_secs(5)).unwrap(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn scaled_values_do_not_overflow() {
        // SAFETY: key is unique to this test.
        unsafe { std::env::set_var("ANALYSIS_WORKER_TEST_HUGE_HOURS", u64::MAX.to_string()) };
        let err = env_scaled("ANALYSIS_WORKER_TEST_HUGE_HOURS", Duration::from_secs(3600), 3600)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        unsafe { std::env::remove_var("ANALYSIS_WORKER_TEST_HUGE_HOURS") };

        let minutes =
            env_scaled("ANALYSIS_WORKER_TEST_UNSET_MINUTES", Duration::from_secs(1800), 60).unwrap();
        assert_eq!(minutes, Duration::from_secs(1800));
    }

    #[test]
    fn env_parse_falls_back_when_unset() {
        let value = env_parse::<u32>("ANALYSIS_WORKER_TEST_UNSET", 7).unwrap();
        assert_eq!(value, 7);
    }
}
