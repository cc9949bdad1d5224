// src/config.rs
use crate::store::RedisOptions;
use crate::{JobOptions, LeaseMqError, Result, WorkerConfig};
use std::str::FromStr;
use std::time::Duration;

/// Deployment settings read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub key_prefix: String,
    pub queue: String,
    pub concurrency: usize,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "lmq".to_string(),
            queue: "default".to_string(),
            concurrency: 10,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            max_attempts: 3,
        }
    }
}

impl Config {
    /// Load from process environment, after applying any `.env` file.
    ///
    /// `REDIS_URL` wins over `REDIS_HOST`/`REDIS_PORT`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let redis_url = match lookup("REDIS_URL") {
            Some(url) => url,
            None => match (lookup("REDIS_HOST"), lookup("REDIS_PORT")) {
                (None, None) => defaults.redis_url,
                (host, port) => {
                    let host = host.unwrap_or_else(|| "localhost".to_string());
                    let port: u16 = parse_opt("REDIS_PORT", port)?.unwrap_or(6379);
                    format!("redis://{}:{}", host, port)
                }
            },
        };

        let lease_secs: Option<u64> = parse_opt("LEASEMQ_LEASE_SECS", lookup("LEASEMQ_LEASE_SECS"))?;
        let poll_ms: Option<u64> = parse_opt("LEASEMQ_POLL_MS", lookup("LEASEMQ_POLL_MS"))?;

        let config = Self {
            redis_url,
            key_prefix: lookup("LEASEMQ_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            queue: lookup("LEASEMQ_QUEUE").unwrap_or(defaults.queue),
            concurrency: parse_opt("LEASEMQ_CONCURRENCY", lookup("LEASEMQ_CONCURRENCY"))?
                .unwrap_or(defaults.concurrency),
            lease_duration: lease_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            poll_interval: poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            max_attempts: parse_opt("LEASEMQ_MAX_ATTEMPTS", lookup("LEASEMQ_MAX_ATTEMPTS"))?
                .unwrap_or(defaults.max_attempts),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(LeaseMqError::InvalidInput("LEASEMQ_QUEUE is empty".into()));
        }
        if self.concurrency == 0 {
            return Err(LeaseMqError::InvalidInput(
                "LEASEMQ_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(LeaseMqError::InvalidInput(
                "LEASEMQ_LEASE_SECS must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(LeaseMqError::InvalidInput(
                "LEASEMQ_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn redis_options(&self) -> RedisOptions {
        RedisOptions {
            redis_url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queue: self.queue.clone(),
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            lease_duration: self.lease_duration,
            renew_interval: Some(self.lease_duration / 3),
            ..WorkerConfig::default()
        }
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions::default().with_max_attempts(self.max_attempts)
    }
}

fn parse_opt<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|_| {
            LeaseMqError::InvalidInput(format!("{} has invalid value '{}'", key, value))
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.queue, "default");
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn host_and_port_build_url() {
        let config = load(&[("REDIS_HOST", "redis"), ("REDIS_PORT", "6380")]).unwrap();
        assert_eq!(config.redis_url, "redis://redis:6380");

        let config = load(&[("REDIS_HOST", "redis")]).unwrap();
        assert_eq!(config.redis_url, "redis://redis:6379");
    }

    #[test]
    fn explicit_url_wins() {
        let config = load(&[
            ("REDIS_URL", "redis://cache:7000/2"),
            ("REDIS_HOST", "ignored"),
        ])
        .unwrap();
        assert_eq!(config.redis_url, "redis://cache:7000/2");
    }

    #[test]
    fn worker_settings_flow_through() {
        let config = load(&[
            ("LEASEMQ_QUEUE", "sql-execution-queue"),
            ("LEASEMQ_CONCURRENCY", "4"),
            ("LEASEMQ_LEASE_SECS", "60"),
            ("LEASEMQ_POLL_MS", "250"),
        ])
        .unwrap();
        let worker = config.worker_config();
        assert_eq!(worker.queue, "sql-execution-queue");
        assert_eq!(worker.concurrency, 4);
        assert_eq!(worker.lease_duration, Duration::from_secs(60));
        assert_eq!(worker.renew_interval, Some(Duration::from_secs(20)));
        assert_eq!(worker.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            load(&[("LEASEMQ_CONCURRENCY", "many")]),
            Err(LeaseMqError::InvalidInput(_))
        ));
        assert!(matches!(
            load(&[("REDIS_PORT", "99999")]),
            Err(LeaseMqError::InvalidInput(_))
        ));
        assert!(matches!(
            load(&[("LEASEMQ_MAX_ATTEMPTS", "0")]),
            Err(LeaseMqError::InvalidInput(_))
        ));
    }
}
