//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use handoff_infra::config::{IngestConfig, QueueConfig, TtlPolicy, WorkerConfig};

const DEV_JWT_SECRET: &str = "dev-secret";

/// Upper bound for `HANDOFF_MAX_WAIT_MS`; longer holds belong on the 202 path.
pub const MAX_WAIT_CEILING: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Wrapped REST API settings. Absent means the scripted in-memory API is used.
#[derive(Clone)]
pub struct DownstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl core::fmt::Debug for DownstreamConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DownstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// Postgres request store; in-memory when unset.
    pub database_url: Option<String>,
    /// Redis Streams queue; in-memory when unset.
    pub redis_url: Option<String>,
    pub downstream: Option<DownstreamConfig>,
    pub ingest: IngestConfig,
    pub ttl: TtlPolicy,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    /// How often expired request records are purged.
    pub reaper_interval: Duration,
}

impl core::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url.is_some())
            .field("redis_url", &self.redis_url.is_some())
            .field("downstream", &self.downstream)
            .field("ingest", &self.ingest)
            .field("ttl", &self.ttl)
            .field("queue", &self.queue)
            .field("worker", &self.worker)
            .field("reaper_interval", &self.reaper_interval)
            .finish_non_exhaustive()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            database_url: None,
            redis_url: None,
            downstream: None,
            ingest: IngestConfig::default(),
            ttl: TtlPolicy::default(),
            worker: WorkerConfig {
                max_receive_count: queue.max_receive_count,
                ..WorkerConfig::default()
            },
            queue,
            reaper_interval: Duration::from_secs(300),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(addr) = parse(&get, "HANDOFF_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        match get("JWT_SECRET") {
            Some(secret) => config.jwt_secret = secret,
            None => tracing::warn!("JWT_SECRET not set; using insecure dev default"),
        }
        config.database_url = get("DATABASE_URL");
        config.redis_url = get("REDIS_URL");
        config.downstream = get("DOWNSTREAM_BASE_URL")
            .map(|base_url| -> Result<_, ConfigError> {
                Ok(DownstreamConfig {
                    base_url,
                    api_key: get("DOWNSTREAM_API_KEY"),
                    timeout: millis(&get, "DOWNSTREAM_TIMEOUT_MS")?
                        .unwrap_or(Duration::from_secs(10)),
                })
            })
            .transpose()?;

        if let Some(d) = millis(&get, "HANDOFF_DEFAULT_WAIT_MS")? {
            config.ingest.default_wait = d;
        }
        if let Some(d) = millis(&get, "HANDOFF_MAX_WAIT_MS")? {
            if d > MAX_WAIT_CEILING {
                return Err(invalid(&get, "HANDOFF_MAX_WAIT_MS"));
            }
            config.ingest.max_wait = d;
        }
        if let Some(d) = millis(&get, "HANDOFF_POLL_INTERVAL_MS")? {
            if d.is_zero() {
                return Err(invalid(&get, "HANDOFF_POLL_INTERVAL_MS"));
            }
            config.ingest.poll_interval = d;
        }

        if let Some(d) = secs(&get, "HANDOFF_REQUEST_TTL_SECS")? {
            config.ttl.standard = d;
        }
        if let Some(d) = secs(&get, "HANDOFF_AUDIT_TTL_SECS")? {
            config.ttl.audit = d;
        }

        if let Some(n) = parse::<u32>(&get, "HANDOFF_MAX_RECEIVE_COUNT")? {
            if n == 0 {
                return Err(invalid(&get, "HANDOFF_MAX_RECEIVE_COUNT"));
            }
            config.queue.max_receive_count = n;
            config.worker.max_receive_count = n;
        }
        if let Some(d) = secs(&get, "HANDOFF_VISIBILITY_TIMEOUT_SECS")? {
            config.queue.visibility_timeout = d;
        }
        if let Some(n) = parse::<usize>(&get, "HANDOFF_WORKER_BATCH_SIZE")? {
            if n == 0 {
                return Err(invalid(&get, "HANDOFF_WORKER_BATCH_SIZE"));
            }
            config.worker.batch_size = n;
        }
        if let Some(d) = secs(&get, "HANDOFF_REAPER_INTERVAL_SECS")? {
            config.reaper_interval = d;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}

fn millis(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(get, var)?.map(Duration::from_millis))
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(get, var)?.map(Duration::from_secs))
}

fn invalid(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: get(var).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.ingest, IngestConfig::default());
        assert_eq!(config.queue.max_receive_count, 5);
        assert_eq!(config.worker.batch_size, 10);
        assert!(config.database_url.is_none());
        assert!(config.downstream.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = config_from(&[
            ("HANDOFF_BIND_ADDR", "127.0.0.1:9000"),
            ("JWT_SECRET", "s3cret"),
            ("DOWNSTREAM_BASE_URL", "https://grants.example"),
            ("DOWNSTREAM_API_KEY", "key"),
            ("HANDOFF_DEFAULT_WAIT_MS", "500"),
            ("HANDOFF_MAX_RECEIVE_COUNT", "3"),
            ("HANDOFF_REQUEST_TTL_SECS", "60"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.jwt_secret, "s3cret");
        let downstream = config.downstream.unwrap();
        assert_eq!(downstream.base_url, "https://grants.example");
        assert_eq!(downstream.api_key.as_deref(), Some("key"));
        assert_eq!(config.ingest.default_wait, Duration::from_millis(500));
        assert_eq!(config.queue.max_receive_count, 3);
        assert_eq!(config.worker.max_receive_count, 3);
        assert_eq!(config.ttl.standard, Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        assert_eq!(
            config_from(&[("HANDOFF_MAX_WAIT_MS", "soon")]).unwrap_err(),
            ConfigError::Invalid {
                var: "HANDOFF_MAX_WAIT_MS",
                value: "soon".into()
            }
        );
        assert!(matches!(
            config_from(&[("HANDOFF_WORKER_BATCH_SIZE", "0")]),
            Err(ConfigError::Invalid { var: "HANDOFF_WORKER_BATCH_SIZE", .. })
        ));
    }

    #[test]
    fn max_wait_above_ceiling_is_rejected() {
        let huge = u64::MAX.to_string();
        assert!(matches!(
            config_from(&[("HANDOFF_MAX_WAIT_MS", huge.as_str())]),
            Err(ConfigError::Invalid { var: "HANDOFF_MAX_WAIT_MS", .. })
        ));

        let config = config_from(&[("HANDOFF_MAX_WAIT_MS", "900000")]).unwrap();
        assert_eq!(config.ingest.max_wait, MAX_WAIT_CEILING);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = config_from(&[
            ("JWT_SECRET", "hunter2"),
            ("DATABASE_URL", "postgres://user:pw@db/handoff"),
        ])
        .unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("pw@db"));
    }
}
