use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_ENDPOINT: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_LIVENESS_TTL: Duration = Duration::from_millis(1000);
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(200);

/// Store backend, picked once when the bus is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Shared Redis (or Redis-compatible) server.
    #[default]
    Redis,
    /// In-process store. Only processes sharing the same `Store` value see
    /// each other's data.
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(Error::config(format!("unsupported backend {other:?}"))),
        }
    }
}

/// Settings shared by producers and consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Service id; also stamped as `producer` on emitted events.
    pub client_id: String,
    pub backend: Backend,
    pub endpoint: String,
    /// Partitions registered for this service when it consumes.
    pub partition_count: u32,
    pub heartbeat_interval: Duration,
    /// Must exceed `heartbeat_interval` so a single missed beat is tolerated.
    pub liveness_ttl: Duration,
    /// Pause between polls when no owned partition has work.
    pub idle_sleep: Duration,
}

impl BusConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            backend: Backend::default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            partition_count: 1,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_ttl: DEFAULT_LIVENESS_TTL,
            idle_sleep: DEFAULT_IDLE_SLEEP,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, ttl: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.liveness_ttl = ttl;
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    /// Build a config from `EVENTBUS_*` environment variables.
    ///
    /// `EVENTBUS_ENDPOINT` falls back to `REDIS_URL`. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a variable is missing or malformed.
    pub fn from_env() -> Result<Self> {
        let client_id = env::var("EVENTBUS_CLIENT_ID")
            .map_err(|_| Error::config("EVENTBUS_CLIENT_ID must be set"))?;
        let mut config = Self::new(client_id);

        if let Ok(backend) = env::var("EVENTBUS_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Ok(endpoint) = env::var("EVENTBUS_ENDPOINT").or_else(|_| env::var("REDIS_URL")) {
            config.endpoint = endpoint;
        }
        if let Some(count) = parse_env::<u32>("EVENTBUS_PARTITION_COUNT")? {
            config.partition_count = count;
        }
        if let Some(ms) = parse_env::<u64>("EVENTBUS_HEARTBEAT_MS")? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("EVENTBUS_LIVENESS_TTL_MS")? {
            config.liveness_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("EVENTBUS_IDLE_SLEEP_MS")? {
            config.idle_sleep = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.client_id.trim().is_empty() {
            errors.push("client_id must not be empty".to_string());
        }
        if self.backend == Backend::Redis && self.endpoint.trim().is_empty() {
            errors.push("endpoint is required for the redis backend".to_string());
        }
        if self.partition_count == 0 {
            errors.push("partition_count must be at least 1".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat interval must be positive".to_string());
        }
        if self.liveness_ttl <= self.heartbeat_interval {
            errors.push(format!(
                "liveness ttl ({:?}) must exceed the heartbeat interval ({:?})",
                self.liveness_ttl, self.heartbeat_interval
            ));
        }
        if self.idle_sleep.is_zero() {
            errors.push("idle sleep must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::config(errors.join("; ")))
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{name} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_backend_default() {
        assert_eq!(Backend::default(), Backend::Redis);
    }

    #[test]
    fn test_backend_parse_and_display() {
        assert_eq!("redis".parse::<Backend>().unwrap(), Backend::Redis);
        assert_eq!("Memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert_eq!(Backend::Memory.to_string(), "memory");
        assert!(matches!(
            "kafka".parse::<Backend>(),
            Err(Error::Config(msg)) if msg.contains("kafka")
        ));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::new("billing");
        assert_eq!(config.partition_count, 1);
        assert!(config.liveness_ttl > config.heartbeat_interval);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let err = BusConfig::new("billing")
            .with_partition_count(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("partition_count"));
    }

    #[test]
    fn test_missing_client_id_rejected() {
        assert!(BusConfig::new("  ").validate().is_err());
    }

    #[test]
    fn test_ttl_must_exceed_heartbeat() {
        let config = BusConfig::new("billing")
            .with_heartbeat(Duration::from_millis(500), Duration::from_millis(500));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_backend_needs_no_endpoint() {
        BusConfig::new("billing")
            .with_backend(Backend::Memory)
            .with_endpoint("")
            .validate()
            .unwrap();
    }

    const ENV_VARS: [&str; 8] = [
        "EVENTBUS_CLIENT_ID",
        "EVENTBUS_BACKEND",
        "EVENTBUS_ENDPOINT",
        "REDIS_URL",
        "EVENTBUS_PARTITION_COUNT",
        "EVENTBUS_HEARTBEAT_MS",
        "EVENTBUS_LIVENESS_TTL_MS",
        "EVENTBUS_IDLE_SLEEP_MS",
    ];

    /// Runs `f` with exactly `vars` set, restoring the previous environment.
    fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let saved: Vec<_> = ENV_VARS.iter().map(|name| (*name, env::var(name).ok())).collect();
        for name in ENV_VARS {
            env::remove_var(name);
        }
        for (name, value) in vars {
            env::set_var(name, value);
        }
        let result = f();
        for (name, value) in saved {
            match value {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
        }
        result
    }

    #[test]
    #[serial]
    fn test_from_env_reads_every_variable() {
        let config = with_env(
            &[
                ("EVENTBUS_CLIENT_ID", "billing"),
                ("EVENTBUS_BACKEND", "memory"),
                ("EVENTBUS_ENDPOINT", "redis://cache:6380"),
                ("EVENTBUS_PARTITION_COUNT", "8"),
                ("EVENTBUS_HEARTBEAT_MS", "100"),
                ("EVENTBUS_LIVENESS_TTL_MS", "400"),
                ("EVENTBUS_IDLE_SLEEP_MS", " 50 "),
            ],
            BusConfig::from_env,
        )
        .unwrap();

        assert_eq!(config.client_id, "billing");
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.endpoint, "redis://cache:6380");
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.liveness_ttl, Duration::from_millis(400));
        assert_eq!(config.idle_sleep, Duration::from_millis(50));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_and_redis_url_fallback() {
        let config = with_env(
            &[
                ("EVENTBUS_CLIENT_ID", "billing"),
                ("REDIS_URL", "redis://fallback:6379"),
            ],
            BusConfig::from_env,
        )
        .unwrap();

        assert_eq!(config.backend, Backend::Redis);
        assert_eq!(config.endpoint, "redis://fallback:6379");
        assert_eq!(config.partition_count, 1);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);

        let config = with_env(
            &[
                ("EVENTBUS_CLIENT_ID", "billing"),
                ("EVENTBUS_ENDPOINT", "redis://primary:6379"),
                ("REDIS_URL", "redis://fallback:6379"),
            ],
            BusConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.endpoint, "redis://primary:6379");
    }

    #[test]
    #[serial]
    fn test_from_env_requires_client_id() {
        let result = with_env(&[], BusConfig::from_env);
        assert!(matches!(
            result,
            Err(Error::Config(msg)) if msg.contains("EVENTBUS_CLIENT_ID")
        ));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_malformed_values() {
        let result = with_env(
            &[
                ("EVENTBUS_CLIENT_ID", "billing"),
                ("EVENTBUS_PARTITION_COUNT", "many"),
            ],
            BusConfig::from_env,
        );
        assert!(matches!(
            result,
            Err(Error::Config(msg)) if msg.contains("EVENTBUS_PARTITION_COUNT")
        ));

        let result = with_env(
            &[
                ("EVENTBUS_CLIENT_ID", "billing"),
                ("EVENTBUS_HEARTBEAT_MS", "500"),
                ("EVENTBUS_LIVENESS_TTL_MS", "100"),
            ],
            BusConfig::from_env,
        );
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("liveness ttl")));
    }
}
