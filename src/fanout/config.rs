//! Configuration for the fan-out engine
//!
//! Loaded from defaults, a TOML document, or environment variables:
//!
//! - `FANOUT_SPLIT_THRESHOLD`: maximum items per leaf chunk (default: 100)
//! - `FANOUT_SPLIT_WORKERS`: concurrent split task consumers (default: 2)
//! - `FANOUT_ITEM_WORKERS`: concurrent item task consumers (default: 8)
//! - `FANOUT_MAX_DELIVERIES`: deliveries before a message is dead-lettered (default: 5)
//! - `FANOUT_STORE_TYPE`: `memory`, `localfs` or `s3` (default: `memory`)
//! - `FANOUT_DATA_PATH`: root directory for the `localfs` store

use super::error::FanoutError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on either worker count
pub const WORKERS_MAX: usize = 1024;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Chunks larger than this are split in half (T, must be >= 1)
    pub split_threshold: usize,
    pub workers: WorkerConfig,
    pub queue: QueueConfig,
    pub tracker: TrackerConfig,
    pub store: StoreConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        FanoutConfig {
            split_threshold: 100,
            workers: WorkerConfig::default(),
            queue: QueueConfig::default(),
            tracker: TrackerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl FanoutConfig {
    /// Configuration for tests (small threshold, fast retries)
    pub fn test() -> Self {
        FanoutConfig {
            split_threshold: 10,
            workers: WorkerConfig::test(),
            queue: QueueConfig::test(),
            tracker: TrackerConfig::test(),
            store: StoreConfig::default(),
        }
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self, FanoutError> {
        let mut config = FanoutConfig::default();

        if let Some(t) = env_parse("FANOUT_SPLIT_THRESHOLD")? {
            config.split_threshold = t;
        }
        if let Some(n) = env_parse("FANOUT_SPLIT_WORKERS")? {
            config.workers.split_workers = n;
        }
        if let Some(n) = env_parse("FANOUT_ITEM_WORKERS")? {
            config.workers.item_workers = n;
        }
        if let Some(n) = env_parse("FANOUT_MAX_DELIVERIES")? {
            config.queue.max_deliveries = n;
        }
        if let Ok(store_type) = std::env::var("FANOUT_STORE_TYPE") {
            config.store.store_type = StoreType::parse(&store_type)?;
        }
        if let Ok(path) = std::env::var("FANOUT_DATA_PATH") {
            config.store.local_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, FanoutError> {
        let config: FanoutConfig =
            toml::from_str(s).map_err(|e| FanoutError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FanoutError> {
        if self.split_threshold == 0 {
            return Err(FanoutError::Config(
                "split_threshold must be at least 1".to_string(),
            ));
        }
        self.workers.validate()?;
        if self.queue.max_deliveries == 0 {
            return Err(FanoutError::Config(
                "queue.max_deliveries must be at least 1".to_string(),
            ));
        }
        if self.tracker.persist_retry_initial > self.tracker.persist_retry_max {
            return Err(FanoutError::Config(
                "tracker.persist_retry_initial exceeds persist_retry_max".to_string(),
            ));
        }
        if self.tracker.idle_timeout.is_zero() {
            return Err(FanoutError::Config(
                "tracker.idle_timeout must be positive".to_string(),
            ));
        }
        if self.store.store_type == StoreType::LocalFs && self.store.local_path.is_none() {
            return Err(FanoutError::Config(
                "store.local_path is required for the localfs store".to_string(),
            ));
        }
        if self.store.store_type == StoreType::S3 && self.store.s3.is_none() {
            return Err(FanoutError::Config(
                "store.s3 is required for the s3 store".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, FanoutError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FanoutError::Config(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub split_workers: usize,
    pub item_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            split_workers: 2,
            item_workers: 8,
        }
    }
}

impl WorkerConfig {
    pub fn test() -> Self {
        WorkerConfig {
            split_workers: 2,
            item_workers: 4,
        }
    }

    fn validate(&self) -> Result<(), FanoutError> {
        for (name, n) in [
            ("split_workers", self.split_workers),
            ("item_workers", self.item_workers),
        ] {
            if n == 0 || n > WORKERS_MAX {
                return Err(FanoutError::Config(format!(
                    "workers.{} must be in 1..={}, got {}",
                    name, WORKERS_MAX, n
                )));
            }
        }
        Ok(())
    }
}

/// Work queue delivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries before a failing message is dead-lettered
    pub max_deliveries: u32,
    /// Delay before an abandoned message becomes visible again
    #[serde(with = "duration_millis")]
    pub redelivery_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_deliveries: 5,
            redelivery_delay: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    pub fn test() -> Self {
        QueueConfig {
            max_deliveries: 5,
            redelivery_delay: Duration::from_millis(1),
        }
    }
}

/// Completion tracker persistence retry policy and actor lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    #[serde(with = "duration_millis")]
    pub persist_retry_initial: Duration,
    /// Backoff cap; retries continue indefinitely at this interval
    #[serde(with = "duration_millis")]
    pub persist_retry_max: Duration,
    /// An actor with an empty mailbox for this long exits; the next message
    /// for its batch respawns it from committed state
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            persist_retry_initial: Duration::from_millis(10),
            persist_retry_max: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl TrackerConfig {
    pub fn test() -> Self {
        TrackerConfig {
            persist_retry_initial: Duration::from_millis(1),
            persist_retry_max: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(100),
        }
    }

    /// Delay before persist attempt `attempt` (0-based) is retried
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.persist_retry_initial
            .saturating_mul(factor)
            .min(self.persist_retry_max)
    }
}

/// Type of chunk store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// In-memory store (for tests)
    Memory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible (requires the `s3` feature)
    S3,
}

impl StoreType {
    pub fn parse(s: &str) -> Result<Self, FanoutError> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "inmemory" => Ok(StoreType::Memory),
            "localfs" | "local" => Ok(StoreType::LocalFs),
            "s3" => Ok(StoreType::S3),
            other => Err(FanoutError::Config(format!("unknown store type {:?}", other))),
        }
    }
}

/// Chunk / tracker state storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_type: StoreType,
    /// Local filesystem path (for LocalFs store)
    pub local_path: Option<PathBuf>,
    /// S3 configuration (for S3 store)
    pub s3: Option<S3Config>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            store_type: StoreType::Memory,
            local_path: None,
            s3: None,
        }
    }
}

/// S3 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Key prefix within bucket
    #[serde(default)]
    pub prefix: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
