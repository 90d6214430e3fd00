//! Runtime configuration
//!
//! Loaded from TOML (every section and field optional), then overlaid from `LMS_*`
//! environment variables using `__` as the section separator (`LMS_STORE__URL`,
//! `LMS_LOG__LEVEL`, `LMS_FILTERS__BOOK__CAPACITY`). Every scalar field has a variable;
//! queue weights are set one queue at a time with `LMS_QUEUE__WEIGHTS__<QUEUE>`.
//! Durations are integer milliseconds.

use crate::cache::{EntityCacheOptions, Fallback, TtlPolicy};
use crate::error::ConfigError;
use crate::keys::KeyEncoder;
use crate::pipeline::{Retention, RetryBackoff, TaskDistributor, TaskOptions, WorkerPoolConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Serde adapter: `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

const ENV_PREFIX: &str = "LMS_";

/// Path of a TOML file to load before the environment overlay
pub const CONFIG_PATH_VAR: &str = "LMS_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub filters: FiltersConfig,
    pub fallback: FallbackConfig,
    pub analytics: AnalyticsConfig,
    pub queue: QueueConfig,
    pub background: BackgroundConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://host:port`; unset runs the in-memory store
    pub url: Option<String>,
    /// How often the in-memory store evicts expired keys
    #[serde(with = "duration_ms")]
    pub reaper_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            url: None,
            reaper_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_ms")]
    pub book_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub book_ttl_jitter: Duration,
    /// Lifetime of the per-ISBN copy count
    #[serde(with = "duration_ms")]
    pub copies_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub copies_ttl_jitter: Duration,
    #[serde(with = "duration_ms")]
    pub member_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub member_ttl_jitter: Duration,
    pub seed: Option<u64>,
}

const HOUR: Duration = Duration::from_secs(3600);

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            book_ttl: HOUR,
            book_ttl_jitter: HOUR,
            copies_ttl: 4 * HOUR,
            copies_ttl_jitter: 4 * HOUR,
            member_ttl: HOUR,
            member_ttl_jitter: HOUR,
            seed: None,
        }
    }
}

impl CacheConfig {
    pub fn book_options(&self, existence: Fallback) -> EntityCacheOptions {
        EntityCacheOptions {
            primary_ttl: TtlPolicy::new(self.book_ttl, self.book_ttl_jitter),
            secondary_ttl: TtlPolicy::new(self.copies_ttl, self.copies_ttl_jitter),
            existence_fallback: existence,
            seed: self.seed,
        }
    }

    pub fn member_options(&self, existence: Fallback) -> EntityCacheOptions {
        EntityCacheOptions {
            primary_ttl: TtlPolicy::new(self.member_ttl, self.member_ttl_jitter),
            // Members have no secondary record
            secondary_ttl: TtlPolicy::new(self.member_ttl, self.member_ttl_jitter),
            existence_fallback: existence,
            seed: self.seed.map(|s| s.wrapping_add(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub name: String,
    pub capacity: u64,
    pub error_rate: f64,
}

impl FilterConfig {
    fn named(name: &str) -> Self {
        FilterConfig {
            name: name.to_string(),
            capacity: 1_000_000,
            error_rate: 0.01,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig::named("filter")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    pub book: FilterConfig,
    pub member: FilterConfig,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        FiltersConfig {
            book: FilterConfig::named("books:isbn"),
            member: FilterConfig::named("members:email"),
        }
    }
}

/// What to answer when a check cannot reach the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Natural-key checks on create
    pub uniqueness: Fallback,
    /// Cached-entity existence checks
    pub existence: Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Scope of cache entry keys
    pub scope: String,
    /// Prefix of analytics bucket keys
    pub prefix: String,
    /// Buckets returned per entity in reports
    pub top_limit: usize,
    /// Delivery options of analytics tasks
    pub task: TaskOptions,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        AnalyticsConfig {
            scope: "INTERNAL".to_string(),
            prefix: "SET_INTERNAL_ANALYTICS".to_string(),
            top_limit: 10,
            task: TaskDistributor::default_analytics_options(),
        }
    }
}

impl AnalyticsConfig {
    pub fn key_encoder(&self) -> KeyEncoder {
        KeyEncoder::new(&self.scope, &self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name -> polling weight
    pub weights: BTreeMap<String, u32>,
    pub concurrency: usize,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub retry_base: Duration,
    #[serde(with = "duration_ms")]
    pub retry_max: Duration,
    /// How long completed tasks stay inspectable; zero drops them on completion
    #[serde(with = "duration_ms")]
    pub completed_retention: Duration,
    #[serde(with = "duration_ms")]
    pub failed_retention: Duration,
    pub max_failed: usize,
    pub seed: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        let backoff = RetryBackoff::default();
        let retention = Retention::default();
        QueueConfig {
            weights: pool.queues.into_iter().collect(),
            concurrency: pool.concurrency,
            poll_interval: pool.poll_interval,
            task_timeout: pool.task_timeout,
            retry_base: backoff.base,
            retry_max: backoff.max,
            completed_retention: retention.completed,
            failed_retention: retention.failed,
            max_failed: retention.max_failed,
            seed: None,
        }
    }
}

impl QueueConfig {
    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    /// Heaviest queue first
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let mut queues: Vec<(String, u32)> =
            self.weights.iter().map(|(q, w)| (q.clone(), *w)).collect();
        queues.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        WorkerPoolConfig {
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            task_timeout: self.task_timeout,
            queues,
            seed: self.seed,
        }
    }

    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff {
            base: self.retry_base,
            max: self.retry_max,
        }
    }

    pub fn retention(&self) -> Retention {
        Retention {
            completed: self.completed_retention,
            failed: self.failed_retention,
            max_failed: self.max_failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Detached cache writes allowed in flight before new ones are dropped
    pub max_in_flight: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        BackgroundConfig { max_in_flight: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_fallback(var: &str, value: &str) -> Result<Fallback, ConfigError> {
    match value.trim() {
        "assume-present" => Ok(Fallback::AssumePresent),
        "assume-absent" => Ok(Fallback::AssumeAbsent),
        _ => Err(ConfigError::Env {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Env {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

impl CatalogConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: CatalogConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// File named by `LMS_CONFIG` (or defaults), then the `LMS_*` overlay.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => CatalogConfig::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `LMS_<SECTION>__<FIELD>` variables. Unrecognized names are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in vars {
            let (name, value) = (name.as_ref(), value.as_ref());
            let Some(path) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let ms = |v: &str| parse_env::<u64>(name, v).map(Duration::from_millis);

            match path {
                "STORE__URL" => self.store.url = Some(value.to_string()).filter(|u| !u.is_empty()),
                "STORE__REAPER_INTERVAL" => self.store.reaper_interval = ms(value)?,
                "CACHE__BOOK_TTL" => self.cache.book_ttl = ms(value)?,
                "CACHE__BOOK_TTL_JITTER" => self.cache.book_ttl_jitter = ms(value)?,
                "CACHE__COPIES_TTL" => self.cache.copies_ttl = ms(value)?,
                "CACHE__COPIES_TTL_JITTER" => self.cache.copies_ttl_jitter = ms(value)?,
                "CACHE__MEMBER_TTL" => self.cache.member_ttl = ms(value)?,
                "CACHE__MEMBER_TTL_JITTER" => self.cache.member_ttl_jitter = ms(value)?,
                "CACHE__SEED" => self.cache.seed = Some(parse_env(name, value)?),
                "FILTERS__BOOK__NAME" => self.filters.book.name = value.to_string(),
                "FILTERS__BOOK__CAPACITY" => self.filters.book.capacity = parse_env(name, value)?,
                "FILTERS__BOOK__ERROR_RATE" => {
                    self.filters.book.error_rate = parse_env(name, value)?
                }
                "FILTERS__MEMBER__NAME" => self.filters.member.name = value.to_string(),
                "FILTERS__MEMBER__CAPACITY" => {
                    self.filters.member.capacity = parse_env(name, value)?
                }
                "FILTERS__MEMBER__ERROR_RATE" => {
                    self.filters.member.error_rate = parse_env(name, value)?
                }
                "FALLBACK__UNIQUENESS" => self.fallback.uniqueness = parse_fallback(name, value)?,
                "FALLBACK__EXISTENCE" => self.fallback.existence = parse_fallback(name, value)?,
                "ANALYTICS__SCOPE" => self.analytics.scope = value.to_string(),
                "ANALYTICS__PREFIX" => self.analytics.prefix = value.to_string(),
                "ANALYTICS__TOP_LIMIT" => self.analytics.top_limit = parse_env(name, value)?,
                "ANALYTICS__TASK__MAX_RETRY" => {
                    self.analytics.task.max_retry = parse_env(name, value)?
                }
                "ANALYTICS__TASK__DELAY" => self.analytics.task.delay = ms(value)?,
                "ANALYTICS__TASK__QUEUE" => self.analytics.task.queue = value.to_string(),
                "QUEUE__CONCURRENCY" => self.queue.concurrency = parse_env(name, value)?,
                "QUEUE__POLL_INTERVAL" => self.queue.poll_interval = ms(value)?,
                "QUEUE__TASK_TIMEOUT" => self.queue.task_timeout = ms(value)?,
                "QUEUE__RETRY_BASE" => self.queue.retry_base = ms(value)?,
                "QUEUE__RETRY_MAX" => self.queue.retry_max = ms(value)?,
                "QUEUE__COMPLETED_RETENTION" => self.queue.completed_retention = ms(value)?,
                "QUEUE__FAILED_RETENTION" => self.queue.failed_retention = ms(value)?,
                "QUEUE__MAX_FAILED" => self.queue.max_failed = parse_env(name, value)?,
                "QUEUE__SEED" => self.queue.seed = Some(parse_env(name, value)?),
                "BACKGROUND__MAX_IN_FLIGHT" => {
                    self.background.max_in_flight = parse_env(name, value)?
                }
                "LOG__LEVEL" => self.log.level = value.to_string(),
                "LOG__JSON" => self.log.json = parse_bool(name, value)?,
                _ => {
                    // LMS_QUEUE__WEIGHTS__<QUEUE>, queue names are lowercase
                    if let Some(queue) = path.strip_prefix("QUEUE__WEIGHTS__") {
                        let weight = parse_env(name, value)?;
                        self.queue.weights.insert(queue.to_ascii_lowercase(), weight);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for filter in [&self.filters.book, &self.filters.member] {
            if filter.name.is_empty() {
                return Err(ConfigError::Invalid("filter name must not be empty".into()));
            }
            if filter.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "filter '{}' capacity must be positive",
                    filter.name
                )));
            }
            if !(filter.error_rate > 0.0 && filter.error_rate < 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "filter '{}' error rate must be in (0, 1), got {}",
                    filter.name, filter.error_rate
                )));
            }
        }
        if self.filters.book.name == self.filters.member.name {
            return Err(ConfigError::Invalid(
                "book and member filters must have distinct names".into(),
            ));
        }

        for (what, ttl) in [
            ("cache.book_ttl", self.cache.book_ttl),
            ("cache.copies_ttl", self.cache.copies_ttl),
            ("cache.member_ttl", self.cache.member_ttl),
        ] {
            if ttl.is_zero() {
                return Err(ConfigError::Invalid(format!("{what} must be positive")));
            }
        }

        if self.queue.weights.is_empty() {
            return Err(ConfigError::Invalid("at least one queue is required".into()));
        }
        if let Some((queue, _)) = self.queue.weights.iter().find(|(_, w)| **w == 0) {
            return Err(ConfigError::Invalid(format!("queue '{queue}' weight must be positive")));
        }
        if !self.queue.weights.contains_key(&self.analytics.task.queue) {
            return Err(ConfigError::Invalid(format!(
                "analytics queue '{}' is not a configured queue",
                self.analytics.task.queue
            )));
        }
        if self.queue.concurrency == 0 {
            return Err(ConfigError::Invalid("queue.concurrency must be positive".into()));
        }
        if self.queue.retry_base > self.queue.retry_max {
            return Err(ConfigError::Invalid("queue.retry_base exceeds queue.retry_max".into()));
        }
        if self.queue.max_failed == 0 {
            return Err(ConfigError::Invalid("queue.max_failed must be positive".into()));
        }
        if self.background.max_in_flight == 0 {
            return Err(ConfigError::Invalid("background.max_in_flight must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CatalogConfig::from_toml_str("").unwrap();
        assert_eq!(config, CatalogConfig::default());
        assert_eq!(config.cache.copies_ttl, Duration::from_secs(4 * 3600));
        assert_eq!(config.filters.book.name, "books:isbn");
        assert_eq!(config.filters.member.capacity, 1_000_000);
        assert_eq!(config.analytics.prefix, "SET_INTERNAL_ANALYTICS");
        assert_eq!(config.analytics.task.queue, "critical");
        assert_eq!(config.queue.weights.get("critical"), Some(&10));
        assert!(config.fallback.uniqueness.assumes_present());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[store]
url = "redis://127.0.0.1:6379"

[cache]
book_ttl = 60000
book_ttl_jitter = 0
seed = 9

[fallback]
existence = "assume-absent"

[analytics.task]
max_retry = 3
delay = 500
queue = "low"

[queue.weights]
critical = 6
low = 1
"#
        )
        .unwrap();

        let config = CatalogConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.cache.book_ttl, Duration::from_secs(60));
        let book_options = config.cache.book_options(config.fallback.existence);
        assert_eq!(book_options.primary_ttl.max(), Duration::from_secs(60));
        assert_eq!(config.fallback.existence, Fallback::AssumeAbsent);
        assert_eq!(config.fallback.uniqueness, Fallback::AssumePresent);
        assert_eq!(config.analytics.task.delay, Duration::from_millis(500));

        let pool = config.queue.worker_pool_config();
        assert_eq!(pool.queues, vec![("critical".to_string(), 6), ("low".to_string(), 1)]);
    }

    #[test]
    fn test_env_overlay() {
        let mut config = CatalogConfig::default();
        config
            .apply_env([
                ("LMS_STORE__URL", "redis://cache:6379"),
                ("LMS_LOG__LEVEL", "debug"),
                ("LMS_LOG__JSON", "true"),
                ("LMS_FALLBACK__UNIQUENESS", "assume-absent"),
                ("LMS_CACHE__BOOK_TTL", "1000"),
                ("HOME", "/root"),
            ])
            .unwrap();
        assert_eq!(config.store.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.log, LogConfig { level: "debug".into(), json: true });
        assert_eq!(config.fallback.uniqueness, Fallback::AssumeAbsent);
        assert_eq!(config.cache.book_ttl, Duration::from_secs(1));

        let err = config.apply_env([("LMS_QUEUE__CONCURRENCY", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var, .. } if var == "LMS_QUEUE__CONCURRENCY"));
    }

    #[test]
    fn test_env_overlay_reaches_nested_fields() {
        let mut config = CatalogConfig::default();
        config
            .apply_env([
                ("LMS_CACHE__BOOK_TTL_JITTER", "0"),
                ("LMS_CACHE__MEMBER_TTL_JITTER", "250"),
                ("LMS_FILTERS__BOOK__CAPACITY", "5000"),
                ("LMS_FILTERS__MEMBER__ERROR_RATE", "0.001"),
                ("LMS_ANALYTICS__TASK__QUEUE", "low"),
                ("LMS_ANALYTICS__TASK__DELAY", "0"),
                ("LMS_QUEUE__POLL_INTERVAL", "20"),
                ("LMS_QUEUE__RETRY_BASE", "100"),
                ("LMS_QUEUE__RETRY_MAX", "1000"),
                ("LMS_QUEUE__COMPLETED_RETENTION", "60000"),
                ("LMS_QUEUE__MAX_FAILED", "50"),
                ("LMS_QUEUE__WEIGHTS__BULK", "2"),
                ("LMS_QUEUE__WEIGHTS__CRITICAL", "20"),
            ])
            .unwrap();

        assert_eq!(config.cache.book_ttl_jitter, Duration::ZERO);
        assert_eq!(config.cache.member_ttl_jitter, Duration::from_millis(250));
        assert_eq!(config.filters.book.capacity, 5000);
        assert_eq!(config.filters.member.error_rate, 0.001);
        assert_eq!(config.analytics.task.queue, "low");
        assert_eq!(config.queue.poll_interval, Duration::from_millis(20));
        assert_eq!(
            config.queue.backoff(),
            RetryBackoff {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
            }
        );
        assert_eq!(config.queue.retention().completed, Duration::from_secs(60));
        assert_eq!(config.queue.retention().max_failed, 50);
        assert_eq!(config.queue.weights.get("bulk"), Some(&2));
        assert_eq!(config.queue.weights.get("critical"), Some(&20));
        assert!(config.validate().is_ok());

        let err = config.apply_env([("LMS_QUEUE__WEIGHTS__LOW", "-1")]).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var, .. } if var == "LMS_QUEUE__WEIGHTS__LOW"));
    }

    #[test]
    fn test_validation() {
        let bad_rate = "[filters.book]\nname = \"b\"\ncapacity = 10\nerror_rate = 1.5\n";
        assert!(matches!(CatalogConfig::from_toml_str(bad_rate), Err(ConfigError::Invalid(_))));

        let mut config = CatalogConfig::default();
        config.analytics.task.queue = "missing".into();
        assert!(config.validate().is_err());

        let mut config = CatalogConfig::default();
        config.queue.weights.insert("idle".into(), 0);
        assert!(config.validate().is_err());

        let mut config = CatalogConfig::default();
        config.queue.max_failed = 0;
        assert!(config.validate().is_err());

        assert!(matches!(
            CatalogConfig::from_toml_str("[cache]\nbook_ttl = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
