use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "thumbnails".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Tuning of the demand scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long registry mutations are collected before a flush cycle runs.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// The maximum number of demands sent to the backend in one flush cycle.
    ///
    /// Anything beyond this stays queued and is picked up by an automatically scheduled
    /// follow-up flush.
    pub max_batch_size: usize,

    /// The period of the liveness sweep over visible demands.
    #[serde(with = "humantime_serde")]
    pub watchdog_interval: Duration,

    /// How long a visible demand may stay in flight before it is assumed lost and retried.
    #[serde(with = "humantime_serde")]
    pub liveness_timeout: Duration,

    /// Priority that demands are raised to when they become visible.
    pub visible_priority_floor: i32,

    /// Priority that visible demands are raised to when they have waited past the liveness
    /// timeout without being submitted.
    pub stale_priority_floor: i32,

    /// The maximum number of resolved thumbnails kept in memory.
    pub l1_capacity: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            debounce: Duration::from_millis(50),
            max_batch_size: 100,
            watchdog_interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(3),
            visible_priority_floor: 50,
            stale_priority_floor: 80,
            l1_capacity: 2_000,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            anyhow::bail!("scheduler.max_batch_size must be at least 1");
        }
        if self.watchdog_interval.is_zero() {
            anyhow::bail!("scheduler.watchdog_interval must not be zero");
        }
        if self.liveness_timeout.is_zero() {
            anyhow::bail!("scheduler.liveness_timeout must not be zero");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Tuning of the demand scheduler.
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Config =
            serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config
            .scheduler
            .validate()
            .context("invalid scheduler configuration")?;
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
