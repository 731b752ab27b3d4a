use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::error::LoadError;
use crate::spec::{PixelFormat, Spec, Specs};

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
            prefix: "pixelpipe".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Retention of the disk cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Size budget in bytes. A scan over budget evicts down to 80% of it.
    pub max_size: u64,
    /// Files not read for this long are removed by the next scan.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Minimum time between two scans, unless the cache runs over budget.
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            ttl: Duration::from_secs(3600 * 24 * 7),
            scan_interval: Duration::from_secs(3600 * 24),
        }
    }
}

/// Network lanes and timeouts of the downloader.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Concurrent downloads for loads with a waiting target.
    pub foreground_threads: usize,
    /// Concurrent prefetch downloads.
    pub prefetch_threads: usize,
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// The timeout for receiving the response head.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
    /// The upper bound for a whole transfer.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,
    /// Size of the buffers the body is copied through.
    pub chunk_size: usize,
    /// Number of copy buffers kept around for reuse.
    pub scratch_buffers: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            foreground_threads: 2,
            prefetch_threads: 1,
            connect_timeout: Duration::from_secs(5),
            head_timeout: Duration::from_secs(15),
            max_download_timeout: Duration::from_secs(300),
            chunk_size: 16 * 1024,
            scratch_buffers: 4,
        }
    }
}

/// Buffer pool tuning.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle buffers of an unbounded spec that survive opportunistic reclaiming.
    pub unbounded_grace: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { unbounded_grace: 2 }
    }
}

/// A spec as written in the config file.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpecConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Decodes images at their own size, `width` and `height` are ignored.
    pub unbounded: bool,
    pub format: PixelFormat,
    pub max_density: f32,
}

impl Default for SpecConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            unbounded: false,
            format: PixelFormat::Argb8888,
            max_density: 1.0,
        }
    }
}

impl SpecConfig {
    pub fn build(&self, key: &str) -> Result<Spec, LoadError> {
        let mut builder = Spec::builder(key)
            .pixel_format(self.format)
            .max_density(self.max_density);
        if self.unbounded {
            builder = builder.unbounded();
        } else if let (Some(width), Some(height)) = (self.width, self.height) {
            builder = builder.size(width, height);
        }
        builder.build()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching.
    ///
    /// Defaults to a temporary directory that lives as long as the loader.
    pub cache_dir: Option<PathBuf>,

    /// Configure logging
    pub logging: Logging,

    /// Configure metrics
    pub metrics: Metrics,

    /// Retention of the disk cache.
    pub disk_cache: DiskCacheConfig,

    /// Network lanes and timeouts.
    pub downloads: DownloadConfig,

    /// Buffer pool tuning.
    pub pool: PoolConfig,

    /// Specs registered when the loader is built, by key.
    pub specs: BTreeMap<String, SpecConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            disk_cache: DiskCacheConfig::default(),
            downloads: DownloadConfig::default(),
            pool: PoolConfig::default(),
            specs: BTreeMap::new(),
        }
    }
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
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Builds the spec table of the `specs` section.
    pub fn build_specs(&self) -> Result<Specs, LoadError> {
        let mut specs = Specs::default();
        for (key, spec) in &self.specs {
            specs.register(spec.build(key)?)?;
        }
        Ok(specs)
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
