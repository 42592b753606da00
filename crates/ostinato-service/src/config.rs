use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
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
    /// The log level for the sync daemon.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "ostinato".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Connection settings for the music service Web API.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL all request paths are joined onto.
    pub base_url: String,

    /// OAuth bearer token used for every request.
    ///
    /// Defaults to the `OSTINATO_TOKEN` environment variable.
    pub token: Option<String>,

    /// Timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for a whole request/response cycle.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "https://api.spotify.com/v1".into(),
            token: env::var("OSTINATO_TOKEN").ok(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// How long each resource cache considers its value current, plus the
/// windows governing patches and the polling tick.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SyncIntervals {
    /// Playback state, only refreshed this often while somebody observes it.
    #[serde(with = "humantime_serde")]
    pub playback: Duration,

    /// Available playback devices.
    #[serde(with = "humantime_serde")]
    pub devices: Duration,

    /// The followed-artists library.
    #[serde(with = "humantime_serde")]
    pub followed_artists: Duration,

    /// The user's playlists.
    #[serde(with = "humantime_serde")]
    pub playlists: Duration,

    /// Recent releases. A full scan is expensive, so this is long.
    #[serde(with = "humantime_serde")]
    pub releases: Duration,

    /// How long an optimistic patch stays applicable while waiting for the
    /// next authoritative resync.
    #[serde(with = "humantime_serde")]
    pub patch_expiry: Duration,

    /// Cadence of the poller task driving unforced resyncs.
    #[serde(with = "humantime_serde")]
    pub poll: Duration,
}

impl Default for SyncIntervals {
    fn default() -> Self {
        SyncIntervals {
            playback: Duration::from_secs(2),
            devices: Duration::from_secs(30),
            followed_artists: Duration::from_secs(10 * 60),
            playlists: Duration::from_secs(10 * 60),
            releases: Duration::from_secs(24 * 60 * 60),
            patch_expiry: Duration::from_millis(1500),
            poll: Duration::from_secs(1),
        }
    }
}

/// Fine-tuning collection fetches and the retry policy.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Fetching {
    /// Items requested per collection page. The service caps this at 50.
    pub page_size: u64,

    /// Ids put into a single batched lookup. The album endpoint caps this at 20.
    pub chunk_size: usize,

    /// Upper bound on pages fetched per collection, a runaway `next` chain
    /// stops here.
    pub max_pages: u64,

    /// The number of concurrent page fetches across all collections.
    pub max_concurrent_fetches: usize,

    /// Total attempts for a rate-limited request, including the first one.
    pub max_retries: usize,

    /// Backoff before the first rate-limit retry, doubling per attempt.
    /// A larger server-provided `Retry-After` takes precedence.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for Fetching {
    fn default() -> Self {
        Fetching {
            page_size: 50,
            chunk_size: 20,
            max_pages: 40,
            max_concurrent_fetches: 12,
            max_retries: 3,
            retry_backoff: Duration::from_millis(1500),
        }
    }
}

/// Controls the background release scanner.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Scanner {
    /// Artists scanned in parallel. Deliberately small, the scan is a
    /// background sweep and must not crowd out interactive fetches.
    pub concurrency: usize,

    /// Albums released within this window count as recent.
    #[serde(with = "humantime_serde")]
    pub age_window: Duration,

    /// Pause after a scan step that got fresh data while playback is being
    /// observed.
    #[serde(with = "humantime_serde")]
    pub delay_observed_modified: Duration,

    /// Pause after a scan step that got a not-modified answer while playback
    /// is being observed.
    #[serde(with = "humantime_serde")]
    pub delay_observed_revalidated: Duration,

    /// Same as above, for an idle session.
    #[serde(with = "humantime_serde")]
    pub delay_idle_modified: Duration,

    /// Same as above, for an idle session.
    #[serde(with = "humantime_serde")]
    pub delay_idle_revalidated: Duration,
}

impl Default for Scanner {
    fn default() -> Self {
        Scanner {
            concurrency: 2,
            age_window: Duration::from_secs(14 * 24 * 60 * 60),
            delay_observed_modified: Duration::from_secs(30),
            delay_observed_revalidated: Duration::from_secs(10),
            delay_idle_modified: Duration::from_secs(5),
            delay_idle_revalidated: Duration::from_secs(2),
        }
    }
}

/// The daemon configuration, read from an optional YAML file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to persist caches and settings in. Default is not to
    /// persist anything across runs.
    pub data_dir: Option<PathBuf>,

    /// Connection settings for the remote service.
    pub api: ApiConfig,

    pub logging: Logging,

    pub metrics: Metrics,

    pub sync: SyncIntervals,

    pub fetching: Fetching,

    pub scanner: Scanner,
}

impl Config {
    /// Return the path of a data file, joined onto the configured data
    /// directory.
    ///
    /// If there is no data directory configured this means no persistence
    /// should happen and this returns None.
    pub fn data_file<P>(&self, file: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.data_dir.as_ref().map(|base| base.join(file))
    }

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
