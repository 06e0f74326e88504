//! Worker configuration with serde serialization/deserialization
//!
//! All options are environment-driven (`PAGEWATCH_*`) with hardcoded
//! defaults matching the scheduler and capture contracts; the CLI can
//! override a handful of them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::WorkerError;

/// Viewport width bounds accepted anywhere a width list is configured.
pub const MIN_VIEWPORT_WIDTH: u32 = 320;
pub const MAX_VIEWPORT_WIDTH: u32 = 3840;

/// Minimum capture interval a settings row may carry.
pub const MIN_INTERVAL_MINUTES: i64 = 5;

/// Main configuration structure for the capture worker
///
/// # Examples
///
/// ```rust
/// use pagewatch::Config;
///
/// let config = Config {
///     pool_size: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Number of headless browser instances in the pool (default: 4)
    pub pool_size: usize,

    /// Root directory for screenshot PNGs and thumbnails
    pub screenshots_root: PathBuf,

    /// Database connection string (SQLite)
    pub database_url: String,

    /// Listen address for the worker HTTP surface
    pub listen_addr: String,

    /// Capture poll cadence (default: 10 s)
    pub poll_interval: Duration,

    /// Retention sweep cadence (default: 6 h)
    pub cleanup_interval: Duration,

    /// Base of the exponential retry backoff, in minutes (default: 5)
    pub base_retry_delay_minutes: i64,

    /// Consecutive failures after which a page is no longer auto-retried
    /// (default: 5)
    pub max_consecutive_failures: i64,

    /// Age at which a `capturing` job is considered abandoned (default: 10 min)
    pub stale_job_timeout_minutes: i64,

    /// Hardcoded default capture interval when no page/site/user override
    /// resolves (default: 1440 min)
    pub default_interval_minutes: i64,

    /// Hardcoded default viewport widths (default: [1920, 768, 375])
    pub default_viewports: Vec<u32>,

    /// Navigation and per-operation timeout during captures (default: 60 s)
    pub capture_timeout: Duration,

    /// Per-operation timeout during ad-hoc generation/validation (default: 30 s)
    pub generation_timeout: Duration,

    /// How long an `acquire()` caller waits for a browser (default: 300 s)
    pub acquire_timeout: Duration,

    /// Named viewport-tag dimensions, overridable per deployment
    pub tag_dimensions: TagDimensions,

    /// Path to a Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Base URL of the LLM script-generation collaborator
    pub generator_url: Option<String>,

    /// Base URL of the page-discovery collaborator
    pub discovery_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 4,
            screenshots_root: PathBuf::from("screenshots"),
            database_url: "sqlite://pagewatch.db?mode=rwc".to_string(),
            listen_addr: "0.0.0.0:8090".to_string(),
            poll_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(6 * 60 * 60),
            base_retry_delay_minutes: 5,
            max_consecutive_failures: 5,
            stale_job_timeout_minutes: 10,
            default_interval_minutes: 1440,
            default_viewports: vec![1920, 768, 375],
            capture_timeout: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(300),
            tag_dimensions: TagDimensions::default(),
            chrome_path: None,
            generator_url: None,
            discovery_url: None,
        }
    }
}

/// Pixel dimensions used when a viewport is requested by named tag
/// rather than explicit width.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TagDimensions {
    pub mobile: (u32, u32),
    pub tablet: (u32, u32),
    pub desktop: (u32, u32),
}

impl Default for TagDimensions {
    fn default() -> Self {
        Self {
            mobile: (375, 812),
            tablet: (768, 1024),
            desktop: (1920, 1080),
        }
    }
}

impl Config {
    /// Build a configuration from `PAGEWATCH_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(v) = env_parse::<usize>("PAGEWATCH_POOL_SIZE") {
            config.pool_size = v;
        }
        if let Ok(v) = std::env::var("PAGEWATCH_SCREENSHOTS_ROOT") {
            config.screenshots_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PAGEWATCH_DATABASE_URL") {
            config.database_url = v;
        }
        if let Ok(v) = std::env::var("PAGEWATCH_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Some(v) = env_parse::<u64>("PAGEWATCH_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("PAGEWATCH_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<i64>("PAGEWATCH_BASE_RETRY_DELAY_MINS") {
            config.base_retry_delay_minutes = v;
        }
        if let Some(v) = env_parse::<i64>("PAGEWATCH_MAX_CONSECUTIVE_FAILURES") {
            config.max_consecutive_failures = v;
        }
        if let Some(v) = env_parse::<i64>("PAGEWATCH_STALE_JOB_TIMEOUT_MINS") {
            config.stale_job_timeout_minutes = v;
        }
        if let Some(v) = env_parse::<i64>("PAGEWATCH_DEFAULT_INTERVAL_MINS") {
            config.default_interval_minutes = v;
        }
        if let Ok(v) = std::env::var("PAGEWATCH_DEFAULT_VIEWPORTS") {
            let widths: Vec<u32> = v
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if !widths.is_empty() {
                config.default_viewports = widths;
            }
        }
        if let Some(v) = env_parse::<u64>("PAGEWATCH_CAPTURE_TIMEOUT_SECS") {
            config.capture_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("PAGEWATCH_GENERATION_TIMEOUT_SECS") {
            config.generation_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("PAGEWATCH_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("PAGEWATCH_CHROME_PATH") {
            config.chrome_path = Some(v);
        }
        if let Ok(v) = std::env::var("PAGEWATCH_GENERATOR_URL") {
            config.generator_url = Some(v);
        }
        if let Ok(v) = std::env::var("PAGEWATCH_DISCOVERY_URL") {
            config.discovery_url = Some(v);
        }
        if let Some(dims) = env_dimensions("PAGEWATCH_MOBILE_VIEWPORT") {
            config.tag_dimensions.mobile = dims;
        }
        if let Some(dims) = env_dimensions("PAGEWATCH_TABLET_VIEWPORT") {
            config.tag_dimensions.tablet = dims;
        }
        if let Some(dims) = env_dimensions("PAGEWATCH_DESKTOP_VIEWPORT") {
            config.tag_dimensions.desktop = dims;
        }

        config
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.pool_size == 0 {
            return Err(WorkerError::Configuration(
                "pool size must be greater than 0".to_string(),
            ));
        }
        if self.default_viewports.is_empty() {
            return Err(WorkerError::Configuration(
                "default viewport list must not be empty".to_string(),
            ));
        }
        for &width in &self.default_viewports {
            if !valid_viewport_width(width) {
                return Err(WorkerError::Configuration(format!(
                    "viewport width {width} outside {MIN_VIEWPORT_WIDTH}-{MAX_VIEWPORT_WIDTH}"
                )));
            }
        }
        if !valid_interval_minutes(self.default_interval_minutes) {
            return Err(WorkerError::Configuration(format!(
                "default interval {} below minimum of {} minutes",
                self.default_interval_minutes, MIN_INTERVAL_MINUTES
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(WorkerError::Configuration(
                "poll interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Parse "WIDTHxHEIGHT" (e.g. "390x844").
fn env_dimensions(key: &str) -> Option<(u32, u32)> {
    let raw = std::env::var(key).ok()?;
    let (w, h) = raw.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

pub fn valid_viewport_width(width: u32) -> bool {
    (MIN_VIEWPORT_WIDTH..=MAX_VIEWPORT_WIDTH).contains(&width)
}

pub fn valid_interval_minutes(minutes: i64) -> bool {
    minutes >= MIN_INTERVAL_MINUTES
}

/// Generate Chrome command-line arguments for one pool instance
///
/// Each instance gets unique user-data and temp directories so concurrent
/// launches never trip over Chrome's profile singleton.
pub fn chrome_args(config: &Config, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);
    let (width, height) = config.tag_dimensions.desktop;

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--mute-audio".to_string(),
        "--hide-scrollbars".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!("--window-size={width},{height}"),
        format!("--user-data-dir=/tmp/pagewatch-profile-{unique_id}"),
    ]
}

pub fn browser_config(
    config: &Config,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, WorkerError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder().args(chrome_args(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(WorkerError::BrowserLaunchFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.cleanup_interval, Duration::from_secs(21600));
        assert_eq!(config.base_retry_delay_minutes, 5);
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.stale_job_timeout_minutes, 10);
        assert_eq!(config.default_interval_minutes, 1440);
        assert_eq!(config.default_viewports, vec![1920, 768, 375]);
        assert_eq!(config.acquire_timeout, Duration::from_secs(300));
        config.validate().unwrap();
    }

    #[test]
    fn viewport_width_bounds() {
        assert!(valid_viewport_width(320));
        assert!(valid_viewport_width(3840));
        assert!(!valid_viewport_width(319));
        assert!(!valid_viewport_width(3841));
    }

    #[test]
    fn interval_minimum() {
        assert!(valid_interval_minutes(5));
        assert!(!valid_interval_minutes(4));
    }

    #[test]
    fn out_of_band_viewport_rejected() {
        let config = Config {
            default_viewports: vec![1920, 100],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn chrome_args_unique_per_instance() {
        let config = Config::default();
        let a = chrome_args(&config, 0);
        let b = chrome_args(&config, 1);
        assert!(a.contains(&"--headless".to_string()));
        assert_ne!(
            a.last().unwrap(),
            b.last().unwrap(),
            "profile dirs must differ per instance"
        );
    }
}
