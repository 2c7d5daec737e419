//! Application configuration management.
//!
//! Settings are layered with `figment`, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. A TOML file (`--config`, or `tunecache/config.toml` in the platform
//!    config directory)
//! 3. `TUNECACHE_*` environment variables, with `__` separating nested
//!    keys (e.g. `TUNECACHE_TOOLS__FFMPEG`)
//! 4. Command-line flags, applied by the caller afterwards

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mode::Mode;
use crate::tool::WatchdogConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TUNECACHE_";

/// Invalid or unreadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The layered sources could not be merged or extracted
    #[error("invalid configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// A value is out of range
    #[error("invalid configuration: {key} {reason}")]
    Invalid {
        /// Offending key
        key: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Mood analyzer
    pub analyzer: PathBuf,
    /// Chromaprint's `fpcalc`
    pub fpcalc: PathBuf,
    /// `ffprobe`
    pub ffprobe: PathBuf,
    /// `ffmpeg`, used for downmixing
    pub ffmpeg: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            analyzer: PathBuf::from("streaming_extractor_music"),
            fpcalc: PathBuf::from("fpcalc"),
            ffprobe: PathBuf::from("ffprobe"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker threads; 0 means available parallelism
    pub threads: usize,
    /// Successful computations between periodic flushes
    pub flush_every: usize,
    /// CPU watchdog poll interval
    pub poll_interval_ms: u64,
    /// Consecutive idle polls before a tool is declared stalled
    pub idle_polls: u32,
    /// Time to wait for pipe readers after a tool exits
    pub drain_timeout_ms: u64,
    /// Wall-clock limit of one downmix
    pub downmix_timeout_secs: u64,
    /// Channel count produced by the downmix
    pub downmix_channels: u32,
    /// Longest track to attempt; unset uses the mode's default
    pub max_duration_secs: Option<u64>,
    /// Hash file contents for cross-machine matching
    pub content_hash: bool,
    /// Where cache and error files live; unset uses the platform data dir
    pub cache_dir: Option<PathBuf>,
    /// Extra directory for sanitizer links
    pub link_dir: Option<PathBuf>,
    /// Override the mode's corrupt-cache policy
    pub abort_on_corrupt_cache: Option<bool>,
    /// Tool locations
    pub tools: ToolPaths,
}

impl Default for Config {
    fn default() -> Self {
        let watchdog = WatchdogConfig::default();
        Self {
            threads: 0,
            flush_every: crate::dispatcher::DEFAULT_FLUSH_EVERY,
            poll_interval_ms: duration_ms(watchdog.poll_interval),
            idle_polls: watchdog.idle_polls,
            drain_timeout_ms: duration_ms(watchdog.drain_timeout),
            downmix_timeout_secs: crate::tool::downmix::DEFAULT_DOWNMIX_TIMEOUT.as_secs(),
            downmix_channels: 2,
            max_duration_secs: None,
            content_hash: true,
            cache_dir: None,
            link_dir: None,
            abort_on_corrupt_cache: None,
            tools: ToolPaths::default(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// The figment for an explicit file, or the default file location.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => log::debug!("No config directory on this platform"),
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the layered configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or a value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Config = Self::figment(path).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// `tunecache/config.toml` in the platform config directory.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values that would make the run meaningless.
    ///
    /// # Errors
    ///
    /// Returns the first invalid key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.flush_every == 0, "flush_every"),
            (self.poll_interval_ms == 0, "poll_interval_ms"),
            (self.idle_polls == 0, "idle_polls"),
            (self.downmix_channels == 0, "downmix_channels"),
        ];
        if let Some((_, key)) = checks.into_iter().find(|(bad, _)| *bad) {
            return Err(ConfigError::Invalid {
                key,
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the available parallelism.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        match self.threads {
            0 => std::thread::available_parallelism().map_or(4, |n| n.get()),
            n => n,
        }
    }

    /// Watchdog settings for analysis tools.
    #[must_use]
    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            idle_polls: self.idle_polls,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            ..WatchdogConfig::default()
        }
    }

    /// Duration limit for `mode`.
    #[must_use]
    pub fn max_duration(&self, mode: Mode) -> Option<Duration> {
        self.max_duration_secs
            .map(Duration::from_secs)
            .or_else(|| mode.default_max_duration())
    }

    /// Directory for cache and ledger files.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Default cache file for `mode`.
    #[must_use]
    pub fn cache_path(&self, mode: Mode) -> PathBuf {
        self.data_dir().join(format!("{}.json", mode.file_stem()))
    }

    /// Default error ledger for `mode`.
    #[must_use]
    pub fn errors_path(&self, mode: Mode) -> PathBuf {
        self.data_dir().join(format!("{}-errors.csv", mode.file_stem()))
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "tunecache", "tunecache")
}
