//! Layered run settings.
//!
//! Precedence, lowest to highest:
//!
//! 1. built-in defaults
//! 2. YAML file: `--config`, else `./config/default.yaml`, else
//!    `<config_dir>/scrapedu/config.yaml`
//! 3. environment (`SCRAPEDU_OUTPUT_DIR`, `SCRAPEDU_SEED_FILE`,
//!    `SCRAPEDU_WORKERS`)
//! 4. command-line overrides ([`SettingsOverrides`])
//!
//! Loading `.env` into the process environment is the binary's job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

pub const ENV_OUTPUT_DIR: &str = "SCRAPEDU_OUTPUT_DIR";
pub const ENV_SEED_FILE: &str = "SCRAPEDU_SEED_FILE";
pub const ENV_WORKERS: &str = "SCRAPEDU_WORKERS";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_seed_file")]
    pub seed_file: PathBuf,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Retries allowed per phase; budget `n` means up to `n + 1` attempts.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            seed_file: default_seed_file(),
            workers: default_workers(),
            user_agent: default_user_agent(),
            retry_budget: default_retry_budget(),
            progress_interval_secs: default_progress_interval_secs(),
            rate_limit: RateLimitSettings::default(),
            timeouts: TimeoutSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Upper bound of the uniform random delay added to each interval.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Per-host interval overrides in milliseconds.
    #[serde(default)]
    pub hosts: BTreeMap<String, u64>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            jitter_ms: default_jitter_ms(),
            hosts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            read_secs: default_read_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_seed_file() -> PathBuf {
    PathBuf::from("./data/seed.csv")
}

fn default_workers() -> usize {
    5
}

fn default_user_agent() -> String {
    format!("scrapedu/{}", env!("CARGO_PKG_VERSION"))
}

fn default_retry_budget() -> u32 {
    3
}

fn default_progress_interval_secs() -> u64 {
    30
}

fn default_min_interval_ms() -> u64 {
    1_000
}

fn default_jitter_ms() -> u64 {
    2_000
}

fn default_connect_secs() -> u64 {
    10
}

fn default_read_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    String::from("info")
}

/// Values supplied on the command line. `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub output_dir: Option<PathBuf>,
    pub seed_file: Option<PathBuf>,
    pub workers: Option<usize>,
    pub log_level: Option<String>,
}

impl Settings {
    /// Resolve the config file relative to the current directory, apply the
    /// process environment, and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        let cwd = std::env::current_dir().map_err(|source| SettingsError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        Self::load_at(&cwd, explicit, dirs::config_dir().as_deref(), |key| {
            std::env::var(key).ok()
        })
    }

    /// Testable form of [`load`](Self::load): explicit working directory,
    /// user config directory, and environment lookup.
    pub fn load_at<F>(
        cwd: &Path,
        explicit: Option<&Path>,
        config_dir: Option<&Path>,
        env: F,
    ) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match resolve_config_path(cwd, explicit, config_dir)? {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading settings");
                Self::from_yaml_file(&path)?
            }
            None => Self::default(),
        };
        settings.apply_env(env)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // An empty file deserializes as unit, not as an empty mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, env: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = non_empty(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(seed) = non_empty(ENV_SEED_FILE) {
            self.seed_file = PathBuf::from(seed);
        }
        if let Some(workers) = non_empty(ENV_WORKERS) {
            self.workers = workers.trim().parse().map_err(|_| SettingsError::Invalid {
                key: ENV_WORKERS,
                reason: format!("'{workers}' is not a positive integer"),
            })?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &SettingsOverrides) -> Result<(), SettingsError> {
        if let Some(dir) = &overrides.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(seed) = &overrides.seed_file {
            self.seed_file = seed.clone();
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.workers == 0 {
            return Err(SettingsError::Invalid {
                key: "workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.progress_interval_secs == 0 {
            return Err(SettingsError::Invalid {
                key: "progress_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit.min_interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.rate_limit.jitter_ms)
    }

    /// Configured per-host overrides, keys lowercased.
    pub fn host_intervals(&self) -> BTreeMap<String, Duration> {
        self.rate_limit
            .hosts
            .iter()
            .map(|(host, ms)| (host.to_ascii_lowercase(), Duration::from_millis(*ms)))
            .collect()
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.read_secs)
    }
}

/// Pick the settings file to read.
///
/// An explicit path must exist; the fallbacks are only used when present.
pub fn resolve_config_path(
    cwd: &Path,
    explicit: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<Option<PathBuf>, SettingsError> {
    if let Some(path) = explicit {
        let path = cwd.join(path);
        if !path.is_file() {
            return Err(SettingsError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
            });
        }
        return Ok(Some(path));
    }
    let local = cwd.join("config").join("default.yaml");
    if local.is_file() {
        return Ok(Some(local));
    }
    Ok(config_dir
        .map(|dir| dir.join("scrapedu").join("config.yaml"))
        .filter(|p| p.is_file()))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
