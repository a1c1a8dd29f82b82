use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lower bound for `check_interval_secs`. The supervising restart script runs
/// every 5 minutes, so checking more often would race its restarts.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 300;

/// Top-level configuration loaded from fleetwatch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Suppresses notifications and the staleness alert.
    pub debug: bool,
    pub instance: InstanceConfig,
    pub check: CheckConfig,
    pub notify: NotifyConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Substring shared by every instance directory of the fleet (e.g. "Bot").
    pub project_name: String,
    /// Deployment directory of this instance. Defaults to the working directory.
    pub app_dir: Option<PathBuf>,
    /// Log file of this instance, relative to `app_dir`.
    pub logfile: PathBuf,
    /// Credential sent with every status query.
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub monitoring_instance_dir_suffix: String,
    pub fleet_instance_count: u32,
    pub api_probe_retry_delay_secs: u64,
    pub api_probe_timeout_secs: u64,
    pub assume_crashed_after_mins: u64,
    /// How often the driver loop calls into the watchdog.
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub cooldown_mins: u64,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

// --- Default implementations ---

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            project_name: "Bot".to_string(),
            app_dir: None,
            logfile: PathBuf::from("logfile.log"),
            api_key: String::new(),
        }
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: MIN_CHECK_INTERVAL_SECS,
            monitoring_instance_dir_suffix: "_monitor".to_string(),
            fleet_instance_count: 1,
            api_probe_retry_delay_secs: 20,
            api_probe_timeout_secs: 10,
            assume_crashed_after_mins: 30,
            poll_interval_secs: 60,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            cooldown_mins: 60,
            webhook_url: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("instances.db"),
        }
    }
}

impl WatchdogConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default().validated());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let config: Self = toml::from_str(contents)?;
        Ok(config.validated())
    }

    /// Clamp values that would break the watchdog's timing assumptions.
    fn validated(mut self) -> Self {
        if self.check.check_interval_secs < MIN_CHECK_INTERVAL_SECS {
            tracing::warn!(
                configured = self.check.check_interval_secs,
                minimum = MIN_CHECK_INTERVAL_SECS,
                "check interval too short, clamping"
            );
            self.check.check_interval_secs = MIN_CHECK_INTERVAL_SECS;
        }
        if self.check.fleet_instance_count == 0 {
            self.check.fleet_instance_count = 1;
        }
        self
    }

    /// Deployment directory of this instance, always absolute. Relative
    /// `app_dir` values are resolved against the working directory.
    pub fn app_dir(&self) -> PathBuf {
        match &self.instance.app_dir {
            Some(dir) => std::path::absolute(dir).unwrap_or_else(|e| {
                tracing::warn!(app_dir = %dir.display(), error = %e, "failed to resolve app_dir");
                dir.clone()
            }),
            None => std::env::current_dir().unwrap_or_default(),
        }
    }
}

/// Child processes spawned by an instance never run the watchdog.
pub fn is_child_process() -> bool {
    std::env::var("IS_CHILD")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}
