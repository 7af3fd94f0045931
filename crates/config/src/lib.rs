//! Configuration for the drivesync daemon.
//!
//! Values are layered with [`figment`]: built-in defaults (rooted in the
//! user's home directory), then `~/.drivesync/configuration.toml`, then
//! `DRIVESYNC_`-prefixed environment variables. Nested keys use a double
//! underscore in the environment, e.g. `DRIVESYNC_RETRY__MAX_ATTEMPTS=6`.

pub mod error;

use crate::error::{ErrorKind, Result};
use drivesync_snapshot::OrphanPolicy;
use drivesync_storage::{FingerprintMode, RetryPolicy};
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory (below the home directory) holding the configuration file and
/// the baseline.
pub const CONFIG_DIR: &str = ".drivesync";
pub const CONFIG_FILE: &str = "configuration.toml";
pub const ENV_PREFIX: &str = "DRIVESYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Directory standing in for the remote drive.
    pub root: PathBuf,
    /// Records per listing page.
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per operation, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Folder kept in sync with the remote.
    pub local_root: PathBuf,
    /// Pause between the end of one cycle and the start of the next.
    pub sync_interval_seconds: u64,
    pub baseline_path: PathBuf,
    pub remote: RemoteConfig,
    /// Operations in flight at once, per side.
    pub concurrency: usize,
    /// Stop dispatching new operations once a cycle has run this long.
    pub cycle_timeout_seconds: Option<u64>,
    pub retry: RetryConfig,
    pub orphan_policy: OrphanPolicy,
    pub fingerprint: FingerprintMode,
    pub dry_run: bool,
}

impl Config {
    /// Built-in defaults for a user whose home directory is `home`.
    pub fn with_home(home: &Path) -> Self {
        let config_dir = home.join(CONFIG_DIR);
        Self {
            local_root: home.join("DriveSync"),
            sync_interval_seconds: 120,
            baseline_path: config_dir.join("baseline.json"),
            remote: RemoteConfig {
                root: config_dir.join("remote"),
                page_size: 100,
            },
            concurrency: 4,
            cycle_timeout_seconds: None,
            retry: RetryConfig {
                max_attempts: 4,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
            },
            orphan_policy: OrphanPolicy::default(),
            fingerprint: FingerprintMode::default(),
            dry_run: false,
        }
    }

    /// Built-in defaults for the current user.
    pub fn defaults() -> Result<Self> {
        Ok(Self::with_home(&home_dir()?))
    }

    /// `~/.drivesync/configuration.toml`
    pub fn default_path() -> Result<PathBuf> {
        Ok(home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads and validates the configuration, reading `path` (or the default
    /// location) as the configuration file. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        tracing::debug!(path = %path.display(), exists = path.exists(), "Loading configuration");
        extract(Self::figment(Self::defaults()?, &path))
    }

    /// The layered sources, lowest precedence first.
    pub fn figment(defaults: Self, path: &Path) -> Figment {
        Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Rejects values the daemon cannot work with.
    pub fn validate(&self) -> Result<()> {
        let paths = [
            ("local_root", &self.local_root),
            ("baseline_path", &self.baseline_path),
            ("remote.root", &self.remote.root),
        ];
        for (key, path) in paths {
            if !path.is_absolute() {
                exn::bail!(ErrorKind::InvalidValue(format!("{key} must be an absolute path")));
            }
        }
        if self.local_root.starts_with(&self.remote.root) || self.remote.root.starts_with(&self.local_root) {
            exn::bail!(ErrorKind::InvalidValue("local_root and remote.root must not contain each other".to_string()));
        }
        if self.baseline_path.starts_with(&self.local_root) {
            exn::bail!(ErrorKind::InvalidValue("baseline_path must not be inside local_root".to_string()));
        }
        let positive = [
            ("sync_interval_seconds", self.sync_interval_seconds),
            ("concurrency", self.concurrency as u64),
            ("remote.page_size", self.remote.page_size as u64),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
        ];
        for (key, value) in positive {
            if value == 0 {
                exn::bail!(ErrorKind::InvalidValue(format!("{key} must be at least 1")));
            }
        }
        if self.cycle_timeout_seconds == Some(0) {
            exn::bail!(ErrorKind::InvalidValue("cycle_timeout_seconds must be at least 1".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            exn::bail!(ErrorKind::InvalidValue("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string()));
        }
        Ok(())
    }

    /// Creates the configuration directory, the local root and the remote
    /// root when they are missing.
    pub fn ensure_directories(&self) -> Result<()> {
        let config_dir = self.baseline_path.parent().unwrap_or(Path::new("/"));
        for dir in [config_dir, self.local_root.as_path(), self.remote.root.as_path()] {
            if dir.is_dir() {
                continue;
            }
            std::fs::create_dir_all(dir).or_raise(|| ErrorKind::Directories(dir.to_path_buf()))?;
            tracing::info!(path = %dir.display(), "Created directory");
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        self.cycle_timeout_seconds.map(Duration::from_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

fn extract(figment: Figment) -> Result<Config> {
    let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
    config.validate()?;
    Ok(config)
}

fn home_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_raise(|| ErrorKind::Directories(PathBuf::from("~")))
}
