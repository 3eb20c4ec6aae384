//! Layered settings: optional TOML file, then `LOCKBOX__*` environment overrides.

use config::{Config, ConfigError, Environment, File};
use lockbox_storage::Compression;
use lockbox_storage::locking::{DEFAULT_POLL_INTERVAL, DEFAULT_STALE_AFTER};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base name of the settings file looked up in the working directory.
pub const DEFAULT_FILE: &str = "lockbox";
pub const ENV_PREFIX: &str = "LOCKBOX";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub log: LogSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub root: Option<PathBuf>,
    pub compression: CompressionSetting,
    pub stale_after_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: None,
            compression: CompressionSetting::None,
            stale_after_secs: DEFAULT_STALE_AFTER.as_secs(),
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(1000),
        }
    }
}

impl StorageSettings {
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionSetting {
    #[default]
    None,
    Lz4,
}

impl From<CompressionSetting> for Compression {
    fn from(value: CompressionSetting) -> Self {
        match value {
            CompressionSetting::None => Self::None,
            CompressionSetting::Lz4 => Self::Lz4,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level used when no `-v` flag is given.
    pub level: String,
    pub directory: Option<PathBuf>,
    /// JSON lines in the log files; the console is always plain text.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "warn".to_owned(), directory: None, json: false }
    }
}

/// Loads settings from `path` (required to exist) or from `lockbox.toml` when present,
/// then applies environment overrides such as `LOCKBOX__STORAGE__ROOT`.
///
/// # Errors
///
/// Fails if an explicit file is missing, a source cannot be parsed, or the merged values do
/// not match [`Settings`].
pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let file = path.map_or_else(
        || File::with_name(DEFAULT_FILE).required(false),
        |path| File::from(path).required(true),
    );

    Config::builder()
        .add_source(file)
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(
            &path,
            "[storage]\nroot = \"/srv/lockbox\"\ncompression = \"lz4\"\nstale_after_secs = 600\n\n[log]\njson = true\n",
        )
        .unwrap();

        let settings = load(Some(&path)).unwrap();
        assert_eq!(settings.storage.root.as_deref(), Some(Path::new("/srv/lockbox")));
        assert_eq!(settings.storage.compression, CompressionSetting::Lz4);
        assert_eq!(settings.storage.stale_after(), Duration::from_secs(600));
        assert_eq!(settings.storage.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert!(settings.log.json);
        assert_eq!(settings.log.level, "warn");
    }

    #[test]
    fn explicit_file_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load(Some(&tmp.path().join("missing.toml"))).is_err());
    }
}
