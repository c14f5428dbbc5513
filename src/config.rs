//! Configuration file parser for ~/.config/shelfsync/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::sync::RefreshPolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OPDS catalog feed to reconcile against
    pub feed_url: String,

    /// Allow automatic (non-user) refresh triggers to run
    pub auto_refresh: bool,

    /// Automatic refreshes only run when the last success is at least this old
    pub refresh_stale_after_minutes: u64,

    /// Timeout for feed and favicon requests
    pub request_timeout_secs: u64,

    /// Concurrent favicon downloads
    pub favicon_concurrency: usize,

    /// Change log records older than this are pruned
    pub change_log_retention_days: u64,

    pub prune_interval_minutes: u64,

    /// How often `watch` polls the change log for writes by other processes
    pub watch_poll_interval_secs: u64,

    /// Entries held in the process-local query cache
    pub cache_capacity: usize,

    /// Prefix of the change log cursor names used by this installation.
    ///
    /// Each process role reads the log under its own cursor
    /// (`<consumer_name>.<role>`); two processes running concurrently must
    /// not share a role name, or one drains the log the other never sees.
    pub consumer_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: "https://library.kiwix.org/catalog/v2/entries?count=-1".to_string(),
            auto_refresh: true,
            refresh_stale_after_minutes: 60,
            request_timeout_secs: 30,
            favicon_concurrency: 4,
            change_log_retention_days: 7,
            prune_interval_minutes: 60,
            watch_poll_interval_secs: 2,
            cache_capacity: 1024,
            consumer_name: "shelfsync".to_string(),
        }
    }
}

const KNOWN_KEYS: [&str; 10] = [
    "feed_url",
    "auto_refresh",
    "refresh_stale_after_minutes",
    "request_timeout_secs",
    "favicon_concurrency",
    "change_log_retention_days",
    "prune_interval_minutes",
    "watch_poll_interval_secs",
    "cache_capacity",
    "consumer_name",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Unusable values (bad URL, zero intervals) → `Err(ConfigError::InvalidValue)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            feed_url = %config.feed_url,
            consumer = %config.consumer_name,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Change log cursor name for one process role (e.g. `watch`, `refresh`)
    pub fn consumer_for(&self, role: &str) -> String {
        format!("{}.{}", self.consumer_name.trim(), role)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_feed_url()?;
        if self.consumer_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "consumer_name",
                reason: "must not be empty".to_string(),
            });
        }
        let positive = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("change_log_retention_days", self.change_log_retention_days),
            ("prune_interval_minutes", self.prune_interval_minutes),
            ("watch_poll_interval_secs", self.watch_poll_interval_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn parsed_feed_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.feed_url).map_err(|e| ConfigError::InvalidValue {
            key: "feed_url",
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::InvalidValue {
                key: "feed_url",
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        let minutes = i64::try_from(self.refresh_stale_after_minutes).unwrap_or(i64::MAX);
        RefreshPolicy {
            auto_refresh: self.auto_refresh,
            stale_after: chrono::Duration::try_minutes(minutes).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn change_log_retention(&self) -> Duration {
        Duration::from_secs(self.change_log_retention_days.saturating_mul(24 * 3600))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_minutes.saturating_mul(60))
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_secs(self.watch_poll_interval_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.feed_url,
            "https://library.kiwix.org/catalog/v2/entries?count=-1"
        );
        assert!(config.auto_refresh);
        assert_eq!(config.refresh_stale_after_minutes, 60);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.favicon_concurrency, 4);
        assert_eq!(config.change_log_retention_days, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_empty_and_whitespace_files_return_default() {
        let (_dir, path) = write_config("");
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        let (_dir, path) = write_config("   \n  \n  ");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (_dir, path) = write_config("auto_refresh = false\n");
        let config = Config::load(&path).unwrap();
        assert!(!config.auto_refresh);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(!config.refresh_policy().auto_refresh);
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
feed_url = "http://mirror.example.org/catalog/v2/entries"
auto_refresh = false
refresh_stale_after_minutes = 15
request_timeout_secs = 10
favicon_concurrency = 8
change_log_retention_days = 3
prune_interval_minutes = 30
watch_poll_interval_secs = 5
cache_capacity = 64
consumer_name = "reader-ui"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.feed_url, "http://mirror.example.org/catalog/v2/entries");
        assert_eq!(config.refresh_policy().stale_after, chrono::Duration::minutes(15));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.favicon_concurrency, 8);
        assert_eq!(config.change_log_retention(), Duration::from_secs(3 * 24 * 3600));
        assert_eq!(config.prune_interval(), Duration::from_secs(1800));
        assert_eq!(config.watch_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.cache_capacity, 64);
        assert_eq!(config.consumer_name, "reader-ui");
    }

    #[test]
    fn test_roles_get_distinct_cursors() {
        let config = Config::default();
        assert_eq!(config.consumer_for("watch"), "shelfsync.watch");
        assert_ne!(config.consumer_for("watch"), config.consumer_for("refresh"));

        let custom = Config {
            consumer_name: "tablet".to_string(),
            ..Config::default()
        };
        assert_eq!(custom.consumer_for("merge"), "tablet.merge");
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config("auto_refresh = true\ntheme = \"dark\"\n");
        assert!(Config::load(&path).unwrap().auto_refresh);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (_dir, path) = write_config("auto_refresh = \"yes\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_bad_feed_url_rejected() {
        let (_dir, path) = write_config("feed_url = \"not a url\"\n");
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue { key: "feed_url", .. })
        ));

        let (_dir, path) = write_config("feed_url = \"file:///etc/passwd\"\n");
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue { key: "feed_url", .. })
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (_dir, path) = write_config("watch_poll_interval_secs = 0\n");
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue {
                key: "watch_poll_interval_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }
}
