// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

use asa_core::PrivacyPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Application identifier used to derive platform config/data/log dirs.
pub const APP_NAME: &str = "activity-sync-agent";

/// Default remote API base URL.
pub const DEFAULT_API_URL: &str = "https://api.example.com";
/// Default local tracker host.
pub const DEFAULT_TRACKER_HOST: &str = "localhost";
/// Default local tracker port.
pub const DEFAULT_TRACKER_PORT: u16 = 5600;
/// Default sync interval, in seconds.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
/// Floor below which the sync interval is clamped, regardless of source.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 30;
/// Default batch size for a single upload request.
pub const DEFAULT_BATCH_SIZE: u32 = 100;
/// Ceiling above which the batch size is clamped, regardless of source.
pub const MAX_BATCH_SIZE: u32 = 1000;
/// Ceiling on the offline queue's row count.
pub const MAX_QUEUE_SIZE: u32 = 100_000;
/// Default idle threshold passed to the AFK watcher, in seconds.
pub const DEFAULT_AFK_TIMEOUT_SECS: u32 = 180;
/// Floor below which the AFK timeout is clamped, regardless of source.
pub const MIN_AFK_TIMEOUT_SECS: u32 = 10;
/// Ceiling above which the AFK timeout is clamped, regardless of source.
pub const MAX_AFK_TIMEOUT_SECS: u32 = 3600;

/// Errors raised while loading, parsing, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("config file not found or unreadable at {path}: {source}")]
    FileNotFound {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file exists but failed to parse as JSON.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Description of the parse failure.
        reason: String,
    },
    /// The config file parsed but failed semantic validation.
    #[error("invalid config: {}", .reasons.join("; "))]
    ValidationError {
        /// One message per failed validation rule.
        reasons: Vec<String>,
    },
    /// Writing the config file back to disk failed.
    #[error("failed to save config to {path}: {source}")]
    SaveError {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A non-fatal issue noticed while loading or merging configuration.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigWarning {
    /// A deprecated field was present and ignored.
    DeprecatedField {
        /// Name of the deprecated field.
        field: String,
    },
    /// A value from the server (or file) was outside the agent's
    /// accepted bounds and was clamped.
    Clamped {
        /// Name of the field that was clamped.
        field: String,
        /// Value as received.
        requested: String,
        /// Value actually applied.
        applied: String,
    },
    /// A legacy `api_url` pointing at `localhost` was migrated to
    /// `127.0.0.1` (some platforms resolve `localhost` to `::1` first,
    /// which the remote service does not listen on).
    LocalhostMigrated,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::DeprecatedField { field } => {
                write!(f, "ignoring deprecated field `{field}`")
            }
            ConfigWarning::Clamped {
                field,
                requested,
                applied,
            } => write!(
                f,
                "clamped `{field}` from {requested} to {applied} (out of accepted range)"
            ),
            ConfigWarning::LocalhostMigrated => {
                write!(f, "migrated legacy localhost api_url to 127.0.0.1")
            }
        }
    }
}

/// Remote sync settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SyncSettings {
    /// Base URL of the remote sync API.
    pub api_url: String,
    /// Seconds between scheduled sync cycles.
    pub sync_interval_secs: u64,
    /// Maximum events sent in a single batch request.
    pub batch_size: u32,
    /// Maximum rows retained in the offline queue.
    pub max_queue_size: u32,
    /// Gzip-compress batch request bodies.
    pub compress: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_queue_size: MAX_QUEUE_SIZE,
            compress: true,
        }
    }
}

/// Local tracker connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TrackerSettings {
    /// Tracker server host.
    pub host: String,
    /// Tracker server port.
    pub port: u16,
    /// Idle threshold, in seconds, passed to the AFK watcher on launch
    /// and on dynamic reconfig (see `asa_supervisor::Supervisor::set_afk_timeout`).
    pub afk_timeout_secs: u32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_TRACKER_HOST.to_string(),
            port: DEFAULT_TRACKER_PORT,
            afk_timeout_secs: DEFAULT_AFK_TIMEOUT_SECS,
        }
    }
}

impl TrackerSettings {
    /// Base URL for the tracker's local HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Break reminder settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReminderSettings {
    /// Whether break reminders are enabled.
    pub enabled: bool,
    /// Minutes of continuous active time before a reminder fires.
    pub interval_minutes: u32,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 60,
        }
    }
}

/// Periodic screenshot settings (disabled by default; opt-in feature).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScreenshotSettings {
    /// Whether periodic screenshots are enabled.
    pub enabled: bool,
    /// Minutes between screenshots.
    pub interval_minutes: u32,
    /// JPEG quality, 1-100.
    pub quality: u8,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 15,
            quality: 70,
        }
    }
}

/// The full on-disk agent configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    /// Device identifier sent to the remote on every request.
    pub device_id: String,
    /// Remote sync settings.
    pub sync: SyncSettings,
    /// Local tracker settings.
    pub tracker: TrackerSettings,
    /// Privacy policy applied before events leave the machine.
    pub privacy: PrivacyPolicy,
    /// Break reminder settings.
    pub reminders: ReminderSettings,
    /// Screenshot settings.
    pub screenshots: ScreenshotSettings,
    /// `tracing-subscriber` env-filter directive, e.g. `"info"` or
    /// `"asa=debug"`.
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: uuid_v4_like(),
            sync: SyncSettings::default(),
            tracker: TrackerSettings::default(),
            privacy: PrivacyPolicy::default(),
            reminders: ReminderSettings::default(),
            screenshots: ScreenshotSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Directory helpers mirroring `platformdirs`' per-OS resolution.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Directory for the offline queue database and cached binaries.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Directory for rotated log files.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Path to the `config.json` file.
pub fn config_file() -> PathBuf {
    config_dir().join("config.json")
}

/// Load config from `path` (or the default location), applying
/// environment variable overrides. Returns the config plus any
/// non-fatal warnings. If no file exists yet, returns
/// [`AgentConfig::default`] with no warnings.
pub fn load(path: Option<&Path>) -> Result<(AgentConfig, Vec<ConfigWarning>), ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_file);
    let mut warnings = Vec::new();

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileNotFound {
            path: path.clone(),
            source,
        })?;
        parse(&raw)?
    } else {
        debug!(path = %path.display(), "no config file found, using defaults");
        AgentConfig::default()
    };

    apply_env_overrides(&mut config, &mut warnings);
    migrate_localhost(&mut config, &mut warnings);
    validate(&config)?;

    Ok((config, warnings))
}

/// Parse a config document from a JSON string.
pub fn parse(raw: &str) -> Result<AgentConfig, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Persist `config` to `path` (or the default location), creating parent
/// directories as needed.
pub fn save(config: &AgentConfig, path: Option<&Path>) -> Result<(), ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::SaveError {
            path: path.clone(),
            source,
        })?;
    }
    let body = serde_json::to_string_pretty(config).expect("AgentConfig always serializes");
    std::fs::write(&path, body).map_err(|source| ConfigError::SaveError { path, source })
}

fn validate(config: &AgentConfig) -> Result<(), ConfigError> {
    let mut reasons = Vec::new();
    if config.sync.api_url.is_empty() {
        reasons.push("sync.api_url must not be empty".to_string());
    }
    if config.tracker.port == 0 {
        reasons.push("tracker.port must be nonzero".to_string());
    }
    if config.screenshots.quality == 0 || config.screenshots.quality > 100 {
        reasons.push("screenshots.quality must be in 1..=100".to_string());
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons })
    }
}

fn apply_env_overrides(config: &mut AgentConfig, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(url) = std::env::var("ASA_API_URL") {
        config.sync.api_url = url;
    }
    if let Ok(host) = std::env::var("ASA_TRACKER_HOST") {
        config.tracker.host = host;
    }
    if let Ok(port) = std::env::var("ASA_TRACKER_PORT") {
        match port.parse() {
            Ok(p) => config.tracker.port = p,
            Err(_) => warnings.push(ConfigWarning::Clamped {
                field: "tracker.port".to_string(),
                requested: port,
                applied: config.tracker.port.to_string(),
            }),
        }
    }
    if let Ok(level) = std::env::var("ASA_LOG_LEVEL") {
        config.log_level = level;
    }
}

fn migrate_localhost(config: &mut AgentConfig, warnings: &mut Vec<ConfigWarning>) {
    if config.sync.api_url.contains("://localhost") {
        config.sync.api_url = config.sync.api_url.replacen("localhost", "127.0.0.1", 1);
        warnings.push(ConfigWarning::LocalhostMigrated);
    }
}

/// Server-advertised overrides for a subset of config fields. The agent
/// clamps every value to its own accepted bounds rather than trusting
/// the server outright.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerConfigOverride {
    /// Requested sync interval, in seconds.
    pub sync_interval_seconds: Option<u64>,
    /// Requested batch size.
    pub batch_size: Option<u32>,
    /// `privacy.hash_window_titles` from the server's nested shape.
    pub hash_window_titles: Option<bool>,
    /// `privacy.track_browser_domains` from the server's nested shape;
    /// note this is the *inverse* of [`PrivacyPolicy::domain_only_urls`].
    pub track_browser_domains: Option<bool>,
    /// Requested AFK idle threshold, in seconds.
    pub afk_timeout_seconds: Option<u32>,
    /// `privacy.collect_full_urls` override.
    pub collect_full_urls: Option<bool>,
    /// `privacy.collect_page_category` override.
    pub collect_page_category: Option<bool>,
    /// Replace the excluded-app list wholesale, if present.
    pub exclude_apps: Option<Vec<String>>,
}

/// Merge a server-pushed config override into `config` in place,
/// clamping out-of-range values and recording what was clamped.
pub fn merge_server_override(
    config: &mut AgentConfig,
    server: &ServerConfigOverride,
) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if let Some(requested) = server.sync_interval_seconds {
        let applied = requested.max(MIN_SYNC_INTERVAL_SECS);
        if applied != requested {
            warnings.push(ConfigWarning::Clamped {
                field: "sync.sync_interval_secs".to_string(),
                requested: requested.to_string(),
                applied: applied.to_string(),
            });
        }
        config.sync.sync_interval_secs = applied;
    }

    if let Some(requested) = server.batch_size {
        let applied = requested.min(MAX_BATCH_SIZE);
        if applied != requested {
            warnings.push(ConfigWarning::Clamped {
                field: "sync.batch_size".to_string(),
                requested: requested.to_string(),
                applied: applied.to_string(),
            });
        }
        config.sync.batch_size = applied;
    }

    if let Some(hash_titles) = server.hash_window_titles {
        config.privacy.hash_titles = hash_titles;
    }

    if let Some(track_domains) = server.track_browser_domains {
        // Server's `track_browser_domains` is the inverse of our
        // `domain_only_urls`: "track full domains" vs "reduce to domain".
        config.privacy.domain_only_urls = !track_domains;
    }

    if let Some(collect_full_urls) = server.collect_full_urls {
        config.privacy.collect_full_urls = collect_full_urls;
    }

    if let Some(collect_page_category) = server.collect_page_category {
        config.privacy.collect_page_category = collect_page_category;
    }

    if let Some(exclude_apps) = &server.exclude_apps {
        config.privacy.exclude_apps = exclude_apps.clone();
    }

    if let Some(requested) = server.afk_timeout_seconds {
        let applied = requested.clamp(MIN_AFK_TIMEOUT_SECS, MAX_AFK_TIMEOUT_SECS);
        if applied != requested {
            warnings.push(ConfigWarning::Clamped {
                field: "tracker.afk_timeout_secs".to_string(),
                requested: requested.to_string(),
                applied: applied.to_string(),
            });
        }
        config.tracker.afk_timeout_secs = applied;
    }

    warnings
}

fn uuid_v4_like() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AgentConfig::default();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AgentConfig::default();
        config.sync.api_url = "https://sync.example.com".to_string();
        save(&config, Some(&path)).unwrap();
        let (loaded, warnings) = load(Some(&path)).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(loaded.sync.api_url, "https://sync.example.com");
    }

    #[test]
    fn clamps_server_sync_interval_to_floor() {
        let mut config = AgentConfig::default();
        let warnings = merge_server_override(
            &mut config,
            &ServerConfigOverride {
                sync_interval_seconds: Some(5),
                ..Default::default()
            },
        );
        assert_eq!(config.sync.sync_interval_secs, MIN_SYNC_INTERVAL_SECS);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn clamps_server_batch_size_to_ceiling() {
        let mut config = AgentConfig::default();
        let warnings = merge_server_override(
            &mut config,
            &ServerConfigOverride {
                batch_size: Some(50_000),
                ..Default::default()
            },
        );
        assert_eq!(config.sync.batch_size, MAX_BATCH_SIZE);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn track_browser_domains_is_inverted() {
        let mut config = AgentConfig::default();
        assert!(config.privacy.domain_only_urls);
        merge_server_override(
            &mut config,
            &ServerConfigOverride {
                track_browser_domains: Some(true),
                ..Default::default()
            },
        );
        assert!(!config.privacy.domain_only_urls);
    }

    #[test]
    fn clamps_server_afk_timeout_to_bounds() {
        let mut config = AgentConfig::default();
        let warnings = merge_server_override(
            &mut config,
            &ServerConfigOverride {
                afk_timeout_seconds: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(config.tracker.afk_timeout_secs, MIN_AFK_TIMEOUT_SECS);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn migrates_legacy_localhost_url() {
        let mut config = AgentConfig::default();
        config.sync.api_url = "http://localhost:8080".to_string();
        let mut warnings = Vec::new();
        migrate_localhost(&mut config, &mut warnings);
        assert_eq!(config.sync.api_url, "http://127.0.0.1:8080");
        assert_eq!(warnings, vec![ConfigWarning::LocalhostMigrated]);
    }
}
