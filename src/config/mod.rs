//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::RuleConfigError;
use crate::services::acquisition::{RootFolderRule, RuleBook};

/// Default cron: Tuesday 23:00, after the weekend numbers settle
pub const DEFAULT_CRON: &str = "0 23 * * 2";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Trakt API client id
    pub trakt_client_id: String,

    /// Trakt API base URL
    pub trakt_api_url: String,

    /// Radarr base URL
    pub radarr_url: String,

    /// Radarr API key
    pub radarr_api_key: String,

    /// Directory holding weekly snapshots
    pub data_dir: PathBuf,

    /// Maximum number of run records kept in memory
    pub run_history_capacity: usize,

    /// How long the library index stays fresh
    pub library_cache_ttl: Duration,

    /// Keep only the newest N weekly snapshots (unbounded when unset)
    pub snapshot_retention_weeks: Option<usize>,

    /// Upper bound on a rate-limit wait requested by the source
    pub max_rate_limit_wait: Duration,

    /// Emit JSON log lines
    pub log_json: bool,

    /// Initial values for the runtime-editable settings
    pub settings: Settings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let trakt_client_id = env::var("TRAKT_CLIENT_ID").context("TRAKT_CLIENT_ID is required")?;
        let radarr_api_key = env::var("RADARR_API_KEY").context("RADARR_API_KEY is required")?;

        let root_folder_rules = match env::var("AUTO_ADD_ROOT_FOLDER_RULES") {
            Ok(raw) if !raw.trim().is_empty() => {
                let rules: Vec<RootFolderRule> = serde_json::from_str(&raw)
                    .context("Invalid AUTO_ADD_ROOT_FOLDER_RULES (expected JSON array)")?;
                RuleBook::from_rules(rules)
            }
            _ => RuleBook::default(),
        };

        let genre_mode = match env::var("AUTO_ADD_GENRE_FILTER_MODE") {
            Ok(mode) => mode.parse::<GenreFilterMode>().map_err(|e: String| anyhow::anyhow!(e))?,
            Err(_) => GenreFilterMode::Blacklist,
        };

        let acquisition = AcquisitionSettings {
            enabled: env_bool("AUTO_ADD_ENABLED", false),
            limit: env_parse("AUTO_ADD_LIMIT", 10)?,
            ignore_rereleases: env_bool("AUTO_ADD_IGNORE_RERELEASES", false),
            genre_filter: GenreFilter {
                enabled: env_bool("AUTO_ADD_GENRE_FILTER_ENABLED", false),
                mode: genre_mode,
                whitelist: env_list("AUTO_ADD_GENRE_WHITELIST"),
                blacklist: env_list("AUTO_ADD_GENRE_BLACKLIST"),
            },
            rating_filter: RatingFilter {
                enabled: env_bool("AUTO_ADD_RATING_FILTER_ENABLED", false),
                allowed: env_list("AUTO_ADD_RATING_WHITELIST"),
            },
            quality_profile: env::var("AUTO_ADD_QUALITY_PROFILE")
                .unwrap_or_else(|_| "HD-1080p".to_string()),
            upgrade_quality_profile: env::var("AUTO_ADD_UPGRADE_QUALITY_PROFILE").ok(),
            default_root_folder: env::var("AUTO_ADD_ROOT_FOLDER")
                .unwrap_or_else(|_| "/movies".to_string()),
            root_folder_rules,
            add_options: AddOptions {
                monitored: env_bool("AUTO_ADD_MONITORED", true),
                search_on_add: env_bool("AUTO_ADD_SEARCH_ON_ADD", true),
                minimum_availability: env::var("AUTO_ADD_MINIMUM_AVAILABILITY").ok(),
                tag: env::var("AUTO_ADD_TAG").ok().filter(|t| !t.trim().is_empty()),
            },
        };

        Ok(Self {
            trakt_client_id,

            trakt_api_url: env::var("TRAKT_API_URL")
                .unwrap_or_else(|_| "https://api.trakt.tv".to_string()),

            radarr_url: env::var("RADARR_URL").unwrap_or_else(|_| "http://localhost:7878".to_string()),

            radarr_api_key,

            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string())),

            run_history_capacity: env_parse("RUN_HISTORY_CAPACITY", 20)?,

            library_cache_ttl: Duration::from_secs(env_parse("LIBRARY_CACHE_TTL_SECS", 120)?),

            snapshot_retention_weeks: env::var("SNAPSHOT_RETENTION_WEEKS")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("Invalid SNAPSHOT_RETENTION_WEEKS")?,

            max_rate_limit_wait: Duration::from_secs(env_parse("SOURCE_MAX_RATE_LIMIT_WAIT_SECS", 300)?),

            log_json: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),

            settings: Settings {
                schedule: ScheduleSettings {
                    enabled: env_bool("SCHEDULER_ENABLED", true),
                    cron: env::var("SCHEDULER_CRON").unwrap_or_else(|_| DEFAULT_CRON.to_string()),
                },
                acquisition,
            },
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid {}: {}", key, v)),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Cron trigger settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub enabled: bool,
    /// 5-field crontab or 6-field with seconds
    pub cron: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: DEFAULT_CRON.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenreFilterMode {
    Whitelist,
    Blacklist,
}

impl std::str::FromStr for GenreFilterMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "whitelist" => Ok(GenreFilterMode::Whitelist),
            "blacklist" => Ok(GenreFilterMode::Blacklist),
            _ => Err(format!("Unknown genre filter mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreFilter {
    pub enabled: bool,
    pub mode: GenreFilterMode,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl Default for GenreFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: GenreFilterMode::Blacklist,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingFilter {
    pub enabled: bool,
    /// Allowed certifications, e.g. `PG-13`
    pub allowed: Vec<String>,
}

/// Options forwarded to the library when adding a title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOptions {
    pub monitored: bool,
    pub search_on_add: bool,
    pub minimum_availability: Option<String>,
    /// Tag label attached to auto-added titles
    pub tag: Option<String>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            monitored: true,
            search_on_add: true,
            minimum_availability: None,
            tag: None,
        }
    }
}

/// Auto-acquisition rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    pub enabled: bool,
    /// Maximum titles added per run
    pub limit: usize,
    pub ignore_rereleases: bool,
    pub genre_filter: GenreFilter,
    pub rating_filter: RatingFilter,
    /// Quality profile name used for added titles
    pub quality_profile: String,
    /// Profile offered as an upgrade for matched titles
    pub upgrade_quality_profile: Option<String>,
    pub default_root_folder: String,
    pub root_folder_rules: RuleBook,
    pub add_options: AddOptions,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 10,
            ignore_rereleases: false,
            genre_filter: GenreFilter::default(),
            rating_filter: RatingFilter::default(),
            quality_profile: "HD-1080p".to_string(),
            upgrade_quality_profile: None,
            default_root_folder: "/movies".to_string(),
            root_folder_rules: RuleBook::default(),
            add_options: AddOptions::default(),
        }
    }
}

/// Runtime-editable settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub schedule: ScheduleSettings,
    pub acquisition: AcquisitionSettings,
}

/// Shared settings with a single writer.
///
/// Readers always get a cloned snapshot, so an edit saved while a run is in
/// progress only takes effect on the next run.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn schedule(&self) -> ScheduleSettings {
        self.inner.read().schedule.clone()
    }

    pub fn acquisition(&self) -> AcquisitionSettings {
        self.inner.read().acquisition.clone()
    }

    pub fn set_schedule(&self, schedule: ScheduleSettings) {
        self.inner.write().schedule = schedule;
    }

    /// Apply an edit to the acquisition settings.
    ///
    /// The edit runs against a copy; the shared value is only replaced when
    /// the edit succeeds, so a failed rule-list operation leaves it untouched.
    pub fn edit_acquisition<T, F>(&self, edit: F) -> std::result::Result<T, RuleConfigError>
    where
        F: FnOnce(&mut AcquisitionSettings) -> std::result::Result<T, RuleConfigError>,
    {
        let mut guard = self.inner.write();
        let mut draft = guard.acquisition.clone();
        let out = edit(&mut draft)?;
        guard.acquisition = draft;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genre_filter_mode_parse() {
        assert_eq!("Whitelist".parse::<GenreFilterMode>(), Ok(GenreFilterMode::Whitelist));
        assert_eq!("blacklist".parse::<GenreFilterMode>(), Ok(GenreFilterMode::Blacklist));
        assert!("greylist".parse::<GenreFilterMode>().is_err());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_edits() {
        let handle = SettingsHandle::default();
        let snapshot = handle.acquisition();

        handle
            .edit_acquisition(|a| {
                a.limit = 1;
                a.root_folder_rules.push(vec!["horror".into()], "/horror".into());
                Ok(())
            })
            .unwrap();

        assert_eq!(snapshot.limit, 10);
        assert!(snapshot.root_folder_rules.is_empty());
        assert_eq!(handle.acquisition().limit, 1);
        assert_eq!(handle.acquisition().root_folder_rules.len(), 1);
    }

    #[test]
    fn test_failed_edit_leaves_settings_untouched() {
        let handle = SettingsHandle::default();
        let result = handle.edit_acquisition(|a| {
            a.limit = 3;
            a.root_folder_rules.remove(7)
        });

        assert!(result.is_err());
        assert_eq!(handle.acquisition().limit, 10);
    }
}
