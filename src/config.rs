use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No collection mapping for artist '{0}'. Add an [[artists]] entry to config.toml.")]
    UnknownArtist(String),
}

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Custom metadata cache directory (overrides XDG default).
    pub cache_dir: Option<PathBuf>,
    /// Archive API settings.
    pub archive: ArchiveConfig,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Track matching thresholds.
    pub matching: MatchingConfig,
    /// Lock service settings.
    pub locks: LockConfig,
    /// Job queue settings.
    pub jobs: JobConfig,
    /// Artist → archive collection mappings.
    #[serde(rename = "artists")]
    pub artists: Vec<ArtistMapping>,
}

/// Archive API configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Base URL of the archive API.
    pub base_url: String,
    /// Minimum delay between API requests in milliseconds.
    pub rate_limit_ms: u64,
    /// Retry attempts per request before giving up.
    pub max_retries: u32,
    /// Base backoff delay between retries in milliseconds (doubles per attempt).
    pub retry_delay_ms: u64,
    /// TTL for cached metadata responses in seconds.
    pub response_cache_ttl_secs: i64,
    /// Identifiers fetched per search page.
    pub page_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: "https://archive.org".to_string(),
            rate_limit_ms: 500,
            max_retries: 3,
            retry_delay_ms: 1000,
            response_cache_ttl_secs: 3600,
            page_size: 100,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub threshold: u32,
    /// Seconds the circuit stays open before allowing a trial call.
    pub reset_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_secs: 60,
        }
    }
}

/// Track matching thresholds. The defaults are empirical, not contractual —
/// tune per library if the unmatched-track review queue grows.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum fuzzy similarity (0-100) to accept a fuzzy match.
    pub fuzzy_threshold: f64,
    /// Minimum metaphone code length for phonetic substring matches.
    pub phonetic_min_len: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 75.0,
            phonetic_min_len: 4,
        }
    }
}

/// Lock service configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    /// Poll interval while waiting on a held lock, in milliseconds.
    pub poll_interval_ms: u64,
    /// Age in hours after which a lock with a dead owner is reclaimable.
    pub stale_after_hours: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            stale_after_hours: 4,
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobConfig {
    /// Worker poll interval when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
    /// Persist job progress every N processed shows.
    pub progress_batch: u64,
    /// Days to keep terminal jobs before purging.
    pub retention_days: i64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            progress_batch: 5,
            retention_days: 14,
        }
    }
}

/// One artist → archive collection mapping from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct ArtistMapping {
    pub name: String,
    pub collection: String,
}

impl AppConfig {
    /// Load config from `~/.config/tapersync/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Resolve an artist name to its archive collection.
    /// Matching is case-insensitive on the configured name.
    pub fn collection_for_artist(&self, artist: &str) -> Result<&str, ConfigError> {
        self.artists
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(artist))
            .map(|m| m.collection.as_str())
            .ok_or_else(|| ConfigError::UnknownArtist(artist.to_string()))
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("tapersync.db")
    } else {
        // Fallback: current directory
        PathBuf::from("tapersync.db")
    }
}

/// Resolve the default metadata cache directory using XDG cache directory.
pub fn default_cache_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let cache_dir = dirs.cache_dir().to_path_buf();
        std::fs::create_dir_all(&cache_dir).ok();
        cache_dir
    } else {
        PathBuf::from(".tapersync-cache")
    }
}
