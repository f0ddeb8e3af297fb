use chrono::Duration as ChronoDuration;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{error::AppError, models::ConfiguredPeer, utils::write_atomic};

const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000; // 2 seconds
const DEFAULT_DISCOVERY_WORKERS: usize = 16;
const DEFAULT_CACHE_TTL_HOURS: u64 = 24;
const DEFAULT_MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_STORAGE_FILE: &str = "mailmesh.db";

/// Tunables for peer discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Number of probe workers per scan
    pub workers: usize,

    /// Handshake timeout per candidate in milliseconds
    pub probe_timeout_ms: u64,

    /// Age after which a cached result should be rescanned
    pub cache_ttl_hours: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_DISCOVERY_WORKERS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            cache_ttl_hours: DEFAULT_CACHE_TTL_HOURS,
        }
    }
}

impl DiscoverySettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cache_ttl(&self) -> ChronoDuration {
        ChronoDuration::hours(self.cache_ttl_hours as i64)
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Mesh identity key, opaque to this crate
    pub private_key: Option<String>,

    /// Peers the engine should connect to
    pub peers: Vec<ConfiguredPeer>,

    /// Addresses the engine listens on for incoming peers
    pub listen: Vec<String>,

    /// Mail storage file owned by the running service
    pub storage_path: PathBuf,

    pub max_message_size: u64,

    pub smtp_address: String,
    pub imap_address: String,

    pub language: String,
    pub theme: String,

    /// Set once the storage password has been applied to the database
    pub database_password_set: bool,

    pub discovery: DiscoverySettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            peers: Vec::new(),
            listen: Vec::new(),
            storage_path: PathBuf::from(DEFAULT_STORAGE_FILE),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            smtp_address: "127.0.0.1:1025".to_string(),
            imap_address: "127.0.0.1:1143".to_string(),
            language: "en".to_string(),
            theme: "system".to_string(),
            database_password_set: false,
            discovery: DiscoverySettings::default(),
        }
    }
}

impl AppConfig {
    /// URIs of the peers that are switched on
    pub fn enabled_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|peer| peer.enabled)
            .map(|peer| peer.uri.clone())
            .collect()
    }

    /// Make a relative storage path relative to the config file's directory
    fn anchor_storage_path(&mut self, config_path: &Path) {
        if self.storage_path.is_relative() {
            if let Some(dir) = config_path.parent() {
                self.storage_path = dir.join(&self.storage_path);
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self, AppError> {
        serde_json::from_str(json)
            .map_err(|e| AppError::ConfigError(format!("Invalid configuration: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Values taken from the environment and layered over the file contents.
/// They shape the effective configuration but are never written back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub probe_timeout_ms: Option<u64>,
    pub discovery_workers: Option<usize>,
    pub storage_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Read `MAILMESH_PROBE_TIMEOUT_MS`, `MAILMESH_DISCOVERY_WORKERS` and
    /// `MAILMESH_STORAGE_PATH`; unset or unparsable values are ignored
    pub fn from_env() -> Self {
        let probe_timeout_ms = env::var("MAILMESH_PROBE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        let discovery_workers = env::var("MAILMESH_DISCOVERY_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|w| *w > 0);

        let storage_path = env::var("MAILMESH_STORAGE_PATH")
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Self {
            probe_timeout_ms,
            discovery_workers,
            storage_path,
        }
    }

    fn apply(&self, config: &mut AppConfig) {
        if let Some(timeout) = self.probe_timeout_ms {
            config.discovery.probe_timeout_ms = timeout;
        }
        if let Some(workers) = self.discovery_workers {
            config.discovery.workers = workers;
        }
        if let Some(path) = &self.storage_path {
            config.storage_path = path.clone();
        }
    }
}

/// File-backed configuration with one writer at a time and cheap reads.
///
/// Two views are kept: `stored` mirrors the file, `effective` is what the
/// rest of the process sees (overrides applied, storage path anchored to
/// the config file's directory). Writes go through `stored` only.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    overrides: ConfigOverrides,
    stored: RwLock<AppConfig>,
    effective: RwLock<AppConfig>,
    writer: Mutex<()>,
}

impl ConfigStore {
    /// Load configuration from `path` with environment overrides, creating
    /// the file with defaults when missing
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        Self::open_with(path, ConfigOverrides::from_env())
    }

    pub fn open_with(
        path: impl Into<PathBuf>,
        overrides: ConfigOverrides,
    ) -> Result<Self, AppError> {
        let path = path.into();
        let stored = if path.exists() {
            Self::read_file(&path)?
        } else {
            let config = AppConfig::default();
            write_atomic(&path, config.to_json()?.as_bytes())?;
            tracing::info!("Created default configuration at {}", path.display());
            config
        };

        let effective = Self::effective_view(&path, &overrides, &stored);
        Ok(Self {
            path,
            overrides,
            stored: RwLock::new(stored),
            effective: RwLock::new(effective),
            writer: Mutex::new(()),
        })
    }

    fn read_file(path: &Path) -> Result<AppConfig, AppError> {
        let json = std::fs::read_to_string(path)?;
        AppConfig::from_json(&json)
    }

    fn effective_view(path: &Path, overrides: &ConfigOverrides, stored: &AppConfig) -> AppConfig {
        let mut config = stored.clone();
        overrides.apply(&mut config);
        config.anchor_storage_path(path);
        config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the effective configuration
    pub fn snapshot(&self) -> AppConfig {
        self.effective.read().clone()
    }

    /// Copy of the configuration exactly as saved in the file
    pub fn stored(&self) -> AppConfig {
        self.stored.read().clone()
    }

    /// Mutate the file contents, persist them and refresh the effective view
    pub fn update<F>(&self, mutate: F) -> Result<AppConfig, AppError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let _writer = self.writer.lock();
        let mut next = self.stored.read().clone();
        mutate(&mut next);
        self.persist(&next)?;
        Ok(self.publish(next))
    }

    /// Persist a whole new file contents
    pub fn replace(&self, config: AppConfig) -> Result<AppConfig, AppError> {
        let _writer = self.writer.lock();
        self.persist(&config)?;
        Ok(self.publish(config))
    }

    /// Re-read the file, discarding the in-memory copy
    pub fn reload(&self) -> Result<AppConfig, AppError> {
        let _writer = self.writer.lock();
        let config = Self::read_file(&self.path)?;
        Ok(self.publish(config))
    }

    fn publish(&self, stored: AppConfig) -> AppConfig {
        let effective = Self::effective_view(&self.path, &self.overrides, &stored);
        *self.stored.write() = stored;
        *self.effective.write() = effective.clone();
        effective
    }

    fn persist(&self, config: &AppConfig) -> Result<(), AppError> {
        write_atomic(&self.path, config.to_json()?.as_bytes())?;
        tracing::debug!("Saved configuration to {}", self.path.display());
        Ok(())
    }
}
