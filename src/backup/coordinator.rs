use chrono::{DateTime, Utc};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::Mutex;

use super::format::{self, BackupPayload, DEFAULT_PBKDF2_ROUNDS};
use crate::{
    config::AppConfig,
    error::AppError,
    models::ServiceState,
    service::{ServiceHost, ServiceManager},
    utils::write_atomic,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_MAX_POLLS: u32 = 50; // 10 seconds

#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Delay between state checks while waiting for the service to stop
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub pbkdf2_rounds: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            pbkdf2_rounds: DEFAULT_PBKDF2_ROUNDS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub path: PathBuf,
    pub password: String,
    pub include_database: bool,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub bytes_written: u64,
    pub included_database: bool,
    /// Set when the backup succeeded but the service could not be resumed
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub path: PathBuf,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// When the restored backup was taken
    pub created_at: DateTime<Utc>,
    pub restored_database: bool,
    /// Whether the rebuilt service is running
    pub resumed: bool,
    /// Non-fatal problems: an ignored storage path or a failed restart
    pub warning: Option<String>,
}

/// Pauses the service around encrypted backup and restore.
///
/// Only one backup or restore runs at a time. Neither operation touches
/// discovery state.
pub struct BackupCoordinator {
    host: Arc<ServiceHost>,
    settings: BackupSettings,
    busy: Mutex<()>,
}

impl BackupCoordinator {
    pub fn new(host: Arc<ServiceHost>, settings: BackupSettings) -> Self {
        Self {
            host,
            settings,
            busy: Mutex::new(()),
        }
    }

    pub async fn create_backup(&self, options: BackupOptions) -> Result<BackupReport, AppError> {
        check_password(&options.password)?;
        let _busy = self.busy.lock().await;

        let manager = self.host.manager();
        let prior = Prior::of(&manager);
        let paused = options.include_database && !manager.storage_released();
        if paused {
            tracing::info!("Pausing service to snapshot storage");
            self.pause(&manager).await?;
        }

        let result = self.write_backup(&options).await;

        let mut warning = None;
        if paused {
            if let Err(e) = prior.reinstate(&manager).await {
                tracing::warn!("Backup written but service failed to restart: {}", e);
                warning = Some(format!("service failed to restart: {}", e));
            }
        }

        let mut report = result?;
        report.warning = warning;
        Ok(report)
    }

    async fn write_backup(&self, options: &BackupOptions) -> Result<BackupReport, AppError> {
        let storage_path = self.host.config().snapshot().storage_path;
        let database = if options.include_database {
            match tokio::fs::read(&storage_path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(
                        "No storage file at {}, backing up configuration only",
                        storage_path.display()
                    );
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        // Environment overrides are not part of the saved configuration
        let payload = BackupPayload {
            created_at: Utc::now(),
            config_json: self.host.config().stored().to_json()?,
            database,
        };
        let included_database = payload.database.is_some();
        let created_at = payload.created_at;

        let password = options.password.clone();
        let rounds = self.settings.pbkdf2_rounds;
        let sealed =
            tokio::task::spawn_blocking(move || format::seal(&payload, &password, rounds))
                .await??;

        let path = options.path.clone();
        let bytes_written = sealed.len() as u64;
        tokio::task::spawn_blocking(move || write_atomic(&path, &sealed)).await??;

        tracing::info!(
            "Backup written to {} ({} bytes, database included: {})",
            options.path.display(),
            bytes_written,
            included_database
        );
        Ok(BackupReport {
            path: options.path.clone(),
            created_at,
            bytes_written,
            included_database,
            warning: None,
        })
    }

    pub async fn restore_backup(
        &self,
        options: RestoreOptions,
    ) -> Result<RestoreReport, AppError> {
        check_password(&options.password)?;
        let _busy = self.busy.lock().await;

        let manager = self.host.manager();
        let prior = Prior::of(&manager);
        if !manager.storage_released() {
            self.pause(&manager).await?;
        }

        let decoded = match self.read_backup(&options).await {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Restore aborted: {}", e);
                if let Err(resume_err) = prior.reinstate(&manager).await {
                    tracing::error!(
                        "Failed to resume service after aborted restore: {}",
                        resume_err
                    );
                }
                return Err(e);
            }
        };

        let mut warnings = Vec::new();
        if let Some(ignored) = &decoded.ignored_storage_path {
            tracing::warn!(
                "Backup storage path {} ignored, keeping {}",
                ignored.display(),
                decoded.config.storage_path.display()
            );
            warnings.push(format!(
                "backup storage path {} ignored; kept {}",
                ignored.display(),
                decoded.config.storage_path.display()
            ));
        }

        let storage_path = self.host.config().replace(decoded.config)?.storage_path;
        tracing::info!("Configuration restored from backup");

        let payload = decoded.payload;
        let restored_database = payload.database.is_some();
        let storage_result = match payload.database {
            Some(database) => {
                let path = storage_path.clone();
                tokio::task::spawn_blocking(move || write_atomic(&path, &database))
                    .await
                    .map_err(AppError::from)
                    .and_then(|written| written.map_err(AppError::from))
            }
            None => Ok(()),
        };

        let manager = self.host.rebuild();
        if let Err(e) = storage_result {
            tracing::error!(
                "Storage restore to {} failed after configuration was replaced: {}",
                storage_path.display(),
                e
            );
            return Err(AppError::PartialRestore(e.to_string()));
        }

        let mut resumed = false;
        match prior.reinstate(&manager).await {
            Ok(()) => resumed = prior.running,
            Err(e) => {
                tracing::warn!("Restore complete but service failed to start: {}", e);
                warnings.push(format!("service failed to start: {}", e));
            }
        }

        Ok(RestoreReport {
            created_at: payload.created_at,
            restored_database,
            resumed,
            warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
        })
    }

    /// Decrypt and validate a backup without touching anything on disk
    async fn read_backup(&self, options: &RestoreOptions) -> Result<DecodedBackup, AppError> {
        let bytes = tokio::fs::read(&options.path).await?;
        let password = options.password.clone();
        let payload = tokio::task::spawn_blocking(move || format::open(&bytes, &password)).await??;

        let mut config = AppConfig::from_json(&payload.config_json)
            .map_err(|e| AppError::InvalidBackup(e.to_string()))?;
        config.database_password_set = false;

        // Storage stays where this installation keeps it
        let local = self.host.config().stored().storage_path;
        let ignored_storage_path = (config.storage_path != local)
            .then(|| std::mem::replace(&mut config.storage_path, local));
        Ok(DecodedBackup {
            payload,
            config,
            ignored_storage_path,
        })
    }

    /// Wait for the service to settle, stop it if it is running and
    /// release the storage file.
    ///
    /// Never blocks behind an engine call that is already in flight: a
    /// service stuck in `Starting` or `Stopping` is polled until the
    /// budget runs out.
    async fn pause(&self, manager: &ServiceManager) -> Result<(), AppError> {
        for _ in 0..self.settings.max_polls {
            match manager.status() {
                ServiceState::Stopped | ServiceState::Error => return manager.close().await,
                ServiceState::Running => {
                    // Falls back to a hard stop internally
                    if let Err(e) = manager.soft_stop().await {
                        tracing::warn!("Stopping service for backup failed: {}", e);
                    }
                    continue;
                }
                state => tracing::debug!("Waiting for service to settle (state: {})", state),
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        Err(AppError::OperationTimedOut(format!(
            "service did not stop within {:?}",
            self.settings.poll_interval * self.settings.max_polls
        )))
    }
}

struct DecodedBackup {
    payload: BackupPayload,
    config: AppConfig,
    /// Storage location recorded in the backup when it differs from ours
    ignored_storage_path: Option<PathBuf>,
}

/// What the service was doing before a backup or restore paused it
#[derive(Debug, Clone, Copy)]
struct Prior {
    initialized: bool,
    running: bool,
}

impl Prior {
    fn of(manager: &ServiceManager) -> Self {
        let state = manager.status();
        Self {
            initialized: manager.is_initialized() && state != ServiceState::Error,
            running: matches!(state, ServiceState::Running | ServiceState::Starting),
        }
    }

    /// Bring a manager back to this state
    async fn reinstate(self, manager: &ServiceManager) -> Result<(), AppError> {
        if !self.initialized {
            return Ok(());
        }
        manager.initialize().await?;
        if self.running {
            manager.start().await?;
        }
        Ok(())
    }
}

fn check_password(password: &str) -> Result<(), AppError> {
    if password.is_empty() {
        return Err(AppError::ConfigError(
            "backup password must not be empty".to_string(),
        ));
    }
    Ok(())
}
