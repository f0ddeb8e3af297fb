/// Integration tests: encrypted backup and restore around a live service.
mod common;

use common::{config_with_peers, MockFactory};
use mailmesh::{
    backup::{BackupCoordinator, BackupOptions, BackupSettings, RestoreOptions},
    config::ConfigStore,
    error::AppError,
    models::ServiceState,
    service::ServiceHost,
};
use std::{
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::sync::Notify;

const PEER: &str = "tls://203.0.113.20:443";
const PASSWORD: &str = "hunter2-but-longer";

struct Fixture {
    dir: tempfile::TempDir,
    config: Arc<ConfigStore>,
    factory: MockFactory,
    host: Arc<ServiceHost>,
    backups: BackupCoordinator,
}

impl Fixture {
    fn new() -> Self {
        Self::with_max_polls(10)
    }

    fn with_max_polls(max_polls: u32) -> Self {
        let (dir, config) = config_with_peers(&[PEER]);
        std::fs::write(&config.snapshot().storage_path, b"mailbox v1").unwrap();

        let factory = MockFactory::default();
        let host = Arc::new(ServiceHost::new(config.clone(), Arc::new(factory.clone())));
        let backups = BackupCoordinator::new(
            host.clone(),
            BackupSettings {
                poll_interval: Duration::from_millis(10),
                max_polls,
                pbkdf2_rounds: 1_000,
            },
        );
        Self {
            dir,
            config,
            factory,
            host,
            backups,
        }
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.path().join("mailmesh.backup")
    }

    fn storage_path(&self) -> PathBuf {
        self.config.snapshot().storage_path
    }

    async fn create(&self, include_database: bool) -> mailmesh::backup::BackupReport {
        self.backups
            .create_backup(BackupOptions {
                path: self.backup_path(),
                password: PASSWORD.to_string(),
                include_database,
            })
            .await
            .unwrap()
    }

    async fn restore(&self, password: &str) -> Result<mailmesh::backup::RestoreReport, AppError> {
        self.backups
            .restore_backup(RestoreOptions {
                path: self.backup_path(),
                password: password.to_string(),
            })
            .await
    }
}

#[tokio::test]
async fn backup_and_restore_round_trip_while_running() {
    let fx = Fixture::new();
    fx.host.launch().await.unwrap();

    let report = fx.create(true).await;
    assert!(report.included_database);
    assert!(report.warning.is_none());
    assert!(report.bytes_written > 0);
    // Paused for the snapshot, then resumed
    assert_eq!(fx.host.manager().status(), ServiceState::Running);
    assert_eq!(fx.factory.script.created.load(Ordering::SeqCst), 2);

    let before = fx.host.manager();
    fx.config
        .update(|config| {
            config.theme = "dark".to_string();
            config.database_password_set = true;
        })
        .unwrap();
    std::fs::write(fx.storage_path(), b"mailbox v2").unwrap();

    let restored = fx.restore(PASSWORD).await.unwrap();
    assert!(restored.restored_database);
    assert!(restored.resumed);
    assert!(restored.warning.is_none());

    let config = fx.config.snapshot();
    assert_eq!(config.theme, "system");
    assert!(!config.database_password_set);
    assert_eq!(config.enabled_peers(), vec![PEER]);
    assert_eq!(std::fs::read(fx.storage_path()).unwrap(), b"mailbox v1");

    // A new manager took over and is running
    let after = fx.host.manager();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.status(), ServiceState::Running);
    assert_eq!(before.status(), ServiceState::Stopped);
    assert_eq!(fx.factory.script.running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wrong_password_leaves_everything_untouched() {
    let fx = Fixture::new();
    fx.create(true).await;
    fx.host.launch().await.unwrap();
    let manager = fx.host.manager();

    let config_bytes = std::fs::read(fx.config.path()).unwrap();
    let storage_bytes = std::fs::read(fx.storage_path()).unwrap();

    let result = fx.restore("not the password").await;
    assert!(matches!(result, Err(AppError::AuthenticationFailed)));

    assert_eq!(std::fs::read(fx.config.path()).unwrap(), config_bytes);
    assert_eq!(std::fs::read(fx.storage_path()).unwrap(), storage_bytes);
    // The original instance was resumed rather than replaced
    assert!(Arc::ptr_eq(&manager, &fx.host.manager()));
    assert_eq!(manager.status(), ServiceState::Running);
}

#[tokio::test]
async fn garbage_file_is_an_invalid_backup() {
    let fx = Fixture::new();
    std::fs::write(fx.backup_path(), b"definitely not an encrypted backup file, but long enough")
        .unwrap();

    assert!(matches!(
        fx.restore(PASSWORD).await,
        Err(AppError::InvalidBackup(_))
    ));
    assert_eq!(std::fs::read(fx.storage_path()).unwrap(), b"mailbox v1");
}

#[tokio::test]
async fn restart_failure_after_backup_is_a_warning() {
    let fx = Fixture::new();
    fx.host.launch().await.unwrap();
    fx.factory.script.fail_start.store(true, Ordering::SeqCst);

    let report = fx.create(true).await;

    assert!(fx.backup_path().exists());
    assert!(report.warning.is_some());
    assert_eq!(fx.host.manager().status(), ServiceState::Error);
}

#[tokio::test]
async fn config_only_backup_does_not_pause() {
    let fx = Fixture::new();
    let manager = fx.host.launch().await.unwrap();
    let mut status = fx.host.subscribe_status();

    let report = fx.create(false).await;

    assert!(!report.included_database);
    assert!(status.drain().is_empty());
    assert_eq!(manager.status(), ServiceState::Running);
    assert_eq!(fx.factory.script.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn storage_write_failure_is_a_partial_restore() {
    let fx = Fixture::new();
    fx.create(true).await;

    // Point storage at a directory so the file cannot be replaced
    let blocked = fx.dir.path().join("blocked");
    std::fs::create_dir_all(blocked.join("inner")).unwrap();
    fx.config
        .update(|config| {
            config.storage_path = blocked.clone();
            config.theme = "dark".to_string();
        })
        .unwrap();

    let result = fx.restore(PASSWORD).await;
    assert!(matches!(result, Err(AppError::PartialRestore(_))));

    // Configuration did come back
    let config = fx.config.snapshot();
    assert_eq!(config.theme, "system");
    assert_eq!(config.storage_path, blocked);
    assert!(blocked.is_dir());
}

#[tokio::test]
async fn empty_password_is_refused() {
    let fx = Fixture::new();
    let result = fx
        .backups
        .create_backup(BackupOptions {
            path: fx.backup_path(),
            password: String::new(),
            include_database: false,
        })
        .await;

    assert!(matches!(result, Err(AppError::ConfigError(_))));
    assert!(!fx.backup_path().exists());
}

#[tokio::test]
async fn initialized_but_stopped_service_is_paused_for_the_snapshot() {
    let fx = Fixture::new();
    let manager = fx.host.manager();
    manager.initialize().await.unwrap();
    assert!(!manager.storage_released());

    let report = fx.create(true).await;

    assert!(report.included_database);
    assert!(report.warning.is_none());
    // Closed for the read, then put back the way it was
    assert_eq!(fx.factory.script.created.load(Ordering::SeqCst), 2);
    assert!(manager.is_initialized());
    assert!(!manager.storage_released());
    assert_eq!(manager.status(), ServiceState::Stopped);
    assert_eq!(fx.factory.script.running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn service_stuck_stopping_times_out_the_backup() {
    let fx = Fixture::with_max_polls(2);
    let manager = fx.host.launch().await.unwrap();

    let gate = Arc::new(Notify::new());
    *fx.factory.script.soft_stop_gate.lock() = Some(gate.clone());
    let stopping = tokio::spawn({
        let manager = manager.clone();
        async move { manager.soft_stop().await }
    });
    fx.factory.script.soft_stop_entered.notified().await;
    assert_eq!(manager.status(), ServiceState::Stopping);

    let result = fx
        .backups
        .create_backup(BackupOptions {
            path: fx.backup_path(),
            password: PASSWORD.to_string(),
            include_database: true,
        })
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, AppError::OperationTimedOut(_)));
    assert!(err.is_retryable());
    assert!(!fx.backup_path().exists());

    gate.notify_one();
    stopping.await.unwrap().unwrap();
    assert_eq!(manager.status(), ServiceState::Stopped);
    assert!(!manager.storage_released());
}

#[tokio::test]
async fn restore_keeps_the_local_storage_path_and_says_so() {
    let fx = Fixture::new();
    fx.create(true).await;

    fx.config
        .update(|config| config.storage_path = PathBuf::from("moved.db"))
        .unwrap();

    let restored = fx.restore(PASSWORD).await.unwrap();

    let warning = restored.warning.unwrap();
    assert!(warning.contains("mailmesh.db"), "{}", warning);
    assert!(warning.contains("moved.db"), "{}", warning);
    assert_eq!(fx.config.stored().storage_path, PathBuf::from("moved.db"));
    assert_eq!(
        std::fs::read(fx.dir.path().join("moved.db")).unwrap(),
        b"mailbox v1"
    );
}

#[tokio::test]
async fn restore_reinitializes_a_service_that_was_initialized() {
    let fx = Fixture::new();
    fx.create(true).await;
    let before = fx.host.manager();
    before.initialize().await.unwrap();

    let restored = fx.restore(PASSWORD).await.unwrap();

    assert!(!restored.resumed);
    assert!(restored.warning.is_none());
    let after = fx.host.manager();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(!before.is_initialized());
    assert!(after.is_initialized());
    assert!(!after.storage_released());
    assert_eq!(after.status(), ServiceState::Stopped);
}

#[tokio::test]
async fn restore_leaves_an_uninitialized_service_alone() {
    let fx = Fixture::new();
    fx.create(true).await;

    let restored = fx.restore(PASSWORD).await.unwrap();

    assert!(!restored.resumed);
    assert!(!fx.host.manager().is_initialized());
    assert_eq!(fx.factory.script.created.load(Ordering::SeqCst), 0);
}
