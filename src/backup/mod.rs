pub mod coordinator;
pub mod format;

pub use coordinator::{
    BackupCoordinator, BackupOptions, BackupReport, BackupSettings, RestoreOptions, RestoreReport,
};
pub use format::BackupPayload;
