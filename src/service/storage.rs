use fs2::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use crate::error::AppError;

/// Exclusive handle on the mail storage file.
///
/// Held by the service manager from `Initialize` until `Close`; a second
/// holder in this or any other process gets `ResourceBusy`.
#[derive(Debug)]
pub struct StorageHandle {
    file: File,
    path: PathBuf,
}

impl StorageHandle {
    pub fn acquire(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired storage lock on {}", path.display());
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(
                AppError::ResourceBusy(format!("{} is held by another service", path.display())),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and close the file
    pub fn release(self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
        tracing::debug!("Released storage lock on {}", self.path.display());
    }
}
