use parking_lot::RwLock;
use std::sync::Arc;

use super::{engine::EngineFactory, manager::ServiceManager};
use crate::{
    config::ConfigStore,
    error::AppError,
    models::StatusUpdate,
    notify::{Notifier, Subscription},
};

/// Holds the process's current service manager.
///
/// Managers come and go (a restore binds a fresh one to the restored
/// configuration) but they all publish into the same status notifier, so
/// listeners subscribe once for the lifetime of the host.
pub struct ServiceHost {
    config: Arc<ConfigStore>,
    factory: Arc<dyn EngineFactory>,
    status: Notifier<StatusUpdate>,
    current: RwLock<Arc<ServiceManager>>,
}

impl ServiceHost {
    pub fn new(config: Arc<ConfigStore>, factory: Arc<dyn EngineFactory>) -> Self {
        let status = Notifier::default();
        let manager = Arc::new(ServiceManager::new(
            config.clone(),
            factory.clone(),
            status.clone(),
        ));
        Self {
            config,
            factory,
            status,
            current: RwLock::new(manager),
        }
    }

    /// The manager currently in charge
    pub fn manager(&self) -> Arc<ServiceManager> {
        self.current.read().clone()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Status updates from whichever manager is current
    pub fn subscribe_status(&self) -> Subscription<StatusUpdate> {
        self.status.subscribe()
    }

    /// Replace the current manager with a new, uninitialized one. The old
    /// manager must already be closed.
    pub fn rebuild(&self) -> Arc<ServiceManager> {
        let manager = Arc::new(ServiceManager::new(
            self.config.clone(),
            self.factory.clone(),
            self.status.clone(),
        ));
        *self.current.write() = manager.clone();
        tracing::info!("Service manager rebuilt from current configuration");
        manager
    }

    /// Initialize and start the current manager
    pub async fn launch(&self) -> Result<Arc<ServiceManager>, AppError> {
        let manager = self.manager();
        manager.initialize().await?;
        manager.start().await?;
        Ok(manager)
    }
}
