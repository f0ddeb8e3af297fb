use chrono::Utc;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex;

use super::{
    engine::{Engine, EngineConfig, EngineFactory},
    storage::StorageHandle,
};
use crate::{
    config::ConfigStore,
    error::AppError,
    models::{ConfiguredPeer, PeerRuntimeStats, ServiceState, StatusUpdate},
    notify::{Notifier, Subscription},
    utils::parse_peer_uri,
};

/// Resources that exist between `Initialize` and `Close`
#[derive(Default)]
struct Instance {
    engine: Option<Box<dyn Engine>>,
    storage: Option<StorageHandle>,
}

/// Owns the embedded engine and drives its lifecycle.
///
/// Every operation that touches the engine runs under one async lock, so
/// transitions, hot reloads and stats reads are strictly serialized and
/// status updates go out in transition order.
pub struct ServiceManager {
    config: Arc<ConfigStore>,
    factory: Arc<dyn EngineFactory>,
    status: Notifier<StatusUpdate>,
    state: RwLock<StatusUpdate>,
    instance: Mutex<Instance>,
    // Mirrors of `instance`, readable while an engine call holds the lock
    initialized: AtomicBool,
    holds_storage: AtomicBool,
}

impl ServiceManager {
    pub fn new(
        config: Arc<ConfigStore>,
        factory: Arc<dyn EngineFactory>,
        status: Notifier<StatusUpdate>,
    ) -> Self {
        Self {
            config,
            factory,
            status,
            state: RwLock::new(StatusUpdate {
                state: ServiceState::Stopped,
                error: None,
                at: Utc::now(),
            }),
            instance: Mutex::new(Instance::default()),
            initialized: AtomicBool::new(false),
            holds_storage: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state; never waits on a running operation
    pub fn status(&self) -> ServiceState {
        self.state.read().state
    }

    /// Current state with the error that caused it, if any
    pub fn status_update(&self) -> StatusUpdate {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> Subscription<StatusUpdate> {
        self.status.subscribe()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Whether an engine exists; never waits on a running operation
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether the storage file is free for direct access
    pub fn storage_released(&self) -> bool {
        !self.holds_storage.load(Ordering::SeqCst)
    }

    fn record_instance(&self, instance: &Instance) {
        self.initialized
            .store(instance.engine.is_some(), Ordering::SeqCst);
        self.holds_storage
            .store(instance.storage.is_some(), Ordering::SeqCst);
    }

    fn transition(&self, state: ServiceState, error: Option<String>) {
        let update = StatusUpdate {
            state,
            error,
            at: Utc::now(),
        };
        {
            let mut current = self.state.write();
            if current.state == state && current.error == update.error {
                return;
            }
            *current = update.clone();
        }
        match &update.error {
            Some(error) => tracing::warn!("Service entered {}: {}", state, error),
            None => tracing::info!("Service entered {}", state),
        }
        self.status.publish(update);
    }

    /// Build the engine from the current configuration and take the storage lock
    pub async fn initialize(&self) -> Result<(), AppError> {
        let mut instance = self.instance.lock().await;
        self.initialize_locked(&mut instance).await
    }

    async fn initialize_locked(&self, instance: &mut Instance) -> Result<(), AppError> {
        let state = self.status();
        if instance.engine.is_some() {
            if state != ServiceState::Error {
                return Err(AppError::AlreadyInitialized);
            }
            tracing::info!("Discarding failed engine before re-initializing");
            self.discard_locked(instance).await;
        }

        let config = self.config.snapshot();
        let storage = StorageHandle::acquire(&config.storage_path)?;
        let engine = match self.factory.create(&EngineConfig::from(&config)).await {
            Ok(engine) => engine,
            Err(e) => {
                storage.release();
                return Err(e);
            }
        };

        instance.storage = Some(storage);
        instance.engine = Some(engine);
        self.record_instance(instance);
        tracing::info!(
            "Service initialized with {} enabled peers",
            config.enabled_peers().len()
        );
        if state == ServiceState::Error {
            self.transition(ServiceState::Stopped, None);
        }
        Ok(())
    }

    /// `Stopped → Starting → Running`
    pub async fn start(&self) -> Result<(), AppError> {
        let mut instance = self.instance.lock().await;
        self.start_locked(&mut instance).await
    }

    async fn start_locked(&self, instance: &mut Instance) -> Result<(), AppError> {
        match self.status() {
            ServiceState::Running | ServiceState::Starting => {
                return Err(AppError::AlreadyRunning)
            }
            // A failed engine must be rebuilt through `initialize`
            ServiceState::Error => return Err(AppError::NotInitialized),
            ServiceState::Stopped | ServiceState::Stopping => {}
        }
        let engine = instance.engine.as_mut().ok_or(AppError::NotInitialized)?;

        self.transition(ServiceState::Starting, None);
        match engine.start().await {
            Ok(()) => {
                self.transition(ServiceState::Running, None);
                Ok(())
            }
            Err(e) => {
                self.transition(ServiceState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Graceful shutdown; falls back to a hard stop when the engine cannot
    /// say goodbye to its peers
    pub async fn soft_stop(&self) -> Result<(), AppError> {
        let mut instance = self.instance.lock().await;
        self.soft_stop_locked(&mut instance).await
    }

    async fn soft_stop_locked(&self, instance: &mut Instance) -> Result<(), AppError> {
        let engine = self.running_engine(instance)?;

        self.transition(ServiceState::Stopping, None);
        match engine.soft_stop().await {
            Ok(()) => {
                self.transition(ServiceState::Stopped, None);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Graceful stop failed, forcing shutdown: {}", e);
                self.hard_stop(engine).await
            }
        }
    }

    /// Hard shutdown
    pub async fn stop(&self) -> Result<(), AppError> {
        let mut instance = self.instance.lock().await;
        let engine = self.running_engine(&mut instance)?;
        self.transition(ServiceState::Stopping, None);
        self.hard_stop(engine).await
    }

    async fn hard_stop(&self, engine: &mut Box<dyn Engine>) -> Result<(), AppError> {
        match engine.stop().await {
            Ok(()) => {
                self.transition(ServiceState::Stopped, None);
                Ok(())
            }
            Err(e) => {
                self.transition(ServiceState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn running_engine<'a>(
        &self,
        instance: &'a mut Instance,
    ) -> Result<&'a mut Box<dyn Engine>, AppError> {
        let state = self.status();
        if state != ServiceState::Running {
            return Err(AppError::NotRunning(state));
        }
        instance
            .engine
            .as_mut()
            .ok_or(AppError::NotRunning(state))
    }

    /// Drop the engine and release the storage file
    pub async fn close(&self) -> Result<(), AppError> {
        let mut instance = self.instance.lock().await;
        self.close_locked(&mut instance).await
    }

    async fn close_locked(&self, instance: &mut Instance) -> Result<(), AppError> {
        match self.status() {
            ServiceState::Running | ServiceState::Starting | ServiceState::Stopping => {
                return Err(AppError::ResourceBusy(
                    "service must be stopped before it is closed".to_string(),
                ))
            }
            ServiceState::Error => {
                self.discard_locked(instance).await;
                self.transition(ServiceState::Stopped, None);
            }
            ServiceState::Stopped => {
                instance.engine = None;
                if let Some(storage) = instance.storage.take() {
                    storage.release();
                }
                self.record_instance(instance);
            }
        }
        tracing::info!("Service closed");
        Ok(())
    }

    /// Tear down an engine whose state is unknown
    async fn discard_locked(&self, instance: &mut Instance) {
        if let Some(mut engine) = instance.engine.take() {
            if let Err(e) = engine.stop().await {
                tracing::debug!("Stopping failed engine: {}", e);
            }
        }
        if let Some(storage) = instance.storage.take() {
            storage.release();
        }
        self.record_instance(instance);
    }

    /// Stop if running, rebuild from the current configuration and start
    pub async fn restart(&self) -> Result<(), AppError> {
        let mut instance = self.instance.lock().await;
        if self.status() == ServiceState::Running {
            self.soft_stop_locked(&mut instance).await?;
        }
        self.close_locked(&mut instance).await?;
        self.initialize_locked(&mut instance).await?;
        self.start_locked(&mut instance).await
    }

    /// Swap the peer set of the running engine without restarting it.
    ///
    /// All or nothing: every URI is validated before the engine is touched,
    /// and if the engine rejects the new set the previous one is put back.
    /// The accepted list, including disabled entries, is saved to the config.
    pub async fn hot_reload_peers(&self, peers: Vec<ConfiguredPeer>) -> Result<(), AppError> {
        let enabled: Vec<String> = peers
            .iter()
            .filter(|peer| peer.enabled)
            .map(|peer| peer.uri.trim().to_string())
            .collect();
        if enabled.is_empty() {
            return Err(AppError::NoPeersEnabled);
        }
        for uri in &enabled {
            parse_peer_uri(uri)?;
        }

        let mut instance = self.instance.lock().await;
        let engine = self.running_engine(&mut instance)?;
        let previous = self.config.snapshot().enabled_peers();

        if let Err(e) = engine.set_peers(&enabled).await {
            tracing::warn!("Peer reload rejected by engine, restoring previous set: {}", e);
            if let Err(rollback) = engine.set_peers(&previous).await {
                tracing::error!("Failed to restore previous peers: {}", rollback);
            }
            return Err(e);
        }

        self.config.update(|config| config.peers = peers)?;
        tracing::info!("Hot-reloaded {} enabled peers", enabled.len());
        Ok(())
    }

    /// Change the message size policy of the running engine
    pub async fn hot_reload_max_message_size(&self, bytes: u64) -> Result<(), AppError> {
        if bytes == 0 {
            return Err(AppError::ConfigError(
                "maximum message size must be positive".to_string(),
            ));
        }

        let mut instance = self.instance.lock().await;
        let engine = self.running_engine(&mut instance)?;
        engine.set_max_message_size(bytes)?;
        self.config.update(|config| config.max_message_size = bytes)?;
        tracing::info!("Maximum message size set to {} bytes", bytes);
        Ok(())
    }

    /// Live metrics for every configured peer, including disabled and
    /// disconnected ones, followed by any peers only the engine knows
    pub async fn peer_stats(&self) -> Vec<PeerRuntimeStats> {
        let configured = self.config.snapshot().peers;
        let mut live = {
            let instance = self.instance.lock().await;
            instance
                .engine
                .as_ref()
                .map(|engine| engine.peer_stats())
                .unwrap_or_default()
        };

        let mut merged: Vec<PeerRuntimeStats> = configured
            .iter()
            .map(|peer| {
                let uri = peer.uri.trim();
                match live.iter().position(|stats| stats.address == uri) {
                    Some(index) => {
                        let mut stats = live.swap_remove(index);
                        stats.enabled = peer.enabled;
                        stats
                    }
                    None => PeerRuntimeStats::inactive(uri, peer.enabled),
                }
            })
            .collect();
        merged.extend(live);
        merged
    }
}
