use async_trait::async_trait;
use std::path::PathBuf;

use crate::{config::AppConfig, error::AppError, models::PeerRuntimeStats};

/// What an engine instance is bound to when it is built
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub private_key: Option<String>,
    pub listen: Vec<String>,
    /// Enabled peer URIs only
    pub peers: Vec<String>,
    pub storage_path: PathBuf,
    pub max_message_size: u64,
    pub smtp_address: String,
    pub imap_address: String,
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            private_key: config.private_key.clone(),
            listen: config.listen.clone(),
            peers: config.enabled_peers(),
            storage_path: config.storage_path.clone(),
            max_message_size: config.max_message_size,
            smtp_address: config.smtp_address.clone(),
            imap_address: config.imap_address.clone(),
        }
    }
}

/// The embedded mail/overlay engine as seen by the service manager.
///
/// Calls are never concurrent: the manager serializes every operation on
/// one instance.
#[async_trait]
pub trait Engine: Send {
    /// Open listeners and begin connecting to peers
    async fn start(&mut self) -> Result<(), AppError>;

    /// Tell connected peers we are leaving, then close sockets
    async fn soft_stop(&mut self) -> Result<(), AppError>;

    /// Close listeners and connections immediately
    async fn stop(&mut self) -> Result<(), AppError>;

    /// Replace the active peer set of a running engine
    async fn set_peers(&mut self, peers: &[String]) -> Result<(), AppError>;

    fn set_max_message_size(&mut self, bytes: u64) -> Result<(), AppError>;

    /// Live metrics for the peers the engine knows about
    fn peer_stats(&self) -> Vec<PeerRuntimeStats>;
}

/// Builds engine instances; one per `Initialize`
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, config: &EngineConfig) -> Result<Box<dyn Engine>, AppError>;
}
