//! Shared fixtures: a scripted engine and an isolated configuration.
#![allow(dead_code)]

use async_trait::async_trait;
use mailmesh::{
    config::{ConfigOverrides, ConfigStore},
    error::AppError,
    models::{ConfiguredPeer, PeerRuntimeStats},
    service::{Engine, EngineConfig, EngineFactory},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;

/// Peer URIs containing this marker are rejected by the engine
pub const REJECTED_MARKER: &str = "reject";

/// Knobs and counters shared by a factory and every engine it builds
#[derive(Default)]
pub struct EngineScript {
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_soft_stop: AtomicBool,
    /// Engines created so far
    pub created: AtomicUsize,
    /// Engines currently started
    pub running: AtomicUsize,
    pub set_peers_in_flight: AtomicUsize,
    pub max_set_peers_in_flight: AtomicUsize,
    /// Every peer list handed to `set_peers`, in call order
    pub applied: Mutex<Vec<Vec<String>>>,
    /// Peer reported live by the engine without being configured
    pub extra_live_peer: Mutex<Option<String>>,
    /// When set, `soft_stop` parks until the gate is notified
    pub soft_stop_gate: Mutex<Option<Arc<Notify>>>,
    /// Signalled once a gated `soft_stop` is parked
    pub soft_stop_entered: Notify,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub script: Arc<EngineScript>,
}

#[async_trait]
impl EngineFactory for MockFactory {
    async fn create(&self, config: &EngineConfig) -> Result<Box<dyn Engine>, AppError> {
        if self.script.fail_create.load(Ordering::SeqCst) {
            return Err(AppError::EngineError("scripted create failure".to_string()));
        }
        self.script.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            script: self.script.clone(),
            peers: config.peers.clone(),
            max_message_size: config.max_message_size,
            started: false,
        }))
    }
}

pub struct MockEngine {
    script: Arc<EngineScript>,
    peers: Vec<String>,
    max_message_size: u64,
    started: bool,
}

impl MockEngine {
    fn halt(&mut self) {
        if self.started {
            self.started = false;
            self.script.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn start(&mut self) -> Result<(), AppError> {
        if self.script.fail_start.load(Ordering::SeqCst) {
            return Err(AppError::EngineError("scripted start failure".to_string()));
        }
        self.started = true;
        self.script.running.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn soft_stop(&mut self) -> Result<(), AppError> {
        let gate = self.script.soft_stop_gate.lock().clone();
        if let Some(gate) = gate {
            self.script.soft_stop_entered.notify_one();
            gate.notified().await;
        }
        if self.script.fail_soft_stop.load(Ordering::SeqCst) {
            return Err(AppError::EngineError("peers did not answer".to_string()));
        }
        self.halt();
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AppError> {
        self.halt();
        Ok(())
    }

    async fn set_peers(&mut self, peers: &[String]) -> Result<(), AppError> {
        let in_flight = self.script.set_peers_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .max_set_peers_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.script.set_peers_in_flight.fetch_sub(1, Ordering::SeqCst);

        self.script.applied.lock().push(peers.to_vec());
        if peers.iter().any(|peer| peer.contains(REJECTED_MARKER)) {
            return Err(AppError::EngineError("scripted peer rejection".to_string()));
        }
        self.peers = peers.to_vec();
        Ok(())
    }

    fn set_max_message_size(&mut self, bytes: u64) -> Result<(), AppError> {
        self.max_message_size = bytes;
        Ok(())
    }

    fn peer_stats(&self) -> Vec<PeerRuntimeStats> {
        let mut stats: Vec<PeerRuntimeStats> = self
            .peers
            .iter()
            .map(|peer| PeerRuntimeStats {
                connected: self.started,
                latency_ms: Some(25),
                rx_bytes: 1024,
                tx_bytes: 512,
                ..PeerRuntimeStats::inactive(peer, true)
            })
            .collect();
        if let Some(extra) = self.script.extra_live_peer.lock().clone() {
            stats.push(PeerRuntimeStats {
                connected: true,
                ..PeerRuntimeStats::inactive(&extra, true)
            });
        }
        stats
    }
}

/// Configuration in a fresh temporary directory with the given peers
pub fn config_with_peers(peers: &[&str]) -> (tempfile::TempDir, Arc<ConfigStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store =
        ConfigStore::open_with(dir.path().join("config.json"), ConfigOverrides::default())
            .unwrap();
    store
        .update(|config| {
            config.peers = peers.iter().map(|uri| ConfiguredPeer::enabled(*uri)).collect();
        })
        .unwrap();
    (dir, Arc::new(store))
}
