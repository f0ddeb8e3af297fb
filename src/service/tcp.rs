use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use super::engine::{Engine, EngineConfig, EngineFactory};
use crate::{
    error::AppError,
    models::{PeerRuntimeStats, Protocol},
    utils::{parse_peer_uri, PeerEndpoint},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const SOFT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
// How long a closing link waits for the peer to acknowledge with its own FIN
const LINGER: Duration = Duration::from_secs(1);
const READ_BUFFER: usize = 16 * 1024;

/// Builds [`TcpLinkEngine`] instances
#[derive(Debug, Default, Clone)]
pub struct TcpEngineFactory;

#[async_trait]
impl EngineFactory for TcpEngineFactory {
    async fn create(&self, config: &EngineConfig) -> Result<Box<dyn Engine>, AppError> {
        Ok(Box::new(TcpLinkEngine::new(config.clone())))
    }
}

#[derive(Debug, Default)]
struct LinkStats {
    connected_since: Option<Instant>,
    latency_ms: Option<u64>,
    rx_bytes: u64,
    tx_bytes: u64,
    last_error: Option<String>,
    last_sample: Option<(Instant, u64, u64)>,
}

impl LinkStats {
    fn snapshot(&mut self, address: &str) -> PeerRuntimeStats {
        let now = Instant::now();
        let (rx_rate, tx_rate) = match self.last_sample {
            Some((at, rx, tx)) => {
                let secs = now.duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (
                        self.rx_bytes.saturating_sub(rx) as f64 / secs,
                        self.tx_bytes.saturating_sub(tx) as f64 / secs,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.last_sample = Some((now, self.rx_bytes, self.tx_bytes));

        PeerRuntimeStats {
            address: address.to_string(),
            enabled: true,
            connected: self.connected_since.is_some(),
            latency_ms: self.latency_ms,
            rx_bytes: self.rx_bytes,
            tx_bytes: self.tx_bytes,
            rx_rate,
            tx_rate,
            uptime_sec: self
                .connected_since
                .map(|since| since.elapsed().as_secs())
                .unwrap_or(0),
            last_error: self.last_error.clone(),
        }
    }
}

struct PeerLink {
    stats: Arc<Mutex<LinkStats>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Minimal link-layer engine: listens on `tcp://` addresses and keeps one
/// outbound TCP link per configured `tcp://` peer. Mail handling is left to
/// the full engine; this one only maintains links and their metrics.
pub struct TcpLinkEngine {
    config: EngineConfig,
    peers: Vec<String>,
    max_message_size: Arc<AtomicU64>,
    shutdown: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
    links: HashMap<String, PeerLink>,
    running: bool,
}

impl TcpLinkEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            peers: config.peers.clone(),
            max_message_size: Arc::new(AtomicU64::new(config.max_message_size)),
            config,
            shutdown: CancellationToken::new(),
            listeners: Vec::new(),
            links: HashMap::new(),
            running: false,
        }
    }

    pub fn max_message_size(&self) -> u64 {
        self.max_message_size.load(Ordering::Relaxed)
    }

    fn spawn_link(&mut self, uri: &str) {
        let stats = Arc::new(Mutex::new(LinkStats::default()));
        let stop = self.shutdown.child_token();
        let task = tokio::spawn(run_link(uri.to_string(), stats.clone(), stop.clone()));
        self.links.insert(uri.to_string(), PeerLink { stats, stop, task });
    }

    fn abort_all(&mut self) {
        self.shutdown.cancel();
        for handle in self.listeners.drain(..) {
            handle.abort();
        }
        for (_, link) in self.links.drain() {
            link.task.abort();
        }
        self.running = false;
    }
}

impl Drop for TcpLinkEngine {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[async_trait]
impl Engine for TcpLinkEngine {
    async fn start(&mut self) -> Result<(), AppError> {
        if self.running {
            return Err(AppError::AlreadyRunning);
        }
        self.shutdown = CancellationToken::new();

        let mut endpoints = Vec::with_capacity(self.config.listen.len());
        for uri in &self.config.listen {
            let endpoint = parse_peer_uri(uri)?;
            if endpoint.protocol != Protocol::Tcp {
                return Err(AppError::EngineError(format!(
                    "cannot listen on {}: only tcp:// is supported",
                    uri
                )));
            }
            endpoints.push((uri.clone(), endpoint));
        }

        for (uri, endpoint) in endpoints {
            let listener = match TcpListener::bind((endpoint.host.as_str(), endpoint.port)).await
            {
                Ok(listener) => listener,
                Err(e) => {
                    self.abort_all();
                    return Err(AppError::EngineError(format!(
                        "failed to listen on {}: {}",
                        uri, e
                    )));
                }
            };
            tracing::info!("Listening for peers on {}", uri);
            self.listeners
                .push(tokio::spawn(accept_loop(listener, self.shutdown.clone())));
        }

        for uri in self.peers.clone() {
            self.spawn_link(&uri);
        }
        self.running = true;
        Ok(())
    }

    async fn soft_stop(&mut self) -> Result<(), AppError> {
        self.shutdown.cancel();

        let mut handles: Vec<JoinHandle<()>> = self.listeners.drain(..).collect();
        handles.extend(self.links.drain().map(|(_, link)| link.task));

        let drained = tokio::time::timeout(SOFT_STOP_TIMEOUT, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;

        self.running = false;
        if drained.is_err() {
            for handle in &handles {
                handle.abort();
            }
            return Err(AppError::EngineError(
                "peers did not close their links in time".to_string(),
            ));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AppError> {
        self.abort_all();
        Ok(())
    }

    async fn set_peers(&mut self, peers: &[String]) -> Result<(), AppError> {
        for uri in peers {
            parse_peer_uri(uri)?;
        }

        if self.running {
            let removed: Vec<String> = self
                .links
                .keys()
                .filter(|uri| !peers.contains(uri))
                .cloned()
                .collect();
            for uri in removed {
                if let Some(link) = self.links.remove(&uri) {
                    // The task closes the link gracefully on its own
                    link.stop.cancel();
                    tracing::info!("Disconnecting removed peer {}", uri);
                }
            }
            for uri in peers {
                if !self.links.contains_key(uri) {
                    self.spawn_link(uri);
                }
            }
        }

        self.peers = peers.to_vec();
        Ok(())
    }

    fn set_max_message_size(&mut self, bytes: u64) -> Result<(), AppError> {
        self.max_message_size.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn peer_stats(&self) -> Vec<PeerRuntimeStats> {
        self.peers
            .iter()
            .map(|uri| match self.links.get(uri) {
                Some(link) => link.stats.lock().snapshot(uri),
                None => PeerRuntimeStats::inactive(uri, true),
            })
            .collect()
    }
}

async fn accept_loop(listener: TcpListener, shutdown: CancellationToken) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!("Accepted peer connection from {}", remote);
                    let stop = shutdown.clone();
                    handlers.spawn(async move {
                        if let Err(e) = pump(stream, &stop, None).await {
                            tracing::debug!("Inbound link from {} ended: {}", remote, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Failed to accept peer connection: {}", e),
            }
        }
    }
    drop(listener);
    while handlers.join_next().await.is_some() {}
}

async fn run_link(uri: String, stats: Arc<Mutex<LinkStats>>, stop: CancellationToken) {
    let endpoint = match parse_peer_uri(&uri) {
        Ok(endpoint) if endpoint.protocol == Protocol::Tcp => endpoint,
        Ok(endpoint) => {
            stats.lock().last_error = Some(format!(
                "{} links are not supported by the TCP link engine",
                endpoint.protocol
            ));
            return;
        }
        Err(e) => {
            stats.lock().last_error = Some(e.to_string());
            return;
        }
    };

    loop {
        let started = Instant::now();
        let attempt = tokio::select! {
            _ = stop.cancelled() => return,
            attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect(&endpoint)) => attempt,
        };

        match attempt {
            Ok(Ok(stream)) => {
                {
                    let mut stats = stats.lock();
                    stats.connected_since = Some(Instant::now());
                    stats.latency_ms = Some(started.elapsed().as_millis() as u64);
                    stats.last_error = None;
                }
                tracing::info!("Connected to peer {}", uri);

                let result = pump(stream, &stop, Some(&stats)).await;
                stats.lock().connected_since = None;
                match result {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::info!("Link to {} dropped: {}", uri, e);
                        stats.lock().last_error = Some(e);
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::debug!("Failed to connect to {}: {}", uri, e);
                stats.lock().last_error = Some(e.to_string());
            }
            Err(_) => {
                stats.lock().last_error = Some("connect timed out".to_string());
            }
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn connect(endpoint: &PeerEndpoint) -> std::io::Result<TcpStream> {
    TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await
}

/// Read until the link ends. On `stop` the link is closed gracefully: our
/// FIN goes out first and the peer gets a moment to answer with its own.
async fn pump(
    mut stream: TcpStream,
    stop: &CancellationToken,
    stats: Option<&Mutex<LinkStats>>,
) -> Result<(), String> {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = stream.shutdown().await;
                let _ = tokio::time::timeout(LINGER, async {
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                })
                .await;
                return Ok(());
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => return Err("closed by peer".to_string()),
                Ok(n) => {
                    if let Some(stats) = stats {
                        stats.lock().rx_bytes += n as u64;
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}
