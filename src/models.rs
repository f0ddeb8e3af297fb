use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport a peer URI speaks, taken from its scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Tls,
    Quic,
    Ws,
    Wss,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Tcp,
        Protocol::Tls,
        Protocol::Quic,
        Protocol::Ws,
        Protocol::Wss,
    ];

    /// Map a URI scheme to a protocol
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "tls" => Some(Protocol::Tls),
            "quic" => Some(Protocol::Quic),
            "ws" => Some(Protocol::Ws),
            "wss" => Some(Protocol::Wss),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Quic => "quic",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::from_scheme(s).ok_or_else(|| format!("unknown protocol: {}", s))
    }
}

/// A peer taken from the seed directory, probed once per scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePeer {
    pub uri: String,
    pub protocol: Protocol,
    pub region: Option<String>,
}

impl CandidatePeer {
    /// Identity of a candidate within a scan
    pub fn key(&self) -> (&str, Protocol) {
        (self.uri.as_str(), self.protocol)
    }
}

/// A candidate that completed its handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub address: String,
    pub protocol: Protocol,
    pub region: Option<String>,
    pub rtt_ms: u64,
    pub discovered_at: DateTime<Utc>,
}

/// Snapshot of a running scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    pub scan_id: u64,
    pub current: usize,
    pub total: usize,
    pub available_count: usize,
}

/// What a call to `find_available_peers` hands back
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryOutcome {
    pub peers: Vec<DiscoveredPeer>,
    pub total: usize,
    pub available: usize,
    /// The scan was stopped before every candidate was probed. Probes
    /// still in flight at that point are not counted in `peers`.
    pub cancelled: bool,
    /// Served from the discovery cache rather than a live scan
    pub from_cache: bool,
}

/// The single slot persisted by the discovery cache
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDiscoveryResult {
    pub peers: Vec<DiscoveredPeer>,
    pub timestamp: DateTime<Utc>,
}

impl CachedDiscoveryResult {
    pub fn age(&self) -> Duration {
        Utc::now().signed_duration_since(self.timestamp)
    }

    /// Whether the result is young enough to show without rescanning
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() <= ttl
    }
}

/// Lifecycle state of the embedded service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One entry of the status notification stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: ServiceState,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// A peer as stored in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredPeer {
    pub uri: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ConfiguredPeer {
    pub fn enabled(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            enabled: true,
        }
    }
}

/// Live metrics for one configured peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRuntimeStats {
    pub address: String,
    pub enabled: bool,
    pub connected: bool,
    pub latency_ms: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_rate: f64, // bytes per second
    pub tx_rate: f64,
    pub uptime_sec: u64,
    pub last_error: Option<String>,
}

impl PeerRuntimeStats {
    /// Placeholder for a configured peer the engine reports nothing about
    pub fn inactive(address: &str, enabled: bool) -> Self {
        Self {
            address: address.to_string(),
            enabled,
            connected: false,
            latency_ms: None,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_rate: 0.0,
            tx_rate: 0.0,
            uptime_sec: 0,
            last_error: None,
        }
    }
}
