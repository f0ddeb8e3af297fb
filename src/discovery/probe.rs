use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::utils::{create_http_client, insecure_quic_config, insecure_tls_config};
use crate::{
    error::AppError,
    models::{CandidatePeer, Protocol},
    utils::{parse_peer_uri, websocket_http_url, PeerEndpoint},
};

// Sample key from RFC 6455; the probe never reads the upgraded stream
const WEBSOCKET_PROBE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// Why a single probe did not succeed. Never leaves the coordinator.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ProbeError::Refused(err.to_string()),
            std::io::ErrorKind::TimedOut => ProbeError::Timeout,
            _ => ProbeError::Unreachable(err.to_string()),
        }
    }
}

/// One handshake against one candidate, returning the time it took
#[async_trait]
pub trait PeerProbe: Send + Sync {
    async fn probe(
        &self,
        candidate: &CandidatePeer,
        timeout: Duration,
    ) -> Result<Duration, ProbeError>;
}

/// Probe that performs real handshakes over the network
pub struct NetworkProbe {
    http: Client,
    tls: TlsConnector,
    quic: quinn::ClientConfig,
}

impl NetworkProbe {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let http = create_http_client(timeout)?;
        let tls = TlsConnector::from(Arc::new(insecure_tls_config(&[])?));
        let quic = insecure_quic_config(&[])?;
        Ok(Self { http, tls, quic })
    }

    async fn probe_tcp(&self, endpoint: &PeerEndpoint) -> Result<Duration, ProbeError> {
        let addr = resolve(endpoint).await?;
        let started = Instant::now();
        let stream = TcpStream::connect(addr).await?;
        let rtt = started.elapsed();
        drop(stream);
        Ok(rtt)
    }

    async fn probe_tls(&self, endpoint: &PeerEndpoint) -> Result<Duration, ProbeError> {
        let addr = resolve(endpoint).await?;
        let server_name = rustls::pki_types::ServerName::try_from(
            endpoint.server_name().to_string(),
        )
        .map_err(|e| ProbeError::InvalidCandidate(e.to_string()))?;

        let started = Instant::now();
        let stream = TcpStream::connect(addr).await?;
        let tls_stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| ProbeError::Handshake(e.to_string()))?;
        let rtt = started.elapsed();
        drop(tls_stream);
        Ok(rtt)
    }

    async fn probe_quic(&self, endpoint: &PeerEndpoint) -> Result<Duration, ProbeError> {
        let addr = resolve(endpoint).await?;
        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let quic_endpoint = quinn::Endpoint::client(bind)?;

        let started = Instant::now();
        let connecting = quic_endpoint
            .connect_with(self.quic.clone(), addr, endpoint.server_name())
            .map_err(|e| ProbeError::Handshake(e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| ProbeError::Handshake(e.to_string()))?;
        let rtt = started.elapsed();

        connection.close(0u32.into(), b"probe");
        quic_endpoint.close(0u32.into(), b"probe");
        Ok(rtt)
    }

    async fn probe_websocket(&self, endpoint: &PeerEndpoint) -> Result<Duration, ProbeError> {
        let url = websocket_http_url(endpoint)
            .map_err(|e| ProbeError::InvalidCandidate(e.to_string()))?;

        let started = Instant::now();
        let response = self
            .http
            .get(url)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, WEBSOCKET_PROBE_KEY)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else if e.is_connect() {
                    ProbeError::Unreachable(e.to_string())
                } else {
                    ProbeError::Handshake(e.to_string())
                }
            })?;
        let rtt = started.elapsed();

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            Ok(rtt)
        } else {
            Err(ProbeError::Handshake(format!(
                "upgrade rejected with HTTP {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl PeerProbe for NetworkProbe {
    async fn probe(
        &self,
        candidate: &CandidatePeer,
        timeout: Duration,
    ) -> Result<Duration, ProbeError> {
        let endpoint = parse_peer_uri(&candidate.uri)
            .map_err(|e| ProbeError::InvalidCandidate(e.to_string()))?;

        let attempt = async {
            match endpoint.protocol {
                Protocol::Tcp => self.probe_tcp(&endpoint).await,
                Protocol::Tls => self.probe_tls(&endpoint).await,
                Protocol::Quic => self.probe_quic(&endpoint).await,
                Protocol::Ws | Protocol::Wss => self.probe_websocket(&endpoint).await,
            }
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ProbeError::Timeout)?
    }
}

async fn resolve(endpoint: &PeerEndpoint) -> Result<SocketAddr, ProbeError> {
    endpoint
        .resolve()
        .await
        .map_err(|e| ProbeError::Unreachable(e.to_string()))
}
