// General utility functions for peer URIs and files
use std::{
    fs,
    io::{self, Write},
    net::SocketAddr,
    path::Path,
};

use url::{Host, Url};

use crate::{error::AppError, models::Protocol};

/// A peer URI broken into the parts a dialer needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub protocol: Protocol,
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
    /// TLS server name override from the `sni` query parameter
    pub sni: Option<String>,
    pub url: Url,
}

impl PeerEndpoint {
    /// Name presented during a TLS or QUIC handshake
    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.host)
    }

    /// Resolve the endpoint to its first socket address
    pub async fn resolve(&self) -> Result<SocketAddr, AppError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs
            .next()
            .ok_or_else(|| AppError::InvalidUri(format!("{} did not resolve", self.url)))
    }
}

/// Parse a peer URI such as `tls://198.51.100.7:443?sni=relay.example`
pub fn parse_peer_uri(uri: &str) -> Result<PeerEndpoint, AppError> {
    let trimmed = uri.trim();
    let url = Url::parse(trimmed).map_err(|e| AppError::InvalidUri(format!("{}: {}", uri, e)))?;

    let protocol = Protocol::from_scheme(url.scheme()).ok_or_else(|| {
        AppError::InvalidUri(format!("{}: unsupported scheme {}", uri, url.scheme()))
    })?;

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        _ => return Err(AppError::InvalidUri(format!("{}: missing host", uri))),
    };

    let port = url
        .port()
        .or_else(|| default_port(protocol))
        .ok_or_else(|| AppError::InvalidUri(format!("{}: missing port", uri)))?;

    let sni = url
        .query_pairs()
        .find(|(key, _)| key == "sni")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty());

    Ok(PeerEndpoint {
        protocol,
        host,
        port,
        sni,
        url,
    })
}

/// Only the WebSocket schemes have a well-known port
fn default_port(protocol: Protocol) -> Option<u16> {
    match protocol {
        Protocol::Ws => Some(80),
        Protocol::Wss => Some(443),
        Protocol::Tcp | Protocol::Tls | Protocol::Quic => None,
    }
}

/// Rewrite a `ws`/`wss` peer URI into the HTTP URL used for the upgrade request
pub fn websocket_http_url(endpoint: &PeerEndpoint) -> Result<Url, AppError> {
    let scheme = match endpoint.protocol {
        Protocol::Ws => "http",
        Protocol::Wss => "https",
        other => {
            return Err(AppError::InvalidUri(format!(
                "{} is not a websocket URI ({})",
                endpoint.url, other
            )))
        }
    };

    // Non-special schemes cannot be switched to http in place, so rebuild
    let host = if endpoint.host.contains(':') {
        format!("[{}]", endpoint.host)
    } else {
        endpoint.host.clone()
    };
    let path = match endpoint.url.path() {
        "" => "/",
        path => path,
    };
    let rebuilt = format!("{}://{}:{}{}", scheme, host, endpoint.port, path);
    Url::parse(&rebuilt).map_err(|e| AppError::InvalidUri(format!("{}: {}", rebuilt, e)))
}

/// Replace `path` with `bytes` via a sibling temp file and a rename, so
/// readers see either the old or the new contents
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("mailmesh");
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
