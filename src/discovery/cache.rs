use crate::{
    error::AppError,
    models::{CachedDiscoveryResult, DiscoveredPeer, Protocol},
    utils::write_atomic,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk shape of one cached peer
#[derive(Debug, Serialize, Deserialize)]
struct CachedPeerRecord {
    address: String,
    protocol: Protocol,
    region: Option<String>,
    rtt: u64,
}

/// On-disk shape of the cache file
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    peers: Vec<CachedPeerRecord>,
    discovered_at: DateTime<Utc>,
}

/// Durable single-slot store for the last completed discovery scan
#[derive(Debug)]
pub struct DiscoveryCache {
    path: PathBuf,
    // Serializes writers; readers only see whole files thanks to rename
    write_lock: Mutex<()>,
}

impl DiscoveryCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the cached result
    pub fn save(&self, peers: &[DiscoveredPeer], timestamp: DateTime<Utc>) -> Result<(), AppError> {
        let file = CacheFile {
            peers: peers
                .iter()
                .map(|peer| CachedPeerRecord {
                    address: peer.address.clone(),
                    protocol: peer.protocol,
                    region: peer.region.clone(),
                    rtt: peer.rtt_ms,
                })
                .collect(),
            discovered_at: timestamp,
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let _guard = self.write_lock.lock();
        write_atomic(&self.path, &json)?;

        tracing::debug!(
            "Cached {} discovered peers at {}",
            peers.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Last saved result, or `None` when nothing usable is cached
    pub fn load(&self) -> Result<Option<CachedDiscoveryResult>, AppError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: CacheFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                // A damaged cache only costs a rescan
                tracing::warn!(
                    "Ignoring unreadable discovery cache {}: {}",
                    self.path.display(),
                    e
                );
                return Ok(None);
            }
        };

        let peers = file
            .peers
            .into_iter()
            .map(|record| DiscoveredPeer {
                address: record.address,
                protocol: record.protocol,
                region: record.region,
                rtt_ms: record.rtt,
                discovered_at: file.discovered_at,
            })
            .collect();

        Ok(Some(CachedDiscoveryResult {
            peers,
            timestamp: file.discovered_at,
        }))
    }

    /// Forget the cached result
    pub fn clear(&self) -> Result<(), AppError> {
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("Cleared discovery cache");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
