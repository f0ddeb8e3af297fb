use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;

use super::{cache::DiscoveryCache, directory::SeedDirectory, probe::PeerProbe};
use crate::{
    config::DiscoverySettings,
    error::AppError,
    models::{
        CachedDiscoveryResult, CandidatePeer, DiscoveredPeer, DiscoveryOutcome,
        DiscoveryProgress, Protocol,
    },
    notify::{Notifier, Subscription},
};

/// Which candidates a scan should probe and which results it keeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// Protocols to probe; empty means all of them
    pub protocols: Vec<Protocol>,
    /// Only probe candidates from this region (case-insensitive)
    pub region: Option<String>,
    /// Drop successful results slower than this; 0 disables the limit
    pub max_rtt_ms: u64,
}

impl Default for DiscoveryRequest {
    fn default() -> Self {
        Self {
            protocols: Protocol::ALL.to_vec(),
            region: None,
            max_rtt_ms: 0,
        }
    }
}

impl DiscoveryRequest {
    fn accepts_candidate(&self, candidate: &CandidatePeer) -> bool {
        let protocol_ok =
            self.protocols.is_empty() || self.protocols.contains(&candidate.protocol);
        let region_ok = match (&self.region, &candidate.region) {
            (None, _) => true,
            (Some(wanted), Some(region)) => wanted.eq_ignore_ascii_case(region),
            (Some(_), None) => false,
        };
        protocol_ok && region_ok
    }

    fn accepts_rtt(&self, rtt_ms: u64) -> bool {
        self.max_rtt_ms == 0 || rtt_ms <= self.max_rtt_ms
    }

    fn accepts_peer(&self, peer: &DiscoveredPeer) -> bool {
        let as_candidate = CandidatePeer {
            uri: peer.address.clone(),
            protocol: peer.protocol,
            region: peer.region.clone(),
        };
        self.accepts_candidate(&as_candidate) && self.accepts_rtt(peer.rtt_ms)
    }
}

/// State shared by the workers of one scan
#[derive(Debug)]
struct ScanShared {
    id: u64,
    token: CancellationToken,
    progress: Mutex<DiscoveryProgress>,
}

impl ScanShared {
    /// Cancel under the progress lock so no snapshot can be published after
    /// this returns
    fn cancel(&self) {
        let _progress = self.progress.lock();
        self.token.cancel();
    }
}

/// Clears the active-scan slot when a scan ends, however it ends
struct ActiveScanGuard<'a> {
    slot: &'a Mutex<Option<Arc<ScanShared>>>,
    id: u64,
}

impl Drop for ActiveScanGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|scan| scan.id) == Some(self.id) {
            *slot = None;
        }
    }
}

/// Runs bounded-concurrency reachability scans over the seed directory
pub struct DiscoveryCoordinator {
    directory: Arc<dyn SeedDirectory>,
    probe: Arc<dyn PeerProbe>,
    cache: Arc<DiscoveryCache>,
    settings: DiscoverySettings,
    progress: Notifier<DiscoveryProgress>,
    active: Mutex<Option<Arc<ScanShared>>>,
    next_scan_id: AtomicU64,
}

impl DiscoveryCoordinator {
    pub fn new(
        directory: Arc<dyn SeedDirectory>,
        probe: Arc<dyn PeerProbe>,
        cache: Arc<DiscoveryCache>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            directory,
            probe,
            cache,
            settings,
            progress: Notifier::default(),
            active: Mutex::new(None),
            next_scan_id: AtomicU64::new(1),
        }
    }

    /// Listen to progress snapshots of every scan run by this coordinator
    pub fn subscribe_progress(&self) -> Subscription<DiscoveryProgress> {
        self.progress.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Stop the scan in flight, if any. In-flight probes finish in the
    /// background of that scan; this call never waits for them.
    pub fn cancel(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(scan) => {
                tracing::info!("Cancelling discovery scan {}", scan.id);
                scan.cancel();
                true
            }
            None => false,
        }
    }

    /// Probe every matching candidate and report the reachable ones, fastest
    /// first. Starting a scan cancels the previous one.
    pub async fn find_available_peers(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryOutcome, AppError> {
        let scan = self.begin_scan();
        let _guard = ActiveScanGuard {
            slot: &self.active,
            id: scan.id,
        };

        let candidates: Vec<CandidatePeer> = self
            .directory
            .candidates()
            .await?
            .into_iter()
            .filter(|candidate| request.accepts_candidate(candidate))
            .collect();

        if scan.token.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let total = candidates.len();
        if total == 0 {
            tracing::info!("Discovery scan {} has no candidates", scan.id);
            return Ok(DiscoveryOutcome::default());
        }

        let workers = self.settings.workers.max(1).min(total);
        tracing::info!(
            "Starting discovery scan {} over {} candidates with {} workers",
            scan.id,
            total,
            workers
        );

        {
            let mut progress = scan.progress.lock();
            progress.total = total;
            if !scan.token.is_cancelled() {
                self.progress.publish(*progress);
            }
        }

        let queue = Mutex::new(candidates.into_iter().enumerate().collect::<VecDeque<_>>());
        let results = Mutex::new(Vec::new());

        let pool = (0..workers).map(|_| self.run_worker(&scan, request, &queue, &results));
        futures::future::join_all(pool).await;

        let mut found = results.into_inner();
        found.sort_by(|a, b| a.1.rtt_ms.cmp(&b.1.rtt_ms).then(a.0.cmp(&b.0)));
        let peers: Vec<DiscoveredPeer> = found.into_iter().map(|(_, peer)| peer).collect();
        let cancelled = scan.token.is_cancelled();

        tracing::info!(
            "Discovery scan {} {}: {} of {} candidates available",
            scan.id,
            if cancelled { "cancelled" } else { "complete" },
            peers.len(),
            total
        );

        if !cancelled {
            if let Err(e) = self.cache.save(&peers, Utc::now()) {
                tracing::warn!("Failed to cache discovery results: {}", e);
            }
        }

        Ok(DiscoveryOutcome {
            available: peers.len(),
            peers,
            total,
            cancelled,
            from_cache: false,
        })
    }

    /// Serve a fresh cached result when there is one, otherwise scan.
    /// `max_age` defaults to the configured cache TTL.
    pub async fn discover_or_cached(
        &self,
        request: &DiscoveryRequest,
        max_age: Option<ChronoDuration>,
    ) -> Result<DiscoveryOutcome, AppError> {
        let max_age = max_age.unwrap_or_else(|| self.settings.cache_ttl());

        if let Some(cached) = self.cached_result()? {
            if cached.is_fresh(max_age) {
                let peers: Vec<DiscoveredPeer> = cached
                    .peers
                    .into_iter()
                    .filter(|peer| request.accepts_peer(peer))
                    .collect();
                tracing::info!(
                    "Serving {} cached peers from {}",
                    peers.len(),
                    cached.timestamp
                );
                return Ok(DiscoveryOutcome {
                    total: peers.len(),
                    available: peers.len(),
                    peers,
                    cancelled: false,
                    from_cache: true,
                });
            }
        }

        self.find_available_peers(request).await
    }

    pub fn cached_result(&self) -> Result<Option<CachedDiscoveryResult>, AppError> {
        self.cache.load()
    }

    pub fn cached_discovered_peers(&self) -> Result<Vec<DiscoveredPeer>, AppError> {
        Ok(self
            .cache
            .load()?
            .map(|cached| cached.peers)
            .unwrap_or_default())
    }

    pub fn clear_cached_discovered_peers(&self) -> Result<(), AppError> {
        self.cache.clear()
    }

    fn begin_scan(&self) -> Arc<ScanShared> {
        let id = self.next_scan_id.fetch_add(1, Ordering::Relaxed);
        let scan = Arc::new(ScanShared {
            id,
            token: CancellationToken::new(),
            progress: Mutex::new(DiscoveryProgress {
                scan_id: id,
                ..DiscoveryProgress::default()
            }),
        });

        let mut active = self.active.lock();
        if let Some(previous) = active.replace(scan.clone()) {
            tracing::info!("Scan {} supersedes scan {}", id, previous.id);
            previous.cancel();
        }
        scan
    }

    async fn run_worker(
        &self,
        scan: &ScanShared,
        request: &DiscoveryRequest,
        queue: &Mutex<VecDeque<(usize, CandidatePeer)>>,
        results: &Mutex<Vec<(usize, DiscoveredPeer)>>,
    ) {
        let timeout = self.settings.probe_timeout();

        loop {
            if scan.token.is_cancelled() {
                break;
            }
            let next = queue.lock().pop_front();
            let Some((index, candidate)) = next else {
                break;
            };

            let rtt_ms = match tokio::time::timeout(timeout, self.probe.probe(&candidate, timeout))
                .await
            {
                Ok(Ok(rtt)) => Some(rtt.as_millis() as u64),
                Ok(Err(e)) => {
                    tracing::debug!("Probe of {} failed: {}", candidate.uri, e);
                    None
                }
                Err(_) => {
                    tracing::debug!("Probe of {} timed out", candidate.uri);
                    None
                }
            };

            let found = rtt_ms
                .filter(|rtt| request.accepts_rtt(*rtt))
                .map(|rtt_ms| DiscoveredPeer {
                    address: candidate.uri,
                    protocol: candidate.protocol,
                    region: candidate.region,
                    rtt_ms,
                    discovered_at: Utc::now(),
                });
            self.record_completion(scan, results, index, found);
        }
    }

    /// Count one finished probe, keep its peer and publish the snapshot.
    ///
    /// Once the scan is cancelled late results are dropped, so the outcome
    /// always matches the last published snapshot.
    fn record_completion(
        &self,
        scan: &ScanShared,
        results: &Mutex<Vec<(usize, DiscoveredPeer)>>,
        index: usize,
        found: Option<DiscoveredPeer>,
    ) {
        let mut progress = scan.progress.lock();
        if scan.token.is_cancelled() {
            tracing::debug!("Dropping result for candidate {} of cancelled scan", index);
            return;
        }
        progress.current += 1;
        if let Some(peer) = found {
            progress.available_count += 1;
            results.lock().push((index, peer));
        }
        self.progress.publish(*progress);
    }
}
