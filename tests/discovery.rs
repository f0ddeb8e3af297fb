/// Integration tests: discovery scans against scripted probes.
///
/// Probes sleep for their scripted RTT on a paused tokio clock, so the
/// timing scenarios run instantly and deterministically.
use async_trait::async_trait;
use mailmesh::{
    config::DiscoverySettings,
    discovery::{
        DiscoveryCache, DiscoveryCoordinator, DiscoveryRequest, PeerProbe, ProbeError,
        StaticSeedDirectory,
    },
    models::{CandidatePeer, DiscoveryProgress, Protocol},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Answers after the scripted RTT; unknown URIs never answer
struct ScriptedProbe {
    rtts: HashMap<String, Result<u64, ()>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(entries: &[(&str, Result<u64, ()>)]) -> Self {
        Self {
            rtts: entries
                .iter()
                .map(|(uri, rtt)| (uri.to_string(), *rtt))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PeerProbe for ScriptedProbe {
    async fn probe(
        &self,
        candidate: &CandidatePeer,
        _timeout: Duration,
    ) -> Result<Duration, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.rtts.get(&candidate.uri) {
            Some(Ok(ms)) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(Duration::from_millis(*ms))
            }
            Some(Err(())) => Err(ProbeError::Refused("scripted".to_string())),
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProbeError::Timeout)
            }
        }
    }
}

fn candidate(uri: &str, region: Option<&str>) -> CandidatePeer {
    let protocol = Protocol::from_scheme(uri.split("://").next().unwrap()).unwrap();
    CandidatePeer {
        uri: uri.to_string(),
        protocol,
        region: region.map(str::to_string),
    }
}

struct Harness {
    coordinator: Arc<DiscoveryCoordinator>,
    probe: Arc<ScriptedProbe>,
    cache: Arc<DiscoveryCache>,
    _dir: tempfile::TempDir,
}

fn harness(candidates: Vec<CandidatePeer>, probe: ScriptedProbe, workers: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(DiscoveryCache::new(dir.path().join("cache.json")));
    let probe = Arc::new(probe);
    let settings = DiscoverySettings {
        workers,
        probe_timeout_ms: 2000,
        ..DiscoverySettings::default()
    };
    let coordinator = Arc::new(DiscoveryCoordinator::new(
        Arc::new(StaticSeedDirectory::new(candidates)),
        probe.clone(),
        cache.clone(),
        settings,
    ));
    Harness {
        coordinator,
        probe,
        cache,
        _dir: dir,
    }
}

fn slow_candidates(count: usize, rtt_ms: u64) -> (Vec<CandidatePeer>, ScriptedProbe) {
    let uris: Vec<String> = (0..count)
        .map(|i| format!("tcp://198.51.100.{}:9000", i + 1))
        .collect();
    let candidates = uris.iter().map(|uri| candidate(uri, None)).collect();
    let entries: Vec<(&str, Result<u64, ()>)> =
        uris.iter().map(|uri| (uri.as_str(), Ok(rtt_ms))).collect();
    (candidates, ScriptedProbe::new(&entries))
}

#[tokio::test(start_paused = true)]
async fn two_of_five_respond_in_time() {
    let candidates = vec![
        candidate("tls://198.51.100.1:443", Some("eu")),
        candidate("tcp://198.51.100.2:9000", Some("eu")),
        candidate("quic://198.51.100.3:443", Some("us")),
        candidate("tcp://198.51.100.4:9000", Some("us")),
        candidate("wss://198.51.100.5:443", Some("asia")),
    ];
    let probe = ScriptedProbe::new(&[
        ("tls://198.51.100.1:443", Ok(5000)),
        ("tcp://198.51.100.2:9000", Ok(450)),
        ("quic://198.51.100.3:443", Ok(3000)),
        ("tcp://198.51.100.4:9000", Ok(120)),
    ]);
    let h = harness(candidates, probe, 4);

    let request = DiscoveryRequest {
        max_rtt_ms: 2000,
        ..DiscoveryRequest::default()
    };
    let outcome = h.coordinator.find_available_peers(&request).await.unwrap();

    assert_eq!(outcome.total, 5);
    assert_eq!(outcome.available, 2);
    assert_eq!(outcome.peers.len(), outcome.available);
    assert!(!outcome.cancelled);
    assert_eq!(outcome.peers[0].address, "tcp://198.51.100.4:9000");
    assert_eq!(outcome.peers[0].rtt_ms, 120);
    assert_eq!(outcome.peers[1].address, "tcp://198.51.100.2:9000");
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn max_rtt_is_applied_after_probing() {
    let candidates = vec![
        candidate("tcp://198.51.100.1:9000", None),
        candidate("tcp://198.51.100.2:9000", None),
    ];
    let probe = ScriptedProbe::new(&[
        ("tcp://198.51.100.1:9000", Ok(300)),
        ("tcp://198.51.100.2:9000", Ok(40)),
    ]);
    let h = harness(candidates, probe, 2);

    let request = DiscoveryRequest {
        max_rtt_ms: 100,
        ..DiscoveryRequest::default()
    };
    let outcome = h.coordinator.find_available_peers(&request).await.unwrap();

    assert_eq!(outcome.total, 2);
    assert_eq!(outcome.available, 1);
    assert_eq!(outcome.peers[0].address, "tcp://198.51.100.2:9000");
}

#[tokio::test(start_paused = true)]
async fn equal_rtts_keep_candidate_order() {
    let candidates = vec![
        candidate("tcp://198.51.100.7:9000", None),
        candidate("tcp://198.51.100.3:9000", None),
        candidate("tcp://198.51.100.5:9000", None),
    ];
    let probe = ScriptedProbe::new(&[
        ("tcp://198.51.100.7:9000", Ok(50)),
        ("tcp://198.51.100.3:9000", Ok(50)),
        ("tcp://198.51.100.5:9000", Ok(10)),
    ]);
    let h = harness(candidates, probe, 3);

    let outcome = h
        .coordinator
        .find_available_peers(&DiscoveryRequest::default())
        .await
        .unwrap();

    let order: Vec<&str> = outcome.peers.iter().map(|p| p.address.as_str()).collect();
    assert_eq!(
        order,
        vec![
            "tcp://198.51.100.5:9000",
            "tcp://198.51.100.7:9000",
            "tcp://198.51.100.3:9000",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failures_count_toward_progress_but_not_availability() {
    let candidates = vec![
        candidate("tcp://198.51.100.1:9000", None),
        candidate("tcp://198.51.100.2:9000", None),
        candidate("tcp://198.51.100.3:9000", None),
    ];
    let probe = ScriptedProbe::new(&[
        ("tcp://198.51.100.1:9000", Err(())),
        ("tcp://198.51.100.2:9000", Ok(80)),
        ("tcp://198.51.100.3:9000", Err(())),
    ]);
    let h = harness(candidates, probe, 1);
    let mut progress = h.coordinator.subscribe_progress();

    let outcome = h
        .coordinator
        .find_available_peers(&DiscoveryRequest::default())
        .await
        .unwrap();
    assert_eq!(outcome.available, 1);

    let events: Vec<DiscoveryProgress> = progress.drain();
    // Initial snapshot announces the total, then one per probe
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].current, 0);
    assert_eq!(events[0].total, 3);
    for pair in events.windows(2) {
        assert!(pair[1].current > pair[0].current);
        assert!(pair[1].available_count >= pair[0].available_count);
    }
    let last = events.last().unwrap();
    assert_eq!(last.current, 3);
    assert_eq!(last.available_count, 1);
    assert!(last.available_count <= last.total);
}

#[tokio::test(start_paused = true)]
async fn protocol_and_region_filters_shrink_the_candidate_set() {
    let candidates = vec![
        candidate("tls://198.51.100.1:443", Some("Germany")),
        candidate("tcp://198.51.100.2:9000", Some("Germany")),
        candidate("tls://198.51.100.3:443", Some("France")),
    ];
    let probe = ScriptedProbe::new(&[
        ("tls://198.51.100.1:443", Ok(20)),
        ("tcp://198.51.100.2:9000", Ok(20)),
        ("tls://198.51.100.3:443", Ok(20)),
    ]);
    let h = harness(candidates, probe, 4);

    let request = DiscoveryRequest {
        protocols: vec![Protocol::Tls],
        region: Some("germany".to_string()),
        max_rtt_ms: 0,
    };
    let outcome = h.coordinator.find_available_peers(&request).await.unwrap();

    assert_eq!(outcome.total, 1);
    assert_eq!(outcome.peers[0].address, "tls://198.51.100.1:443");
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_candidate_set_returns_immediately() {
    let h = harness(Vec::new(), ScriptedProbe::new(&[]), 4);
    let mut progress = h.coordinator.subscribe_progress();

    let outcome = h
        .coordinator
        .find_available_peers(&DiscoveryRequest::default())
        .await
        .unwrap();

    assert_eq!(outcome.total, 0);
    assert_eq!(outcome.available, 0);
    assert!(outcome.peers.is_empty());
    assert!(progress.drain().is_empty());
    assert!(!h.coordinator.is_scanning());
    // Nothing worth caching
    assert!(h.cache.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn same_address_under_two_protocols_is_two_candidates() {
    let candidates = vec![
        candidate("tcp://198.51.100.9:443", None),
        candidate("tls://198.51.100.9:443", None),
    ];
    let probe = ScriptedProbe::new(&[
        ("tcp://198.51.100.9:443", Ok(30)),
        ("tls://198.51.100.9:443", Ok(60)),
    ]);
    let h = harness(candidates, probe, 2);

    let outcome = h
        .coordinator
        .find_available_peers(&DiscoveryRequest::default())
        .await
        .unwrap();

    assert_eq!(outcome.total, 2);
    assert_eq!(outcome.available, 2);
    assert_eq!(outcome.peers[0].protocol, Protocol::Tcp);
    assert_eq!(outcome.peers[1].protocol, Protocol::Tls);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_dispatch_and_progress() {
    let (candidates, probe) = slow_candidates(10, 500);
    let h = harness(candidates, probe, 2);
    let mut progress = h.coordinator.subscribe_progress();

    let coordinator = h.coordinator.clone();
    let scan = tokio::spawn(async move {
        coordinator
            .find_available_peers(&DiscoveryRequest::default())
            .await
    });

    // Let the first pair of probes finish
    let mut last = loop {
        let event = progress.recv().await.unwrap();
        if event.current >= 2 {
            break event;
        }
    };
    assert!(h.coordinator.cancel());
    // Whatever was published before cancel returned is allowed to be buffered
    if let Some(event) = progress.drain().pop() {
        last = event;
    }

    let outcome = scan.await.unwrap().unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.total, 10);
    assert!(outcome.available < 10);
    assert_eq!(outcome.peers.len(), outcome.available);
    // Probes finishing after cancel are not counted
    assert_eq!(outcome.available, last.available_count);
    // At most the in-flight pair ran after cancellation
    assert!(h.probe.calls.load(Ordering::SeqCst) <= 4);

    assert!(progress.try_recv().is_none());
    assert!(!h.coordinator.is_scanning());
    // Cancelled scans are not cached
    assert!(h.cache.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn a_second_scan_halts_the_first() {
    let (candidates, probe) = slow_candidates(10, 1000);
    let h = harness(candidates, probe, 1);
    let mut progress = h.coordinator.subscribe_progress();

    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move {
        coordinator
            .find_available_peers(&DiscoveryRequest::default())
            .await
    });

    let first_id = loop {
        let event = progress.recv().await.unwrap();
        if event.current >= 1 {
            break event.scan_id;
        }
    };

    let second = h
        .coordinator
        .find_available_peers(&DiscoveryRequest::default())
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert!(first.cancelled);
    assert!(!second.cancelled);
    assert_eq!(second.available, 10);

    let late: Vec<DiscoveryProgress> = progress
        .drain()
        .into_iter()
        .filter(|event| event.scan_id == first_id)
        .collect();
    assert!(late.is_empty(), "superseded scan kept reporting: {:?}", late);
}

#[tokio::test(start_paused = true)]
async fn completed_scan_is_cached_and_served() {
    let candidates = vec![
        candidate("tcp://198.51.100.1:9000", Some("eu")),
        candidate("tcp://198.51.100.2:9000", Some("us")),
    ];
    let probe = ScriptedProbe::new(&[
        ("tcp://198.51.100.1:9000", Ok(70)),
        ("tcp://198.51.100.2:9000", Ok(35)),
    ]);
    let h = harness(candidates, probe, 2);

    let scanned = h
        .coordinator
        .find_available_peers(&DiscoveryRequest::default())
        .await
        .unwrap();
    assert!(!scanned.from_cache);

    let cached = h.coordinator.cached_discovered_peers().unwrap();
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[0].address, "tcp://198.51.100.2:9000");

    let request = DiscoveryRequest {
        region: Some("EU".to_string()),
        ..DiscoveryRequest::default()
    };
    let served = h
        .coordinator
        .discover_or_cached(&request, None)
        .await
        .unwrap();
    assert!(served.from_cache);
    assert_eq!(served.available, 1);
    assert_eq!(served.peers[0].address, "tcp://198.51.100.1:9000");
    // No second round of probes
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 2);

    h.coordinator.clear_cached_discovered_peers().unwrap();
    assert!(h.coordinator.cached_discovered_peers().unwrap().is_empty());
}
