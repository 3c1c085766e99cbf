use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use n0_future::{boxed::BoxFuture, time::Instant};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use reachability::{
    AddressTracker, AlertInfo, AlertSurface, AlertTier, ConnectivityVerdict, Decision, Detector,
    ForwardOutcome, ForwardPort, ForwardPortStatus, IpDetector, NatClass, NatType, PeerInfo,
    PeerRegistry, PortForwardOutcome, PortForwarder, PortSet, ProbeError, ProbeHost, Protocol,
    RawReading, StatusSink, defaults,
};
use tokio::{sync::Notify, time};
use tracing_test::traced_test;

#[derive(Debug, Default)]
struct Peers {
    peers: Mutex<Vec<PeerInfo>>,
    broken: AtomicBool,
}

impl PeerRegistry for Peers {
    fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().clone()
    }

    fn valid_peer_count(&self) -> usize {
        if self.broken.load(Ordering::Relaxed) {
            panic!("peer registry is broken");
        }
        self.peers.lock().len()
    }
}

#[derive(Debug, Default)]
struct Addrs {
    direct: AtomicBool,
    readings: Mutex<Vec<RawReading>>,
}

impl AddressTracker for Addrs {
    fn local_addrs(&self) -> Vec<IpAddr> {
        Vec::new()
    }

    fn has_directly_detected_addr(&self) -> bool {
        self.direct.load(Ordering::Relaxed)
    }

    fn on_readings(&self, readings: &[RawReading]) {
        self.readings.lock().extend_from_slice(readings);
    }
}

#[derive(Debug, Default)]
struct Alerts {
    raised: Mutex<BTreeMap<AlertTier, AlertInfo>>,
}

impl AlertSurface for Alerts {
    fn raise(&self, tier: AlertTier, info: AlertInfo) {
        self.raised.lock().insert(tier, info);
    }

    fn clear(&self, tier: AlertTier) {
        self.raised.lock().remove(&tier);
    }
}

impl Alerts {
    fn tiers(&self) -> BTreeSet<AlertTier> {
        self.raised.lock().keys().copied().collect()
    }
}

#[derive(Debug, Default)]
struct Host {
    terminated: AtomicUsize,
}

impl ProbeHost for Host {
    fn terminate(&self, _probe: &Arc<dyn IpDetector>) {
        self.terminated.fetch_add(1, Ordering::Relaxed);
    }
}

/// A probe answering right away.
#[derive(Debug)]
struct Fixed {
    readings: Vec<RawReading>,
    calls: AtomicUsize,
}

impl Fixed {
    fn new(readings: Vec<RawReading>) -> Arc<Self> {
        Arc::new(Self {
            readings,
            calls: Default::default(),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl IpDetector for Fixed {
    fn detect(&self) -> BoxFuture<Result<Vec<RawReading>, ProbeError>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let readings = self.readings.clone();
        Box::pin(async move { Ok(readings) })
    }
}

/// A probe answering once released.
#[derive(Debug)]
struct Gated {
    readings: Vec<RawReading>,
    release: Arc<Notify>,
}

impl IpDetector for Gated {
    fn detect(&self) -> BoxFuture<Result<Vec<RawReading>, ProbeError>> {
        let readings = self.readings.clone();
        let release = self.release.clone();
        Box::pin(async move {
            release.notified().await;
            Ok(readings)
        })
    }
}

#[derive(Debug, Default)]
struct Forwarder {
    seen: Mutex<Vec<PortSet>>,
}

impl PortForwarder for Forwarder {
    fn forward(&self, ports: PortSet, status: StatusSink) -> BoxFuture<Result<(), ProbeError>> {
        self.seen.lock().push(ports.clone());
        Box::pin(async move {
            let statuses = ports
                .into_iter()
                .map(|port| {
                    let status = ForwardPortStatus::new(ForwardOutcome::ProbableSuccess, "upnp")
                        .with_external_port(port.port);
                    (port, status)
                })
                .collect();
            status.report(statuses);
            Ok(())
        })
    }
}

#[derive(Debug)]
struct BrokenForwarder;

impl PortForwarder for BrokenForwarder {
    fn forward(&self, ports: PortSet, _status: StatusSink) -> BoxFuture<Result<(), ProbeError>> {
        Box::pin(async move {
            if !ports.is_empty() {
                panic!("router on fire");
            }
            Ok(())
        })
    }
}

fn public(last: u8) -> IpAddr {
    IpAddr::from([81, 2, 69, last])
}

fn ports() -> PortSet {
    [
        ForwardPort::new("darknet", Protocol::Udp, 12345),
        ForwardPort::new("opennet", Protocol::Udp, 23456),
    ]
    .into_iter()
    .collect()
}

/// Lets all spawned tasks run until they are idle.
async fn settle() {
    time::sleep(Duration::from_millis(10)).await;
}

struct Setup {
    detector: Detector,
    peers: Arc<Peers>,
    addrs: Arc<Addrs>,
    alerts: Arc<Alerts>,
    host: Arc<Host>,
}

fn setup() -> Setup {
    let peers = Arc::new(Peers::default());
    let addrs = Arc::new(Addrs::default());
    let alerts = Arc::new(Alerts::default());
    let host = Arc::new(Host::default());
    let detector = Detector::builder(peers.clone(), addrs.clone())
        .alerts(alerts.clone())
        .host(host.clone())
        .spawn();
    Setup {
        detector,
        peers,
        addrs,
        alerts,
        host,
    }
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn round_publishes_verdict() {
    let Setup {
        detector,
        addrs,
        alerts,
        ..
    } = setup();
    detector.on_ports_changed(ports());

    let probe = Fixed::new(vec![RawReading::new(public(1), NatType::SymmetricNat)]);
    assert_eq!(
        detector.register_probe(probe.clone()),
        Decision::Started { runners: 1 }
    );
    settle().await;

    assert_eq!(
        detector.verdict(),
        ConnectivityVerdict::from_class(NatClass::Symmetric)
    );
    assert!(detector.verdict().suggests_port_forward());
    assert_eq!(alerts.tiers(), [AlertTier::Symmetric].into_iter().collect());
    assert_eq!(
        alerts.raised.lock()[&AlertTier::Symmetric].ports_to_forward,
        ports()
    );
    assert_eq!(addrs.readings.lock().len(), 1);
    assert_eq!(detector.metrics().rounds_succeeded.get(), 1);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn open_reading_wins_and_clears_alert() {
    let Setup {
        detector, alerts, ..
    } = setup();

    let symmetric = Fixed::new(vec![RawReading::new(public(1), NatType::SymmetricNat)]);
    detector.register_probe(symmetric);
    settle().await;
    assert_eq!(alerts.tiers(), [AlertTier::Symmetric].into_iter().collect());

    // a second probe joins the next round
    let open = Fixed::new(vec![RawReading::new(public(2), NatType::Open)]);
    let decision = detector.register_probe(open.clone());
    // no peers and a round just ended, so nothing starts yet
    assert_eq!(decision, Decision::Skipped);
    assert_eq!(open.calls(), 0);

    time::sleep(defaults::NO_PEERS_INTERVAL + defaults::TICK_INTERVAL).await;
    settle().await;
    assert_eq!(open.calls(), 1);
    assert_eq!(
        detector.verdict(),
        ConnectivityVerdict::from_class(NatClass::Open)
    );
    assert!(alerts.tiers().is_empty());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn failed_round_keeps_verdict_and_backs_off() {
    let Setup { detector, .. } = setup();
    let good = Fixed::new(vec![RawReading::new(public(1), NatType::FullCone)]);
    detector.register_probe(good.clone());
    settle().await;
    assert_eq!(
        detector.verdict(),
        ConnectivityVerdict::from_class(NatClass::FullCone)
    );
    assert!(detector.unregister_probe(&(good as Arc<dyn IpDetector>)));

    // only private or missing addresses
    let bad = Fixed::new(vec![
        RawReading::new(IpAddr::from([192, 168, 1, 1]), NatType::Open),
        RawReading::new(None, NatType::Open),
    ]);
    time::sleep(defaults::NO_PEERS_INTERVAL).await;
    detector.register_probe(bad.clone());
    settle().await;
    assert_eq!(bad.calls(), 1);
    // without probes for a while the verdict turned uncertain, but the class stays
    assert_eq!(detector.verdict().class, Some(NatClass::FullCone));
    assert_eq!(detector.evaluate(), Decision::BackingOff);

    time::sleep(defaults::FAILED_BACKOFF - defaults::TICK_INTERVAL).await;
    assert_eq!(bad.calls(), 1);
    time::sleep(2 * defaults::TICK_INTERVAL).await;
    settle().await;
    assert_eq!(bad.calls(), 2);
    assert_eq!(detector.verdict().class, Some(NatClass::FullCone));
    assert!(detector.metrics().rounds_failed.get() >= 2);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn probe_errors_are_failed_rounds() {
    #[derive(Debug)]
    struct Erroring;

    impl IpDetector for Erroring {
        fn detect(&self) -> BoxFuture<Result<Vec<RawReading>, ProbeError>> {
            Box::pin(async {
                Err(ProbeError::from_err(
                    "stun",
                    std::io::Error::other("no route"),
                ))
            })
        }
    }

    #[derive(Debug)]
    struct Panicking;

    impl IpDetector for Panicking {
        fn detect(&self) -> BoxFuture<Result<Vec<RawReading>, ProbeError>> {
            Box::pin(async { panic!("probe crashed") })
        }
    }

    let Setup { detector, .. } = setup();
    detector.register_probe(Arc::new(Erroring));
    detector.register_probe(Arc::new(Panicking));
    settle().await;
    assert_eq!(detector.verdict(), ConnectivityVerdict::unknown());
    assert_eq!(detector.metrics().probe_faults.get(), 2);
    assert_eq!(detector.evaluate(), Decision::BackingOff);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn unregistered_probe_result_is_discarded() {
    let Setup {
        detector, host, ..
    } = setup();
    let probe = Arc::new(Gated {
        readings: vec![RawReading::new(public(1), NatType::NoUdp)],
        release: Default::default(),
    });
    let dyn_probe: Arc<dyn IpDetector> = probe.clone();
    detector.register_probe(dyn_probe.clone());
    assert_eq!(detector.evaluate(), Decision::AllRunning);

    assert!(detector.unregister_probe(&dyn_probe));
    assert!(!detector.has_detectors());
    assert_eq!(host.terminated.load(Ordering::Relaxed), 1);
    assert!(!detector.unregister_probe(&dyn_probe));

    probe.release.notify_one();
    settle().await;
    assert_eq!(detector.verdict(), ConnectivityVerdict::unknown());
    assert_eq!(detector.metrics().stale_results.get(), 1);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn no_probes_raises_no_data() {
    let Setup {
        detector, alerts, ..
    } = setup();
    assert_eq!(detector.evaluate(), Decision::NoProbes);
    assert_eq!(
        alerts.tiers(),
        [AlertTier::NoDetectionData].into_iter().collect()
    );

    detector.register_probe(Fixed::new(vec![RawReading::new(
        public(1),
        NatType::FullCone,
    )]));
    settle().await;
    assert!(alerts.tiers().is_empty());
    assert!(!detector.verdict().uncertain);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn lost_connections_trigger_detection() {
    let Setup {
        detector, peers, ..
    } = setup();
    let probe = Fixed::new(vec![RawReading::new(public(1), NatType::Open)]);
    detector.register_probe(probe.clone());
    settle().await;
    assert_eq!(probe.calls(), 1);

    *peers.peers.lock() = vec![
        PeerInfo::connected(public(10)),
        PeerInfo::connected(public(11)),
    ];
    assert_eq!(detector.evaluate(), Decision::Skipped);

    // all connections gone, the hourly throttle still applies
    let seen = Instant::now();
    *peers.peers.lock() = vec![
        PeerInfo::disconnected(public(10)).last_received(seen),
        PeerInfo::disconnected(public(11)).last_received(seen),
    ];
    assert_eq!(detector.evaluate(), Decision::Skipped);

    time::sleep(defaults::HOURLY_THROTTLE + defaults::TICK_INTERVAL).await;
    settle().await;
    assert_eq!(probe.calls(), 2);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn tick_survives_panicking_registry() {
    let Setup {
        detector, peers, ..
    } = setup();
    detector.register_probe(Fixed::new(vec![RawReading::new(
        public(1),
        NatType::FullCone,
    )]));
    settle().await;

    peers.broken.store(true, Ordering::Relaxed);
    assert_eq!(detector.tick().await, Decision::Faulted);
    assert!(detector.metrics().evaluation_faults.get() >= 1);

    peers.broken.store(false, Ordering::Relaxed);
    assert_eq!(detector.tick().await, Decision::Skipped);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn register_survives_panicking_registry() {
    let Setup {
        detector, peers, ..
    } = setup();
    peers.broken.store(true, Ordering::Relaxed);
    let probe = Fixed::new(vec![RawReading::new(public(1), NatType::FullCone)]);
    assert_eq!(detector.register_probe(probe.clone()), Decision::Faulted);
    assert!(detector.has_detectors());
    assert_eq!(detector.metrics().evaluation_faults.get(), 1);
    assert_eq!(probe.calls(), 0);

    peers.broken.store(false, Ordering::Relaxed);
    assert_eq!(detector.evaluate(), Decision::Started { runners: 1 });
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn direct_addr_check_defers_to_peer_heuristics() {
    let Setup {
        detector,
        peers,
        addrs,
        ..
    } = setup();
    let probe = Fixed::new(vec![RawReading::new(public(1), NatType::Open)]);
    assert_eq!(
        detector.register_probe(probe.clone()),
        Decision::Started { runners: 1 }
    );
    settle().await;
    assert_eq!(probe.calls(), 1);

    // healthy node: a direct address and two stable connections
    let added = Instant::now();
    *peers.peers.lock() = vec![
        PeerInfo::connected(public(10)).added(added),
        PeerInfo::connected(public(11)).added(added),
    ];
    addrs.direct.store(true, Ordering::Relaxed);

    // past the twice-daily check the peers look fine, so nothing runs
    time::sleep(defaults::REAL_IP_INTERVAL + defaults::HOURLY_THROTTLE).await;
    settle().await;
    assert_eq!(probe.calls(), 1);
    assert_eq!(detector.evaluate(), Decision::Skipped);

    // all connections lost: the twice-daily check lets the peer heuristics decide
    let seen = Instant::now();
    *peers.peers.lock() = vec![
        PeerInfo::disconnected(public(10))
            .added(added)
            .last_received(seen),
        PeerInfo::disconnected(public(11))
            .added(added)
            .last_received(seen),
    ];
    assert_eq!(detector.evaluate(), Decision::Started { runners: 1 });
    settle().await;
    assert_eq!(probe.calls(), 2);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn ports_fan_out_despite_faulty_forwarder() {
    let Setup { detector, .. } = setup();
    let a = Arc::new(Forwarder::default());
    let b = Arc::new(Forwarder::default());
    let broken: Arc<dyn PortForwarder> = Arc::new(BrokenForwarder);
    detector.register_port_forwarder(a.clone());
    detector.register_port_forwarder(broken.clone());
    detector.register_port_forwarder(b.clone());
    assert!(detector.has_port_forwarders());
    settle().await;

    detector.on_ports_changed(ports());
    settle().await;

    for forwarder in [&a, &b] {
        let seen = forwarder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_empty());
        assert_eq!(seen[1], ports());
    }
    let log = detector.port_forward_log();
    let statuses = log
        .iter()
        .filter(|o| matches!(o, PortForwardOutcome::Status { .. }))
        .count();
    let faults = log
        .iter()
        .filter(|o| matches!(o, PortForwardOutcome::Fault { .. }))
        .count();
    assert_eq!(statuses, 4);
    assert_eq!(faults, 1);
    assert_eq!(detector.metrics().port_forward_faults.get(), 1);

    assert!(detector.unregister_port_forwarder(&broken));
    detector.on_ports_changed(PortSet::new());
    settle().await;
    assert_eq!(detector.ports(), PortSet::new());
    assert_eq!(detector.metrics().port_forward_faults.get(), 1);
}
