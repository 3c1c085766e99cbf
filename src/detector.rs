//! The detection orchestrator.
//!
//! All registries and the scheduling state live in one [`Inner`] behind a single lock.
//! Four things funnel into [`Inner::evaluate`]: registering a probe, a port set change, a
//! runner completing and the periodic tick.  The latter three go through the driver task,
//! which runs every evaluation in its own task so a panicking collaborator is logged
//! instead of killing the driver.

use std::{
    collections::{BTreeMap, BTreeSet},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use n0_future::{
    task::{self, AbortOnDropHandle},
    time::Instant,
};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use tracing::{Instrument, debug, error, info_span, trace};

use crate::{
    alerts::{AlertInfo, AlertSurface, AlertTier, LoggingAlerts},
    classify::ConnectivityVerdict,
    config::Config,
    heuristics::Heuristics,
    metrics::Metrics,
    nat::{RawReading, is_plausibly_public},
    peers::{AddressTracker, PeerRegistry},
    port_forward::{Notifier, PortForwardOutcome, PortSet},
    probe::{IpDetector, NoopHost, PortForwarder, ProbeHost, ProbeId},
    runner::Runner,
};

/// What an evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Decision {
    /// No probes are registered, the verdict was marked uncertain.
    NoProbes,
    /// Every registered probe is already running.
    AllRunning,
    /// Every probe failed last time, waiting before retrying.
    BackingOff,
    /// The heuristics found no reason to detect.
    Skipped,
    /// A round was started.
    Started {
        /// The number of runners launched.
        runners: usize,
    },
    /// A collaborator panicked while evaluating, nothing was started.
    Faulted,
}

/// Asks the driver for an evaluation.
///
/// Requests coalesce: while one is pending further ones are dropped.
#[derive(Debug, Clone)]
pub(crate) struct Trigger(mpsc::Sender<()>);

impl Trigger {
    pub(crate) fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self(tx), rx)
    }

    pub(crate) fn request(&self) {
        self.0.try_send(()).ok();
    }
}

/// A registered detection probe.
#[derive(Debug)]
struct Registered {
    probe: Arc<dyn IpDetector>,
    /// Distinguishes registrations of the same probe, results of an older one are stale.
    generation: u64,
}

/// The scheduling state.
#[derive(Debug, Default)]
pub(crate) struct State {
    probes: BTreeMap<ProbeId, Registered>,
    next_generation: u64,
    /// Probes with a runner in flight, and the generation the runner was started for.
    pub(crate) active: BTreeMap<ProbeId, u64>,
    /// Probes which completed since the last round started.
    pub(crate) completed: BTreeSet<ProbeId>,
    /// Probes which failed since the last round started, a subset of `completed`.
    pub(crate) failed: BTreeSet<ProbeId>,
    /// Valid readings since the last round started.
    pub(crate) readings: Vec<RawReading>,
    pub(crate) last_round_end: Option<Instant>,
    urgent_since: Option<Instant>,
    pub(crate) verdict: ConnectivityVerdict,
    /// The NAT tier alert currently raised.
    pub(crate) raised: Option<AlertTier>,
    pub(crate) no_data_raised: bool,
}

impl State {
    /// Whether a result for `id` from the runner started at `generation` still counts.
    pub(crate) fn is_current(&self, id: ProbeId, generation: u64) -> bool {
        self.probes.get(&id).map(|r| r.generation) == Some(generation)
            && self.active.get(&id) == Some(&generation)
    }
}

/// Shared between the handles, the driver and the runners.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) state: Mutex<State>,
    peers: Arc<dyn PeerRegistry>,
    pub(crate) addresses: Arc<dyn AddressTracker>,
    pub(crate) alerts: Arc<dyn AlertSurface>,
    host: Arc<dyn ProbeHost>,
    config: Config,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) notifier: Notifier,
    pub(crate) trigger: Trigger,
}

impl Inner {
    /// Decides whether to start a detection round, and starts it.
    pub(crate) fn evaluate(self: &Arc<Self>) -> Decision {
        self.metrics.evaluations.inc();
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.probes.is_empty() {
            state.verdict.uncertain = true;
            let raise = !std::mem::replace(&mut state.no_data_raised, true);
            drop(state);
            trace!("no detection probes registered");
            if raise {
                let info = AlertInfo::new(AlertTier::NoDetectionData, &self.notifier.ports());
                self.alerts.raise(AlertTier::NoDetectionData, info);
            }
            self.addresses.on_detection_settled();
            return Decision::NoProbes;
        }

        if state.probes.keys().all(|id| state.active.contains_key(id)) {
            trace!(active = state.active.len(), "all probes running");
            return Decision::AllRunning;
        }

        let heuristics = Heuristics::new(&self.config, now, state.last_round_end);

        if !state.completed.is_empty() && state.completed.len() == state.failed.len() {
            if !heuristics.failed_backoff_elapsed() {
                trace!("all probes failed recently, backing off");
                return Decision::BackingOff;
            }
            debug!("all probes failed last time, retrying");
            return self.start_round(&mut state);
        }

        let peers = self.peers.peers();
        let local = self.addresses.local_addrs();
        if self.addresses.has_directly_detected_addr()
            && !heuristics.should_detect_despite_real_ip(&peers, &local)
        {
            return Decision::Skipped;
        }

        let detect = if self.peers.valid_peer_count() == 0 {
            heuristics.should_detect_no_peers()
        } else {
            let counts = heuristics.count_peers(&peers, &local);
            let trusted = self
                .addresses
                .trusted_previous_addr()
                .is_some_and(is_plausibly_public);
            let maybe_symmetric = self.addresses.maybe_symmetric();
            heuristics.should_detect_with_peers(
                counts,
                trusted,
                maybe_symmetric,
                &mut state.urgent_since,
            )
        };

        if detect {
            self.start_round(&mut state)
        } else {
            Decision::Skipped
        }
    }

    /// Launches a runner for every probe which has none.
    fn start_round(self: &Arc<Self>, state: &mut State) -> Decision {
        state.completed.clear();
        state.failed.clear();
        state.readings.clear();

        let mut runners = Vec::new();
        for (id, registered) in &state.probes {
            if state.active.contains_key(id) {
                continue;
            }
            runners.push(Runner {
                id: *id,
                generation: registered.generation,
                probe: registered.probe.clone(),
            });
        }
        for runner in &runners {
            state.active.insert(runner.id, runner.generation);
        }

        let count = runners.len();
        self.metrics.rounds_started.inc();
        self.metrics.runners_started.inc_by(count as u64);
        debug!(runners = count, "starting detection round");
        for runner in runners {
            runner.spawn(self.clone());
        }
        Decision::Started { runners: count }
    }

    /// Runs [`Self::evaluate`] in its own task, logging any panic.
    async fn tick(self: &Arc<Self>) -> Decision {
        let inner = self.clone();
        match task::spawn(async move { inner.evaluate() }).await {
            Ok(decision) => {
                trace!(%decision, "evaluated");
                decision
            }
            Err(err) => {
                self.metrics.evaluation_faults.inc();
                error!("evaluating detection failed: {err:#}");
                Decision::Faulted
            }
        }
    }

    async fn run(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => trace!("tick"),
                Some(()) = trigger_rx.recv() => trace!("evaluation requested"),
            }
            self.tick().await;
        }
    }
}

/// Builds a [`Detector`].
#[derive(Debug)]
pub struct Builder {
    peers: Arc<dyn PeerRegistry>,
    addresses: Arc<dyn AddressTracker>,
    alerts: Arc<dyn AlertSurface>,
    host: Arc<dyn ProbeHost>,
    config: Config,
    metrics: Arc<Metrics>,
}

impl Builder {
    /// Sets where alerts go, by default they are only logged.
    pub fn alerts(mut self, alerts: Arc<dyn AlertSurface>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Sets the host able to terminate probes.
    pub fn host(mut self, host: Arc<dyn ProbeHost>) -> Self {
        self.host = host;
        self
    }

    /// Sets the config.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the metrics to record to.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Creates the detector and starts its periodic driver.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(self) -> Detector {
        let (trigger, trigger_rx) = Trigger::new();
        let notifier = Notifier::new(
            self.config.port_forward_log_capacity,
            self.metrics.clone(),
            trigger.clone(),
        );
        let inner = Arc::new(Inner {
            state: Default::default(),
            peers: self.peers,
            addresses: self.addresses,
            alerts: self.alerts,
            host: self.host,
            config: self.config,
            metrics: self.metrics,
            notifier,
            trigger,
        });
        let task = task::spawn(
            inner
                .clone()
                .run(trigger_rx)
                .instrument(info_span!("reachability.tick")),
        );
        Detector {
            inner,
            _driver: Arc::new(AbortOnDropHandle::new(task)),
        }
    }
}

/// Decides when to run the registered [`IpDetector`]s and keeps the resulting
/// [`ConnectivityVerdict`].
///
/// Cheap to clone.  Once the last clone is dropped the periodic driver stops, runners in
/// flight still finish but their results go nowhere.
#[derive(Debug, Clone)]
pub struct Detector {
    inner: Arc<Inner>,
    /// Ensures the driver is stopped when the last handle is dropped.
    _driver: Arc<AbortOnDropHandle<()>>,
}

impl Detector {
    /// Starts building a detector consulting `peers` and `addresses`.
    pub fn builder(peers: Arc<dyn PeerRegistry>, addresses: Arc<dyn AddressTracker>) -> Builder {
        Builder {
            peers,
            addresses,
            alerts: Arc::new(LoggingAlerts),
            host: Arc::new(NoopHost),
            config: Config::default(),
            metrics: Default::default(),
        }
    }

    /// Registers a detection probe and evaluates right away.
    ///
    /// Registering a probe which is already registered changes nothing.  A panic raised
    /// by a collaborator while evaluating is caught and logged, and
    /// [`Decision::Faulted`] is returned, the probe stays registered.
    pub fn register_probe(&self, probe: Arc<dyn IpDetector>) -> Decision {
        let id = ProbeId::of(&probe);
        {
            let mut state = self.inner.state.lock();
            if state.probes.contains_key(&id) {
                debug!(probe = probe.name(), %id, "probe already registered");
            } else {
                debug!(probe = probe.name(), %id, "registering probe");
                let generation = state.next_generation;
                state.next_generation += 1;
                state.probes.insert(id, Registered { probe, generation });
            }
        }
        let inner = &self.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.evaluate())) {
            Ok(decision) => decision,
            Err(_) => {
                inner.metrics.evaluation_faults.inc();
                error!("evaluating detection after registering a probe failed");
                Decision::Faulted
            }
        }
    }

    /// Unregisters a detection probe.
    ///
    /// If it is running the [`ProbeHost`] is asked to terminate it, its result is discarded
    /// either way.  Returns `true` if the probe was registered.
    pub fn unregister_probe(&self, probe: &Arc<dyn IpDetector>) -> bool {
        let id = ProbeId::of(probe);
        let (registered, was_active) = {
            let mut state = self.inner.state.lock();
            let registered = state.probes.remove(&id).is_some();
            let was_active = state.active.remove(&id).is_some();
            state.completed.remove(&id);
            state.failed.remove(&id);
            (registered, was_active)
        };
        debug!(probe = probe.name(), %id, registered, was_active, "unregistered probe");
        if was_active {
            self.inner.host.terminate(probe);
        }
        registered
    }

    /// Registers a port forwarder and hands it the current port set.
    pub fn register_port_forwarder(&self, forwarder: Arc<dyn PortForwarder>) {
        self.inner.notifier.register(forwarder);
    }

    /// Unregisters a port forwarder, returns `true` if it was registered.
    pub fn unregister_port_forwarder(&self, forwarder: &Arc<dyn PortForwarder>) -> bool {
        self.inner.notifier.unregister(forwarder)
    }

    /// Sets the ports the node wants forwarded.
    ///
    /// Every forwarder gets the new set in its own task, and detection is re-evaluated.
    pub fn on_ports_changed(&self, ports: PortSet) {
        self.inner.notifier.notify(ports);
        self.inner.trigger.request();
    }

    /// Evaluates right away, as the periodic driver does.
    ///
    /// Panics raised while evaluating are caught and logged, [`Decision::Faulted`] is
    /// returned then.
    pub async fn tick(&self) -> Decision {
        self.inner.tick().await
    }

    /// Decides whether to start a detection round, and starts it.
    pub fn evaluate(&self) -> Decision {
        self.inner.evaluate()
    }

    /// The current verdict.
    pub fn verdict(&self) -> ConnectivityVerdict {
        self.inner.state.lock().verdict
    }

    /// Whether any detection probe is registered.
    pub fn has_detectors(&self) -> bool {
        !self.inner.state.lock().probes.is_empty()
    }

    /// Whether any port forwarder is registered.
    pub fn has_port_forwarders(&self) -> bool {
        !self.inner.notifier.is_empty()
    }

    /// The current port set.
    pub fn ports(&self) -> PortSet {
        self.inner.notifier.ports()
    }

    /// Recent port forward outcomes, oldest first.
    pub fn port_forward_log(&self) -> Vec<PortForwardOutcome> {
        self.inner.notifier.log()
    }

    /// The metrics of this detector.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }
}
