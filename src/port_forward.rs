//! Fans the node's advertised ports out to the registered [`PortForwarder`]s.
//!
//! Every forwarder is invoked in its own task, a slow or broken forwarder never holds up
//! the others.  Whatever the forwarders report back is logged and kept in a small ring
//! buffer, and triggers a re-evaluation of IP detection since a successful forward may
//! well have changed the node's reachability.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use n0_future::task;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, debug_span, info, trace, warn};

use crate::{
    detector::Trigger,
    metrics::Metrics,
    probe::{PortForwarder, ProbeError, ProbeId},
};

/// Transport protocol of a [`ForwardPort`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    /// UDP
    Udp,
    /// TCP
    Tcp,
}

/// A port the node would like to be reachable on.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[display("{name} {protocol}/{port}")]
pub struct ForwardPort {
    /// What the port is used for, e.g. `"darknet"`.
    pub name: String,
    /// The transport protocol.
    pub protocol: Protocol,
    /// The local port number.
    pub port: u16,
}

impl ForwardPort {
    /// Creates a new port.
    pub fn new(name: impl Into<String>, protocol: Protocol, port: u16) -> Self {
        Self {
            name: name.into(),
            protocol,
            port,
        }
    }
}

/// The set of ports to forward.
pub type PortSet = BTreeSet<ForwardPort>;

/// How sure a forwarder is about a forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ForwardOutcome {
    /// The port is forwarded.
    DefiniteSuccess,
    /// The port is most likely forwarded.
    ProbableSuccess,
    /// The port may be forwarded, verify out of band.
    MaybeSuccess,
    /// The forward most likely failed.
    ProbableFailure,
    /// The forward failed.
    DefiniteFailure,
}

impl ForwardOutcome {
    /// Whether this counts as some kind of success.
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            ForwardOutcome::DefiniteSuccess
                | ForwardOutcome::ProbableSuccess
                | ForwardOutcome::MaybeSuccess
        )
    }
}

/// The result of forwarding one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPortStatus {
    /// How it went.
    pub outcome: ForwardOutcome,
    /// Free form explanation from the forwarder.
    pub reason: String,
    /// The external port, if the router mapped to a different one.
    pub external_port: Option<u16>,
}

impl ForwardPortStatus {
    /// Creates a new status.
    pub fn new(outcome: ForwardOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
            external_port: None,
        }
    }

    /// Sets the external port.
    pub fn with_external_port(mut self, port: u16) -> Self {
        self.external_port = Some(port);
        self
    }
}

/// An entry of the port forward result log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortForwardOutcome {
    /// The forwarder accepted a port set.
    Requested {
        /// The forwarder.
        probe: ProbeId,
        /// Its name.
        name: String,
        /// The number of ports handed over.
        ports: usize,
    },
    /// The forwarder reported a status for one port.
    Status {
        /// The forwarder.
        probe: ProbeId,
        /// Its name.
        name: String,
        /// The port the status is about.
        port: ForwardPort,
        /// The status.
        status: ForwardPortStatus,
    },
    /// The forwarder failed or panicked.
    Fault {
        /// The forwarder.
        probe: ProbeId,
        /// Its name.
        name: String,
        /// The error, rendered.
        error: String,
    },
}

impl PortForwardOutcome {
    /// The forwarder this outcome is about.
    pub fn probe(&self) -> ProbeId {
        match self {
            PortForwardOutcome::Requested { probe, .. }
            | PortForwardOutcome::Status { probe, .. }
            | PortForwardOutcome::Fault { probe, .. } => *probe,
        }
    }
}

/// Handed to a [`PortForwarder`] to report per-port results.
///
/// Cheap to clone, may be kept around and used at any later time.
#[derive(Debug, Clone)]
pub struct StatusSink {
    probe: ProbeId,
    name: Arc<str>,
    shared: Arc<Shared>,
}

impl StatusSink {
    /// Reports the status of some ports.
    ///
    /// Only statuses for ports in the node's current port set are taken into account.
    pub fn report(&self, statuses: BTreeMap<ForwardPort, ForwardPortStatus>) {
        let current = self.shared.ports.lock().clone();
        for port in &current {
            let Some(status) = statuses.get(port) else {
                continue;
            };
            match status.outcome {
                ForwardOutcome::DefiniteSuccess | ForwardOutcome::ProbableSuccess => {
                    info!(forwarder = %self.name, %port, outcome = %status.outcome, reason = %status.reason, "port forwarded");
                }
                ForwardOutcome::MaybeSuccess => {
                    info!(forwarder = %self.name, %port, reason = %status.reason, "port forward may have succeeded, verify out of band");
                }
                ForwardOutcome::ProbableFailure | ForwardOutcome::DefiniteFailure => {
                    warn!(forwarder = %self.name, %port, outcome = %status.outcome, reason = %status.reason, "failed to forward port");
                }
            }
            self.shared.push(PortForwardOutcome::Status {
                probe: self.probe,
                name: self.name.to_string(),
                port: port.clone(),
                status: status.clone(),
            });
        }
        if statuses.keys().any(|port| !current.contains(port)) {
            trace!(forwarder = %self.name, "ignoring statuses for ports no longer advertised");
        }
        self.shared.trigger.request();
    }
}

#[derive(Debug)]
struct Shared {
    ports: Mutex<PortSet>,
    log: Mutex<VecDeque<PortForwardOutcome>>,
    log_capacity: usize,
    metrics: Arc<Metrics>,
    trigger: Trigger,
}

impl Shared {
    fn push(&self, outcome: PortForwardOutcome) {
        let mut log = self.log.lock();
        log.push_back(outcome);
        while log.len() > self.log_capacity {
            log.pop_front();
        }
    }
}

/// Keeps the registered [`PortForwarder`]s and the node's current port set.
#[derive(Debug)]
pub(crate) struct Notifier {
    forwarders: Mutex<BTreeMap<ProbeId, Arc<dyn PortForwarder>>>,
    shared: Arc<Shared>,
}

impl Notifier {
    pub(crate) fn new(log_capacity: usize, metrics: Arc<Metrics>, trigger: Trigger) -> Self {
        Self {
            forwarders: Default::default(),
            shared: Arc::new(Shared {
                ports: Default::default(),
                log: Default::default(),
                log_capacity,
                metrics,
                trigger,
            }),
        }
    }

    /// Registers a forwarder and immediately hands it the current port set.
    pub(crate) fn register(&self, forwarder: Arc<dyn PortForwarder>) {
        let id = ProbeId::of(&forwarder);
        debug!(forwarder = forwarder.name(), %id, "registering port forwarder");
        self.forwarders.lock().insert(id, forwarder.clone());
        let ports = self.shared.ports.lock().clone();
        self.spawn_forward(id, forwarder, ports);
    }

    /// Returns `true` if the forwarder was registered.
    pub(crate) fn unregister(&self, forwarder: &Arc<dyn PortForwarder>) -> bool {
        self.forwarders
            .lock()
            .remove(&ProbeId::of(forwarder))
            .is_some()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.forwarders.lock().is_empty()
    }

    pub(crate) fn ports(&self) -> PortSet {
        self.shared.ports.lock().clone()
    }

    pub(crate) fn log(&self) -> Vec<PortForwardOutcome> {
        self.shared.log.lock().iter().cloned().collect()
    }

    /// Stores the new port set and hands it to every forwarder.
    pub(crate) fn notify(&self, ports: PortSet) {
        *self.shared.ports.lock() = ports.clone();
        let forwarders: Vec<_> = self
            .forwarders
            .lock()
            .iter()
            .map(|(id, f)| (*id, f.clone()))
            .collect();
        debug!(ports = ports.len(), forwarders = forwarders.len(), "ports changed");
        for (id, forwarder) in forwarders {
            self.spawn_forward(id, forwarder, ports.clone());
        }
    }

    fn spawn_forward(&self, id: ProbeId, forwarder: Arc<dyn PortForwarder>, ports: PortSet) {
        let name: Arc<str> = forwarder.name().into();
        let sink = StatusSink {
            probe: id,
            name: name.clone(),
            shared: self.shared.clone(),
        };
        let shared = self.shared.clone();
        let span = debug_span!("port_forward", forwarder = %name);
        shared.metrics.port_forward_notifications.inc();
        task::spawn(
            async move {
                let count = ports.len();
                // The inner task catches panics from the forwarder.
                let res = task::spawn(async move { forwarder.forward(ports, sink).await })
                    .await
                    .unwrap_or_else(|err| Err(ProbeError::panicked(err)));
                let outcome = match res {
                    Ok(()) => {
                        trace!(ports = count, "forward requested");
                        PortForwardOutcome::Requested {
                            probe: id,
                            name: name.to_string(),
                            ports: count,
                        }
                    }
                    Err(err) => {
                        warn!("changing public ports failed: {err:#}");
                        shared.metrics.port_forward_faults.inc();
                        PortForwardOutcome::Fault {
                            probe: id,
                            name: name.to_string(),
                            error: err.to_string(),
                        }
                    }
                };
                shared.push(outcome);
            }
            .instrument(span),
        );
    }
}
