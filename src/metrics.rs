//! Metrics of the detector.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by the [`Detector`](crate::Detector)
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "reachability")]
#[non_exhaustive]
pub struct Metrics {
    /// Number of times the scheduling heuristics were evaluated.
    pub evaluations: Counter,
    /// Evaluations which panicked, e.g. in a collaborator.
    pub evaluation_faults: Counter,
    /// Detection rounds started.
    pub rounds_started: Counter,
    /// Probe runners started, a round starts one per idle probe.
    pub runners_started: Counter,
    /// Runners which produced a usable reading.
    pub rounds_succeeded: Counter,
    /// Runners which failed, came back empty or without any valid reading.
    pub rounds_failed: Counter,
    /// Probes which returned an error or panicked.
    pub probe_faults: Counter,
    /// Results of unregistered or re-registered probes which were discarded.
    pub stale_results: Counter,

    /*
     * Port forwarding
     */
    /// Port sets handed to forwarders.
    pub port_forward_notifications: Counter,
    /// Forwarders which failed or panicked.
    pub port_forward_faults: Counter,
}
