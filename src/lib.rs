//! Decides when to run pluggable reachability probes and what their results mean.
//!
//! A node in a peer-to-peer overlay needs to know whether it is reachable from the open
//! internet, sits behind some flavour of NAT, or cannot receive UDP at all.  Nobody can
//! tell it with authority, so it asks whatever probes are plugged in ([`IpDetector`]s, e.g.
//! a STUN client) and aggregates their possibly disagreeing opinions into one
//! [`ConnectivityVerdict`].
//!
//! Running probes is not free, so the [`Detector`] only launches them when its scheduling
//! heuristics say the answer may have changed: no peers for a long time, all connections
//! lost, a suspicious symmetric NAT, etc.  It runs one task per probe, never two for the
//! same probe, and re-evaluates whenever a probe finishes, the advertised ports change or
//! the periodic tick fires.
//!
//! The [`Detector`] also fans out port changes to the registered [`PortForwarder`]s, which
//! try to open the ports on the local router via whatever protocol they implement.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reachability::{AddressTracker, Detector, PeerInfo, PeerRegistry};
//!
//! #[derive(Debug)]
//! struct Peers;
//!
//! impl PeerRegistry for Peers {
//!     fn peers(&self) -> Vec<PeerInfo> {
//!         Vec::new()
//!     }
//!
//!     fn valid_peer_count(&self) -> usize {
//!         0
//!     }
//! }
//!
//! #[derive(Debug)]
//! struct Addrs;
//!
//! impl AddressTracker for Addrs {
//!     fn local_addrs(&self) -> Vec<std::net::IpAddr> {
//!         Vec::new()
//!     }
//!
//!     fn has_directly_detected_addr(&self) -> bool {
//!         false
//!     }
//! }
//!
//! # async fn wrapper() {
//! let detector = Detector::builder(Arc::new(Peers), Arc::new(Addrs)).spawn();
//! println!("{}", detector.verdict());
//! # }
//! ```

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod alerts;
pub mod classify;
pub mod config;
pub mod defaults;
pub mod detector;
pub mod heuristics;
pub mod metrics;
pub mod nat;
pub mod peers;
pub mod port_forward;
pub mod probe;
mod runner;

pub use alerts::{AlertInfo, AlertSurface, AlertTier, LoggingAlerts, Severity};
pub use classify::{ConnectivityVerdict, aggregate};
pub use config::{Config, ConfigError};
pub use detector::{Builder, Decision, Detector};
pub use metrics::Metrics;
pub use nat::{NatClass, NatType, RawReading, is_plausibly_public};
pub use peers::{AddressTracker, PeerInfo, PeerRegistry};
pub use port_forward::{
    ForwardOutcome, ForwardPort, ForwardPortStatus, PortForwardOutcome, PortSet, Protocol,
    StatusSink,
};
pub use probe::{IpDetector, NoopHost, PortForwarder, ProbeError, ProbeHost, ProbeId};
