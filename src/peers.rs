//! What the detector needs to know about the node's peers and its own addresses.

use std::net::IpAddr;

use n0_future::time::Instant;

use crate::nat::RawReading;

/// A snapshot of one peer, as far as the scheduling heuristics care.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's address, if known.
    pub addr: Option<IpAddr>,
    /// Whether there currently is a working connection to the peer.
    pub connected: bool,
    /// Disabled peers are ignored entirely.
    pub disabled: bool,
    /// When the last packet from this peer arrived.
    pub last_received: Option<Instant>,
    /// When the peer was added, `None` if unknown.
    pub added: Option<Instant>,
}

impl PeerInfo {
    /// A connected peer at `addr`.
    pub fn connected(addr: IpAddr) -> Self {
        Self {
            addr: Some(addr),
            connected: true,
            disabled: false,
            last_received: None,
            added: None,
        }
    }

    /// A disconnected peer at `addr`.
    pub fn disconnected(addr: IpAddr) -> Self {
        Self {
            connected: false,
            ..Self::connected(addr)
        }
    }

    /// Sets when the last packet arrived.
    pub fn last_received(mut self, at: Instant) -> Self {
        self.last_received = Some(at);
        self
    }

    /// Sets when the peer was added.
    pub fn added(mut self, at: Instant) -> Self {
        self.added = Some(at);
        self
    }

    /// Marks the peer as disabled.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// The node's registry of peers.
pub trait PeerRegistry: std::fmt::Debug + Send + Sync + 'static {
    /// All known peers, connected or not.
    fn peers(&self) -> Vec<PeerInfo>;

    /// The number of peers the node considers usable.
    fn valid_peer_count(&self) -> usize;
}

/// The node's knowledge about its own addresses.
///
/// Besides answering queries this receives what detection found out, so the node can
/// update its idea of its public address.
pub trait AddressTracker: std::fmt::Debug + Send + Sync + 'static {
    /// Addresses the node itself is known under, peers reporting these are not external.
    fn local_addrs(&self) -> Vec<IpAddr>;

    /// Whether the node has an address it observed directly, e.g. on a local interface or
    /// as reported by peers, as opposed to one found by a probe.
    fn has_directly_detected_addr(&self) -> bool;

    /// A previously detected address the node still believes in.
    fn trusted_previous_addr(&self) -> Option<IpAddr> {
        None
    }

    /// Whether the node suspects to be behind a symmetric NAT, e.g. because peers report
    /// varying ports.
    fn maybe_symmetric(&self) -> bool {
        false
    }

    /// Called with the valid readings of every successful round.
    fn on_readings(&self, _readings: &[RawReading]) {}

    /// Called when detection settled: a round finished or there is nothing to run.
    fn on_detection_settled(&self) {}
}
