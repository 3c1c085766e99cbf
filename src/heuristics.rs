//! When is it worth running a detection?
//!
//! Detection probes (STUN and the like) may expose the node or use scarce resources, so
//! they are not run all the time.  Roughly:
//!
//! - If the last round failed to produce a public address at all, the node is probably
//!   not on the internet, wait a few minutes before trying again.
//! - If the node already has a directly detected address, it is most likely fine.  Still
//!   check twice a day in case it is firewalled, unless it is connected to enough peers on
//!   distinct addresses to prove reachability, or its peers are all too new to tell.  This
//!   only clears the way, the rules below still decide.
//! - Without any peers, detect every few hours.
//! - With peers, detect when all connections are lost but peers are known (after a grace
//!   period if a previously detected address is still trusted), at most hourly, or sooner
//!   if many recently seen peers disappeared.  A suspected symmetric NAT is verified once.
//!
//! Everything here is a pure function of the inputs, time included, so it can be tested
//! without running anything.

use std::{collections::BTreeSet, net::IpAddr, time::Duration};

use n0_future::time::Instant;
use tracing::{debug, trace};

use crate::{config::Config, nat::is_plausibly_public, peers::PeerInfo};

/// Time elapsed from `then` to `now`, with `None` meaning "never" and counting as forever.
pub fn elapsed(now: Instant, then: Option<Instant>) -> Duration {
    match then {
        Some(then) => now.saturating_duration_since(then),
        None => Duration::MAX,
    }
}

/// Peers counted by [`Heuristics::count_peers`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerCounts {
    /// Connected peers on an external address.
    pub connected: usize,
    /// Disconnected peers on an external address.
    pub disconnected: usize,
    /// Disconnected peers from which a packet arrived recently.
    pub recently_seen: usize,
}

impl PeerCounts {
    /// All connections are gone but there are peers we could be talking to.
    pub fn is_urgent(&self) -> bool {
        self.connected == 0 && self.disconnected > 0
    }
}

/// The scheduling heuristics, evaluated at one point in time.
#[derive(Debug, Clone, Copy)]
pub struct Heuristics<'a> {
    config: &'a Config,
    now: Instant,
    last_ended: Option<Instant>,
}

impl<'a> Heuristics<'a> {
    /// Creates the heuristics for `now`, given when the last round ended.
    pub fn new(config: &'a Config, now: Instant, last_ended: Option<Instant>) -> Self {
        Self {
            config,
            now,
            last_ended,
        }
    }

    /// Time since the last round ended.
    pub fn since_last_round(&self) -> Duration {
        elapsed(self.now, self.last_ended)
    }

    /// After a round where every probe failed, is it time to retry?
    pub fn failed_backoff_elapsed(&self) -> bool {
        self.since_last_round() >= self.config.failed_backoff
    }

    /// Without any peers, detect every [`Config::no_peers_interval`].
    pub fn should_detect_no_peers(&self) -> bool {
        if self.since_last_round() < self.config.no_peers_interval {
            trace!("no peers but detected recently");
            return false;
        }
        true
    }

    /// Counts the peers which can tell something about the node's external reachability.
    ///
    /// Disabled peers, peers without an address, on a non-public address or on one of the
    /// node's own addresses are skipped.
    pub fn count_peers(&self, peers: &[PeerInfo], local_addrs: &[IpAddr]) -> PeerCounts {
        let mut counts = PeerCounts::default();
        for peer in peers {
            if peer.disabled {
                continue;
            }
            let Some(addr) = peer.addr else {
                continue;
            };
            if !is_plausibly_public(addr) || local_addrs.contains(&addr) {
                continue;
            }
            if peer.connected {
                counts.connected += 1;
            } else {
                counts.disconnected += 1;
                if elapsed(self.now, peer.last_received) < self.config.recently_seen {
                    counts.recently_seen += 1;
                }
            }
        }
        counts
    }

    /// Should we detect, given that the node has peers?
    ///
    /// `urgent_since` is the time the node was first seen without connections, it is
    /// updated here.
    pub fn should_detect_with_peers(
        &self,
        counts: PeerCounts,
        trusts_previous_addr: bool,
        maybe_symmetric: bool,
        urgent_since: &mut Option<Instant>,
    ) -> bool {
        trace!(?counts, "checking whether to detect with peers");
        let mut detect = false;

        if counts.is_urgent() {
            let first = *urgent_since.get_or_insert(self.now);
            if trusts_previous_addr {
                // Give incoming connections some time to prove the old address right.
                if elapsed(self.now, Some(first)) > self.config.urgency_grace {
                    debug!("no connections for a while despite a trusted address, detecting");
                    detect = true;
                    *urgent_since = Some(self.now);
                } else {
                    trace!("no connections, waiting for incoming ones at the trusted address");
                }
            } else {
                debug!("no connections and no trusted address, detecting");
                detect = true;
            }
        } else {
            *urgent_since = None;
        }

        // Lost several peers recently, detect soon regardless of the hourly throttle.
        if counts.disconnected > counts.connected
            && counts.recently_seen > self.config.recently_seen_peers_threshold
            && self.since_last_round() > self.config.recent_loss_interval
        {
            debug!(?counts, "lost several recently seen peers, detecting");
            return true;
        }

        // Verify a suspected symmetric NAT at least once.
        if maybe_symmetric && self.last_ended.is_none() {
            debug!("might be behind a symmetric NAT, detecting once");
            return true;
        }

        if detect && self.since_last_round() < self.config.hourly_throttle {
            trace!("only detecting once per hour");
            return false;
        }
        detect
    }

    /// Should we detect even though the node has a directly detected address?
    ///
    /// It might still be firewalled, so check every [`Config::real_ip_interval`] unless the
    /// peers prove or cannot tell otherwise.
    pub fn should_detect_despite_real_ip(&self, peers: &[PeerInfo], local_addrs: &[IpAddr]) -> bool {
        if self.since_last_round() < self.config.real_ip_interval {
            trace!("have a directly detected address and checked recently");
            return false;
        }

        let mut connected_addrs = BTreeSet::new();
        let mut has_old_peers = false;
        for peer in peers {
            let seen = peer.connected
                || elapsed(self.now, peer.last_received) < self.config.real_ip_peer_window;
            if !seen {
                continue;
            }
            if let Some(addr) = peer.addr.filter(|_| peer.connected) {
                if is_plausibly_public(addr) && !local_addrs.contains(&addr) {
                    connected_addrs.insert(addr);
                    if connected_addrs.len() > self.config.enough_distinct_peer_addrs {
                        debug!(
                            addrs = connected_addrs.len(),
                            "connected to enough distinct addresses, not detecting"
                        );
                        return false;
                    }
                }
            }
            if elapsed(self.now, peer.added) > self.config.old_peer_age {
                has_old_peers = true;
            }
        }
        if !has_old_peers {
            trace!("all peers are too new to tell, not detecting");
            return false;
        }
        true
    }
}
