//! Default values of the scheduling thresholds.
//!
//! These were tuned empirically and interact with each other, change them through
//! [`Config`](crate::Config) rather than here.

use std::time::Duration;

/// How often the periodic driver evaluates whether to detect.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait before retrying after every probe failed to find a public address.
///
/// A failed round usually means the node is not on the internet at all.
pub const FAILED_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// How often to detect while the node has no peers at all.
pub const NO_PEERS_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// The minimum interval between detections triggered by lost connectivity.
pub const HOURLY_THROTTLE: Duration = Duration::from_secs(60 * 60);

/// The minimum interval between detections after losing several recently seen peers.
pub const RECENT_LOSS_INTERVAL: Duration = Duration::from_secs(6 * 60);

/// How long to wait for incoming connections while a previous address is trusted.
pub const URGENCY_GRACE: Duration = Duration::from_secs(2 * 60);

/// A disconnected peer counts as recently seen within this window.
pub const RECENTLY_SEEN: Duration = Duration::from_secs(5 * 60);

/// Peers added longer ago than this are trusted to tell something about reachability.
pub const OLD_PEER_AGE: Duration = Duration::from_secs(30 * 60);

/// How often to check reachability even though the node has a directly detected address.
pub const REAL_IP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Peers seen within this window are examined by the despite-real-address check.
pub const REAL_IP_PEER_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Being connected to more than this many distinct external addresses proves reachability.
pub const ENOUGH_DISTINCT_PEER_ADDRS: usize = 2;

/// Losing more than this many recently seen peers allows detecting ahead of the hourly
/// throttle.
pub const RECENTLY_SEEN_PEERS_THRESHOLD: usize = 2;

/// The number of port forward outcomes kept.
pub const PORT_FORWARD_LOG_CAPACITY: usize = 64;
