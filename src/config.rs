//! Configuration for the detector.

use std::{path::Path, time::Duration};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::defaults;

/// Detector configuration.
///
/// Usually loaded from a TOML file with [`Config::load`], every field is optional and
/// durations are written in human readable form:
///
/// ```toml
/// tick_interval = "1m"
/// no_peers_interval = "6h"
/// ```
///
/// The [`Default`] impl uses the values from [`defaults`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How often the periodic driver evaluates whether to detect.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Back-off after a round in which every probe failed.
    #[serde(with = "humantime_serde")]
    pub failed_backoff: Duration,
    /// Detection interval while the node has no peers.
    #[serde(with = "humantime_serde")]
    pub no_peers_interval: Duration,
    /// Minimum interval between detections triggered by lost connectivity.
    #[serde(with = "humantime_serde")]
    pub hourly_throttle: Duration,
    /// Minimum interval between detections after losing several recently seen peers.
    #[serde(with = "humantime_serde")]
    pub recent_loss_interval: Duration,
    /// Grace period for incoming connections while a previous address is trusted.
    #[serde(with = "humantime_serde")]
    pub urgency_grace: Duration,
    /// Window in which a disconnected peer counts as recently seen.
    #[serde(with = "humantime_serde")]
    pub recently_seen: Duration,
    /// Age after which a peer is trusted.
    #[serde(with = "humantime_serde")]
    pub old_peer_age: Duration,
    /// Detection interval while the node has a directly detected address.
    #[serde(with = "humantime_serde")]
    pub real_ip_interval: Duration,
    /// Window of peers examined while the node has a directly detected address.
    #[serde(with = "humantime_serde")]
    pub real_ip_peer_window: Duration,
    /// More distinct connected peer addresses than this prove reachability.
    pub enough_distinct_peer_addrs: usize,
    /// More lost recently seen peers than this bypass the hourly throttle.
    pub recently_seen_peers_threshold: usize,
    /// The number of port forward outcomes kept.
    pub port_forward_log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval: defaults::TICK_INTERVAL,
            failed_backoff: defaults::FAILED_BACKOFF,
            no_peers_interval: defaults::NO_PEERS_INTERVAL,
            hourly_throttle: defaults::HOURLY_THROTTLE,
            recent_loss_interval: defaults::RECENT_LOSS_INTERVAL,
            urgency_grace: defaults::URGENCY_GRACE,
            recently_seen: defaults::RECENTLY_SEEN,
            old_peer_age: defaults::OLD_PEER_AGE,
            real_ip_interval: defaults::REAL_IP_INTERVAL,
            real_ip_peer_window: defaults::REAL_IP_PEER_WINDOW,
            enough_distinct_peer_addrs: defaults::ENOUGH_DISTINCT_PEER_ADDRS,
            recently_seen_peers_threshold: defaults::RECENTLY_SEEN_PEERS_THRESHOLD,
            port_forward_log_capacity: defaults::PORT_FORWARD_LOG_CAPACITY,
        }
    }
}

/// Config errors
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("Failed to read {}", path.display()))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Invalid config"))]
    Parse { source: toml::de::Error },
    #[snafu(display("Tick interval must not be zero"))]
    ZeroTick {},
}

impl Config {
    /// Loads the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config = Self::from_toml_str(&s)?;
        debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    /// Parses the config from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(s).context(ParseSnafu)?;
        snafu::ensure!(!config.tick_interval.is_zero(), ZeroTickSnafu);
        Ok(config)
    }
}
