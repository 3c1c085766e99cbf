//! The operator-facing alerts raised from the connectivity verdict.
//!
//! Rendering and localisation are up to the [`AlertSurface`] implementation, this module
//! only decides which alert is due and what it should say in broad terms.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::port_forward::PortSet;

/// Which alert is raised.
///
/// At most one NAT tier is active at a time, [`AlertTier::NoDetectionData`] is independent
/// of them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum AlertTier {
    /// No detection probe is available, the node cannot tell how reachable it is.
    NoDetectionData,
    /// The node seems unable to use UDP at all.
    NoConnectivity,
    /// Symmetric NAT, only nodes with open ports can be reached.
    Symmetric,
    /// Port restricted cone NAT.
    PortRestricted,
    /// Restricted cone NAT.
    RestrictedCone,
}

/// How loudly an alert should be shown.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Severity {
    /// Serious problem, the node will barely work.
    Error,
    /// Degraded connectivity.
    Warning,
    /// Worth knowing about.
    Minor,
}

impl AlertTier {
    /// The severity of this alert.
    pub const fn severity(self) -> Severity {
        match self {
            AlertTier::NoConnectivity | AlertTier::Symmetric => Severity::Error,
            AlertTier::PortRestricted => Severity::Warning,
            AlertTier::RestrictedCone | AlertTier::NoDetectionData => Severity::Minor,
        }
    }

    /// Whether forwarding ports would help with this alert.
    pub const fn suggests_port_forward(self) -> bool {
        !matches!(self, AlertTier::NoDetectionData)
    }

    /// A short human readable title.
    pub const fn title(self) -> &'static str {
        match self {
            AlertTier::NoDetectionData => "Unknown connection type",
            AlertTier::NoConnectivity => "No UDP connectivity",
            AlertTier::Symmetric => "Symmetric NAT detected",
            AlertTier::PortRestricted => "Port restricted cone NAT detected",
            AlertTier::RestrictedCone => "Restricted cone NAT detected",
        }
    }
}

/// Everything an [`AlertSurface`] needs to render an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertInfo {
    /// How loudly to show the alert.
    pub severity: Severity,
    /// Short title, see [`AlertTier::title`].
    pub title: &'static str,
    /// The ports the operator should forward, empty if forwarding would not help.
    pub ports_to_forward: PortSet,
}

impl AlertInfo {
    pub(crate) fn new(tier: AlertTier, ports: &PortSet) -> Self {
        Self {
            severity: tier.severity(),
            title: tier.title(),
            ports_to_forward: if tier.suggests_port_forward() {
                ports.clone()
            } else {
                PortSet::new()
            },
        }
    }
}

/// Where alerts go.
///
/// Raising a tier that is already raised should replace its contents.  Clearing a tier
/// that is not raised must be harmless.
pub trait AlertSurface: std::fmt::Debug + Send + Sync + 'static {
    /// Shows an alert.
    fn raise(&self, tier: AlertTier, info: AlertInfo);

    /// Removes an alert.
    fn clear(&self, tier: AlertTier);
}

/// An [`AlertSurface`] which only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAlerts;

impl AlertSurface for LoggingAlerts {
    fn raise(&self, tier: AlertTier, info: AlertInfo) {
        warn!(%tier, severity = %info.severity, ports = ?info.ports_to_forward, "{}", info.title);
    }

    fn clear(&self, tier: AlertTier) {
        info!(%tier, "alert cleared");
    }
}
