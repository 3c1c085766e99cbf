//! Aggregates the readings of a detection round into one [`ConnectivityVerdict`].
//!
//! The policy is "most restrictive wins, unless contradicted": a class is only reported if
//! no reading claims something strictly less restrictive.  A single probe seeing the node
//! as open therefore outweighs any number of probes seeing a cone NAT, while a lone
//! [`NatClass::NoUdp`] is only believed if nobody managed to see any UDP at all.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    alerts::AlertTier,
    nat::{NatClass, RawReading},
};

/// One entry of the aggregation policy.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// The class reported when this rule matches.
    pub class: NatClass,
    /// Classes whose presence contradicts [`Rule::class`].
    pub contradicted_by: &'static [NatClass],
}

/// The aggregation policy, most restrictive class first.
///
/// The first rule whose class has at least one reading and none of whose contradicting
/// classes has any reading decides the verdict.
pub const RULES: &[Rule] = &[
    Rule {
        class: NatClass::NoUdp,
        contradicted_by: &[
            NatClass::Open,
            NatClass::FullCone,
            NatClass::RestrictedCone,
            NatClass::PortRestricted,
            NatClass::Symmetric,
        ],
    },
    Rule {
        class: NatClass::Symmetric,
        contradicted_by: &[
            NatClass::Open,
            NatClass::FullCone,
            NatClass::RestrictedCone,
            NatClass::PortRestricted,
        ],
    },
    Rule {
        class: NatClass::PortRestricted,
        contradicted_by: &[NatClass::Open, NatClass::FullCone, NatClass::RestrictedCone],
    },
    Rule {
        class: NatClass::RestrictedCone,
        contradicted_by: &[NatClass::Open, NatClass::FullCone],
    },
    Rule {
        class: NatClass::FullCone,
        contradicted_by: &[NatClass::Open],
    },
    Rule {
        class: NatClass::Open,
        contradicted_by: &[],
    },
];

/// Counts readings per [`NatClass`], ignoring [`NatClass::Unsupported`].
pub fn tally<'a>(readings: impl IntoIterator<Item = &'a RawReading>) -> BTreeMap<NatClass, usize> {
    let mut counts = BTreeMap::new();
    for reading in readings {
        let class = reading.nat_type.class();
        if class == NatClass::Unsupported {
            continue;
        }
        *counts.entry(class).or_insert(0) += 1;
    }
    counts
}

/// Aggregates readings into a single class following [`RULES`].
///
/// Returns [`NatClass::Unsupported`] if no reading expresses an opinion.  The caller is
/// responsible for passing only valid readings, see [`RawReading::is_valid`].
pub fn aggregate<'a>(readings: impl IntoIterator<Item = &'a RawReading>) -> NatClass {
    let counts = tally(readings);
    let present = |class: &NatClass| counts.get(class).is_some_and(|n| *n > 0);
    RULES
        .iter()
        .find(|rule| present(&rule.class) && !rule.contradicted_by.iter().any(present))
        .map(|rule| rule.class)
        .unwrap_or(NatClass::Unsupported)
}

/// The detector's current belief about the node's reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityVerdict {
    /// The class decided by the most recent successful round, if any round succeeded yet.
    pub class: Option<NatClass>,
    /// Set while there is no fresh data backing [`ConnectivityVerdict::class`].
    pub uncertain: bool,
}

impl Default for ConnectivityVerdict {
    fn default() -> Self {
        Self::unknown()
    }
}

impl ConnectivityVerdict {
    /// The verdict before any round has succeeded.
    pub const fn unknown() -> Self {
        Self {
            class: None,
            uncertain: true,
        }
    }

    /// The verdict published after a successful round.
    pub const fn from_class(class: NatClass) -> Self {
        Self {
            class: Some(class),
            uncertain: matches!(class, NatClass::Unsupported),
        }
    }

    /// The alert tier this verdict calls for, if any.
    pub fn alert_tier(&self) -> Option<AlertTier> {
        match self.class? {
            NatClass::NoUdp => Some(AlertTier::NoConnectivity),
            NatClass::Symmetric => Some(AlertTier::Symmetric),
            NatClass::PortRestricted => Some(AlertTier::PortRestricted),
            NatClass::RestrictedCone => Some(AlertTier::RestrictedCone),
            NatClass::FullCone | NatClass::Open | NatClass::Unsupported => None,
        }
    }

    /// Whether the operator should be asked to forward ports.
    pub fn suggests_port_forward(&self) -> bool {
        self.alert_tier().is_some()
    }
}

impl fmt::Display for ConnectivityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.class, self.uncertain) {
            (None, _) => write!(f, "unknown"),
            (Some(class), false) => write!(f, "{class}"),
            (Some(class), true) => write!(f, "{class} (uncertain)"),
        }
    }
}
