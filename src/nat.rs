//! NAT types as reported by probes, and the classes they are aggregated into.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// The NAT behaviour a probe believes the node is behind.
///
/// Variants are ordered from least to most restrictive, with [`NatType::Unsupported`] last
/// as it carries no opinion at all.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum NatType {
    /// Directly on the internet, no NAT and no firewall.
    Open,
    /// Any external host can send to the mapped port.
    FullCone,
    /// External hosts we have sent to can reach us, from any port.
    RestrictedCone,
    /// External hosts we have sent to can reach us, only from the port we sent to.
    PortRestricted,
    /// A new mapping is created for every destination.
    SymmetricNat,
    /// No NAT, but a firewall behaving like a symmetric NAT.
    SymmetricUdpFirewall,
    /// UDP is blocked entirely.
    NoUdp,
    /// The probe could not determine anything.
    Unsupported,
}

impl NatType {
    /// The aggregation class of this type.
    ///
    /// Both symmetric flavours collapse into [`NatClass::Symmetric`].
    pub const fn class(self) -> NatClass {
        match self {
            NatType::Open => NatClass::Open,
            NatType::FullCone => NatClass::FullCone,
            NatType::RestrictedCone => NatClass::RestrictedCone,
            NatType::PortRestricted => NatClass::PortRestricted,
            NatType::SymmetricNat | NatType::SymmetricUdpFirewall => NatClass::Symmetric,
            NatType::NoUdp => NatClass::NoUdp,
            NatType::Unsupported => NatClass::Unsupported,
        }
    }
}

/// The classes readings are counted in when building a verdict.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum NatClass {
    /// Reachable from the open internet.
    Open,
    /// Full cone NAT.
    FullCone,
    /// Restricted cone NAT.
    RestrictedCone,
    /// Port restricted cone NAT.
    PortRestricted,
    /// Symmetric NAT or symmetric UDP firewall.
    Symmetric,
    /// No UDP connectivity.
    NoUdp,
    /// No usable opinion.
    Unsupported,
}

/// One probe's opinion about the node's reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawReading {
    /// The address the probe saw the node at, if any.
    pub public_addr: Option<IpAddr>,
    /// The NAT type the probe believes the node is behind.
    pub nat_type: NatType,
}

impl RawReading {
    /// Creates a new reading.
    pub fn new(public_addr: impl Into<Option<IpAddr>>, nat_type: NatType) -> Self {
        Self {
            public_addr: public_addr.into(),
            nat_type,
        }
    }

    /// Whether this reading carries a plausibly public address.
    ///
    /// Readings failing this are a sign the probe could not get out at all, they must
    /// never be taken as [`NatType::Open`].
    pub fn is_valid(&self) -> bool {
        self.public_addr.is_some_and(is_plausibly_public)
    }
}

/// Whether `addr` could be the address of a node on the public internet.
///
/// IPv4-mapped IPv6 addresses are judged by their IPv4 address.
pub fn is_plausibly_public(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(addr) => is_ipv4_public(addr),
        IpAddr::V6(addr) => match addr.to_ipv4_mapped() {
            Some(v4) => is_ipv4_public(v4),
            None => is_ipv6_public(addr),
        },
    }
}

// Stable adaptation of `Ipv4Addr::is_global`.
const fn is_ipv4_public(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    !(octets[0] == 0 // "This network"
        || addr.is_private()
        || (octets[0] == 100 && (octets[1] & 0b1100_0000 == 0b0100_0000)) // shared, CGNAT
        || addr.is_loopback()
        || addr.is_link_local()
        // reserved for future protocols (`192.0.0.0/24`)
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        || addr.is_documentation()
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18) // benchmarking
        || addr.is_multicast()
        || octets[0] & 240 == 240) // reserved, includes broadcast
}

// Stable adaptation of `Ipv6Addr::is_global`, keeping only the ranges a node could
// plausibly be mistaken to live in.
const fn is_ipv6_public(addr: Ipv6Addr) -> bool {
    let segments = addr.segments();
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        // Discard-Only Address Block (`100::/64`)
        || (segments[0] == 0x100 && segments[1] == 0 && segments[2] == 0 && segments[3] == 0)
        || (segments[0] == 0x2001 && segments[1] == 0xdb8) // documentation
        || (segments[0] & 0xfe00) == 0xfc00 // unique local
        || (segments[0] & 0xffc0) == 0xfe80) // unicast link local
}
