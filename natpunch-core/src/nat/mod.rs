//! NAT behaviour descriptors.
//!
//! A [`NatDescriptor`] records how the router in front of a node translates
//! addresses: how outbound mappings are chosen (mapping), how public ports are
//! allocated (allocation) and which inbound packets are let through
//! (filtering). The descriptor travels in every message header as a fixed
//! 12-byte block.
//!
//! # Examples
//!
//! ```rust
//! use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy, NatDescriptor};
//!
//! let nat = NatDescriptor::natted(
//!     MappingPolicy::EndpointIndependent,
//!     AllocationPolicy::PortPreservation,
//!     FilteringPolicy::AddressDependent,
//! );
//! assert!(!nat.is_open());
//! assert!(nat.hp_algorithm().is_possible());
//! ```

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of the encoded descriptor.
pub const NAT_DESCRIPTOR_LEN: usize = 12;

const FLAG_OPEN: u8 = 0b01;
const FLAG_UPNP: u8 = 0b10;

/// How the NAT picks the public endpoint for an outbound flow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum MappingPolicy {
    /// Same public endpoint regardless of destination.
    #[default]
    EndpointIndependent = 0,
    /// A new public endpoint per destination IP.
    AddressDependent = 1,
    /// A new public endpoint per destination IP and port.
    AddressAndPortDependent = 2,
}

/// How the NAT allocates the public port of a new mapping.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum AllocationPolicy {
    /// Public port equals the private port.
    #[default]
    PortPreservation = 0,
    /// Public ports grow by a predictable delta.
    PortContiguity = 1,
    Random = 2,
}

/// Which inbound packets the NAT forwards to an existing mapping.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum FilteringPolicy {
    #[default]
    EndpointIndependent = 0,
    AddressDependent = 1,
    AddressAndPortDependent = 2,
}

/// Traversal technique that works for this NAT.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum HpAlgorithm {
    /// No NAT, nothing to punch.
    #[default]
    None = 0,
    /// Plain hole punching against the public endpoint.
    SimpleHolePunching = 1,
    /// Hole punching against a predicted port.
    PortPrediction = 2,
    NotPossible = 3,
}

impl HpAlgorithm {
    pub fn is_possible(&self) -> bool {
        !matches!(self, HpAlgorithm::NotPossible)
    }
}

macro_rules! try_from_u8 {
    ($ty:ident, $field:literal, [$($value:literal => $variant:ident),+ $(,)?]) => {
        impl TryFrom<u8> for $ty {
            type Error = Error;

            fn try_from(value: u8) -> Result<Self> {
                match value {
                    $($value => Ok($ty::$variant),)+
                    value => Err(Error::InvalidNat { field: $field, value }),
                }
            }
        }
    };
}

try_from_u8!(MappingPolicy, "mapping", [
    0 => EndpointIndependent,
    1 => AddressDependent,
    2 => AddressAndPortDependent,
]);
try_from_u8!(AllocationPolicy, "allocation", [
    0 => PortPreservation,
    1 => PortContiguity,
    2 => Random,
]);
try_from_u8!(FilteringPolicy, "filtering", [
    0 => EndpointIndependent,
    1 => AddressDependent,
    2 => AddressAndPortDependent,
]);
try_from_u8!(HpAlgorithm, "hp_algorithm", [
    0 => None,
    1 => SimpleHolePunching,
    2 => PortPrediction,
    3 => NotPossible,
]);

/// Structural description of a node's NAT.
///
/// `is_open` is fixed at construction: an open descriptor means the node is
/// directly reachable and needs no rendezvous parents.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct NatDescriptor {
    open: bool,
    pub mapping: MappingPolicy,
    pub allocation: AllocationPolicy,
    pub filtering: FilteringPolicy,
    hp_algorithm: HpAlgorithm,
    /// Port delta observed for [`AllocationPolicy::PortContiguity`].
    pub delta: u8,
    /// How long an idle mapping survives, in milliseconds.
    pub binding_timeout_ms: u32,
    /// Public port mapped through UPnP, if any.
    pub upnp_port: Option<u16>,
}

impl Default for NatDescriptor {
    fn default() -> Self {
        NatDescriptor::open()
    }
}

impl NatDescriptor {
    pub fn open() -> Self {
        Self {
            open: true,
            mapping: MappingPolicy::EndpointIndependent,
            allocation: AllocationPolicy::PortPreservation,
            filtering: FilteringPolicy::EndpointIndependent,
            hp_algorithm: HpAlgorithm::None,
            delta: 0,
            binding_timeout_ms: 0,
            upnp_port: None,
        }
    }

    pub fn natted(
        mapping: MappingPolicy,
        allocation: AllocationPolicy,
        filtering: FilteringPolicy,
    ) -> Self {
        let mut nat = Self {
            open: false,
            mapping,
            allocation,
            filtering,
            hp_algorithm: HpAlgorithm::NotPossible,
            delta: 0,
            binding_timeout_ms: 0,
            upnp_port: None,
        };
        nat.hp_algorithm = nat.derive_algorithm();
        nat
    }

    pub fn with_delta(mut self, delta: u8) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_binding_timeout(mut self, binding_timeout_ms: u32) -> Self {
        self.binding_timeout_ms = binding_timeout_ms;
        self
    }

    pub fn with_upnp(mut self, port: u16) -> Self {
        self.upnp_port = Some(port);
        self
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[inline]
    pub fn is_upnp(&self) -> bool {
        self.upnp_port.is_some()
    }

    #[inline]
    pub fn hp_algorithm(&self) -> HpAlgorithm {
        self.hp_algorithm
    }

    fn derive_algorithm(&self) -> HpAlgorithm {
        if self.open {
            return HpAlgorithm::None;
        }
        match (self.mapping, self.allocation) {
            (MappingPolicy::EndpointIndependent, _) => HpAlgorithm::SimpleHolePunching,
            (_, AllocationPolicy::PortPreservation | AllocationPolicy::PortContiguity) => {
                HpAlgorithm::PortPrediction
            }
            _ => HpAlgorithm::NotPossible,
        }
    }

    /// Writes the 12-byte wire form.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut flags = 0;
        if self.open {
            flags |= FLAG_OPEN;
        }
        if self.upnp_port.is_some() {
            flags |= FLAG_UPNP;
        }
        buf.put_u8(flags);
        buf.put_u8(self.mapping as u8);
        buf.put_u8(self.allocation as u8);
        buf.put_u8(self.filtering as u8);
        buf.put_u8(self.hp_algorithm as u8);
        buf.put_u8(self.delta);
        buf.put_u32(self.binding_timeout_ms);
        buf.put_u16(self.upnp_port.unwrap_or(0));
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < NAT_DESCRIPTOR_LEN {
            return Err(Error::Truncated {
                need: NAT_DESCRIPTOR_LEN,
                remaining: buf.remaining(),
            });
        }
        let flags = buf.get_u8();
        let mapping = MappingPolicy::try_from(buf.get_u8())?;
        let allocation = AllocationPolicy::try_from(buf.get_u8())?;
        let filtering = FilteringPolicy::try_from(buf.get_u8())?;
        let hp_algorithm = HpAlgorithm::try_from(buf.get_u8())?;
        let delta = buf.get_u8();
        let binding_timeout_ms = buf.get_u32();
        let upnp_port = buf.get_u16();
        Ok(Self {
            open: flags & FLAG_OPEN != 0,
            mapping,
            allocation,
            filtering,
            hp_algorithm,
            delta,
            binding_timeout_ms,
            upnp_port: (flags & FLAG_UPNP != 0).then_some(upnp_port),
        })
    }
}

impl std::fmt::Display for NatDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.open {
            return write!(f, "OPEN");
        }
        let m = match self.mapping {
            MappingPolicy::EndpointIndependent => "EI",
            MappingPolicy::AddressDependent => "HD",
            MappingPolicy::AddressAndPortDependent => "PD",
        };
        let a = match self.allocation {
            AllocationPolicy::PortPreservation => "PP",
            AllocationPolicy::PortContiguity => "PC",
            AllocationPolicy::Random => "RD",
        };
        let fl = match self.filtering {
            FilteringPolicy::EndpointIndependent => "EI",
            FilteringPolicy::AddressDependent => "HD",
            FilteringPolicy::AddressAndPortDependent => "PD",
        };
        write!(f, "NAT_{m}_{a}_{fl}")?;
        if let Some(port) = self.upnp_port {
            write!(f, "_UPNP({port})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn algorithm_follows_mapping() {
        let ei = NatDescriptor::natted(
            MappingPolicy::EndpointIndependent,
            AllocationPolicy::Random,
            FilteringPolicy::AddressAndPortDependent,
        );
        assert_eq!(ei.hp_algorithm(), HpAlgorithm::SimpleHolePunching);
        let pc = NatDescriptor::natted(
            MappingPolicy::AddressAndPortDependent,
            AllocationPolicy::PortContiguity,
            FilteringPolicy::AddressAndPortDependent,
        );
        assert_eq!(pc.hp_algorithm(), HpAlgorithm::PortPrediction);
        let rd = NatDescriptor::natted(
            MappingPolicy::AddressDependent,
            AllocationPolicy::Random,
            FilteringPolicy::EndpointIndependent,
        );
        assert!(!rd.hp_algorithm().is_possible());
        assert_eq!(NatDescriptor::open().hp_algorithm(), HpAlgorithm::None);
    }

    #[test]
    fn wire_form_is_twelve_bytes() {
        let nat = NatDescriptor::natted(
            MappingPolicy::AddressDependent,
            AllocationPolicy::PortContiguity,
            FilteringPolicy::AddressDependent,
        )
        .with_delta(2)
        .with_binding_timeout(30_000)
        .with_upnp(40_000);
        let mut buf = BytesMut::new();
        nat.encode(&mut buf);
        assert_eq!(buf.len(), NAT_DESCRIPTOR_LEN);
        assert_eq!(buf[0], FLAG_UPNP);
        let decoded = NatDescriptor::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, nat);
    }

    #[test]
    fn rejects_unknown_policy() {
        let mut raw = [0u8; NAT_DESCRIPTOR_LEN];
        raw[1] = 9;
        let err = NatDescriptor::decode(&mut &raw[..]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidNat {
                field: "mapping",
                value: 9
            }
        ));
        let err = NatDescriptor::decode(&mut &raw[..4]).unwrap_err();
        assert!(matches!(err, Error::Truncated { need: 12, .. }));
    }
}
