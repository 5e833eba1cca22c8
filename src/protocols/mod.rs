//! Protocol descriptors and registry for Hexframe
//!
//! This module defines the declarative protocol tables that drive header
//! scanning: protocol identifiers partitioned into 32-id banks, the bitmask
//! algebra over those banks, header length rules, binding rules and the
//! registry that owns all of it. The registry is built once at startup and
//! passed by reference to the scanner; nothing here is global state.

pub mod table;

use std::collections::HashMap;

use thiserror::Error;

use crate::buffer::ByteView;
use crate::core::packet::HeaderInstance;

/// Unique integer naming a protocol
pub type ProtocolId = u32;

/// Well-known protocol identifiers
///
/// Ids are partitioned into banks of 32 (`bank = id >> 5`) so that any subset
/// of ids from the same bank can be combined into a single 64-bit mask.
/// Link, network and transport protocols live in bank 0; application-layer
/// text protocols live in bank 1.
pub mod ids {
    use super::ProtocolId;

    /// Catch-all for untyped trailing bytes
    pub const PAYLOAD: ProtocolId = 0;
    pub const ETHERNET: ProtocolId = 1;
    pub const IP4: ProtocolId = 2;
    pub const IP6: ProtocolId = 3;
    pub const TCP: ProtocolId = 4;
    pub const UDP: ProtocolId = 5;
    pub const ICMP: ProtocolId = 6;
    pub const VLAN: ProtocolId = 7;
    pub const ARP: ProtocolId = 8;
    /// BSD loopback encapsulation; family field is in host byte order
    pub const NULL_HEADER: ProtocolId = 9;
    pub const GRE: ProtocolId = 10;
    pub const L2TP: ProtocolId = 11;
    /// IPv4 options, a sub-header sharing the IPv4 header's byte range
    pub const IP4_OPTIONS: ProtocolId = 12;
    /// TCP options, a sub-header sharing the TCP header's byte range
    pub const TCP_OPTIONS: ProtocolId = 13;

    // Bank 1: application layer
    pub const HTTP: ProtocolId = 32;
}

/// Number of ids per bitmask bank
pub const BANK_SIZE: u32 = 32;

/// Highest protocol id count supported by a `PacketState` bitmask array
pub const MAX_ID_COUNT: usize = 64;

/// Number of banks covered by [`MAX_ID_COUNT`]
pub const BANK_COUNT: usize = MAX_ID_COUNT / BANK_SIZE as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("protocol id {0} is already registered")]
    DuplicateRegistration(ProtocolId),

    #[error("protocol id {0} is not registered")]
    UnknownProtocol(ProtocolId),

    #[error("cannot combine ids from different banks: id {id} is in bank {group}, expected bank {expected}")]
    MixedBankMask {
        id: ProtocolId,
        group: u32,
        expected: u32,
    },

    #[error("cannot build a mask from an empty id list")]
    EmptyMask,
}

/// Get the bank a protocol id belongs to
pub fn id_to_group(id: ProtocolId) -> u32 {
    id >> 5
}

/// Encode a single protocol id as a `(bank << 32) | bit` mask
pub fn id_to_mask(id: ProtocolId) -> u64 {
    ((id_to_group(id) as u64) << 32) | (1u64 << (id & 31))
}

/// Get the bank a mask belongs to
pub fn mask_to_group(mask: u64) -> u32 {
    (mask >> 32) as u32
}

/// Recover the protocol id from a single-bit mask
pub fn mask_to_id(mask: u64) -> ProtocolId {
    let bit: u32 = (mask as u32).trailing_zeros();
    (mask_to_group(mask) << 5) | bit
}

/// Combine protocol ids into one mask, enforcing that all of them live in
/// the same bank
///
/// Combining ids from different banks is a contract violation and fails
/// fast; it never yields a silently corrupted mask.
pub fn create_mask_from_ids(protocol_ids: &[ProtocolId]) -> Result<u64, RegistryError> {
    let first: ProtocolId = *protocol_ids.first().ok_or(RegistryError::EmptyMask)?;
    let expected: u32 = id_to_group(first);

    let mut mask: u64 = 0;
    for &id in protocol_ids {
        let group: u32 = id_to_group(id);
        if group != expected {
            return Err(RegistryError::MixedBankMask {
                id,
                group,
                expected,
            });
        }
        mask |= id_to_mask(id);
    }

    Ok(mask)
}

/// Header length rule for a protocol
///
/// Most headers have a fixed byte length; others compute it from the buffer
/// (e.g. IPv4's IHL field, or L2TP's flag bits at offset 0). A dynamic rule
/// returns `None` when the bytes needed to compute the length are themselves
/// missing, which the scanner records as a truncated header.
#[derive(Clone, Copy)]
pub enum HeaderLength {
    Fixed(usize),
    Dynamic {
        /// Minimum bytes any instance of this header occupies
        min: usize,
        rule: fn(&ByteView, usize) -> Option<usize>,
    },
}

impl HeaderLength {
    /// Minimum byte length any instance of the header can have
    pub fn min(&self) -> usize {
        match self {
            HeaderLength::Fixed(len) => *len,
            HeaderLength::Dynamic { min, .. } => *min,
        }
    }
}

/// A sub-header occurrence produced by a parent header's sub-header rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubHeader {
    pub protocol: ProtocolId,
    pub offset: usize,
    pub length: usize,
}

/// Rule producing the sub-headers contained in a decoded parent header
pub type SubHeaderRule = fn(&ByteView, &HeaderInstance) -> Vec<SubHeader>;

/// Rule deciding whether a header instance carries a fragment of a larger
/// datagram
pub type FragmentationRule = fn(&ByteView, &HeaderInstance) -> bool;

/// Whether a binding is specification-driven or a best-guess fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// A certain, specification-driven binding
    Primary,
    /// A fallback binding tried only when no primary binding matched
    Heuristic,
}

/// Cheap tag compare evaluated before a binding's full predicate
///
/// Offsets are relative to the start of the parent header. A guard that
/// reads past the buffer simply does not match.
#[derive(Debug, Clone, Copy)]
pub enum BindingGuard {
    U8At { offset: usize, value: u8 },
    U16At { offset: usize, value: u16 },
    PrefixAt { offset: usize, bytes: &'static [u8] },
}

impl BindingGuard {
    /// Check the guard against the parent header's bytes
    pub fn matches(&self, view: &ByteView, parent: &HeaderInstance) -> bool {
        match *self {
            BindingGuard::U8At { offset, value } => {
                view.get_u8(parent.offset + offset) == Ok(value)
            }
            BindingGuard::U16At { offset, value } => {
                view.get_u16(parent.offset + offset) == Ok(value)
            }
            BindingGuard::PrefixAt { offset, bytes } => view
                .get_bytes(parent.offset + offset, bytes.len())
                .map(|b: &[u8]| b == bytes)
                .unwrap_or(false),
        }
    }
}

/// Full binding predicate: does the target protocol follow this parent?
pub type BindingPredicate = fn(&ByteView, &HeaderInstance) -> bool;

/// A declared binding from a parent protocol to a candidate child protocol
#[derive(Clone, Copy)]
pub struct Binding {
    /// Protocol that follows the parent when this binding matches
    pub target: ProtocolId,
    pub kind: BindingKind,
    /// Optional fast-path tag compare evaluated before the predicate
    pub guard: Option<BindingGuard>,
    /// Headers that must already be present in the frame before the
    /// predicate is even tried; a pre-filter, not a correctness requirement
    pub requires: &'static [ProtocolId],
    pub predicate: BindingPredicate,
}

/// Static declarative descriptor for one protocol
pub struct ProtocolDescriptor {
    pub id: ProtocolId,
    pub name: &'static str,
    pub length: HeaderLength,
    /// Sub-headers sharing this header's byte range, if any
    pub sub_headers: Option<SubHeaderRule>,
    /// Rule flagging instances that carry a datagram fragment
    pub fragmentation: Option<FragmentationRule>,
    /// Candidate next-protocol bindings, in declaration order
    pub bindings: Vec<Binding>,
}

impl ProtocolDescriptor {
    /// Compute the header byte length at the given offset
    ///
    /// Returns `None` when the bytes needed to determine the length are not
    /// available in the buffer.
    pub fn header_length(&self, view: &ByteView, offset: usize) -> Option<usize> {
        match self.length {
            HeaderLength::Fixed(len) => Some(len),
            HeaderLength::Dynamic { rule, .. } => rule(view, offset),
        }
    }
}

/// Static table mapping protocol ids to their descriptors
///
/// Built once at process start and owned by the caller; registration order
/// does not matter and duplicate registration is an error.
pub struct ProtocolRegistry {
    descriptors: HashMap<ProtocolId, ProtocolDescriptor>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            descriptors: HashMap::new(),
        }
    }

    /// Create a registry populated with all built-in protocol descriptors
    pub fn builtin() -> Self {
        let mut registry: ProtocolRegistry = Self::new();
        for descriptor in table::builtin_descriptors() {
            // Built-in ids are distinct by construction
            registry
                .register(descriptor)
                .unwrap_or_else(|e| panic!("built-in protocol table is inconsistent: {}", e));
        }
        registry
    }

    /// Register a protocol descriptor
    pub fn register(&mut self, descriptor: ProtocolDescriptor) -> Result<(), RegistryError> {
        if self.descriptors.contains_key(&descriptor.id) {
            return Err(RegistryError::DuplicateRegistration(descriptor.id));
        }
        self.descriptors.insert(descriptor.id, descriptor);
        Ok(())
    }

    /// Look up a descriptor by protocol id
    pub fn lookup(&self, id: ProtocolId) -> Option<&ProtocolDescriptor> {
        self.descriptors.get(&id)
    }

    /// Compute the header length of protocol `id` at `offset` in `view`
    pub fn header_length(
        &self,
        id: ProtocolId,
        view: &ByteView,
        offset: usize,
    ) -> Result<Option<usize>, RegistryError> {
        let descriptor: &ProtocolDescriptor = self
            .lookup(id)
            .ok_or(RegistryError::UnknownProtocol(id))?;
        Ok(descriptor.header_length(view, offset))
    }

    /// Number of registered protocols
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &ByteView, _: &HeaderInstance) -> bool {
        false
    }

    fn descriptor(id: ProtocolId) -> ProtocolDescriptor {
        ProtocolDescriptor {
            id,
            name: "test",
            length: HeaderLength::Fixed(4),
            sub_headers: None,
            fragmentation: None,
            bindings: vec![Binding {
                target: ids::PAYLOAD,
                kind: BindingKind::Primary,
                guard: None,
                requires: &[],
                predicate: never,
            }],
        }
    }

    #[test]
    fn test_duplicate_registration_is_fatal() {
        let mut registry: ProtocolRegistry = ProtocolRegistry::new();
        registry.register(descriptor(40)).unwrap();
        assert_eq!(
            registry.register(descriptor(40)),
            Err(RegistryError::DuplicateRegistration(40))
        );
    }

    #[test]
    fn test_mask_round_trip_same_bank() {
        let mask: u64 = create_mask_from_ids(&[ids::IP4, ids::TCP, ids::ICMP]).unwrap();
        assert_eq!(mask_to_group(mask), 0);
        assert_eq!(mask & (1 << ids::IP4), 1 << ids::IP4);
        assert_eq!(mask_to_id(id_to_mask(ids::TCP)), ids::TCP);
        assert_eq!(mask_to_id(id_to_mask(ids::HTTP)), ids::HTTP);
    }

    #[test]
    fn test_mask_from_different_banks_fails_fast() {
        let result = create_mask_from_ids(&[ids::ETHERNET, ids::HTTP]);
        assert_eq!(
            result,
            Err(RegistryError::MixedBankMask {
                id: ids::HTTP,
                group: 1,
                expected: 0,
            })
        );
        assert_eq!(create_mask_from_ids(&[]), Err(RegistryError::EmptyMask));
    }

    #[test]
    fn test_bank_partitioning() {
        assert_eq!(id_to_group(ids::ETHERNET), 0);
        assert_eq!(id_to_group(ids::HTTP), 1);
        assert_eq!(id_to_mask(ids::HTTP), (1u64 << 32) | 1);
    }

    #[test]
    fn test_builtin_registry_is_consistent() {
        let registry: ProtocolRegistry = ProtocolRegistry::builtin();
        assert!(registry.lookup(ids::ETHERNET).is_some());
        assert!(registry.lookup(ids::IP4).is_some());
        assert!(registry.lookup(ids::PAYLOAD).is_some());
        assert!(registry.lookup(999).is_none());
    }
}
