//! Decoded packet state
//!
//! This module defines the per-frame decode result: the ordered list of
//! decoded header instances and the per-bank protocol presence bitmasks that
//! back the O(1) has-header queries.

use crate::protocols::{id_to_group, ProtocolId, BANK_COUNT, MAX_ID_COUNT};

/// One decoded occurrence of a protocol header within a specific frame
///
/// Instances are `(offset, length)` indices into the frame's byte view, never
/// pointers into capture memory; they stay meaningful for exactly as long as
/// the frame buffer they index does. A component retaining headers past the
/// current frame callback must deep-copy the frame first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInstance {
    /// Protocol id of the decoded header
    pub protocol: ProtocolId,
    /// Byte offset of the header within the frame
    pub offset: usize,
    /// Byte length of the header
    pub length: usize,
    /// Index of the enclosing header, for sub-headers
    pub parent: Option<usize>,
    /// Set when the declared header length exceeded the captured bytes
    pub truncated: bool,
    /// Set when the header carries a fragment of a larger datagram
    pub fragmented: bool,
}

impl HeaderInstance {
    /// Create a top-level header instance
    pub fn top_level(protocol: ProtocolId, offset: usize, length: usize) -> Self {
        Self {
            protocol,
            offset,
            length,
            parent: None,
            truncated: false,
            fragmented: false,
        }
    }

    /// Create a sub-header instance nested inside the header at `parent`
    pub fn sub_header(
        protocol: ProtocolId,
        offset: usize,
        length: usize,
        parent: usize,
    ) -> Self {
        Self {
            protocol,
            offset,
            length,
            parent: Some(parent),
            truncated: false,
            fragmented: false,
        }
    }

    /// First byte offset past the header
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Check whether this instance is a sub-header
    pub fn is_sub_header(&self) -> bool {
        self.parent.is_some()
    }
}

/// Per-frame decode result
///
/// Holds the ordered header list, one presence bitmask per 32-id bank, and
/// the frame sequence number assigned by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketState {
    headers: Vec<HeaderInstance>,
    masks: [u32; BANK_COUNT],
    frame_number: u64,
}

impl PacketState {
    /// Create an empty state for the given frame sequence number
    pub fn new(frame_number: u64) -> Self {
        Self {
            headers: Vec::new(),
            masks: [0; BANK_COUNT],
            frame_number,
        }
    }

    /// Append a header instance, returning its index
    pub fn push(&mut self, header: HeaderInstance) -> usize {
        if (header.protocol as usize) < MAX_ID_COUNT {
            let group: usize = id_to_group(header.protocol) as usize;
            self.masks[group] |= 1u32 << (header.protocol & 31);
        }
        self.headers.push(header);
        self.headers.len() - 1
    }

    /// Check whether a header of the given protocol is present, O(1)
    pub fn has_header(&self, id: ProtocolId) -> bool {
        if (id as usize) >= MAX_ID_COUNT {
            return self.headers.iter().any(|h: &HeaderInstance| h.protocol == id);
        }
        let group: usize = id_to_group(id) as usize;
        self.masks[group] & (1u32 << (id & 31)) != 0
    }

    /// Check whether every protocol encoded in a single-bank mask is present
    ///
    /// The mask must come from [`crate::protocols::create_mask_from_ids`].
    pub fn has_all_of(&self, mask: u64) -> bool {
        let group: usize = (mask >> 32) as usize;
        let bits: u32 = mask as u32;
        group < BANK_COUNT && self.masks[group] & bits == bits
    }

    /// Count the occurrences of a protocol in this frame
    pub fn header_count(&self, id: ProtocolId) -> usize {
        self.headers
            .iter()
            .filter(|h: &&HeaderInstance| h.protocol == id)
            .count()
    }

    /// Get the nth occurrence of a protocol header
    pub fn get_header(&self, id: ProtocolId, instance: usize) -> Option<&HeaderInstance> {
        self.headers
            .iter()
            .filter(|h: &&HeaderInstance| h.protocol == id)
            .nth(instance)
    }

    /// All decoded headers, in scan order
    pub fn headers(&self) -> &[HeaderInstance] {
        &self.headers
    }

    /// Frame sequence number assigned during scanning
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }
}
