//! Checksum verification
//!
//! Recomputes the RFC 1071 internet checksum for the headers that carry one
//! and compares it against the stored value. The stored field is treated as
//! zero during the computation, so a valid header recomputes to exactly the
//! value it carries.
//!
//! Link-layer frame check sequences are not present in typical captures (the
//! NIC strips them), so Ethernet frames report as skipped rather than
//! invalid. The same applies where a checksum is uncomputable: truncated
//! headers, fragmented datagrams, and transport headers not enclosed in
//! IPv4.

use crate::buffer::{ByteView, ViewError};
use crate::core::packet::{HeaderInstance, PacketState};
use crate::protocols::{ids, ProtocolId};

/// Verification result for a single checksum-bearing header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    Valid,
    Invalid { expected: u16, found: u16 },
    /// The checksum could not be computed from the captured bytes
    Skipped,
}

/// One verified checksum, tied back to the header it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumReport {
    pub protocol: ProtocolId,
    pub offset: usize,
    pub status: ChecksumStatus,
}

impl ChecksumReport {
    pub fn is_invalid(&self) -> bool {
        matches!(self.status, ChecksumStatus::Invalid { .. })
    }
}

/// Recomputes and compares the checksums of a decoded frame
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Verify every checksum-bearing header in the frame
    ///
    /// Reports are returned in header scan order. Headers whose checksum
    /// cannot be computed are reported as [`ChecksumStatus::Skipped`], never
    /// as invalid.
    pub fn verify(view: &ByteView, state: &PacketState) -> Vec<ChecksumReport> {
        let mut reports: Vec<ChecksumReport> = Vec::new();

        for (index, header) in state.headers().iter().enumerate() {
            let status: Option<ChecksumStatus> = match header.protocol {
                ids::IP4 => Some(Self::verify_ip4(view, header)),
                ids::ICMP => Some(Self::verify_icmp(view, state, index)),
                ids::TCP => Some(Self::verify_transport(view, state, index, 6, 16)),
                ids::UDP => Some(Self::verify_udp(view, state, index)),
                _ => None,
            };

            if let Some(status) = status {
                reports.push(ChecksumReport {
                    protocol: header.protocol,
                    offset: header.offset,
                    status,
                });
            }
        }

        reports
    }

    /// IPv4 header checksum, covering the header bytes only
    fn verify_ip4(view: &ByteView, header: &HeaderInstance) -> ChecksumStatus {
        if header.truncated {
            return ChecksumStatus::Skipped;
        }
        let computed: Result<(u16, u16), ViewError> = (|| {
            let bytes: &[u8] = view.get_bytes(header.offset, header.length)?;
            let found: u16 = view.get_u16(header.offset + 10)?;
            Ok((checksum_excluding(0, bytes, 10), found))
        })();
        status_of(computed)
    }

    /// ICMP checksum, covering the message from the ICMP header to the end
    /// of the enclosing IPv4 datagram
    fn verify_icmp(view: &ByteView, state: &PacketState, index: usize) -> ChecksumStatus {
        let header: &HeaderInstance = &state.headers()[index];
        let Some(ip) = enclosing_ip4(state, index) else {
            return ChecksumStatus::Skipped;
        };
        if header.truncated || ip.fragmented {
            return ChecksumStatus::Skipped;
        }

        let computed: Result<(u16, u16), ViewError> = (|| {
            let total_length: usize = view.get_u16(ip.offset + 2)? as usize;
            let end: usize = ip.offset + total_length;
            if end > view.size() || end < header.offset {
                return Err(ViewError::OutOfBounds {
                    offset: header.offset,
                    width: total_length,
                    size: view.size(),
                });
            }
            let message: &[u8] = view.get_bytes(header.offset, end - header.offset)?;
            let found: u16 = view.get_u16(header.offset + 2)?;
            Ok((checksum_excluding(0, message, 2), found))
        })();
        status_of(computed)
    }

    /// UDP checksum; a stored value of zero means the sender skipped the
    /// computation and verifies as valid
    fn verify_udp(view: &ByteView, state: &PacketState, index: usize) -> ChecksumStatus {
        let header: &HeaderInstance = &state.headers()[index];
        match view.get_u16(header.offset + 6) {
            Ok(0) => ChecksumStatus::Valid,
            Ok(_) => Self::verify_transport(view, state, index, 17, 6),
            Err(_) => ChecksumStatus::Skipped,
        }
    }

    /// TCP/UDP checksum over the IPv4 pseudo-header plus the whole segment
    fn verify_transport(
        view: &ByteView,
        state: &PacketState,
        index: usize,
        ip_protocol: u8,
        field: usize,
    ) -> ChecksumStatus {
        let header: &HeaderInstance = &state.headers()[index];
        let Some(ip) = enclosing_ip4(state, index) else {
            return ChecksumStatus::Skipped;
        };
        // A fragment carries only part of the segment the checksum covers
        if header.truncated || ip.fragmented {
            return ChecksumStatus::Skipped;
        }

        let computed: Result<(u16, u16), ViewError> = (|| {
            let total_length: usize = view.get_u16(ip.offset + 2)? as usize;
            let ip_header_length: usize = ((view.get_u8(ip.offset)? & 0x0F) as usize) * 4;
            let segment_length: usize = total_length.saturating_sub(ip_header_length);
            let segment: &[u8] = view.get_bytes(header.offset, segment_length)?;
            let found: u16 = view.get_u16(header.offset + field)?;

            let mut sum: u32 = word_sum(0, view.get_bytes(ip.offset + 12, 8)?);
            sum += ip_protocol as u32;
            sum += segment_length as u32;
            Ok((checksum_excluding(sum, segment, field), found))
        })();
        status_of(computed)
    }
}

/// Nearest preceding IPv4 header, the datagram this header travels in
fn enclosing_ip4(state: &PacketState, index: usize) -> Option<&HeaderInstance> {
    state.headers()[..index]
        .iter()
        .rev()
        .find(|h: &&HeaderInstance| h.protocol == ids::IP4)
}

fn status_of(computed: Result<(u16, u16), ViewError>) -> ChecksumStatus {
    match computed {
        Ok((expected, found)) if expected == found => ChecksumStatus::Valid,
        Ok((expected, found)) => ChecksumStatus::Invalid { expected, found },
        Err(_) => ChecksumStatus::Skipped,
    }
}

/// Add a byte run to a ones-complement accumulator as big-endian 16-bit
/// words; an odd trailing byte is padded with zero
fn word_sum(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Finish an internet checksum over `bytes`, treating the 16-bit field at
/// byte index `field` (which must be even) as zero
fn checksum_excluding(seed: u32, bytes: &[u8], field: usize) -> u16 {
    let mut sum: u32 = word_sum(seed, &bytes[..field.min(bytes.len())]);
    if field + 2 <= bytes.len() {
        sum = word_sum(sum, &bytes[field + 2..]);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
