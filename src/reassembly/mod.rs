//! IPv4 fragment reassembly
//!
//! Fragments are buffered per datagram identity and copied into a single
//! contiguous buffer laid out as a synthesized IPv4 header followed by the
//! reassembled payload:
//!
//! ```text
//! +-----------+-----------+-----------+--~~~~--+
//! | Ip header | fragment 1 | fragment 2 | etc... |
//! +-----------+-----------+-----------+--~~~~--+
//! ```
//!
//! The header is copied from the first fragment seen and a few fields are
//! reset to reflect the reassembled state (IHL, fragment flags/offset,
//! checksum, and total length once known). Incomplete reassemblies are timed
//! out through a deadline-ordered priority queue so a sweep touches only the
//! expired entries, not the whole map.

use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap};
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::{ByteOrder, ByteView, ViewError};
use crate::core::packet::HeaderInstance;

/// Bytes of synthesized IPv4 header at the front of a reassembly buffer
const HEADER_SIZE: usize = 20;

/// Hard cap on a reassembled datagram. The IPv4 total length field is 16
/// bits, so no datagram can exceed this regardless of what the fragment
/// offsets would admit; a fragment reaching past it is rejected rather than
/// letting the synthesized length field wrap.
const MAX_REASSEMBLED_SIZE: usize = u16::MAX as usize;

/// Default buffer allocation, grown on demand up to the hard cap
const DEFAULT_CAPACITY: usize = 8 * 1024;

const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("fragment at datagram offset {datagram_offset} with length {length} exceeds the maximum reassembled datagram size")]
    FragmentOutOfRange {
        datagram_offset: usize,
        length: usize,
    },

    #[error("header at offset {0} is not a decodable IPv4 header")]
    NotIp4(usize),

    #[error(transparent)]
    View(#[from] ViewError),
}

/// Result of submitting one IPv4 packet to the reassembly engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// The packet was not fragmented and passes through untouched
    Forwarded,
    /// The fragment was copied into a reassembly buffer that is still
    /// missing data
    Buffered,
    /// This fragment completed its datagram
    Completed(ReassembledDatagram),
}

/// A reassembled (or timed-out partial) IP datagram
///
/// The view starts at the synthesized IPv4 header and is suitable for
/// re-scanning with IPv4 as the initial protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledDatagram {
    pub view: ByteView,
    /// False when the buffer was timed out before the last fragment arrived
    pub complete: bool,
    /// Datagram identity hash the buffer was keyed by
    pub key: u32,
}

/// Accumulator for the fragments of one IP datagram
struct ReassemblyBuffer {
    data: Vec<u8>,
    /// Bytes copied so far, including the header up front
    bytes_received: usize,
    /// Total reassembled length; unknown until the last fragment is seen
    target_length: Option<usize>,
    /// Absolute timestamp after which the buffer is surfaced as incomplete
    deadline: SystemTime,
    key: u32,
}

impl ReassemblyBuffer {
    /// Create a buffer seeded with the fragment's IPv4 header as a template
    ///
    /// The copied header gets its IHL forced to 5, fragmentation fields
    /// cleared and checksum zeroed; options from the original header are not
    /// carried into the reassembled datagram.
    fn new(
        view: &ByteView,
        ip: &HeaderInstance,
        deadline: SystemTime,
        key: u32,
    ) -> Result<Self, ReassemblyError> {
        let mut data: Vec<u8> = vec![0; DEFAULT_CAPACITY];
        data[..HEADER_SIZE].copy_from_slice(view.get_bytes(ip.offset, HEADER_SIZE)?);

        data[0] = (data[0] & 0xF0) | 5; // version kept, IHL reset to 5
        let flags: u16 = u16::from_be_bytes([data[6], data[7]]);
        let cleared: u16 = flags & !(FLAG_MORE_FRAGMENTS | FRAGMENT_OFFSET_MASK);
        data[6..8].copy_from_slice(&cleared.to_be_bytes());
        data[10] = 0; // header checksum no longer valid
        data[11] = 0;

        Ok(Self {
            data,
            bytes_received: HEADER_SIZE,
            target_length: None,
            deadline,
            key,
        })
    }

    /// Copy one fragment's payload into the buffer
    ///
    /// `datagram_offset` is the fragment's payload offset within the
    /// original datagram; `packet_offset` is where the payload begins in the
    /// packet view. Overlapping fragments overwrite at the byte level,
    /// last write wins.
    fn add_fragment(
        &mut self,
        view: &ByteView,
        datagram_offset: usize,
        length: usize,
        packet_offset: usize,
    ) -> Result<(), ReassemblyError> {
        let end: usize = HEADER_SIZE + datagram_offset + length;
        if end > MAX_REASSEMBLED_SIZE {
            return Err(ReassemblyError::FragmentOutOfRange {
                datagram_offset,
                length,
            });
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }

        let payload: &[u8] = view.get_bytes(packet_offset, length)?;
        self.data[HEADER_SIZE + datagram_offset..end].copy_from_slice(payload);
        self.bytes_received += length;
        Ok(())
    }

    /// Copy the last fragment and fix the datagram's total length
    fn add_last_fragment(
        &mut self,
        view: &ByteView,
        datagram_offset: usize,
        length: usize,
        packet_offset: usize,
    ) -> Result<(), ReassemblyError> {
        self.add_fragment(view, datagram_offset, length, packet_offset)?;

        let total: usize = HEADER_SIZE + datagram_offset + length;
        self.target_length = Some(total);
        if self.data.len() > total {
            self.data.truncate(total);
        }
        // The synthesized header finally learns the datagram's total length
        self.data[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        Ok(())
    }

    /// Reassembly is complete once the byte count matches the total length
    /// learned from the last fragment
    fn is_complete(&self) -> bool {
        self.target_length == Some(self.bytes_received)
    }

    fn into_datagram(mut self, complete: bool) -> ReassembledDatagram {
        if let Some(target) = self.target_length {
            self.data.truncate(target);
        }
        ReassembledDatagram {
            view: ByteView::new(self.data).with_byte_order(ByteOrder::BigEndian),
            complete,
            key: self.key,
        }
    }
}

/// Buffers IPv4 fragments keyed by datagram identity and times out
/// incomplete reassemblies
///
/// Keys are a hash of (source, destination, identification, protocol) with
/// no full-key equality behind them: two datagrams hashing alike are merged.
/// This is a documented simplification, acceptable for cooperative traffic
/// but not collision-proof under adversarial input.
pub struct IpReassemblyEngine {
    buffers: HashMap<u32, ReassemblyBuffer>,
    /// Oldest deadline first; entries are dropped lazily when their buffer
    /// already left the map through completion
    deadlines: BinaryHeap<Reverse<(SystemTime, u32)>>,
    timeout: Duration,
}

impl IpReassemblyEngine {
    /// Create an engine timing out incomplete reassemblies after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            deadlines: BinaryHeap::new(),
            timeout,
        }
    }

    /// Number of datagrams currently being reassembled
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Submit one decoded IPv4 packet
    ///
    /// Unfragmented packets pass straight through. Fragments are copied into
    /// their datagram's buffer; the fragment that completes a datagram
    /// yields [`ReassemblyOutcome::Completed`]. Arrival order is
    /// unconstrained.
    pub fn submit(
        &mut self,
        view: &ByteView,
        ip: &HeaderInstance,
        now: SystemTime,
    ) -> Result<ReassemblyOutcome, ReassemblyError> {
        let flags: u16 = view.get_u16(ip.offset + 6)?;
        let more_fragments: bool = flags & FLAG_MORE_FRAGMENTS != 0;
        let fragment_offset: usize = (flags & FRAGMENT_OFFSET_MASK) as usize * 8;

        if !more_fragments && fragment_offset == 0 {
            return Ok(ReassemblyOutcome::Forwarded);
        }

        let header_length: usize = ((view.get_u8(ip.offset)? & 0x0F) as usize) * 4;
        let total_length: usize = view.get_u16(ip.offset + 2)? as usize;
        if header_length < HEADER_SIZE || total_length < header_length {
            return Err(ReassemblyError::NotIp4(ip.offset));
        }
        let payload_length: usize = total_length - header_length;
        let packet_offset: usize = ip.offset + header_length;

        let key: u32 = datagram_key(view, ip)?;
        let buffer: &mut ReassemblyBuffer = match self.buffers.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let deadline: SystemTime = now + self.timeout;
                self.deadlines.push(Reverse((deadline, key)));
                debug!(key, "new reassembly buffer");
                entry.insert(ReassemblyBuffer::new(view, ip, deadline, key)?)
            }
        };

        if more_fragments {
            buffer.add_fragment(view, fragment_offset, payload_length, packet_offset)?;
        } else {
            buffer.add_last_fragment(view, fragment_offset, payload_length, packet_offset)?;
        }

        if buffer.is_complete() {
            // Leaves the map now; the matching queue entry is recognized as
            // stale when its deadline surfaces
            if let Some(buffer) = self.buffers.remove(&key) {
                debug!(key, "datagram reassembled");
                return Ok(ReassemblyOutcome::Completed(buffer.into_datagram(true)));
            }
        }

        Ok(ReassemblyOutcome::Buffered)
    }

    /// Drain every reassembly whose deadline has passed
    ///
    /// Each expired buffer is removed from the map and the queue together
    /// and surfaced exactly once as an incomplete datagram; a later sweep
    /// never returns it again. Cost is proportional to the number of
    /// expired entries.
    pub fn sweep(&mut self, now: SystemTime) -> Vec<ReassembledDatagram> {
        let mut expired: Vec<ReassembledDatagram> = Vec::new();

        while let Some(&Reverse((deadline, key))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();

            // A stale entry: the buffer completed earlier, or the key was
            // reused by a younger buffer with a later deadline
            let timed_out: bool = self
                .buffers
                .get(&key)
                .map(|b: &ReassemblyBuffer| b.deadline == deadline)
                .unwrap_or(false);
            if !timed_out {
                continue;
            }

            if let Some(buffer) = self.buffers.remove(&key) {
                warn!(key, "reassembly timed out with missing fragments");
                expired.push(buffer.into_datagram(false));
            }
        }

        expired
    }
}

/// Datagram identity hash over (source, destination, identification,
/// protocol)
fn datagram_key(view: &ByteView, ip: &HeaderInstance) -> Result<u32, ReassemblyError> {
    let source: u32 = view.get_u32(ip.offset + 12)?;
    let destination: u32 = view.get_u32(ip.offset + 16)?;
    let identification: u16 = view.get_u16(ip.offset + 4)?;
    let protocol: u8 = view.get_u8(ip.offset + 9)?;

    let mut hasher: DefaultHasher = DefaultHasher::new();
    (source, destination, identification, protocol).hash(&mut hasher);
    Ok(hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Build an IPv4 fragment packet: header + the given payload slice
    fn fragment(payload: &[u8], fragment_offset: usize, more: bool, id: u16) -> ByteView {
        let total: u16 = (HEADER_SIZE + payload.len()) as u16;
        let mut flags: u16 = (fragment_offset / 8) as u16;
        if more {
            flags |= FLAG_MORE_FRAGMENTS;
        }

        let mut bytes: Vec<u8> = vec![0x45, 0x00];
        bytes.extend_from_slice(&total.to_be_bytes());
        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.extend_from_slice(&flags.to_be_bytes());
        bytes.extend_from_slice(&[64, 17, 0xAB, 0xCD]); // ttl, udp, bogus checksum
        bytes.extend_from_slice(&[192, 168, 0, 1]);
        bytes.extend_from_slice(&[192, 168, 0, 2]);
        bytes.extend_from_slice(payload);
        ByteView::new(bytes).with_byte_order(ByteOrder::BigEndian)
    }

    fn ip_header() -> HeaderInstance {
        HeaderInstance::top_level(crate::protocols::ids::IP4, 0, HEADER_SIZE)
    }

    fn submit(
        engine: &mut IpReassemblyEngine,
        view: &ByteView,
        now: SystemTime,
    ) -> ReassemblyOutcome {
        engine.submit(view, &ip_header(), now).unwrap()
    }

    #[test]
    fn test_unfragmented_packet_is_forwarded() {
        let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
        let packet: ByteView = fragment(&[1, 2, 3, 4], 0, false, 9);
        assert_eq!(
            submit(&mut engine, &packet, SystemTime::now()),
            ReassemblyOutcome::Forwarded
        );
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_reassembly_in_any_arrival_order() {
        let payload: Vec<u8> = (0u8..24).collect();
        let pieces: [(usize, usize, bool); 3] = [(0, 8, true), (8, 8, true), (16, 8, false)];

        // Every permutation of three fragments
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
            let now: SystemTime = SystemTime::now();
            let mut completed: Option<ReassembledDatagram> = None;

            for (index, &piece) in order.iter().enumerate() {
                let (start, len, more) = pieces[piece];
                let view: ByteView = fragment(&payload[start..start + len], start, more, 77);
                match submit(&mut engine, &view, now) {
                    ReassemblyOutcome::Buffered => assert!(index < order.len() - 1),
                    ReassemblyOutcome::Completed(datagram) => {
                        assert_eq!(index, order.len() - 1);
                        completed = Some(datagram);
                    }
                    ReassemblyOutcome::Forwarded => panic!("fragment forwarded"),
                }
            }

            let datagram: ReassembledDatagram = completed.expect("datagram never completed");
            assert!(datagram.complete);
            assert_eq!(engine.pending(), 0);

            let view: &ByteView = &datagram.view;
            assert_eq!(view.size(), HEADER_SIZE + payload.len());
            assert_eq!(view.get_bytes(HEADER_SIZE, payload.len()).unwrap(), &payload[..]);
            // Synthesized header: IHL 5, no fragment bits, known total length
            assert_eq!(view.get_u8(0).unwrap(), 0x45);
            assert_eq!(view.get_u16(6).unwrap() & 0x3FFF, 0);
            assert_eq!(view.get_u16(2).unwrap() as usize, view.size());
        }
    }

    #[test]
    fn test_timeout_sweep_dispatches_exactly_once() {
        let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
        let start: SystemTime = SystemTime::now();

        let view: ByteView = fragment(&[0xEE; 8], 0, true, 123);
        assert_eq!(submit(&mut engine, &view, start), ReassemblyOutcome::Buffered);

        // Before the deadline nothing expires
        assert!(engine.sweep(start + Duration::from_secs(1)).is_empty());
        assert_eq!(engine.pending(), 1);

        let expired: Vec<ReassembledDatagram> = engine.sweep(start + Duration::from_secs(6));
        assert_eq!(expired.len(), 1);
        assert!(!expired[0].complete);
        assert_eq!(engine.pending(), 0);

        // A repeated, later sweep must not surface the buffer again
        assert!(engine.sweep(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_completed_buffer_leaves_queue_silently() {
        let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
        let start: SystemTime = SystemTime::now();

        let first: ByteView = fragment(&[1; 8], 0, true, 55);
        let last: ByteView = fragment(&[2; 8], 8, false, 55);
        assert_eq!(submit(&mut engine, &first, start), ReassemblyOutcome::Buffered);
        assert!(matches!(
            submit(&mut engine, &last, start),
            ReassemblyOutcome::Completed(_)
        ));

        // The stale queue entry must not resurface the completed datagram
        assert!(engine.sweep(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_overlapping_fragments_last_write_wins() {
        let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
        let start: SystemTime = SystemTime::now();

        let original: ByteView = fragment(&[0x11; 8], 0, true, 200);
        let rewrite: ByteView = fragment(&[0x22; 8], 0, true, 200);
        submit(&mut engine, &original, start);
        submit(&mut engine, &rewrite, start);

        // The double-counted byte total keeps the buffer incomplete, so it
        // surfaces through the timeout path
        let expired: Vec<ReassembledDatagram> = engine.sweep(start + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(
            expired[0].view.get_bytes(HEADER_SIZE, 8).unwrap(),
            &[0x22; 8]
        );
    }

    #[test]
    fn test_distinct_datagrams_do_not_mix() {
        let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
        let now: SystemTime = SystemTime::now();

        submit(&mut engine, &fragment(&[1; 8], 0, true, 1), now);
        submit(&mut engine, &fragment(&[2; 8], 0, true, 2), now);
        assert_eq!(engine.pending(), 2);

        let outcome: ReassemblyOutcome = submit(&mut engine, &fragment(&[3; 8], 8, false, 1), now);
        match outcome {
            ReassemblyOutcome::Completed(datagram) => {
                assert_eq!(datagram.view.get_bytes(HEADER_SIZE, 8).unwrap(), &[1; 8]);
                assert_eq!(
                    datagram.view.get_bytes(HEADER_SIZE + 8, 8).unwrap(),
                    &[3; 8]
                );
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn test_total_length_never_exceeds_ip_maximum() {
        let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
        let start: SystemTime = SystemTime::now();

        // A last fragment ending exactly at the 65535-byte limit is fine
        let last: ByteView = fragment(&[0x5A; 11], 65504, false, 8);
        assert_eq!(
            engine.submit(&last, &ip_header(), start),
            Ok(ReassemblyOutcome::Buffered)
        );

        // One byte past the limit must be rejected, not wrapped into a
        // small total length
        let over: ByteView = fragment(&[0x5A; 12], 65504, true, 8);
        assert!(matches!(
            engine.submit(&over, &ip_header(), start),
            Err(ReassemblyError::FragmentOutOfRange { .. })
        ));

        let expired: Vec<ReassembledDatagram> = engine.sweep(start + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].view.size(), 65535);
        assert_eq!(expired[0].view.get_u16(2).unwrap(), 65535);
    }

    #[test]
    fn test_fragment_past_size_cap_is_rejected() {
        let mut engine: IpReassemblyEngine = IpReassemblyEngine::new(TIMEOUT);
        // Maximal fragment offset with an oversized payload claim
        let view: ByteView = fragment(&[0; 1501], 0x1FFF * 8, true, 3);
        let result = engine.submit(&view, &ip_header(), SystemTime::now());
        assert!(matches!(
            result,
            Err(ReassemblyError::FragmentOutOfRange { .. })
        ));
    }
}
