//! Decode engine implementation
//!
//! Ties the per-frame pipeline together: header scanning, IPv4 fragment
//! reassembly, checksum verification and flow grouping. One engine processes
//! frames sequentially; every mutable stage sits behind its own lock so the
//! engine itself can be shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::buffer::ByteView;
use crate::capture::Frame;
use crate::checksum::{ChecksumReport, ChecksumVerifier};
use crate::config::DecodeConfig;
use crate::core::flow::{FlowDirection, FlowGrouper};
use crate::core::packet::{HeaderInstance, PacketState};
use crate::protocols::{ids, ProtocolRegistry};
use crate::reassembly::{IpReassemblyEngine, ReassemblyOutcome};
use crate::scanner::{HeaderScanner, ScanError};

/// Decode statistics
#[derive(Debug, Clone)]
pub struct DecodeStats {
    /// Number of frames processed
    pub frames_processed: usize,
    /// Number of header instances decoded
    pub headers_decoded: usize,
    /// Frames where a header ran past the captured bytes
    pub truncated_frames: usize,
    /// Checksums that recomputed to a different value
    pub invalid_checksums: usize,
    /// Datagrams rebuilt from fragments
    pub datagrams_reassembled: usize,
    /// Reassemblies abandoned with missing fragments
    pub reassembly_timeouts: usize,
    /// Number of flows currently tracked
    pub flows_tracked: usize,
    /// Start time
    pub start_time: SystemTime,
    /// Last update time
    pub last_update: SystemTime,
}

impl Default for DecodeStats {
    fn default() -> Self {
        Self {
            frames_processed: 0,
            headers_decoded: 0,
            truncated_frames: 0,
            invalid_checksums: 0,
            datagrams_reassembled: 0,
            reassembly_timeouts: 0,
            flows_tracked: 0,
            start_time: SystemTime::now(),
            last_update: SystemTime::now(),
        }
    }
}

/// Decode result of a datagram rebuilt from the fragments of several frames
#[derive(Debug, Clone)]
pub struct ReassembledSummary {
    pub view: ByteView,
    pub state: PacketState,
    pub checksums: Vec<ChecksumReport>,
}

/// Everything the engine learned about one frame
#[derive(Debug, Clone)]
pub struct FrameSummary {
    pub frame_number: u64,
    pub state: PacketState,
    pub checksums: Vec<ChecksumReport>,
    /// Present when this frame's fragment completed a datagram
    pub reassembled: Option<ReassembledSummary>,
    pub flow_direction: Option<FlowDirection>,
}

/// Frame decode engine
pub struct DecodeEngine {
    scanner: Mutex<HeaderScanner>,
    reassembly: Option<Mutex<IpReassemblyEngine>>,
    flows: Option<Arc<FlowGrouper>>,
    verify_checksums: bool,
    stats: Mutex<DecodeStats>,
}

impl DecodeEngine {
    /// Create an engine over the given registry, with the optional stages
    /// enabled per the decode configuration
    pub fn new(registry: Arc<ProtocolRegistry>, config: &DecodeConfig) -> Self {
        let reassembly: Option<Mutex<IpReassemblyEngine>> = config.reassemble_ip.then(|| {
            Mutex::new(IpReassemblyEngine::new(Duration::from_secs(
                config.reassembly_timeout,
            )))
        });
        let flows: Option<Arc<FlowGrouper>> = config.track_flows.then(|| {
            Arc::new(FlowGrouper::new(
                Duration::from_secs(config.flow_timeout),
                config.max_flows,
            ))
        });

        Self {
            scanner: Mutex::new(HeaderScanner::new(registry)),
            reassembly,
            flows,
            verify_checksums: config.verify_checksums,
            stats: Mutex::new(DecodeStats::default()),
        }
    }

    /// Run one frame through the full pipeline
    pub fn process_frame(&self, frame: &Frame) -> Result<FrameSummary, ScanError> {
        self.expire_reassemblies(frame.timestamp);

        let state: PacketState = self
            .scanner
            .lock()
            .unwrap()
            .scan(&frame.view, frame.initial_protocol)?;

        let reassembled: Option<ReassembledSummary> =
            self.submit_fragments(&frame.view, &state, frame.timestamp);

        let checksums: Vec<ChecksumReport> = if self.verify_checksums {
            ChecksumVerifier::verify(&frame.view, &state)
        } else {
            Vec::new()
        };

        let flow_direction: Option<FlowDirection> = self
            .flows
            .as_ref()
            .and_then(|flows| flows.add_frame(&frame.view, &state, frame.timestamp));

        self.update_stats(&state, &checksums, reassembled.as_ref());

        Ok(FrameSummary {
            frame_number: state.frame_number(),
            state,
            checksums,
            reassembled,
            flow_direction,
        })
    }

    /// Hand any IPv4 fragments in the frame to the reassembly engine and
    /// decode a datagram the moment it completes
    fn submit_fragments(
        &self,
        view: &ByteView,
        state: &PacketState,
        timestamp: SystemTime,
    ) -> Option<ReassembledSummary> {
        let reassembly: &Mutex<IpReassemblyEngine> = self.reassembly.as_ref()?;
        let ip: HeaderInstance = *state
            .headers()
            .iter()
            .find(|h: &&HeaderInstance| h.protocol == ids::IP4 && h.fragmented)?;

        let outcome: ReassemblyOutcome =
            match reassembly.lock().unwrap().submit(view, &ip, timestamp) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(frame = state.frame_number(), error = %e, "fragment rejected");
                    return None;
                }
            };

        let ReassemblyOutcome::Completed(datagram) = outcome else {
            return None;
        };
        debug!(
            frame = state.frame_number(),
            bytes = datagram.view.size(),
            "datagram reassembled"
        );

        // The rebuilt datagram decodes like a frame that starts at IPv4
        let rescan: Result<PacketState, ScanError> = self.scanner.lock().unwrap().rescan(
            &datagram.view,
            ids::IP4,
            state.frame_number(),
        );
        let datagram_state: PacketState = match rescan {
            Ok(datagram_state) => datagram_state,
            Err(e) => {
                warn!(frame = state.frame_number(), error = %e, "reassembled datagram failed to decode");
                return None;
            }
        };

        let checksums: Vec<ChecksumReport> = if self.verify_checksums {
            ChecksumVerifier::verify(&datagram.view, &datagram_state)
        } else {
            Vec::new()
        };

        Some(ReassembledSummary {
            view: datagram.view,
            state: datagram_state,
            checksums,
        })
    }

    fn expire_reassemblies(&self, now: SystemTime) {
        let Some(reassembly) = self.reassembly.as_ref() else {
            return;
        };
        let expired: usize = reassembly.lock().unwrap().sweep(now).len();
        if expired > 0 {
            let mut stats: std::sync::MutexGuard<'_, DecodeStats> = self.stats.lock().unwrap();
            stats.reassembly_timeouts += expired;
        }
    }

    fn update_stats(
        &self,
        state: &PacketState,
        checksums: &[ChecksumReport],
        reassembled: Option<&ReassembledSummary>,
    ) {
        let mut stats: std::sync::MutexGuard<'_, DecodeStats> = self.stats.lock().unwrap();
        stats.frames_processed += 1;
        stats.headers_decoded += state.headers().len();
        if state.headers().iter().any(|h: &HeaderInstance| h.truncated) {
            stats.truncated_frames += 1;
        }
        stats.invalid_checksums += checksums
            .iter()
            .filter(|r: &&ChecksumReport| r.is_invalid())
            .count();
        if let Some(summary) = reassembled {
            stats.datagrams_reassembled += 1;
            stats.invalid_checksums += summary
                .checksums
                .iter()
                .filter(|r: &&ChecksumReport| r.is_invalid())
                .count();
        }
        if let Some(flows) = &self.flows {
            stats.flows_tracked = flows.flow_count();
        }
        stats.last_update = SystemTime::now();
    }

    /// Get current decode statistics
    pub fn get_stats(&self) -> DecodeStats {
        self.stats.lock().unwrap().clone()
    }

    /// Get the flow grouper, if flow tracking is enabled
    pub fn flow_grouper(&self) -> Option<Arc<FlowGrouper>> {
        self.flows.as_ref().map(Arc::clone)
    }
}

/// Drain captured frames until the stop flag clears or the source hangs up
///
/// The flag is checked at the top of every iteration, so a stop request
/// takes effect between frames, never mid-frame; the receive timeout bounds
/// how long a quiet capture can delay that check.
pub fn drain_frames<F>(
    running: &AtomicBool,
    receiver: &mpsc::Receiver<Frame>,
    poll_interval: Duration,
    mut handle: F,
) where
    F: FnMut(Frame),
{
    while running.load(Ordering::SeqCst) {
        match receiver.recv_timeout(poll_interval) {
            Ok(frame) => handle(frame),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteOrder;
    use crate::protocols::ids;

    fn engine() -> DecodeEngine {
        let config: DecodeConfig = DecodeConfig {
            verify_checksums: true,
            reassemble_ip: true,
            reassembly_timeout: 30,
            track_flows: true,
            flow_timeout: 60,
            max_flows: 1024,
        };
        DecodeEngine::new(Arc::new(ProtocolRegistry::builtin()), &config)
    }

    fn frame_of(bytes: Vec<u8>) -> Frame {
        Frame {
            captured_length: bytes.len(),
            wire_length: bytes.len(),
            view: ByteView::new(bytes).with_byte_order(ByteOrder::BigEndian),
            timestamp: SystemTime::now(),
            initial_protocol: ids::ETHERNET,
        }
    }

    /// Ethernet + IPv4 + UDP frame with the given fragmentation fields
    fn udp_fragment(flags: u16, payload: &[u8], with_udp_header: bool) -> Frame {
        let udp_len: usize = if with_udp_header { 8 } else { 0 };
        let total: u16 = (20 + udp_len + payload.len()) as u16;

        let mut bytes: Vec<u8> = vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 0x08, 0x00];
        bytes.extend_from_slice(&[0x45, 0x00]);
        bytes.extend_from_slice(&total.to_be_bytes());
        bytes.extend_from_slice(&77u16.to_be_bytes()); // identification
        bytes.extend_from_slice(&flags.to_be_bytes());
        bytes.extend_from_slice(&[64, 17, 0, 0]);
        bytes.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
        if with_udp_header {
            let datagram_len: u16 = (8 + payload.len() + 8) as u16; // spans both fragments
            bytes.extend_from_slice(&0x1234u16.to_be_bytes());
            bytes.extend_from_slice(&0x0035u16.to_be_bytes());
            bytes.extend_from_slice(&datagram_len.to_be_bytes());
            bytes.extend_from_slice(&[0, 0]);
        }
        bytes.extend_from_slice(payload);
        frame_of(bytes)
    }

    #[test]
    fn test_plain_frame_decodes_and_counts() {
        let engine: DecodeEngine = engine();
        // Ethernet + IPv4 + UDP, no fragmentation
        let frame: Frame = udp_fragment(0x0000, &[1, 2, 3, 4, 5, 6, 7, 8], true);

        let summary: FrameSummary = engine.process_frame(&frame).unwrap();
        assert!(summary.state.has_header(ids::UDP));
        assert!(summary.reassembled.is_none());
        assert!(summary.flow_direction.is_some());

        let stats: DecodeStats = engine.get_stats();
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.flows_tracked, 1);
    }

    #[test]
    fn test_fragment_pair_reassembles_into_datagram() {
        let engine: DecodeEngine = engine();

        // First fragment: more-fragments set, carries the UDP header plus
        // eight payload bytes; second fragment carries the final eight
        let first: Frame = udp_fragment(0x2000, &[0xAA; 8], true);
        let second: Frame = udp_fragment(0x0002, &[0xBB; 8], false);

        let summary: FrameSummary = engine.process_frame(&first).unwrap();
        assert!(summary.reassembled.is_none());

        let summary: FrameSummary = engine.process_frame(&second).unwrap();
        let reassembled: ReassembledSummary = summary.reassembled.expect("datagram incomplete");
        assert!(reassembled.state.has_header(ids::UDP));
        assert_eq!(reassembled.view.size(), 20 + 8 + 16);

        let stats: DecodeStats = engine.get_stats();
        assert_eq!(stats.datagrams_reassembled, 1);
    }

    #[test]
    fn test_drain_loop_stops_between_frames() {
        let (sender, receiver): (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) = mpsc::channel();
        sender.send(frame_of(vec![0; 14])).unwrap();
        sender.send(frame_of(vec![0; 14])).unwrap();

        // The handler requests a stop after the first frame; the second
        // frame must stay in the channel
        let running: AtomicBool = AtomicBool::new(true);
        let mut seen: usize = 0;
        drain_frames(&running, &receiver, Duration::from_millis(10), |_| {
            seen += 1;
            running.store(false, Ordering::SeqCst);
        });
        assert_eq!(seen, 1);
        assert!(receiver.try_recv().is_ok());
    }

    #[test]
    fn test_drain_loop_never_starts_when_already_stopped() {
        let (sender, receiver): (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) = mpsc::channel();
        sender.send(frame_of(vec![0; 14])).unwrap();

        let running: AtomicBool = AtomicBool::new(false);
        let mut seen: usize = 0;
        drain_frames(&running, &receiver, Duration::from_millis(10), |_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_drain_loop_exits_when_source_hangs_up() {
        let (sender, receiver): (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) = mpsc::channel();
        drop(sender);

        let running: AtomicBool = AtomicBool::new(true);
        let mut seen: usize = 0;
        drain_frames(&running, &receiver, Duration::from_millis(10), |_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_invalid_checksum_counted() {
        let engine: DecodeEngine = engine();
        // The IPv4 header checksum field is zero, which never recomputes
        let frame: Frame = udp_fragment(0x0000, &[0; 8], true);

        let summary: FrameSummary = engine.process_frame(&frame).unwrap();
        assert!(summary.checksums.iter().any(|r| r.is_invalid()));
        assert!(engine.get_stats().invalid_checksums > 0);
    }
}
