//! Flow grouping
//!
//! Groups decoded frames into conversations keyed by addresses, ports and
//! transport protocol. TCP and UDP flows are bidirectional: a frame whose
//! key matches an existing flow in reverse joins that flow as reply traffic.
//! ICMP and bare IP flows are unidirectional, so replies form their own
//! flow.
//!
//! Retained frames are deep copies. Header instances index into a frame's
//! own byte view, so a flow must never hold references into capture buffers
//! that are recycled after the frame callback returns.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::buffer::ByteView;
use crate::core::packet::{HeaderInstance, PacketState};
use crate::protocols::{ids, ProtocolId};

/// Unique identifier for a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: ProtocolId,
}

impl FlowKey {
    /// Build a key from a decoded frame
    ///
    /// Returns `None` for frames without a network-layer header. The key
    /// protocol is the transport protocol when one was decoded, otherwise
    /// the network protocol itself.
    pub fn from_frame(view: &ByteView, state: &PacketState) -> Option<Self> {
        let ip: &HeaderInstance = state
            .headers()
            .iter()
            .find(|h: &&HeaderInstance| matches!(h.protocol, ids::IP4 | ids::IP6))?;

        let (src_ip, dst_ip): (IpAddr, IpAddr) = match ip.protocol {
            ids::IP4 => {
                let src: [u8; 4] = view.get_bytes(ip.offset + 12, 4).ok()?.try_into().ok()?;
                let dst: [u8; 4] = view.get_bytes(ip.offset + 16, 4).ok()?.try_into().ok()?;
                (
                    IpAddr::V4(Ipv4Addr::from(src)),
                    IpAddr::V4(Ipv4Addr::from(dst)),
                )
            }
            _ => {
                let src: [u8; 16] = view.get_bytes(ip.offset + 8, 16).ok()?.try_into().ok()?;
                let dst: [u8; 16] = view.get_bytes(ip.offset + 24, 16).ok()?.try_into().ok()?;
                (
                    IpAddr::V6(Ipv6Addr::from(src)),
                    IpAddr::V6(Ipv6Addr::from(dst)),
                )
            }
        };

        let transport: Option<&HeaderInstance> = state
            .headers()
            .iter()
            .find(|h: &&HeaderInstance| matches!(h.protocol, ids::TCP | ids::UDP | ids::ICMP));

        let (protocol, src_port, dst_port): (ProtocolId, Option<u16>, Option<u16>) =
            match transport {
                Some(t) if matches!(t.protocol, ids::TCP | ids::UDP) => (
                    t.protocol,
                    view.get_u16(t.offset).ok(),
                    view.get_u16(t.offset + 2).ok(),
                ),
                Some(t) => (t.protocol, None, None),
                None => (ip.protocol, None, None),
            };

        Some(Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        })
    }

    /// Create a reversed flow key (swapping source and destination)
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Whether reply traffic belongs to the same flow
    ///
    /// Only connection-oriented transports merge the reverse direction;
    /// an ICMP reply is its own flow.
    pub fn is_reversible(&self) -> bool {
        matches!(self.protocol, ids::TCP | ids::UDP)
    }
}

/// Flow direction relative to the key of the first frame seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Same orientation as the flow key
    Forward,
    /// Source and destination swapped
    Reverse,
}

/// One frame retained inside a flow, deep-copied from the capture buffer
#[derive(Debug, Clone)]
pub struct RetainedFrame {
    pub view: ByteView,
    pub frame_number: u64,
    pub timestamp: SystemTime,
}

/// A conversation between two endpoints
#[derive(Debug)]
pub struct Flow {
    /// Key in the orientation of the first frame seen
    pub key: FlowKey,
    /// Frames travelling in the key's orientation
    pub forward: Vec<RetainedFrame>,
    /// Reply frames; stays empty for non-reversible flows
    pub reverse: Vec<RetainedFrame>,
    pub created: SystemTime,
    pub last_seen: SystemTime,
    pub bytes_forward: usize,
    pub bytes_reverse: usize,
}

impl Flow {
    fn new(key: FlowKey, now: SystemTime) -> Self {
        Self {
            key,
            forward: Vec::new(),
            reverse: Vec::new(),
            created: now,
            last_seen: now,
            bytes_forward: 0,
            bytes_reverse: 0,
        }
    }

    /// Total frames retained in both directions
    pub fn frame_count(&self) -> usize {
        self.forward.len() + self.reverse.len()
    }

    /// All retained frames, forward direction first
    pub fn all_frames(&self) -> impl Iterator<Item = &RetainedFrame> {
        self.forward.iter().chain(self.reverse.iter())
    }
}

/// Groups frames into flows and evicts idle conversations
pub struct FlowGrouper {
    flows: Mutex<HashMap<FlowKey, Arc<Mutex<Flow>>>>,
    /// Flows idle longer than this are removed by [`FlowGrouper::prune_idle`]
    timeout: Duration,
    /// Soft cap; reaching it triggers pruning before a new flow is created
    max_flows: usize,
}

impl FlowGrouper {
    /// Create a new flow grouper
    pub fn new(timeout: Duration, max_flows: usize) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            timeout,
            max_flows,
        }
    }

    /// Number of tracked flows
    pub fn flow_count(&self) -> usize {
        self.flows.lock().unwrap().len()
    }

    /// Look up the flow a key belongs to, trying the reverse orientation
    /// for reversible keys
    pub fn get(&self, key: &FlowKey) -> Option<Arc<Mutex<Flow>>> {
        let flows = self.flows.lock().unwrap();
        if let Some(flow) = flows.get(key) {
            return Some(Arc::clone(flow));
        }
        if key.is_reversible() {
            return flows.get(&key.reversed()).map(Arc::clone);
        }
        None
    }

    /// Snapshot of every tracked flow
    pub fn flows(&self) -> Vec<Arc<Mutex<Flow>>> {
        self.flows.lock().unwrap().values().map(Arc::clone).collect()
    }

    /// Assign a decoded frame to its flow, creating the flow if needed
    ///
    /// The frame bytes are deep-copied into the flow. Returns `None` for
    /// frames that carry no network-layer header.
    pub fn add_frame(
        &self,
        view: &ByteView,
        state: &PacketState,
        timestamp: SystemTime,
    ) -> Option<FlowDirection> {
        let key: FlowKey = FlowKey::from_frame(view, state)?;

        let mut flows = self.flows.lock().unwrap();

        let (flow, direction): (Arc<Mutex<Flow>>, FlowDirection) =
            if let Some(flow) = flows.get(&key) {
                (Arc::clone(flow), FlowDirection::Forward)
            } else if key.is_reversible() && flows.contains_key(&key.reversed()) {
                let flow: Arc<Mutex<Flow>> = Arc::clone(&flows[&key.reversed()]);
                (flow, FlowDirection::Reverse)
            } else {
                if flows.len() >= self.max_flows {
                    Self::evict(&mut flows, timestamp, self.timeout, self.max_flows);
                }
                debug!(?key, "new flow");
                let flow: Arc<Mutex<Flow>> =
                    Arc::new(Mutex::new(Flow::new(key.clone(), timestamp)));
                flows.insert(key, Arc::clone(&flow));
                (flow, FlowDirection::Forward)
            };
        drop(flows);

        let retained: RetainedFrame = RetainedFrame {
            view: view.clone(),
            frame_number: state.frame_number(),
            timestamp,
        };

        let mut flow = flow.lock().unwrap();
        flow.last_seen = timestamp;
        match direction {
            FlowDirection::Forward => {
                flow.bytes_forward += view.size();
                flow.forward.push(retained);
            }
            FlowDirection::Reverse => {
                flow.bytes_reverse += view.size();
                flow.reverse.push(retained);
            }
        }

        Some(direction)
    }

    /// Remove flows idle longer than the configured timeout
    pub fn prune_idle(&self, now: SystemTime) -> usize {
        let mut flows = self.flows.lock().unwrap();
        let before: usize = flows.len();
        Self::retain_recent(&mut flows, now, self.timeout);
        before - flows.len()
    }

    /// Make room for a new flow: drop idle flows first, then the least
    /// recently seen flow if the map is still full
    ///
    /// Idleness is judged against the frame timestamp driving the pipeline,
    /// not the wall clock, so offline replay prunes the same way live
    /// capture does.
    fn evict(
        flows: &mut HashMap<FlowKey, Arc<Mutex<Flow>>>,
        now: SystemTime,
        timeout: Duration,
        max_flows: usize,
    ) {
        Self::retain_recent(flows, now, timeout);
        if flows.is_empty() || flows.len() < max_flows {
            return;
        }

        let oldest: Option<FlowKey> = flows
            .iter()
            .min_by_key(|(_, flow)| flow.lock().unwrap().last_seen)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            debug!(?key, "evicting least recently seen flow");
            flows.remove(&key);
        }
    }

    fn retain_recent(
        flows: &mut HashMap<FlowKey, Arc<Mutex<Flow>>>,
        now: SystemTime,
        timeout: Duration,
    ) {
        flows.retain(|_, flow| {
            let last_seen: SystemTime = flow.lock().unwrap().last_seen;
            match now.duration_since(last_seen) {
                Ok(idle) => idle <= timeout,
                Err(_) => true, // seen "in the future", keep it
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteOrder;

    const TIMEOUT: Duration = Duration::from_secs(60);

    /// Minimal IPv4+TCP frame: addresses and ports are all that matters here
    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> (ByteView, PacketState) {
        let mut bytes: Vec<u8> = vec![0x45, 0x00, 0x00, 0x28, 0, 0, 0, 0, 64, 6, 0, 0];
        bytes.extend_from_slice(&src);
        bytes.extend_from_slice(&dst);
        bytes.extend_from_slice(&sport.to_be_bytes());
        bytes.extend_from_slice(&dport.to_be_bytes());
        bytes.extend_from_slice(&[0; 16]);

        let view: ByteView = ByteView::new(bytes).with_byte_order(ByteOrder::BigEndian);
        let mut state: PacketState = PacketState::new(1);
        state.push(HeaderInstance::top_level(ids::IP4, 0, 20));
        state.push(HeaderInstance::top_level(ids::TCP, 20, 20));
        (view, state)
    }

    fn icmp_frame(src: [u8; 4], dst: [u8; 4]) -> (ByteView, PacketState) {
        let mut bytes: Vec<u8> = vec![0x45, 0x00, 0x00, 0x1C, 0, 0, 0, 0, 64, 1, 0, 0];
        bytes.extend_from_slice(&src);
        bytes.extend_from_slice(&dst);
        bytes.extend_from_slice(&[8, 0, 0, 0, 0, 1, 0, 1]);

        let view: ByteView = ByteView::new(bytes).with_byte_order(ByteOrder::BigEndian);
        let mut state: PacketState = PacketState::new(1);
        state.push(HeaderInstance::top_level(ids::IP4, 0, 20));
        state.push(HeaderInstance::top_level(ids::ICMP, 20, 8));
        (view, state)
    }

    #[test]
    fn test_key_extraction() {
        let (view, state) = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 43210, 80);
        let key: FlowKey = FlowKey::from_frame(&view, &state).unwrap();

        assert_eq!(key.src_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(key.dst_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(key.src_port, Some(43210));
        assert_eq!(key.dst_port, Some(80));
        assert_eq!(key.protocol, ids::TCP);
        assert!(key.is_reversible());
    }

    #[test]
    fn test_tcp_reply_joins_the_same_flow() {
        let grouper: FlowGrouper = FlowGrouper::new(TIMEOUT, 1024);
        let now: SystemTime = SystemTime::now();

        let (request, request_state) = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 43210, 80);
        let (reply, reply_state) = tcp_frame([10, 0, 0, 2], [10, 0, 0, 1], 80, 43210);

        assert_eq!(
            grouper.add_frame(&request, &request_state, now),
            Some(FlowDirection::Forward)
        );
        assert_eq!(
            grouper.add_frame(&reply, &reply_state, now),
            Some(FlowDirection::Reverse)
        );
        assert_eq!(grouper.flow_count(), 1);

        let key: FlowKey = FlowKey::from_frame(&request, &request_state).unwrap();
        let flow = grouper.get(&key).unwrap();
        let flow = flow.lock().unwrap();
        assert_eq!(flow.forward.len(), 1);
        assert_eq!(flow.reverse.len(), 1);
        assert_eq!(flow.frame_count(), 2);

        // Lookup through the reversed key lands on the same flow
        assert!(grouper.get(&key.reversed()).is_some());
    }

    #[test]
    fn test_icmp_reply_is_a_separate_flow() {
        let grouper: FlowGrouper = FlowGrouper::new(TIMEOUT, 1024);
        let now: SystemTime = SystemTime::now();

        let (echo, echo_state) = icmp_frame([10, 0, 0, 1], [10, 0, 0, 2]);
        let (reply, reply_state) = icmp_frame([10, 0, 0, 2], [10, 0, 0, 1]);

        assert_eq!(
            grouper.add_frame(&echo, &echo_state, now),
            Some(FlowDirection::Forward)
        );
        assert_eq!(
            grouper.add_frame(&reply, &reply_state, now),
            Some(FlowDirection::Forward)
        );
        assert_eq!(grouper.flow_count(), 2);
    }

    #[test]
    fn test_retained_frames_are_copies() {
        let grouper: FlowGrouper = FlowGrouper::new(TIMEOUT, 1024);
        let (view, state) = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1000, 2000);
        grouper.add_frame(&view, &state, SystemTime::now());
        drop(view); // retained copy must survive the original

        let key: FlowKey =
            FlowKey::from_frame(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1000, 2000).0, &state)
                .unwrap();
        let flow = grouper.get(&key).unwrap();
        let flow = flow.lock().unwrap();
        assert_eq!(flow.forward[0].view.get_u8(9).unwrap(), 6);
        assert_eq!(flow.forward[0].frame_number, 1);
    }

    #[test]
    fn test_prune_idle_flows() {
        let grouper: FlowGrouper = FlowGrouper::new(Duration::from_secs(5), 1024);
        let start: SystemTime = SystemTime::now();

        let (old, old_state) = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2);
        let (fresh, fresh_state) = tcp_frame([10, 0, 0, 3], [10, 0, 0, 4], 3, 4);
        grouper.add_frame(&old, &old_state, start);
        grouper.add_frame(&fresh, &fresh_state, start + Duration::from_secs(10));

        let removed: usize = grouper.prune_idle(start + Duration::from_secs(12));
        assert_eq!(removed, 1);
        assert_eq!(grouper.flow_count(), 1);
        assert!(grouper
            .get(&FlowKey::from_frame(&fresh, &fresh_state).unwrap())
            .is_some());
    }

    #[test]
    fn test_eviction_judges_idleness_by_frame_time() {
        let grouper: FlowGrouper = FlowGrouper::new(Duration::from_secs(5), 2);
        // Frame timestamps ahead of the wall clock, as in replay of a
        // capture taken elsewhere: idleness must follow these, not now()
        let base: SystemTime = SystemTime::now() + Duration::from_secs(1000);

        let (a, a_state) = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2);
        let (b, b_state) = tcp_frame([10, 0, 0, 3], [10, 0, 0, 4], 3, 4);
        let (c, c_state) = tcp_frame([10, 0, 0, 5], [10, 0, 0, 6], 5, 6);

        grouper.add_frame(&a, &a_state, base);
        grouper.add_frame(&b, &b_state, base + Duration::from_secs(1));

        // By frame time both flows have been idle past the timeout, so the
        // full map prunes them instead of evicting a single survivor
        grouper.add_frame(&c, &c_state, base + Duration::from_secs(20));
        assert_eq!(grouper.flow_count(), 1);
        assert!(grouper.get(&FlowKey::from_frame(&a, &a_state).unwrap()).is_none());
        assert!(grouper.get(&FlowKey::from_frame(&b, &b_state).unwrap()).is_none());
        assert!(grouper.get(&FlowKey::from_frame(&c, &c_state).unwrap()).is_some());
    }

    #[test]
    fn test_frame_without_network_layer_is_skipped() {
        let grouper: FlowGrouper = FlowGrouper::new(TIMEOUT, 1024);
        let view: ByteView = ByteView::new(vec![0; 14]);
        let mut state: PacketState = PacketState::new(0);
        state.push(HeaderInstance::top_level(ids::ETHERNET, 0, 14));

        assert_eq!(grouper.add_frame(&view, &state, SystemTime::now()), None);
        assert_eq!(grouper.flow_count(), 0);
    }
}
