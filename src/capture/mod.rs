//! Frame acquisition
//!
//! This module handles frame acquisition from PCAP files and live network
//! interfaces. A source pushes [`Frame`]s over a channel; each frame owns a
//! copy of its captured bytes and carries the link-layer protocol the
//! decoder should start from.

pub mod pcap;

use std::sync::mpsc;
use std::time::SystemTime;

use thiserror::Error;

use crate::buffer::{ByteOrder, ByteView};
use crate::protocols::{ids, ProtocolId};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("PCAP error: {0}")]
    Pcap(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Unsupported link type: {0}")]
    UnsupportedLinkType(i32),
}

/// One captured frame, decoupled from the capture buffer it came from
#[derive(Debug, Clone)]
pub struct Frame {
    /// Captured bytes; network protocols are big-endian on the wire
    pub view: ByteView,
    pub timestamp: SystemTime,
    /// Bytes actually captured, possibly less than the wire length under a
    /// snap length limit
    pub captured_length: usize,
    /// Original frame length on the wire
    pub wire_length: usize,
    /// Link-layer protocol to start decoding from
    pub initial_protocol: ProtocolId,
}

impl Frame {
    /// Copy a libpcap packet into an owned frame
    pub fn from_packet(packet: &::pcap::Packet<'_>, initial_protocol: ProtocolId) -> Self {
        let seconds: u64 = packet.header.ts.tv_sec.max(0) as u64;
        let micros: u32 = packet.header.ts.tv_usec.max(0) as u32;
        let timestamp: SystemTime = SystemTime::UNIX_EPOCH
            + std::time::Duration::new(seconds, micros.saturating_mul(1000));

        Self {
            view: ByteView::from_slice(packet.data).with_byte_order(ByteOrder::BigEndian),
            timestamp,
            captured_length: packet.header.caplen as usize,
            wire_length: packet.header.len as usize,
            initial_protocol,
        }
    }
}

/// Map a libpcap link type to the protocol decoding starts from
pub fn link_type_protocol(link_type: ::pcap::Linktype) -> Result<ProtocolId, CaptureError> {
    match link_type.0 {
        0 => Ok(ids::NULL_HEADER),
        1 => Ok(ids::ETHERNET),
        other => Err(CaptureError::UnsupportedLinkType(other)),
    }
}

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Number of frames captured
    pub frames_captured: usize,
    /// Number of frames dropped
    pub frames_dropped: usize,
    /// Number of bytes captured
    pub bytes_captured: usize,
    /// Start time
    pub start_time: Option<SystemTime>,
}

/// Frame source trait for different capture methods
pub trait FrameSource: Send + 'static {
    /// Start pushing frames into the channel
    fn start_capture(&mut self, sender: mpsc::Sender<Frame>) -> Result<(), CaptureError>;

    /// Stop capturing frames
    fn stop_capture(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Get capture statistics
    fn get_stats(&self) -> CaptureStats {
        CaptureStats::default()
    }

    /// Set BPF filter
    fn set_filter(&mut self, _filter: &str) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// List available network interfaces
pub fn list_interfaces() -> Result<Vec<String>, CaptureError> {
    match ::pcap::Device::list() {
        Ok(devices) => Ok(devices.into_iter().map(|d| d.name).collect()),
        Err(e) => Err(CaptureError::Interface(e.to_string())),
    }
}

/// Create a frame source reading a PCAP file
pub fn create_file_source(file_path: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
    let reader: pcap::PcapFileSource = pcap::PcapFileSource::new(file_path)?;
    Ok(Box::new(reader))
}

/// Create a frame source capturing from a network interface
pub fn create_interface_source(
    interface: &str,
    promiscuous: bool,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    let source: pcap::PcapLiveSource = pcap::PcapLiveSource::new(interface, promiscuous)?;
    Ok(Box::new(source))
}
