//! Hexframe - a live/offline packet-capture decoding engine
//!
//! Hexframe ingests raw link-layer frames and incrementally decodes them into
//! a chain of typed protocol headers, with byte-precise field access,
//! checksum validation and IP fragment reassembly.

pub mod buffer;
pub mod capture;
pub mod checksum;
pub mod config;
pub mod core;
pub mod protocols;
pub mod reassembly;
pub mod scanner;
pub mod utils;

pub use buffer::{ByteOrder, ByteView, ViewError};
pub use crate::core::engine::{DecodeEngine, FrameSummary};
pub use crate::core::packet::{HeaderInstance, PacketState};
pub use protocols::{ProtocolDescriptor, ProtocolId, ProtocolRegistry};
pub use reassembly::{IpReassemblyEngine, ReassembledDatagram, ReassemblyOutcome};
pub use scanner::HeaderScanner;
