//! Core decode pipeline
//!
//! This module contains the per-frame decode state, the engine that drives
//! scanning, reassembly, checksum verification and flow grouping.

pub mod engine;
pub mod flow;
pub mod packet;
