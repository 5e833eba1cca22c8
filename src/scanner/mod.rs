//! Header scanning engine
//!
//! The scanner walks a frame buffer from its initial link-layer protocol,
//! repeatedly asking the registry what header sits at the current offset and
//! the binding resolver what follows it, producing the frame's ordered header
//! list. Scanning one frame is a pure function of the buffer and the initial
//! protocol; the only mutable scan state is the explicit monotonic frame
//! sequence counter.

pub mod binding;

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::buffer::{ByteView, ViewError};
use crate::core::packet::{HeaderInstance, PacketState};
use crate::protocols::{ids, ProtocolDescriptor, ProtocolId, ProtocolRegistry, SubHeader};
use binding::BindingResolver;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("scan reached unregistered protocol id {0}")]
    UnknownProtocol(ProtocolId),

    #[error(transparent)]
    View(#[from] ViewError),
}

/// Walks frame buffers and decodes them into [`PacketState`] values
pub struct HeaderScanner {
    registry: Arc<ProtocolRegistry>,
    next_frame_number: u64,
}

impl HeaderScanner {
    /// Create a scanner over the given registry
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            registry,
            next_frame_number: 0,
        }
    }

    /// The registry this scanner decodes against
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Reset the frame sequence counter to zero
    pub fn reset_frame_number(&mut self) {
        self.next_frame_number = 0;
    }

    /// Decode one frame starting from the given initial protocol
    ///
    /// Malformed frames are not errors: the returned state holds however
    /// many headers decoded cleanly, with a truncated flag or a trailing
    /// payload marker where decoding stopped. `Err` is reserved for
    /// programming errors (a binding targeting an unregistered protocol).
    pub fn scan(
        &mut self,
        view: &ByteView,
        initial: ProtocolId,
    ) -> Result<PacketState, ScanError> {
        let frame_number: u64 = self.next_frame_number;
        self.next_frame_number += 1;
        self.scan_frame(view, initial, frame_number)
    }

    /// Decode a buffer that did not come off the wire, reusing the frame
    /// number of the frame it derives from
    ///
    /// Used for reassembled datagrams, which are scanned like a frame but
    /// must not advance the frame counter.
    pub fn rescan(
        &self,
        view: &ByteView,
        initial: ProtocolId,
        frame_number: u64,
    ) -> Result<PacketState, ScanError> {
        self.scan_frame(view, initial, frame_number)
    }

    fn scan_frame(
        &self,
        view: &ByteView,
        initial: ProtocolId,
        frame_number: u64,
    ) -> Result<PacketState, ScanError> {
        let mut state: PacketState = PacketState::new(frame_number);
        let mut protocol: ProtocolId = initial;
        let mut offset: usize = 0;

        loop {
            let remaining: usize = view.size() - offset;
            if remaining == 0 {
                break;
            }

            let descriptor: &ProtocolDescriptor = self
                .registry
                .lookup(protocol)
                .ok_or(ScanError::UnknownProtocol(protocol))?;

            // Fewer captured bytes than the smallest possible header: record
            // what is there as truncated and halt cleanly
            if remaining < descriptor.length.min() {
                let mut header: HeaderInstance =
                    HeaderInstance::top_level(protocol, offset, remaining);
                header.truncated = true;
                state.push(header);
                trace!(protocol = descriptor.name, offset, "truncated header, halting scan");
                break;
            }

            let length: usize = match descriptor.header_length(view, offset) {
                Some(length) if length <= remaining && length > 0 => length,
                Some(_) | None => {
                    // Declared length exceeds the capture, or the length
                    // field itself is unreadable/malformed
                    let mut header: HeaderInstance =
                        HeaderInstance::top_level(protocol, offset, remaining);
                    header.truncated = true;
                    state.push(header);
                    trace!(protocol = descriptor.name, offset, "truncated header, halting scan");
                    break;
                }
            };

            let mut header: HeaderInstance = HeaderInstance::top_level(protocol, offset, length);
            if let Some(rule) = descriptor.fragmentation {
                header.fragmented = rule(view, &header);
            }
            let index: usize = state.push(header);

            // Sub-headers share the parent's byte range and carry an
            // explicit parent link instead of an inheritance chain
            if let Some(rule) = descriptor.sub_headers {
                for sub in rule(view, &header) {
                    let SubHeader {
                        protocol: sub_protocol,
                        offset: sub_offset,
                        length: sub_length,
                    } = sub;
                    if sub_offset + sub_length <= view.size() {
                        state.push(HeaderInstance::sub_header(
                            sub_protocol,
                            sub_offset,
                            sub_length,
                            index,
                        ));
                    }
                }
            }

            offset += length;

            match BindingResolver::resolve(&self.registry, view, &state, index) {
                Some(next) => protocol = next,
                None => {
                    // No binding matched: the remainder is untyped payload
                    if offset < view.size() {
                        state.push(HeaderInstance::top_level(
                            ids::PAYLOAD,
                            offset,
                            view.size() - offset,
                        ));
                    }
                    break;
                }
            }
        }

        trace!(
            frame = frame_number,
            headers = state.headers().len(),
            "frame scanned"
        );
        Ok(state)
    }
}
