//! Parsed TCP Segments and Capture Context
//!
//! The assembler consumes segments that have already been parsed from
//! link-layer frames. A segment carries the transport header fields the
//! reassembly engine needs plus the payload; the capture context carries the
//! timestamp recorded when the frame was captured.

use std::time::SystemTime;

use bytes::Bytes;

use crate::flow::TransportFlow;

pub const TCP_FLAG_FIN: u16 = 0x01;
pub const TCP_FLAG_SYN: u16 = 0x02;
pub const TCP_FLAG_RST: u16 = 0x04;
pub const TCP_FLAG_PSH: u16 = 0x08;
pub const TCP_FLAG_ACK: u16 = 0x10;
pub const TCP_FLAG_URG: u16 = 0x20;

/// One parsed TCP segment as captured off the wire.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub flags: u16,
    pub payload: Bytes,
}

impl TcpSegment {
    /// Create a segment with no flags set.
    pub fn new(
        source_port: u16,
        destination_port: u16,
        sequence_number: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            source_port,
            destination_port,
            sequence_number,
            acknowledgment_number: 0,
            flags: 0,
            payload,
        }
    }

    /// Set the flag word.
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Set the acknowledgment number and the ACK flag.
    pub fn with_ack(mut self, acknowledgment_number: u32) -> Self {
        self.acknowledgment_number = acknowledgment_number;
        self.flags |= TCP_FLAG_ACK;
        self
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    pub fn has_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    /// The transport-layer flow of this segment.
    pub fn transport_flow(&self) -> TransportFlow {
        TransportFlow::new(self.source_port, self.destination_port)
    }
}

/// Capture metadata handed in alongside each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureContext {
    pub timestamp: SystemTime,
}

impl CaptureContext {
    pub fn new(timestamp: SystemTime) -> Self {
        Self { timestamp }
    }

    /// A context stamped with the current wall-clock time.
    pub fn now() -> Self {
        Self {
            timestamp: SystemTime::now(),
        }
    }
}
