//! Flow Identity
//!
//! Flows name one ordered endpoint pair at one protocol layer. A `FlowKey`
//! combines the network-layer and transport-layer flows of a segment; a key
//! and its reverse identify the same conversation.

use std::fmt;
use std::net::IpAddr;

/// Network-layer flow: one ordered source/destination address pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl NetFlow {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }

    /// Create the flow for the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for NetFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// Transport-layer flow: one ordered source/destination port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportFlow {
    pub src_port: u16,
    pub dst_port: u16,
}

impl TransportFlow {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self { src_port, dst_port }
    }

    /// Create the flow for the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for TransportFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src_port, self.dst_port)
    }
}

/// Bidirectional conversation key: a net-layer flow plus a transport-layer
/// flow, as seen from one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub net: NetFlow,
    pub transport: TransportFlow,
}

impl FlowKey {
    pub fn new(net: NetFlow, transport: TransportFlow) -> Self {
        Self { net, transport }
    }

    /// Create the key for the opposite direction (both layers swapped).
    pub fn reversed(&self) -> Self {
        Self {
            net: self.net.reversed(),
            transport: self.transport.reversed(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.net.src, self.transport.src_port, self.net.dst, self.transport.dst_port
        )
    }
}

/// Direction of a half-connection relative to the first segment seen on the
/// flow, which fixes client->server for the flow's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    ClientToServer,
    ServerToClient,
}

impl FlowDirection {
    /// The opposite direction.
    pub fn reversed(&self) -> Self {
        match self {
            FlowDirection::ClientToServer => FlowDirection::ServerToClient,
            FlowDirection::ServerToClient => FlowDirection::ClientToServer,
        }
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDirection::ClientToServer => write!(f, "client->server"),
            FlowDirection::ServerToClient => write!(f, "server->client"),
        }
    }
}
