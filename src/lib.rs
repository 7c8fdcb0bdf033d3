//! Passive TCP Stream Reassembly
//!
//! Consumes TCP segments already parsed from captured frames and delivers,
//! per direction of each flow, an in-order, deduplicated, gap-annotated
//! byte stream to user-supplied consumers.
//!
//! Callers implement [`StreamFactory`] to hand out one [`Stream`] consumer
//! per connection, then feed segments through [`Assembler::assemble`] from
//! any number of capture worker threads. A background task flushes flows
//! that go idle.

pub mod assembler;
pub mod config;
pub mod connection;
pub mod errors;
pub mod flow;
pub mod page;
pub mod segment;
pub mod sequence;
pub mod stream;

pub use assembler::{Assembler, AssemblerStats};
pub use config::AssemblerConfig;
pub use connection::{Connection, ConnectionStats, ConnectionTable, HalfStats, PoolStats};
pub use errors::AssemblyError;
pub use flow::{FlowDirection, FlowKey, NetFlow, TransportFlow};
pub use page::{PageBuffer, PagePool};
pub use segment::{
    CaptureContext, TcpSegment, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST,
    TCP_FLAG_SYN, TCP_FLAG_URG,
};
pub use sequence::Sequence;
pub use stream::{DeliveryStats, ScatterGather, Stream, StreamFactory};
