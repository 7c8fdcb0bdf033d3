//! Consumer Contract and Delivery View
//!
//! Callers plug into the assembler through two traits: a factory that
//! produces one consumer per connection, and the consumer itself, which
//! vets segments and receives reassembled byte batches. Batches are exposed
//! as a scatter-gather view over the chunks assembled for one delivery.

use crate::flow::{FlowDirection, NetFlow, TransportFlow};
use crate::segment::{CaptureContext, TcpSegment};
use crate::sequence::Sequence;

/// Produces one [`Stream`] per new connection.
///
/// Invoked while the connection table holds its exclusive lock, exactly once
/// per connection. Returning `None` aborts connection setup.
pub trait StreamFactory: Send + Sync {
    fn create(
        &self,
        net: NetFlow,
        transport: TransportFlow,
        segment: &TcpSegment,
        ctx: &CaptureContext,
    ) -> Option<Box<dyn Stream>>;
}

/// Per-connection consumer of reassembled bytes.
///
/// All methods are invoked under the owning connection's mutex; consumers
/// must not call back into the assembler for the same connection.
pub trait Stream: Send {
    /// Vet a segment before any processing. Returning `false` drops it.
    ///
    /// `start` is preset when the segment begins a flow (first SYN); the
    /// consumer may set it to accept a mid-stream pickup when no expected
    /// sequence is established yet.
    fn accept(
        &mut self,
        segment: &TcpSegment,
        ctx: &CaptureContext,
        dir: FlowDirection,
        next_seq: Option<Sequence>,
        start: &mut bool,
    ) -> bool;

    /// Receive one in-order batch of reassembled bytes.
    fn reassembled(&mut self, data: &ScatterGather<'_>, ctx: &CaptureContext);

    /// Called when both halves of the connection have closed. Returning
    /// `true` allows the connection to be destroyed.
    fn reassembly_complete(&mut self, ctx: &CaptureContext) -> bool;
}

/// Counters of the receiving half-connection at the moment of delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub queued_packets: u64,
    pub queued_bytes: u64,
    pub overlap_packets: u64,
    pub overlap_bytes: u64,
}

/// An ordered view over the byte chunks of one delivery.
///
/// Chunks are contiguous in sequence space unless the batch was forced out
/// under buffer pressure or an idle flush, in which case [`skipped`]
/// reports the bytes missing before the batch.
///
/// [`skipped`]: ScatterGather::skipped
#[derive(Debug)]
pub struct ScatterGather<'a> {
    chunks: Vec<&'a [u8]>,
    total_len: usize,
    skip: Option<usize>,
    direction: FlowDirection,
    start: bool,
    end: bool,
    ctx: Option<CaptureContext>,
    stats: DeliveryStats,
}

impl<'a> ScatterGather<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chunks: Vec<&'a [u8]>,
        skip: Option<usize>,
        direction: FlowDirection,
        start: bool,
        end: bool,
        ctx: Option<CaptureContext>,
        stats: DeliveryStats,
    ) -> Self {
        let total_len = chunks.iter().map(|c| c.len()).sum();
        Self {
            chunks,
            total_len,
            skip,
            direction,
            start,
            end,
            ctx,
            stats,
        }
    }

    /// Total reassembled bytes in this delivery.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// The underlying chunks, in stream order.
    pub fn chunks(&self) -> &[&'a [u8]] {
        &self.chunks
    }

    /// Copy out the first `n` bytes (clamped to the available length).
    pub fn fetch(&self, n: usize) -> Vec<u8> {
        let mut remaining = n.min(self.total_len);
        let mut out = Vec::with_capacity(remaining);
        for chunk in &self.chunks {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            remaining -= take;
        }
        out
    }

    /// Bytes missing between the previously delivered stream and this batch.
    ///
    /// `Some(0)` means the batch extends the stream without a gap. `None`
    /// means the start of the flow was never observed.
    pub fn skipped(&self) -> Option<usize> {
        self.skip
    }

    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    /// Whether this batch begins the stream (SYN or accepted pickup).
    pub fn is_start(&self) -> bool {
        self.start
    }

    /// Whether this batch ends the stream (FIN or RST reached).
    pub fn is_end(&self) -> bool {
        self.end
    }

    /// Capture context of the first chunk, when one was recorded.
    pub fn context(&self) -> Option<&CaptureContext> {
        self.ctx.as_ref()
    }

    /// Receiving half counters snapshotted at delivery time.
    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }
}
