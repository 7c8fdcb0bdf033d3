//! The Reassembly Engine
//!
//! `Assembler::assemble` consumes one parsed TCP segment at a time and
//! drives the whole pipeline: flow identification, consumer acceptance,
//! sequence positioning, overlap resolution against queued pages and the
//! already-delivered stream, queueing under buffer budgets, delivery, and
//! connection teardown. A background thread periodically flushes
//! half-connections that have gone idle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, trace};

use crate::config::AssemblerConfig;
use crate::connection::{Connection, ConnectionStats, ConnectionTable, HalfConnection, PoolStats};
use crate::errors::AssemblyError;
use crate::flow::{FlowDirection, FlowKey, NetFlow};
use crate::page::{PageBuffer, PagePool};
use crate::segment::{CaptureContext, TcpSegment};
use crate::sequence::Sequence;
use crate::stream::{ScatterGather, Stream, StreamFactory};

const FLUSHER_TICK: Duration = Duration::from_millis(50);

/// Read-only snapshot of assembler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub errors: u64,
    pub connections_flushed: u64,
}

#[derive(Default)]
struct Counters {
    packets_processed: AtomicU64,
    bytes_processed: AtomicU64,
    errors: AtomicU64,
    connections_flushed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> AssemblerStats {
        AssemblerStats {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connections_flushed: self.connections_flushed.load(Ordering::Relaxed),
        }
    }
}

/// One chunk assembled into a delivery batch: either the live payload of
/// the segment being processed or a page drained from the queue.
enum BatchItem<'a> {
    Live {
        seq: Sequence,
        bytes: &'a [u8],
        ctx: Option<CaptureContext>,
        start: bool,
        end: bool,
    },
    Queued(PageBuffer),
}

impl BatchItem<'_> {
    fn seq(&self) -> Sequence {
        match self {
            BatchItem::Live { seq, .. } => *seq,
            BatchItem::Queued(page) => page.seq(),
        }
    }

    fn end_seq(&self) -> Sequence {
        match self {
            BatchItem::Live { seq, bytes, .. } => seq.add(bytes.len()),
            BatchItem::Queued(page) => page.end_seq(),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            BatchItem::Live { bytes, .. } => bytes,
            BatchItem::Queued(page) => page.bytes(),
        }
    }

    fn is_start(&self) -> bool {
        match self {
            BatchItem::Live { start, .. } => *start,
            BatchItem::Queued(page) => page.start,
        }
    }

    fn is_end(&self) -> bool {
        match self {
            BatchItem::Live { end, .. } => *end,
            BatchItem::Queued(page) => page.end,
        }
    }

    fn ctx(&self) -> Option<CaptureContext> {
        match self {
            BatchItem::Live { ctx, .. } => *ctx,
            BatchItem::Queued(page) => page.ctx,
        }
    }
}

/// The chunks accumulated for one delivery, in stream order.
struct Batch<'a> {
    items: Vec<BatchItem<'a>>,
}

impl<'a> Batch<'a> {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push_live(
        &mut self,
        seq: Sequence,
        bytes: &'a [u8],
        ctx: Option<CaptureContext>,
        start: bool,
        end: bool,
    ) {
        self.items.push(BatchItem::Live {
            seq,
            bytes,
            ctx,
            start,
            end,
        });
    }

    fn push_page(&mut self, page: PageBuffer) {
        self.items.push(BatchItem::Queued(page));
    }

    fn start_seq(&self) -> Option<Sequence> {
        self.items.first().map(BatchItem::seq)
    }

    fn end_seq(&self) -> Option<Sequence> {
        self.items.last().map(BatchItem::end_seq)
    }

    fn has_start(&self) -> bool {
        self.items.iter().any(BatchItem::is_start)
    }

    fn has_end(&self) -> bool {
        self.items.iter().any(BatchItem::is_end)
    }

    fn first_ctx(&self) -> Option<CaptureContext> {
        self.items.iter().find_map(BatchItem::ctx)
    }
}

/// State shared between callers and the background flusher.
struct Engine {
    config: AssemblerConfig,
    pool: Arc<PagePool>,
    table: Arc<ConnectionTable>,
    counters: Counters,
    shutdown: AtomicBool,
}

impl Engine {
    fn assemble(
        &self,
        net_flow: NetFlow,
        segment: &TcpSegment,
        ctx: CaptureContext,
    ) -> Result<(), AssemblyError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(AssemblyError::Closed);
        }
        self.counters.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_processed
            .fetch_add(segment.payload.len() as u64, Ordering::Relaxed);

        let key = FlowKey::new(net_flow, segment.transport_flow());
        let terminator = (segment.is_fin() || segment.is_rst()) && !segment.is_syn();

        let found = match self.table.get_or_create(key, terminator, ctx.timestamp, segment, &ctx) {
            Ok(found) => found,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        let Some((conn, dir)) = found else {
            trace!(%key, "terminating segment on unknown flow");
            return Ok(());
        };

        let mut guard = conn.lock();
        let inner = &mut *guard;
        let (half, other, stream) = inner.parts(dir);

        if half.last_seen < ctx.timestamp {
            half.last_seen = ctx.timestamp;
        }

        let mut start = half.next_seq.is_none() && segment.is_syn();
        if !stream.accept(segment, &ctx, dir, half.next_seq, &mut start) {
            trace!(%key, %dir, "segment rejected by consumer");
            return Ok(());
        }
        if half.closed {
            trace!(%key, %dir, "segment on closed half");
            return Ok(());
        }

        if segment.has_ack() {
            half.ack_seq = Some(Sequence::new(segment.acknowledgment_number));
        }

        // A SYN consumes one sequence number, so its payload begins right
        // after it.
        let raw = Sequence::new(segment.sequence_number);
        let seq = if segment.is_syn() { raw.add(1) } else { raw };
        let end_seq = seq.add(segment.payload.len());
        let end_flag = segment.is_fin() || segment.is_rst();

        let mut queue = true;
        match half.next_seq {
            None => {
                if segment.is_syn() || start {
                    half.next_seq = Some(seq);
                    queue = false;
                }
            }
            Some(next) => {
                if next.difference(seq) <= 0 {
                    queue = false;
                }
            }
        }

        // Overlap pass against queued pages.
        if !segment.payload.is_empty() && self.prune_overlaps(half, seq, end_seq) {
            half.overlap_packets += 1;
            half.overlap_bytes += segment.payload.len() as u64;
            trace!(%key, %dir, %seq, "segment already covered by queued data");
            return Ok(());
        }

        // A bare acknowledgment running ahead of the expected boundary
        // carries nothing worth buffering.
        if queue && segment.payload.is_empty() && !end_flag {
            return Ok(());
        }

        let mut saw_end = false;

        if queue
            && (half.pages.len() >= self.config.max_buffered_pages_per_connection
                || self.pool.in_use() >= self.config.max_buffered_pages_total)
        {
            // Out of buffer budget: emit every queued run that precedes the
            // segment as its own skip-marked delivery, then handle the
            // segment as if it were in order. Draining whole runs keeps the
            // queue at or ahead of the advancing stream.
            debug!(%key, %dir, pages = half.pages.len(), "buffer pressure, draining queued prefix");
            while half
                .pages
                .front()
                .is_some_and(|front| front.seq().difference(seq) > 0)
            {
                let mut drained = Batch::new();
                self.drain_head_run(half, &mut drained);
                if drained.is_empty() {
                    break;
                }
                let (end, end_flagged) = self.deliver(half, stream, drained, &ctx);
                if let Some(end) = end {
                    half.next_seq = Some(end);
                }
                saw_end |= end_flagged;
                if saw_end {
                    break;
                }
            }
            queue = false;
        }

        if queue {
            if let Err(err) =
                self.queue_payload(half, seq, &segment.payload, ctx, start, end_flag)
            {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        } else if !saw_end {
            let (seq, bytes) = trim_delivered(half, seq, &segment.payload);
            let mut batch = Batch::new();
            if !bytes.is_empty() || start || end_flag {
                batch.push_live(seq, bytes, Some(ctx), start, end_flag);
            }
            if !batch.is_empty() {
                self.drain_contiguous(half, &mut batch);
                let (end, end_flagged) = self.deliver(half, stream, batch, &ctx);
                if let Some(end) = end {
                    let mut next = end;
                    if segment.is_fin() {
                        next = next.add(1);
                    }
                    half.next_seq = Some(next);
                }
                saw_end |= end_flagged;
            }
        }

        let mut remove = false;
        if saw_end {
            self.close_half(half);
            if segment.is_rst() {
                self.close_half(other);
            }
            if other.closed {
                remove = self.call_complete(stream, &ctx);
            }
        }
        drop(guard);
        if remove {
            self.table.remove(&conn);
        }
        Ok(())
    }

    /// Walk the queued pages from the newest backward, releasing pages fully
    /// covered by `[start, end)` and trimming partial overlaps so the queue
    /// stays sorted and disjoint. Returns true when an existing page already
    /// covers the whole range, in which case the new payload is a duplicate.
    fn prune_overlaps(&self, half: &mut HalfConnection, start: Sequence, end: Sequence) -> bool {
        let mut i = half.pages.len();
        while i > 0 {
            i -= 1;
            let (page_start, page_end, page_len) = {
                let page = &half.pages[i];
                (page.seq(), page.end_seq(), page.len())
            };

            // Entirely before the new range; everything earlier is too.
            if page_end.difference(start) >= 0 {
                break;
            }
            // Entirely past the new range.
            if end.difference(page_start) >= 0 {
                continue;
            }

            let diff_start = start.difference(page_start);
            let diff_end = end.difference(page_end);

            if diff_start >= 0 && diff_end <= 0 {
                if let Some(page) = half.pages.remove(i) {
                    self.pool.release(page);
                }
                continue;
            }
            if diff_start < 0 && diff_end > 0 {
                return true;
            }
            if diff_end <= 0 {
                // Page sticks out before the new range; keep its prefix.
                let keep = page_start.difference(start);
                if keep > 0 && (keep as usize) < page_len {
                    half.pages[i].truncate(keep as usize);
                }
                break;
            }
            // Page sticks out past the new range; drop its covered prefix.
            let cut = page_start.difference(end);
            if cut > 0 && (cut as usize) < page_len {
                half.pages[i].trim_front(cut as usize);
            }
        }
        false
    }

    /// Convert the payload into a run of pages and splice it into the queue
    /// at its sorted position. On pool exhaustion mid-run the partial run is
    /// released and nothing is queued.
    fn queue_payload(
        &self,
        half: &mut HalfConnection,
        seq: Sequence,
        payload: &[u8],
        ctx: CaptureContext,
        start: bool,
        end_flag: bool,
    ) -> Result<(), AssemblyError> {
        let run = self.pages_for(seq, payload, ctx, start, end_flag)?;

        let mut at = 0;
        while at < half.pages.len() && seq.difference(half.pages[at].seq()) < 0 {
            at += 1;
        }

        half.queued_packets += 1;
        half.queued_bytes += payload.len() as u64;
        for page in run {
            half.pages.insert(at, page);
            at += 1;
        }
        Ok(())
    }

    fn pages_for(
        &self,
        seq: Sequence,
        payload: &[u8],
        ctx: CaptureContext,
        start: bool,
        end_flag: bool,
    ) -> Result<Vec<PageBuffer>, AssemblyError> {
        let mut run = Vec::new();
        let mut seq = seq;
        let mut rest = payload;
        loop {
            let mut page = match self.pool.acquire(ctx.timestamp) {
                Ok(page) => page,
                Err(err) => {
                    for page in run {
                        self.pool.release(page);
                    }
                    return Err(err);
                }
            };
            let take = rest.len().min(self.pool.page_size());
            page.seq = seq;
            page.fill(&rest[..take]);
            if run.is_empty() {
                page.ctx = Some(ctx);
                page.start = start;
            }
            rest = &rest[take..];
            seq = seq.add(take);
            if rest.is_empty() {
                page.end = end_flag;
                run.push(page);
                return Ok(run);
            }
            run.push(page);
        }
    }

    /// Move the contiguous run at the head of the queue into the batch.
    fn drain_head_run(&self, half: &mut HalfConnection, batch: &mut Batch<'_>) {
        let Some(first) = half.pages.pop_front() else {
            return;
        };
        let mut run_end = first.end_seq();
        batch.push_page(first);
        while half
            .pages
            .front()
            .is_some_and(|front| run_end.difference(front.seq()) == 0)
        {
            if let Some(page) = half.pages.pop_front() {
                run_end = page.end_seq();
                batch.push_page(page);
            }
        }
    }

    /// Extend the batch with queued pages that follow it without a gap.
    fn drain_contiguous(&self, half: &mut HalfConnection, batch: &mut Batch<'_>) {
        let Some(mut end) = batch.end_seq() else {
            return;
        };
        while half
            .pages
            .front()
            .is_some_and(|front| end.difference(front.seq()) == 0)
        {
            if let Some(page) = half.pages.pop_front() {
                end = page.end_seq();
                batch.push_page(page);
            }
        }
    }

    /// Hand the batch to the consumer and release its drained pages.
    ///
    /// Returns the sequence one past the delivered bytes and whether the
    /// batch carried an end marker. A panicking consumer is logged and
    /// counted; reassembly state is not rolled back.
    fn deliver(
        &self,
        half: &mut HalfConnection,
        stream: &mut dyn Stream,
        batch: Batch<'_>,
        ctx: &CaptureContext,
    ) -> (Option<Sequence>, bool) {
        let skip = match (half.next_seq, batch.start_seq()) {
            (Some(next), Some(first)) => Some(next.difference(first).max(0) as usize),
            _ => None,
        };
        let end_seq = batch.end_seq();
        let saw_end = batch.has_end();

        let chunks: Vec<&[u8]> = batch.items.iter().map(BatchItem::bytes).collect();
        let view = ScatterGather::new(
            chunks,
            skip,
            half.direction,
            batch.has_start(),
            saw_end,
            batch.first_ctx(),
            half.delivery_stats(),
        );
        if catch_unwind(AssertUnwindSafe(|| stream.reassembled(&view, ctx))).is_err() {
            error!(dir = %half.direction, "stream delivery handler panicked");
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        drop(view);

        for item in batch.items {
            if let BatchItem::Queued(page) = item {
                self.pool.release(page);
            }
        }
        (end_seq, saw_end)
    }

    fn close_half(&self, half: &mut HalfConnection) {
        if half.closed {
            return;
        }
        half.closed = true;
        half.release_pages(&self.pool);
    }

    fn call_complete(&self, stream: &mut dyn Stream, ctx: &CaptureContext) -> bool {
        match catch_unwind(AssertUnwindSafe(|| stream.reassembly_complete(ctx))) {
            Ok(destroy) => destroy,
            Err(_) => {
                error!("stream completion handler panicked");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Deliver everything still queued on the half as gap-separated batches,
    /// then close it.
    fn flush_half(&self, half: &mut HalfConnection, stream: &mut dyn Stream, ctx: &CaptureContext) {
        while !half.pages.is_empty() {
            let mut batch = Batch::new();
            self.drain_head_run(half, &mut batch);
            let (end, _) = self.deliver(half, stream, batch, ctx);
            if let Some(end) = end {
                half.next_seq = Some(end);
            }
        }
        self.close_half(half);
    }

    /// Flush stale halves of one connection. `None` flushes unconditionally.
    /// Returns whether any half was flushed and whether the connection may
    /// be removed.
    fn flush_connection(
        &self,
        conn: &Connection,
        cutoff: Option<SystemTime>,
        ctx: &CaptureContext,
    ) -> (bool, bool) {
        let mut guard = conn.lock();
        let inner = &mut *guard;
        let stale = |half: &HalfConnection| match cutoff {
            Some(cutoff) => half.last_seen < cutoff,
            None => true,
        };

        let mut touched = false;
        for dir in [FlowDirection::ClientToServer, FlowDirection::ServerToClient] {
            let (half, _, stream) = inner.parts(dir);
            if !half.closed && stale(half) {
                self.flush_half(half, stream, ctx);
                touched = true;
            }
        }

        let mut remove = false;
        if inner.c2s.closed && inner.s2c.closed {
            remove = self.call_complete(inner.stream.as_mut(), ctx);
        }
        (touched, remove)
    }

    /// Sweep the table for half-connections idle past the cutoff. Returns
    /// the number of connections flushed and the number removed.
    fn flush_older_than(&self, cutoff: SystemTime) -> (u64, u64) {
        let ctx = CaptureContext::now();
        let mut flushed = 0;
        let mut removed = 0;
        for conn in self.table.snapshot() {
            let (touched, remove) = self.flush_connection(&conn, Some(cutoff), &ctx);
            if touched {
                flushed += 1;
            }
            if remove {
                self.table.remove(&conn);
                removed += 1;
            }
        }
        self.counters
            .connections_flushed
            .fetch_add(flushed, Ordering::Relaxed);
        (flushed, removed)
    }

    /// Flush and close every tracked connection.
    fn flush_all(&self) {
        let ctx = CaptureContext::now();
        for conn in self.table.snapshot() {
            let (_, remove) = self.flush_connection(&conn, None, &ctx);
            if remove {
                self.table.remove(&conn);
            }
        }
    }
}

/// Passive TCP stream reassembler.
///
/// Safe to share across capture worker threads; every call runs under the
/// owning connection's mutex, so per-half deliveries are serialized and
/// advance monotonically.
pub struct Assembler {
    engine: Arc<Engine>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Assembler {
    /// Build an assembler and start its background flusher.
    pub fn new(
        factory: Arc<dyn StreamFactory>,
        config: AssemblerConfig,
    ) -> Result<Self, AssemblyError> {
        let config = config.validated()?;
        let pool = Arc::new(PagePool::new(
            config.page_size,
            config.max_buffered_pages_total,
            config.eviction_period,
        ));
        let table = Arc::new(ConnectionTable::new(
            factory,
            Arc::clone(&pool),
            config.max_connections,
        ));
        let engine = Arc::new(Engine {
            config,
            pool,
            table,
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
        });

        let flusher = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || run_flusher(engine))
        };

        Ok(Self {
            engine,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Feed one captured segment into the reassembly pipeline.
    pub fn assemble(
        &self,
        net_flow: NetFlow,
        segment: &TcpSegment,
        ctx: CaptureContext,
    ) -> Result<(), AssemblyError> {
        self.engine.assemble(net_flow, segment, ctx)
    }

    /// Flush every half-connection whose last activity predates `cutoff`.
    /// Returns the number of connections flushed and removed.
    pub fn flush_older_than(&self, cutoff: SystemTime) -> (u64, u64) {
        self.engine.flush_older_than(cutoff)
    }

    /// Stop the flusher, drain all remaining flows with synthetic
    /// end-of-stream deliveries, and close the table. Idempotent; later
    /// `assemble` calls fail with `Closed`.
    pub fn close(&self) {
        if self.engine.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.engine.flush_all();
        self.engine.table.close();
    }

    pub fn stats(&self) -> AssemblerStats {
        self.engine.counters.snapshot()
    }

    /// Connection-table snapshot counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.engine.table.stats()
    }

    /// Pages currently held by half-connections.
    pub fn pages_in_use(&self) -> usize {
        self.engine.pool.in_use()
    }

    /// Counter snapshot for one tracked flow, by either key direction.
    pub fn connection_stats(&self, key: &FlowKey) -> Option<ConnectionStats> {
        self.engine.table.find(key).map(|conn| conn.stats())
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.engine.config
    }
}

impl Drop for Assembler {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_flusher(engine: Arc<Engine>) {
    let mut elapsed = Duration::ZERO;
    while !engine.shutdown.load(Ordering::Relaxed) {
        thread::sleep(FLUSHER_TICK);
        elapsed += FLUSHER_TICK;
        if elapsed < engine.config.flush_interval {
            continue;
        }
        elapsed = Duration::ZERO;
        let Some(cutoff) = SystemTime::now().checked_sub(engine.config.connection_timeout) else {
            continue;
        };
        let (flushed, removed) = engine.flush_older_than(cutoff);
        if flushed > 0 || removed > 0 {
            debug!(flushed, removed, "idle flush sweep");
        }
    }
}

/// Drop the payload prefix that was already delivered, recording the
/// overlap. Returns the adjusted sequence and remaining bytes.
fn trim_delivered<'a>(
    half: &mut HalfConnection,
    seq: Sequence,
    payload: &'a [u8],
) -> (Sequence, &'a [u8]) {
    let Some(next) = half.next_seq else {
        return (seq, payload);
    };
    let diff = seq.difference(next);
    if diff <= 0 || payload.is_empty() {
        return (seq, payload);
    }
    half.overlap_packets += 1;
    if diff as usize >= payload.len() {
        half.overlap_bytes += payload.len() as u64;
        return (next, &[]);
    }
    half.overlap_bytes += diff as u64;
    (next, &payload[diff as usize..])
}
