//! Page Buffers and the Bounded Page Pool
//!
//! Pages are the unit of queued storage: a fixed-capacity byte buffer
//! labelled with the sequence number of its first byte. The pool bounds the
//! number of live pages process-wide, recycles released buffers, and under
//! saturation evicts idle recycled buffers at most once per eviction period.
//! Eviction never reclaims pages held by half-connections; that pressure is
//! relieved by the assembler draining queued prefixes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::errors::AssemblyError;
use crate::segment::CaptureContext;
use crate::sequence::Sequence;

/// A fixed-capacity byte page holding one contiguous slice of a stream.
#[derive(Debug)]
pub struct PageBuffer {
    pub(crate) seq: Sequence,
    pub(crate) seen: SystemTime,
    pub(crate) ctx: Option<CaptureContext>,
    pub(crate) start: bool,
    pub(crate) end: bool,
    buf: Vec<u8>,
}

impl PageBuffer {
    /// Sequence number of the first byte.
    pub fn seq(&self) -> Sequence {
        self.seq
    }

    /// Sequence number one past the last byte.
    pub fn end_seq(&self) -> Sequence {
        self.seq.add(self.buf.len())
    }

    /// Active bytes of the page.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Capture timestamp of the segment that produced this page.
    pub fn seen(&self) -> SystemTime {
        self.seen
    }

    pub(crate) fn fill(&mut self, data: &[u8]) {
        debug_assert!(self.buf.is_empty());
        self.buf.extend_from_slice(data);
    }

    /// Keep only the first `keep` bytes.
    pub(crate) fn truncate(&mut self, keep: usize) {
        self.buf.truncate(keep);
    }

    /// Drop the first `n` bytes and advance the sequence accordingly.
    pub(crate) fn trim_front(&mut self, n: usize) {
        self.buf.drain(..n);
        self.seq = self.seq.add(n);
    }
}

/// Bounded allocator of page buffers with recycling.
///
/// `in_use` counts pages currently held by half-connections or in-flight
/// deliveries. Acquisition fails once the count reaches the cap, after one
/// rate-limited attempt to evict idle recycled buffers.
#[derive(Debug)]
pub struct PagePool {
    page_size: usize,
    max_pages: usize,
    eviction_period: Duration,
    in_use: AtomicUsize,
    requests: AtomicU64,
    bin: Mutex<Vec<Vec<u8>>>,
    last_eviction: Mutex<Option<Instant>>,
}

impl PagePool {
    pub fn new(page_size: usize, max_pages: usize, eviction_period: Duration) -> Self {
        Self {
            page_size,
            max_pages,
            eviction_period,
            in_use: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
            bin: Mutex::new(Vec::new()),
            last_eviction: Mutex::new(None),
        }
    }

    /// Take a cleared page out of the pool.
    pub fn acquire(&self, seen: SystemTime) -> Result<PageBuffer, AssemblyError> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        if self.in_use.load(Ordering::Relaxed) >= self.max_pages {
            self.evict_idle();
            if self.in_use.load(Ordering::Relaxed) >= self.max_pages {
                return Err(AssemblyError::PoolExhausted);
            }
        }

        let buf = self
            .bin
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.page_size));
        self.in_use.fetch_add(1, Ordering::Relaxed);

        Ok(PageBuffer {
            seq: Sequence::new(0),
            seen,
            ctx: None,
            start: false,
            end: false,
            buf,
        })
    }

    /// Return a page to the pool, recycling its backing buffer.
    pub fn release(&self, page: PageBuffer) {
        let mut buf = page.buf;
        buf.clear();
        self.bin.lock().unwrap().push(buf);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Pages currently held outside the pool.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Total acquisition attempts since construction.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Drop idle recycled buffers so saturated pools can allocate fresh
    /// memory, at most once per eviction period. Live pages are untouched.
    fn evict_idle(&self) {
        let mut last = self.last_eviction.lock().unwrap();
        if let Some(at) = *last {
            if at.elapsed() < self.eviction_period {
                return;
            }
        }
        let dropped = {
            let mut bin = self.bin.lock().unwrap();
            let n = bin.len();
            bin.clear();
            bin.shrink_to_fit();
            n
        };
        *last = Some(Instant::now());
        debug!(
            dropped,
            in_use = self.in_use.load(Ordering::Relaxed),
            "evicted idle page buffers"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> PagePool {
        PagePool::new(8, max, Duration::from_secs(30))
    }

    #[test]
    fn test_acquire_release_accounting() {
        let pool = pool(4);
        let ts = SystemTime::now();

        let a = pool.acquire(ts).unwrap();
        let b = pool.acquire(ts).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.requests(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_acquired_page_is_clear() {
        let pool = pool(2);
        let ts = SystemTime::now();

        let mut page = pool.acquire(ts).unwrap();
        page.fill(b"payload!");
        page.seq = Sequence::new(42);
        page.start = true;
        pool.release(page);

        let page = pool.acquire(ts).unwrap();
        assert!(page.is_empty());
        assert_eq!(page.seq().raw(), 0);
        assert!(!page.start);
        assert!(!page.end);
        assert!(page.ctx.is_none());
    }

    #[test]
    fn test_exhaustion() {
        let pool = pool(2);
        let ts = SystemTime::now();

        let a = pool.acquire(ts).unwrap();
        let _b = pool.acquire(ts).unwrap();
        assert_eq!(
            pool.acquire(ts).unwrap_err(),
            AssemblyError::PoolExhausted
        );

        pool.release(a);
        assert!(pool.acquire(ts).is_ok());
    }

    #[test]
    fn test_eviction_does_not_free_live_pages() {
        // Zero period so every saturated acquire attempts eviction.
        let pool = PagePool::new(8, 1, Duration::ZERO);
        let ts = SystemTime::now();

        let held = pool.acquire(ts).unwrap();
        assert_eq!(
            pool.acquire(ts).unwrap_err(),
            AssemblyError::PoolExhausted
        );
        assert_eq!(pool.in_use(), 1);
        pool.release(held);
    }

    #[test]
    fn test_trim_operations() {
        let pool = pool(1);
        let mut page = pool.acquire(SystemTime::now()).unwrap();
        page.seq = Sequence::new(100);
        page.fill(b"ABCDEF");

        page.trim_front(2);
        assert_eq!(page.bytes(), b"CDEF");
        assert_eq!(page.seq().raw(), 102);
        assert_eq!(page.end_seq().raw(), 106);

        page.truncate(3);
        assert_eq!(page.bytes(), b"CDE");
        assert_eq!(page.end_seq().raw(), 105);

        pool.release(page);
    }
}
