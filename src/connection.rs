//! Connections and the Flow-Keyed Connection Table
//!
//! A connection pairs the reassembly state for both directions of a flow
//! with the consumer supplied by the stream factory. The table multiplexes
//! concurrent lookups over a reader-writer lock, resolves the reverse key
//! to the opposite direction, guards creation with double-checked locking,
//! and enforces a live-connection cap.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::SystemTime;

use crate::errors::AssemblyError;
use crate::flow::{FlowDirection, FlowKey};
use crate::page::{PageBuffer, PagePool};
use crate::segment::{CaptureContext, TcpSegment};
use crate::sequence::Sequence;
use crate::stream::{DeliveryStats, Stream, StreamFactory};

/// Reassembly state for one direction of a flow.
pub(crate) struct HalfConnection {
    pub(crate) direction: FlowDirection,
    /// Next sequence number the engine expects, once established.
    pub(crate) next_seq: Option<Sequence>,
    /// Latest acknowledgment observed from this direction.
    pub(crate) ack_seq: Option<Sequence>,
    /// Queued pages, sorted by sequence, no byte covered twice.
    pub(crate) pages: VecDeque<PageBuffer>,
    pub(crate) queued_packets: u64,
    pub(crate) queued_bytes: u64,
    pub(crate) overlap_packets: u64,
    pub(crate) overlap_bytes: u64,
    pub(crate) last_seen: SystemTime,
    pub(crate) closed: bool,
}

impl HalfConnection {
    pub(crate) fn new(direction: FlowDirection, last_seen: SystemTime) -> Self {
        Self {
            direction,
            next_seq: None,
            ack_seq: None,
            pages: VecDeque::new(),
            queued_packets: 0,
            queued_bytes: 0,
            overlap_packets: 0,
            overlap_bytes: 0,
            last_seen,
            closed: false,
        }
    }

    pub(crate) fn release_pages(&mut self, pool: &PagePool) {
        while let Some(page) = self.pages.pop_front() {
            pool.release(page);
        }
    }

    pub(crate) fn delivery_stats(&self) -> DeliveryStats {
        DeliveryStats {
            queued_packets: self.queued_packets,
            queued_bytes: self.queued_bytes,
            overlap_packets: self.overlap_packets,
            overlap_bytes: self.overlap_bytes,
        }
    }

    fn stats(&self) -> HalfStats {
        HalfStats {
            next_seq: self.next_seq,
            ack_seq: self.ack_seq,
            pages: self.pages.len(),
            queued_packets: self.queued_packets,
            queued_bytes: self.queued_bytes,
            overlap_packets: self.overlap_packets,
            overlap_bytes: self.overlap_bytes,
            closed: self.closed,
        }
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) c2s: HalfConnection,
    pub(crate) s2c: HalfConnection,
    pub(crate) stream: Box<dyn Stream>,
}

impl ConnectionInner {
    /// Split into the addressed half, the opposite half, and the consumer.
    pub(crate) fn parts(
        &mut self,
        dir: FlowDirection,
    ) -> (&mut HalfConnection, &mut HalfConnection, &mut dyn Stream) {
        let ConnectionInner { c2s, s2c, stream } = self;
        match dir {
            FlowDirection::ClientToServer => (c2s, s2c, stream.as_mut()),
            FlowDirection::ServerToClient => (s2c, c2s, stream.as_mut()),
        }
    }
}

/// One tracked conversation: both half-connections plus the consumer,
/// serialized by a single mutex.
pub struct Connection {
    pub(crate) key: FlowKey,
    inner: Mutex<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("key", &self.key).finish()
    }
}

impl Connection {
    fn new(key: FlowKey, stream: Box<dyn Stream>, last_seen: SystemTime) -> Self {
        Self {
            key,
            inner: Mutex::new(ConnectionInner {
                c2s: HalfConnection::new(FlowDirection::ClientToServer, last_seen),
                s2c: HalfConnection::new(FlowDirection::ServerToClient, last_seen),
                stream,
            }),
        }
    }

    /// The key the connection was created under (first direction seen).
    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap()
    }

    /// Snapshot the counters of both halves.
    pub fn stats(&self) -> ConnectionStats {
        let inner = self.lock();
        ConnectionStats {
            client_to_server: inner.c2s.stats(),
            server_to_client: inner.s2c.stats(),
        }
    }
}

/// Read-only snapshot of one half-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalfStats {
    pub next_seq: Option<Sequence>,
    pub ack_seq: Option<Sequence>,
    pub pages: usize,
    pub queued_packets: u64,
    pub queued_bytes: u64,
    pub overlap_packets: u64,
    pub overlap_bytes: u64,
    pub closed: bool,
}

/// Read-only snapshot of both halves of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub client_to_server: HalfStats,
    pub server_to_client: HalfStats,
}

/// Read-only snapshot of the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active_connections: usize,
    pub total_created: u64,
    pub closed: bool,
}

/// Flow-keyed table of live connections.
pub struct ConnectionTable {
    conns: RwLock<HashMap<FlowKey, Arc<Connection>>>,
    factory: Arc<dyn StreamFactory>,
    pool: Arc<PagePool>,
    max_connections: usize,
    active: AtomicUsize,
    total_created: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionTable {
    pub fn new(factory: Arc<dyn StreamFactory>, pool: Arc<PagePool>, max_connections: usize) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            factory,
            pool,
            max_connections,
            active: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Look up the connection for `key`, creating it when absent.
    ///
    /// Returns the connection and the direction the key addresses, or
    /// `None` when the segment alone cannot initiate a flow. Creation uses
    /// double-checked locking so concurrent first packets for the same key
    /// produce exactly one consumer.
    pub(crate) fn get_or_create(
        &self,
        key: FlowKey,
        terminator: bool,
        last_seen: SystemTime,
        segment: &TcpSegment,
        ctx: &CaptureContext,
    ) -> Result<Option<(Arc<Connection>, FlowDirection)>, AssemblyError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(AssemblyError::Closed);
        }

        {
            let map = self.conns.read().unwrap();
            if let Some(found) = Self::lookup(&map, &key) {
                return Ok(Some(found));
            }
        }

        if terminator {
            return Ok(None);
        }

        if self.active.load(Ordering::Relaxed) >= self.max_connections {
            return Err(AssemblyError::ConnectionLimit);
        }

        let mut map = self.conns.write().unwrap();
        if self.closed.load(Ordering::Relaxed) {
            return Err(AssemblyError::Closed);
        }
        if let Some(found) = Self::lookup(&map, &key) {
            return Ok(Some(found));
        }

        let stream = self
            .factory
            .create(key.net, key.transport, segment, ctx)
            .ok_or(AssemblyError::NilStream)?;

        let conn = Arc::new(Connection::new(key, stream, last_seen));
        map.insert(key, Arc::clone(&conn));
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total_created.fetch_add(1, Ordering::Relaxed);

        Ok(Some((conn, FlowDirection::ClientToServer)))
    }

    fn lookup(
        map: &HashMap<FlowKey, Arc<Connection>>,
        key: &FlowKey,
    ) -> Option<(Arc<Connection>, FlowDirection)> {
        if let Some(conn) = map.get(key) {
            return Some((Arc::clone(conn), FlowDirection::ClientToServer));
        }
        if let Some(conn) = map.get(&key.reversed()) {
            return Some((Arc::clone(conn), FlowDirection::ServerToClient));
        }
        None
    }

    /// Find an existing connection without creating one.
    pub fn find(&self, key: &FlowKey) -> Option<Arc<Connection>> {
        let map = self.conns.read().unwrap();
        Self::lookup(&map, key).map(|(conn, _)| conn)
    }

    /// Remove a connection from the table.
    pub(crate) fn remove(&self, conn: &Connection) {
        let mut map = self.conns.write().unwrap();
        if map.remove(&conn.key).is_some() {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// All live connections at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let map = self.conns.read().unwrap();
        map.values().map(Arc::clone).collect()
    }

    /// Tear down the table. Idempotent; later lookups fail with `Closed`.
    ///
    /// Connections are drained out of the map first and their pages released
    /// afterwards, so the exclusive lock is never held while a connection
    /// mutex is taken.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let drained: Vec<Arc<Connection>> = {
            let mut map = self.conns.write().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        self.active.store(0, Ordering::Relaxed);
        for conn in drained {
            let mut inner = conn.lock();
            inner.c2s.release_pages(&self.pool);
            inner.s2c.release_pages(&self.pool);
            inner.c2s.closed = true;
            inner.s2c.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_connections: self.active.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}
