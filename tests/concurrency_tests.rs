//! Concurrency behavior: racing creators, parallel flows, and shutdown
//! accounting.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use flowstitch::{
    Assembler, AssemblerConfig, AssemblyError, CaptureContext, FlowDirection, NetFlow,
    ScatterGather, Sequence, Stream, StreamFactory, TcpSegment, TransportFlow, TCP_FLAG_SYN,
};

/// Collects reassembled bytes keyed by the client address octet.
#[derive(Default)]
struct ByteSink {
    streams: Mutex<Vec<(u8, Arc<Mutex<Vec<u8>>>)>>,
    created: AtomicUsize,
}

impl ByteSink {
    fn bytes_for(&self, octet: u8) -> Vec<u8> {
        let streams = self.streams.lock().unwrap();
        let (_, bytes) = streams
            .iter()
            .find(|(o, _)| *o == octet)
            .expect("stream for flow");
        let bytes = bytes.lock().unwrap();
        bytes.clone()
    }
}

struct SinkStream {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Stream for SinkStream {
    fn accept(
        &mut self,
        _segment: &TcpSegment,
        _ctx: &CaptureContext,
        _dir: FlowDirection,
        _next_seq: Option<Sequence>,
        _start: &mut bool,
    ) -> bool {
        true
    }

    fn reassembled(&mut self, data: &ScatterGather<'_>, _ctx: &CaptureContext) {
        self.bytes
            .lock()
            .unwrap()
            .extend_from_slice(&data.fetch(data.total_len()));
    }

    fn reassembly_complete(&mut self, _ctx: &CaptureContext) -> bool {
        true
    }
}

impl StreamFactory for ByteSink {
    fn create(
        &self,
        net: NetFlow,
        _transport: TransportFlow,
        _segment: &TcpSegment,
        _ctx: &CaptureContext,
    ) -> Option<Box<dyn Stream>> {
        self.created.fetch_add(1, Ordering::Relaxed);
        let octet = match net.src {
            IpAddr::V4(v4) => v4.octets()[3],
            IpAddr::V6(_) => 0,
        };
        let bytes = Arc::new(Mutex::new(Vec::new()));
        self.streams.lock().unwrap().push((octet, Arc::clone(&bytes)));
        Some(Box::new(SinkStream { bytes }))
    }
}

fn net_for(octet: u8) -> NetFlow {
    NetFlow::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
    )
}

fn syn(seq: u32) -> TcpSegment {
    TcpSegment::new(50000, 80, seq, Bytes::new()).with_flags(TCP_FLAG_SYN)
}

fn data(seq: u32, payload: Vec<u8>) -> TcpSegment {
    TcpSegment::new(50000, 80, seq, Bytes::from(payload))
}

#[test]
fn test_concurrent_same_key_creates_one_stream() {
    let sink = Arc::new(ByteSink::default());
    let asm = Arc::new(Assembler::new(sink.clone(), AssemblerConfig::default()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let asm = Arc::clone(&asm);
        handles.push(thread::spawn(move || {
            asm.assemble(net_for(1), &syn(1000), CaptureContext::now())
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(sink.created.load(Ordering::Relaxed), 1);
    assert_eq!(asm.pool_stats().active_connections, 1);
    assert_eq!(asm.pool_stats().total_created, 1);
}

#[test]
fn test_parallel_flows_reassemble_independently() {
    let sink = Arc::new(ByteSink::default());
    let asm = Arc::new(Assembler::new(sink.clone(), AssemblerConfig::default()).unwrap());

    let mut handles = Vec::new();
    for octet in 1..=4u8 {
        let asm = Arc::clone(&asm);
        handles.push(thread::spawn(move || {
            let net = net_for(octet);
            asm.assemble(net, &syn(100), CaptureContext::now()).unwrap();
            let mut seq = 101u32;
            for chunk in 0..10u8 {
                let payload = vec![octet * 16 + chunk; 8];
                asm.assemble(net, &data(seq, payload), CaptureContext::now())
                    .unwrap();
                seq += 8;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(asm.pool_stats().active_connections, 4);
    for octet in 1..=4u8 {
        let bytes = sink.bytes_for(octet);
        let expected: Vec<u8> = (0..10u8).flat_map(|chunk| vec![octet * 16 + chunk; 8]).collect();
        assert_eq!(bytes, expected, "flow {} corrupted", octet);
    }
    // Everything was delivered in order, nothing is buffered.
    assert_eq!(asm.pages_in_use(), 0);
}

#[test]
fn test_close_drains_and_zeroes_accounting() {
    let sink = Arc::new(ByteSink::default());
    let asm = Assembler::new(sink.clone(), AssemblerConfig::default()).unwrap();

    // Leave out-of-order data queued on several flows.
    for octet in 1..=3u8 {
        let net = net_for(octet);
        asm.assemble(net, &syn(100), CaptureContext::now()).unwrap();
        asm.assemble(net, &data(150, vec![octet; 16]), CaptureContext::now())
            .unwrap();
    }
    assert_eq!(asm.pages_in_use(), 3);
    assert_eq!(asm.pool_stats().active_connections, 3);

    asm.close();

    assert_eq!(asm.pages_in_use(), 0);
    assert_eq!(asm.pool_stats().active_connections, 0);
    assert!(asm.pool_stats().closed);
    // Queued bytes were delivered on the way out.
    for octet in 1..=3u8 {
        assert_eq!(sink.bytes_for(octet), vec![octet; 16]);
    }

    let err = asm
        .assemble(net_for(1), &syn(100), CaptureContext::now())
        .unwrap_err();
    assert_eq!(err, AssemblyError::Closed);
}

#[test]
fn test_close_is_idempotent() {
    let sink = Arc::new(ByteSink::default());
    let asm = Assembler::new(sink, AssemblerConfig::default()).unwrap();

    asm.close();
    asm.close();
    assert!(asm.pool_stats().closed);
}

#[test]
fn test_concurrent_assembly_and_flush() {
    let sink = Arc::new(ByteSink::default());
    let asm = Arc::new(Assembler::new(sink.clone(), AssemblerConfig::default()).unwrap());

    let mut handles = Vec::new();
    for octet in 1..=4u8 {
        let asm = Arc::clone(&asm);
        handles.push(thread::spawn(move || {
            let net = net_for(octet);
            asm.assemble(net, &syn(100), CaptureContext::now()).unwrap();
            for step in 0..5u32 {
                // Every other segment arrives ahead of its gap.
                let seq = 101 + step * 8;
                asm.assemble(net, &data(seq + 4, vec![octet; 4]), CaptureContext::now())
                    .unwrap();
                asm.assemble(net, &data(seq, vec![octet; 4]), CaptureContext::now())
                    .unwrap();
            }
        }));
    }
    let flusher = {
        let asm = Arc::clone(&asm);
        thread::spawn(move || {
            for _ in 0..10 {
                // A cutoff in the past: sweeps run but flush nothing live.
                let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
                asm.flush_older_than(cutoff);
            }
        })
    };
    for handle in handles {
        handle.join().unwrap();
    }
    flusher.join().unwrap();

    for octet in 1..=4u8 {
        assert_eq!(sink.bytes_for(octet), vec![octet; 40], "flow {}", octet);
    }
    assert_eq!(asm.pages_in_use(), 0);
}
