// newbwire demultiplexing benchmarks using criterion.
//
// Measures:
//   - Walking the packets coalesced in one datagram
//   - STREAM frame decoding per packet payload
//   - Acceptor dispatch into one connection's exactly(N) read path
//   - A complete ping-pong exchange over the in-memory network

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use newbmux::{
    Acceptor, AcceptorConfig, BasicNewb, CidPlaintext, Dialer, DialerConfig, InterestSet,
    KeyMaterial, MemoryNetwork, Outbox, Protocol, ProtocolEngine, ReceivePolicy, TransportPolicy,
};
use newbwire::pingpong::{counter_policy, PingClient, PingMonitor, PingServer};
use newbwire::{encode_cid, Frame, Packet, PlainEngine};

fn stream_payload(frames: usize, chunk: usize) -> Bytes {
    let mut buf = BytesMut::new();
    for i in 0..frames {
        Frame::Stream {
            stream_id: 0,
            offset: (i * chunk) as u64,
            fin: false,
            data: Bytes::from(vec![0xABu8; chunk]),
        }
        .encode_into(&mut buf);
    }
    buf.freeze()
}

// ---------------------------------------------------------------------------
// Coalesced datagram walk
// ---------------------------------------------------------------------------

fn bench_datagram_walk(c: &mut Criterion) {
    let engine = PlainEngine::new();
    let counts: &[usize] = &[1, 4, 16];

    let mut group = c.benchmark_group("datagram_walk");
    for &count in counts {
        let mut datagram = BytesMut::new();
        for i in 0..count {
            let dcid = encode_cid(CidPlaintext::new(i as u32, 0, 1));
            Packet::short(dcid, stream_payload(1, 32))
                .unwrap()
                .encode_into(&mut datagram);
        }
        let datagram = datagram.freeze();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{count}pkt")),
            &datagram,
            |b, d| {
                b.iter(|| {
                    let mut offset = 0;
                    while offset < d.len() {
                        let packet = engine.decode(&d.slice(offset..)).unwrap();
                        offset += packet.len();
                        black_box(&packet.dest_plaintext);
                    }
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Frame decode
// ---------------------------------------------------------------------------

fn bench_frame_decode_all(c: &mut Criterion) {
    let shapes: &[(usize, usize)] = &[(1, 1000), (8, 128), (32, 16)];

    let mut group = c.benchmark_group("frame_decode_all");
    for &(frames, chunk) in shapes {
        let payload = stream_payload(frames, chunk);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{frames}x{chunk}B")),
            &payload,
            |b, p| {
                b.iter(|| {
                    black_box(Frame::decode_all(p).unwrap());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Acceptor dispatch
// ---------------------------------------------------------------------------

struct Sink;

impl Protocol for Sink {
    fn on_message(&mut self, data: &[u8], _out: &mut Outbox<'_>) {
        black_box(data);
    }
}

fn bench_acceptor_dispatch(c: &mut Criterion) {
    let chunks: &[usize] = &[64, 512, 1024];

    let mut group = c.benchmark_group("acceptor_dispatch");
    for &chunk in chunks {
        let net = MemoryNetwork::new();
        let server_addr = SocketAddr::from(([127, 0, 0, 1], 4433));
        let peer = SocketAddr::from(([127, 0, 0, 1], 50001));
        let pool = std::sync::Arc::new(parking_lot::Mutex::new(newbmux::NewbPool::new(
            |transport: TransportPolicy<PlainEngine>| Ok(BasicNewb::spawn(transport, Sink)),
        )));
        let config = AcceptorConfig {
            receive_policy: ReceivePolicy::exactly(chunk),
            ..AcceptorConfig::default()
        };
        let mut acceptor = Acceptor::with_socket(
            config,
            PlainEngine::new(),
            &KeyMaterial::from_pem(Vec::new(), b"bench key".to_vec()),
            net.bind(server_addr),
            pool,
        )
        .unwrap();
        let server_cid = encode_cid(acceptor.next_cid());
        let mut interest = InterestSet::new();

        let mut client = PlainEngine::new();
        let mut conn = client
            .connect(server_addr, CidPlaintext::new(0, 1, 0))
            .unwrap();
        let initial = client.poll_transmit(&mut conn, Instant::now()).unwrap();
        acceptor.handle_datagram(&mut interest, peer, initial.payload);
        assert_eq!(acceptor.connection_count(), 1);

        let data = Bytes::from(vec![0x5Au8; chunk]);
        let mut offset = 0u64;
        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_function(BenchmarkId::from_parameter(format!("{chunk}B")), |b| {
            b.iter(|| {
                let frame = Frame::Stream {
                    stream_id: 0,
                    offset,
                    fin: false,
                    data: data.clone(),
                };
                let packet = Packet::short(server_cid.clone(), frame.encode()).unwrap();
                acceptor.handle_datagram(&mut interest, peer, packet.encode());
                offset += chunk as u64;
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// In-memory ping-pong
// ---------------------------------------------------------------------------

fn run_pingpong(messages: u32) -> u32 {
    let net = MemoryNetwork::new();
    let server_addr = SocketAddr::from(([127, 0, 0, 1], 4433));
    let client_addr = SocketAddr::from(([127, 0, 0, 1], 50000));
    let keys = KeyMaterial::from_pem(Vec::new(), b"bench key".to_vec());

    let server_pool = std::sync::Arc::new(parking_lot::Mutex::new(newbmux::NewbPool::new(
        |transport: TransportPolicy<PlainEngine>| {
            Ok(BasicNewb::spawn(transport, PingServer::new()))
        },
    )));
    let config = AcceptorConfig {
        receive_policy: counter_policy(),
        ..AcceptorConfig::default()
    };
    let mut acceptor = Acceptor::with_socket(
        config,
        PlainEngine::new(),
        &keys,
        net.bind(server_addr),
        server_pool,
    )
    .unwrap();
    let mut server_interest = InterestSet::new();

    let monitor = PingMonitor::new();
    let shared = monitor.clone();
    let mut client_pool = newbmux::NewbPool::new(move |transport: TransportPolicy<PlainEngine>| {
        Ok(BasicNewb::spawn(transport, PingClient::new(messages, shared.clone())))
    });
    let mut client_interest = InterestSet::new();
    let mut dialer = Dialer::connect(
        DialerConfig {
            receive_policy: counter_policy(),
            ..DialerConfig::default()
        },
        PlainEngine::new(),
        net.bind(client_addr),
        server_addr,
        &mut client_pool,
        &mut client_interest,
    )
    .unwrap();

    loop {
        let mut moved = false;
        while net.pending(server_addr) > 0 {
            acceptor.read_event(&mut server_interest).unwrap();
            moved = true;
        }
        if server_interest.wants_write() {
            acceptor.write_event(&mut server_interest).unwrap();
            moved = true;
        }
        while net.pending(client_addr) > 0 {
            dialer.read_event(&mut client_interest).unwrap();
            moved = true;
        }
        if client_interest.wants_write() {
            dialer.write_event(&mut client_interest).unwrap();
            moved = true;
        }
        if !moved {
            break;
        }
    }
    monitor.progress().received
}

fn bench_pingpong(c: &mut Criterion) {
    let rounds: &[u32] = &[10, 100];

    let mut group = c.benchmark_group("memory_pingpong");
    for &messages in rounds {
        group.throughput(Throughput::Elements(messages as u64));
        group.bench_with_input(BenchmarkId::from_parameter(messages), &messages, |b, &m| {
            b.iter(|| {
                let received = run_pingpong(m);
                assert_eq!(received, m);
                black_box(received);
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Criterion harness
// ---------------------------------------------------------------------------

criterion_group! {
    name = demux_benches;
    config = Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_datagram_walk,
        bench_frame_decode_all,
        bench_acceptor_dispatch,
        bench_pingpong
}

criterion_main!(demux_benches);
