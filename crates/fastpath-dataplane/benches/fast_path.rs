//! Fast Path Benchmarks
//!
//! Per-packet cost of the forwarding hook, with and without a populated table.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fastpath_common::{proto, Endpoint, FlowTuple, MacAddr};
use fastpath_dataplane::checksum::{incremental_checksum_update, ip_header_checksum, transport_checksum};
use fastpath_dataplane::{
    ConnectionRule, Egress, Engine, EngineConfig, Interface, InterfaceMap, PacketBuffer, RuleCreate,
};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Discards everything it is handed
struct Sink;

impl Egress for Sink {
    fn transmit(&self, packet: PacketBuffer) {
        black_box(packet);
    }
}

fn engine() -> Engine {
    let interfaces = InterfaceMap::new();
    interfaces.insert(Interface::ethernet(1, "eth0", MacAddr([2, 0, 0, 0, 0, 1])));
    interfaces.insert(Interface::ethernet(2, "eth1", MacAddr([2, 0, 0, 0, 0, 2])));
    let config = EngineConfig {
        num_shards: 1,
        ..Default::default()
    };
    Engine::new(config, Arc::new(interfaces), Arc::new(Sink)).unwrap()
}

fn client(i: u32) -> Endpoint {
    Endpoint::new(Ipv4Addr::from(0x0a00_0000 + i), 1024 + (i % 50000) as u16)
}

fn server() -> Endpoint {
    Endpoint::new(Ipv4Addr::new(8, 8, 8, 8), 53)
}

fn rule(i: u32) -> RuleCreate {
    let tuple = FlowTuple {
        protocol: proto::UDP,
        src: client(i),
        dst: server(),
    };
    let conn = ConnectionRule {
        flow_interface: 1,
        return_interface: 2,
        flow_mtu: 1500,
        return_mtu: 1500,
        flow_mac: MacAddr([0xaa, 0, 0, 0, 0, 1]),
        return_mac: MacAddr([0xbb, 0, 0, 0, 0, 1]),
    };
    let public = Endpoint::new(Ipv4Addr::new(203, 0, 113, 9), 1024 + (i % 50000) as u16);
    RuleCreate::new(tuple, conn).with_snat(public)
}

fn udp_packet(src: Endpoint, dst: Endpoint, len: usize) -> Vec<u8> {
    let mut p = vec![0u8; len];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    p[8] = 64;
    p[9] = proto::UDP;
    p[12..16].copy_from_slice(&src.ip.octets());
    p[16..20].copy_from_slice(&dst.ip.octets());
    p[20..22].copy_from_slice(&src.port.to_be_bytes());
    p[22..24].copy_from_slice(&dst.port.to_be_bytes());
    p[24..26].copy_from_slice(&((len - 20) as u16).to_be_bytes());
    let check = transport_checksum(src.ip, dst.ip, proto::UDP, &p[20..]);
    p[26..28].copy_from_slice(&check.to_be_bytes());
    let check = ip_header_checksum(&p);
    p[10..12].copy_from_slice(&check.to_be_bytes());
    p
}

fn bench_recv_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("recv_forward");

    for connections in [1u32, 1_000, 100_000] {
        let engine = engine();
        for i in 0..connections {
            engine.create_rule(&rule(i)).unwrap();
        }
        let pkt = udp_packet(client(connections / 2), server(), 512);

        group.throughput(Throughput::Bytes(pkt.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(connections), &pkt, |b, pkt| {
            b.iter(|| engine.recv(1, PacketBuffer::new(black_box(pkt))))
        });
    }

    group.finish();
}

fn bench_recv_punt(c: &mut Criterion) {
    let engine = engine();
    engine.create_rule(&rule(0)).unwrap();
    let miss = udp_packet(client(7), server(), 512);

    c.bench_function("recv_no_connection", |b| {
        b.iter(|| engine.recv(1, PacketBuffer::new(black_box(&miss))))
    });
}

fn bench_checksums(c: &mut Criterion) {
    let pkt = udp_packet(client(1), server(), 64);
    let old = client(1);
    let new = Endpoint::new(Ipv4Addr::new(203, 0, 113, 9), 4000);

    c.bench_function("ip_header_checksum", |b| b.iter(|| ip_header_checksum(black_box(&pkt))));
    c.bench_function("incremental_checksum_update", |b| {
        b.iter(|| incremental_checksum_update(black_box(old), black_box(new)))
    });
}

criterion_group!(benches, bench_recv_forward, bench_recv_punt, bench_checksums);

criterion_main!(benches);
