//! Shared fixtures for the scenario tests

#![allow(dead_code)]

use crossbeam::channel::Receiver;
use fastpath_common::{proto, Endpoint, FlowTuple, MacAddr};
use fastpath_dataplane::checksum::{checksum_fold, ip_header_checksum, ones_complement_sum, pseudo_header_sum, transport_checksum};
use fastpath_dataplane::wire::{self, be16};
use fastpath_dataplane::{
    ChannelEgress, ConnectionRule, Engine, EngineConfig, Interface, InterfaceMap, PacketBuffer, RuleCreate,
};
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const ETH0: u32 = 1;
pub const ETH1: u32 = 2;
pub const ETH0_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x10]);
pub const ETH1_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x11]);
pub const CLIENT_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0, 0, 0x05]);
pub const GATEWAY_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0, 0, 0x01]);

pub fn ep(a: [u8; 4], port: u16) -> Endpoint {
    Endpoint::new(Ipv4Addr::from(a), port)
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub tx: Receiver<PacketBuffer>,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig {
        num_shards: 4,
        ..Default::default()
    })
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let interfaces = InterfaceMap::new();
    interfaces.insert(Interface::ethernet(ETH0, "eth0", ETH0_MAC));
    interfaces.insert(Interface::ethernet(ETH1, "eth1", ETH1_MAC));
    let (egress, tx) = ChannelEgress::new(1024);
    let engine = Engine::new(config, Arc::new(interfaces), Arc::new(egress)).expect("valid config");
    Harness {
        engine: Arc::new(engine),
        tx,
    }
}

pub fn conn_rule() -> ConnectionRule {
    ConnectionRule {
        flow_interface: ETH0,
        return_interface: ETH1,
        flow_mtu: 1500,
        return_mtu: 1500,
        flow_mac: CLIENT_MAC,
        return_mac: GATEWAY_MAC,
    }
}

/// UDP 10.0.0.5:1000 to 8.8.8.8:53, source translated to 203.0.113.9:1000
pub fn dns_rule() -> RuleCreate {
    let tuple = FlowTuple {
        protocol: proto::UDP,
        src: ep([10, 0, 0, 5], 1000),
        dst: ep([8, 8, 8, 8], 53),
    };
    RuleCreate::new(tuple, conn_rule()).with_snat(ep([203, 0, 113, 9], 1000))
}

fn ipv4_header(buf: &mut [u8], protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, ttl: u8) {
    let tot_len = buf.len() as u16;
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&tot_len.to_be_bytes());
    buf[4..6].copy_from_slice(&0x1c46u16.to_be_bytes());
    buf[8] = ttl;
    buf[9] = protocol;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    let check = ip_header_checksum(buf);
    buf[10..12].copy_from_slice(&check.to_be_bytes());
}

/// IPv4/UDP datagram of `total` bytes with a valid UDP checksum
pub fn udp_packet(src: Endpoint, dst: Endpoint, ttl: u8, total: usize) -> Vec<u8> {
    let mut buf = vec![0u8; total];
    let udp_len = (total - 20) as u16;
    {
        let udp = &mut buf[20..];
        udp[0..2].copy_from_slice(&src.port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst.port.to_be_bytes());
        udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
        for (i, b) in udp[8..].iter_mut().enumerate() {
            *b = i as u8;
        }
        let check = transport_checksum(src.ip, dst.ip, proto::UDP, udp);
        udp[6..8].copy_from_slice(&check.to_be_bytes());
    }
    ipv4_header(&mut buf, proto::UDP, src.ip, dst.ip, ttl);
    buf
}

/// TCP segment fields
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: usize,
}

impl Segment {
    pub fn ack(seq: u32, ack: u32, payload: usize) -> Self {
        Self {
            seq,
            ack,
            flags: wire::tcp::ACK_FLAG,
            window: 65535,
            payload,
        }
    }
}

/// IPv4/TCP datagram with a valid TCP checksum
pub fn tcp_packet(src: Endpoint, dst: Endpoint, ttl: u8, seg: Segment) -> Vec<u8> {
    let total = 20 + 20 + seg.payload;
    let mut buf = vec![0u8; total];
    {
        let tcp = &mut buf[20..];
        tcp[0..2].copy_from_slice(&src.port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst.port.to_be_bytes());
        tcp[4..8].copy_from_slice(&seg.seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&seg.ack.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = seg.flags;
        tcp[14..16].copy_from_slice(&seg.window.to_be_bytes());
        let check = transport_checksum(src.ip, dst.ip, proto::TCP, tcp);
        tcp[16..18].copy_from_slice(&check.to_be_bytes());
    }
    ipv4_header(&mut buf, proto::TCP, src.ip, dst.ip, ttl);
    buf
}

/// ICMP error of `icmp_type` quoting the first 28 bytes of `quoted`
pub fn icmp_error(src: Ipv4Addr, dst: Ipv4Addr, icmp_type: u8, quoted: &[u8]) -> Vec<u8> {
    let quoted = &quoted[..28.min(quoted.len())];
    let mut buf = vec![0u8; 20 + 8 + quoted.len()];
    buf[20] = icmp_type;
    buf[28..].copy_from_slice(quoted);
    ipv4_header(&mut buf, proto::ICMP, src, dst, 64);
    buf
}

/// IP header checksum verifies
pub fn ip_checksum_ok(ip: &[u8]) -> bool {
    checksum_fold(ones_complement_sum(&ip[..20], 0)) == 0xffff
}

/// Transport checksum verifies against the (possibly rewritten) addresses
pub fn l4_checksum_ok(ip: &[u8]) -> bool {
    let protocol = ip[9];
    let segment = &ip[20..be16(ip, 2) as usize];
    let pseudo = pseudo_header_sum(wire::addr(ip, 12), wire::addr(ip, 16), protocol, segment.len());
    checksum_fold(ones_complement_sum(segment, pseudo)) == 0xffff
}

/// Split an egress frame into Ethernet header and IP datagram
pub fn split_frame(frame: &[u8]) -> (&[u8], &[u8]) {
    frame.split_at(14)
}
