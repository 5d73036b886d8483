//! TCP flows: window tracking, flag handling and teardown

mod common;

use common::*;
use fastpath_common::{proto, Endpoint, FlowTuple, RuleError};
use fastpath_dataplane::wire::{be32, tcp::ACK_FLAG, tcp::FIN, tcp::RST, tcp::SYN};
use fastpath_dataplane::{ExceptionReason, PacketBuffer, RecvOutcome, RuleCreate, TcpRule, TcpSeed};

fn client() -> Endpoint {
    ep([10, 0, 0, 5], 40000)
}

fn server() -> Endpoint {
    ep([93, 184, 216, 34], 443)
}

fn public() -> Endpoint {
    ep([203, 0, 113, 9], 40000)
}

fn seeds() -> TcpRule {
    TcpRule {
        flow: TcpSeed {
            window_scale: 0,
            max_window: 65535,
            end: 1000,
            max_end: 1000 + 65535,
        },
        return_: TcpSeed {
            window_scale: 0,
            max_window: 65535,
            end: 5000,
            max_end: 5000 + 65535,
        },
    }
}

fn https_rule() -> RuleCreate {
    let tuple = FlowTuple {
        protocol: proto::TCP,
        src: client(),
        dst: server(),
    };
    RuleCreate::new(tuple, conn_rule()).with_snat(public()).with_tcp(seeds())
}

fn send(h: &Harness, seg: Segment) -> RecvOutcome {
    h.engine.recv(ETH0, PacketBuffer::new(&tcp_packet(client(), server(), 64, seg)))
}

#[test]
fn test_in_window_segment_forwarded() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    assert!(matches!(send(&h, Segment::ack(1000, 5000, 100)), RecvOutcome::Forwarded));

    let out = h.tx.try_recv().unwrap();
    let (_, ip) = split_frame(out.data());
    assert_eq!(ip.len(), 140);
    assert_eq!(&ip[12..16], &[203, 0, 113, 9]);
    assert_eq!(be32(ip, 24), 1000);
    assert!(ip_checksum_ok(ip));
    assert!(l4_checksum_ok(ip));

    let conn = h.engine.find(&https_rule().tuple).unwrap();
    assert_eq!(conn.original_match().tcp.end(), 1100);
}

#[test]
fn test_both_directions_track_each_other() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    assert!(send(&h, Segment::ack(1000, 5000, 500)).is_consumed());

    let reply = tcp_packet(server(), public(), 64, Segment::ack(5000, 1500, 1000));
    assert!(matches!(h.engine.recv(ETH1, PacketBuffer::new(&reply)), RecvOutcome::Forwarded));

    let conn = h.engine.find(&https_rule().tuple).unwrap();
    assert_eq!(conn.original_match().tcp.end(), 1500);
    assert_eq!(conn.reply_match().tcp.end(), 6000);

    let out = h.tx.try_iter().last().unwrap();
    let (_, ip) = split_frame(out.data());
    assert_eq!(&ip[16..20], &[10, 0, 0, 5]);
    assert!(l4_checksum_ok(ip));
}

#[test]
fn test_seq_beyond_right_edge_tears_down() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    let pkt = tcp_packet(client(), server(), 64, Segment::ack(1000 + 65535 + 2, 5000, 0));
    let punted = h.engine.recv(ETH0, PacketBuffer::new(&pkt)).into_punted().unwrap();
    assert_eq!(punted.data(), &pkt[..]);

    let stats = h.engine.stats();
    assert_eq!(stats.exception(ExceptionReason::TcpSeqExceedsRightEdge), 1);
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.flushes, 1);
}

#[test]
fn test_seq_at_right_edge_accepted() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    assert!(send(&h, Segment::ack(1000 + 65535 + 1, 5000, 0)).is_consumed());
}

#[test]
fn test_ack_beyond_peer_data_rejected() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    assert!(!send(&h, Segment::ack(1000, 5002, 10)).is_consumed());
    assert_eq!(h.engine.stats().exception(ExceptionReason::TcpAckExceedsRightEdge), 1);
    assert_eq!(h.engine.connection_count(), 0);
}

#[test]
fn test_state_flags_go_to_slow_path() {
    for flags in [SYN | ACK_FLAG, FIN | ACK_FLAG, RST, RST | ACK_FLAG] {
        let h = harness();
        h.engine.create_rule(&https_rule()).unwrap();

        let seg = Segment {
            flags,
            ..Segment::ack(1000, 5000, 0)
        };
        assert!(!send(&h, seg).is_consumed());
        assert_eq!(h.engine.stats().exception(ExceptionReason::TcpFlags), 1, "flags {flags:#x}");
        assert_eq!(h.engine.connection_count(), 0);
    }
}

#[test]
fn test_push_and_urgent_flags_ignored() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    let seg = Segment {
        flags: ACK_FLAG | 0x08 | 0x20,
        ..Segment::ack(1000, 5000, 10)
    };
    assert!(matches!(send(&h, seg), RecvOutcome::Forwarded));
}

#[test]
fn test_no_connection_classifies_flags() {
    let h = harness();

    assert!(!send(&h, Segment::ack(1, 1, 0)).is_consumed());
    let syn = Segment {
        flags: SYN,
        ..Segment::ack(1, 0, 0)
    };
    assert!(!send(&h, syn).is_consumed());

    let stats = h.engine.stats();
    assert_eq!(stats.exception(ExceptionReason::TcpNoConnectionFastFlags), 1);
    assert_eq!(stats.exception(ExceptionReason::TcpNoConnectionSlowFlags), 1);
    assert_eq!(stats.packets_not_forwarded, 2);
}

#[test]
fn test_no_seq_check_skips_window() {
    let h = harness();
    let mut rule = https_rule();
    rule.no_seq_check = true;
    h.engine.create_rule(&rule).unwrap();

    assert!(matches!(send(&h, Segment::ack(900_000, 5000, 10)), RecvOutcome::Forwarded));

    // Window tracking is not updated either
    let conn = h.engine.find(&rule.tuple).unwrap();
    assert_eq!(conn.original_match().tcp.end(), 1000);

    // Turning checks back on through an update
    rule.no_seq_check = false;
    h.engine.update_rule(&rule).unwrap();
    assert!(!send(&h, Segment::ack(900_000, 5000, 10)).is_consumed());
    assert_eq!(h.engine.stats().exception(ExceptionReason::TcpSeqExceedsRightEdge), 1);
}

#[test]
fn test_segmentation_offload_exempt_from_mtu() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    let big = tcp_packet(client(), server(), 64, Segment::ack(1000, 5000, 3000));
    let mut packet = PacketBuffer::new(&big);
    packet.gso = true;
    assert!(matches!(h.engine.recv(ETH0, packet), RecvOutcome::Forwarded));

    let punted = h.engine.recv(ETH0, PacketBuffer::new(&big)).into_punted().unwrap();
    assert_eq!(punted.data(), &big[..]);
    assert_eq!(h.engine.stats().exception(ExceptionReason::TcpNeedsFragmentation), 1);
}

#[test]
fn test_duplicate_create_merges_state() {
    let h = harness();
    h.engine.create_rule(&https_rule()).unwrap();

    let mut newer = seeds();
    newer.flow.end = 3000;
    newer.flow.max_end = 3000 + 65535;
    let again = https_rule().with_tcp(newer);

    assert!(matches!(h.engine.create_rule(&again), Err(RuleError::Duplicate)));
    let conn = h.engine.find(&again.tuple).unwrap();
    assert_eq!(conn.original_match().tcp.end(), 3000);
    assert_eq!(conn.original_match().tcp.max_end(), 3000 + 65535);

    let stats = h.engine.stats();
    assert_eq!(stats.create_requests, 2);
    assert_eq!(stats.create_collisions, 1);
    assert_eq!(stats.connections, 1);
}

#[test]
fn test_update_unknown_connection() {
    let h = harness();
    assert!(matches!(h.engine.update_rule(&https_rule()), Err(RuleError::NotFound)));
    assert!(matches!(h.engine.update_mark(&https_rule().tuple, 1), Err(RuleError::NotFound)));
}
