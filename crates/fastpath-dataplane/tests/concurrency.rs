//! Receive paths racing rule teardown

mod common;

use common::*;
use fastpath_dataplane::{ConnectionSync, PacketBuffer, SyncCallback, SyncReason};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 4;
const PACKETS: usize = 20;
const ROUNDS: usize = 50;

#[test]
fn test_flush_racing_destroy_reports_once() {
    for round in 0..ROUNDS {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::<ConnectionSync>::new()));
        let sink = seen.clone();
        let cb: Arc<dyn SyncCallback> = Arc::new(move |r: &ConnectionSync| sink.lock().push(r.clone()));
        h.engine.register_sync_callback(Some(cb));
        h.engine.create_rule(&dns_rule()).unwrap();

        let forward = udp_packet(ep([10, 0, 0, 5], 1000), ep([8, 8, 8, 8], 53), 64, 60);
        let expiring = udp_packet(ep([10, 0, 0, 5], 1000), ep([8, 8, 8, 8], 53), 1, 60);
        let start = Barrier::new(THREADS + 1);

        thread::scope(|s| {
            for t in 0..THREADS {
                let (engine, start) = (&h.engine, &start);
                let (forward, expiring) = (&forward, &expiring);
                s.spawn(move || {
                    start.wait();
                    for i in 0..PACKETS {
                        // Each thread tries to flush at a different point
                        let pkt = if i == (t * 3 + round) % PACKETS { expiring } else { forward };
                        engine.recv(ETH0, PacketBuffer::new(pkt));
                    }
                });
            }
            start.wait();
            // Either this or a TTL flush wins; the loser finds nothing
            let _ = h.engine.destroy_rule(&dns_rule().tuple);
        });

        let reports = seen.lock();
        assert_eq!(reports.len(), 1, "round {round}");
        assert!(matches!(reports[0].reason, SyncReason::Flush | SyncReason::Destroy));

        let stats = h.engine.stats();
        assert_eq!(stats.packets_seen(), (THREADS * PACKETS) as u64, "round {round}");
        assert_eq!(stats.flushes, 1, "round {round}");
        assert_eq!(stats.connections, 0);
        assert_eq!(h.engine.connection_count(), 0);
    }
}

#[test]
fn test_concurrent_flows_on_separate_connections() {
    let h = harness();
    let rules: Vec<_> = (0..THREADS as u16)
        .map(|i| {
            let mut rule = dns_rule();
            rule.tuple.src.port = 2000 + i;
            rule.with_snat(ep([203, 0, 113, 9], 2000 + i))
        })
        .collect();
    for rule in &rules {
        h.engine.create_rule(rule).unwrap();
    }

    thread::scope(|s| {
        for rule in &rules {
            let engine = &h.engine;
            s.spawn(move || {
                let pkt = udp_packet(rule.tuple.src, rule.tuple.dst, 64, 60);
                for _ in 0..PACKETS {
                    assert!(engine.recv(ETH0, PacketBuffer::new(&pkt)).is_consumed());
                }
            });
        }
    });

    let stats = h.engine.stats();
    assert_eq!(stats.packets_forwarded, (THREADS * PACKETS) as u64);
    for rule in &rules {
        let conn = h.engine.find(&rule.tuple).unwrap();
        assert_eq!(conn.original_match().counters.pending_packets(), PACKETS as u32);
    }
}
