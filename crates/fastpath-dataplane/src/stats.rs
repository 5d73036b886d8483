//! Engine Statistics
//!
//! Per-core counter shards. The hot path only touches the shard owned by
//! the current thread; readers sum all shards.

use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Why a packet was handed back to the slow path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExceptionReason {
    /// UDP header truncated
    UdpHeaderIncomplete,
    /// No accelerated UDP flow matches
    UdpNoConnection,
    /// UDP first fragment or IP options; flow flushed
    UdpIpOptionsOrInitialFragment,
    /// UDP TTL below 2; flow flushed
    UdpSmallTtl,
    /// UDP datagram exceeds egress MTU; flow flushed
    UdpNeedsFragmentation,
    /// TCP header truncated
    TcpHeaderIncomplete,
    /// No flow matches and flags are not plain ACK
    TcpNoConnectionSlowFlags,
    /// No flow matches although flags are plain ACK
    TcpNoConnectionFastFlags,
    /// TCP first fragment or IP options; flow flushed
    TcpIpOptionsOrInitialFragment,
    /// TCP TTL below 2; flow flushed
    TcpSmallTtl,
    /// TCP segment exceeds egress MTU without GSO; flow flushed
    TcpNeedsFragmentation,
    /// SYN, RST or FIN set, or ACK clear
    TcpFlags,
    /// Sequence beyond the highest acceptable one
    TcpSeqExceedsRightEdge,
    /// Data offset below the base header
    TcpSmallDataOffset,
    /// Malformed SACK or option block
    TcpBadSack,
    /// Data offset beyond the datagram
    TcpBigDataOffset,
    /// Segment ends before the left window edge
    TcpSeqBeforeLeftEdge,
    /// Acknowledges data the peer never sent
    TcpAckExceedsRightEdge,
    /// Acknowledgement too far behind
    TcpAckBeforeLeftEdge,
    /// ICMP header truncated
    IcmpHeaderIncomplete,
    /// Not destination unreachable or time exceeded
    IcmpUnhandledType,
    /// Quoted IPv4 header truncated
    IcmpIpv4HeaderIncomplete,
    /// Quoted datagram is not IPv4
    IcmpIpv4NonV4,
    /// Quoted IPv4 options truncated
    IcmpIpv4IpOptionsIncomplete,
    /// Quoted UDP ports missing
    IcmpIpv4UdpHeaderIncomplete,
    /// Quoted TCP ports missing
    IcmpIpv4TcpHeaderIncomplete,
    /// Quoted datagram is neither UDP nor TCP
    IcmpIpv4UnhandledProtocol,
    /// No flow matches the quoted datagram
    IcmpNoConnection,
    /// Flow of the quoted datagram was flushed
    IcmpFlushedConnection,
    /// Fewer than 20 bytes, or IHL below 5
    HeaderIncomplete,
    /// Total length below 20
    BadTotalLength,
    /// Version is not 4
    NonV4,
    /// Non-zero fragment offset
    NonInitialFragment,
    /// Total length exceeds the buffer
    DatagramIncomplete,
    /// IHL exceeds the buffer
    IpOptionsIncomplete,
    /// Not UDP, TCP or ICMP
    UnhandledProtocol,
}

impl ExceptionReason {
    /// Number of reasons
    pub const COUNT: usize = 36;

    /// Every reason, in counter order
    pub const ALL: [ExceptionReason; Self::COUNT] = [
        Self::UdpHeaderIncomplete,
        Self::UdpNoConnection,
        Self::UdpIpOptionsOrInitialFragment,
        Self::UdpSmallTtl,
        Self::UdpNeedsFragmentation,
        Self::TcpHeaderIncomplete,
        Self::TcpNoConnectionSlowFlags,
        Self::TcpNoConnectionFastFlags,
        Self::TcpIpOptionsOrInitialFragment,
        Self::TcpSmallTtl,
        Self::TcpNeedsFragmentation,
        Self::TcpFlags,
        Self::TcpSeqExceedsRightEdge,
        Self::TcpSmallDataOffset,
        Self::TcpBadSack,
        Self::TcpBigDataOffset,
        Self::TcpSeqBeforeLeftEdge,
        Self::TcpAckExceedsRightEdge,
        Self::TcpAckBeforeLeftEdge,
        Self::IcmpHeaderIncomplete,
        Self::IcmpUnhandledType,
        Self::IcmpIpv4HeaderIncomplete,
        Self::IcmpIpv4NonV4,
        Self::IcmpIpv4IpOptionsIncomplete,
        Self::IcmpIpv4UdpHeaderIncomplete,
        Self::IcmpIpv4TcpHeaderIncomplete,
        Self::IcmpIpv4UnhandledProtocol,
        Self::IcmpNoConnection,
        Self::IcmpFlushedConnection,
        Self::HeaderIncomplete,
        Self::BadTotalLength,
        Self::NonV4,
        Self::NonInitialFragment,
        Self::DatagramIncomplete,
        Self::IpOptionsIncomplete,
        Self::UnhandledProtocol,
    ];

    /// Stable name used in logs and metrics labels
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UdpHeaderIncomplete => "udp_header_incomplete",
            Self::UdpNoConnection => "udp_no_connection",
            Self::UdpIpOptionsOrInitialFragment => "udp_ip_options_or_initial_fragment",
            Self::UdpSmallTtl => "udp_small_ttl",
            Self::UdpNeedsFragmentation => "udp_needs_fragmentation",
            Self::TcpHeaderIncomplete => "tcp_header_incomplete",
            Self::TcpNoConnectionSlowFlags => "tcp_no_connection_slow_flags",
            Self::TcpNoConnectionFastFlags => "tcp_no_connection_fast_flags",
            Self::TcpIpOptionsOrInitialFragment => "tcp_ip_options_or_initial_fragment",
            Self::TcpSmallTtl => "tcp_small_ttl",
            Self::TcpNeedsFragmentation => "tcp_needs_fragmentation",
            Self::TcpFlags => "tcp_flags",
            Self::TcpSeqExceedsRightEdge => "tcp_seq_exceeds_right_edge",
            Self::TcpSmallDataOffset => "tcp_small_data_offset",
            Self::TcpBadSack => "tcp_bad_sack",
            Self::TcpBigDataOffset => "tcp_big_data_offset",
            Self::TcpSeqBeforeLeftEdge => "tcp_seq_before_left_edge",
            Self::TcpAckExceedsRightEdge => "tcp_ack_exceeds_right_edge",
            Self::TcpAckBeforeLeftEdge => "tcp_ack_before_left_edge",
            Self::IcmpHeaderIncomplete => "icmp_header_incomplete",
            Self::IcmpUnhandledType => "icmp_unhandled_type",
            Self::IcmpIpv4HeaderIncomplete => "icmp_ipv4_header_incomplete",
            Self::IcmpIpv4NonV4 => "icmp_ipv4_non_v4",
            Self::IcmpIpv4IpOptionsIncomplete => "icmp_ipv4_ip_options_incomplete",
            Self::IcmpIpv4UdpHeaderIncomplete => "icmp_ipv4_udp_header_incomplete",
            Self::IcmpIpv4TcpHeaderIncomplete => "icmp_ipv4_tcp_header_incomplete",
            Self::IcmpIpv4UnhandledProtocol => "icmp_ipv4_unhandled_protocol",
            Self::IcmpNoConnection => "icmp_no_connection",
            Self::IcmpFlushedConnection => "icmp_flushed_connection",
            Self::HeaderIncomplete => "header_incomplete",
            Self::BadTotalLength => "bad_total_length",
            Self::NonV4 => "non_v4",
            Self::NonInitialFragment => "non_initial_fragment",
            Self::DatagramIncomplete => "datagram_incomplete",
            Self::IpOptionsIncomplete => "ip_options_incomplete",
            Self::UnhandledProtocol => "unhandled_protocol",
        }
    }
}

impl std::fmt::Display for ExceptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-core stats (cache-line aligned by the owning shard array)
pub struct CoreStats {
    create_requests: AtomicU64,
    create_collisions: AtomicU64,
    create_failures: AtomicU64,
    destroy_requests: AtomicU64,
    destroy_misses: AtomicU64,
    match_hash_hits: AtomicU64,
    flushes: AtomicU64,
    packets_forwarded: AtomicU64,
    packets_not_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
    exceptions: [AtomicU64; ExceptionReason::COUNT],
}

impl Default for CoreStats {
    fn default() -> Self {
        Self {
            create_requests: AtomicU64::new(0),
            create_collisions: AtomicU64::new(0),
            create_failures: AtomicU64::new(0),
            destroy_requests: AtomicU64::new(0),
            destroy_misses: AtomicU64::new(0),
            match_hash_hits: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            packets_forwarded: AtomicU64::new(0),
            packets_not_forwarded: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            exceptions: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

#[inline(always)]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CoreStats {
    /// Count a punt. Exceptions are also not-forwarded packets.
    #[inline(always)]
    pub fn record_exception(&self, reason: ExceptionReason) {
        bump(&self.exceptions[reason as usize]);
        bump(&self.packets_not_forwarded);
    }

    /// Count a forwarded packet
    #[inline(always)]
    pub fn record_forwarded(&self) {
        bump(&self.packets_forwarded);
    }

    /// Count a punt without an exception reason
    #[inline(always)]
    pub fn record_not_forwarded(&self) {
        bump(&self.packets_not_forwarded);
    }

    /// Count a packet consumed without transmit
    #[inline(always)]
    pub fn record_dropped(&self) {
        bump(&self.packets_dropped);
    }

    /// Count a match found through the hash
    #[inline(always)]
    pub fn record_hash_hit(&self) {
        bump(&self.match_hash_hits);
    }

    pub(crate) fn record_create_request(&self) {
        bump(&self.create_requests);
    }

    pub(crate) fn record_create_collision(&self) {
        bump(&self.create_collisions);
    }

    pub(crate) fn record_create_failure(&self) {
        bump(&self.create_failures);
    }

    pub(crate) fn record_destroy_request(&self) {
        bump(&self.destroy_requests);
    }

    pub(crate) fn record_destroy_miss(&self) {
        bump(&self.destroy_misses);
    }

    pub(crate) fn record_flush(&self) {
        bump(&self.flushes);
    }

    fn add_into(&self, total: &mut StatsSnapshot) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        total.create_requests += load(&self.create_requests);
        total.create_collisions += load(&self.create_collisions);
        total.create_failures += load(&self.create_failures);
        total.destroy_requests += load(&self.destroy_requests);
        total.destroy_misses += load(&self.destroy_misses);
        total.match_hash_hits += load(&self.match_hash_hits);
        total.flushes += load(&self.flushes);
        total.packets_forwarded += load(&self.packets_forwarded);
        total.packets_not_forwarded += load(&self.packets_not_forwarded);
        total.packets_dropped += load(&self.packets_dropped);
        for (sum, counter) in total.exceptions.iter_mut().zip(&self.exceptions) {
            *sum += load(counter);
        }
    }
}

/// Stats snapshot (non-atomic), summed over all shards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// `create_rule` calls
    pub create_requests: u64,
    /// Creates that hit an existing tuple
    pub create_collisions: u64,
    /// Creates rejected for interfaces or capacity
    pub create_failures: u64,
    /// `destroy_rule` calls
    pub destroy_requests: u64,
    /// Destroys of unknown tuples
    pub destroy_misses: u64,
    /// Matches found through the hash rather than a flow cookie
    pub match_hash_hits: u64,
    /// Connections torn down, by the hot path or the API
    pub flushes: u64,
    /// Packets handed to egress
    pub packets_forwarded: u64,
    /// Packets punted, with or without an exception reason
    pub packets_not_forwarded: u64,
    /// Packets consumed without transmit
    pub packets_dropped: u64,
    /// Per-reason punt counts, indexed by `ExceptionReason as usize`
    pub exceptions: [u64; ExceptionReason::COUNT],
    /// Connections currently in the table
    pub connections: u64,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            create_requests: 0,
            create_collisions: 0,
            create_failures: 0,
            destroy_requests: 0,
            destroy_misses: 0,
            match_hash_hits: 0,
            flushes: 0,
            packets_forwarded: 0,
            packets_not_forwarded: 0,
            packets_dropped: 0,
            exceptions: [0; ExceptionReason::COUNT],
            connections: 0,
        }
    }
}

impl StatsSnapshot {
    /// Count for one exception reason
    pub fn exception(&self, reason: ExceptionReason) -> u64 {
        self.exceptions[reason as usize]
    }

    /// Non-zero exception counts keyed by name
    pub fn exception_map(&self) -> BTreeMap<&'static str, u64> {
        ExceptionReason::ALL
            .iter()
            .filter(|r| self.exception(**r) > 0)
            .map(|r| (r.as_str(), self.exception(*r)))
            .collect()
    }

    /// Every packet that reached `recv` lands in exactly one of these
    pub fn packets_seen(&self) -> u64 {
        self.packets_forwarded + self.packets_not_forwarded + self.packets_dropped
    }

    /// Publish as `metrics` counters and gauges
    pub fn publish(&self) {
        metrics::counter!("fastpath_create_requests").absolute(self.create_requests);
        metrics::counter!("fastpath_create_collisions").absolute(self.create_collisions);
        metrics::counter!("fastpath_create_failures").absolute(self.create_failures);
        metrics::counter!("fastpath_destroy_requests").absolute(self.destroy_requests);
        metrics::counter!("fastpath_destroy_misses").absolute(self.destroy_misses);
        metrics::counter!("fastpath_match_hash_hits").absolute(self.match_hash_hits);
        metrics::counter!("fastpath_flushes").absolute(self.flushes);
        metrics::counter!("fastpath_packets_forwarded").absolute(self.packets_forwarded);
        metrics::counter!("fastpath_packets_not_forwarded").absolute(self.packets_not_forwarded);
        metrics::counter!("fastpath_packets_dropped").absolute(self.packets_dropped);
        for reason in ExceptionReason::ALL {
            metrics::counter!("fastpath_exceptions", "reason" => reason.as_str())
                .absolute(self.exception(reason));
        }
        metrics::gauge!("fastpath_connections").set(self.connections as f64);
    }
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
}

/// Aggregate stats across all cores
pub struct EngineStats {
    shards: Box<[CachePadded<CoreStats>]>,
}

impl EngineStats {
    /// At least one shard is always allocated
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| CachePadded::new(CoreStats::default()))
            .collect();
        Self { shards }
    }

    /// Shard owned by the calling thread
    #[inline(always)]
    pub fn local(&self) -> &CoreStats {
        let idx = SHARD_HINT.with(|hint| *hint) % self.shards.len();
        &self.shards[idx]
    }

    /// Shard by index, wrapping
    pub fn shard(&self, idx: usize) -> &CoreStats {
        &self.shards[idx % self.shards.len()]
    }

    /// Number of shards
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Sum of every shard
    pub fn total(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for shard in self.shards.iter() {
            shard.add_into(&mut total);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_stats() {
        let stats = CoreStats::default();
        stats.record_forwarded();
        stats.record_exception(ExceptionReason::UdpSmallTtl);
        stats.record_hash_hit();

        let mut snap = StatsSnapshot::default();
        stats.add_into(&mut snap);
        assert_eq!(snap.packets_forwarded, 1);
        assert_eq!(snap.packets_not_forwarded, 1);
        assert_eq!(snap.exception(ExceptionReason::UdpSmallTtl), 1);
        assert_eq!(snap.match_hash_hits, 1);
    }

    #[test]
    fn test_aggregate() {
        let agg = EngineStats::new(4);
        agg.shard(0).record_forwarded();
        agg.shard(1).record_forwarded();
        agg.shard(3).record_exception(ExceptionReason::NonV4);

        let total = agg.total();
        assert_eq!(total.packets_forwarded, 2);
        assert_eq!(total.packets_seen(), 3);
        assert_eq!(total.exception_map().get("non_v4"), Some(&1));
    }

    #[test]
    fn test_threads_sum_to_total() {
        let agg = std::sync::Arc::new(EngineStats::new(2));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        agg.local().record_not_forwarded();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(agg.total().packets_not_forwarded, 4000);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = StatsSnapshot::default();
        assert_eq!(snap.packets_seen(), 0);
        assert_eq!(snap.flushes, 0);
        assert_eq!(snap.connections, 0);
        assert!(snap.exceptions.iter().all(|&n| n == 0));
        assert!(snap.exception_map().is_empty());
        assert_eq!(EngineStats::new(3).total(), snap);
    }

    #[test]
    fn test_reason_table_is_consistent() {
        for (i, reason) in ExceptionReason::ALL.iter().enumerate() {
            assert_eq!(*reason as usize, i);
        }
        assert_eq!(ExceptionReason::TcpBadSack.to_string(), "tcp_bad_sack");
    }
}
