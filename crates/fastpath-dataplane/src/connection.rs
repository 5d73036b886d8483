//! Connection data model
//!
//! A [`Connection`] owns both of its one-directional [`ConnectionMatch`]
//! records by value. A match reaches its sibling through the connection
//! ([`Connection::counterpart`]), never through a pointer of its own.
//!
//! Fields written by the hot path (TCP window state, rx deltas, flags that
//! an update may flip) are atomics. Everything else is fixed at creation.

use crate::checksum::CsumAdjust;
use crate::sync::{ConnectionSync, SyncReason, TcpState};
use fastpath_common::{Endpoint, FlowTuple, MacAddr, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Which half of a connection a match record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Flow initiator towards responder
    Original,
    /// Responder back towards initiator
    Reply,
}

impl Direction {
    /// The opposite direction
    #[inline(always)]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Original => Self::Reply,
            Self::Reply => Self::Original,
        }
    }

    #[inline(always)]
    const fn index(self) -> usize {
        match self {
            Self::Original => 0,
            Self::Reply => 1,
        }
    }
}

/// Per-match behaviour flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct MatchFlags(u32);

impl MatchFlags {
    /// Rewrite source address/port
    pub const XLATE_SRC: Self = Self(1 << 0);
    /// Rewrite destination address/port
    pub const XLATE_DEST: Self = Self(1 << 1);
    /// Skip the TCP window validator
    pub const NO_SEQ_CHECK: Self = Self(1 << 2);
    /// Egress needs an L2 header
    pub const WRITE_L2_HDR: Self = Self(1 << 3);
    /// L2 header is plain Ethernet and written inline
    pub const WRITE_FAST_ETH_HDR: Self = Self(1 << 4);
    /// Override the packet priority
    pub const PRIORITY_REMARK: Self = Self(1 << 5);
    /// Override the DSCP bits
    pub const DSCP_REMARK: Self = Self(1 << 6);

    /// No flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// All bits of `other` set
    #[inline(always)]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set bits of `other`
    #[inline(always)]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for MatchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// TCP tracking state for one direction.
///
/// `end` and `max_end` live in sequence space and only move forward
/// (wrapping comparison) outside of an explicit rule update.
#[derive(Debug, Default)]
pub struct TcpWindow {
    /// Window scale shift announced by this direction
    pub win_scale: u8,
    pub(crate) max_win: AtomicU32,
    pub(crate) end: AtomicU32,
    pub(crate) max_end: AtomicU32,
}

impl TcpWindow {
    /// Seed from a rule; a zero max window becomes 1
    pub fn new(win_scale: u8, max_win: u32, end: u32, max_end: u32) -> Self {
        Self {
            win_scale,
            max_win: AtomicU32::new(max_win.max(1)),
            end: AtomicU32::new(end),
            max_end: AtomicU32::new(max_end),
        }
    }

    /// Largest scaled window seen from this direction
    pub fn max_win(&self) -> u32 {
        self.max_win.load(Ordering::Relaxed)
    }

    /// Highest segment end sent by this direction
    pub fn end(&self) -> u32 {
        self.end.load(Ordering::Relaxed)
    }

    /// Highest sequence the peer allows this direction to send
    pub fn max_end(&self) -> u32 {
        self.max_end.load(Ordering::Relaxed)
    }

    /// Point-in-time copy for sync reports
    pub fn state(&self) -> TcpState {
        TcpState {
            max_window: self.max_win(),
            end: self.end(),
            max_end: self.max_end(),
        }
    }

    /// Merge newer state from the connection manager
    pub fn merge(&self, max_win: u32, end: u32, max_end: u32) {
        self.max_win.fetch_max(max_win, Ordering::Relaxed);
        if seq_before(self.end(), end) {
            self.end.store(end, Ordering::Relaxed);
        }
        if seq_before(self.max_end(), max_end) {
            self.max_end.store(max_end, Ordering::Relaxed);
        }
    }
}

/// `a` strictly precedes `b` in wrapping sequence space
#[inline(always)]
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Rx counters: an atomic delta since the last sync plus the reconciled total
#[derive(Debug, Default)]
pub struct MatchCounters {
    packets: AtomicU32,
    bytes: AtomicU32,
    packets_total: AtomicU64,
    bytes_total: AtomicU64,
}

impl MatchCounters {
    /// Count one forwarded packet
    #[inline(always)]
    pub fn record(&self, len: u32) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
    }

    /// Packets since the last sync
    pub fn pending_packets(&self) -> u32 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Move the deltas into the totals; returns the deltas moved.
    ///
    /// Subtracting what was read keeps increments that race with the drain.
    pub fn drain(&self) -> (u32, u32) {
        let packets = self.packets.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        self.packets_total.fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets.fetch_sub(packets, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
        (packets, bytes)
    }

    /// Reconciled packet total
    pub fn packets_total(&self) -> u64 {
        self.packets_total.load(Ordering::Relaxed)
    }

    /// Reconciled byte total
    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }
}

/// One direction's forwarding record
#[derive(Debug)]
pub struct ConnectionMatch {
    /// Direction within the owning connection
    pub direction: Direction,
    /// Ingress interface
    pub match_dev: u32,
    /// IP protocol number
    pub protocol: u8,
    /// Source as it arrives
    pub match_src: Endpoint,
    /// Destination as it arrives
    pub match_dst: Endpoint,
    /// Source written when `XLATE_SRC` is set
    pub xlate_src: Endpoint,
    /// Destination written when `XLATE_DEST` is set
    pub xlate_dst: Endpoint,
    /// Transport checksum adjustment for the source rewrite
    pub xlate_src_csum: CsumAdjust,
    /// Transport checksum adjustment for the destination rewrite
    pub xlate_dst_csum: CsumAdjust,
    pub(crate) flags: AtomicU32,
    /// TCP state; untouched for other protocols
    pub tcp: TcpWindow,
    /// Packets and bytes forwarded in this direction
    pub counters: MatchCounters,
    /// Egress interface
    pub xmit_dev: u32,
    /// L2 source: the egress interface address
    pub xmit_src_mac: MacAddr,
    /// L2 destination: the next hop
    pub xmit_dst_mac: MacAddr,
    /// Largest datagram forwarded without a flush
    pub mtu: u16,
    /// Priority applied with `PRIORITY_REMARK`
    pub priority: u32,
    /// DSCP, already shifted into TOS position
    pub dscp: u8,
    /// Direction may be forwarded by the fast path
    pub accel: bool,
    pub(crate) flow_cookie: AtomicU32,
}

impl ConnectionMatch {
    /// Current flags
    #[inline(always)]
    pub fn flags(&self) -> MatchFlags {
        MatchFlags(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn set_no_seq_check(&self, on: bool) {
        if on {
            self.flags.fetch_or(MatchFlags::NO_SEQ_CHECK.bits(), Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!MatchFlags::NO_SEQ_CHECK.bits(), Ordering::Relaxed);
        }
    }

    /// Exact match on ingress interface and tuple
    #[inline(always)]
    pub fn matches(&self, dev: u32, protocol: u8, src: Endpoint, dst: Endpoint) -> bool {
        self.match_src == src && self.match_dst == dst && self.protocol == protocol && self.match_dev == dev
    }

    /// Flow cookie slot, 0 when none
    pub fn flow_cookie(&self) -> u32 {
        self.flow_cookie.load(Ordering::Relaxed)
    }

    pub(crate) fn compute_translations(&mut self) {
        let flags = self.flags();
        if flags.contains(MatchFlags::XLATE_SRC) {
            self.xlate_src_csum = CsumAdjust::new(self.match_src, self.xlate_src);
        }
        if flags.contains(MatchFlags::XLATE_DEST) {
            self.xlate_dst_csum = CsumAdjust::new(self.match_dst, self.xlate_dst);
        }
    }
}

/// Fields needed to build one direction's match record
#[derive(Debug, Clone)]
pub(crate) struct MatchParams {
    pub direction: Direction,
    pub match_dev: u32,
    pub protocol: u8,
    pub match_src: Endpoint,
    pub match_dst: Endpoint,
    pub xlate_src: Endpoint,
    pub xlate_dst: Endpoint,
    pub flags: MatchFlags,
    pub tcp: (u8, u32, u32, u32),
    pub xmit_dev: u32,
    pub xmit_src_mac: MacAddr,
    pub xmit_dst_mac: MacAddr,
    pub mtu: u16,
    pub priority: u32,
    pub dscp: u8,
    pub accel: bool,
}

impl ConnectionMatch {
    pub(crate) fn build(p: MatchParams) -> Self {
        let (win_scale, max_win, end, max_end) = p.tcp;
        let mut cm = Self {
            direction: p.direction,
            match_dev: p.match_dev,
            protocol: p.protocol,
            match_src: p.match_src,
            match_dst: p.match_dst,
            xlate_src: p.xlate_src,
            xlate_dst: p.xlate_dst,
            xlate_src_csum: CsumAdjust::default(),
            xlate_dst_csum: CsumAdjust::default(),
            flags: AtomicU32::new(p.flags.bits()),
            tcp: TcpWindow::new(win_scale, max_win, end, max_end),
            counters: MatchCounters::default(),
            xmit_dev: p.xmit_dev,
            xmit_src_mac: p.xmit_src_mac,
            xmit_dst_mac: p.xmit_dst_mac,
            mtu: p.mtu,
            priority: p.priority,
            dscp: p.dscp,
            accel: p.accel,
            flow_cookie: AtomicU32::new(0),
        };
        cm.compute_translations();
        cm
    }
}

/// One accelerated bidirectional flow
#[derive(Debug)]
pub struct Connection {
    /// Insertion order; also the traversal list key
    pub id: u64,
    /// Pre-translation tuple: flow endpoint to return endpoint
    pub original: FlowTuple,
    /// Post-translation tuple
    pub translated: FlowTuple,
    matches: [ConnectionMatch; 2],
    mark: AtomicU32,
    removed: AtomicBool,
    last_sync: AtomicU64,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        original: FlowTuple,
        translated: FlowTuple,
        original_match: ConnectionMatch,
        reply_match: ConnectionMatch,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            original,
            translated,
            matches: [original_match, reply_match],
            mark: AtomicU32::new(0),
            removed: AtomicBool::new(false),
            last_sync: AtomicU64::new(now.as_nanos()),
        }
    }

    /// IP protocol number
    pub fn protocol(&self) -> u8 {
        self.original.protocol
    }

    /// Match record for one direction
    #[inline(always)]
    pub fn match_for(&self, dir: Direction) -> &ConnectionMatch {
        &self.matches[dir.index()]
    }

    /// The sibling of the `dir` record
    #[inline(always)]
    pub fn counterpart(&self, dir: Direction) -> &ConnectionMatch {
        self.match_for(dir.counterpart())
    }

    /// Flow endpoint to return endpoint
    pub fn original_match(&self) -> &ConnectionMatch {
        self.match_for(Direction::Original)
    }

    /// Return endpoint back to the flow endpoint
    pub fn reply_match(&self) -> &ConnectionMatch {
        self.match_for(Direction::Reply)
    }

    /// Interface the original direction arrives on
    pub fn original_dev(&self) -> u32 {
        self.original_match().match_dev
    }

    /// Interface the reply direction arrives on
    pub fn reply_dev(&self) -> u32 {
        self.reply_match().match_dev
    }

    /// Mark stamped on forwarded packets
    #[inline(always)]
    pub fn mark(&self) -> u32 {
        self.mark.load(Ordering::Relaxed)
    }

    /// Replace the mark, returning the old one
    pub(crate) fn set_mark(&self, mark: u32) -> u32 {
        self.mark.swap(mark, Ordering::Relaxed)
    }

    /// Unlinked from the table; readers may still hold it
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Flag as removed; false if it already was
    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    /// Either direction has packets not yet reported
    pub fn has_pending(&self) -> bool {
        self.original_match().counters.pending_packets() > 0
            || self.reply_match().counters.pending_packets() > 0
    }

    /// Build a sync report, draining both directions' deltas
    pub fn snapshot(&self, reason: SyncReason, now: Timestamp) -> ConnectionSync {
        let orig = self.original_match();
        let reply = self.reply_match();

        let (src_new_packets, src_new_bytes) = orig.counters.drain();
        let (dest_new_packets, dest_new_bytes) = reply.counters.drain();

        let last = self.last_sync.swap(now.as_nanos(), Ordering::Relaxed);

        ConnectionSync {
            id: self.id,
            protocol: self.protocol(),
            original: self.original,
            translated: self.translated,
            src_tcp: orig.tcp.state(),
            dest_tcp: reply.tcp.state(),
            src_new_packets,
            src_new_bytes,
            dest_new_packets,
            dest_new_bytes,
            src_packets: orig.counters.packets_total(),
            src_bytes: orig.counters.bytes_total(),
            dest_packets: reply.counters.packets_total(),
            dest_bytes: reply.counters.bytes_total(),
            src_dev: orig.match_dev,
            dest_dev: reply.match_dev,
            mark: self.mark(),
            reason,
            delta: now.duration_since(Timestamp::from_nanos(last)),
        }
    }
}

/// A match record plus the connection that keeps it alive.
///
/// This is what index lookups hand out; holding it keeps the
/// connection valid even after removal.
#[derive(Debug, Clone)]
pub struct MatchRef {
    /// Owning connection
    pub conn: Arc<Connection>,
    /// Which of its records this is
    pub dir: Direction,
}

impl MatchRef {
    /// Reference `dir` of `conn`
    pub fn new(conn: Arc<Connection>, dir: Direction) -> Self {
        Self { conn, dir }
    }

    /// The referenced record
    #[inline(always)]
    pub fn cm(&self) -> &ConnectionMatch {
        self.conn.match_for(self.dir)
    }

    /// The other direction's record
    #[inline(always)]
    pub fn counterpart(&self) -> &ConnectionMatch {
        self.conn.counterpart(self.dir)
    }
}
