//! TCP window tracking
//!
//! Each direction tracks the highest segment end it has sent, the largest
//! window it has advertised and the highest sequence the peer allows it to
//! send. A segment outside those edges means the fast path has lost sync
//! with the real connection, and the flow goes back to the slow path.

use crate::connection::{seq_before, ConnectionMatch};
use crate::stats::ExceptionReason;
use crate::wire::{self, be16, be32, TCP_HLEN};
use std::sync::atomic::{AtomicU32, Ordering};

/// Largest window scale shift TCP allows
pub const MAX_WINDOW_SCALE: u8 = 14;

/// Extra slack allowed behind the ack left edge
pub const MAX_ACK_WINDOW: u32 = 65520;

const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_SACK: u8 = 5;
const TCPOPT_TIMESTAMP: u8 = 8;
const TCPOLEN_TIMESTAMP: u8 = 10;
const TCPOLEN_SACK_PERBLOCK: usize = 8;

/// A segment failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpViolation {
    /// Sequence past `max_end + 1`
    SeqExceedsRightEdge,
    /// Data offset below 20 bytes
    SmallDataOffset,
    /// Data offset past the datagram
    BigDataOffset,
    /// Malformed option block
    BadSack,
    /// Segment end behind the left edge
    SeqBeforeLeftEdge,
    /// Ack past what the peer sent
    AckExceedsRightEdge,
    /// Ack too far behind the peer
    AckBeforeLeftEdge,
}

impl TcpViolation {
    /// Exception reason counted for this violation
    pub const fn reason(self) -> ExceptionReason {
        match self {
            Self::SeqExceedsRightEdge => ExceptionReason::TcpSeqExceedsRightEdge,
            Self::SmallDataOffset => ExceptionReason::TcpSmallDataOffset,
            Self::BigDataOffset => ExceptionReason::TcpBigDataOffset,
            Self::BadSack => ExceptionReason::TcpBadSack,
            Self::SeqBeforeLeftEdge => ExceptionReason::TcpSeqBeforeLeftEdge,
            Self::AckExceedsRightEdge => ExceptionReason::TcpAckExceedsRightEdge,
            Self::AckBeforeLeftEdge => ExceptionReason::TcpAckBeforeLeftEdge,
        }
    }
}

/// `(a - b) as i32 > 0`
#[inline(always)]
fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Raise `cell` to `to` unless it is already at or past it in sequence space
#[inline(always)]
fn advance(cell: &AtomicU32, to: u32) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
        (!seq_before(to, cur)).then_some(to)
    });
}

/// Highest SACK right edge if it beats `ack`, else `ack`.
///
/// `segment` starts at the TCP header and holds at least `data_offs` bytes.
/// Returns `None` on any malformed option; the whole segment is then rejected.
pub fn sack_corrected_ack(segment: &[u8], data_offs: usize, ack: u32) -> Option<u32> {
    let opts = segment.get(TCP_HLEN..data_offs)?;

    // Timestamps alone, the common case
    if data_offs == TCP_HLEN + TCPOLEN_TIMESTAMP as usize + 2
        && opts[0] == TCPOPT_NOP
        && opts[1] == TCPOPT_NOP
        && opts[2] == TCPOPT_TIMESTAMP
        && opts[3] == TCPOLEN_TIMESTAMP
    {
        return Some(ack);
    }

    let mut ack = ack;
    let mut at = 0;
    while at < opts.len() {
        match opts[at] {
            TCPOPT_NOP => at += 1,
            TCPOPT_EOL => return Some(ack),
            TCPOPT_SACK => {
                let size = *opts.get(at + 1)? as usize;
                if size < 2 + TCPOLEN_SACK_PERBLOCK
                    || (size - 2) % TCPOLEN_SACK_PERBLOCK != 0
                    || size > opts.len() - at
                {
                    return None;
                }

                let sack = (at + 6..at + size)
                    .step_by(TCPOLEN_SACK_PERBLOCK)
                    .map(|re| be32(opts, re))
                    .max()
                    .unwrap_or(0);
                if sack > ack {
                    ack = sack;
                }
                at += size;
            }
            _ => {
                let size = *opts.get(at + 1)? as usize;
                if size < 2 {
                    return None;
                }
                at += size;
            }
        }
    }

    Some(ack)
}

/// Check a segment against both directions' state and advance the edges.
///
/// `segment` is the datagram from the TCP header on; `ip_len` and `ihl`
/// describe the enclosing datagram. State is only written once every check
/// has passed.
pub fn validate(
    cm: &ConnectionMatch,
    counter: &ConnectionMatch,
    segment: &[u8],
    ip_len: usize,
    ihl: usize,
) -> Result<(), TcpViolation> {
    let seq = be32(segment, wire::tcp::SEQ);
    if seq_after(seq, cm.tcp.max_end().wrapping_add(1)) {
        return Err(TcpViolation::SeqExceedsRightEdge);
    }

    let data_offs = wire::tcp_data_offset(segment);
    if data_offs < TCP_HLEN {
        return Err(TcpViolation::SmallDataOffset);
    }

    // Checked before option parsing so every option byte read is in bounds
    if ip_len < data_offs + ihl || segment.len() < data_offs {
        return Err(TcpViolation::BigDataOffset);
    }

    let ack = be32(segment, wire::tcp::ACK);
    let sack = sack_corrected_ack(segment, data_offs, ack).ok_or(TcpViolation::BadSack)?;

    let end = seq.wrapping_add((ip_len - ihl - data_offs) as u32);

    let left_edge = cm.tcp.end().wrapping_sub(counter.tcp.max_win()).wrapping_sub(1);
    if seq_before(end, left_edge) {
        return Err(TcpViolation::SeqBeforeLeftEdge);
    }

    if seq_after(sack, counter.tcp.end().wrapping_add(1)) {
        return Err(TcpViolation::AckExceedsRightEdge);
    }

    let left_edge = counter
        .tcp
        .end()
        .wrapping_sub(cm.tcp.max_win())
        .wrapping_sub(MAX_ACK_WINDOW)
        .wrapping_sub(1);
    if seq_before(sack, left_edge) {
        return Err(TcpViolation::AckBeforeLeftEdge);
    }

    let window = be16(segment, wire::tcp::WINDOW) as u32;
    let scaled_win = (window << cm.tcp.win_scale.min(MAX_WINDOW_SCALE)).wrapping_add(sack.wrapping_sub(ack));
    cm.tcp.max_win.fetch_max(scaled_win, Ordering::Relaxed);

    advance(&cm.tcp.end, end);
    advance(&counter.tcp.max_end, sack.wrapping_add(scaled_win));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::connection;
    use crate::connection::TcpWindow;

    fn segment(seq: u32, ack: u32, window: u16, options: &[u8], payload: usize) -> Vec<u8> {
        let doff = TCP_HLEN + options.len();
        let mut seg = vec![0u8; doff + payload];
        seg[4..8].copy_from_slice(&seq.to_be_bytes());
        seg[8..12].copy_from_slice(&ack.to_be_bytes());
        seg[12] = ((doff / 4) as u8) << 4;
        seg[13] = wire::tcp::ACK_FLAG;
        seg[14..16].copy_from_slice(&window.to_be_bytes());
        seg[TCP_HLEN..doff].copy_from_slice(options);
        seg
    }

    fn set(w: &TcpWindow, max_win: u32, end: u32, max_end: u32) {
        w.max_win.store(max_win, Ordering::Relaxed);
        w.end.store(end, Ordering::Relaxed);
        w.max_end.store(max_end, Ordering::Relaxed);
    }

    /// Original direction has sent up to 1000, reply up to 5000; both windows 8192
    fn established() -> crate::connection::Connection {
        let c = connection();
        set(&c.original_match().tcp, 8192, 1000, 1000 + 8192);
        set(&c.reply_match().tcp, 8192, 5000, 5000 + 8192);
        c
    }

    fn check(c: &crate::connection::Connection, seg: &[u8]) -> Result<(), TcpViolation> {
        validate(c.original_match(), c.reply_match(), seg, 20 + seg.len(), 20)
    }

    #[test]
    fn test_in_window_segment_advances_state() {
        let c = established();
        let seg = segment(1000, 5000, 4096, &[], 100);

        check(&c, &seg).unwrap();

        let o = c.original_match();
        assert_eq!(o.tcp.end(), 1100);
        assert_eq!(o.tcp.max_win(), 8192);
        assert_eq!(c.reply_match().tcp.max_end(), 5000 + 8192);
    }

    #[test]
    fn test_monotonic_over_sequence_of_segments() {
        let c = established();
        let mut seq = 1000u32;
        let (mut end, mut max_win, mut max_end) = (0, 0, 0);

        for i in 0..20u32 {
            let seg = segment(seq, 4800 + i * 10, 16384, &[], 200);
            check(&c, &seg).unwrap();
            seq += 200;

            let o = c.original_match();
            assert!(o.tcp.end() >= end);
            assert!(o.tcp.max_win() >= max_win);
            assert!(c.reply_match().tcp.max_end() >= max_end);
            end = o.tcp.end();
            max_win = o.tcp.max_win();
            max_end = c.reply_match().tcp.max_end();
        }
        assert_eq!(end, 1000 + 20 * 200);
    }

    #[test]
    fn test_seq_beyond_right_edge() {
        let c = established();
        let seg = segment(1000 + 8192 + 2, 5000, 4096, &[], 0);
        assert_eq!(check(&c, &seg), Err(TcpViolation::SeqExceedsRightEdge));

        // Exactly max_end + 1 is still allowed
        let seg = segment(1000 + 8192 + 1, 5000, 4096, &[], 0);
        assert!(check(&c, &seg).is_ok());
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let c = established();
        let seg = segment(1000, 5000 + 100, 4096, &[], 50);
        assert_eq!(check(&c, &seg), Err(TcpViolation::AckExceedsRightEdge));
        assert_eq!(c.original_match().tcp.end(), 1000);
        assert_eq!(c.reply_match().tcp.max_end(), 5000 + 8192);
    }

    #[test]
    fn test_seq_before_left_edge() {
        let c = established();
        // end must not fall behind 1000 - 8192 - 1
        let seg = segment(1000u32.wrapping_sub(9000), 5000, 4096, &[], 0);
        assert_eq!(check(&c, &seg), Err(TcpViolation::SeqBeforeLeftEdge));
    }

    #[test]
    fn test_ack_before_left_edge() {
        let c = established();
        let seg = segment(1000, 5000u32.wrapping_sub(8192 + MAX_ACK_WINDOW + 10), 4096, &[], 0);
        assert_eq!(check(&c, &seg), Err(TcpViolation::AckBeforeLeftEdge));
    }

    #[test]
    fn test_data_offset_bounds() {
        let c = established();
        let mut seg = segment(1000, 5000, 4096, &[], 0);
        seg[12] = 4 << 4;
        assert_eq!(check(&c, &seg), Err(TcpViolation::SmallDataOffset));

        seg[12] = 15 << 4;
        assert_eq!(check(&c, &seg), Err(TcpViolation::BigDataOffset));
    }

    #[test]
    fn test_timestamp_only_fast_accept() {
        let opts = [1, 1, 8, 10, 0, 0, 0, 1, 0, 0, 0, 2];
        let seg = segment(1, 77, 0, &opts, 0);
        assert_eq!(sack_corrected_ack(&seg, 32, 77), Some(77));
    }

    #[test]
    fn test_sack_moves_ack_forward() {
        // NOP NOP SACK(2 blocks)
        let mut opts = vec![1, 1, 5, 18];
        for (l, r) in [(100u32, 200u32), (300, 450)] {
            opts.extend_from_slice(&l.to_be_bytes());
            opts.extend_from_slice(&r.to_be_bytes());
        }
        let seg = segment(1, 50, 0, &opts, 0);
        assert_eq!(sack_corrected_ack(&seg, seg.len(), 50), Some(450));
        assert_eq!(sack_corrected_ack(&seg, seg.len(), 500), Some(500));
    }

    #[test]
    fn test_malformed_sack_rejected() {
        // SACK length not a whole number of blocks
        let opts = [5, 12, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0];
        let seg = segment(1, 50, 0, &opts, 0);
        assert_eq!(sack_corrected_ack(&seg, seg.len(), 50), None);

        // Unknown option with length below 2
        let opts = [3, 1, 0, 0];
        let seg = segment(1, 50, 0, &opts, 0);
        assert_eq!(sack_corrected_ack(&seg, seg.len(), 50), None);

        // SACK running past the options area
        let opts = [1, 1, 5, 18];
        let seg = segment(1, 50, 0, &opts, 0);
        assert_eq!(sack_corrected_ack(&seg, seg.len(), 50), None);
    }

    #[test]
    fn test_bad_sack_in_segment_is_violation() {
        let c = established();
        let opts = [5, 12, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0];
        let seg = segment(1000, 5000, 4096, &opts, 0);
        assert_eq!(check(&c, &seg), Err(TcpViolation::BadSack));
    }

    #[test]
    fn test_eol_ends_options() {
        let opts = [0, 0xff, 0xff, 0xff];
        let seg = segment(1, 50, 0, &opts, 0);
        assert_eq!(sack_corrected_ack(&seg, seg.len(), 50), Some(50));
    }

    #[test]
    fn test_violation_reasons() {
        assert_eq!(TcpViolation::BadSack.reason(), ExceptionReason::TcpBadSack);
        assert_eq!(
            TcpViolation::SeqExceedsRightEdge.reason(),
            ExceptionReason::TcpSeqExceedsRightEdge
        );
    }
}
