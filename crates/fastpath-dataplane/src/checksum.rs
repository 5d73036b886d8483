//! Ones'-complement checksum math
//!
//! Transport checksums are never recomputed on the fast path. Each
//! translating direction precomputes an adjustment when the rule is
//! created; forwarding just adds it to the checksum in the packet.
//! The IPv4 header checksum is cheap (10 halfwords) and always recomputed.

use fastpath_common::Endpoint;
use std::net::Ipv4Addr;

/// Fold a 32-bit ones'-complement sum to 16 bits.
///
/// Two folds are always enough for the sums built here.
#[inline(always)]
pub fn checksum_fold(sum: u32) -> u16 {
    let sum = (sum & 0xffff) + (sum >> 16);
    let sum = (sum & 0xffff) + (sum >> 16);
    sum as u16
}

/// Add a precomputed adjustment to a checksum in the packet
#[inline(always)]
pub fn apply_adjustment(check: u16, adjustment: u16) -> u16 {
    let sum = check as u32 + adjustment as u32;
    ((sum & 0xffff) + (sum >> 16)) as u16
}

/// Incremental update constants for one endpoint rewrite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsumAdjust {
    /// For complete checksums: address and port both covered
    pub full: u16,
    /// For offload-pending checksums holding only the pseudo-header sum
    pub partial: u16,
}

impl CsumAdjust {
    /// Constants for rewriting `old` into `new`
    pub fn new(old: Endpoint, new: Endpoint) -> Self {
        Self {
            full: incremental_checksum_update(old, new),
            partial: partial_checksum_update(old.ip, new.ip),
        }
    }

    /// Pick the constant matching the packet's checksum state
    #[inline(always)]
    pub fn for_packet(&self, checksum_partial: bool) -> u16 {
        if checksum_partial {
            self.partial
        } else {
            self.full
        }
    }
}

/// `old halfwords + !new halfwords`, folded.
///
/// Adding the result to a complemented checksum removes the old address
/// and port from the covered sum and adds the new ones.
pub fn incremental_checksum_update(old: Endpoint, new: Endpoint) -> u16 {
    let old_ip = u32::from(old.ip);
    let new_ip = u32::from(new.ip);

    let sum = (old_ip >> 16)
        + (old_ip & 0xffff)
        + old.port as u32
        + (!(new_ip >> 16) & 0xffff)
        + (!new_ip & 0xffff)
        + (!new.port) as u32;

    checksum_fold(sum)
}

/// Adjustment for a checksum field holding the uncomplemented pseudo-header sum.
///
/// Ports are not part of the pseudo header so only the address moves.
pub fn partial_checksum_update(old: Ipv4Addr, new: Ipv4Addr) -> u16 {
    let new = u32::from(new);
    let mut sum = (!u32::from(old)).wrapping_add(new);
    if sum < new {
        sum = sum.wrapping_add(1);
    }
    checksum_fold(sum)
}

/// Sum big-endian halfwords; an odd trailing byte is padded with zero
#[inline]
pub fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial as u64;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    while sum > 0xffff_ffff {
        sum = (sum & 0xffff_ffff) + (sum >> 32);
    }
    sum as u32
}

/// IPv4 header checksum over the first 20 bytes, ignoring the stored checksum
#[inline]
pub fn ip_header_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for (i, pair) in header[..20].chunks_exact(2).enumerate() {
        if i != 5 {
            sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
        }
    }
    !checksum_fold(sum)
}

/// Full TCP/UDP checksum over pseudo header plus segment.
///
/// The checksum field inside `segment` must already be zero. Used when
/// synthesizing packets; the forwarder itself only adjusts.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let pseudo = pseudo_header_sum(src, dst, protocol, segment.len());
    !checksum_fold(ones_complement_sum(segment, pseudo))
}

/// Uncomplemented pseudo-header sum, as left in the packet by checksum offload
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(len as u16).to_be_bytes());
    ones_complement_sum(&pseudo, 0)
}
