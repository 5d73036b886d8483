//! Header layouts and big-endian field access
//!
//! Offsets are relative to the start of the respective header. Callers
//! check lengths before reading; these helpers index directly.

use std::net::Ipv4Addr;

/// IPv4 header without options
pub const IPV4_HLEN: usize = 20;
/// UDP header
pub const UDP_HLEN: usize = 8;
/// TCP header without options
pub const TCP_HLEN: usize = 20;
/// ICMP header (type, code, checksum, rest-of-header)
pub const ICMP_HLEN: usize = 8;

/// IPv4 header fields
pub mod ipv4 {
    /// Version and IHL
    pub const VER_IHL: usize = 0;
    /// Type of service / DSCP+ECN
    pub const TOS: usize = 1;
    /// Total length
    pub const TOT_LEN: usize = 2;
    /// Flags and fragment offset
    pub const FRAG_OFF: usize = 6;
    /// Time to live
    pub const TTL: usize = 8;
    /// Protocol
    pub const PROTOCOL: usize = 9;
    /// Header checksum
    pub const CHECK: usize = 10;
    /// Source address
    pub const SADDR: usize = 12;
    /// Destination address
    pub const DADDR: usize = 16;

    /// More-fragments flag
    pub const MF: u16 = 0x2000;
    /// Fragment offset mask
    pub const OFFSET_MASK: u16 = 0x1fff;
}

/// UDP header fields
pub mod udp {
    /// Source port
    pub const SPORT: usize = 0;
    /// Destination port
    pub const DPORT: usize = 2;
    /// Checksum
    pub const CHECK: usize = 6;
}

/// TCP header fields
pub mod tcp {
    /// Source port
    pub const SPORT: usize = 0;
    /// Destination port
    pub const DPORT: usize = 2;
    /// Sequence number
    pub const SEQ: usize = 4;
    /// Acknowledgement number
    pub const ACK: usize = 8;
    /// Data offset (high nibble)
    pub const DOFF: usize = 12;
    /// Flags
    pub const FLAGS: usize = 13;
    /// Window
    pub const WINDOW: usize = 14;
    /// Checksum
    pub const CHECK: usize = 16;

    /// FIN flag
    pub const FIN: u8 = 0x01;
    /// SYN flag
    pub const SYN: u8 = 0x02;
    /// RST flag
    pub const RST: u8 = 0x04;
    /// ACK flag
    pub const ACK_FLAG: u8 = 0x10;
}

/// ICMP types inspected by the fast path
pub mod icmp {
    /// Destination unreachable
    pub const DEST_UNREACH: u8 = 3;
    /// Time exceeded
    pub const TIME_EXCEEDED: u8 = 11;
}

/// Read a big-endian u16
#[inline(always)]
pub fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

/// Read a big-endian u32
#[inline(always)]
pub fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// Write a big-endian u16
#[inline(always)]
pub fn put_be16(data: &mut [u8], off: usize, value: u16) {
    data[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

/// Read an IPv4 address
#[inline(always)]
pub fn addr(data: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::from(be32(data, off))
}

/// Write an IPv4 address
#[inline(always)]
pub fn put_addr(data: &mut [u8], off: usize, value: Ipv4Addr) {
    data[off..off + 4].copy_from_slice(&value.octets());
}

/// IPv4 version nibble
#[inline(always)]
pub fn ip_version(data: &[u8]) -> u8 {
    data[ipv4::VER_IHL] >> 4
}

/// IPv4 header length in bytes
#[inline(always)]
pub fn ip_header_len(data: &[u8]) -> usize {
    ((data[ipv4::VER_IHL] & 0x0f) as usize) << 2
}

/// TCP data offset in bytes
#[inline(always)]
pub fn tcp_data_offset(segment: &[u8]) -> usize {
    ((segment[tcp::DOFF] >> 4) as usize) << 2
}
