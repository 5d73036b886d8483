//! Flow identity types
//!
//! A [`FlowTuple`] names one direction of a flow. Both the connection table
//! and the match index are keyed by tuples; the hash seed computed here is
//! folded into a bucket index by the data plane.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// IP protocol numbers handled by the fast path
pub mod proto {
    /// ICMP
    pub const ICMP: u8 = 1;
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
}

/// One side of a flow: address plus port (or ICMP ident)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// IPv4 address
    pub ip: Ipv4Addr,
    /// Port, host byte order
    pub port: u16,
}

impl Endpoint {
    /// Create new endpoint
    #[inline(always)]
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// 5-tuple identifying one flow direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowTuple {
    /// IP protocol
    pub protocol: u8,
    /// Source endpoint
    pub src: Endpoint,
    /// Destination endpoint
    pub dst: Endpoint,
}

impl FlowTuple {
    /// Create from raw parts
    #[inline(always)]
    pub const fn new(
        protocol: u8,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            src: Endpoint::new(src_ip, src_port),
            dst: Endpoint::new(dst_ip, dst_port),
        }
    }

    /// Tuple seen by the opposite direction
    #[inline(always)]
    pub const fn reverse(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }

    /// Unmixed hash seed: XOR of addresses, protocol and ports.
    ///
    /// Symmetric in source and destination.
    #[inline(always)]
    pub fn hash_seed(&self) -> u32 {
        (u32::from(self.src.ip) ^ u32::from(self.dst.ip))
            ^ self.protocol as u32
            ^ (self.src.port ^ self.dst.port) as u32
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p:{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// All-zero address
    pub const ZERO: Self = Self([0; 6]);

    /// Raw octets
    #[inline(always)]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}
