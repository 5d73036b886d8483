//! Packet Forwarder
//!
//! The ingress hook. A packet is either fully handled here (rewritten and
//! handed to egress, or dropped) or returned to the caller untouched for
//! the generic stack. Every check that can punt runs before the first
//! byte is written.

use crate::buffer::PacketBuffer;
use crate::checksum::{apply_adjustment, ip_header_checksum, CsumAdjust};
use crate::connection::{ConnectionMatch, MatchFlags, MatchRef};
use crate::core::Engine;
use crate::interface::write_eth_header;
use crate::stats::{CoreStats, ExceptionReason};
use crate::sync::SyncReason;
use crate::tcp;
use crate::wire::{self, be16, ipv4, put_addr, put_be16, ICMP_HLEN, IPV4_HLEN, TCP_HLEN, UDP_HLEN};
use fastpath_common::{proto, Endpoint};

/// ECN bits survive a DSCP remark
const DSCP_MASK: u8 = 0x03;

/// TCP flags that decide fast path eligibility
const TCP_STATE_FLAGS: u8 = wire::tcp::SYN | wire::tcp::RST | wire::tcp::FIN | wire::tcp::ACK_FLAG;

/// What [`Engine::recv`] did with a packet
#[derive(Debug)]
pub enum RecvOutcome {
    /// Rewritten and handed to egress
    Forwarded,
    /// Consumed without transmit (private copy or framing failed)
    Dropped,
    /// Not handled; continue with the generic stack. The packet is unmodified.
    Punted(PacketBuffer),
}

impl RecvOutcome {
    /// The engine took ownership of the packet
    #[inline]
    pub fn is_consumed(&self) -> bool {
        !matches!(self, Self::Punted(_))
    }

    /// The untouched packet, if it was punted
    pub fn into_punted(self) -> Option<PacketBuffer> {
        match self {
            Self::Punted(packet) => Some(packet),
            _ => None,
        }
    }
}

/// IPv4 header facts the protocol paths need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Datagram {
    /// Buffer length; used for MTU checks and byte counters
    len: usize,
    ihl: usize,
    protocol: u8,
    /// First fragment or IP options: tear the flow down if found
    flush_on_find: bool,
}

/// Validate the IPv4 header
fn parse_ipv4(data: &[u8]) -> Result<Datagram, ExceptionReason> {
    let len = data.len();
    if len < IPV4_HLEN {
        return Err(ExceptionReason::HeaderIncomplete);
    }

    let tot_len = be16(data, ipv4::TOT_LEN) as usize;
    if tot_len < IPV4_HLEN {
        return Err(ExceptionReason::BadTotalLength);
    }

    if wire::ip_version(data) != 4 {
        return Err(ExceptionReason::NonV4);
    }

    if tot_len > len {
        return Err(ExceptionReason::DatagramIncomplete);
    }

    let frag_off = be16(data, ipv4::FRAG_OFF);
    if frag_off & ipv4::OFFSET_MASK != 0 {
        return Err(ExceptionReason::NonInitialFragment);
    }
    let mut flush_on_find = frag_off & ipv4::MF != 0;

    let ihl = wire::ip_header_len(data);
    if ihl < IPV4_HLEN {
        return Err(ExceptionReason::HeaderIncomplete);
    }
    if ihl != IPV4_HLEN {
        if len < ihl {
            return Err(ExceptionReason::IpOptionsIncomplete);
        }
        flush_on_find = true;
    }

    Ok(Datagram {
        len,
        ihl,
        protocol: data[ipv4::PROTOCOL],
        flush_on_find,
    })
}

#[inline]
fn punt(stats: &CoreStats, packet: PacketBuffer, reason: ExceptionReason) -> RecvOutcome {
    stats.record_exception(reason);
    tracing::trace!(%reason, "punted");
    RecvOutcome::Punted(packet)
}

/// Where the transport checksum lives and how to adjust it
#[derive(Debug, Clone, Copy)]
struct L4Checksum {
    offset: usize,
    /// Zero means "no checksum" (UDP)
    optional: bool,
    partial: bool,
}

impl L4Checksum {
    #[inline(always)]
    fn adjust(self, data: &mut [u8], adjust: &CsumAdjust) {
        let check = be16(data, self.offset);
        if self.optional && check == 0 {
            return;
        }
        put_be16(data, self.offset, apply_adjustment(check, adjust.for_packet(self.partial)));
    }
}

/// DSCP, TTL, NAT, then a fresh IP header checksum.
///
/// UDP and TCP keep their ports at the same offsets.
#[inline(always)]
fn rewrite(data: &mut [u8], ihl: usize, cm: &ConnectionMatch, flags: MatchFlags, csum: L4Checksum) {
    if flags.contains(MatchFlags::DSCP_REMARK) {
        data[ipv4::TOS] = (data[ipv4::TOS] & DSCP_MASK) | cm.dscp;
    }

    data[ipv4::TTL] -= 1;

    if flags.contains(MatchFlags::XLATE_SRC) {
        put_addr(data, ipv4::SADDR, cm.xlate_src.ip);
        put_be16(data, ihl + wire::udp::SPORT, cm.xlate_src.port);
        csum.adjust(data, &cm.xlate_src_csum);
    }

    if flags.contains(MatchFlags::XLATE_DEST) {
        put_addr(data, ipv4::DADDR, cm.xlate_dst.ip);
        put_be16(data, ihl + wire::udp::DPORT, cm.xlate_dst.port);
        csum.adjust(data, &cm.xlate_dst_csum);
    }

    let check = ip_header_checksum(data);
    put_be16(data, ipv4::CHECK, check);
}

/// Source and destination endpoints of a UDP or TCP datagram
#[inline(always)]
fn endpoints(data: &[u8], ihl: usize) -> (Endpoint, Endpoint) {
    (
        Endpoint::new(wire::addr(data, ipv4::SADDR), be16(data, ihl + wire::udp::SPORT)),
        Endpoint::new(wire::addr(data, ipv4::DADDR), be16(data, ihl + wire::udp::DPORT)),
    )
}

impl Engine {
    /// Ingress hook for one IPv4 packet received on `dev`.
    ///
    /// `packet` starts at the IP header.
    pub fn recv(&self, dev: u32, packet: PacketBuffer) -> RecvOutcome {
        let stats = self.stats.local();

        let dgram = match parse_ipv4(packet.data()) {
            Ok(dgram) => dgram,
            Err(reason) => return punt(stats, packet, reason),
        };

        match dgram.protocol {
            proto::UDP => self.recv_udp(stats, dev, packet, dgram),
            proto::TCP => self.recv_tcp(stats, dev, packet, dgram),
            proto::ICMP => self.recv_icmp(stats, dev, packet, dgram),
            _ => punt(stats, packet, ExceptionReason::UnhandledProtocol),
        }
    }

    /// Match lookup: the packet's flow cookie slot first, then the hash
    #[inline]
    fn lookup(
        &self,
        stats: &CoreStats,
        dev: u32,
        packet: &PacketBuffer,
        protocol: u8,
        src: Endpoint,
        dst: Endpoint,
    ) -> Option<MatchRef> {
        if packet.flow_cookie != 0 && self.table.cookies_enabled() {
            if let Some(m) = self.table.cookies().get(packet.flow_cookie) {
                if m.cm().matches(dev, protocol, src, dst) {
                    return Some(m);
                }
            }
        }

        let m = self.table.index().lookup(dev, protocol, src, dst)?;
        stats.record_hash_hit();
        Some(m)
    }

    /// Tear down the flow behind `m` and punt
    #[cold]
    fn flush_and_punt(
        &self,
        stats: &CoreStats,
        m: &MatchRef,
        packet: PacketBuffer,
        reason: ExceptionReason,
    ) -> RecvOutcome {
        self.remove_and_flush(&m.conn, SyncReason::Flush);
        punt(stats, packet, reason)
    }

    /// Private copy failed; the packet cannot be returned as-is either
    #[cold]
    fn drop_packet(&self, stats: &CoreStats, err: fastpath_common::PacketError) -> RecvOutcome {
        tracing::warn!(%err, "dropping packet");
        stats.record_dropped();
        RecvOutcome::Dropped
    }

    fn recv_udp(&self, stats: &CoreStats, dev: u32, mut packet: PacketBuffer, dgram: Datagram) -> RecvOutcome {
        let ihl = dgram.ihl;
        if dgram.len < ihl + UDP_HLEN {
            return punt(stats, packet, ExceptionReason::UdpHeaderIncomplete);
        }

        let (src, dst) = endpoints(packet.data(), ihl);
        let ttl = packet.data()[ipv4::TTL];

        let Some(m) = self.lookup(stats, dev, &packet, proto::UDP, src, dst) else {
            return punt(stats, packet, ExceptionReason::UdpNoConnection);
        };

        if dgram.flush_on_find {
            return self.flush_and_punt(stats, &m, packet, ExceptionReason::UdpIpOptionsOrInitialFragment);
        }

        let cm = m.cm();
        if !cm.accel {
            stats.record_not_forwarded();
            return RecvOutcome::Punted(packet);
        }

        if ttl < 2 {
            return self.flush_and_punt(stats, &m, packet, ExceptionReason::UdpSmallTtl);
        }

        if dgram.len > cm.mtu as usize {
            return self.flush_and_punt(stats, &m, packet, ExceptionReason::UdpNeedsFragmentation);
        }

        let csum = L4Checksum {
            offset: ihl + wire::udp::CHECK,
            optional: true,
            partial: packet.checksum_partial,
        };
        let data = match packet.data_mut() {
            Ok(data) => data,
            Err(err) => return self.drop_packet(stats, err),
        };
        rewrite(data, ihl, cm, cm.flags(), csum);

        self.transmit(stats, &m, packet, dgram.len)
    }

    fn recv_tcp(&self, stats: &CoreStats, dev: u32, mut packet: PacketBuffer, dgram: Datagram) -> RecvOutcome {
        let ihl = dgram.ihl;
        if dgram.len < ihl + TCP_HLEN {
            return punt(stats, packet, ExceptionReason::TcpHeaderIncomplete);
        }

        let (src, dst) = endpoints(packet.data(), ihl);
        let ttl = packet.data()[ipv4::TTL];
        let tcp_flags = packet.data()[ihl + wire::tcp::FLAGS] & TCP_STATE_FLAGS;

        let Some(m) = self.lookup(stats, dev, &packet, proto::TCP, src, dst) else {
            // Not yet established, or established but never offloaded
            let reason = if tcp_flags == wire::tcp::ACK_FLAG {
                ExceptionReason::TcpNoConnectionFastFlags
            } else {
                ExceptionReason::TcpNoConnectionSlowFlags
            };
            return punt(stats, packet, reason);
        };

        if dgram.flush_on_find {
            return self.flush_and_punt(stats, &m, packet, ExceptionReason::TcpIpOptionsOrInitialFragment);
        }

        let cm = m.cm();
        if !cm.accel {
            stats.record_not_forwarded();
            return RecvOutcome::Punted(packet);
        }

        if ttl < 2 {
            return self.flush_and_punt(stats, &m, packet, ExceptionReason::TcpSmallTtl);
        }

        if dgram.len > cm.mtu as usize && !packet.gso {
            return self.flush_and_punt(stats, &m, packet, ExceptionReason::TcpNeedsFragmentation);
        }

        if tcp_flags != wire::tcp::ACK_FLAG {
            return self.flush_and_punt(stats, &m, packet, ExceptionReason::TcpFlags);
        }

        let flags = cm.flags();
        if !flags.contains(MatchFlags::NO_SEQ_CHECK) {
            let verdict = tcp::validate(cm, m.counterpart(), &packet.data()[ihl..], dgram.len, ihl);
            if let Err(violation) = verdict {
                return self.flush_and_punt(stats, &m, packet, violation.reason());
            }
        }

        let csum = L4Checksum {
            offset: ihl + wire::tcp::CHECK,
            optional: false,
            partial: packet.checksum_partial,
        };
        let data = match packet.data_mut() {
            Ok(data) => data,
            Err(err) => return self.drop_packet(stats, err),
        };
        rewrite(data, ihl, cm, flags, csum);

        self.transmit(stats, &m, packet, dgram.len)
    }

    /// ICMP errors about an accelerated flow hand the flow back to the
    /// generic stack. The ICMP packet itself is always punted.
    fn recv_icmp(&self, stats: &CoreStats, dev: u32, packet: PacketBuffer, dgram: Datagram) -> RecvOutcome {
        let data = packet.data();
        let ihl = dgram.ihl;

        if dgram.len < ihl + ICMP_HLEN {
            return punt(stats, packet, ExceptionReason::IcmpHeaderIncomplete);
        }

        let icmp_type = data[ihl];
        if icmp_type != wire::icmp::DEST_UNREACH && icmp_type != wire::icmp::TIME_EXCEEDED {
            return punt(stats, packet, ExceptionReason::IcmpUnhandledType);
        }

        // Quoted datagram that triggered the error
        let inner = ihl + ICMP_HLEN;
        if dgram.len < inner + IPV4_HLEN {
            return punt(stats, packet, ExceptionReason::IcmpIpv4HeaderIncomplete);
        }

        let quoted = &data[inner..];
        if wire::ip_version(quoted) != 4 {
            return punt(stats, packet, ExceptionReason::IcmpIpv4NonV4);
        }

        let inner_ihl = wire::ip_header_len(quoted);
        if inner_ihl < IPV4_HLEN {
            return punt(stats, packet, ExceptionReason::IcmpIpv4HeaderIncomplete);
        }
        if quoted.len() < inner_ihl {
            return punt(stats, packet, ExceptionReason::IcmpIpv4IpOptionsIncomplete);
        }

        // Eight bytes of transport header carry both ports
        let protocol = quoted[ipv4::PROTOCOL];
        let short = quoted.len() < inner_ihl + 8;
        match protocol {
            proto::UDP if short => return punt(stats, packet, ExceptionReason::IcmpIpv4UdpHeaderIncomplete),
            proto::TCP if short => return punt(stats, packet, ExceptionReason::IcmpIpv4TcpHeaderIncomplete),
            proto::UDP | proto::TCP => {}
            _ => return punt(stats, packet, ExceptionReason::IcmpIpv4UnhandledProtocol),
        }

        // The quoted packet travelled the other way, out of this interface
        let (src, dst) = endpoints(quoted, inner_ihl);
        let Some(m) = self.table.index().lookup(dev, protocol, dst, src) else {
            return punt(stats, packet, ExceptionReason::IcmpNoConnection);
        };
        stats.record_hash_hit();

        self.flush_and_punt(stats, &m, packet, ExceptionReason::IcmpFlushedConnection)
    }

    /// Frame, tag and hand a rewritten packet to egress
    #[inline]
    fn transmit(&self, stats: &CoreStats, m: &MatchRef, mut packet: PacketBuffer, len: usize) -> RecvOutcome {
        let cm = m.cm();
        let flags = cm.flags();

        packet.egress = Some(cm.xmit_dev);

        if flags.contains(MatchFlags::WRITE_L2_HDR) {
            let framed = if flags.contains(MatchFlags::WRITE_FAST_ETH_HDR) {
                write_eth_header(&mut packet, cm.xmit_dst_mac, cm.xmit_src_mac)
            } else {
                self.egress
                    .build_header(cm.xmit_dev, &mut packet, cm.xmit_dst_mac, cm.xmit_src_mac)
            };
            if let Err(err) = framed {
                return self.drop_packet(stats, err);
            }
        }

        cm.counters.record(len as u32);

        if flags.contains(MatchFlags::PRIORITY_REMARK) {
            packet.priority = cm.priority;
        }
        packet.mark = m.conn.mark();
        packet.fast_forwarded = true;

        stats.record_forwarded();
        self.egress.transmit(packet);
        RecvOutcome::Forwarded
    }
}
