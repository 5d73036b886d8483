//! Network interfaces and the egress seam
//!
//! The engine never talks to devices directly. Interface properties come
//! from an [`InterfaceTable`]; forwarded packets leave through an [`Egress`].

use crate::buffer::{PacketBuffer, ETH_HLEN};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use fastpath_common::{MacAddr, PacketError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ethertype for IPv4
pub const ETH_P_IP: u16 = 0x0800;

/// How a device frames outgoing packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Plain Ethernet II framing; the engine writes the header itself
    Ethernet,
    /// Anything else; framing is delegated to [`Egress::build_header`]
    Other,
}

/// Interface properties needed by the fast path
#[derive(Debug, Clone)]
pub struct Interface {
    /// Interface index
    pub index: u32,
    /// Name, for logs
    pub name: String,
    /// Hardware address, used as source MAC when transmitting
    pub mac: MacAddr,
    /// Device does not resolve neighbours (tunnels, point-to-point); no L2 header
    pub no_arp: bool,
    /// Framing
    pub link: LinkKind,
    /// Device is fully registered and usable
    pub registered: bool,
}

impl Interface {
    /// Registered Ethernet interface
    pub fn ethernet(index: u32, name: impl Into<String>, mac: MacAddr) -> Self {
        Self {
            index,
            name: name.into(),
            mac,
            no_arp: false,
            link: LinkKind::Ethernet,
            registered: true,
        }
    }

    /// Registered interface without L2 addressing
    pub fn point_to_point(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            mac: MacAddr::ZERO,
            no_arp: true,
            link: LinkKind::Other,
            registered: true,
        }
    }
}

/// Resolves interface indices
pub trait InterfaceTable: Send + Sync {
    /// Look up an interface by index
    fn interface(&self, index: u32) -> Option<Arc<Interface>>;
}

/// Concurrent interface registry
#[derive(Default)]
pub struct InterfaceMap {
    interfaces: DashMap<u32, Arc<Interface>>,
}

impl InterfaceMap {
    /// Create empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an interface
    pub fn insert(&self, iface: Interface) {
        self.interfaces.insert(iface.index, Arc::new(iface));
    }

    /// Remove an interface
    pub fn remove(&self, index: u32) -> Option<Arc<Interface>> {
        self.interfaces.remove(&index).map(|(_, iface)| iface)
    }

    /// Number of interfaces
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

impl InterfaceTable for InterfaceMap {
    fn interface(&self, index: u32) -> Option<Arc<Interface>> {
        self.interfaces.get(&index).map(|e| e.value().clone())
    }
}

/// Transmit path for forwarded packets
pub trait Egress: Send + Sync {
    /// Hand a fully rewritten, framed packet to the device
    fn transmit(&self, packet: PacketBuffer);

    /// Frame a packet for a non-Ethernet device.
    ///
    /// The default writes an Ethernet II header, which is what most
    /// "other" link types with ARP end up using anyway.
    fn build_header(
        &self,
        _dev: u32,
        packet: &mut PacketBuffer,
        dest: MacAddr,
        src: MacAddr,
    ) -> Result<(), PacketError> {
        write_eth_header(packet, dest, src)
    }
}

/// Push a literal Ethernet II header carrying IPv4
#[inline]
pub fn write_eth_header(packet: &mut PacketBuffer, dest: MacAddr, src: MacAddr) -> Result<(), PacketError> {
    let hdr = packet.push(ETH_HLEN)?;
    hdr[0..6].copy_from_slice(&dest.octets());
    hdr[6..12].copy_from_slice(&src.octets());
    hdr[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());
    Ok(())
}

/// Egress that queues packets on a bounded channel for a TX worker
pub struct ChannelEgress {
    tx: Sender<PacketBuffer>,
    overflows: AtomicU64,
}

impl ChannelEgress {
    /// Create egress plus the receiving end of its queue
    pub fn new(capacity: usize) -> (Self, Receiver<PacketBuffer>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                overflows: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Packets dropped because the queue was full or closed
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl Egress for ChannelEgress {
    fn transmit(&self, packet: PacketBuffer) {
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
