//! Packet Buffer
//!
//! A received IPv4 datagram plus the per-packet metadata the fast path reads
//! and writes (egress interface, priority, mark, checksum offload state).
//!
//! # Design
//!
//! - Data starts at the IPv4 header on ingress
//! - Headroom in front of the data for the L2 header pushed on egress
//! - A buffer may be shared with another owner; it is copied privately
//!   before the first write

use bytes::Bytes;
use fastpath_common::PacketError;

/// Default headroom reserved in front of packet data
pub const DEFAULT_HEADROOM: usize = 32;

/// Ethernet header length
pub const ETH_HLEN: usize = 14;

enum Storage {
    /// Exclusively owned, writable. `buf[head..]` is the packet.
    Owned { buf: Vec<u8>, head: usize },
    /// Shared with another owner, read-only
    Shared(Bytes),
}

/// Packet buffer handed to [`crate::Engine::recv`]
pub struct PacketBuffer {
    storage: Storage,
    /// Transport checksum holds only the pseudo-header sum (offload pending)
    pub checksum_partial: bool,
    /// Segmentation offload packet; exempt from the TCP MTU check
    pub gso: bool,
    /// Hardware flow cookie, 0 when absent
    pub flow_cookie: u32,
    /// Queueing priority
    pub priority: u32,
    /// Firewall mark
    pub mark: u32,
    /// Interface chosen for transmit
    pub egress: Option<u32>,
    /// Set once the fast path has forwarded the packet
    pub fast_forwarded: bool,
}

impl PacketBuffer {
    /// Create an exclusively owned buffer from an L3 datagram
    pub fn new(data: &[u8]) -> Self {
        Self::with_headroom(data, DEFAULT_HEADROOM)
    }

    /// Create an owned buffer with explicit headroom
    pub fn with_headroom(data: &[u8], headroom: usize) -> Self {
        let mut buf = Vec::with_capacity(headroom + data.len());
        buf.resize(headroom, 0);
        buf.extend_from_slice(data);
        Self::from_storage(Storage::Owned { buf, head: headroom })
    }

    /// Wrap data that another owner still references
    pub fn shared(data: Bytes) -> Self {
        Self::from_storage(Storage::Shared(data))
    }

    fn from_storage(storage: Storage) -> Self {
        Self {
            storage,
            checksum_partial: false,
            gso: false,
            flow_cookie: 0,
            priority: 0,
            mark: 0,
            egress: None,
            fast_forwarded: false,
        }
    }

    /// Packet data
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned { buf, head } => &buf[*head..],
            Storage::Shared(bytes) => &bytes[..],
        }
    }

    /// Data length
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether another owner still references the data
    #[inline(always)]
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    /// Bytes available in front of the data
    pub fn headroom(&self) -> usize {
        match &self.storage {
            Storage::Owned { head, .. } => *head,
            Storage::Shared(_) => 0,
        }
    }

    /// Take a private copy if shared. Allocation failure is reported, not aborted on.
    pub fn unshare(&mut self) -> Result<(), PacketError> {
        if let Storage::Shared(bytes) = &self.storage {
            let mut buf = Vec::new();
            buf.try_reserve_exact(DEFAULT_HEADROOM + bytes.len())
                .map_err(|_| PacketError::CopyFailed)?;
            buf.resize(DEFAULT_HEADROOM, 0);
            buf.extend_from_slice(bytes);
            self.storage = Storage::Owned { buf, head: DEFAULT_HEADROOM };
        }
        Ok(())
    }

    /// Writable packet data, copying a shared buffer first
    #[inline]
    pub fn data_mut(&mut self) -> Result<&mut [u8], PacketError> {
        self.unshare()?;
        match &mut self.storage {
            Storage::Owned { buf, head } => Ok(&mut buf[*head..]),
            Storage::Shared(_) => Err(PacketError::CopyFailed),
        }
    }

    /// Prepend `len` bytes, growing the buffer if headroom is short
    pub fn push(&mut self, len: usize) -> Result<&mut [u8], PacketError> {
        self.unshare()?;
        let Storage::Owned { buf, head } = &mut self.storage else {
            return Err(PacketError::CopyFailed);
        };

        if *head < len {
            let grow = len - *head;
            buf.try_reserve(grow).map_err(|_| PacketError::NoHeadroom(len))?;
            buf.splice(0..0, std::iter::repeat(0).take(grow));
            *head += grow;
        }

        *head -= len;
        let start = *head;
        Ok(&mut buf[start..start + len])
    }

    /// Remove `len` bytes from the front
    pub fn pull(&mut self, len: usize) -> Result<(), PacketError> {
        let available = self.len();
        if available < len {
            return Err(PacketError::Truncated { needed: len, available });
        }
        match &mut self.storage {
            Storage::Owned { head, .. } => *head += len,
            Storage::Shared(bytes) => {
                let _ = bytes.split_to(len);
            }
        }
        Ok(())
    }

    /// Copy the packet data out
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("shared", &self.is_shared())
            .field("egress", &self.egress)
            .field("priority", &self.priority)
            .field("mark", &self.mark)
            .finish()
    }
}
