//! Fast Path IPv4 Flow Accelerator
//!
//! Forwards packets of connections that an external connection manager has
//! already classified, bypassing generic routing and NAT lookup.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            ENGINE                                │
//! │                                                                  │
//! │   connection manager                       receive contexts     │
//! │  create/update/destroy ──┐             ┌── recv(dev, packet)    │
//! │                          ▼             ▼                         │
//! │  ┌────────────────────────────┐   ┌──────────────────────────┐  │
//! │  │ Connection Table (mutex)   │   │ Match Index (lock-free)  │  │
//! │  │  tuple hash + id list      │──►│  (dev, proto, src, dst)  │  │
//! │  └─────────────┬──────────────┘   └────────────┬─────────────┘  │
//! │                │                               ▼                 │
//! │                │                  ┌──────────────────────────┐  │
//! │                │                  │ UDP / TCP / ICMP paths   │  │
//! │                │                  │ TCP window validator     │  │
//! │                │                  │ NAT + checksum adjust    │  │
//! │                │                  └────────────┬─────────────┘  │
//! │                ▼                               ▼                 │
//! │  ┌────────────────────────────┐   ┌──────────────────────────┐  │
//! │  │ Stats sync (tokio task)    │   │ Egress (L2 header, tx)   │  │
//! │  └────────────────────────────┘   └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Anything the fast path cannot handle is returned untouched as
//! [`RecvOutcome::Punted`], with the reason counted in [`StatsSnapshot`].

#![warn(missing_docs)]

pub mod buffer;
pub mod checksum;
pub mod connection;
pub mod cookie;
pub mod core;
pub mod forward;
pub mod interface;
pub mod rule;
pub mod stats;
pub mod sync;
pub mod table;
pub mod tcp;
pub mod wire;

pub use buffer::PacketBuffer;
pub use connection::{Connection, ConnectionMatch, Direction, MatchFlags};
pub use cookie::FlowCookieSetter;
pub use core::{Engine, EngineConfig, EngineError};
pub use forward::RecvOutcome;
pub use interface::{ChannelEgress, Egress, Interface, InterfaceMap, InterfaceTable, LinkKind};
pub use rule::{ConnectionRule, DirectionRule, DscpRule, QosRule, RuleCreate, TcpRule, TcpSeed};
pub use stats::{ExceptionReason, StatsSnapshot};
pub use sync::{ConnectionSync, SyncCallback, SyncReason, TcpState};
pub use table::{HASH_SHIFT, HASH_SIZE};
