//! Rule Management API
//!
//! Entry points for the connection manager. Each call runs under the
//! engine lock and either registers a connection completely or not at all.

use crate::connection::{Connection, ConnectionMatch, Direction, MatchFlags, MatchParams};
use crate::core::Engine;
use crate::interface::{Interface, LinkKind};
use crate::sync::SyncReason;
use fastpath_common::{Endpoint, FlowTuple, MacAddr, RuleError, RuleResult, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// DSCP values are stored shifted into TOS position
const DSCP_SHIFT: u8 = 2;

/// Six DSCP bits; anything above is ignored
const DSCP_BITS: u8 = 0x3f;

/// Interfaces and L2 addressing of both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRule {
    /// Interface the flow (original direction) arrives on
    pub flow_interface: u32,
    /// Interface the return direction arrives on
    pub return_interface: u32,
    /// MTU towards the flow side
    pub flow_mtu: u16,
    /// MTU towards the return side
    pub return_mtu: u16,
    /// Next hop MAC towards the flow side
    pub flow_mac: MacAddr,
    /// Next hop MAC towards the return side
    pub return_mac: MacAddr,
}

/// Priority remark per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosRule {
    /// Priority for packets of the flow direction
    pub flow_priority: u32,
    /// Priority for packets of the return direction
    pub return_priority: u32,
}

/// DSCP remark per direction (unshifted, 0..=63)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DscpRule {
    /// DSCP written on the flow direction
    pub flow_dscp: u8,
    /// DSCP written on the return direction
    pub return_dscp: u8,
}

/// TCP tracking state of one direction as seen by the connection manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSeed {
    /// Window scale shift this direction announced
    pub window_scale: u8,
    /// Largest window seen
    pub max_window: u32,
    /// Highest segment end sent
    pub end: u32,
    /// Highest sequence the peer allows
    pub max_end: u32,
}

/// TCP state of both directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRule {
    /// Flow (original) direction
    pub flow: TcpSeed,
    /// Return (reply) direction
    #[serde(rename = "return")]
    pub return_: TcpSeed,
}

/// Per-direction acceleration eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionRule {
    /// Flow direction may be forwarded
    pub flow_accel: bool,
    /// Return direction may be forwarded
    pub return_accel: bool,
}

impl Default for DirectionRule {
    fn default() -> Self {
        Self {
            flow_accel: true,
            return_accel: true,
        }
    }
}

/// Connection descriptor for [`Engine::create_rule`] and [`Engine::update_rule`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCreate {
    /// Pre-translation tuple, flow endpoint to return endpoint
    pub tuple: FlowTuple,
    /// Flow endpoint after translation (SNAT)
    pub flow_xlate: Endpoint,
    /// Return endpoint after translation (DNAT)
    pub return_xlate: Endpoint,
    /// Interfaces, MTUs and next hops
    pub conn: ConnectionRule,
    /// Priority remark
    #[serde(default)]
    pub qos: Option<QosRule>,
    /// DSCP remark
    #[serde(default)]
    pub dscp: Option<DscpRule>,
    /// TCP window seeds; absent for other protocols
    #[serde(default)]
    pub tcp: Option<TcpRule>,
    /// Per-direction eligibility; both directions when absent
    #[serde(default)]
    pub direction: Option<DirectionRule>,
    /// Skip TCP window validation
    #[serde(default)]
    pub no_seq_check: bool,
}

impl RuleCreate {
    /// Rule without translation
    pub fn new(tuple: FlowTuple, conn: ConnectionRule) -> Self {
        Self {
            tuple,
            flow_xlate: tuple.src,
            return_xlate: tuple.dst,
            conn,
            qos: None,
            dscp: None,
            tcp: None,
            direction: None,
            no_seq_check: false,
        }
    }

    /// Rewrite the flow source to `to`
    pub fn with_snat(mut self, to: Endpoint) -> Self {
        self.flow_xlate = to;
        self
    }

    /// Rewrite the flow destination to `to`
    pub fn with_dnat(mut self, to: Endpoint) -> Self {
        self.return_xlate = to;
        self
    }

    /// Seed TCP window tracking
    pub fn with_tcp(mut self, tcp: TcpRule) -> Self {
        self.tcp = Some(tcp);
        self
    }

    /// Post-translation tuple
    pub fn translated(&self) -> FlowTuple {
        FlowTuple {
            protocol: self.tuple.protocol,
            src: self.flow_xlate,
            dst: self.return_xlate,
        }
    }
}

/// Header writing needed to leave through `egress`
fn l2_flags(egress: &Interface) -> MatchFlags {
    if egress.no_arp {
        return MatchFlags::empty();
    }
    let mut flags = MatchFlags::WRITE_L2_HDR;
    if egress.link == LinkKind::Ethernet {
        flags.insert(MatchFlags::WRITE_FAST_ETH_HDR);
    }
    flags
}

/// Both match records for a descriptor
fn build_matches(rule: &RuleCreate, flow_if: &Interface, return_if: &Interface) -> (ConnectionMatch, ConnectionMatch) {
    let protocol = rule.tuple.protocol;
    let (flow, ret) = (rule.tuple.src, rule.tuple.dst);
    let (flow_xlate, return_xlate) = (rule.flow_xlate, rule.return_xlate);

    let mut orig_flags = l2_flags(return_if);
    let mut reply_flags = l2_flags(flow_if);

    if ret != return_xlate {
        orig_flags.insert(MatchFlags::XLATE_DEST);
        reply_flags.insert(MatchFlags::XLATE_SRC);
    }
    if flow != flow_xlate {
        orig_flags.insert(MatchFlags::XLATE_SRC);
        reply_flags.insert(MatchFlags::XLATE_DEST);
    }
    if rule.no_seq_check {
        orig_flags.insert(MatchFlags::NO_SEQ_CHECK);
        reply_flags.insert(MatchFlags::NO_SEQ_CHECK);
    }

    let (orig_priority, reply_priority) = match rule.qos {
        Some(qos) => {
            orig_flags.insert(MatchFlags::PRIORITY_REMARK);
            reply_flags.insert(MatchFlags::PRIORITY_REMARK);
            (qos.flow_priority, qos.return_priority)
        }
        None => (0, 0),
    };

    let (orig_dscp, reply_dscp) = match rule.dscp {
        Some(dscp) => {
            orig_flags.insert(MatchFlags::DSCP_REMARK);
            reply_flags.insert(MatchFlags::DSCP_REMARK);
            let tos = |d: u8| (d & DSCP_BITS) << DSCP_SHIFT;
            (tos(dscp.flow_dscp), tos(dscp.return_dscp))
        }
        None => (0, 0),
    };

    let tcp = rule.tcp.unwrap_or_default();
    let accel = rule.direction.unwrap_or_default();
    let seed = |s: TcpSeed| (s.window_scale, s.max_window, s.end, s.max_end);

    let original = ConnectionMatch::build(MatchParams {
        direction: Direction::Original,
        match_dev: rule.conn.flow_interface,
        protocol,
        match_src: flow,
        match_dst: ret,
        xlate_src: flow_xlate,
        xlate_dst: return_xlate,
        flags: orig_flags,
        tcp: seed(tcp.flow),
        xmit_dev: rule.conn.return_interface,
        xmit_src_mac: return_if.mac,
        xmit_dst_mac: rule.conn.return_mac,
        mtu: rule.conn.return_mtu,
        priority: orig_priority,
        dscp: orig_dscp,
        accel: accel.flow_accel,
    });

    let reply = ConnectionMatch::build(MatchParams {
        direction: Direction::Reply,
        match_dev: rule.conn.return_interface,
        protocol,
        match_src: return_xlate,
        match_dst: flow_xlate,
        xlate_src: ret,
        xlate_dst: flow,
        flags: reply_flags,
        tcp: seed(tcp.return_),
        xmit_dev: rule.conn.flow_interface,
        xmit_src_mac: flow_if.mac,
        xmit_dst_mac: rule.conn.flow_mac,
        mtu: rule.conn.flow_mtu,
        priority: reply_priority,
        dscp: reply_dscp,
        accel: accel.return_accel,
    });

    (original, reply)
}

/// Merge newer connection manager state into a live connection
fn update_protocol_state(conn: &Connection, rule: &RuleCreate) {
    if let Some(tcp) = rule.tcp {
        for (dir, seed) in [(Direction::Original, tcp.flow), (Direction::Reply, tcp.return_)] {
            conn.match_for(dir).tcp.merge(seed.max_window, seed.end, seed.max_end);
        }
    }
    for dir in [Direction::Original, Direction::Reply] {
        conn.match_for(dir).set_no_seq_check(rule.no_seq_check);
    }
}

impl Engine {
    fn resolve_interface(&self, index: u32) -> RuleResult<Arc<Interface>> {
        match self.interfaces.interface(index) {
            Some(iface) if iface.registered => Ok(iface),
            _ => {
                tracing::warn!(index, "interface missing or not registered");
                Err(RuleError::BadInterface(index))
            }
        }
    }

    /// Start accelerating a connection.
    ///
    /// A tuple that is already accelerated gets its protocol state merged
    /// and the call returns [`RuleError::Duplicate`].
    pub fn create_rule(&self, rule: &RuleCreate) -> RuleResult<()> {
        let stats = self.stats.local();
        let now = Timestamp::now();

        let mut state = self.table.lock();
        stats.record_create_request();

        if let Some(existing) = state.find(&rule.tuple) {
            stats.record_create_collision();
            update_protocol_state(existing, rule);
            tracing::debug!(conn = %rule.tuple, "connection already accelerated");
            return Err(RuleError::Duplicate);
        }

        let interfaces = self
            .resolve_interface(rule.conn.flow_interface)
            .and_then(|flow_if| Ok((flow_if, self.resolve_interface(rule.conn.return_interface)?)));
        let (flow_if, return_if) = match interfaces {
            Ok(pair) => pair,
            Err(err) => {
                stats.record_create_failure();
                return Err(err);
            }
        };

        if state.len() >= self.config.max_connections {
            stats.record_create_failure();
            tracing::warn!(max = self.config.max_connections, "connection table full");
            return Err(RuleError::ResourceExhausted);
        }

        let (original, reply) = build_matches(rule, &flow_if, &return_if);
        let id = state.allocate_id();
        let conn = Arc::new(Connection::new(id, rule.tuple, rule.translated(), original, reply, now));
        self.table.insert(&mut state, conn, now);

        tracing::info!(
            id,
            conn = %rule.tuple,
            translated = %rule.translated(),
            flow_dev = %flow_if.name,
            return_dev = %return_if.name,
            "connection created"
        );
        Ok(())
    }

    /// Merge newer TCP state and the no-seq-check flag into a live connection
    pub fn update_rule(&self, rule: &RuleCreate) -> RuleResult<()> {
        let state = self.table.lock();
        let conn = state.find(&rule.tuple).ok_or(RuleError::NotFound)?;
        update_protocol_state(conn, rule);
        Ok(())
    }

    /// Set the mark stamped on forwarded packets
    pub fn update_mark(&self, tuple: &FlowTuple, mark: u32) -> RuleResult<()> {
        let state = self.table.lock();
        let conn = state.find(tuple).ok_or(RuleError::NotFound)?;
        let old = conn.set_mark(mark);
        if old != 0 && mark == 0 {
            tracing::warn!(conn = %tuple, old, "connection mark cleared");
        }
        Ok(())
    }

    /// Stop accelerating a connection; its final stats are reported first
    pub fn destroy_rule(&self, tuple: &FlowTuple) -> RuleResult<()> {
        let stats = self.stats.local();
        let now = Timestamp::now();
        stats.record_destroy_request();

        let (conn, callback) = {
            let mut state = self.table.lock();
            let Some(conn) = state.find(tuple).cloned() else {
                stats.record_destroy_miss();
                tracing::debug!(conn = %tuple, "destroy of unknown connection");
                return Err(RuleError::NotFound);
            };
            self.table.remove(&mut state, &conn, now);
            (conn, state.sync_callback.clone())
        };

        self.flush(&conn, SyncReason::Destroy, callback, now);
        tracing::info!(id = conn.id, conn = %tuple, "connection destroyed");
        Ok(())
    }

    /// Tear down every connection, or those using interface `dev`.
    ///
    /// Returns the number destroyed.
    pub fn destroy_all(&self, dev: Option<u32>) -> usize {
        let selected = |c: &Connection| dev.map_or(true, |d| c.original_dev() == d || c.reply_dev() == d);
        let mut destroyed = 0;

        loop {
            let now = Timestamp::now();
            let (conn, callback) = {
                let mut state = self.table.lock();
                let Some(conn) = state.find_first(selected) else {
                    break;
                };
                self.table.remove(&mut state, &conn, now);
                (conn, state.sync_callback.clone())
            };

            self.flush(&conn, SyncReason::Destroy, callback, now);
            destroyed += 1;
        }

        tracing::info!(destroyed, ?dev, "bulk destroy");
        destroyed
    }
}
