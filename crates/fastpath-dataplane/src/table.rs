//! Connection Table and Match Index
//!
//! # Design
//!
//! - Tuple-hashed connection buckets and an insertion-ordered traversal
//!   list, both behind one engine-wide mutex
//! - Match index buckets are copy-on-write `ArcSwap` vectors: writers
//!   (holding the mutex) publish a new vector, readers never block
//! - A removed connection stays valid for as long as a reader still holds
//!   its `Arc`; that is the grace period

use crate::connection::{Connection, Direction, MatchRef};
use crate::cookie::{FlowCookieSetter, FlowCookieTable};
use crate::sync::SyncCallback;
use arc_swap::ArcSwap;
use fastpath_common::{Endpoint, FlowTuple, Timestamp};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bucket count is `1 << HASH_SHIFT`
pub const HASH_SHIFT: u32 = 12;
/// Number of buckets in each hash
pub const HASH_SIZE: usize = 1 << HASH_SHIFT;
/// Bucket index mask
pub const HASH_MASK: u32 = HASH_SIZE as u32 - 1;

/// Mix a hash seed down to a bucket index
#[inline(always)]
pub fn hash_fold(seed: u32) -> usize {
    (((seed >> HASH_SHIFT) ^ seed) & HASH_MASK) as usize
}

/// Bucket for a connection tuple
#[inline(always)]
pub fn connection_bucket(tuple: &FlowTuple) -> usize {
    hash_fold(tuple.hash_seed())
}

/// Bucket for a match key; the ingress interface is part of the key
#[inline(always)]
pub fn match_bucket(dev: u32, protocol: u8, src: Endpoint, dst: Endpoint) -> usize {
    let tuple = FlowTuple { protocol, src, dst };
    hash_fold(dev ^ tuple.hash_seed())
}

/// Lock-free per-packet lookup structure
pub struct MatchIndex {
    buckets: Box<[ArcSwap<Vec<MatchRef>>]>,
}

impl Default for MatchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchIndex {
    /// Empty index with `HASH_SIZE` buckets
    pub fn new() -> Self {
        Self {
            buckets: (0..HASH_SIZE).map(|_| ArcSwap::from_pointee(Vec::new())).collect(),
        }
    }

    /// Find the match for a received packet
    #[inline]
    pub fn lookup(&self, dev: u32, protocol: u8, src: Endpoint, dst: Endpoint) -> Option<MatchRef> {
        let bucket = self.buckets[match_bucket(dev, protocol, src, dst)].load();
        bucket.iter().find(|m| m.cm().matches(dev, protocol, src, dst)).cloned()
    }

    /// Writers hold the table lock, so load-modify-store cannot race
    fn insert(&self, m: MatchRef) {
        let cm = m.cm();
        let slot = &self.buckets[match_bucket(cm.match_dev, cm.protocol, cm.match_src, cm.match_dst)];
        let current = slot.load();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.push(m);
        next.extend(current.iter().cloned());
        slot.store(Arc::new(next));
    }

    fn remove(&self, conn: &Arc<Connection>, dir: Direction) {
        let cm = conn.match_for(dir);
        let slot = &self.buckets[match_bucket(cm.match_dev, cm.protocol, cm.match_src, cm.match_dst)];
        let next: Vec<MatchRef> = slot
            .load()
            .iter()
            .filter(|m| !(Arc::ptr_eq(&m.conn, conn) && m.dir == dir))
            .cloned()
            .collect();
        slot.store(Arc::new(next));
    }

    /// Number of match records reachable (both directions count)
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.load().len()).sum()
    }

    /// No match records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything mutated under the engine lock
pub struct TableState {
    buckets: Vec<Vec<Arc<Connection>>>,
    list: BTreeMap<u64, Arc<Connection>>,
    next_id: u64,
    /// Where the periodic walk resumes; `None` is the list head
    pub(crate) sync_cursor: Option<u64>,
    pub(crate) sync_callback: Option<Arc<dyn SyncCallback>>,
    pub(crate) cookie_setter: Option<Arc<dyn FlowCookieSetter>>,
}

impl TableState {
    fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); HASH_SIZE],
            list: BTreeMap::new(),
            next_id: 1,
            sync_cursor: None,
            sync_callback: None,
            cookie_setter: None,
        }
    }

    /// Exact tuple lookup
    pub fn find(&self, tuple: &FlowTuple) -> Option<&Arc<Connection>> {
        self.buckets[connection_bucket(tuple)].iter().find(|c| c.original == *tuple)
    }

    /// First connection in list order satisfying `pred`
    pub fn find_first(&self, mut pred: impl FnMut(&Connection) -> bool) -> Option<Arc<Connection>> {
        self.list.values().find(|c| pred(c)).cloned()
    }

    /// Connections from `cursor` onwards, in list order
    pub fn iter_from(&self, cursor: Option<u64>) -> impl Iterator<Item = &Arc<Connection>> + '_ {
        self.list.range(cursor.unwrap_or(0)..).map(|(_, c)| c)
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Linked connections
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// No linked connections
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Connection table, match index and flow cookies
pub struct ConnectionTable {
    state: Mutex<TableState>,
    index: MatchIndex,
    cookies: FlowCookieTable,
    cookies_enabled: AtomicBool,
    count: AtomicUsize,
}

impl ConnectionTable {
    /// Empty table
    pub fn new(cookies_enabled: bool) -> Self {
        Self {
            state: Mutex::new(TableState::new()),
            index: MatchIndex::new(),
            cookies: FlowCookieTable::new(),
            cookies_enabled: AtomicBool::new(cookies_enabled),
            count: AtomicUsize::new(0),
        }
    }

    /// Take the engine lock
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock()
    }

    /// Per-packet match index
    #[inline(always)]
    pub fn index(&self) -> &MatchIndex {
        &self.index
    }

    /// Flow cookie slots
    #[inline(always)]
    pub fn cookies(&self) -> &FlowCookieTable {
        &self.cookies
    }

    /// Whether cookies are claimed and consulted
    pub fn cookies_enabled(&self) -> bool {
        self.cookies_enabled.load(Ordering::Relaxed)
    }

    /// Toggle the cookie path
    pub fn set_cookies_enabled(&self, on: bool) {
        self.cookies_enabled.store(on, Ordering::Relaxed);
    }

    /// Resident connections, readable without the lock
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// No resident connections
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a connection by tuple
    pub fn find(&self, tuple: &FlowTuple) -> Option<Arc<Connection>> {
        self.lock().find(tuple).cloned()
    }

    /// Link a new connection into every index
    pub(crate) fn insert(&self, state: &mut TableState, conn: Arc<Connection>, now: Timestamp) {
        let bucket = connection_bucket(&conn.original);
        state.buckets[bucket].insert(0, conn.clone());

        for dir in [Direction::Original, Direction::Reply] {
            let m = MatchRef::new(conn.clone(), dir);
            self.index.insert(m.clone());
            if self.cookies_enabled() {
                if let Some(setter) = state.cookie_setter.as_deref() {
                    self.cookies.claim(&m, setter, now);
                }
            }
        }

        state.list.insert(conn.id, conn);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlink a connection; false if it was already removed
    pub(crate) fn remove(&self, state: &mut TableState, conn: &Arc<Connection>, now: Timestamp) -> bool {
        if !conn.mark_removed() {
            tracing::debug!(conn = %conn.original, "connection already removed");
            return false;
        }

        for dir in [Direction::Original, Direction::Reply] {
            self.index.remove(conn, dir);
            let m = MatchRef::new(conn.clone(), dir);
            self.cookies.release(&m, state.cookie_setter.as_deref(), now);
        }

        let bucket = connection_bucket(&conn.original);
        state.buckets[bucket].retain(|c| !Arc::ptr_eq(c, conn));
        state.list.remove(&conn.id);
        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }
}
