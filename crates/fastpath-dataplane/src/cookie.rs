//! Hardware flow cookies
//!
//! Some NICs can tag received packets with a small index programmed per
//! flow. When enabled, every inserted match claims a slot and the NIC is
//! told to tag that flow with it; lookups then start at the slot.

use crate::connection::MatchRef;
use arc_swap::ArcSwapOption;
use fastpath_common::{Endpoint, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of cookie slots; slot 0 means "no cookie"
pub const FLOW_COOKIE_SIZE: usize = 2048;

/// Mask applied to cookies read from packets
pub const FLOW_COOKIE_MASK: u32 = FLOW_COOKIE_SIZE as u32 - 1;

/// A released slot is not handed out again before this
pub const SLOT_REUSE_DELAY: Duration = Duration::from_secs(1);

/// Programs flow cookies into the NIC
pub trait FlowCookieSetter: Send + Sync {
    /// Tag packets of this flow with `cookie`, or stop tagging when `cookie` is 0.
    ///
    /// Returns false if the hardware refused.
    fn set_cookie(&self, protocol: u8, src: Endpoint, dst: Endpoint, cookie: u32) -> bool;
}

impl<F> FlowCookieSetter for F
where
    F: Fn(u8, Endpoint, Endpoint, u32) -> bool + Send + Sync,
{
    fn set_cookie(&self, protocol: u8, src: Endpoint, dst: Endpoint, cookie: u32) -> bool {
        self(protocol, src, dst, cookie)
    }
}

#[derive(Default)]
struct CookieSlot {
    entry: ArcSwapOption<MatchRef>,
    last_clean: AtomicU64,
}

/// Cookie index to match record
pub struct FlowCookieTable {
    slots: Box<[CookieSlot]>,
}

impl Default for FlowCookieTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowCookieTable {
    /// All slots empty
    pub fn new() -> Self {
        Self {
            slots: (0..FLOW_COOKIE_SIZE).map(|_| CookieSlot::default()).collect(),
        }
    }

    /// Match programmed for a packet's cookie
    #[inline]
    pub fn get(&self, cookie: u32) -> Option<MatchRef> {
        let slot = &self.slots[(cookie & FLOW_COOKIE_MASK) as usize];
        slot.entry.load().as_deref().cloned()
    }

    /// Program the first reusable slot for `m`. Caller holds the table lock.
    pub(crate) fn claim(&self, m: &MatchRef, setter: &dyn FlowCookieSetter, now: Timestamp) -> Option<u32> {
        let (idx, slot) = self.slots.iter().enumerate().skip(1).find(|(_, slot)| {
            let last = Timestamp::from_nanos(slot.last_clean.load(Ordering::Relaxed));
            slot.entry.load().is_none() && now.duration_since(last) >= SLOT_REUSE_DELAY
        })?;

        let cm = m.cm();
        let cookie = idx as u32;
        if !setter.set_cookie(cm.protocol, cm.match_src, cm.match_dst, cookie) {
            tracing::debug!(cookie, "flow cookie rejected by hardware");
            return None;
        }

        slot.entry.store(Some(Arc::new(m.clone())));
        cm.flow_cookie.store(cookie, Ordering::Relaxed);
        Some(cookie)
    }

    /// Clear the slot held by `m`, if any. Caller holds the table lock.
    pub(crate) fn release(&self, m: &MatchRef, setter: Option<&dyn FlowCookieSetter>, now: Timestamp) {
        let cm = m.cm();
        let cookie = cm.flow_cookie.swap(0, Ordering::Relaxed);
        if cookie == 0 {
            return;
        }

        if let Some(setter) = setter {
            setter.set_cookie(cm.protocol, cm.match_src, cm.match_dst, 0);
        }

        let slot = &self.slots[(cookie & FLOW_COOKIE_MASK) as usize];
        slot.entry.store(None);
        slot.last_clean.store(now.as_nanos(), Ordering::Relaxed);
    }

    /// Slots currently programmed
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.load().is_some()).count()
    }
}
