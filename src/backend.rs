//! Per-backend I/O state.
//!
//! Each registered backend tracks its slots through seven lifecycle lists.
//! The owner-role lists (unused, outstanding, issued) and the io-role lists
//! (pending, reaped, local_completed) are touched only by the backend's own
//! thread and sit behind an uncontended mutex; `issued_abandoned` lives
//! with the engine's central state because other backends modify it during
//! completion, and `foreign_completed` is spinlocked because completers
//! push into it from their completion loops.
//!
//! The count gauges duplicate the list lengths as atomics so the
//! introspection readers never have to take another backend's locks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::list::{ListRole, SlotList};
use crate::spin::SpinLock;

/// Lists owned exclusively by the backend's thread.
pub(crate) struct BackendLists {
    /// Local free pool, refilled on release to spare the central lock.
    pub unused: SlotList,
    /// Slots handed out to backend code, not currently submitted.
    pub outstanding: SlotList,
    /// Staged, not yet submitted.
    pub pending: SlotList,
    /// Submitted and still user-referenced.
    pub issued: SlotList,
    /// Completions received here, shared callbacks not yet run.
    pub reaped: SlotList,
    /// Completed, local callback still to be delivered.
    pub local_completed: SlotList,
}

impl BackendLists {
    fn new() -> BackendLists {
        BackendLists {
            unused: SlotList::new(ListRole::Owner),
            outstanding: SlotList::new(ListRole::Owner),
            pending: SlotList::new(ListRole::Io),
            issued: SlotList::new(ListRole::Owner),
            reaped: SlotList::new(ListRole::Io),
            local_completed: SlotList::new(ListRole::Io),
        }
    }
}

/// Cumulative per-backend statistics.
#[derive(Default)]
pub(crate) struct BackendTotals {
    /// Logical operations submitted (un-merged).
    pub executed: AtomicU64,
    /// Kernel entries submitted (merged chains count once).
    pub issued: AtomicU64,
    /// Submission calls into the driver.
    pub submissions: AtomicU64,
    /// Completions routed here from other backends.
    pub foreign_completed: AtomicU64,
    /// Soft-failure retries.
    pub retries: AtomicU64,
}

pub(crate) struct BackendState {
    pub id: u32,
    pub in_use: AtomicBool,
    /// Driver context this backend last submitted through.
    pub last_context: AtomicU32,
    /// Operations submitted to the kernel and not yet reaped.
    pub inflight: AtomicU32,
    pub local: Mutex<BackendLists>,
    /// Completions observed by other backends, awaiting transfer.
    pub foreign_completed: SpinLock<SlotList>,
    /// Reentry guard for local-callback dispatch.
    pub local_cb_depth: AtomicU32,

    // Gauges mirroring list lengths.
    pub unused_count: AtomicU32,
    pub outstanding_count: AtomicU32,
    pub pending_count: AtomicU32,
    pub issued_count: AtomicU32,
    pub abandoned_count: AtomicU32,
    pub local_completed_count: AtomicU32,
    pub foreign_completed_count: AtomicU32,

    pub totals: BackendTotals,
}

impl BackendState {
    pub fn new(id: u32) -> BackendState {
        BackendState {
            id,
            in_use: AtomicBool::new(false),
            last_context: AtomicU32::new(0),
            inflight: AtomicU32::new(0),
            local: Mutex::new(BackendLists::new()),
            foreign_completed: SpinLock::new(SlotList::new(ListRole::Io)),
            local_cb_depth: AtomicU32::new(0),
            unused_count: AtomicU32::new(0),
            outstanding_count: AtomicU32::new(0),
            pending_count: AtomicU32::new(0),
            issued_count: AtomicU32::new(0),
            abandoned_count: AtomicU32::new(0),
            local_completed_count: AtomicU32::new(0),
            foreign_completed_count: AtomicU32::new(0),
            totals: BackendTotals::default(),
        }
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> u32 {
        self.pending_count.load(Ordering::Acquire)
    }
}

/// Adjust a gauge by +1/-1 next to the paired list operation.
pub(crate) fn gauge_inc(gauge: &AtomicU32) {
    gauge.fetch_add(1, Ordering::AcqRel);
}

pub(crate) fn gauge_dec(gauge: &AtomicU32) {
    let prev = gauge.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "gauge underflow");
}
