//! I/O slots and generation-tagged references.
//!
//! The engine owns a fixed table of [`IoSlot`] records. No pointer to a
//! slot ever escapes: owners address their slots with an [`IoHandle`]
//! (a bare table index, valid while the user reference is held) and
//! everybody else with an [`IoRef`], which pairs the index with the slot's
//! generation at capture time. Every dereference of an `IoRef` re-checks
//! the generation; a mismatch means the operation completed and the slot
//! has been reused, which observers treat as completion.
//!
//! Field ownership follows the lifecycle: `flags`, `result` and the op
//! payload are written only by whichever backend currently owns the slot
//! (or under the central mutex), and read elsewhere with acquire ordering
//! behind a generation check. The cold parts (payload, local callback,
//! bounce-buffer association) sit behind a short per-slot mutex.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::flags::IoFlags;
use crate::list::{Link, ListRole, NO_SLOT};
use crate::ops::{OpKind, OpPayload};

/// Backend id sentinel: slot not owned by any backend.
pub(crate) const NO_OWNER: u32 = u32::MAX;

/// Driver-context sentinel: not bound to a context.
pub(crate) const NO_CONTEXT: u8 = u8::MAX;

/// Token for a slot the holder owns a user reference to.
///
/// Returned by [`BackendHandle::acquire`](crate::BackendHandle::acquire);
/// valid until the matching `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoHandle(pub(crate) u32);

impl IoHandle {
    /// Slot table index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable reference to an operation: slot index plus generation.
///
/// Safe to hold across slot reuse; dereferencing compares generations and
/// reports a recycled slot as "already completed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRef {
    pub(crate) index: u32,
    pub(crate) generation: u64,
}

impl IoRef {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u64 {
        self.generation
    }
}

/// Per-slot local completion callback, invoked once in the initiating
/// backend with the operation's result.
pub type LocalCallback = Box<dyn FnOnce(i32) + Send>;

/// Cold per-slot state, touched only at preparation, completion and
/// recycling time.
#[derive(Default)]
pub(crate) struct SlotInner {
    pub op: OpPayload,
    pub local_cb: Option<LocalCallback>,
    /// Index into the bounce buffer pool, if one is associated.
    pub bounce: Option<u32>,
}

/// One record of the shared I/O table.
pub(crate) struct IoSlot {
    /// `OpKind` discriminant, 0 when none. Also the shared-callback index.
    kind: AtomicU8,
    flags: AtomicU16,
    /// Initiating backend, or `NO_OWNER`.
    owner: AtomicU32,
    /// Driver context the op was bound to at submission.
    context: AtomicU8,
    /// Negative errno on failure, transferred byte count on success.
    result: AtomicI32,
    /// Bumped whenever the slot leaves use; never zero.
    generation: AtomicU64,
    pub user_ref: AtomicBool,
    pub system_ref: AtomicBool,
    /// Next member of a merged chain, or `NO_SLOT`.
    pub merge_with: AtomicU32,
    /// Ring driver: index of the iovec array in use, or -1.
    pub used_iovec: AtomicI32,
    /// Soft-failure retries so far.
    pub retries: AtomicU32,
    pub owner_link: Link,
    pub io_link: Link,
    wait_mutex: Mutex<()>,
    wait_cv: Condvar,
    pub inner: Mutex<SlotInner>,
}

impl IoSlot {
    pub fn new() -> IoSlot {
        IoSlot {
            kind: AtomicU8::new(0),
            flags: AtomicU16::new(IoFlags::UNUSED.bits()),
            owner: AtomicU32::new(NO_OWNER),
            context: AtomicU8::new(NO_CONTEXT),
            result: AtomicI32::new(0),
            generation: AtomicU64::new(1),
            user_ref: AtomicBool::new(false),
            system_ref: AtomicBool::new(true),
            merge_with: AtomicU32::new(NO_SLOT),
            used_iovec: AtomicI32::new(-1),
            retries: AtomicU32::new(0),
            owner_link: Link::new(),
            io_link: Link::new(),
            wait_mutex: Mutex::new(()),
            wait_cv: Condvar::new(),
            inner: Mutex::new(SlotInner::default()),
        }
    }

    pub(crate) fn link(&self, role: ListRole) -> &Link {
        match role {
            ListRole::Owner => &self.owner_link,
            ListRole::Io => &self.io_link,
        }
    }

    // ── Hot state ───────────────────────────────────────────────────

    #[inline]
    pub fn flags(&self) -> IoFlags {
        IoFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    /// Store the full flag set. Single-writer: only the current owner of
    /// the slot (per the state machine) or a holder of the central mutex
    /// may call this.
    #[inline]
    pub fn set_flags(&self, flags: IoFlags) {
        debug_assert!(flags.phase_is_valid(), "invalid flag phase: {flags}");
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Read-modify-write of the flags under the single-writer rule.
    #[inline]
    pub fn update_flags(&self, clear: IoFlags, set: IoFlags) -> IoFlags {
        let new = self.flags().difference(clear).union(set);
        self.set_flags(new);
        new
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advance the generation; pairs with the acquire loads of readers
    /// holding an [`IoRef`].
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn kind(&self) -> Option<OpKind> {
        OpKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub fn set_kind(&self, kind: Option<OpKind>) {
        self.kind
            .store(kind.map_or(0, |k| k as u8), Ordering::Release);
    }

    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, owner: u32) {
        self.owner.store(owner, Ordering::Release);
    }

    pub fn context(&self) -> u8 {
        self.context.load(Ordering::Acquire)
    }

    pub fn set_context(&self, context: u8) {
        self.context.store(context, Ordering::Release);
    }

    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    pub fn set_result(&self, result: i32) {
        self.result.store(result, Ordering::Release);
    }

    // ── Waiting ─────────────────────────────────────────────────────

    /// Wake every backend sleeping on this slot's condition variable.
    pub fn wake_waiters(&self) {
        // Taking the mutex orders us after a waiter's condition check, so
        // the notify below cannot fall between its check and its sleep.
        drop(self.wait_mutex.lock());
        self.wait_cv.notify_all();
    }

    /// Sleep until woken (or `timeout` elapses) unless `still_waiting`
    /// re-evaluates to false under the wait mutex. Spurious wakeups are
    /// expected; callers loop.
    pub fn sleep_on<F: Fn() -> bool>(&self, still_waiting: F, timeout: Option<Duration>) {
        let mut guard = self.wait_mutex.lock();
        if !still_waiting() {
            return;
        }
        match timeout {
            Some(t) => {
                self.wait_cv.wait_for(&mut guard, t);
            }
            None => self.wait_cv.wait(&mut guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fresh_slot_state() {
        let slot = IoSlot::new();
        assert_eq!(slot.flags(), IoFlags::UNUSED);
        assert_eq!(slot.generation(), 1);
        assert_eq!(slot.owner(), NO_OWNER);
        assert!(slot.system_ref.load(Ordering::Relaxed));
        assert!(!slot.user_ref.load(Ordering::Relaxed));
        assert_eq!(slot.kind(), None);
    }

    #[test]
    fn flag_updates() {
        let slot = IoSlot::new();
        slot.set_flags(IoFlags::IDLE);
        slot.update_flags(IoFlags::IDLE, IoFlags::IN_PROGRESS | IoFlags::PENDING);
        assert!(slot.flags().contains(IoFlags::PENDING));
        slot.update_flags(IoFlags::PENDING, IoFlags::INFLIGHT);
        assert_eq!(slot.flags(), IoFlags::IN_PROGRESS | IoFlags::INFLIGHT);
    }

    #[test]
    fn wake_reaches_sleeper() {
        let slot = Arc::new(IoSlot::new());
        slot.set_flags(IoFlags::IN_PROGRESS | IoFlags::INFLIGHT);

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                while !slot.flags().contains(IoFlags::DONE) {
                    slot.sleep_on(|| !slot.flags().contains(IoFlags::DONE), None);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        slot.set_flags(IoFlags::DONE);
        slot.wake_waiters();
        waiter.join().unwrap();
    }

    #[test]
    fn timed_sleep_returns() {
        let slot = IoSlot::new();
        // No wake ever arrives; the bounded sleep must still return.
        slot.sleep_on(|| true, Some(Duration::from_millis(5)));
    }
}
