//! The I/O engine: slot arena, staging pipeline, completion routing.
//!
//! One [`Engine`] is shared by every participating backend. A backend is a
//! registered thread holding a [`BackendHandle`]; it acquires slots, fills
//! them with operations, submits in batches, and waits, possibly on
//! operations another backend initiated. Any backend may observe any
//! completion; the engine routes it back to the initiator.
//!
//! Locking taxonomy (outermost to innermost): a backend's own list mutex,
//! the central mutex, then a backend's foreign-completed spinlock. Only the
//! owning thread ever takes a backend's list mutex, so those never deadlock
//! across threads; the spinlocks are leaf locks.

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{BackendLists, BackendState, gauge_dec, gauge_inc};
use crate::bounce::{BounceBuffer, BouncePool};
use crate::complete::{self, SharedCompletionFn};
use crate::config::Config;
use crate::driver::{self, Driver};
use crate::error::Error;
use crate::flags::IoFlags;
use crate::list::{ListRole, NO_SLOT, SlotList};
use crate::merge;
use crate::metrics;
use crate::ops::{
    BufferTag, FlushRangeOp, FsyncOp, FsyncWalOp, OP_KIND_SLOTS, OpKind, OpPayload, ReadBufferOp,
    WalSegment, WriteBufferOp, WriteGenericOp, WriteWalOp,
};
use crate::slot::{IoHandle, IoRef, IoSlot, LocalCallback, NO_CONTEXT, NO_OWNER};

#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(windows)]
use crate::ops::RawFd;

/// How many released slots a backend may cache in its local free pool
/// before they go back to the central pool.
const LOCAL_UNUSED_MAX: u32 = 16;

/// Bounded sleep for waits that may only be satisfied by another backend
/// draining on our behalf.
const FOREIGN_WAIT: Duration = Duration::from_millis(100);

/// Opens files from their identifying tags.
///
/// Descriptors stored in op payloads cannot be trusted across backends —
/// they may belong to another thread's cache or have been closed. Worker
/// backends and the retry path use this trait to get their own.
pub trait FileResolver: Send + Sync {
    /// Descriptor for the block file identified by `tag`. The resolver
    /// keeps ownership (it is expected to cache descriptors).
    fn reopen_buffered(&self, tag: &BufferTag) -> io::Result<RawFd>;

    /// Open a WAL segment. The caller owns the returned file.
    fn open_wal_segment(&self, segment: &WalSegment) -> io::Result<std::fs::File>;
}

pub(crate) struct CentralState {
    /// Central free pool (owner-role list).
    pub unused: SlotList,
    /// Slots out of the free pool, including those cached in backend-local
    /// free pools.
    pub used_count: u32,
    /// Slots whose shared callback reported failure; the retry path
    /// collects from here (io-role list).
    pub reaped_uncompleted: SlotList,
    /// Free bounce buffer indices.
    pub unused_bounce: Vec<u32>,
    /// Per-backend issued-but-released lists (owner-role). Central because
    /// completers on other backends unlink from them.
    pub abandoned: Box<[SlotList]>,
}

pub struct Engine {
    pub(crate) config: Config,
    pub(crate) slots: Box<[IoSlot]>,
    pub(crate) backends: Box<[BackendState]>,
    pub(crate) central: Mutex<CentralState>,
    pub(crate) bounce: BouncePool,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) callbacks: [SharedCompletionFn; OP_KIND_SLOTS],
    pub(crate) resolver: Option<Arc<dyn FileResolver>>,
    shut_down: AtomicBool,
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: Config,
    resolver: Option<Arc<dyn FileResolver>>,
    callbacks: [SharedCompletionFn; OP_KIND_SLOTS],
}

impl EngineBuilder {
    pub fn new(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            resolver: None,
            callbacks: complete::default_callbacks(),
        }
    }

    /// Install the descriptor resolver used by worker backends and the
    /// retry path.
    pub fn resolver(mut self, resolver: Arc<dyn FileResolver>) -> EngineBuilder {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the shared completion callback for one operation type.
    /// This is how the buffer manager and WAL modules hook their own
    /// completion logic in.
    pub fn shared_callback(mut self, kind: OpKind, cb: SharedCompletionFn) -> EngineBuilder {
        self.callbacks[kind as usize] = cb;
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, Error> {
        self.config.validate()?;
        let config = self.config;

        let slots: Box<[IoSlot]> = (0..config.max_io_slots).map(|_| IoSlot::new()).collect();
        let backends: Box<[BackendState]> =
            (0..config.max_backends).map(BackendState::new).collect();

        let mut unused = SlotList::new(ListRole::Owner);
        for idx in 0..config.max_io_slots {
            unused.push_tail(&slots, idx);
        }
        let abandoned = (0..config.max_backends)
            .map(|_| SlotList::new(ListRole::Owner))
            .collect();
        let central = CentralState {
            unused,
            used_count: 0,
            reaped_uncompleted: SlotList::new(ListRole::Io),
            unused_bounce: (0..config.max_bounce_buffers).rev().collect(),
            abandoned,
        };

        let bounce = BouncePool::new(config.max_bounce_buffers, config.bounce_buffer_size);
        let driver = driver::build(&config)?;

        let engine = Arc::new(Engine {
            config,
            slots,
            backends,
            central: Mutex::new(central),
            bounce,
            driver,
            callbacks: self.callbacks,
            resolver: self.resolver,
            shut_down: AtomicBool::new(false),
        });
        engine.driver.startup(&engine)?;
        Ok(engine)
    }
}

impl Engine {
    /// Build an engine with default callbacks and no resolver.
    pub fn create(config: Config) -> Result<Arc<Engine>, Error> {
        EngineBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register the calling thread as a backend.
    pub fn register_backend(self: &Arc<Engine>) -> Result<BackendHandle, Error> {
        let bid = self.register_backend_id()?;
        Ok(BackendHandle {
            engine: Arc::clone(self),
            bid,
            _not_sync: PhantomData,
        })
    }

    pub(crate) fn register_backend_id(&self) -> Result<u32, Error> {
        for backend in self.backends.iter() {
            if backend
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(backend.id);
            }
        }
        Err(Error::BackendLimitReached)
    }

    pub(crate) fn unregister_backend_id(&self, bid: u32) {
        self.backends[bid as usize]
            .in_use
            .store(false, Ordering::Release);
    }

    /// Stop driver-side machinery (worker threads, signal handlers).
    /// Further submissions are not allowed; idempotent.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.driver.shutdown(self);
        }
    }

    /// Slots currently out of the free pool.
    pub fn slots_in_use(&self) -> u32 {
        self.central.lock().used_count
    }

    // ── Slot acquisition and release ────────────────────────────────

    pub(crate) fn acquire_slot(&self, bid: u32) -> IoHandle {
        let backend = &self.backends[bid as usize];
        debug_assert!(backend.pending() < self.config.submit_batch);

        let idx = loop {
            {
                let mut local = backend.local.lock();
                if let Some(idx) = local.unused.pop_head(&self.slots) {
                    gauge_dec(&backend.unused_count);
                    break idx;
                }
            }
            {
                let mut central = self.central.lock();
                if let Some(idx) = central.unused.pop_head(&self.slots) {
                    central.used_count += 1;
                    break idx;
                }
            }
            log::debug!(
                "backend {bid}: free pool empty, draining (inflight {})",
                backend.inflight()
            );
            for ctx in 0..self.driver.num_contexts() {
                self.drain_one(bid, ctx, true);
            }
        };

        let slot = &self.slots[idx as usize];
        debug_assert_eq!(slot.flags(), IoFlags::UNUSED);
        debug_assert!(slot.system_ref.load(Ordering::Acquire));
        debug_assert!(slot.inner.lock().local_cb.is_none());

        slot.user_ref.store(true, Ordering::Release);
        slot.system_ref.store(false, Ordering::Release);
        slot.set_owner(bid);
        slot.set_flags(IoFlags::IDLE);

        let mut local = backend.local.lock();
        local.outstanding.push_tail(&self.slots, idx);
        gauge_inc(&backend.outstanding_count);
        metrics::SLOTS_IN_USE.increment();

        IoHandle(idx)
    }

    pub(crate) fn release_slot(&self, bid: u32, idx: u32) {
        let slot = &self.slots[idx as usize];
        assert!(slot.user_ref.load(Ordering::Acquire));
        assert_eq!(slot.owner(), bid, "released by non-owner backend");

        let backend = &self.backends[bid as usize];
        let mut local = backend.local.lock();
        let mut central = self.central.lock();

        slot.user_ref.store(false, Ordering::Release);
        let flags = slot.flags();

        if flags.intersects(IoFlags::IDLE | IoFlags::PENDING | IoFlags::LOCAL_CB_CALLED) {
            debug_assert!(!flags.contains(IoFlags::INFLIGHT));
            local.outstanding.remove(&self.slots, idx);
            gauge_dec(&backend.outstanding_count);
            log::trace!("releasing plain user reference to {idx}");
        } else {
            local.issued.remove(&self.slots, idx);
            gauge_dec(&backend.issued_count);
            if slot.system_ref.load(Ordering::Acquire) {
                log::debug!("io {idx} abandoned at release");
                central.abandoned[bid as usize].push_tail(&self.slots, idx);
                gauge_inc(&backend.abandoned_count);
            } else {
                debug_assert!(flags.intersects(IoFlags::DONE | IoFlags::SHARED_CB_CALLED));
            }
        }

        if !slot.system_ref.load(Ordering::Acquire) {
            debug_assert!(!flags.intersects(IoFlags::INFLIGHT | IoFlags::MERGE));
            debug_assert!(flags.intersects(IoFlags::DONE | IoFlags::IDLE));

            if flags.contains(IoFlags::DONE) {
                if flags.contains(IoFlags::FOREIGN_DONE) {
                    let mut foreign = backend.foreign_completed.lock();
                    foreign.remove(&self.slots, idx);
                    gauge_dec(&backend.foreign_completed_count);
                    slot.update_flags(IoFlags::FOREIGN_DONE, IoFlags::empty());
                } else if flags.contains(IoFlags::SHARED_FAILED) {
                    central.reaped_uncompleted.remove(&self.slots, idx);
                } else if !flags.contains(IoFlags::LOCAL_CB_CALLED) {
                    local.local_completed.remove(&self.slots, idx);
                    gauge_dec(&backend.local_completed_count);
                }
            }

            self.reset_slot(&mut central, Some((backend, &mut local)), idx);
        }
    }

    /// Return a fully unreferenced slot to a free pool. Caller holds the
    /// central mutex and, when a local pool is offered, the backend lock.
    fn reset_slot(
        &self,
        central: &mut CentralState,
        local_pool: Option<(&BackendState, &mut BackendLists)>,
        idx: u32,
    ) {
        let slot = &self.slots[idx as usize];
        debug_assert!(!slot.user_ref.load(Ordering::Acquire));
        debug_assert_eq!(slot.merge_with.load(Ordering::Relaxed), NO_SLOT);

        slot.bump_generation();
        slot.set_flags(IoFlags::UNUSED);
        slot.set_kind(None);
        slot.set_owner(NO_OWNER);
        slot.set_context(NO_CONTEXT);
        slot.set_result(0);
        slot.retries.store(0, Ordering::Relaxed);
        slot.used_iovec.store(-1, Ordering::Relaxed);
        slot.system_ref.store(true, Ordering::Release);

        let bounce = {
            let mut inner = slot.inner.lock();
            inner.op = OpPayload::None;
            inner.local_cb = None;
            inner.bounce.take()
        };
        if let Some(bb) = bounce {
            self.release_bounce_locked(central, BounceBuffer(bb));
        }

        match local_pool {
            Some((backend, local)) if local.unused.len() < LOCAL_UNUSED_MAX => {
                local.unused.push_tail(&self.slots, idx);
                gauge_inc(&backend.unused_count);
            }
            _ => {
                central.unused.push_tail(&self.slots, idx);
                debug_assert!(central.used_count > 0);
                central.used_count -= 1;
            }
        }
        metrics::SLOTS_IN_USE.decrement();
    }

    /// Completion-side slot settlement: drop the system reference and
    /// either route to the initiator or recycle. Called by the
    /// shared-callback dispatch loop with the central mutex held.
    pub(crate) fn recycle_completed(&self, central: &mut CentralState, bid: u32, idx: u32) {
        let slot = &self.slots[idx as usize];
        debug_assert!(slot.system_ref.load(Ordering::Acquire));
        debug_assert!(slot.flags().contains(IoFlags::REAPED));
        debug_assert!(!slot.flags().intersects(
            IoFlags::DONE
                | IoFlags::INFLIGHT
                | IoFlags::MERGE
                | IoFlags::SHARED_FAILED
                | IoFlags::SOFT_FAILURE
        ));

        if slot.user_ref.load(Ordering::Acquire) {
            slot.system_ref.store(false, Ordering::Release);
            let owner = slot.owner();

            if owner != bid {
                let other = &self.backends[owner as usize];
                let mut foreign = other.foreign_completed.lock();
                foreign.push_tail(&self.slots, idx);
                gauge_inc(&other.foreign_completed_count);
                complete::note_foreign_completion(self, owner);
                slot.update_flags(
                    IoFlags::REAPED | IoFlags::IN_PROGRESS,
                    IoFlags::DONE | IoFlags::FOREIGN_DONE,
                );
            } else {
                slot.update_flags(IoFlags::REAPED | IoFlags::IN_PROGRESS, IoFlags::DONE);
                let backend = &self.backends[bid as usize];
                let mut local = backend.local.lock();
                local.local_completed.push_tail(&self.slots, idx);
                gauge_inc(&backend.local_completed_count);
            }
        } else {
            let owner = slot.owner();
            log::debug!("removing io {idx} from issued_abandoned at completion");
            central.abandoned[owner as usize].remove(&self.slots, idx);
            gauge_dec(&self.backends[owner as usize].abandoned_count);
            // The phase store below moves REAPED|IN_PROGRESS → UNUSED.
            self.reset_slot(central, None, idx);
        }
    }

    /// Reuse a DONE (or IDLE) slot without a round trip through the free
    /// pool. Requires the local callback to have run.
    pub(crate) fn recycle_slot(&self, bid: u32, idx: u32) {
        let slot = &self.slots[idx as usize];
        let flags = slot.flags();
        assert!(slot.user_ref.load(Ordering::Acquire));
        assert_eq!(slot.owner(), bid);
        assert!(!slot.system_ref.load(Ordering::Acquire));
        debug_assert_eq!(slot.merge_with.load(Ordering::Relaxed), NO_SLOT);
        debug_assert!(flags.intersects(IoFlags::IDLE | IoFlags::DONE));

        let bounce = slot.inner.lock().bounce.take();
        if let Some(bb) = bounce {
            self.release_bounce(BounceBuffer(bb));
        }

        if flags.contains(IoFlags::DONE) {
            debug_assert!(!flags.contains(IoFlags::FOREIGN_DONE));
            debug_assert!(flags.contains(IoFlags::LOCAL_CB_CALLED));
            slot.bump_generation();
        }
        slot.set_flags(IoFlags::IDLE);
        slot.set_result(0);
        slot.retries.store(0, Ordering::Relaxed);
        slot.inner.lock().local_cb = None;
    }

    // ── Preparation and staging ─────────────────────────────────────

    pub(crate) fn prepare_io(&self, bid: u32, idx: u32, payload: OpPayload) {
        let slot = &self.slots[idx as usize];
        let kind = payload.kind().expect("preparing an empty payload");
        assert_eq!(slot.flags(), IoFlags::IDLE, "slot not idle at prepare");
        assert!(slot.user_ref.load(Ordering::Acquire));
        debug_assert_eq!(slot.merge_with.load(Ordering::Relaxed), NO_SLOT);

        let backend = &self.backends[bid as usize];
        assert!(
            backend.pending() < self.config.submit_batch,
            "pending list over the batch limit"
        );

        slot.set_kind(Some(kind));
        slot.inner.lock().op = payload;
        slot.system_ref.store(true, Ordering::Release);
        slot.update_flags(IoFlags::IDLE, IoFlags::IN_PROGRESS | IoFlags::PENDING);

        let mut local = backend.local.lock();
        local.pending.push_tail(&self.slots, idx);
        gauge_inc(&backend.pending_count);
    }

    pub(crate) fn finish_io(&self, bid: u32) {
        if self.backends[bid as usize].pending() >= self.config.submit_batch {
            self.submit_pending(bid, true, false);
        }
    }

    // ── Submission ──────────────────────────────────────────────────

    pub(crate) fn submit_pending(&self, bid: u32, drain: bool, will_wait: bool) {
        let backend = &self.backends[bid as usize];
        if backend.pending() == 0 {
            return;
        }

        let orig_total = backend.pending() as u64;
        {
            let mut local = backend.local.lock();
            if local.pending.len() > 1 {
                merge::combine_pending(self, bid, &mut local);
            }
        }

        let mut total_submitted = 0u64;
        while backend.pending() > 0 {
            self.apply_backend_limit(bid);
            if backend.pending() == 0 {
                break;
            }

            let headroom = self
                .config
                .io_max_concurrency
                .saturating_sub(backend.inflight())
                .max(1);
            let max_submit = backend
                .pending()
                .min(self.config.submit_batch)
                .min(headroom) as usize;

            let did = self.driver.submit(self, bid, max_submit, will_wait);
            total_submitted += did as u64;
            if did == 0 {
                break;
            }
        }

        backend
            .totals
            .executed
            .fetch_add(orig_total, Ordering::Relaxed);
        backend
            .totals
            .issued
            .fetch_add(total_submitted, Ordering::Relaxed);
        metrics::EXECUTED_OPS.add(orig_total);
        metrics::SUBMITTED_ENTRIES.add(total_submitted);
        log::trace!("backend {bid}: submitted {total_submitted} (orig {orig_total})");

        if drain {
            let ctx = backend.last_context.load(Ordering::Relaxed) % self.driver.num_contexts();
            self.drain_one(bid, ctx, true);
        }
    }

    /// Enforce the per-backend in-flight cap by waiting on the oldest
    /// in-flight operation, preferring still-referenced ones.
    fn apply_backend_limit(&self, bid: u32) {
        let backend = &self.backends[bid as usize];
        let cap = self.config.io_max_concurrency;

        while backend.inflight() >= cap {
            let target = {
                let local = backend.local.lock();
                local
                    .issued
                    .iter(&self.slots)
                    .find(|&idx| self.slots[idx as usize].flags().contains(IoFlags::INFLIGHT))
                    .map(|idx| self.make_ref_internal(idx))
            };
            if let Some(r) = target {
                log::debug!(
                    "backend {bid}: at concurrency cap ({} in flight of {} submitted), \
                     waiting on issued io {}",
                    backend.inflight(),
                    backend.issued_count.load(Ordering::Relaxed)
                        + backend.abandoned_count.load(Ordering::Relaxed),
                    r.index
                );
                self.wait_ref(bid, r, false);
                if backend.inflight() < cap {
                    break;
                }
            }

            let target = {
                let central = self.central.lock();
                central.abandoned[bid as usize]
                    .iter(&self.slots)
                    .find(|&idx| self.slots[idx as usize].flags().contains(IoFlags::INFLIGHT))
                    .map(|idx| self.make_ref_internal(idx))
            };
            match target {
                Some(r) => {
                    log::debug!(
                        "backend {bid}: at concurrency cap, waiting on abandoned io {}",
                        r.index
                    );
                    self.wait_ref(bid, r, false);
                }
                None => {
                    // Nothing identifiably in flight; completions must be
                    // in the pipeline somewhere.
                    for ctx in 0..self.driver.num_contexts() {
                        self.drain_one(bid, ctx, false);
                    }
                }
            }
        }
    }

    /// Transition a chain from PENDING to INFLIGHT and settle owner-list
    /// membership. Called by drivers with `bid`'s list lock held, before
    /// the kernel call. Returns the number of chain members.
    pub(crate) fn prepare_submit(
        &self,
        bid: u32,
        local: &mut BackendLists,
        head: u32,
        context: u8,
    ) -> u32 {
        let backend = &self.backends[bid as usize];
        let mut members = 0;
        let mut cur = head;
        loop {
            let slot = &self.slots[cur as usize];
            debug_assert!(slot.flags().contains(IoFlags::PENDING));

            slot.set_context(context);
            slot.update_flags(IoFlags::PENDING, IoFlags::INFLIGHT);
            local.pending.remove(&self.slots, cur);
            gauge_dec(&backend.pending_count);

            let flags = slot.flags();
            if flags.contains(IoFlags::RETRY) {
                // Owner-list membership was settled on first submission.
            } else if slot.user_ref.load(Ordering::Acquire) {
                debug_assert_eq!(slot.owner(), bid);
                local.outstanding.remove(&self.slots, cur);
                gauge_dec(&backend.outstanding_count);
                local.issued.push_tail(&self.slots, cur);
                gauge_inc(&backend.issued_count);
            } else {
                log::debug!("io {cur} abandoned at submit");
                let owner = slot.owner();
                let mut central = self.central.lock();
                central.abandoned[owner as usize].push_tail(&self.slots, cur);
                gauge_inc(&self.backends[owner as usize].abandoned_count);
            }

            self.backends[slot.owner() as usize]
                .inflight
                .fetch_add(1, Ordering::AcqRel);

            members += 1;
            let next = slot.merge_with.load(Ordering::Relaxed);
            if next == NO_SLOT {
                break;
            }
            cur = next;
        }
        members
    }

    /// Wake waiters of every member of a submitted chain. Waiters may have
    /// gone to sleep while the ops were still PENDING.
    pub(crate) fn wake_chain(&self, head: u32) {
        let mut cur = head;
        loop {
            let slot = &self.slots[cur as usize];
            slot.wake_waiters();
            let next = slot.merge_with.load(Ordering::Relaxed);
            if next == NO_SLOT {
                break;
            }
            cur = next;
        }
    }

    // ── Draining and waiting ────────────────────────────────────────

    /// One pass of the completion pipeline: collect driver completions
    /// (each arrives already split, with in-flight accounting settled),
    /// run shared callbacks, pull foreign completions, and optionally
    /// deliver local callbacks.
    pub(crate) fn drain_one(&self, bid: u32, context: u32, call_local: bool) -> usize {
        let n = self.driver.drain(self, bid, context);
        if n > 0 {
            metrics::DRAINED_COMPLETIONS.add(n as u64);
        }
        complete::complete_ios(self, bid);
        complete::transfer_foreign_to_local(self, bid);
        if call_local {
            complete::call_local_callbacks(self, bid);
        }
        n
    }

    pub(crate) fn make_ref_internal(&self, idx: u32) -> IoRef {
        IoRef {
            index: idx,
            generation: self.slots[idx as usize].generation(),
        }
    }

    /// Wait until the referenced operation has completed from the caller's
    /// point of view. See the module docs for the full protocol; in short:
    /// generation mismatch returns immediately, the owner first submits its
    /// own pending work, and the wait alternates between draining the
    /// driver and sleeping on the slot.
    pub(crate) fn wait_ref(&self, bid: u32, r: IoRef, call_local: bool) {
        let slot = &self.slots[r.index()];
        debug_assert_ne!(r.generation, 0);

        'retried: loop {
            if slot.generation() != r.generation {
                return;
            }
            let am_owner = slot.owner() == bid;
            if am_owner && slot.flags().contains(IoFlags::PENDING) {
                self.submit_pending(bid, false, false);
            }

            loop {
                if slot.generation() != r.generation {
                    return;
                }
                if slot.flags().contains(IoFlags::DONE) {
                    break;
                }

                let ctx = slot.context();
                let ctx = if ctx == NO_CONTEXT { 0 } else { ctx as u32 };
                self.drain_one(bid, ctx, call_local);

                if slot.generation() != r.generation {
                    return;
                }
                let flags = slot.flags();
                if flags.contains(IoFlags::DONE) {
                    break;
                }

                if call_local && self.backends[bid as usize].pending() > 0 {
                    // About to sleep: push our own staged work out first so
                    // nobody ends up waiting on us.
                    self.submit_pending(bid, false, false);
                } else if flags.contains(IoFlags::INFLIGHT) {
                    self.driver.wait_one(self, bid, r.index, r.generation);
                } else {
                    // PENDING in another backend, or between states; the
                    // completion can only reach us via someone else.
                    slot.sleep_on(
                        || slot.generation() == r.generation && !slot.flags().contains(IoFlags::DONE),
                        Some(FOREIGN_WAIT),
                    );
                }
            }

            if slot.generation() != r.generation {
                return;
            }
            let flags = slot.flags();
            debug_assert!(flags.contains(IoFlags::DONE));

            if flags.intersects(IoFlags::SOFT_FAILURE | IoFlags::HARD_FAILURE) {
                if flags.contains(IoFlags::SOFT_FAILURE) {
                    self.retry_io(bid, r.index);
                    continue 'retried;
                }
                log::warn!(
                    "io {} failed permanently: {}",
                    r.index,
                    crate::introspect::slot_info(self, r.index())
                );
                return;
            }

            if am_owner && call_local && !flags.contains(IoFlags::LOCAL_CB_CALLED) {
                let backend = &self.backends[bid as usize];
                let mut was_foreign = false;
                if slot.flags().contains(IoFlags::FOREIGN_DONE) {
                    let mut foreign = backend.foreign_completed.lock();
                    foreign.remove(&self.slots, r.index);
                    gauge_dec(&backend.foreign_completed_count);
                    slot.update_flags(IoFlags::FOREIGN_DONE, IoFlags::empty());
                    was_foreign = true;
                }
                if !was_foreign {
                    let mut local = backend.local.lock();
                    local.local_completed.remove(&self.slots, r.index);
                    gauge_dec(&backend.local_completed_count);
                }
                complete::call_local_callback(self, bid, r.index);
            }
            return;
        }
    }

    // ── Retry ───────────────────────────────────────────────────────

    /// Re-queue a soft-failed operation, reopening its descriptor from the
    /// identifying tag. Panics for op types that may not be retried.
    pub(crate) fn retry_io(&self, bid: u32, idx: u32) {
        let slot = &self.slots[idx as usize];
        let kind = slot.kind().expect("retrying an empty slot");
        assert!(kind.retryable(), "op type {kind} cannot be retried");

        let need_retry = {
            let mut central = self.central.lock();
            // Could have been concurrently retried or cleared.
            if slot.flags().contains(IoFlags::SHARED_FAILED) {
                debug_assert!(!slot.flags().contains(IoFlags::FOREIGN_DONE));
                central.reaped_uncompleted.remove(&self.slots, idx);
                slot.update_flags(
                    IoFlags::SHARED_FAILED
                        | IoFlags::DONE
                        | IoFlags::SHARED_CB_CALLED
                        | IoFlags::LOCAL_CB_CALLED
                        | IoFlags::HARD_FAILURE
                        | IoFlags::SOFT_FAILURE,
                    IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::RETRY,
                );
                true
            } else {
                false
            }
        };
        if !need_retry {
            log::debug!("io {idx}: retry already picked up elsewhere");
            return;
        }

        // The stored descriptor may belong to another backend or have been
        // closed; always reopen from the tag.
        let reopened = self.reopen_for_retry(idx);
        if let Err(err) = reopened {
            log::warn!("io {idx}: {err}; abandoning retry");
            let mut central = self.central.lock();
            slot.update_flags(
                IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::RETRY,
                IoFlags::DONE
                    | IoFlags::HARD_FAILURE
                    | IoFlags::SHARED_FAILED
                    | IoFlags::SHARED_CB_CALLED,
            );
            central.reaped_uncompleted.push_tail(&self.slots, idx);
            drop(central);
            slot.wake_waiters();
            return;
        }

        let backend = &self.backends[bid as usize];
        {
            let mut local = backend.local.lock();
            local.pending.push_tail(&self.slots, idx);
            gauge_inc(&backend.pending_count);
        }
        backend.totals.retries.fetch_add(1, Ordering::Relaxed);
        metrics::RETRIES.increment();

        self.submit_pending(bid, true, false);
    }

    fn reopen_for_retry(&self, idx: u32) -> Result<(), Error> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| Error::Reopen(io::Error::other("no file resolver installed")))?;

        let slot = &self.slots[idx as usize];
        let mut inner = slot.inner.lock();
        match &mut inner.op {
            OpPayload::ReadBuffer(op) => {
                op.fd = resolver.reopen_buffered(&op.tag).map_err(Error::Reopen)?;
            }
            OpPayload::WriteBuffer(op) => {
                op.fd = resolver.reopen_buffered(&op.tag).map_err(Error::Reopen)?;
            }
            _ => unreachable!("retry of non-retryable payload"),
        }
        Ok(())
    }

    // ── Status predicates ───────────────────────────────────────────

    pub(crate) fn io_done(&self, bid: u32, idx: u32) -> bool {
        let slot = &self.slots[idx as usize];
        debug_assert!(slot.user_ref.load(Ordering::Acquire));
        let flags = slot.flags();
        debug_assert!(!flags.contains(IoFlags::UNUSED));

        if flags.contains(IoFlags::SOFT_FAILURE) {
            return false;
        }
        if flags.intersects(IoFlags::IDLE | IoFlags::HARD_FAILURE) {
            return true;
        }
        if flags.contains(IoFlags::DONE) {
            // For the initiator, completion includes the local callback.
            return slot.owner() != bid || flags.contains(IoFlags::LOCAL_CB_CALLED);
        }
        false
    }

    pub(crate) fn io_successful(&self, idx: u32) -> bool {
        let slot = &self.slots[idx as usize];
        debug_assert!(slot.user_ref.load(Ordering::Acquire));
        let flags = slot.flags();
        debug_assert!(flags.contains(IoFlags::DONE));
        flags.contains(IoFlags::SHARED_CB_CALLED)
            && !flags.intersects(IoFlags::HARD_FAILURE | IoFlags::SOFT_FAILURE)
    }

    // ── Bounce buffers ──────────────────────────────────────────────

    pub(crate) fn acquire_bounce(&self, bid: u32) -> BounceBuffer {
        assert!(self.bounce.count() > 0, "engine has no bounce buffers");
        loop {
            {
                let mut central = self.central.lock();
                if let Some(idx) = central.unused_bounce.pop() {
                    self.bounce.activate(idx);
                    metrics::BOUNCE_IN_USE.increment();
                    return BounceBuffer(idx);
                }
            }
            log::debug!("backend {bid}: bounce pool empty, draining");
            for ctx in 0..self.driver.num_contexts() {
                self.drain_one(bid, ctx, true);
            }
        }
    }

    pub(crate) fn release_bounce(&self, bb: BounceBuffer) {
        if self.bounce.drop_ref(bb.0) {
            let mut central = self.central.lock();
            central.unused_bounce.push(bb.0);
            metrics::BOUNCE_IN_USE.decrement();
        }
    }

    fn release_bounce_locked(&self, central: &mut CentralState, bb: BounceBuffer) {
        if self.bounce.drop_ref(bb.0) {
            central.unused_bounce.push(bb.0);
            metrics::BOUNCE_IN_USE.decrement();
        }
    }

    pub(crate) fn associate_bounce(&self, idx: u32, bb: BounceBuffer) {
        let slot = &self.slots[idx as usize];
        assert_eq!(slot.flags(), IoFlags::IDLE);
        assert!(slot.user_ref.load(Ordering::Acquire));
        debug_assert!(self.bounce.refcount(bb.0) > 0);

        let mut inner = slot.inner.lock();
        assert!(inner.bounce.is_none(), "slot already has a bounce buffer");
        self.bounce.add_ref(bb.0);
        inner.bounce = Some(bb.0);
    }

    // ── Backend exit ────────────────────────────────────────────────

    /// Wind a backend down: flush staged work, wait for everything it
    /// still references, release it, and wait out abandoned submissions.
    fn backend_exit(&self, bid: u32) {
        let backend = &self.backends[bid as usize];

        self.submit_pending(bid, true, false);

        // Wait for every submitted operation we still reference, then drop
        // the reference. Permanently failed ones come back DONE as well;
        // releasing afterwards unhooks them from whichever completion list
        // still holds them.
        loop {
            let idx = {
                let local = backend.local.lock();
                local.issued.front()
            };
            match idx {
                Some(idx) => {
                    let r = self.make_ref_internal(idx);
                    self.wait_ref(bid, r, true);
                    self.release_slot(bid, idx);
                }
                None => break,
            }
        }

        loop {
            let idx = {
                let local = backend.local.lock();
                local.outstanding.front()
            };
            match idx {
                Some(idx) => self.release_slot(bid, idx),
                None => break,
            }
        }

        // Abandoned submissions: capture a reference under the central
        // mutex and wait by it. Permanently failed ones are reclaimed here;
        // nobody else will.
        loop {
            let action = {
                let mut central = self.central.lock();
                match central.abandoned[bid as usize].front() {
                    None => None,
                    Some(idx) => {
                        let slot = &self.slots[idx as usize];
                        if slot.flags().contains(IoFlags::SHARED_FAILED) {
                            central.abandoned[bid as usize].remove(&self.slots, idx);
                            gauge_dec(&backend.abandoned_count);
                            central.reaped_uncompleted.remove(&self.slots, idx);
                            self.reset_slot(&mut central, None, idx);
                            Some(None)
                        } else {
                            Some(Some(self.make_ref_internal(idx)))
                        }
                    }
                }
            };
            match action {
                None => break,
                Some(None) => continue,
                Some(Some(r)) => self.wait_ref(bid, r, false),
            }
        }

        complete::transfer_foreign_to_local(self, bid);
        debug_assert_eq!(backend.local_completed_count.load(Ordering::Acquire), 0);

        // Hand cached free slots back to the central pool.
        {
            let mut local = backend.local.lock();
            let mut central = self.central.lock();
            while let Some(idx) = local.unused.pop_head(&self.slots) {
                gauge_dec(&backend.unused_count);
                central.unused.push_tail(&self.slots, idx);
                debug_assert!(central.used_count > 0);
                central.used_count -= 1;
            }
            debug_assert!(local.outstanding.is_empty());
            debug_assert!(local.pending.is_empty());
            debug_assert!(local.issued.is_empty());
            debug_assert!(local.reaped.is_empty());
            debug_assert!(local.local_completed.is_empty());
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Backend handle ──────────────────────────────────────────────────

/// A registered backend: the per-thread entry point to the engine.
///
/// The handle is `Send` (hand it to the thread that will use it) but
/// deliberately not `Sync` — a backend belongs to exactly one thread.
/// Dropping it winds the backend down: staged work is submitted, every
/// still-referenced operation is waited for and released, and abandoned
/// submissions are waited out.
pub struct BackendHandle {
    engine: Arc<Engine>,
    bid: u32,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl BackendHandle {
    pub fn id(&self) -> u32 {
        self.bid
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Get an idle slot, draining completions if the free pool is empty.
    pub fn acquire(&self) -> IoHandle {
        self.engine.acquire_slot(self.bid)
    }

    /// Drop the user reference. The slot is recycled once the engine is
    /// done with it too.
    pub fn release(&self, io: IoHandle) {
        self.engine.release_slot(self.bid, io.0)
    }

    /// Reuse a completed slot for a new operation without releasing it.
    pub fn recycle(&self, io: IoHandle) {
        self.engine.recycle_slot(self.bid, io.0)
    }

    /// Capture a stable reference to the operation.
    pub fn io_ref(&self, io: IoHandle) -> IoRef {
        debug_assert!(self.engine.slots[io.index()].user_ref.load(Ordering::Acquire));
        self.engine.make_ref_internal(io.0)
    }

    /// Wait for an operation this backend initiated, delivering its local
    /// callback.
    pub fn wait(&self, io: IoHandle) {
        let r = self.io_ref(io);
        self.engine.wait_ref(self.bid, r, true);
    }

    /// Wait on any operation by reference; returns immediately if the slot
    /// has been reused since the reference was taken.
    pub fn wait_io_ref(&self, r: IoRef) {
        self.engine.wait_ref(self.bid, r, true);
    }

    /// The operation's raw result: negative errno, or bytes transferred.
    pub fn result(&self, io: IoHandle) -> i32 {
        self.engine.slots[io.index()].result()
    }

    /// Completed from this backend's point of view (including local
    /// callback delivery when this backend initiated it).
    pub fn is_done(&self, io: IoHandle) -> bool {
        self.engine.io_done(self.bid, io.0)
    }

    /// Completed without failure.
    pub fn is_successful(&self, io: IoHandle) -> bool {
        self.engine.io_successful(io.0)
    }

    /// Install a callback delivered in this backend once the operation
    /// completes. Must be called on an idle slot, before preparation.
    pub fn on_completion_local(&self, io: IoHandle, cb: LocalCallback) {
        let slot = &self.engine.slots[io.index()];
        assert_eq!(slot.flags(), IoFlags::IDLE);
        let mut inner = slot.inner.lock();
        assert!(inner.local_cb.is_none());
        inner.local_cb = Some(cb);
    }

    /// Submit everything staged on this backend's pending list.
    /// With `drain`, also run one pass of the completion pipeline.
    pub fn submit_pending(&self, drain: bool) {
        self.engine.submit_pending(self.bid, drain, false);
    }

    /// Submit staged work with a hint that the caller will immediately
    /// wait; drivers may execute a lone operation synchronously.
    pub fn submit_pending_before_wait(&self) {
        self.engine.submit_pending(self.bid, false, true);
    }

    // ── Operation starters ──────────────────────────────────────────

    pub fn start_nop(&self, io: IoHandle) {
        self.engine.prepare_io(self.bid, io.0, OpPayload::Nop);
        log::trace!("start_nop {}", io.0);
        self.engine.finish_io(self.bid);
    }

    pub fn start_fsync(&self, io: IoHandle, fd: RawFd, segment: Option<WalSegment>, barrier: bool) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::Fsync(FsyncOp {
                fd,
                segment,
                barrier,
                datasync: false,
            }),
        );
        log::trace!("start_fsync {}: fd {fd}, barrier: {barrier}", io.0);
        self.engine.finish_io(self.bid);
    }

    pub fn start_fdatasync(
        &self,
        io: IoHandle,
        fd: RawFd,
        segment: Option<WalSegment>,
        barrier: bool,
    ) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::Fsync(FsyncOp {
                fd,
                segment,
                barrier,
                datasync: true,
            }),
        );
        log::trace!("start_fdatasync {}: fd {fd}, barrier: {barrier}", io.0);
        self.engine.finish_io(self.bid);
    }

    pub fn start_fsync_wal(
        &self,
        io: IoHandle,
        fd: RawFd,
        segment: WalSegment,
        barrier: bool,
        datasync_only: bool,
        flush_no: u32,
    ) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::FsyncWal(FsyncWalOp {
                fd,
                segment: Some(segment),
                barrier,
                datasync: datasync_only,
                flush_no,
            }),
        );
        log::trace!(
            "start_fsync_wal {}: fd {fd}, barrier: {barrier}, datasync: {datasync_only}, flush_no: {flush_no}",
            io.0
        );
        self.engine.finish_io(self.bid);
    }

    pub fn start_flush_range(&self, io: IoHandle, fd: RawFd, offset: u64, nbytes: u64) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::FlushRange(FlushRangeOp { fd, offset, nbytes }),
        );
        log::trace!("start_flush_range {}: fd {fd}, {offset}, {nbytes}", io.0);
        self.engine.finish_io(self.bid);
    }

    /// Start a buffered block read into `data`.
    ///
    /// # Safety
    ///
    /// `data` must point to at least `nbytes` writable bytes that stay
    /// valid (and otherwise untouched) until the operation completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn start_read_buffer(
        &self,
        io: IoHandle,
        tag: &BufferTag,
        fd: RawFd,
        offset: u64,
        nbytes: u32,
        data: *mut u8,
        buffer_id: i32,
        mode: u8,
    ) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::ReadBuffer(ReadBufferOp {
                fd,
                offset,
                nbytes,
                already_done: 0,
                data,
                buffer_id,
                tag: *tag,
                mode,
            }),
        );
        log::trace!(
            "start_read_buffer {}: fd {fd}, off: {offset}, bytes: {nbytes}, buf: {buffer_id}, data {data:p}",
            io.0
        );
        self.engine.finish_io(self.bid);
    }

    /// Start a buffered block write from `data`.
    ///
    /// # Safety
    ///
    /// `data` must point to at least `nbytes` readable bytes that stay
    /// valid and unmodified until the operation completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn start_write_buffer(
        &self,
        io: IoHandle,
        tag: &BufferTag,
        fd: RawFd,
        offset: u64,
        nbytes: u32,
        data: *const u8,
        buffer_id: i32,
    ) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::WriteBuffer(WriteBufferOp {
                fd,
                offset,
                nbytes,
                already_done: 0,
                data,
                buffer_id,
                tag: *tag,
            }),
        );
        log::trace!(
            "start_write_buffer {}: fd {fd}, off: {offset}, bytes: {nbytes}, buf: {buffer_id}, data {data:p}",
            io.0
        );
        self.engine.finish_io(self.bid);
    }

    /// Start a WAL write. WAL writes are never merged and may request
    /// `no_reorder` ordering.
    ///
    /// # Safety
    ///
    /// `data` must point to at least `nbytes` readable bytes that stay
    /// valid and unmodified until the operation completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn start_write_wal(
        &self,
        io: IoHandle,
        fd: RawFd,
        segment: WalSegment,
        offset: u64,
        nbytes: u32,
        data: *const u8,
        no_reorder: bool,
        write_no: u32,
    ) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::WriteWal(WriteWalOp {
                fd,
                segment,
                offset,
                nbytes,
                already_done: 0,
                data,
                no_reorder,
                write_no,
            }),
        );
        log::trace!(
            "start_write_wal {}: fd {fd}, off: {offset}, bytes: {nbytes}, no_reorder: {no_reorder}",
            io.0
        );
        self.engine.finish_io(self.bid);
    }

    /// Start a write to an arbitrary descriptor.
    ///
    /// # Safety
    ///
    /// `data` must point to at least `nbytes` readable bytes that stay
    /// valid and unmodified until the operation completes.
    pub unsafe fn start_write_generic(
        &self,
        io: IoHandle,
        fd: RawFd,
        offset: u64,
        nbytes: u32,
        data: *const u8,
        no_reorder: bool,
    ) {
        self.engine.prepare_io(
            self.bid,
            io.0,
            OpPayload::WriteGeneric(WriteGenericOp {
                fd,
                offset,
                nbytes,
                already_done: 0,
                data,
                no_reorder,
            }),
        );
        log::trace!(
            "start_write_generic {}: fd {fd}, off: {offset}, bytes: {nbytes}, no_reorder: {no_reorder}",
            io.0
        );
        self.engine.finish_io(self.bid);
    }

    // ── Bounce buffers ──────────────────────────────────────────────

    /// Pop a bounce buffer (refcount 1), draining completions while the
    /// pool is empty.
    pub fn bounce_buffer_acquire(&self) -> BounceBuffer {
        self.engine.acquire_bounce(self.bid)
    }

    /// The buffer's storage.
    pub fn bounce_buffer_data(&self, bb: BounceBuffer) -> (*mut u8, usize) {
        (self.engine.bounce.data(bb.0), self.engine.bounce.buffer_size())
    }

    /// Associate the buffer with an idle slot; the slot holds its own
    /// reference until recycled or released.
    pub fn bounce_buffer_associate(&self, io: IoHandle, bb: BounceBuffer) {
        self.engine.associate_bounce(io.0, bb)
    }

    /// Drop one reference.
    pub fn bounce_buffer_release(&self, bb: BounceBuffer) {
        self.engine.release_bounce(bb)
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.engine.backend_exit(self.bid);
        self.engine.unregister_backend_id(self.bid);
    }
}
