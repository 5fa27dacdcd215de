//! Completion processing: chain splitting, shared callbacks, routing.
//!
//! Whichever backend reaps a completion runs this machinery, initiator or
//! not. Merged chains are first split back into their member operations,
//! with the kernel result distributed prefix-wise. Each operation then gets
//! its shared (op-type) callback; depending on the verdict the slot is
//! recycled, routed to its initiator for local-callback delivery, or parked
//! for the retry path.

use std::sync::atomic::Ordering;

use crate::engine::Engine;
use crate::flags::IoFlags;
use crate::list::NO_SLOT;
use crate::metrics;
use crate::ops::{OP_KIND_SLOTS, OpKind, OpPayload};
use crate::slot::NO_OWNER;

/// Completions are signalled in bounded groups so condition variables are
/// broadcast outside the central mutex.
const WAKE_BATCH: usize = 32;

/// Shared completion callback: returns true when the operation is finished
/// (successfully or permanently failed), false to send it down the retry
/// path. Addressed by `OpKind` discriminant so all backends agree on the
/// callback regardless of address-space layout.
pub type SharedCompletionFn = fn(&CompletionContext<'_>) -> bool;

/// What a shared callback may see and do with the completed operation.
pub struct CompletionContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) idx: u32,
}

impl CompletionContext<'_> {
    pub fn kind(&self) -> Option<OpKind> {
        self.engine.slots[self.idx as usize].kind()
    }

    /// Kernel result: negative errno or transferred byte count.
    pub fn result(&self) -> i32 {
        self.engine.slots[self.idx as usize].result()
    }

    /// Snapshot of the op parameters.
    pub fn op(&self) -> OpPayload {
        self.engine.slots[self.idx as usize].inner.lock().op
    }

    /// Mutate the op parameters (progress accounting for short transfers).
    pub fn update_op(&self, f: impl FnOnce(&mut OpPayload)) {
        f(&mut self.engine.slots[self.idx as usize].inner.lock().op)
    }

    pub fn retries(&self) -> u32 {
        self.engine.slots[self.idx as usize]
            .retries
            .load(Ordering::Relaxed)
    }

    pub fn max_retries(&self) -> u32 {
        self.engine.config.max_retries
    }

    /// Flag the operation as partially failed; the engine will offer it to
    /// the retry path instead of finishing it. The callback must also
    /// return false.
    pub fn mark_soft_failure(&self) {
        let slot = &self.engine.slots[self.idx as usize];
        slot.retries.fetch_add(1, Ordering::Relaxed);
        slot.update_flags(IoFlags::empty(), IoFlags::SOFT_FAILURE);
    }

    /// Flag the operation as permanently failed. The callback returns true;
    /// the waiter surfaces the failure.
    pub fn mark_hard_failure(&self) {
        let slot = &self.engine.slots[self.idx as usize];
        slot.update_flags(IoFlags::empty(), IoFlags::HARD_FAILURE);
    }
}

// ── Chain splitting ─────────────────────────────────────────────────

/// Split one merged chain whose head `head` sits on `bid`'s reaped list,
/// assigning each member its share of the head's kernel result.
///
/// A non-negative result is consumed in pending-list order: each member
/// receives its full declared length until the running remainder falls
/// short, the first short member receives the remainder, and everything
/// after receives zero. A negative result is copied to every member.
pub(crate) fn split_chain(engine: &Engine, bid: u32, head: u32) {
    let slots = &engine.slots;
    let orig_result = slots[head as usize].result();
    let mut running = orig_result.max(0);

    let mut cur = head;
    let mut prev: Option<u32> = None;
    loop {
        let slot = &slots[cur as usize];
        debug_assert!(!slot.flags().contains(IoFlags::SHARED_CB_CALLED));

        let declared = slot.inner.lock().op.remaining().unwrap_or(0) as i32;
        let assigned = if orig_result < 0 {
            orig_result
        } else if running >= declared {
            running -= declared;
            declared
        } else {
            let r = running;
            running = 0;
            r
        };
        slot.set_result(assigned);

        let next = slot.merge_with.swap(NO_SLOT, Ordering::Relaxed);

        if let Some(prev_idx) = prev {
            // Members re-enter the reaped list right behind their
            // predecessor, preserving the original submission order.
            slot.update_flags(
                IoFlags::INFLIGHT | IoFlags::MERGE,
                IoFlags::REAPED | IoFlags::IN_PROGRESS,
            );
            let backend = &engine.backends[bid as usize];
            let mut local = backend.local.lock();
            local.reaped.insert_after(slots, prev_idx, cur);
        } else {
            slot.update_flags(IoFlags::MERGE, IoFlags::empty());
        }

        prev = Some(cur);
        if next == NO_SLOT {
            break;
        }
        cur = next;
    }
}

/// Settle one freshly reaped chain: re-expand it onto `bid`'s reaped list
/// and decrement the initiators' in-flight counts, one per member. Called
/// exactly once per chain by whichever path collected the completion, with
/// the head already on the reaped list.
pub(crate) fn settle_chain(engine: &Engine, bid: u32, head: u32) {
    let members: Vec<u32> = {
        let mut v = Vec::new();
        let mut cur = head;
        loop {
            v.push(cur);
            let next = engine.slots[cur as usize].merge_with.load(Ordering::Relaxed);
            if next == NO_SLOT {
                break;
            }
            cur = next;
        }
        v
    };

    if engine.slots[head as usize].flags().contains(IoFlags::MERGE) {
        split_chain(engine, bid, head);
    }

    for &idx in &members {
        let owner = engine.slots[idx as usize].owner();
        debug_assert_ne!(owner, NO_OWNER);
        engine.backends[owner as usize]
            .inflight
            .fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Shared-callback dispatch ────────────────────────────────────────

/// Run shared callbacks for everything on `bid`'s reaped list, then recycle
/// or route each slot.
pub(crate) fn complete_ios(engine: &Engine, bid: u32) {
    let backend = &engine.backends[bid as usize];
    let mut recycle: Vec<u32> = Vec::new();

    loop {
        let idx = {
            let mut local = backend.local.lock();
            match local.reaped.pop_head(&engine.slots) {
                Some(idx) => idx,
                None => break,
            }
        };
        let slot = &engine.slots[idx as usize];
        debug_assert!(slot.flags().contains(IoFlags::REAPED));

        // Set the flag before calling: a callback that drains would
        // otherwise loop forever on its own slot.
        slot.update_flags(IoFlags::empty(), IoFlags::SHARED_CB_CALLED);

        let kind = slot.kind().expect("reaped slot without an operation");
        let cb = engine.callbacks[kind as usize];
        let finished = cb(&CompletionContext { engine, idx });

        if finished {
            recycle.push(idx);
        } else {
            let flags = slot.flags();
            assert!(
                flags.intersects(IoFlags::SOFT_FAILURE | IoFlags::HARD_FAILURE),
                "shared callback returned unfinished without failure flags"
            );
            let mut central = engine.central.lock();
            slot.update_flags(
                IoFlags::REAPED | IoFlags::IN_PROGRESS,
                IoFlags::DONE | IoFlags::SHARED_FAILED,
            );
            central.reaped_uncompleted.push_tail(&engine.slots, idx);
            drop(central);
            slot.wake_waiters();
        }
    }

    // Release the system reference on the finished ones, routing each to
    // its initiator or straight back to the free pool.
    for chunk in recycle.chunks(WAKE_BATCH) {
        {
            let mut central = engine.central.lock();
            for &idx in chunk {
                engine.recycle_completed(&mut central, bid, idx);
            }
        }
        for &idx in chunk {
            engine.slots[idx as usize].wake_waiters();
        }
    }
}

/// Pull completions other backends routed to us into the local-completed
/// list.
pub(crate) fn transfer_foreign_to_local(engine: &Engine, bid: u32) {
    let backend = &engine.backends[bid as usize];
    if backend.foreign_completed_count.load(Ordering::Acquire) == 0 {
        return;
    }

    let mut local = backend.local.lock();
    let mut foreign = backend.foreign_completed.lock();
    while let Some(idx) = foreign.pop_head(&engine.slots) {
        let slot = &engine.slots[idx as usize];
        debug_assert!(!slot.flags().contains(IoFlags::LOCAL_CB_CALLED));
        slot.update_flags(IoFlags::FOREIGN_DONE, IoFlags::empty());
        crate::backend::gauge_dec(&backend.foreign_completed_count);
        local.local_completed.push_tail(&engine.slots, idx);
        crate::backend::gauge_inc(&backend.local_completed_count);
    }
}

/// Deliver local callbacks for everything on `bid`'s local-completed list.
/// Serialized per backend; reentrant calls return immediately.
pub(crate) fn call_local_callbacks(engine: &Engine, bid: u32) {
    let backend = &engine.backends[bid as usize];
    if backend.local_completed_count.load(Ordering::Acquire) == 0 {
        return;
    }
    if backend.local_cb_depth.fetch_add(1, Ordering::AcqRel) != 0 {
        backend.local_cb_depth.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    loop {
        let idx = {
            let mut local = backend.local.lock();
            match local.local_completed.pop_head(&engine.slots) {
                Some(idx) => {
                    crate::backend::gauge_dec(&backend.local_completed_count);
                    Some(idx)
                }
                None => None,
            }
        };
        let Some(idx) = idx else { break };
        call_local_callback(engine, bid, idx);
    }

    backend.local_cb_depth.fetch_sub(1, Ordering::AcqRel);
}

/// Invoke the per-slot local callback (if any) and move the slot back to
/// the outstanding list. Caller has removed the slot from whichever
/// completion list held it.
pub(crate) fn call_local_callback(engine: &Engine, bid: u32, idx: u32) {
    let backend = &engine.backends[bid as usize];
    let slot = &engine.slots[idx as usize];
    debug_assert!(!slot.flags().contains(IoFlags::LOCAL_CB_CALLED));
    debug_assert!(slot.user_ref.load(Ordering::Acquire));
    debug_assert_eq!(slot.owner(), bid);

    {
        let mut local = backend.local.lock();
        local.issued.remove(&engine.slots, idx);
        crate::backend::gauge_dec(&backend.issued_count);
        local.outstanding.push_tail(&engine.slots, idx);
        crate::backend::gauge_inc(&backend.outstanding_count);
    }

    slot.update_flags(IoFlags::empty(), IoFlags::LOCAL_CB_CALLED);

    let cb = slot.inner.lock().local_cb.take();
    if let Some(cb) = cb {
        cb(slot.result());
    }
}

// ── Default shared callbacks ────────────────────────────────────────

pub(crate) fn default_callbacks() -> [SharedCompletionFn; OP_KIND_SLOTS] {
    let mut table: [SharedCompletionFn; OP_KIND_SLOTS] = [complete_nop; OP_KIND_SLOTS];
    table[OpKind::Nop as usize] = complete_nop;
    table[OpKind::Fsync as usize] = complete_fsync;
    table[OpKind::FsyncWal as usize] = complete_fsync;
    table[OpKind::FlushRange as usize] = complete_flush_range;
    table[OpKind::ReadBuffer as usize] = complete_transfer_retryable;
    table[OpKind::WriteBuffer as usize] = complete_transfer_retryable;
    table[OpKind::WriteWal as usize] = complete_transfer_strict;
    table[OpKind::WriteGeneric as usize] = complete_transfer_strict;
    table
}

fn complete_nop(_cx: &CompletionContext<'_>) -> bool {
    log::trace!("completed nop");
    true
}

fn complete_fsync(cx: &CompletionContext<'_>) -> bool {
    if cx.result() != 0 {
        log::warn!(
            "fsync failed: {}",
            std::io::Error::from_raw_os_error(-cx.result())
        );
        cx.mark_hard_failure();
    }
    true
}

fn complete_flush_range(cx: &CompletionContext<'_>) -> bool {
    log::trace!("completed flush_range: {}", cx.result());
    true
}

/// Buffer reads/writes: short transfers and EAGAIN/EINTR go down the retry
/// path until the retry cap converts them into permanent failures.
fn complete_transfer_retryable(cx: &CompletionContext<'_>) -> bool {
    let result = cx.result();
    let expected = cx.op().remaining().unwrap_or(0) as i32;

    if result == expected {
        cx.update_op(|op| op.add_already_done(result as u32));
        return true;
    }

    if result < 0 {
        if (result == -libc::EAGAIN || result == -libc::EINTR) && cx.retries() < cx.max_retries() {
            cx.mark_soft_failure();
            return false;
        }
        log::warn!(
            "i/o failed permanently after {} retries: {}",
            cx.retries(),
            std::io::Error::from_raw_os_error(-result)
        );
        cx.mark_hard_failure();
        return true;
    }

    // Short transfer. Common and harmless for reads spanning a page-cache
    // boundary, so no warning; account the progress and go again.
    if cx.retries() < cx.max_retries() {
        cx.update_op(|op| op.add_already_done(result as u32));
        log::debug!("short transfer ({result} of {expected} bytes), retrying");
        cx.mark_soft_failure();
        return false;
    }

    log::warn!("short transfer ({result} of {expected} bytes), retry limit reached");
    cx.mark_hard_failure();
    true
}

/// WAL and generic writes are not retryable; anything but a full transfer
/// is a permanent failure the waiter must surface.
fn complete_transfer_strict(cx: &CompletionContext<'_>) -> bool {
    let result = cx.result();
    let expected = cx.op().remaining().unwrap_or(0) as i32;

    if result == expected {
        cx.update_op(|op| op.add_already_done(result as u32));
        return true;
    }

    if result < 0 {
        log::warn!(
            "log write failed: {}",
            std::io::Error::from_raw_os_error(-result)
        );
    } else {
        log::warn!("log write short: wrote only {result} of {expected} bytes");
    }
    cx.mark_hard_failure();
    true
}

// ── Metrics hook ────────────────────────────────────────────────────

pub(crate) fn note_foreign_completion(engine: &Engine, owner: u32) {
    engine.backends[owner as usize]
        .totals
        .foreign_completed
        .fetch_add(1, Ordering::Relaxed);
    metrics::FOREIGN_COMPLETIONS.increment();
}
