//! Diagnostic readers over the engine's shared state.
//!
//! Two tabular views, mirroring what a monitoring surface would expose:
//! one row per registered backend (totals and gauges) and one row per
//! non-free slot (lifecycle flags, owner, generation, result, rendered op
//! parameters). Everything is read from atomics; no backend's locks are
//! taken, so values are individually, not mutually, consistent.

use std::fmt;
use std::sync::atomic::Ordering;

use crate::engine::Engine;
use crate::flags::IoFlags;
use crate::list::NO_SLOT;
use crate::slot::NO_OWNER;

/// One row of the per-backend statistics view.
#[derive(Debug, Clone)]
pub struct BackendStatsRow {
    pub backend_id: u32,
    pub executed_total: u64,
    pub issued_total: u64,
    pub submissions_total: u64,
    pub foreign_completed_total: u64,
    pub retry_total: u64,
    pub inflight: u32,
    pub unused: u32,
    pub outstanding: u32,
    pub pending: u32,
    pub local_completed: u32,
    pub foreign_completed: u32,
    pub last_context: u32,
}

impl fmt::Display for BackendStatsRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backend {}: executed: {}, issued: {}, submissions: {}, foreign: {}, retries: {}, \
             inflight: {}, unused: {}, outstanding: {}, pending: {}, local_completed: {}, \
             foreign_completed: {}, last_context: {}",
            self.backend_id,
            self.executed_total,
            self.issued_total,
            self.submissions_total,
            self.foreign_completed_total,
            self.retry_total,
            self.inflight,
            self.unused,
            self.outstanding,
            self.pending,
            self.local_completed,
            self.foreign_completed,
            self.last_context,
        )
    }
}

/// One row of the per-slot view.
#[derive(Debug, Clone)]
pub struct SlotRow {
    pub index: u32,
    pub op: &'static str,
    pub flags: String,
    pub context: u8,
    pub owner: Option<u32>,
    pub generation: u64,
    pub result: i32,
    pub params: String,
}

impl fmt::Display for SlotRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "aio {}/{}: action: {}, context: {}, init: {}, flags: {}, result: {} ({})",
            self.index,
            self.generation,
            self.op,
            self.context,
            self.owner.map_or(-1i64, |o| o as i64),
            self.flags,
            self.result,
            self.params,
        )
    }
}

impl Engine {
    /// Statistics for every registered backend.
    pub fn backend_stats(&self) -> Vec<BackendStatsRow> {
        self.backends
            .iter()
            .filter(|b| b.in_use.load(Ordering::Acquire))
            .map(|b| BackendStatsRow {
                backend_id: b.id,
                executed_total: b.totals.executed.load(Ordering::Relaxed),
                issued_total: b.totals.issued.load(Ordering::Relaxed),
                submissions_total: b.totals.submissions.load(Ordering::Relaxed),
                foreign_completed_total: b.totals.foreign_completed.load(Ordering::Relaxed),
                retry_total: b.totals.retries.load(Ordering::Relaxed),
                inflight: b.inflight(),
                unused: b.unused_count.load(Ordering::Relaxed),
                outstanding: b.outstanding_count.load(Ordering::Relaxed),
                pending: b.pending_count.load(Ordering::Relaxed),
                local_completed: b.local_completed_count.load(Ordering::Relaxed),
                foreign_completed: b.foreign_completed_count.load(Ordering::Relaxed),
                last_context: b.last_context.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// One row per slot that is not on the free pool.
    pub fn slot_rows(&self) -> Vec<SlotRow> {
        (0..self.slots.len())
            .filter(|&i| !self.slots[i].flags().contains(IoFlags::UNUSED))
            .map(|i| slot_row(self, i))
            .collect()
    }

    /// Summarize queue depths: per-backend in-flight counts and, per
    /// driver context, how many slots claim to be in flight there.
    pub fn dump_queues(&self) -> String {
        use std::fmt::Write;

        let inflight_backend: u32 = self.backends.iter().map(|b| b.inflight()).sum();
        let mut per_context = vec![0u32; self.driver.num_contexts() as usize];
        for slot in self.slots.iter() {
            if slot.flags().contains(IoFlags::INFLIGHT) {
                let ctx = slot.context() as usize;
                if ctx < per_context.len() {
                    per_context[ctx] += 1;
                }
            }
        }

        let mut out = format!(
            "driver: {}, inflight backend: {inflight_backend}",
            self.driver.kind().as_str()
        );
        for (ctx, count) in per_context.iter().enumerate() {
            let _ = write!(out, "\n\tqueue[{ctx}]: we think inflight: {count}");
        }
        out
    }
}

fn slot_row(engine: &Engine, idx: usize) -> SlotRow {
    let slot = &engine.slots[idx];
    let owner = slot.owner();
    let mut params = String::new();
    slot.inner.lock().op.describe(&mut params);
    SlotRow {
        index: idx as u32,
        op: slot.kind().map_or("invalid", |k| k.as_str()),
        flags: slot.flags().to_string(),
        context: slot.context(),
        owner: (owner != NO_OWNER).then_some(owner),
        generation: slot.generation(),
        result: slot.result(),
        params,
    }
}

/// Render one slot for log messages, including any merge chain.
pub(crate) fn slot_info(engine: &Engine, idx: usize) -> String {
    use std::fmt::Write;

    let mut out = slot_row(engine, idx).to_string();
    let mut cur = engine.slots[idx].merge_with.load(Ordering::Relaxed);
    let mut nummerge = 0;
    while cur != NO_SLOT {
        nummerge += 1;
        let _ = write!(out, "\n  merge {nummerge}: {}", slot_row(engine, cur as usize));
        cur = engine.slots[cur as usize].merge_with.load(Ordering::Relaxed);
    }
    out
}
