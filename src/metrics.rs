//! Engine-wide metrics.
//!
//! Process-level counters for submissions, merges, completions and
//! retries. Per-backend detail lives in the backend state and is exposed
//! through the introspection readers; these statics aggregate across all
//! backends for metric exporters.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "aiocore/ops/executed",
    description = "Logical operations submitted (before merging)"
)]
pub static EXECUTED_OPS: Counter = Counter::new();

#[metric(
    name = "aiocore/ops/merged",
    description = "Operations fused into a preceding kernel entry"
)]
pub static MERGED_OPS: Counter = Counter::new();

#[metric(
    name = "aiocore/submissions",
    description = "Kernel entries issued (merged chains count once)"
)]
pub static SUBMITTED_ENTRIES: Counter = Counter::new();

#[metric(
    name = "aiocore/submission_calls",
    description = "Driver submission calls"
)]
pub static SUBMISSION_CALLS: Counter = Counter::new();

#[metric(
    name = "aiocore/completions/drained",
    description = "Completions collected from the kernel"
)]
pub static DRAINED_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "aiocore/completions/foreign",
    description = "Completions observed by a backend other than the initiator"
)]
pub static FOREIGN_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "aiocore/retries",
    description = "Soft-failure retries re-queued"
)]
pub static RETRIES: Counter = Counter::new();

#[metric(
    name = "aiocore/slots/in_use",
    description = "Slots currently out of the free pool"
)]
pub static SLOTS_IN_USE: Gauge = Gauge::new();

#[metric(
    name = "aiocore/bounce_buffers/in_use",
    description = "Bounce buffers currently referenced"
)]
pub static BOUNCE_IN_USE: Gauge = Gauge::new();
