//! aiocore — asynchronous I/O core for a shared-memory database server.
//!
//! The engine provides a uniform lifecycle for file I/O across several
//! kernel backends: a slot table with generation-tagged references, a
//! per-backend staging pipeline that fuses adjacent operations, a
//! per-backend concurrency cap, and completion routing that works even
//! when the backend observing a completion is not the one that initiated
//! the operation.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use aiocore::{ConfigBuilder, DriverKind, Engine};
//!
//! fn main() -> Result<(), aiocore::Error> {
//!     let config = ConfigBuilder::new()
//!         .driver(DriverKind::Worker)
//!         .workers(2)
//!         .build()?;
//!     let engine = Engine::create(config)?;
//!
//!     let backend = engine.register_backend()?;
//!     let io = backend.acquire();
//!     backend.start_nop(io);
//!     backend.submit_pending(true);
//!     backend.wait(io);
//!     assert!(backend.is_successful(io));
//!     backend.release(io);
//!
//!     drop(backend);
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Model
//!
//! Every participant ("backend") registers with the shared [`Engine`] and
//! runs on its own thread. A backend acquires a slot, prepares one of the
//! eight operation types on it, and stages it on its pending list;
//! submission fuses adjacent compatible operations and hands the chains to
//! the configured driver. Completions are reaped by whichever backend
//! drains first: it runs the operation's shared callback and routes the
//! slot back to its initiator (or straight to the free pool when the
//! initiator already released it).
//!
//! Slots are never addressed by pointer across backends. An [`IoRef`]
//! carries the slot's generation; after the slot is recycled, waiting on
//! the stale reference simply reports completion.
//!
//! # Drivers
//!
//! * [`DriverKind::Worker`] — portable fallback; worker threads perform
//!   the I/O synchronously.
//! * [`DriverKind::Uring`] — Linux io_uring with multiple ring contexts.
//! * [`DriverKind::PosixAio`] — POSIX AIO with signal-driven completion.
//! * [`DriverKind::CompletionPort`] — Windows I/O completion port.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod backend;
pub(crate) mod driver;
pub(crate) mod drivers;
pub(crate) mod list;
pub(crate) mod merge;
pub(crate) mod spin;
pub(crate) mod squeue;

// ── Public modules ──────────────────────────────────────────────────
pub mod bounce;
pub mod complete;
pub mod config;
pub mod engine;
pub mod error;
pub mod flags;
pub mod introspect;
pub mod metrics;
pub mod ops;
pub mod slot;

// ── Re-exports ──────────────────────────────────────────────────────

/// Handle to an acquired bounce buffer.
pub use bounce::BounceBuffer;
/// Context handed to shared completion callbacks.
pub use complete::{CompletionContext, SharedCompletionFn};
/// Engine configuration.
pub use config::{Config, ConfigBuilder, DriverKind, MemoryRegion};
/// The engine and its per-thread entry points.
pub use engine::{BackendHandle, Engine, EngineBuilder, FileResolver};
/// Setup and administrative errors.
pub use error::Error;
/// Per-slot lifecycle flags.
pub use flags::IoFlags;
/// Introspection rows.
pub use introspect::{BackendStatsRow, SlotRow};
/// Operation descriptors.
pub use ops::{BufferTag, OpKind, WalSegment};
/// Slot tokens and stable references.
pub use slot::{IoHandle, IoRef, LocalCallback};
