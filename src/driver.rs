//! The pluggable kernel driver seam.
//!
//! A driver turns staged operations into kernel submissions and kernel
//! completions into reaped slots. Everything above this trait (staging,
//! merging, the concurrency limiter, completion routing, retries) is
//! driver-agnostic.

use std::sync::Arc;

use crate::config::{Config, DriverKind};
use crate::engine::Engine;
use crate::error::Error;

pub(crate) trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Number of independent submission/completion contexts.
    fn num_contexts(&self) -> u32 {
        1
    }

    /// Whether merged chains may span non-contiguous memory. When false,
    /// the merge layer additionally requires adjacent buffers.
    fn can_scatter_gather(&self) -> bool;

    /// Install process-wide resources (worker threads, signal handlers,
    /// completion ports). Called once, after the engine is assembled.
    fn startup(&self, _engine: &Arc<Engine>) -> Result<(), Error> {
        Ok(())
    }

    /// Move up to `max_submit` chain heads from `bid`'s pending list into
    /// the kernel. Each chain head and every merge tail transitions
    /// PENDING→INFLIGHT (via `Engine::prepare_submit`) before the kernel
    /// call, and their condition variables are woken afterwards. Returns
    /// the number of kernel entries issued.
    fn submit(&self, engine: &Engine, bid: u32, max_submit: usize, will_wait: bool) -> usize;

    /// Collect available completions for `context` without blocking:
    /// store each result, flip INFLIGHT→REAPED, and append to `bid`'s
    /// reaped list. Returns the number of completions collected.
    fn drain(&self, engine: &Engine, bid: u32, context: u32) -> usize;

    /// Block until the referenced slot is plausibly no longer INFLIGHT or
    /// its generation has moved on. Spurious returns are fine; the waiter
    /// loops and re-drains.
    fn wait_one(&self, engine: &Engine, bid: u32, idx: u32, ref_generation: u64);

    /// Tear down driver resources. The engine guarantees no further
    /// submissions once this is called.
    fn shutdown(&self, engine: &Engine);
}

/// Instantiate the configured driver.
pub(crate) fn build(config: &Config) -> Result<Box<dyn Driver>, Error> {
    match config.driver {
        DriverKind::Worker => Ok(Box::new(crate::drivers::worker::WorkerDriver::new(config))),

        DriverKind::Uring => {
            #[cfg(all(target_os = "linux", feature = "uring"))]
            {
                Ok(Box::new(crate::drivers::uring::UringDriver::new(config)?))
            }
            #[cfg(not(all(target_os = "linux", feature = "uring")))]
            {
                Err(Error::DriverUnavailable(
                    "io_uring requires Linux and the `uring` feature",
                ))
            }
        }

        DriverKind::PosixAio => {
            #[cfg(all(unix, feature = "posix-aio"))]
            {
                Ok(Box::new(crate::drivers::posix::PosixAioDriver::new(config)))
            }
            #[cfg(not(all(unix, feature = "posix-aio")))]
            {
                Err(Error::DriverUnavailable(
                    "POSIX AIO requires a Unix platform and the `posix-aio` feature",
                ))
            }
        }

        DriverKind::CompletionPort => {
            #[cfg(windows)]
            {
                Ok(Box::new(crate::drivers::iocp::IocpDriver::new(config)?))
            }
            #[cfg(not(windows))]
            {
                Err(Error::DriverUnavailable("completion ports require Windows"))
            }
        }
    }
}
