use crate::error::Error;

/// Which kernel backend executes submitted I/O.
///
/// Which variants are actually available depends on the platform and the
/// enabled cargo features; constructing an engine with an unavailable kind
/// fails with [`Error::DriverUnavailable`](crate::Error::DriverUnavailable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Portable fallback: worker threads executing I/O synchronously.
    Worker,
    /// Linux io_uring, multiple independent ring contexts.
    Uring,
    /// POSIX AIO with signal-driven completion.
    PosixAio,
    /// Windows I/O completion port.
    CompletionPort,
}

impl DriverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverKind::Worker => "worker",
            DriverKind::Uring => "io_uring",
            DriverKind::PosixAio => "posix",
            DriverKind::CompletionPort => "completion_port",
        }
    }
}

/// A caller-owned memory region the worker driver treats as shared memory
/// (e.g., the buffer pool arena). Operations whose data lies outside every
/// registered region are executed synchronously by the submitting backend,
/// since worker backends cannot reach private memory.
#[derive(Clone, Copy)]
pub struct MemoryRegion {
    pub ptr: *mut u8,
    pub len: usize,
}

// Safety: regions are managed by the caller and must outlive the engine.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Whether `[ptr, ptr+len)` falls entirely within this region.
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let start = self.ptr as usize;
        let end = start + self.len;
        let p = ptr as usize;
        p >= start && p.checked_add(len).is_some_and(|e| e <= end)
    }
}

/// Configuration for the I/O engine.
#[derive(Clone)]
pub struct Config {
    /// Which kernel backend to use.
    pub driver: DriverKind,
    /// Size of the shared slot table.
    pub max_io_slots: u32,
    /// Maximum in-flight operations per driver context.
    pub max_in_flight: u32,
    /// Number of shared bounce buffers.
    pub max_bounce_buffers: u32,
    /// Size of each bounce buffer in bytes (page aligned).
    pub bounce_buffer_size: u32,
    /// Per-backend cap on in-flight operations. Submission blocks on the
    /// oldest in-flight operation when the cap is reached.
    pub io_max_concurrency: u32,
    /// Staged operations are force-submitted when the pending list reaches
    /// this length.
    pub submit_batch: u32,
    /// Maximum number of operations fused into one kernel submission.
    pub max_combine: u32,
    /// Soft-failure retries per slot before the failure becomes permanent.
    pub max_retries: u32,
    /// Number of independent driver contexts (ring instances).
    pub num_contexts: u32,
    /// Worker driver: capacity of the shared submission queue.
    pub worker_queue_size: u32,
    /// Worker driver: number of worker threads. With zero workers every
    /// operation is executed synchronously by the submitting backend.
    pub workers: u32,
    /// Maximum number of registered backends.
    pub max_backends: u32,
    /// Memory regions considered shared for the worker driver's
    /// private-memory check. Empty means nothing is shared and the worker
    /// driver always falls back to synchronous execution.
    pub shared_regions: Vec<MemoryRegion>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverKind::Worker,
            max_io_slots: 4096,
            max_in_flight: 1024,
            max_bounce_buffers: 256,
            bounce_buffer_size: 8192,
            io_max_concurrency: 128,
            submit_batch: 256,
            max_combine: 16,
            max_retries: 8,
            num_contexts: 8,
            worker_queue_size: 512,
            workers: 4,
            max_backends: 32,
            shared_regions: Vec::new(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_io_slots == 0 || self.max_io_slots == u32::MAX {
            return Err(Error::Config("max_io_slots must be > 0".into()));
        }
        if self.max_backends == 0 {
            return Err(Error::Config("max_backends must be > 0".into()));
        }
        if self.io_max_concurrency == 0 {
            return Err(Error::Config("io_max_concurrency must be > 0".into()));
        }
        if self.submit_batch == 0 {
            return Err(Error::Config("submit_batch must be > 0".into()));
        }
        if self.max_combine == 0 || self.max_combine > 128 {
            return Err(Error::Config("max_combine must be in 1..=128".into()));
        }
        if self.num_contexts == 0 || self.num_contexts > 64 {
            return Err(Error::Config("num_contexts must be in 1..=64".into()));
        }
        if self.bounce_buffer_size == 0 || self.bounce_buffer_size % 4096 != 0 {
            return Err(Error::Config(
                "bounce_buffer_size must be a nonzero multiple of 4096".into(),
            ));
        }
        if self.driver == DriverKind::Worker && self.worker_queue_size == 0 {
            return Err(Error::Config("worker_queue_size must be > 0".into()));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be > 0".into()));
        }
        if self.max_in_flight < self.submit_batch {
            // The ring driver's iovec pools are sized by max_in_flight and
            // must cover a full submission batch.
            return Err(Error::Config(
                "max_in_flight must be >= submit_batch".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use aiocore::{ConfigBuilder, DriverKind};
///
/// let config = ConfigBuilder::new()
///     .driver(DriverKind::Worker)
///     .max_io_slots(1024)
///     .io_max_concurrency(64)
///     .workers(2)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Engine sizing ───────────────────────────────────────────────

    /// Set the slot table size.
    pub fn max_io_slots(mut self, n: u32) -> Self {
        self.config.max_io_slots = n;
        self
    }

    /// Set the maximum number of registered backends.
    pub fn max_backends(mut self, n: u32) -> Self {
        self.config.max_backends = n;
        self
    }

    /// Set the per-backend in-flight cap.
    pub fn io_max_concurrency(mut self, n: u32) -> Self {
        self.config.io_max_concurrency = n;
        self
    }

    /// Set the per-context in-flight maximum.
    pub fn max_in_flight(mut self, n: u32) -> Self {
        self.config.max_in_flight = n;
        self
    }

    // ── Staging ─────────────────────────────────────────────────────

    /// Set the pending-list length that triggers automatic submission.
    pub fn submit_batch(mut self, n: u32) -> Self {
        self.config.submit_batch = n;
        self
    }

    /// Set the merge chain limit.
    pub fn max_combine(mut self, n: u32) -> Self {
        self.config.max_combine = n;
        self
    }

    /// Set the soft-failure retry cap.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    // ── Driver selection ────────────────────────────────────────────

    /// Select the kernel backend.
    pub fn driver(mut self, kind: DriverKind) -> Self {
        self.config.driver = kind;
        self
    }

    /// Set the number of driver contexts (ring instances).
    pub fn num_contexts(mut self, n: u32) -> Self {
        self.config.num_contexts = n;
        self
    }

    /// Set the worker thread count.
    pub fn workers(mut self, n: u32) -> Self {
        self.config.workers = n;
        self
    }

    /// Set the worker submission queue capacity.
    pub fn worker_queue_size(mut self, n: u32) -> Self {
        self.config.worker_queue_size = n;
        self
    }

    // ── Buffers ─────────────────────────────────────────────────────

    /// Set the bounce buffer pool geometry.
    pub fn bounce_buffers(mut self, count: u32, size: u32) -> Self {
        self.config.max_bounce_buffers = count;
        self.config.bounce_buffer_size = size;
        self
    }

    /// Register a memory region as shared for the worker driver.
    /// Can be called multiple times.
    pub fn shared_region(mut self, region: MemoryRegion) -> Self {
        self.config.shared_regions.push(region);
        self
    }

    // ── Terminal ────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(ConfigBuilder::new().max_io_slots(0).build().is_err());
        assert!(ConfigBuilder::new().io_max_concurrency(0).build().is_err());
        assert!(ConfigBuilder::new().max_combine(0).build().is_err());
        assert!(ConfigBuilder::new().num_contexts(0).build().is_err());
        assert!(
            ConfigBuilder::new()
                .bounce_buffers(16, 4000)
                .build()
                .is_err()
        );
    }

    #[test]
    fn region_containment() {
        let mut backing = vec![0u8; 8192];
        let region = MemoryRegion {
            ptr: backing.as_mut_ptr(),
            len: 8192,
        };
        let p = backing.as_mut_ptr();
        assert!(region.contains(p, 8192));
        assert!(region.contains(unsafe { p.add(4096) }, 4096));
        assert!(!region.contains(unsafe { p.add(4096) }, 8192));
    }
}
