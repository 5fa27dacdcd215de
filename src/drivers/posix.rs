//! POSIX AIO driver: per-operation control blocks, signal-driven reaping.
//!
//! Every slot owns a kernel `aiocb`. Completion notification arrives as a
//! SIGIO whose value names the slot; the handler is async-signal-safe — it
//! touches nothing but atomics, collects the result with
//! `aio_error`/`aio_return`, and pushes the slot index onto a lock-free
//! completion ring that any backend drains.
//!
//! Waiting on a specific operation uses `aio_suspend`, whose behavior is
//! undefined once `aio_return` has been called. Waiters therefore set a
//! per-slot `nocheck` flag first, so the handler leaves the control block
//! alone between the waiter's check and its sleep.
//!
//! Platforms without queued signals (macOS) deliver SIGIO without a value;
//! there the driver tracks submitted slots in a dense index array the
//! handler scans by brute force.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::config::{Config, DriverKind};
use crate::driver::Driver;
use crate::engine::Engine;
use crate::error::Error;
use crate::flags::IoFlags;
use crate::list::NO_SLOT;
use crate::metrics;
use crate::ops::OpPayload;
use crate::squeue::IndexQueue;

/// Safe lower bound for `AIO_LISTIO_MAX`; POSIX guarantees at least 2 and
/// common systems allow far more.
const LISTIO_MAX: usize = 16;

/// Whether this platform delivers a queued signal with a value per
/// completion. Without that, completions are discovered by scanning.
const HAVE_SIGQUEUE: bool = cfg!(target_os = "linux");

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

struct CbSlot {
    cb: std::cell::UnsafeCell<libc::aiocb>,
    /// Waiter is inside (or about to enter) `aio_suspend`; the handler
    /// must not call `aio_return` on this block.
    nocheck: AtomicBool,
    /// `aio_return` has been called; the kernel resource is gone.
    returned: AtomicBool,
}

// Safety: access to the aiocb alternates between exactly one submitter,
// the kernel, and whichever context wins the `returned` handshake.
unsafe impl Send for CbSlot {}
unsafe impl Sync for CbSlot {}

pub(crate) struct PosixShared {
    cbs: Box<[CbSlot]>,
    queue: IndexQueue,
    /// Dense array of submitted slot indices for platforms without queued
    /// signals; -1 marks a free cell.
    inflight_index: Box<[std::sync::atomic::AtomicIsize]>,
    inflight_high: std::sync::atomic::AtomicUsize,
}

/// Handler state, published for the signal handler. Only one POSIX AIO
/// engine can be live per process.
static SIGIO_SHARED: AtomicPtr<PosixShared> = AtomicPtr::new(std::ptr::null_mut());
static SIGIO_ENGINE: AtomicPtr<Engine> = AtomicPtr::new(std::ptr::null_mut());

pub(crate) struct PosixAioDriver {
    shared: Arc<PosixShared>,
}

impl PosixAioDriver {
    pub fn new(config: &Config) -> PosixAioDriver {
        let cbs = (0..config.max_io_slots)
            .map(|_| CbSlot {
                // Safety: an all-zero aiocb is a valid resting state.
                cb: std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() }),
                nocheck: AtomicBool::new(false),
                returned: AtomicBool::new(false),
            })
            .collect();
        let inflight_index = (0..config.max_in_flight as usize)
            .map(|_| std::sync::atomic::AtomicIsize::new(-1))
            .collect();
        PosixAioDriver {
            shared: Arc::new(PosixShared {
                cbs,
                queue: IndexQueue::with_capacity(config.max_io_slots as usize),
                inflight_index,
                inflight_high: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }
}

/// Reserve a cell in the dense inflight-index array. Failure to find one
/// is a protocol violation: submissions are capped below the array size.
fn preflight(shared: &PosixShared, idx: u32) {
    if HAVE_SIGQUEUE {
        return;
    }
    for (cell_no, cell) in shared.inflight_index.iter().enumerate() {
        if cell
            .compare_exchange(-1, idx as isize, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            shared
                .inflight_high
                .fetch_max(cell_no + 1, Ordering::AcqRel);
            return;
        }
    }
    panic!("no free cell in the inflight index array");
}

fn clear_inflight_cell(shared: &PosixShared, idx: u32) {
    if HAVE_SIGQUEUE {
        return;
    }
    for cell in shared.inflight_index.iter() {
        if cell
            .compare_exchange(idx as isize, -1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Poll one control block and, if the operation finished, collect the
/// result and publish the slot index on the completion ring.
///
/// Async-signal-safe: atomics, `aio_error`/`aio_return`, and the lock-free
/// ring only.
fn check_one(engine: &Engine, shared: &PosixShared, idx: u32) {
    let cbslot = &shared.cbs[idx as usize];

    // Don't call aio_return underneath aio_suspend's feet.
    if cbslot.nocheck.load(Ordering::Acquire) {
        return;
    }
    if cbslot.returned.load(Ordering::Acquire) {
        return;
    }

    let err = unsafe { libc::aio_error(cbslot.cb.get()) };
    let result = if err == 0 {
        let ret = unsafe { libc::aio_return(cbslot.cb.get()) };
        if ret < 0 {
            // Concurrently collected by an overlapping handler.
            return;
        }
        ret as i32
    } else if err == libc::EINPROGRESS {
        return;
    } else if err > 0 {
        let ret = unsafe { libc::aio_return(cbslot.cb.get()) };
        if ret < 0 && errno() == libc::EINVAL {
            return;
        }
        -err
    } else {
        // aio_error itself failed: no outstanding operation.
        return;
    };

    engine.slots[idx as usize].set_result(result);
    cbslot.returned.store(true, Ordering::Release);
    clear_inflight_cell(shared, idx);

    if !shared.queue.enqueue(idx) {
        // Sized to the slot table, so this cannot legally happen.
        panic!("shared completion queue unexpectedly full");
    }
}

extern "C" fn sigio_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _uap: *mut libc::c_void,
) {
    let shared = SIGIO_SHARED.load(Ordering::Acquire);
    let engine = SIGIO_ENGINE.load(Ordering::Acquire);
    if shared.is_null() || engine.is_null() {
        return;
    }
    let shared = unsafe { &*shared };
    let engine = unsafe { &*engine };
    let saved_errno = io::Error::last_os_error().raw_os_error();

    #[cfg(target_os = "linux")]
    {
        let idx = unsafe { (*info).si_value().sival_ptr } as usize;
        // Sanity-check the value before trusting it; spurious SIGIO with
        // bogus payloads costs us nothing to reject.
        if idx < shared.cbs.len() {
            check_one(engine, shared, idx as u32);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = info;
        // Signals were merged; scan every submitted operation.
        let high = shared.inflight_high.load(Ordering::Acquire);
        for cell in shared.inflight_index.iter().take(high) {
            let idx = cell.load(Ordering::Acquire);
            if idx >= 0 {
                check_one(engine, shared, idx as u32);
            }
        }
    }

    if let Some(e) = saved_errno {
        unsafe { set_errno(e) };
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_errno(e: i32) {
    unsafe { *libc::__error() = e };
}

/// Issue a scatter/gather read or write with a single control block.
/// FreeBSD has dedicated system calls for this; everywhere else the merge
/// layer never produces a multi-iovec chain.
#[cfg(target_os = "freebsd")]
fn start_vectored(cb: &mut libc::aiocb, iovs: &mut [libc::iovec], is_read: bool) -> libc::c_int {
    cb.aio_buf = iovs.as_mut_ptr() as *mut libc::c_void;
    cb.aio_nbytes = iovs.len();
    if is_read {
        unsafe { libc::aio_readv(cb) }
    } else {
        unsafe { libc::aio_writev(cb) }
    }
}

#[cfg(not(target_os = "freebsd"))]
fn start_vectored(_cb: &mut libc::aiocb, _iovs: &mut [libc::iovec], _is_read: bool) -> libc::c_int {
    unreachable!("vectored submission without scatter/gather support")
}

/// Pending list-I/O batch; flushed when full, on op-type boundaries, and
/// before barrier operations.
struct ListioBuffer {
    cbs: [*mut libc::aiocb; LISTIO_MAX],
    n: usize,
}

impl ListioBuffer {
    fn new() -> ListioBuffer {
        ListioBuffer {
            cbs: [std::ptr::null_mut(); LISTIO_MAX],
            n: 0,
        }
    }

    fn flush(&mut self) {
        if self.n == 0 {
            return;
        }
        let rc = unsafe {
            libc::lio_listio(
                libc::LIO_NOWAIT,
                self.cbs.as_mut_ptr() as *mut *mut libc::aiocb,
                self.n as libc::c_int,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            // Individual failures are reported through each aiocb; an
            // outright rejected list is a protocol violation.
            panic!("lio_listio failed: {}", io::Error::last_os_error());
        }
        self.n = 0;
    }

    fn add(&mut self, cb: *mut libc::aiocb) {
        if self.n == LISTIO_MAX {
            self.flush();
        }
        self.cbs[self.n] = cb;
        self.n += 1;
    }
}

impl PosixAioDriver {
    /// Complete a submission failure (or no-op) in place, mirroring what a
    /// drain would have done.
    fn complete_inline(&self, engine: &Engine, bid: u32, head: u32, result: i32) {
        let slot = &engine.slots[head as usize];
        slot.set_result(result);
        slot.update_flags(IoFlags::INFLIGHT, IoFlags::REAPED | IoFlags::DRIVER_RETURNED);
        {
            let backend = &engine.backends[bid as usize];
            let mut local = backend.local.lock();
            local.reaped.push_tail(&engine.slots, head);
        }
        crate::complete::settle_chain(engine, bid, head);
    }

    /// Prepare one chain's control block and hand it to the kernel.
    /// Returns Err(errno) when submission failed outright.
    fn start_one(&self, engine: &Engine, listio: &mut ListioBuffer, head: u32) -> Result<(), i32> {
        let shared = &self.shared;
        let cbslot = &shared.cbs[head as usize];
        cbslot.returned.store(false, Ordering::Release);
        cbslot.nocheck.store(false, Ordering::Release);

        let op = engine.slots[head as usize].inner.lock().op;

        // Safety: the slot is INFLIGHT and owned by this submission; the
        // kernel gets the block next.
        let cb = unsafe { &mut *cbslot.cb.get() };
        *cb = unsafe { std::mem::zeroed() };
        cb.aio_sigevent.sigev_notify = libc::SIGEV_SIGNAL;
        cb.aio_sigevent.sigev_signo = libc::SIGIO;
        if HAVE_SIGQUEUE {
            cb.aio_sigevent.sigev_value.sival_ptr = head as usize as *mut libc::c_void;
        }
        preflight(shared, head);

        let rc = match &op {
            OpPayload::None | OpPayload::Nop => unreachable!("nop handled by caller"),
            OpPayload::FlushRange(f) => {
                // No asynchronous range flush in POSIX AIO; a datasync is
                // the closest match.
                cb.aio_fildes = f.fd;
                unsafe { libc::aio_fsync(libc::O_DSYNC, cb) }
            }
            OpPayload::Fsync(f) => {
                // A sync must cover writes still sitting in our batch.
                listio.flush();
                cb.aio_fildes = f.fd;
                let mode = if f.datasync { libc::O_DSYNC } else { libc::O_SYNC };
                unsafe { libc::aio_fsync(mode, cb) }
            }
            OpPayload::FsyncWal(f) => {
                listio.flush();
                cb.aio_fildes = f.fd;
                let mode = if f.datasync { libc::O_DSYNC } else { libc::O_SYNC };
                unsafe { libc::aio_fsync(mode, cb) }
            }
            OpPayload::ReadBuffer(_)
            | OpPayload::WriteBuffer(_)
            | OpPayload::WriteWal(_)
            | OpPayload::WriteGeneric(_) => {
                let is_read = op.is_read();
                let no_reorder = op.no_reorder();
                cb.aio_fildes = op.fd().unwrap();
                cb.aio_offset = op.effective_offset() as libc::off_t;

                let mut iovs: Vec<libc::iovec> = Vec::new();
                let mut cur = head;
                loop {
                    let slot = &engine.slots[cur as usize];
                    let member_op = slot.inner.lock().op;
                    crate::ops::push_iov(&mut iovs, &member_op);
                    let next = slot.merge_with.load(Ordering::Relaxed);
                    if next == NO_SLOT {
                        break;
                    }
                    cur = next;
                }

                if iovs.len() > 1 {
                    // Reachable only where the merge layer was told
                    // scatter/gather is available.
                    start_vectored(cb, &mut iovs, is_read)
                } else {
                    cb.aio_buf = iovs[0].iov_base;
                    cb.aio_nbytes = iovs[0].iov_len;
                    cb.aio_lio_opcode = if is_read { libc::LIO_READ } else { libc::LIO_WRITE };
                    if no_reorder {
                        // Nothing already batched may be reordered past us.
                        listio.flush();
                        listio.add(cb as *mut libc::aiocb);
                        listio.flush();
                        0
                    } else {
                        listio.add(cb as *mut libc::aiocb);
                        0
                    }
                }
            }
        };

        if rc < 0 {
            let e = errno();
            clear_inflight_cell(shared, head);
            return Err(e);
        }
        Ok(())
    }
}

impl Driver for PosixAioDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::PosixAio
    }

    fn can_scatter_gather(&self) -> bool {
        cfg!(target_os = "freebsd")
    }

    fn startup(&self, engine: &Arc<Engine>) -> Result<(), Error> {
        SIGIO_ENGINE.store(Arc::as_ptr(engine) as *mut Engine, Ordering::Release);
        SIGIO_SHARED.store(
            Arc::into_raw(Arc::clone(&self.shared)) as *mut PosixShared,
            Ordering::Release,
        );

        // Safety: installing a handler that only uses async-signal-safe
        // operations (see check_one).
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = sigio_handler
                as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
                as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGIO, &sa, std::ptr::null_mut()) != 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    fn submit(&self, engine: &Engine, bid: u32, max_submit: usize, _will_wait: bool) -> usize {
        let backend = &engine.backends[bid as usize];
        let mut heads = Vec::with_capacity(max_submit);
        {
            let mut local = backend.local.lock();
            while heads.len() < max_submit {
                let Some(head) = local.pending.front() else {
                    break;
                };
                engine.prepare_submit(bid, &mut local, head, 0);
                heads.push(head);
            }
        }
        if heads.is_empty() {
            return 0;
        }

        let mut listio = ListioBuffer::new();
        for &head in &heads {
            let op_kind = engine.slots[head as usize].kind();
            backend.totals.submissions.fetch_add(1, Ordering::Relaxed);
            metrics::SUBMISSION_CALLS.increment();

            match op_kind {
                Some(crate::ops::OpKind::Nop) | None => {
                    self.complete_inline(engine, bid, head, 0);
                }
                _ => match self.start_one(engine, &mut listio, head) {
                    Ok(_) => {}
                    Err(errno) => {
                        // A failed submission is an immediate completion
                        // with a negative result.
                        listio.flush();
                        self.complete_inline(engine, bid, head, -errno);
                    }
                },
            }
        }
        listio.flush();

        for &head in &heads {
            engine.wake_chain(head);
        }
        heads.len()
    }

    fn drain(&self, engine: &Engine, bid: u32, _context: u32) -> usize {
        let backend = &engine.backends[bid as usize];
        let mut n = 0;
        while let Some(idx) = self.shared.queue.dequeue() {
            let slot = &engine.slots[idx as usize];
            slot.update_flags(IoFlags::INFLIGHT, IoFlags::REAPED | IoFlags::DRIVER_RETURNED);
            {
                let mut local = backend.local.lock();
                local.reaped.push_tail(&engine.slots, idx);
            }
            crate::complete::settle_chain(engine, bid, idx);
            n += 1;
        }
        n
    }

    fn wait_one(&self, engine: &Engine, _bid: u32, idx: u32, ref_generation: u64) {
        let slot = &engine.slots[idx as usize];
        let cbslot = &self.shared.cbs[idx as usize];

        if slot.generation() != ref_generation || !slot.flags().contains(IoFlags::INFLIGHT) {
            return;
        }
        if slot.flags().contains(IoFlags::DRIVER_RETURNED) {
            // Result already collected; the reaped list has it.
            return;
        }

        cbslot.nocheck.store(true, Ordering::Release);
        if cbslot.returned.load(Ordering::Acquire) {
            // The handler got here first.
            cbslot.nocheck.store(false, Ordering::Release);
            return;
        }

        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 100_000_000,
        };
        let list = [cbslot.cb.get() as *const libc::aiocb];
        // Safety: the control block stays allocated for the engine's
        // lifetime, and nocheck keeps the handler from retiring it.
        let rc = unsafe { libc::aio_suspend(list.as_ptr(), 1, &ts) };
        cbslot.nocheck.store(false, Ordering::Release);

        if rc == 0 {
            // Collect the result ourselves; any backend may run the
            // callbacks once it lands on the ring.
            check_one(engine, &self.shared, idx);
        } else {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => {}
                _ => log::warn!("aio_suspend for io {idx}: {err}"),
            }
        }
    }

    fn shutdown(&self, _engine: &Engine) {
        let shared = SIGIO_SHARED.swap(std::ptr::null_mut(), Ordering::AcqRel);
        SIGIO_ENGINE.store(std::ptr::null_mut(), Ordering::Release);

        // Safety: restore the default disposition before dropping the
        // handler state the signal path reads.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut sa.sa_mask);
            let _ = libc::sigaction(libc::SIGIO, &sa, std::ptr::null_mut());
        }
        if !shared.is_null() {
            // Safety: reclaiming the reference published at startup.
            drop(unsafe { Arc::from_raw(shared as *const PosixShared) });
        }
    }
}
