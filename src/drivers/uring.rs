//! io_uring driver: multiple ring contexts shared by all backends.
//!
//! Each context is one kernel ring with a submission lock and a completion
//! lock. iovec arrays for vectored submissions must stay valid until the
//! corresponding completion arrives, so each context carries a pool of
//! them, split into an unused freelist under the submission lock and a
//! reaped freelist under the completion lock; the completion lock is taken
//! briefly from the submission side when the unused list runs dry.
//!
//! A backend picks a context by starting at the one it last used and
//! trying each submission lock without blocking, which spreads backends
//! across contexts over time; only when every context is contended does it
//! block on the next one.

use std::cell::UnsafeCell;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;

use io_uring::{IoUring, opcode, squeue, types};
use parking_lot::{Mutex, MutexGuard};

use crate::config::{Config, DriverKind};
use crate::driver::Driver;
use crate::engine::Engine;
use crate::error::Error;
use crate::flags::IoFlags;
use crate::list::NO_SLOT;
use crate::metrics;
use crate::ops::OpPayload;

/// Fixed-size iovec arrays, handed out per vectored submission.
struct IovecPool {
    storage: Box<[UnsafeCell<libc::iovec>]>,
    stride: usize,
}

// Safety: arrays are handed out exclusively via the freelist protocol; an
// array is written only by the submitter that popped it and read only by
// the kernel until its completion returns it to a freelist.
unsafe impl Send for IovecPool {}
unsafe impl Sync for IovecPool {}

impl IovecPool {
    fn new(arrays: usize, stride: usize) -> IovecPool {
        let storage = (0..arrays * stride)
            .map(|_| {
                UnsafeCell::new(libc::iovec {
                    iov_base: std::ptr::null_mut(),
                    iov_len: 0,
                })
            })
            .collect();
        IovecPool { storage, stride }
    }

    fn array_ptr(&self, idx: u32) -> *mut libc::iovec {
        debug_assert!((idx as usize + 1) * self.stride <= self.storage.len());
        self.storage[idx as usize * self.stride].get()
    }
}

struct SubmissionSide {
    unused_iovecs: Vec<u32>,
}

struct CompletionSide {
    reaped_iovecs: Vec<u32>,
}

struct UringContext {
    ring: IoUring,
    iovecs: IovecPool,
    submission: Mutex<SubmissionSide>,
    completion: Mutex<CompletionSide>,
}

pub(crate) struct UringDriver {
    contexts: Box<[UringContext]>,
    max_combine: usize,
}

impl UringDriver {
    pub fn new(config: &Config) -> Result<UringDriver, Error> {
        let entries = config.submit_batch.next_power_of_two().max(8);
        let mut contexts = Vec::with_capacity(config.num_contexts as usize);
        for _ in 0..config.num_contexts {
            let ring = IoUring::builder()
                .setup_cqsize(entries.saturating_mul(4))
                .build(entries)
                .map_err(Error::Io)?;
            let arrays = config.max_in_flight as usize;
            contexts.push(UringContext {
                ring,
                iovecs: IovecPool::new(arrays, config.max_combine as usize),
                submission: Mutex::new(SubmissionSide {
                    unused_iovecs: (0..config.max_in_flight).rev().collect(),
                }),
                completion: Mutex::new(CompletionSide {
                    reaped_iovecs: Vec::with_capacity(config.max_in_flight as usize),
                }),
            });
        }
        Ok(UringDriver {
            contexts: contexts.into_boxed_slice(),
            max_combine: config.max_combine as usize,
        })
    }

    /// Lock a context's submission side, preferring an uncontended one.
    fn acquire_context(
        &self,
        engine: &Engine,
        bid: u32,
    ) -> (usize, MutexGuard<'_, SubmissionSide>) {
        let backend = &engine.backends[bid as usize];
        let n = self.contexts.len();

        let mut c = backend.last_context.load(Ordering::Relaxed) as usize % n;
        for _ in 0..n {
            if let Some(guard) = self.contexts[c].submission.try_lock() {
                backend.last_context.store(c as u32, Ordering::Relaxed);
                return (c, guard);
            }
            c = (c + 1) % n;
        }

        // All contended; block on the next one.
        c = (backend.last_context.load(Ordering::Relaxed) as usize + 1) % n;
        log::debug!("backend {bid}: all ring contexts contended, blocking on {c}");
        backend.last_context.store(c as u32, Ordering::Relaxed);
        (c, self.contexts[c].submission.lock())
    }

    /// Pop an iovec array, pulling reaped arrays over from the completion
    /// side when the submission-side freelist runs out.
    fn get_iovec_array(&self, ctx: &UringContext, sub: &mut SubmissionSide) -> u32 {
        loop {
            if let Some(idx) = sub.unused_iovecs.pop() {
                return idx;
            }
            let transferred = {
                let mut comp = ctx.completion.lock();
                let n = comp.reaped_iovecs.len();
                sub.unused_iovecs.append(&mut comp.reaped_iovecs);
                n
            };
            if transferred == 0 {
                // Every array is attached to an inflight submission;
                // completions will hand them back.
                std::thread::yield_now();
            } else {
                log::trace!("transferred {transferred} reaped iovec arrays");
            }
        }
    }

    /// Build the submission entry for one chain head.
    fn build_sqe(
        &self,
        engine: &Engine,
        ctx: &UringContext,
        sub: &mut SubmissionSide,
        head: u32,
    ) -> squeue::Entry {
        let slot = &engine.slots[head as usize];
        let op = slot.inner.lock().op;

        let entry = match &op {
            OpPayload::None | OpPayload::Nop => opcode::Nop::new().build(),

            OpPayload::Fsync(f) => {
                let mut e = opcode::Fsync::new(types::Fd(f.fd));
                if f.datasync {
                    e = e.flags(types::FsyncFlags::DATASYNC);
                }
                let mut e = e.build();
                if f.barrier {
                    e = e.flags(squeue::Flags::IO_DRAIN);
                }
                e
            }
            OpPayload::FsyncWal(f) => {
                let mut e = opcode::Fsync::new(types::Fd(f.fd));
                if f.datasync {
                    e = e.flags(types::FsyncFlags::DATASYNC);
                }
                let mut e = e.build();
                if f.barrier {
                    e = e.flags(squeue::Flags::IO_DRAIN);
                }
                e
            }

            OpPayload::FlushRange(f) => {
                opcode::SyncFileRange::new(types::Fd(f.fd), f.nbytes as u32)
                    .offset(f.offset)
                    .flags(libc::SYNC_FILE_RANGE_WRITE)
                    .build()
            }

            OpPayload::ReadBuffer(r) => {
                let (ptr, niov) = self.fill_iovecs(engine, ctx, sub, head, slot);
                opcode::Readv::new(types::Fd(r.fd), ptr, niov)
                    .offset(op.effective_offset())
                    .build()
            }
            OpPayload::WriteBuffer(w) => {
                let (ptr, niov) = self.fill_iovecs(engine, ctx, sub, head, slot);
                opcode::Writev::new(types::Fd(w.fd), ptr, niov)
                    .offset(op.effective_offset())
                    .build()
            }
            OpPayload::WriteWal(w) => {
                let (ptr, niov) = self.fill_iovecs(engine, ctx, sub, head, slot);
                let mut e = opcode::Writev::new(types::Fd(w.fd), ptr, niov)
                    .offset(op.effective_offset())
                    .build();
                if w.no_reorder {
                    e = e.flags(squeue::Flags::IO_DRAIN);
                }
                e
            }
            OpPayload::WriteGeneric(w) => {
                let (ptr, niov) = self.fill_iovecs(engine, ctx, sub, head, slot);
                let mut e = opcode::Writev::new(types::Fd(w.fd), ptr, niov)
                    .offset(op.effective_offset())
                    .build();
                if w.no_reorder {
                    e = e.flags(squeue::Flags::IO_DRAIN);
                }
                e
            }
        };
        entry.user_data(head as u64)
    }

    /// Flatten a chain's memory ranges into one of the context's iovec
    /// arrays. Returns the array pointer and entry count.
    fn fill_iovecs(
        &self,
        engine: &Engine,
        ctx: &UringContext,
        sub: &mut SubmissionSide,
        head: u32,
        head_slot: &crate::slot::IoSlot,
    ) -> (*mut libc::iovec, u32) {
        let array = self.get_iovec_array(ctx, sub);
        let base = ctx.iovecs.array_ptr(array);

        let mut iovs: Vec<libc::iovec> = Vec::with_capacity(self.max_combine);
        let mut cur = head;
        loop {
            let slot = &engine.slots[cur as usize];
            let op = slot.inner.lock().op;
            crate::ops::push_iov(&mut iovs, &op);
            let next = slot.merge_with.load(Ordering::Relaxed);
            if next == NO_SLOT {
                break;
            }
            cur = next;
        }
        debug_assert!(iovs.len() <= self.max_combine);

        for (i, iov) in iovs.iter().enumerate() {
            // Safety: the array was popped from a freelist, so no other
            // submission is using it; i stays within the array's stride.
            unsafe { base.add(i).write(*iov) };
        }
        head_slot.used_iovec.store(array as i32, Ordering::Relaxed);
        (base, iovs.len() as u32)
    }
}

impl Driver for UringDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Uring
    }

    fn num_contexts(&self) -> u32 {
        self.contexts.len() as u32
    }

    fn can_scatter_gather(&self) -> bool {
        true
    }

    fn submit(&self, engine: &Engine, bid: u32, max_submit: usize, _will_wait: bool) -> usize {
        let backend = &engine.backends[bid as usize];
        let (ctx_id, mut sub) = self.acquire_context(engine, bid);
        let ctx = &self.contexts[ctx_id];

        let mut heads = Vec::with_capacity(max_submit);
        {
            let mut local = backend.local.lock();
            while heads.len() < max_submit {
                let Some(head) = local.pending.front() else {
                    break;
                };
                engine.prepare_submit(bid, &mut local, head, ctx_id as u8);
                heads.push(head);
            }
        }
        if heads.is_empty() {
            return 0;
        }

        // Safety: the submission lock serializes all SQ access for this
        // ring.
        let mut sq = unsafe { ctx.ring.submission_shared() };
        for &head in &heads {
            let entry = self.build_sqe(engine, ctx, &mut sub, head);
            loop {
                // Safety: referenced buffers and iovec arrays stay valid
                // until the completion is reaped.
                match unsafe { sq.push(&entry) } {
                    Ok(()) => break,
                    Err(_) => {
                        // Queue full: flush what we have and retry.
                        sq.sync();
                        if let Err(e) = ctx.ring.submitter().submit() {
                            if e.raw_os_error() != Some(libc::EINTR) {
                                panic!("io_uring submit failed: {e}");
                            }
                        }
                        // Pick up the kernel's consumption of the queue.
                        sq.sync();
                    }
                }
            }
        }
        sq.sync();
        drop(sq);

        backend.totals.submissions.fetch_add(1, Ordering::Relaxed);
        metrics::SUBMISSION_CALLS.increment();
        loop {
            match ctx.ring.submitter().submit() {
                Ok(_) => break,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => panic!("io_uring submit failed: {e}"),
            }
        }
        drop(sub);

        // Waiters may have gone to sleep while these were still PENDING.
        for &head in &heads {
            engine.wake_chain(head);
        }
        heads.len()
    }

    fn drain(&self, engine: &Engine, bid: u32, context: u32) -> usize {
        let ctx = &self.contexts[context as usize % self.contexts.len()];
        let mut comp = ctx.completion.lock();

        let completions: Vec<(u32, i32)> = {
            // Safety: the completion lock serializes all CQ access.
            let mut cq = unsafe { ctx.ring.completion_shared() };
            cq.sync();
            let drained: Vec<(u32, i32)> =
                (&mut cq).map(|cqe| (cqe.user_data() as u32, cqe.result())).collect();
            cq.sync();
            drained
        };
        if completions.is_empty() {
            return 0;
        }

        let backend = &engine.backends[bid as usize];
        for &(idx, result) in &completions {
            let slot = &engine.slots[idx as usize];
            debug_assert!(slot.flags().contains(IoFlags::INFLIGHT));
            slot.set_result(result);
            if result < 0 {
                log::warn!(
                    "cqe for io {idx}: {}",
                    io::Error::from_raw_os_error(-result)
                );
            }

            let array = slot.used_iovec.swap(-1, Ordering::Relaxed);
            if array >= 0 {
                comp.reaped_iovecs.push(array as u32);
            }

            slot.update_flags(IoFlags::INFLIGHT, IoFlags::REAPED);
            {
                let mut local = backend.local.lock();
                local.reaped.push_tail(&engine.slots, idx);
            }
            crate::complete::settle_chain(engine, bid, idx);
        }

        // Opportunistically rebalance the iovec freelists while we hold
        // the completion lock anyway.
        {
            let sub = ctx.submission.try_lock();
            if let Some(mut sub) = sub {
                if comp.reaped_iovecs.len() > sub.unused_iovecs.len() {
                    log::trace!(
                        "plenty reaped iovec arrays ({}), transferring",
                        comp.reaped_iovecs.len()
                    );
                    sub.unused_iovecs.append(&mut comp.reaped_iovecs);
                }
            }
        }

        completions.len()
    }

    fn wait_one(&self, engine: &Engine, _bid: u32, idx: u32, ref_generation: u64) {
        let slot = &engine.slots[idx as usize];
        if slot.generation() != ref_generation || !slot.flags().contains(IoFlags::INFLIGHT) {
            return;
        }
        let context = slot.context() as usize % self.contexts.len();
        let ring_fd = self.contexts[context].ring.as_raw_fd();

        log::trace!("io_uring_enter for io {idx} on context {context}");
        enter_getevents(ring_fd);
    }

    fn shutdown(&self, _engine: &Engine) {}
}

const IORING_ENTER_GETEVENTS: libc::c_ulong = 1;
const IORING_ENTER_EXT_ARG: libc::c_ulong = 1 << 3;

#[repr(C)]
struct GeteventsArg {
    sigmask: u64,
    sigmask_sz: u32,
    pad: u32,
    ts: u64,
}

/// Wait (bounded) for one completion to be posted to the ring. The result
/// may be reaped by any backend, so waiters re-check and loop.
fn enter_getevents(ring_fd: i32) {
    let ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 100_000_000,
    };
    let arg = GeteventsArg {
        sigmask: 0,
        sigmask_sz: 8,
        pad: 0,
        ts: &ts as *const libc::timespec as u64,
    };
    // Safety: plain io_uring_enter with EXT_ARG; the argument structure
    // lives across the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            ring_fd,
            0u32,
            1u32,
            IORING_ENTER_GETEVENTS | IORING_ENTER_EXT_ARG,
            &arg as *const GeteventsArg,
            std::mem::size_of::<GeteventsArg>(),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::ETIME) => {}
            _ => log::warn!("io_uring_enter: {err}"),
        }
    }
}
