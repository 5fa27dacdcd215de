//! Worker driver: the portable fallback backend.
//!
//! Submitting backends push slot indices onto a bounded shared queue;
//! worker threads pop them, perform the I/O synchronously, and run the
//! completion machinery directly. Two classes of operation never reach a
//! worker: anything the worker could not reopen (unknown descriptors,
//! un-tagged files), and transfers whose memory lies outside the
//! registered shared regions — workers cannot read another backend's
//! private memory. Those are executed synchronously by the submitter, as
//! is a lone operation the caller is about to wait on anyway.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::complete;
use crate::config::{Config, DriverKind};
use crate::driver::Driver;
use crate::engine::{Engine, FileResolver};
use crate::error::Error;
use crate::flags::IoFlags;
use crate::list::NO_SLOT;
use crate::metrics;
use crate::ops::{OpPayload, WalSegment, push_iov};

pub(crate) struct WorkerDriver {
    workers: u32,
    tx: Mutex<Option<Sender<u32>>>,
    rx: Receiver<u32>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerDriver {
    pub fn new(config: &Config) -> WorkerDriver {
        let (tx, rx) = bounded(config.worker_queue_size as usize);
        WorkerDriver {
            workers: config.workers,
            tx: Mutex::new(Some(tx)),
            rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Whether this chain must be executed by the submitting backend.
    fn need_synchronous(&self, engine: &Engine, head: u32) -> bool {
        if self.workers == 0 || engine.resolver.is_none() {
            return true;
        }
        if cfg!(windows) {
            // Worker backends reopen by descriptor tags, which this
            // driver only knows how to do through Unix descriptors.
            return true;
        }
        let mut cur = head;
        loop {
            let slot = &engine.slots[cur as usize];
            let op = slot.inner.lock().op;
            let sync = match &op {
                OpPayload::None | OpPayload::Nop => false,
                // Workers can only reopen descriptors with a usable tag.
                OpPayload::Fsync(f) => f.segment.is_none(),
                OpPayload::FsyncWal(f) => f.segment.is_none(),
                OpPayload::FlushRange(_) => true,
                OpPayload::WriteWal(_) => false,
                OpPayload::WriteGeneric(_) => true,
                OpPayload::ReadBuffer(op) => !in_shared_region(engine, op.data, op.nbytes),
                OpPayload::WriteBuffer(op) => !in_shared_region(engine, op.data, op.nbytes),
            };
            if sync {
                return true;
            }
            let next = slot.merge_with.load(Ordering::Relaxed);
            if next == NO_SLOT {
                return false;
            }
            cur = next;
        }
    }
}

fn in_shared_region(engine: &Engine, ptr: *const u8, len: u32) -> bool {
    engine
        .config
        .shared_regions
        .iter()
        .any(|r| r.contains(ptr, len as usize))
}

impl Driver for WorkerDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Worker
    }

    fn can_scatter_gather(&self) -> bool {
        // No true scatter/gather guarantee on every platform, but keeping
        // sequential regions within one worker is still a win.
        true
    }

    fn startup(&self, engine: &Arc<Engine>) -> Result<(), Error> {
        let mut handles = self.handles.lock();
        for n in 0..self.workers {
            let bid = engine.register_backend_id()?;
            let engine = Arc::clone(engine);
            let rx = self.rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("aio-worker-{n}"))
                .spawn(move || worker_main(engine, bid, rx))?;
            handles.push(handle);
        }
        Ok(())
    }

    fn submit(&self, engine: &Engine, bid: u32, max_submit: usize, will_wait: bool) -> usize {
        let backend = &engine.backends[bid as usize];

        // A single staged op the caller will immediately wait on is not
        // worth the interprocess round trip.
        let force_synchronous = will_wait && {
            let local = backend.local.lock();
            local.pending.len() == 1
        };

        let mut cache = WalFdCache::default();
        let mut nios = 0;
        while nios < max_submit {
            let head = {
                let mut local = backend.local.lock();
                let Some(head) = local.pending.front() else {
                    break;
                };
                engine.prepare_submit(bid, &mut local, head, 0);
                head
            };
            backend.totals.submissions.fetch_add(1, Ordering::Relaxed);
            metrics::SUBMISSION_CALLS.increment();

            if force_synchronous || self.need_synchronous(engine, head) {
                execute_chain(engine, bid, head, &mut cache, false);
            } else {
                let sender = self.tx.lock().clone();
                match sender {
                    // Blocks while the queue is full; a worker waking up
                    // makes room.
                    Some(tx) if tx.send(head).is_ok() => {}
                    // Shut down underneath us; finish the work ourselves.
                    _ => execute_chain(engine, bid, head, &mut cache, false),
                }
            }

            engine.wake_chain(head);
            nios += 1;
        }
        nios
    }

    fn drain(&self, _engine: &Engine, _bid: u32, _context: u32) -> usize {
        // No completion queue: workers (or the synchronous path) run the
        // completion machinery directly.
        0
    }

    fn wait_one(&self, engine: &Engine, _bid: u32, idx: u32, ref_generation: u64) {
        let slot = &engine.slots[idx as usize];
        slot.sleep_on(
            || slot.generation() == ref_generation && !slot.flags().contains(IoFlags::DONE),
            None,
        );
    }

    fn shutdown(&self, _engine: &Engine) {
        self.tx.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_main(engine: Arc<Engine>, bid: u32, rx: Receiver<u32>) {
    log::debug!("aio worker {bid} started");
    let mut cache = WalFdCache::default();
    while let Ok(head) = rx.recv() {
        execute_chain(&engine, bid, head, &mut cache, true);
        complete::complete_ios(&engine, bid);
    }
    log::debug!("aio worker {bid} exiting");
    engine.unregister_backend_id(bid);
}

/// One cached WAL descriptor, keyed by segment and timeline.
#[derive(Default)]
pub(super) struct WalFdCache {
    file: Option<(WalSegment, std::fs::File, i32)>,
}

impl WalFdCache {
    #[cfg(unix)]
    fn get(&mut self, resolver: &dyn FileResolver, segment: WalSegment) -> io::Result<i32> {
        use std::os::fd::AsRawFd;

        if let Some((cached, _, _)) = &self.file {
            if *cached != segment {
                self.file = None;
            }
        }
        if self.file.is_none() {
            let file = resolver.open_wal_segment(&segment)?;
            let fd = file.as_raw_fd();
            self.file = Some((segment, file, fd));
        }
        Ok(self.file.as_ref().unwrap().2)
    }

    #[cfg(windows)]
    fn get(&mut self, _resolver: &dyn FileResolver, _segment: WalSegment) -> io::Result<i32> {
        // need_synchronous keeps this path unreachable on Windows.
        Err(io::Error::other("worker reopen not supported here"))
    }
}

/// Perform one chain synchronously, write the result, and settle the
/// chain's completion accounting (split plus in-flight decrements).
///
/// `reopen` is set when running in a worker backend: descriptors stored in
/// the payload belong to the submitter and must not be used.
fn execute_chain(engine: &Engine, bid: u32, head: u32, cache: &mut WalFdCache, reopen: bool) {
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

    let result = perform_io(engine, &members, cache, reopen);
    let slot = &engine.slots[head as usize];
    slot.set_result(result);

    slot.update_flags(IoFlags::INFLIGHT, IoFlags::REAPED);
    {
        let backend = &engine.backends[bid as usize];
        let mut local = backend.local.lock();
        local.reaped.push_tail(&engine.slots, head);
    }
    complete::settle_chain(engine, bid, head);
    metrics::DRAINED_COMPLETIONS.increment();
}

fn perform_io(engine: &Engine, members: &[u32], cache: &mut WalFdCache, reopen: bool) -> i32 {
    let head_op = engine.slots[members[0] as usize].inner.lock().op;

    let wal_fd = |cache: &mut WalFdCache, seg: WalSegment| -> Result<i32, i32> {
        let resolver = engine.resolver.as_deref().expect("worker without resolver");
        cache.get(resolver, seg).map_err(|e| errno_of(&e))
    };
    let buffered_fd = |tag: &crate::ops::BufferTag| -> Result<i32, i32> {
        let resolver = engine.resolver.as_deref().expect("worker without resolver");
        resolver.reopen_buffered(tag).map_err(|e| errno_of(&e))
    };

    match &head_op {
        OpPayload::None | OpPayload::Nop => 0,

        OpPayload::Fsync(op) => {
            let fd = match (reopen, op.segment) {
                (true, Some(seg)) => match wal_fd(cache, seg) {
                    Ok(fd) => fd,
                    Err(e) => return -e,
                },
                _ => op.fd,
            };
            sync_fd(fd, op.datasync)
        }
        OpPayload::FsyncWal(op) => {
            let fd = match (reopen, op.segment) {
                (true, Some(seg)) => match wal_fd(cache, seg) {
                    Ok(fd) => fd,
                    Err(e) => return -e,
                },
                _ => op.fd,
            };
            sync_fd(fd, op.datasync)
        }

        OpPayload::FlushRange(op) => flush_range(op.fd, op.offset, op.nbytes),

        OpPayload::ReadBuffer(op) => {
            let fd = if reopen {
                match buffered_fd(&op.tag) {
                    Ok(fd) => fd,
                    Err(e) => return -e,
                }
            } else {
                op.fd
            };
            rw_chain(engine, members, fd, head_op.effective_offset(), true)
        }
        OpPayload::WriteBuffer(op) => {
            let fd = if reopen {
                match buffered_fd(&op.tag) {
                    Ok(fd) => fd,
                    Err(e) => return -e,
                }
            } else {
                op.fd
            };
            rw_chain(engine, members, fd, head_op.effective_offset(), false)
        }
        OpPayload::WriteWal(op) => {
            let fd = if reopen {
                match wal_fd(cache, op.segment) {
                    Ok(fd) => fd,
                    Err(e) => return -e,
                }
            } else {
                op.fd
            };
            rw_chain(engine, members, fd, head_op.effective_offset(), false)
        }
        OpPayload::WriteGeneric(op) => {
            // Only ever executed by the submitter; the descriptor is live.
            rw_chain(engine, members, op.fd, head_op.effective_offset(), false)
        }
    }
}

fn errno_of(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(unix)]
fn sync_fd(fd: i32, datasync: bool) -> i32 {
    let rc = unsafe {
        if datasync {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    };
    if rc < 0 { -last_errno() } else { 0 }
}

#[cfg(windows)]
fn sync_fd(fd: i32, _datasync: bool) -> i32 {
    use windows_sys::Win32::Storage::FileSystem::FlushFileBuffers;
    let handle = unsafe { libc::get_osfhandle(fd) };
    let ok = unsafe { FlushFileBuffers(handle as _) };
    if ok == 0 { -last_errno() } else { 0 }
}

#[cfg(target_os = "linux")]
fn flush_range(fd: i32, offset: u64, nbytes: u64) -> i32 {
    let rc = unsafe {
        libc::sync_file_range(
            fd,
            offset as libc::off64_t,
            nbytes as libc::off64_t,
            libc::SYNC_FILE_RANGE_WRITE,
        )
    };
    if rc < 0 { -last_errno() } else { 0 }
}

#[cfg(not(target_os = "linux"))]
fn flush_range(fd: i32, _offset: u64, _nbytes: u64) -> i32 {
    // Closest available behavior: initiate a data sync.
    sync_fd(fd, true)
}

#[cfg(unix)]
fn rw_chain(engine: &Engine, members: &[u32], fd: i32, offset: u64, read: bool) -> i32 {
    let mut iovs: Vec<libc::iovec> = Vec::with_capacity(members.len());
    for &idx in members {
        let op = engine.slots[idx as usize].inner.lock().op;
        push_iov(&mut iovs, &op);
    }

    let rc = unsafe {
        if read {
            libc::preadv(
                fd,
                iovs.as_ptr(),
                iovs.len() as libc::c_int,
                offset as libc::off_t,
            )
        } else {
            libc::pwritev(
                fd,
                iovs.as_ptr(),
                iovs.len() as libc::c_int,
                offset as libc::off_t,
            )
        }
    };
    if rc < 0 { -last_errno() } else { rc as i32 }
}

#[cfg(windows)]
fn rw_chain(engine: &Engine, members: &[u32], fd: i32, offset: u64, read: bool) -> i32 {
    use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // No vectored positional I/O through the CRT; issue the ranges one at
    // a time and accumulate, stopping at the first short transfer.
    let handle = unsafe { libc::get_osfhandle(fd) };
    let mut iovs: Vec<libc::iovec> = Vec::with_capacity(members.len());
    for &idx in members {
        let op = engine.slots[idx as usize].inner.lock().op;
        push_iov(&mut iovs, &op);
    }

    let mut pos = offset;
    let mut total: i32 = 0;
    for iov in &iovs {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        overlapped.Anonymous.Anonymous.Offset = pos as u32;
        overlapped.Anonymous.Anonymous.OffsetHigh = (pos >> 32) as u32;
        let mut done: u32 = 0;
        let ok = unsafe {
            if read {
                ReadFile(
                    handle as _,
                    iov.iov_base as *mut u8,
                    iov.iov_len as u32,
                    &mut done,
                    &mut overlapped,
                )
            } else {
                WriteFile(
                    handle as _,
                    iov.iov_base as *const u8,
                    iov.iov_len as u32,
                    &mut done,
                    &mut overlapped,
                )
            }
        };
        if ok == 0 {
            return if total > 0 { total } else { -last_errno() };
        }
        total += done as i32;
        pos += done as u64;
        if (done as usize) < iov.iov_len {
            break;
        }
    }
    total
}
