//! Windows I/O completion-port driver.
//!
//! One process-wide port receives every completion. Each slot owns an
//! OVERLAPPED record in a table parallel to the slot table; the pointer
//! handed back by the port is resolved to its slot by table offset.
//! Scatter/gather (`ReadFileScatter`/`WriteFileGather`) only works on
//! files opened for unbuffered I/O, so the merge layer is told there is no
//! scatter/gather and chains stay memory-contiguous (a single range).
//!
//! A submission that fails without going asynchronous is processed as an
//! inline completion with a negative result. Barrier operations are
//! serialized the simple way: everything in flight is drained first.

use std::io;
use std::sync::atomic::Ordering;

use windows_sys::Win32::Foundation::{
    ERROR_IO_PENDING, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

use crate::config::{Config, DriverKind};
use crate::driver::Driver;
use crate::engine::Engine;
use crate::error::Error;
use crate::flags::IoFlags;
use crate::list::NO_SLOT;
use crate::metrics;
use crate::ops::OpPayload;

struct OverlappedTable {
    records: Box<[std::cell::UnsafeCell<OVERLAPPED>]>,
}

// Safety: each record is used by exactly one in-flight submission at a
// time, handed between the submitter and the kernel.
unsafe impl Send for OverlappedTable {}
unsafe impl Sync for OverlappedTable {}

impl OverlappedTable {
    fn new(n: usize) -> OverlappedTable {
        OverlappedTable {
            records: (0..n)
                .map(|_| std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() }))
                .collect(),
        }
    }

    fn record(&self, idx: u32) -> *mut OVERLAPPED {
        self.records[idx as usize].get()
    }

    /// Back-resolve a completed OVERLAPPED to its slot index.
    fn index_of(&self, overlapped: *mut OVERLAPPED) -> Option<u32> {
        let base = self.records.as_ptr() as usize;
        let p = overlapped as usize;
        let stride = std::mem::size_of::<std::cell::UnsafeCell<OVERLAPPED>>();
        if p < base || (p - base) % stride != 0 {
            return None;
        }
        let idx = (p - base) / stride;
        (idx < self.records.len()).then_some(idx as u32)
    }
}

pub(crate) struct IocpDriver {
    port: HANDLE,
    overlapped: OverlappedTable,
}

// Safety: the port handle is thread-safe by contract.
unsafe impl Send for IocpDriver {}
unsafe impl Sync for IocpDriver {}

impl IocpDriver {
    pub fn new(config: &Config) -> Result<IocpDriver, Error> {
        // Safety: creating an unassociated port.
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(IocpDriver {
            port,
            overlapped: OverlappedTable::new(config.max_io_slots as usize),
        })
    }

    fn handle_of(fd: i32) -> HANDLE {
        // Descriptors are CRT fds; completions require the OS handle.
        unsafe { libc::get_osfhandle(fd) as HANDLE }
    }

    /// Associate a file's handle with the process port. Idempotent per
    /// handle; an already-associated handle fails harmlessly.
    fn register_handle(&self, fd: i32) {
        unsafe {
            CreateIoCompletionPort(Self::handle_of(fd), self.port, 0, 1);
        }
    }

    /// Start one read/write chain. Returns false if the submission failed
    /// and was completed inline.
    fn start_rw(&self, engine: &Engine, bid: u32, head: u32) -> bool {
        let slot = &engine.slots[head as usize];
        let op = slot.inner.lock().op;

        // Without scatter/gather the merge layer keeps chains contiguous
        // in memory, so the chain is one range starting at the head.
        let total: u32 = {
            let mut sum = 0;
            let mut cur = head;
            loop {
                let s = &engine.slots[cur as usize];
                sum += s.inner.lock().op.remaining().unwrap_or(0);
                let next = s.merge_with.load(Ordering::Relaxed);
                if next == NO_SLOT {
                    break;
                }
                cur = next;
            }
            sum
        };

        let offset = op.effective_offset();
        let data = op.effective_data().expect("rw op without memory range");
        let fd = op.fd().expect("rw op without descriptor");
        self.register_handle(fd);

        let overlapped = self.overlapped.record(head);
        // Safety: the record belongs to this in-flight submission.
        unsafe {
            *overlapped = std::mem::zeroed();
            (*overlapped).Anonymous.Anonymous.Offset = offset as u32;
            (*overlapped).Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        }

        let ok = unsafe {
            if op.is_read() {
                ReadFile(
                    Self::handle_of(fd),
                    data,
                    total,
                    std::ptr::null_mut(),
                    overlapped,
                )
            } else {
                WriteFile(
                    Self::handle_of(fd),
                    data,
                    total,
                    std::ptr::null_mut(),
                    overlapped,
                )
            }
        };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err != ERROR_IO_PENDING {
                self.complete_inline(engine, bid, head, -(err as i32));
                return false;
            }
        }
        true
    }

    fn complete_inline(&self, engine: &Engine, bid: u32, head: u32, result: i32) {
        let slot = &engine.slots[head as usize];
        slot.set_result(result);
        slot.update_flags(IoFlags::INFLIGHT, IoFlags::REAPED);
        {
            let backend = &engine.backends[bid as usize];
            let mut local = backend.local.lock();
            local.reaped.push_tail(&engine.slots, head);
        }
        crate::complete::settle_chain(engine, bid, head);
    }

    fn drain_internal(&self, engine: &Engine, bid: u32, block: bool) -> usize {
        let backend = &engine.backends[bid as usize];
        let mut n = 0;
        loop {
            let mut nbytes: u32 = 0;
            let mut key: usize = 0;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            let timeout = if n == 0 && block { 100 } else { 0 };

            let ok = unsafe {
                GetQueuedCompletionStatus(
                    self.port,
                    &mut nbytes,
                    &mut key as *mut usize,
                    &mut overlapped,
                    timeout,
                )
            };
            let result = if ok != 0 {
                nbytes as i32
            } else {
                if overlapped.is_null() {
                    break;
                }
                -(unsafe { GetLastError() } as i32)
            };

            let Some(idx) = self.overlapped.index_of(overlapped) else {
                continue;
            };
            let slot = &engine.slots[idx as usize];
            slot.set_result(result);
            slot.update_flags(IoFlags::INFLIGHT, IoFlags::REAPED);
            {
                let mut local = backend.local.lock();
                local.reaped.push_tail(&engine.slots, idx);
            }
            crate::complete::settle_chain(engine, bid, idx);
            n += 1;
        }
        n
    }
}

impl Driver for IocpDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::CompletionPort
    }

    fn can_scatter_gather(&self) -> bool {
        // ReadFileScatter/WriteFileGather only work on unbuffered files;
        // keep merging memory-contiguous instead.
        false
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

        for &head in &heads {
            let op = engine.slots[head as usize].inner.lock().op;
            backend.totals.submissions.fetch_add(1, Ordering::Relaxed);
            metrics::SUBMISSION_CALLS.increment();

            if op.no_reorder() {
                // Serialize: nothing of ours may still be in flight.
                while backend.inflight.load(Ordering::Acquire) > 1 {
                    self.drain_internal(engine, bid, true);
                }
            }

            match &op {
                OpPayload::None | OpPayload::Nop | OpPayload::FlushRange(_) => {
                    self.complete_inline(engine, bid, head, 0);
                }
                OpPayload::Fsync(f) => {
                    // No asynchronous flush; do it here.
                    let ok = unsafe { FlushFileBuffers(Self::handle_of(f.fd)) };
                    let result = if ok != 0 {
                        0
                    } else {
                        -(unsafe { GetLastError() } as i32)
                    };
                    self.complete_inline(engine, bid, head, result);
                }
                OpPayload::FsyncWal(f) => {
                    let ok = unsafe { FlushFileBuffers(Self::handle_of(f.fd)) };
                    let result = if ok != 0 {
                        0
                    } else {
                        -(unsafe { GetLastError() } as i32)
                    };
                    self.complete_inline(engine, bid, head, result);
                }
                _ => {
                    self.start_rw(engine, bid, head);
                }
            }
        }

        for &head in &heads {
            engine.wake_chain(head);
        }
        heads.len()
    }

    fn drain(&self, engine: &Engine, bid: u32, _context: u32) -> usize {
        self.drain_internal(engine, bid, false)
    }

    fn wait_one(&self, engine: &Engine, bid: u32, idx: u32, ref_generation: u64) {
        let slot = &engine.slots[idx as usize];
        if slot.generation() != ref_generation || !slot.flags().contains(IoFlags::INFLIGHT) {
            return;
        }
        self.drain_internal(engine, bid, true);
    }

    fn shutdown(&self, _engine: &Engine) {
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.port);
        }
    }
}
