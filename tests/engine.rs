//! Integration tests: full I/O lifecycle on the worker driver.
//!
//! These run on any Unix platform: the worker driver performs I/O with
//! plain preadv/pwritev, either in worker threads or synchronously in the
//! submitting backend (workers = 0), which makes retry interleavings
//! deterministic.
#![cfg(unix)]

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use aiocore::{
    BufferTag, Config, ConfigBuilder, DriverKind, FileResolver, MemoryRegion, WalSegment,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Resolver mapping tags to files in a temp directory, with a descriptor
/// cache the way a storage manager would keep one.
struct DirResolver {
    dir: PathBuf,
    cache: Mutex<HashMap<BufferTag, File>>,
}

impl DirResolver {
    fn new(dir: &Path) -> Arc<DirResolver> {
        Arc::new(DirResolver {
            dir: dir.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn block_path(dir: &Path, tag: &BufferTag) -> PathBuf {
        dir.join(format!("rel_{}_{}_{}", tag.db, tag.rel, tag.fork))
    }

    fn wal_path(dir: &Path, seg: &WalSegment) -> PathBuf {
        dir.join(format!("wal_{}_{}", seg.timeline, seg.segno))
    }
}

impl FileResolver for DirResolver {
    fn reopen_buffered(&self, tag: &BufferTag) -> io::Result<i32> {
        let mut cache = self.cache.lock().unwrap();
        if !cache.contains_key(tag) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(Self::block_path(&self.dir, tag))?;
            cache.insert(*tag, file);
        }
        Ok(cache[tag].as_raw_fd())
    }

    fn open_wal_segment(&self, seg: &WalSegment) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::wal_path(&self.dir, seg))
    }
}

/// A shared buffer arena the worker driver will accept as shared memory.
/// Leaked so its lifetime covers the engine's.
struct Arena {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(len: usize) -> Arena {
        let slab: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Arena {
            ptr: slab.as_mut_ptr(),
            len,
        }
    }

    fn region(&self) -> MemoryRegion {
        MemoryRegion {
            ptr: self.ptr,
            len: self.len,
        }
    }

    fn at(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len);
        unsafe { self.ptr.add(offset) }
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.at(offset), len) }
    }

    fn fill(&self, offset: usize, len: usize, byte: u8) {
        unsafe { std::ptr::write_bytes(self.at(offset), byte, len) };
    }
}

fn worker_config(arena: &Arena, workers: u32) -> Config {
    ConfigBuilder::new()
        .driver(DriverKind::Worker)
        .max_io_slots(64)
        .max_backends(8)
        .io_max_concurrency(16)
        .workers(workers)
        .worker_queue_size(32)
        .bounce_buffers(4, 8192)
        .shared_region(arena.region())
        .build()
        .expect("invalid config")
}

fn tag(rel: u32) -> BufferTag {
    BufferTag {
        db: 1,
        rel,
        fork: 0,
        block: 0,
    }
}

/// Create a block file of `len` patterned bytes and return it opened.
fn create_block_file(dir: &Path, t: &BufferTag, len: usize) -> File {
    let path = DirResolver::block_path(dir, t);
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    file.write_all(&data).unwrap();
    file.sync_all().unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file
}

// ── Simple read ─────────────────────────────────────────────────────

#[test]
fn simple_read_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let t = tag(1);
    let file = create_block_file(dir.path(), &t, 8192);

    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 1))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    let io = backend.acquire();
    let r = backend.io_ref(io);
    unsafe {
        backend.start_read_buffer(io, &t, file.as_raw_fd(), 0, 8192, arena.at(0), 1, 0);
    }
    backend.submit_pending(true);
    backend.wait(io);

    assert!(backend.is_done(io));
    assert!(backend.is_successful(io));
    assert_eq!(backend.result(io), 8192);
    let expect: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
    assert_eq!(arena.slice(0, 8192), &expect[..]);

    backend.release(io);

    // The reference now points at a recycled slot: generation moved on.
    let io2 = backend.acquire();
    assert_eq!(io2.index(), io.index());
    let r2 = backend.io_ref(io2);
    assert_eq!(r2.index(), r.index());
    assert!(r2.generation() > r.generation());
    backend.release(io2);

    drop(backend);
    engine.shutdown();
    assert_eq!(engine.slots_in_use(), 0);
}

// ── Merging ─────────────────────────────────────────────────────────

#[test]
fn four_sequential_reads_merge_into_one_submission() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let t = tag(2);
    let file = create_block_file(dir.path(), &t, 32768);

    // Zero workers: the submitting backend executes synchronously, so the
    // merge happens in a deterministic single batch.
    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 0))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    let ios: Vec<_> = (0..4)
        .map(|n| {
            let io = backend.acquire();
            unsafe {
                backend.start_read_buffer(
                    io,
                    &t,
                    file.as_raw_fd(),
                    n as u64 * 8192,
                    8192,
                    arena.at(n * 8192),
                    n as i32,
                    0,
                );
            }
            io
        })
        .collect();

    backend.submit_pending(true);
    for &io in &ios {
        backend.wait(io);
        assert_eq!(backend.result(io), 8192);
        assert!(backend.is_successful(io));
    }

    // Four logical ops, one kernel entry.
    let stats = engine
        .backend_stats()
        .into_iter()
        .find(|row| row.backend_id == backend.id())
        .unwrap();
    assert_eq!(stats.executed_total, 4);
    assert_eq!(stats.issued_total, 1);

    let expect: Vec<u8> = (0..32768).map(|i| (i % 251) as u8).collect();
    assert_eq!(arena.slice(0, 32768), &expect[..]);

    for io in ios {
        backend.release(io);
    }
    drop(backend);
    engine.shutdown();
}

// ── Short read and retry ────────────────────────────────────────────

#[test]
fn short_read_soft_fails_then_retries_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let t = tag(3);
    // Only 12288 of the 16384 requested bytes exist yet.
    let file = create_block_file(dir.path(), &t, 12288);

    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 0))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    let io1 = backend.acquire();
    let io2 = backend.acquire();
    unsafe {
        backend.start_read_buffer(io1, &t, file.as_raw_fd(), 0, 8192, arena.at(0), 1, 0);
        backend.start_read_buffer(io2, &t, file.as_raw_fd(), 8192, 8192, arena.at(8192), 2, 0);
    }

    // The merged read comes back short: the first op completes, the
    // second gets 4096 bytes and is flagged for retry.
    backend.submit_pending(true);
    backend.wait(io1);
    assert_eq!(backend.result(io1), 8192);

    // Now the rest of the file appears; the retry picks it up.
    let mut f = OpenOptions::new()
        .write(true)
        .open(DirResolver::block_path(dir.path(), &t))
        .unwrap();
    f.seek(SeekFrom::Start(12288)).unwrap();
    f.write_all(&vec![7u8; 4096]).unwrap();
    f.sync_all().unwrap();

    backend.wait(io2);
    assert!(backend.is_done(io2));
    assert!(backend.is_successful(io2));

    let stats = engine
        .backend_stats()
        .into_iter()
        .find(|row| row.backend_id == backend.id())
        .unwrap();
    assert!(stats.retry_total >= 1, "expected at least one retry");

    // First 4096 bytes of the second block came from the original file,
    // the rest from the extension.
    let expect_head: Vec<u8> = (8192..12288).map(|i| (i % 251) as u8).collect();
    assert_eq!(arena.slice(8192, 4096), &expect_head[..]);
    assert_eq!(arena.slice(12288, 4096), &vec![7u8; 4096][..]);

    backend.release(io1);
    backend.release(io2);
    drop(backend);
    engine.shutdown();
}

// ── Cross-backend completion ────────────────────────────────────────

#[test]
fn abandoned_write_is_completed_and_recycled_by_another_backend() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let t = tag(4);
    let file = create_block_file(dir.path(), &t, 8192);

    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 1))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let initiator = engine.register_backend().unwrap();
    let observer = engine.register_backend().unwrap();

    arena.fill(0, 8192, 0xAB);
    let io = initiator.acquire();
    let r = initiator.io_ref(io);
    unsafe {
        initiator.start_write_buffer(io, &t, file.as_raw_fd(), 0, 8192, arena.at(0), 1);
    }
    initiator.submit_pending(false);

    // Walk away: the worker backend observes the completion and recycles
    // the slot, decrementing the initiator's in-flight count.
    initiator.release(io);
    observer.wait_io_ref(r);

    // The initiator's in-flight count must come back to zero exactly once
    // the completion has been processed.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let stats = engine
            .backend_stats()
            .into_iter()
            .find(|row| row.backend_id == initiator.id())
            .unwrap();
        if stats.inflight == 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "slot never recycled");
        std::thread::yield_now();
    }

    let mut readback = vec![0u8; 8192];
    let mut f = File::open(DirResolver::block_path(dir.path(), &t)).unwrap();
    f.read_exact(&mut readback).unwrap();
    assert_eq!(readback, vec![0xAB; 8192]);

    drop(observer);
    drop(initiator);
    engine.shutdown();
    // Every slot has gone back to the free pool, generation advanced.
    assert_eq!(engine.slots_in_use(), 0);
}

// ── Concurrency cap ─────────────────────────────────────────────────

#[test]
fn concurrency_cap_bounds_inflight() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let t = tag(5);
    let file = create_block_file(dir.path(), &t, 48 * 1024);

    let config = ConfigBuilder::new()
        .driver(DriverKind::Worker)
        .max_io_slots(64)
        .io_max_concurrency(2)
        .workers(1)
        .worker_queue_size(32)
        .shared_region(arena.region())
        .build()
        .unwrap();
    let engine = aiocore::EngineBuilder::new(config)
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let max_seen = Arc::new(AtomicU32::new(0));
    let sampler = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        let max_seen = Arc::clone(&max_seen);
        let bid = backend.id();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                if let Some(row) = engine
                    .backend_stats()
                    .into_iter()
                    .find(|row| row.backend_id == bid)
                {
                    max_seen.fetch_max(row.inflight, Ordering::AcqRel);
                }
                std::thread::yield_now();
            }
        })
    };

    // Three non-adjacent reads (gaps prevent merging); the third cannot
    // enter the kernel until one of the first two completes.
    let ios: Vec<_> = (0..3)
        .map(|n| {
            let io = backend.acquire();
            unsafe {
                backend.start_read_buffer(
                    io,
                    &t,
                    file.as_raw_fd(),
                    n as u64 * 16384,
                    8192,
                    arena.at(n * 16384),
                    n as i32,
                    0,
                );
            }
            io
        })
        .collect();
    backend.submit_pending(true);

    for &io in &ios {
        backend.wait(io);
        assert_eq!(backend.result(io), 8192);
        backend.release(io);
    }

    stop.store(true, Ordering::Release);
    sampler.join().unwrap();
    assert!(
        max_seen.load(Ordering::Acquire) <= 2,
        "inflight exceeded the cap"
    );

    drop(backend);
    engine.shutdown();
}

// ── Stable references across reuse ──────────────────────────────────

#[test]
fn stale_reference_reports_completion_without_touching_new_op() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(4096);

    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 0))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    let io = backend.acquire();
    let stale = backend.io_ref(io);
    backend.start_nop(io);
    backend.submit_pending(true);
    backend.wait(io);
    backend.release(io);

    // The local free pool hands the same slot straight back.
    let io2 = backend.acquire();
    assert_eq!(io2.index(), io.index());
    backend.start_nop(io2);

    // Waiting on the stale reference returns immediately and leaves the
    // unrelated new operation untouched.
    backend.wait_io_ref(stale);
    assert!(!backend.is_done(io2));

    backend.submit_pending(true);
    backend.wait(io2);
    assert!(backend.is_done(io2));
    backend.release(io2);

    drop(backend);
    engine.shutdown();
}

// ── WAL writes through a worker ─────────────────────────────────────

#[test]
fn wal_write_and_fsync_via_worker_fd_cache() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let seg = WalSegment {
        timeline: 1,
        segno: 42,
    };
    {
        let mut f = File::create(DirResolver::wal_path(dir.path(), &seg)).unwrap();
        f.write_all(&vec![0u8; 16384]).unwrap();
    }
    let wal = OpenOptions::new()
        .read(true)
        .write(true)
        .open(DirResolver::wal_path(dir.path(), &seg))
        .unwrap();

    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 1))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    arena.fill(0, 8192, 0x5A);
    let w = backend.acquire();
    unsafe {
        backend.start_write_wal(w, wal.as_raw_fd(), seg, 0, 8192, arena.at(0), false, 1);
    }
    let s = backend.acquire();
    backend.start_fsync_wal(s, wal.as_raw_fd(), seg, false, true, 1);

    backend.submit_pending(true);
    backend.wait(w);
    backend.wait(s);
    assert_eq!(backend.result(w), 8192);
    assert!(backend.is_successful(w));
    assert!(backend.is_successful(s));

    let mut readback = vec![0u8; 8192];
    let mut f = File::open(DirResolver::wal_path(dir.path(), &seg)).unwrap();
    f.read_exact(&mut readback).unwrap();
    assert_eq!(readback, vec![0x5A; 8192]);

    backend.release(w);
    backend.release(s);
    drop(backend);
    engine.shutdown();
}

// ── Bounce buffers ──────────────────────────────────────────────────

#[test]
fn bounce_buffers_recycle_through_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(4096);
    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 0))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    // Drain the pool completely, then hand everything back.
    let all: Vec<_> = (0..4).map(|_| backend.bounce_buffer_acquire()).collect();
    for &bb in &all {
        let (ptr, len) = backend.bounce_buffer_data(bb);
        assert!(!ptr.is_null());
        assert_eq!(len, 8192);
    }
    for bb in all {
        backend.bounce_buffer_release(bb);
    }

    // A slot holds its own reference; releasing the slot returns the
    // buffer to the pool.
    let bb = backend.bounce_buffer_acquire();
    let io = backend.acquire();
    backend.bounce_buffer_associate(io, bb);
    backend.bounce_buffer_release(bb);
    backend.release(io);

    let again: Vec<_> = (0..4).map(|_| backend.bounce_buffer_acquire()).collect();
    for bb in again {
        backend.bounce_buffer_release(bb);
    }

    drop(backend);
    engine.shutdown();
}

// ── Introspection ───────────────────────────────────────────────────

#[test]
fn introspection_rows_render() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(4096);
    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 0))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    let io = backend.acquire();
    backend.start_nop(io);

    // Still staged: the slot view must show the pending operation.
    let rows = engine.slot_rows();
    let row = rows.iter().find(|r| r.index == io.index() as u32).unwrap();
    assert_eq!(row.op, "nop");
    assert!(row.flags.contains("PENDING"), "flags were: {}", row.flags);
    assert_eq!(row.owner, Some(backend.id()));
    assert!(row.to_string().contains("action: nop"));

    let dump = engine.dump_queues();
    assert!(dump.contains("driver: worker"));
    assert!(dump.contains("inflight backend:"));

    backend.submit_pending(true);
    backend.wait(io);
    backend.release(io);

    let stats = engine.backend_stats();
    assert!(stats.iter().any(|r| r.backend_id == backend.id()));

    drop(backend);
    engine.shutdown();
}

// ── Hard failures ───────────────────────────────────────────────────

#[test]
fn hard_failure_propagates_through_a_merged_chain() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let t = tag(7);

    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 0))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    // Two adjacent reads on a dead descriptor merge into one chain; the
    // kernel error is copied to every member and surfaced as a permanent
    // failure, not a retry (EBADF is not transient).
    let io1 = backend.acquire();
    let io2 = backend.acquire();
    unsafe {
        backend.start_read_buffer(io1, &t, -1, 0, 8192, arena.at(0), 1, 0);
        backend.start_read_buffer(io2, &t, -1, 8192, 8192, arena.at(8192), 2, 0);
    }
    backend.submit_pending(true);
    backend.wait(io1);
    backend.wait(io2);

    assert!(backend.is_done(io1));
    assert!(backend.is_done(io2));
    assert!(!backend.is_successful(io1));
    assert!(!backend.is_successful(io2));
    assert_eq!(backend.result(io1), -libc::EBADF);
    assert_eq!(backend.result(io2), -libc::EBADF);

    backend.release(io1);
    backend.release(io2);
    drop(backend);
    engine.shutdown();
    assert_eq!(engine.slots_in_use(), 0);
}

// ── Local callbacks ─────────────────────────────────────────────────

#[test]
fn local_callback_runs_in_initiator_with_result() {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::new(64 * 1024);
    let t = tag(6);
    let file = create_block_file(dir.path(), &t, 8192);

    let engine = aiocore::EngineBuilder::new(worker_config(&arena, 1))
        .resolver(DirResolver::new(dir.path()))
        .build()
        .unwrap();
    let backend = engine.register_backend().unwrap();

    let seen = Arc::new(AtomicU32::new(0));
    let io = backend.acquire();
    {
        let seen = Arc::clone(&seen);
        backend.on_completion_local(
            io,
            Box::new(move |result| {
                seen.store(result as u32, Ordering::Release);
            }),
        );
    }
    unsafe {
        backend.start_read_buffer(io, &t, file.as_raw_fd(), 0, 8192, arena.at(0), 1, 0);
    }
    backend.submit_pending(true);
    backend.wait(io);

    assert_eq!(seen.load(Ordering::Acquire), 8192);
    backend.release(io);
    drop(backend);
    engine.shutdown();
}
