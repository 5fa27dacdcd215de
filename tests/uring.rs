//! Integration tests: the io_uring driver end to end.
//!
//! Skipped at runtime when the kernel lacks io_uring (containers and CI
//! runners with seccomp filters commonly reject the syscalls).
#![cfg(all(target_os = "linux", feature = "uring"))]

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;

use aiocore::{BufferTag, ConfigBuilder, DriverKind, EngineBuilder};

/// Check if io_uring is usable on this kernel.
fn io_uring_supported() -> bool {
    let ret = unsafe { libc::syscall(libc::SYS_io_uring_setup, 1u32, std::ptr::null_mut::<u8>()) };
    // EFAULT (bad params pointer) means the syscall exists; ENOSYS means
    // it doesn't, EPERM that it is filtered.
    if ret >= 0 {
        unsafe { libc::close(ret as i32) };
        return true;
    }
    !matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ENOSYS) | Some(libc::EPERM)
    )
}

fn tag(rel: u32) -> BufferTag {
    BufferTag {
        db: 1,
        rel,
        fork: 0,
        block: 0,
    }
}

#[test]
fn uring_read_write_roundtrip() {
    if !io_uring_supported() {
        eprintln!("skipping: io_uring not supported here");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks");
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    file.write_all(&vec![0u8; 32768]).unwrap();
    file.sync_all().unwrap();

    let config = ConfigBuilder::new()
        .driver(DriverKind::Uring)
        .max_io_slots(64)
        .num_contexts(2)
        .build()
        .unwrap();
    let engine = EngineBuilder::new(config).build().unwrap();
    let backend = engine.register_backend().unwrap();

    // Write a pattern, fsync, then read it back through a merged chain.
    let data: Vec<u8> = (0..32768u32).map(|i| (i % 253) as u8).collect();
    let w = backend.acquire();
    unsafe {
        backend.start_write_buffer(w, &tag(1), file.as_raw_fd(), 0, 32768, data.as_ptr(), 1);
    }
    let s = backend.acquire();
    backend.start_fsync(s, file.as_raw_fd(), None, false);
    backend.submit_pending(true);
    backend.wait(w);
    backend.wait(s);
    assert_eq!(backend.result(w), 32768);
    assert!(backend.is_successful(w));
    assert!(backend.is_successful(s));
    backend.release(w);
    backend.release(s);

    // Four sequential reads into one contiguous buffer merge into a
    // single vectored submission.
    let mut readback = vec![0u8; 32768];
    let ios: Vec<_> = (0..4)
        .map(|n| {
            let io = backend.acquire();
            unsafe {
                backend.start_read_buffer(
                    io,
                    &tag(1),
                    file.as_raw_fd(),
                    n as u64 * 8192,
                    8192,
                    readback.as_mut_ptr().add(n * 8192),
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
    assert_eq!(readback, data);

    let stats = engine
        .backend_stats()
        .into_iter()
        .find(|row| row.backend_id == backend.id())
        .unwrap();
    assert!(stats.issued_total < stats.executed_total, "reads never merged");

    drop(backend);
    engine.shutdown();
    assert_eq!(engine.slots_in_use(), 0);

    // Silence the unused warning; the file must outlive the submissions.
    drop(file);
    let mut check = vec![0u8; 4];
    let mut f = std::fs::File::open(&path).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f.read_exact(&mut check).unwrap();
    assert_eq!(&check, &data[0..4]);
}

#[test]
fn uring_nop_completes() {
    if !io_uring_supported() {
        eprintln!("skipping: io_uring not supported here");
        return;
    }

    let config = ConfigBuilder::new()
        .driver(DriverKind::Uring)
        .max_io_slots(8)
        .num_contexts(1)
        .build()
        .unwrap();
    let engine = EngineBuilder::new(config).build().unwrap();
    let backend = engine.register_backend().unwrap();

    let io = backend.acquire();
    backend.start_nop(io);
    backend.submit_pending(true);
    backend.wait(io);
    assert!(backend.is_successful(io));
    assert_eq!(backend.result(io), 0);
    backend.release(io);

    drop(backend);
    engine.shutdown();
}
