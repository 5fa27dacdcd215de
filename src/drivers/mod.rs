//! Kernel driver implementations.

pub(crate) mod worker;

#[cfg(all(target_os = "linux", feature = "uring"))]
pub(crate) mod uring;

#[cfg(all(unix, feature = "posix-aio"))]
pub(crate) mod posix;

#[cfg(windows)]
pub(crate) mod iocp;
