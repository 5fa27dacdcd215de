use std::io;

use thiserror::Error;

/// Errors returned by engine setup and administrative operations.
///
/// Failures of individual I/O operations never surface here — they travel
/// through each slot's result and failure flags.
#[derive(Debug, Error)]
pub enum Error {
    /// Engine or driver setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A configuration value is out of range.
    #[error("config: {0}")]
    Config(String),
    /// The requested driver is not compiled in or not supported on this
    /// platform.
    #[error("driver not available: {0}")]
    DriverUnavailable(&'static str),
    /// All backend registrations are taken.
    #[error("backend limit reached")]
    BackendLimitReached,
    /// Reopening a descriptor for a retry failed; the operation is reported
    /// as permanently failed.
    #[error("reopen for retry: {0}")]
    Reopen(io::Error),
}
