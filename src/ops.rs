//! Operation kinds and their parameter payloads.
//!
//! Every slot carries one of eight operation types. The payload mirrors
//! whatever the kernel call needs (descriptor, file range, memory range,
//! progress accounting for retries) plus an identifying tag from which a
//! fresh descriptor can be opened in another backend (descriptors stored
//! here must never be relied on across backends; they may belong to a
//! different process image or have been closed since submission).

use std::fmt;

#[cfg(unix)]
use std::os::fd::RawFd;
/// CRT file descriptor, as used by the completion-port driver.
#[cfg(windows)]
pub type RawFd = i32;

/// Operation type, also the index into the shared-callback registry.
///
/// Stored in slots as a raw `u8` so the discriminant, not a function
/// pointer, is what crosses backend boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Nop = 1,
    Fsync = 2,
    FsyncWal = 3,
    FlushRange = 4,
    ReadBuffer = 5,
    WriteBuffer = 6,
    WriteWal = 7,
    WriteGeneric = 8,
}

/// One past the largest `OpKind` discriminant; registry table size.
pub(crate) const OP_KIND_SLOTS: usize = 9;

impl OpKind {
    pub fn from_u8(v: u8) -> Option<OpKind> {
        match v {
            1 => Some(OpKind::Nop),
            2 => Some(OpKind::Fsync),
            3 => Some(OpKind::FsyncWal),
            4 => Some(OpKind::FlushRange),
            5 => Some(OpKind::ReadBuffer),
            6 => Some(OpKind::WriteBuffer),
            7 => Some(OpKind::WriteWal),
            8 => Some(OpKind::WriteGeneric),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Nop => "nop",
            OpKind::Fsync => "fsync",
            OpKind::FsyncWal => "fsync_wal",
            OpKind::FlushRange => "flush_range",
            OpKind::ReadBuffer => "read_buffer",
            OpKind::WriteBuffer => "write_buffer",
            OpKind::WriteWal => "write_wal",
            OpKind::WriteGeneric => "write_generic",
        }
    }

    /// Only buffer reads and writes may travel the soft-failure retry path.
    pub fn retryable(self) -> bool {
        matches!(self, OpKind::ReadBuffer | OpKind::WriteBuffer)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a buffered block independently of any file descriptor, so the
/// retry path and worker backends can (re)open the file through the
/// caller-provided [`FileResolver`](crate::FileResolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub db: u32,
    pub rel: u32,
    pub fork: u8,
    pub block: u32,
}

/// Identifies a write-ahead-log segment for descriptor-independent reopening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalSegment {
    pub timeline: u32,
    pub segno: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FsyncOp {
    pub fd: RawFd,
    /// Set when the descriptor names a WAL segment a worker can reopen.
    pub segment: Option<WalSegment>,
    pub barrier: bool,
    pub datasync: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FsyncWalOp {
    pub fd: RawFd,
    pub segment: Option<WalSegment>,
    pub barrier: bool,
    pub datasync: bool,
    /// Flush sequence number handed back to the WAL module's callback.
    pub flush_no: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushRangeOp {
    pub fd: RawFd,
    pub offset: u64,
    pub nbytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadBufferOp {
    pub fd: RawFd,
    pub offset: u64,
    pub nbytes: u32,
    pub already_done: u32,
    pub data: *mut u8,
    /// Buffer-manager buffer id, passed through to its callback.
    pub buffer_id: i32,
    pub tag: BufferTag,
    pub mode: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteBufferOp {
    pub fd: RawFd,
    pub offset: u64,
    pub nbytes: u32,
    pub already_done: u32,
    pub data: *const u8,
    pub buffer_id: i32,
    pub tag: BufferTag,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteWalOp {
    pub fd: RawFd,
    pub segment: WalSegment,
    pub offset: u64,
    pub nbytes: u32,
    pub already_done: u32,
    pub data: *const u8,
    pub no_reorder: bool,
    /// Write sequence number handed back to the WAL module's callback.
    pub write_no: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteGenericOp {
    pub fd: RawFd,
    pub offset: u64,
    pub nbytes: u32,
    pub already_done: u32,
    pub data: *const u8,
    pub no_reorder: bool,
}

/// Parameters for one prepared operation.
#[derive(Debug, Clone, Copy, Default)]
pub enum OpPayload {
    /// Nothing prepared (slot idle or recycled).
    #[default]
    None,
    Nop,
    Fsync(FsyncOp),
    FsyncWal(FsyncWalOp),
    FlushRange(FlushRangeOp),
    ReadBuffer(ReadBufferOp),
    WriteBuffer(WriteBufferOp),
    WriteWal(WriteWalOp),
    WriteGeneric(WriteGenericOp),
}

// Safety: payloads carry raw pointers into caller-owned buffer regions whose
// lifetime spans the engine (the same contract the kernel gets). The engine's
// ownership rules determine which backend may dereference them.
unsafe impl Send for OpPayload {}
unsafe impl Sync for OpPayload {}

impl OpPayload {
    pub fn kind(&self) -> Option<OpKind> {
        match self {
            OpPayload::None => None,
            OpPayload::Nop => Some(OpKind::Nop),
            OpPayload::Fsync(_) => Some(OpKind::Fsync),
            OpPayload::FsyncWal(_) => Some(OpKind::FsyncWal),
            OpPayload::FlushRange(_) => Some(OpKind::FlushRange),
            OpPayload::ReadBuffer(_) => Some(OpKind::ReadBuffer),
            OpPayload::WriteBuffer(_) => Some(OpKind::WriteBuffer),
            OpPayload::WriteWal(_) => Some(OpKind::WriteWal),
            OpPayload::WriteGeneric(_) => Some(OpKind::WriteGeneric),
        }
    }

    /// Descriptor the operation was prepared with, if any.
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            OpPayload::None | OpPayload::Nop => None,
            OpPayload::Fsync(op) => Some(op.fd),
            OpPayload::FsyncWal(op) => Some(op.fd),
            OpPayload::FlushRange(op) => Some(op.fd),
            OpPayload::ReadBuffer(op) => Some(op.fd),
            OpPayload::WriteBuffer(op) => Some(op.fd),
            OpPayload::WriteWal(op) => Some(op.fd),
            OpPayload::WriteGeneric(op) => Some(op.fd),
        }
    }

    /// Transfer length still outstanding (`nbytes - already_done`), for
    /// transfer-style operations.
    pub fn remaining(&self) -> Option<u32> {
        match self {
            OpPayload::ReadBuffer(op) => Some(op.nbytes - op.already_done),
            OpPayload::WriteBuffer(op) => Some(op.nbytes - op.already_done),
            OpPayload::WriteWal(op) => Some(op.nbytes - op.already_done),
            OpPayload::WriteGeneric(op) => Some(op.nbytes - op.already_done),
            _ => None,
        }
    }

    /// Declared transfer length, for transfer-style operations.
    pub fn nbytes(&self) -> Option<u32> {
        match self {
            OpPayload::ReadBuffer(op) => Some(op.nbytes),
            OpPayload::WriteBuffer(op) => Some(op.nbytes),
            OpPayload::WriteWal(op) => Some(op.nbytes),
            OpPayload::WriteGeneric(op) => Some(op.nbytes),
            _ => None,
        }
    }

    pub fn already_done(&self) -> u32 {
        match self {
            OpPayload::ReadBuffer(op) => op.already_done,
            OpPayload::WriteBuffer(op) => op.already_done,
            OpPayload::WriteWal(op) => op.already_done,
            OpPayload::WriteGeneric(op) => op.already_done,
            _ => 0,
        }
    }

    pub(crate) fn add_already_done(&mut self, n: u32) {
        match self {
            OpPayload::ReadBuffer(op) => op.already_done += n,
            OpPayload::WriteBuffer(op) => op.already_done += n,
            OpPayload::WriteWal(op) => op.already_done += n,
            OpPayload::WriteGeneric(op) => op.already_done += n,
            _ => {}
        }
    }

    /// Kernel file offset for the next (re)issue: declared offset plus
    /// whatever a previous short transfer already moved.
    pub(crate) fn effective_offset(&self) -> u64 {
        match self {
            OpPayload::FlushRange(op) => op.offset,
            OpPayload::ReadBuffer(op) => op.offset + op.already_done as u64,
            OpPayload::WriteBuffer(op) => op.offset + op.already_done as u64,
            OpPayload::WriteWal(op) => op.offset + op.already_done as u64,
            OpPayload::WriteGeneric(op) => op.offset + op.already_done as u64,
            _ => 0,
        }
    }

    /// Start of the memory range still to transfer.
    pub(crate) fn effective_data(&self) -> Option<*mut u8> {
        match self {
            OpPayload::ReadBuffer(op) => Some(unsafe { op.data.add(op.already_done as usize) }),
            OpPayload::WriteBuffer(op) => {
                Some(unsafe { op.data.add(op.already_done as usize) as *mut u8 })
            }
            OpPayload::WriteWal(op) => {
                Some(unsafe { op.data.add(op.already_done as usize) as *mut u8 })
            }
            OpPayload::WriteGeneric(op) => {
                Some(unsafe { op.data.add(op.already_done as usize) as *mut u8 })
            }
            _ => None,
        }
    }

    /// Whether later operations in the same context must not overtake this one.
    pub(crate) fn no_reorder(&self) -> bool {
        match self {
            OpPayload::Fsync(op) => op.barrier,
            OpPayload::FsyncWal(op) => op.barrier,
            OpPayload::WriteWal(op) => op.no_reorder,
            OpPayload::WriteGeneric(op) => op.no_reorder,
            _ => false,
        }
    }

    pub(crate) fn is_read(&self) -> bool {
        matches!(self, OpPayload::ReadBuffer(_))
    }

    /// WAL segment a worker backend could reopen, if the op names one.
    pub(crate) fn wal_segment(&self) -> Option<WalSegment> {
        match self {
            OpPayload::Fsync(op) => op.segment,
            OpPayload::FsyncWal(op) => op.segment,
            OpPayload::WriteWal(op) => Some(op.segment),
            _ => None,
        }
    }

    /// Render the op parameters for diagnostics, one line, key: value pairs.
    pub(crate) fn describe(&self, out: &mut String) {
        use std::fmt::Write;

        match self {
            OpPayload::None => {}
            OpPayload::Nop => {}
            OpPayload::Fsync(op) => {
                let _ = write!(
                    out,
                    "fd: {}, datasync: {}, barrier: {}",
                    op.fd, op.datasync, op.barrier
                );
            }
            OpPayload::FsyncWal(op) => {
                let _ = write!(
                    out,
                    "fd: {}, datasync: {}, barrier: {}, flush_no: {}",
                    op.fd, op.datasync, op.barrier, op.flush_no
                );
            }
            OpPayload::FlushRange(op) => {
                let _ = write!(
                    out,
                    "fd: {}, offset: {}, nbytes: {}",
                    op.fd, op.offset, op.nbytes
                );
            }
            OpPayload::ReadBuffer(op) => {
                let _ = write!(
                    out,
                    "fd: {}, mode: {}, offset: {}, nbytes: {}, already_done: {}, buf/data: {}/{:p}",
                    op.fd, op.mode, op.offset, op.nbytes, op.already_done, op.buffer_id, op.data
                );
            }
            OpPayload::WriteBuffer(op) => {
                let _ = write!(
                    out,
                    "fd: {}, offset: {}, nbytes: {}, already_done: {}, buf/data: {}/{:p}",
                    op.fd, op.offset, op.nbytes, op.already_done, op.buffer_id, op.data
                );
            }
            OpPayload::WriteWal(op) => {
                let _ = write!(
                    out,
                    "fd: {}, offset: {}, nbytes: {}, already_done: {}, data: {:p}, no-reorder: {}",
                    op.fd, op.offset, op.nbytes, op.already_done, op.data, op.no_reorder
                );
            }
            OpPayload::WriteGeneric(op) => {
                let _ = write!(
                    out,
                    "fd: {}, offset: {}, nbytes: {}, already_done: {}, data: {:p}, no-reorder: {}",
                    op.fd, op.offset, op.nbytes, op.already_done, op.data, op.no_reorder
                );
            }
        }
    }
}

/// Append the memory range of `op` to `iovs`, fusing with the previous entry
/// when the ranges are contiguous in memory.
///
/// Used when flattening a merged chain into a scatter/gather array; the
/// result can therefore have fewer entries than the chain has members.
pub(crate) fn push_iov(iovs: &mut Vec<libc::iovec>, op: &OpPayload) {
    let base = op
        .effective_data()
        .expect("operation has no memory range to transfer");
    let len = op.remaining().unwrap_or(0) as usize;

    if let Some(last) = iovs.last_mut() {
        if unsafe { (last.iov_base as *mut u8).add(last.iov_len) } == base {
            last.iov_len += len;
            return;
        }
    }
    iovs.push(libc::iovec {
        iov_base: base as *mut libc::c_void,
        iov_len: len,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_op(offset: u64, nbytes: u32, data: *mut u8) -> OpPayload {
        OpPayload::ReadBuffer(ReadBufferOp {
            fd: 3,
            offset,
            nbytes,
            already_done: 0,
            data,
            buffer_id: 0,
            tag: BufferTag {
                db: 1,
                rel: 2,
                fork: 0,
                block: 0,
            },
            mode: 0,
        })
    }

    #[test]
    fn kind_round_trip() {
        for v in 0..=9u8 {
            if let Some(kind) = OpKind::from_u8(v) {
                assert_eq!(kind as u8, v);
            } else {
                assert!(v == 0 || v == 9);
            }
        }
    }

    #[test]
    fn retryable_kinds() {
        assert!(OpKind::ReadBuffer.retryable());
        assert!(OpKind::WriteBuffer.retryable());
        assert!(!OpKind::WriteWal.retryable());
        assert!(!OpKind::Fsync.retryable());
        assert!(!OpKind::Nop.retryable());
    }

    #[test]
    fn already_done_moves_offset_and_data() {
        let mut buf = [0u8; 8192];
        let mut op = read_op(16384, 8192, buf.as_mut_ptr());
        assert_eq!(op.effective_offset(), 16384);
        op.add_already_done(4096);
        assert_eq!(op.effective_offset(), 16384 + 4096);
        assert_eq!(op.remaining(), Some(4096));
        assert_eq!(op.effective_data().unwrap(), unsafe {
            buf.as_mut_ptr().add(4096)
        });
    }

    #[test]
    fn iov_fusion_of_contiguous_memory() {
        let mut buf = [0u8; 16384];
        let a = read_op(0, 8192, buf.as_mut_ptr());
        let b = read_op(8192, 8192, unsafe { buf.as_mut_ptr().add(8192) });

        let mut iovs = Vec::new();
        push_iov(&mut iovs, &a);
        push_iov(&mut iovs, &b);
        assert_eq!(iovs.len(), 1);
        assert_eq!(iovs[0].iov_len, 16384);
    }

    #[test]
    fn iov_no_fusion_of_disjoint_memory() {
        let mut x = [0u8; 8192];
        let mut y = [0u8; 8192];
        let a = read_op(0, 8192, x.as_mut_ptr());
        let b = read_op(8192, 8192, y.as_mut_ptr());

        let mut iovs = Vec::new();
        push_iov(&mut iovs, &a);
        push_iov(&mut iovs, &b);
        assert_eq!(iovs.len(), 2);
    }
}
