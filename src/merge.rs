//! Fusing adjacent staged operations into merged chains.
//!
//! Before a pending list is handed to the driver, neighbouring operations
//! are combined when a single kernel call can serve them: same type, same
//! descriptor, file-contiguous, and (for drivers without scatter/gather)
//! memory-contiguous as well. A chain is capped at `max_combine` members;
//! the head carries the MERGE flag and is the only slot the driver sees.
//!
//! WAL writes are never combined. WAL submitters deliberately issue short
//! writes (partial flushes of the current page); fusing them would undo
//! that.

use crate::backend::BackendLists;
use crate::engine::Engine;
use crate::flags::IoFlags;
use crate::list::NO_SLOT;
use crate::ops::OpPayload;

/// Whether `cur` may be appended to a chain currently ending in `last`.
pub(crate) fn can_combine(
    last: &OpPayload,
    last_flags: IoFlags,
    cur: &OpPayload,
    cur_flags: IoFlags,
    scatter_gather: bool,
) -> bool {
    if last.kind() != cur.kind() {
        return false;
    }
    if last_flags.contains(IoFlags::RETRY) || cur_flags.contains(IoFlags::RETRY) {
        return false;
    }

    match (last, cur) {
        (OpPayload::ReadBuffer(a), OpPayload::ReadBuffer(b)) => {
            a.fd == b.fd
                && a.offset + a.nbytes as u64 == b.offset
                && a.mode == b.mode
                && a.already_done == 0
                && b.already_done == 0
                && (scatter_gather || unsafe { a.data.add(a.nbytes as usize) } == b.data)
        }
        (OpPayload::WriteBuffer(a), OpPayload::WriteBuffer(b)) => {
            a.fd == b.fd
                && a.offset + a.nbytes as u64 == b.offset
                && a.already_done == 0
                && b.already_done == 0
                && (scatter_gather || unsafe { a.data.add(a.nbytes as usize) } == b.data)
        }
        (OpPayload::WriteGeneric(a), OpPayload::WriteGeneric(b)) => {
            a.fd == b.fd
                && a.offset + a.nbytes as u64 == b.offset
                && a.already_done == 0
                && b.already_done == 0
                && !a.no_reorder
                && !b.no_reorder
                && (scatter_gather || unsafe { a.data.add(a.nbytes as usize) } == b.data)
        }
        // Never merged: WAL writes use intentionally short writes, and the
        // remaining kinds have nothing to gain.
        (OpPayload::WriteWal(_), OpPayload::WriteWal(_)) => false,
        _ => false,
    }
}

/// Fuse neighbours on `bid`'s pending list. Called with the backend's
/// list lock held, before the driver consumes the list.
pub(crate) fn combine_pending(engine: &Engine, bid: u32, local: &mut BackendLists) {
    let slots = &engine.slots;
    let scatter_gather = engine.driver.can_scatter_gather();
    let max_combine = engine.config.max_combine;

    debug_assert!(local.pending.len() > 1);

    let mut last: Option<u32> = None;
    let mut combined = 1u32;

    let members: Vec<u32> = local.pending.iter(slots).collect();
    for cur in members {
        let cur_slot = &slots[cur as usize];

        // Can happen when a submission failed partway through.
        if cur_slot.merge_with.load(std::sync::atomic::Ordering::Relaxed) != NO_SLOT {
            log::debug!("already merged request ({cur}), giving up on merging");
            return;
        }

        let Some(prev) = last else {
            last = Some(cur);
            continue;
        };

        let prev_slot = &slots[prev as usize];
        let mergeable = {
            let a = prev_slot.inner.lock().op;
            let b = cur_slot.inner.lock().op;
            can_combine(&a, prev_slot.flags(), &b, cur_slot.flags(), scatter_gather)
        };

        if mergeable {
            combined += 1;
            log::trace!("merging {cur} into {prev}");
            prev_slot
                .merge_with
                .store(cur, std::sync::atomic::Ordering::Relaxed);
            prev_slot.update_flags(IoFlags::empty(), IoFlags::MERGE);
            crate::metrics::MERGED_OPS.increment();
        } else {
            combined = 1;
        }

        if combined >= max_combine {
            log::trace!("max combine at {combined}");
            last = None;
            combined = 1;
        } else {
            last = Some(cur);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{BufferTag, ReadBufferOp, WriteWalOp, WalSegment};

    fn tag() -> BufferTag {
        BufferTag {
            db: 1,
            rel: 7,
            fork: 0,
            block: 0,
        }
    }

    fn read(fd: i32, offset: u64, nbytes: u32, data: *mut u8) -> OpPayload {
        OpPayload::ReadBuffer(ReadBufferOp {
            fd,
            offset,
            nbytes,
            already_done: 0,
            data,
            buffer_id: 0,
            tag: tag(),
            mode: 0,
        })
    }

    fn wal(offset: u64, nbytes: u32, data: *const u8) -> OpPayload {
        OpPayload::WriteWal(WriteWalOp {
            fd: 5,
            segment: WalSegment {
                timeline: 1,
                segno: 3,
            },
            offset,
            nbytes,
            already_done: 0,
            data,
            no_reorder: false,
            write_no: 0,
        })
    }

    #[test]
    fn contiguous_reads_combine() {
        let mut buf = [0u8; 16384];
        let a = read(3, 0, 8192, buf.as_mut_ptr());
        let b = read(3, 8192, 8192, unsafe { buf.as_mut_ptr().add(8192) });
        assert!(can_combine(&a, IoFlags::empty(), &b, IoFlags::empty(), true));
        // Without scatter/gather, adjacency in memory is required too.
        assert!(can_combine(&a, IoFlags::empty(), &b, IoFlags::empty(), false));
    }

    #[test]
    fn gaps_and_descriptors_block_combining() {
        let mut buf = [0u8; 32768];
        let a = read(3, 0, 8192, buf.as_mut_ptr());
        let hole = read(3, 16384, 8192, unsafe { buf.as_mut_ptr().add(8192) });
        let other_fd = read(4, 8192, 8192, unsafe { buf.as_mut_ptr().add(8192) });
        assert!(!can_combine(&a, IoFlags::empty(), &hole, IoFlags::empty(), true));
        assert!(!can_combine(
            &a,
            IoFlags::empty(),
            &other_fd,
            IoFlags::empty(),
            true
        ));
    }

    #[test]
    fn disjoint_memory_needs_scatter_gather() {
        let mut x = [0u8; 8192];
        let mut y = [0u8; 8192];
        let a = read(3, 0, 8192, x.as_mut_ptr());
        let b = read(3, 8192, 8192, y.as_mut_ptr());
        assert!(can_combine(&a, IoFlags::empty(), &b, IoFlags::empty(), true));
        assert!(!can_combine(&a, IoFlags::empty(), &b, IoFlags::empty(), false));
    }

    #[test]
    fn retries_and_progress_block_combining() {
        let mut buf = [0u8; 16384];
        let a = read(3, 0, 8192, buf.as_mut_ptr());
        let b = read(3, 8192, 8192, unsafe { buf.as_mut_ptr().add(8192) });
        assert!(!can_combine(&a, IoFlags::RETRY, &b, IoFlags::empty(), true));
        assert!(!can_combine(&a, IoFlags::empty(), &b, IoFlags::RETRY, true));

        let mut partial = a;
        partial.add_already_done(4096);
        assert!(!can_combine(
            &partial,
            IoFlags::empty(),
            &b,
            IoFlags::empty(),
            true
        ));
    }

    #[test]
    fn wal_writes_never_combine() {
        let buf = [0u8; 16384];
        let a = wal(0, 8192, buf.as_ptr());
        let b = wal(8192, 8192, unsafe { buf.as_ptr().add(8192) });
        assert!(!can_combine(&a, IoFlags::empty(), &b, IoFlags::empty(), true));
    }
}
