//! Refcounted, page-aligned bounce buffers.
//!
//! Some drivers cannot operate on arbitrary caller memory (private
//! allocations, unaligned regions); callers then stage data through a
//! buffer from this pool. Buffers are allocated once as a single aligned
//! arena. The free list lives with the engine's central state; this module
//! only owns the storage and the per-buffer refcounts.
//!
//! A slot that owns a bounce buffer holds one reference; callers may take
//! additional references. The buffer returns to the free list when the
//! count reaches zero.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicU32, Ordering};

const BOUNCE_ALIGN: usize = 4096;

/// Handle to an acquired bounce buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceBuffer(pub(crate) u32);

struct BufState {
    refcount: AtomicU32,
}

pub(crate) struct BouncePool {
    storage: *mut u8,
    layout: Option<Layout>,
    buffer_size: usize,
    states: Box<[BufState]>,
}

// Safety: the arena pointer is fixed for the pool's lifetime; all mutable
// state is atomic, and buffer contents are handed out one holder at a time
// by the refcounting protocol.
unsafe impl Send for BouncePool {}
unsafe impl Sync for BouncePool {}

impl BouncePool {
    pub fn new(count: u32, buffer_size: u32) -> BouncePool {
        let buffer_size = buffer_size as usize;
        let (storage, layout) = if count == 0 {
            (std::ptr::null_mut(), None)
        } else {
            let layout = Layout::from_size_align(count as usize * buffer_size, BOUNCE_ALIGN)
                .expect("bounce pool layout");
            // Safety: layout has nonzero size.
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            (ptr, Some(layout))
        };
        let states = (0..count)
            .map(|_| BufState {
                refcount: AtomicU32::new(0),
            })
            .collect();
        BouncePool {
            storage,
            layout,
            buffer_size,
            states,
        }
    }

    pub fn count(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Start of buffer `idx`'s storage.
    pub fn data(&self, idx: u32) -> *mut u8 {
        debug_assert!((idx as usize) < self.states.len());
        // Safety: idx is in range, so the offset stays inside the arena.
        unsafe { self.storage.add(idx as usize * self.buffer_size) }
    }

    pub fn refcount(&self, idx: u32) -> u32 {
        self.states[idx as usize].refcount.load(Ordering::Acquire)
    }

    /// Hand out a freshly popped buffer: refcount 0 → 1.
    pub fn activate(&self, idx: u32) {
        let prev = self.states[idx as usize]
            .refcount
            .swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "bounce buffer {idx} was on the free list with refs");
    }

    /// Take an additional reference.
    pub fn add_ref(&self, idx: u32) {
        let prev = self.states[idx as usize]
            .refcount
            .fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "bounce buffer {idx} revived from zero");
    }

    /// Drop one reference; returns true when the buffer reached zero and
    /// must go back on the free list.
    #[must_use]
    pub fn drop_ref(&self, idx: u32) -> bool {
        let prev = self.states[idx as usize]
            .refcount
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "bounce buffer {idx} released below zero");
        prev == 1
    }
}

impl Drop for BouncePool {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // Safety: allocated with exactly this layout in `new`.
            unsafe { alloc::dealloc(self.storage, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_disjoint_buffers() {
        let pool = BouncePool::new(4, 8192);
        for i in 0..4 {
            let p = pool.data(i) as usize;
            assert_eq!(p % BOUNCE_ALIGN, 0);
        }
        assert_eq!(pool.data(1) as usize - pool.data(0) as usize, 8192);
    }

    #[test]
    fn refcount_protocol() {
        let pool = BouncePool::new(1, 4096);
        assert_eq!(pool.refcount(0), 0);

        pool.activate(0);
        assert_eq!(pool.refcount(0), 1);

        pool.add_ref(0);
        assert!(!pool.drop_ref(0));
        assert!(pool.drop_ref(0));
        assert_eq!(pool.refcount(0), 0);
    }

    #[test]
    fn empty_pool() {
        let pool = BouncePool::new(0, 4096);
        assert_eq!(pool.count(), 0);
    }
}
