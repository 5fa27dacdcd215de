//! Bounded lock-free queue of slot indices.
//!
//! This is the completion ring the POSIX AIO signal handler enqueues into
//! and any backend dequeues from, so both ends must be safe without locks:
//! the producer side runs in signal context and may only touch atomics.
//! Each cell carries a sequence number; a producer claims a cell by CASing
//! the tail, then publishes the value by advancing the cell's sequence,
//! which is what consumers wait on. Enqueueing never spins on a consumer
//! and dequeueing never spins on a producer beyond the cell handshake.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

struct Cell {
    seq: AtomicUsize,
    value: AtomicU32,
}

/// Multi-producer / multi-consumer bounded index queue.
pub(crate) struct IndexQueue {
    cells: Box<[Cell]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl IndexQueue {
    /// Capacity is rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> IndexQueue {
        let cap = capacity.max(2).next_power_of_two();
        let cells = (0..cap)
            .map(|i| Cell {
                seq: AtomicUsize::new(i),
                value: AtomicU32::new(0),
            })
            .collect();
        IndexQueue {
            cells,
            mask: cap - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Enqueue `value`; returns false when the queue is full.
    ///
    /// Async-signal-safe: atomics only, no allocation, no blocking.
    pub fn enqueue(&self, value: u32) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[tail & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);

            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.store(value, Ordering::Relaxed);
                        cell.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(t) => tail = t,
                }
            } else if (seq as isize).wrapping_sub(tail as isize) < 0 {
                // Cell not yet consumed from the previous lap: full.
                return false;
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue one value, or `None` when the queue is empty.
    pub fn dequeue(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[head & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let expected = head.wrapping_add(1);

            if seq == expected {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = cell.value.load(Ordering::Relaxed);
                        cell.seq
                            .store(head.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(h) => head = h,
                }
            } else if (seq as isize).wrapping_sub(expected as isize) < 0 {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_until_full() {
        let q = IndexQueue::with_capacity(4);
        assert_eq!(q.capacity(), 4);
        for i in 0..4 {
            assert!(q.enqueue(i));
        }
        assert!(!q.enqueue(99));
        for i in 0..4 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn wraps_around() {
        let q = IndexQueue::with_capacity(4);
        for lap in 0..10u32 {
            for i in 0..3 {
                assert!(q.enqueue(lap * 10 + i));
            }
            for i in 0..3 {
                assert_eq!(q.dequeue(), Some(lap * 10 + i));
            }
        }
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        let q = Arc::new(IndexQueue::with_capacity(256));
        let total = 4 * 5_000u64;

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..5_000u32 {
                        let v = p * 5_000 + i;
                        while !q.enqueue(v) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut sum = 0u64;
                    let mut n = 0u64;
                    while n < total / 2 {
                        if let Some(v) = q.dequeue() {
                            sum += v as u64;
                            n += 1;
                        } else {
                            thread::yield_now();
                        }
                    }
                    sum
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let sum: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        let expect: u64 = (0..20_000u64).sum();
        assert_eq!(sum, expect);
    }
}
