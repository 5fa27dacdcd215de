//! Index-based intrusive lists over the slot table.
//!
//! Slots participate in two disjoint list families at once: an *owner* list
//! (free pool, outstanding, issued, issued-abandoned) and an *io* list
//! (pending, reaped, completed, uncompleted). Each slot embeds one
//! [`Link`] per role, so membership is O(1) to add and remove and a slot
//! can never be on two lists of the same role — the linkage itself is the
//! membership record.
//!
//! List heads hold plain integers and live inside whatever lock protects
//! the list; the embedded links are atomics only so the slot type stays
//! `Sync`. Every mutation happens under the protecting lock, so all link
//! accesses use relaxed ordering.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::slot::IoSlot;

/// Sentinel index: "no slot".
pub(crate) const NO_SLOT: u32 = u32::MAX;

/// Which list family a link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListRole {
    /// Free pool / outstanding / issued / issued-abandoned.
    Owner,
    /// Pending / reaped / local- and foreign-completed / uncompleted.
    Io,
}

/// Intrusive linkage embedded in each slot, one per role.
pub(crate) struct Link {
    prev: AtomicU32,
    next: AtomicU32,
}

impl Link {
    pub fn new() -> Link {
        Link {
            prev: AtomicU32::new(NO_SLOT),
            next: AtomicU32::new(NO_SLOT),
        }
    }

    fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }

    fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    fn set(&self, prev: u32, next: u32) {
        self.prev.store(prev, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
    }
}

/// A doubly-linked list of slot indices, threaded through the slots' own
/// links of the list's role.
pub(crate) struct SlotList {
    role: ListRole,
    head: u32,
    tail: u32,
    len: u32,
}

impl SlotList {
    pub fn new(role: ListRole) -> SlotList {
        SlotList {
            role,
            head: NO_SLOT,
            tail: NO_SLOT,
            len: 0,
        }
    }

    pub fn role(&self) -> ListRole {
        self.role
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<u32> {
        (self.head != NO_SLOT).then_some(self.head)
    }

    fn link<'a>(&self, slots: &'a [IoSlot], idx: u32) -> &'a Link {
        slots[idx as usize].link(self.role)
    }

    pub fn push_tail(&mut self, slots: &[IoSlot], idx: u32) {
        let link = self.link(slots, idx);
        debug_assert_eq!(link.prev(), NO_SLOT, "slot {idx} already linked");
        debug_assert_eq!(link.next(), NO_SLOT, "slot {idx} already linked");

        link.set(self.tail, NO_SLOT);
        if self.tail != NO_SLOT {
            self.link(slots, self.tail).next.store(idx, Ordering::Relaxed);
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    /// Insert `idx` immediately after `after`, which must be a member.
    pub fn insert_after(&mut self, slots: &[IoSlot], after: u32, idx: u32) {
        debug_assert!(self.contains(slots, after));
        let next = self.link(slots, after).next();

        self.link(slots, idx).set(after, next);
        self.link(slots, after).next.store(idx, Ordering::Relaxed);
        if next != NO_SLOT {
            self.link(slots, next).prev.store(idx, Ordering::Relaxed);
        } else {
            self.tail = idx;
        }
        self.len += 1;
    }

    pub fn pop_head(&mut self, slots: &[IoSlot]) -> Option<u32> {
        let idx = self.front()?;
        self.remove(slots, idx);
        Some(idx)
    }

    /// Unlink `idx` from wherever it sits in this list.
    pub fn remove(&mut self, slots: &[IoSlot], idx: u32) {
        debug_assert!(self.contains(slots, idx), "slot {idx} not on this list");
        let link = self.link(slots, idx);
        let (prev, next) = (link.prev(), link.next());

        if prev != NO_SLOT {
            self.link(slots, prev).next.store(next, Ordering::Relaxed);
        } else {
            self.head = next;
        }
        if next != NO_SLOT {
            self.link(slots, next).prev.store(prev, Ordering::Relaxed);
        } else {
            self.tail = prev;
        }
        link.set(NO_SLOT, NO_SLOT);
        debug_assert!(self.len > 0);
        self.len -= 1;
    }

    /// Iterate members front to back. The list must not be mutated while
    /// the iterator is live (the protecting lock is held anyway).
    pub fn iter<'a>(&'a self, slots: &'a [IoSlot]) -> Iter<'a> {
        Iter {
            list: self,
            slots,
            cur: self.head,
        }
    }

    /// Membership scan; for assertions only.
    pub fn contains(&self, slots: &[IoSlot], idx: u32) -> bool {
        self.iter(slots).any(|i| i == idx)
    }
}

pub(crate) struct Iter<'a> {
    list: &'a SlotList,
    slots: &'a [IoSlot],
    cur: u32,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let idx = (self.cur != NO_SLOT).then_some(self.cur)?;
        self.cur = self.list.link(self.slots, idx).next();
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::IoSlot;

    fn table(n: usize) -> Vec<IoSlot> {
        (0..n).map(|_| IoSlot::new()).collect()
    }

    #[test]
    fn push_pop_fifo() {
        let slots = table(4);
        let mut list = SlotList::new(ListRole::Io);

        for i in 0..4 {
            list.push_tail(&slots, i);
        }
        assert_eq!(list.len(), 4);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        assert_eq!(list.pop_head(&slots), Some(0));
        assert_eq!(list.pop_head(&slots), Some(1));
        assert_eq!(list.len(), 2);
        assert_eq!(list.front(), Some(2));
    }

    #[test]
    fn remove_from_middle() {
        let slots = table(4);
        let mut list = SlotList::new(ListRole::Io);
        for i in 0..4 {
            list.push_tail(&slots, i);
        }

        list.remove(&slots, 2);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![0, 1, 3]);
        list.remove(&slots, 0);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![1, 3]);
        list.remove(&slots, 3);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![1]);
        list.remove(&slots, 1);
        assert!(list.is_empty());
        assert_eq!(list.front(), None);
    }

    #[test]
    fn insert_after_links_tail() {
        let slots = table(4);
        let mut list = SlotList::new(ListRole::Io);
        list.push_tail(&slots, 0);
        list.insert_after(&slots, 0, 2);
        list.insert_after(&slots, 2, 3);
        list.insert_after(&slots, 0, 1);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        // Inserting after the last member must keep the tail current.
        list.remove(&slots, 1);
        list.insert_after(&slots, 3, 1);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![0, 2, 3, 1]);
        list.remove(&slots, 1);
        list.push_tail(&slots, 1);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![0, 2, 3, 1]);
    }

    #[test]
    fn roles_are_independent() {
        let slots = table(2);
        let mut owner = SlotList::new(ListRole::Owner);
        let mut io = SlotList::new(ListRole::Io);

        // The same slot may sit on one list of each role at once.
        owner.push_tail(&slots, 0);
        io.push_tail(&slots, 0);
        assert!(owner.contains(&slots, 0));
        assert!(io.contains(&slots, 0));

        io.remove(&slots, 0);
        assert!(owner.contains(&slots, 0));
        assert!(!io.contains(&slots, 0));
    }
}
