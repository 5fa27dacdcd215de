//! Lifecycle flag bits for I/O slots.
//!
//! A slot's flags form a small state machine. Exactly one of the
//! UNUSED/IDLE/IN_PROGRESS/DONE phase bits is set at any observable moment,
//! and while IN_PROGRESS exactly one of PENDING/INFLIGHT/REAPED qualifies
//! the phase. The remaining bits annotate failure handling and callback
//! progress. Transitions are performed either by the slot's current owner
//! or under the engine's central mutex; readers in other backends load the
//! bits with acquire ordering and re-check the slot generation.

use std::fmt;

/// Bitset over the per-slot lifecycle flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IoFlags(u16);

impl IoFlags {
    /// Slot is in the central free pool.
    pub const UNUSED: IoFlags = IoFlags(1 << 0);
    /// Handed out to a backend, no operation prepared yet.
    pub const IDLE: IoFlags = IoFlags(1 << 1);
    /// An operation is prepared, submitted, or reaped.
    pub const IN_PROGRESS: IoFlags = IoFlags(1 << 2);
    /// Staged on the owner's pending list, not yet submitted.
    pub const PENDING: IoFlags = IoFlags(1 << 3);
    /// Submitted to the kernel.
    pub const INFLIGHT: IoFlags = IoFlags(1 << 4);
    /// Completion received, shared callback not yet run.
    pub const REAPED: IoFlags = IoFlags(1 << 5);
    /// The shared (op-type) completion callback has run.
    pub const SHARED_CB_CALLED: IoFlags = IoFlags(1 << 6);
    /// Operation finished (successfully or not).
    pub const DONE: IoFlags = IoFlags(1 << 7);
    /// Completed by a backend other than the initiator; parked on the
    /// initiator's foreign-completed list.
    pub const FOREIGN_DONE: IoFlags = IoFlags(1 << 8);
    /// Head of a merged chain (or still linked into one).
    pub const MERGE: IoFlags = IoFlags(1 << 9);
    /// Re-submission of a previously soft-failed operation.
    pub const RETRY: IoFlags = IoFlags(1 << 10);
    /// Failed permanently.
    pub const HARD_FAILURE: IoFlags = IoFlags(1 << 11);
    /// Failed partially (short transfer, EAGAIN/EINTR); retryable.
    pub const SOFT_FAILURE: IoFlags = IoFlags(1 << 12);
    /// Parked on the central uncompleted list after a failing shared callback.
    pub const SHARED_FAILED: IoFlags = IoFlags(1 << 13);
    /// The initiator-local completion callback has run.
    pub const LOCAL_CB_CALLED: IoFlags = IoFlags(1 << 14);
    /// The kernel result has been collected by the driver; waiting on the
    /// platform wait primitive is no longer allowed (POSIX AIO).
    pub const DRIVER_RETURNED: IoFlags = IoFlags(1 << 15);

    /// The empty set.
    pub const fn empty() -> IoFlags {
        IoFlags(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> IoFlags {
        IoFlags(bits)
    }

    /// All of `other`'s bits are set in `self`.
    #[inline]
    pub const fn contains(self, other: IoFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one of `other`'s bits is set in `self`.
    #[inline]
    pub const fn intersects(self, other: IoFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn union(self, other: IoFlags) -> IoFlags {
        IoFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn difference(self, other: IoFlags) -> IoFlags {
        IoFlags(self.0 & !other.0)
    }

    /// The four mutually exclusive lifecycle phases.
    pub const PHASE_MASK: IoFlags =
        IoFlags(Self::UNUSED.0 | Self::IDLE.0 | Self::IN_PROGRESS.0 | Self::DONE.0);

    /// The three mutually exclusive IN_PROGRESS sub-phases.
    pub const PROGRESS_MASK: IoFlags =
        IoFlags(Self::PENDING.0 | Self::INFLIGHT.0 | Self::REAPED.0);

    /// Check the phase partition: exactly one phase bit, and while
    /// IN_PROGRESS exactly one sub-phase bit.
    pub fn phase_is_valid(self) -> bool {
        let phase = self.0 & Self::PHASE_MASK.0;
        if phase.count_ones() != 1 {
            return false;
        }
        if self.contains(Self::IN_PROGRESS) {
            (self.0 & Self::PROGRESS_MASK.0).count_ones() == 1
        } else {
            true
        }
    }
}

impl std::ops::BitOr for IoFlags {
    type Output = IoFlags;
    fn bitor(self, rhs: IoFlags) -> IoFlags {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for IoFlags {
    fn bitor_assign(&mut self, rhs: IoFlags) {
        self.0 |= rhs.0;
    }
}

static FLAG_NAMES: &[(u16, &str)] = &[
    (1 << 0, "UNUSED"),
    (1 << 1, "IDLE"),
    (1 << 2, "IN_PROGRESS"),
    (1 << 3, "PENDING"),
    (1 << 4, "INFLIGHT"),
    (1 << 5, "REAPED"),
    (1 << 6, "SHARED_CB_CALLED"),
    (1 << 7, "DONE"),
    (1 << 8, "FOREIGN_DONE"),
    (1 << 9, "MERGE"),
    (1 << 10, "RETRY"),
    (1 << 11, "HARD_FAILURE"),
    (1 << 12, "SOFT_FAILURE"),
    (1 << 13, "SHARED_FAILED"),
    (1 << 14, "LOCAL_CB_CALLED"),
    (1 << 15, "DRIVER_RETURNED"),
];

impl fmt::Display for IoFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for &(bit, name) in FLAG_NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, " | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for IoFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoFlags({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_partition() {
        assert!(IoFlags::UNUSED.phase_is_valid());
        assert!(IoFlags::IDLE.phase_is_valid());
        assert!((IoFlags::IN_PROGRESS | IoFlags::PENDING).phase_is_valid());
        assert!((IoFlags::IN_PROGRESS | IoFlags::INFLIGHT | IoFlags::MERGE).phase_is_valid());
        assert!((IoFlags::DONE | IoFlags::SHARED_CB_CALLED).phase_is_valid());

        // Zero or two phase bits is invalid.
        assert!(!IoFlags::empty().phase_is_valid());
        assert!(!(IoFlags::UNUSED | IoFlags::IDLE).phase_is_valid());
        // IN_PROGRESS needs exactly one sub-phase.
        assert!(!IoFlags::IN_PROGRESS.phase_is_valid());
        assert!(!(IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::INFLIGHT).phase_is_valid());
    }

    #[test]
    fn set_operations() {
        let f = IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::RETRY;
        assert!(f.contains(IoFlags::PENDING));
        assert!(f.intersects(IoFlags::RETRY | IoFlags::MERGE));
        assert!(!f.contains(IoFlags::PENDING | IoFlags::MERGE));

        let g = f.difference(IoFlags::PENDING).union(IoFlags::INFLIGHT);
        assert!(g.contains(IoFlags::INFLIGHT));
        assert!(!g.contains(IoFlags::PENDING));
        assert!(g.contains(IoFlags::RETRY));
    }

    #[test]
    fn display_names() {
        let f = IoFlags::IN_PROGRESS | IoFlags::INFLIGHT;
        assert_eq!(f.to_string(), "IN_PROGRESS | INFLIGHT");
        assert_eq!(IoFlags::empty().to_string(), "(none)");
    }

    #[test]
    fn round_trip_bits() {
        let f = IoFlags::DONE | IoFlags::SHARED_FAILED | IoFlags::SOFT_FAILURE;
        assert_eq!(IoFlags::from_bits(f.bits()), f);
    }
}
