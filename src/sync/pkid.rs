//! Allocation of the packet identifiers.

use core::num::NonZeroU16;

use crate::v3::header::PacketId;

/// Hands out packet identifiers in increasing order, wrapping from 65535 back to 1.
#[derive(Debug, Clone)]
pub(crate) struct PacketIdAllocator {
    next: NonZeroU16,
}

impl PacketIdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: NonZeroU16::MIN,
        }
    }

    /// Returns the next identifier for which `in_use` is false.
    ///
    /// Returns [`None`] if all the identifiers are in use.
    pub(crate) fn next<F>(&mut self, mut in_use: F) -> Option<PacketId>
    where
        F: FnMut(PacketId) -> bool,
    {
        for _ in 0..u16::MAX {
            let pkid = PacketId::new(self.next);

            self.next = self.next.checked_add(1).unwrap_or(NonZeroU16::MIN);

            if !in_use(pkid) {
                return Some(pkid);
            }
        }

        None
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
