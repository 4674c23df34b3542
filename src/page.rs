// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Page descriptors and the producer-side buffer skeleton.

use std::fmt;

use bitflags::bitflags;

/// Address of one page: segment number and slot within the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub segment: u16,
    pub index: u32,
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.index)
    }
}

/// Identity shared by every page of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

bitflags! {
    /// Page state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u16 {
        /// Routed and waiting to be scheduled.
        const DIRTY       = 1 << 0;
        /// Pinned by at least one reader.
        const IN_USE      = 1 << 1;
        /// Terminates its buffer.
        const LAST_PAGE   = 1 << 2;
        /// Single-page priority buffer.
        const OUT_OF_BAND = 1 << 3;
        /// Never to be scheduled; reclaimed as soon as the scan allows.
        const NEVER_DIRTY = 1 << 4;
        /// On the free list.
        const RELEASED    = 1 << 5;
        /// Handed to consumers at `schedule_tick`.
        const SCHEDULED   = 1 << 6;
        /// Owned by a producer or parked in the mailbox; not yet routed.
        const HELD        = 1 << 7;
    }
}

/// Descriptor for one page.
#[derive(Debug, Clone)]
pub struct Page {
    pub object: ObjectId,
    pub position: u32,
    /// Bytes written into the page.
    pub len: u32,
    pub flags: PageFlags,
    pub schedule_tick: u64,
    pub owner_pid: i32,
    pub tag: u32,
    pub(crate) pins: u32,
}

impl Page {
    pub(crate) fn free() -> Self {
        Self {
            object: ObjectId(0),
            position: 0,
            len: 0,
            flags: PageFlags::RELEASED,
            schedule_tick: 0,
            owner_pid: 0,
            tag: 0,
            pins: 0,
        }
    }

    /// Reset for a fresh acquisition by `owner`.
    pub(crate) fn acquire(&mut self, object: ObjectId, position: u32, owner: i32) {
        *self = Self {
            object,
            position,
            owner_pid: owner,
            flags: PageFlags::HELD,
            ..Self::free()
        };
    }

    pub fn is_free(&self) -> bool {
        self.flags.contains(PageFlags::RELEASED)
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
        self.flags.insert(PageFlags::IN_USE);
    }

    pub(crate) fn unpin(&mut self) {
        debug_assert!(self.pins > 0, "unbalanced unpin");
        self.pins = self.pins.saturating_sub(1);
        if self.pins == 0 {
            self.flags.remove(PageFlags::IN_USE);
        }
    }
}

/// A buffer under construction, owned by the producer that requested it.
///
/// Dropping a `Buffer` without routing, posting or releasing it leaks its
/// pages until the scavenger notices the owner process is gone.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) object: ObjectId,
    pub(crate) pages: Vec<PageId>,
    pub(crate) requested: usize,
    pub(crate) used: usize,
    pub(crate) out_of_band: bool,
    pub(crate) owner_pid: i32,
    /// Pages already appended to the Used List.
    pub(crate) routed: usize,
}

impl Buffer {
    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Length asked for at request time.
    pub fn requested_len(&self) -> usize {
        self.requested
    }

    /// Bytes written so far.
    pub fn used_len(&self) -> usize {
        self.used
    }

    pub fn is_out_of_band(&self) -> bool {
        self.out_of_band
    }

    /// Mark the buffer out-of-band. Only a single-page OOB buffer is ever
    /// delivered whole; pages past the first of a larger one are dropped.
    pub fn set_out_of_band(&mut self) {
        self.out_of_band = true;
    }

    pub fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    /// Pages routed incrementally so far.
    pub fn routed_pages(&self) -> usize {
        self.routed
    }
}
