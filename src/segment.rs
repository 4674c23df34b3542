// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A segment: one shared-memory mapping carved into equal-size pages.
//
// Layout of the mapping:
//
//   [ page_size bytes ] × page_count
//
// The free list is an index pool kept in process memory:
//   cursor : head of the free list (== page_count when exhausted)
//   next   : next[i] is the slot after i in the free list

use crate::page::{Page, PageFlags};
use crate::shm::ShmHandle;

pub struct Segment {
    shm: ShmHandle,
    number: u16,
    page_size: usize,
    pages: Vec<Page>,
    next: Vec<u32>,
    cursor: u32,
    free: usize,
}

impl Segment {
    /// Carve `shm` into pages of `page_size` bytes. Every page starts free.
    pub fn carve(shm: ShmHandle, number: u16, page_size: usize) -> Self {
        let count = shm.size() / page_size;
        let next = (1..=count as u32).collect();
        Self {
            shm,
            number,
            page_size,
            pages: (0..count).map(|_| Page::free()).collect(),
            next,
            cursor: 0,
            free: count,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Pop a slot off the free list.
    pub fn acquire(&mut self) -> Option<u32> {
        if self.cursor as usize >= self.pages.len() {
            return None;
        }
        let idx = self.cursor;
        self.cursor = self.next[idx as usize];
        self.free -= 1;
        Some(idx)
    }

    /// Push a slot back onto the free list. Returns `false` if it was
    /// already free.
    pub fn release(&mut self, idx: u32) -> bool {
        let page = &mut self.pages[idx as usize];
        if page.is_free() {
            return false;
        }
        *page = Page::free();
        self.next[idx as usize] = self.cursor;
        self.cursor = idx;
        self.free += 1;
        true
    }

    pub fn page(&self, idx: u32) -> &Page {
        &self.pages[idx as usize]
    }

    pub fn page_mut(&mut self, idx: u32) -> &mut Page {
        &mut self.pages[idx as usize]
    }

    /// Indices of pages whose flags intersect `flags`.
    pub fn pages_with(&self, flags: PageFlags) -> impl Iterator<Item = (u32, &Page)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.flags.intersects(flags))
            .map(|(i, p)| (i as u32, p))
    }

    /// Start of page `idx` inside the mapping.
    pub(crate) fn page_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!((idx as usize) < self.pages.len());
        unsafe { self.shm.as_mut_ptr().add(idx as usize * self.page_size) }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("number", &self.number)
            .field("pages", &self.pages.len())
            .field("free", &self.free)
            .finish()
    }
}
