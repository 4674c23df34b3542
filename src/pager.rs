// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The pager: owns the segments, hands pages to producers, keeps the Used
// List, and parks posted buffers until an inbound link accepts them.
//
// All descriptor state sits behind one lock. Page bytes live in the segment
// mappings and are touched outside the lock by whoever owns the page at the
// time: the producer while HELD, readers while pinned.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{Backing, BrokerConfig};
use crate::error::{BrokerError, Result};
use crate::page::{Buffer, ObjectId, Page, PageFlags, PageId};
use crate::platform;
use crate::segment::Segment;
use crate::shm::ShmHandle;

/// Accounting snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub segments: usize,
    pub total_pages: usize,
    pub free_pages: usize,
    /// Pages on the Used List (including arrivals during a freeze).
    pub used_pages: usize,
    /// Pages owned by producers or parked in the mailbox.
    pub held_pages: usize,
    pub posted_buffers: usize,
    pub frozen: bool,
}

struct Posted {
    tag: u32,
    buffer: Buffer,
}

#[derive(Default)]
struct FreezeState {
    depth: u32,
    snapshot: Option<Arc<[PageId]>>,
    /// Pages routed while frozen; appended on the final thaw.
    arrivals: Vec<PageId>,
    /// Pages freed while frozen; dropped from the Used List on the final thaw.
    departed: HashSet<PageId>,
}

pub(crate) struct PagerState {
    segments: Vec<Segment>,
    used: Vec<PageId>,
    freeze: FreezeState,
    mailbox: VecDeque<Posted>,
    closed: bool,
    growth_failed: bool,
    freed: bool,
}

impl PagerState {
    fn free_count(&self) -> usize {
        self.segments.iter().map(Segment::free_count).sum()
    }

    fn valid(&self, id: PageId) -> bool {
        self.segments
            .get(id.segment as usize)
            .is_some_and(|s| (id.index as usize) < s.page_count())
    }

    pub(crate) fn page(&self, id: PageId) -> &Page {
        self.segments[id.segment as usize].page(id.index)
    }

    pub(crate) fn page_mut(&mut self, id: PageId) -> &mut Page {
        self.segments[id.segment as usize].page_mut(id.index)
    }

    fn parked(&self, id: PageId) -> bool {
        self.mailbox.iter().any(|p| p.buffer.pages.contains(&id))
    }

    fn push_used(&mut self, id: PageId) {
        if self.freeze.depth > 0 {
            self.freeze.arrivals.push(id);
        } else {
            self.used.push(id);
        }
    }

    /// Return pages to their segments' free lists and drop them from the
    /// Used List (deferred to the final thaw while frozen). Pages already
    /// free are skipped. Returns the number actually freed.
    pub(crate) fn free_pages(&mut self, ids: &[PageId]) -> usize {
        let mut freed = HashSet::with_capacity(ids.len());
        for &id in ids {
            if self.segments[id.segment as usize].release(id.index) {
                freed.insert(id);
            }
        }
        if freed.is_empty() {
            return 0;
        }
        if self.freeze.depth > 0 {
            self.freeze.arrivals.retain(|id| !freed.contains(id));
            self.freeze.departed.extend(freed.iter().copied());
        } else {
            self.used.retain(|id| !freed.contains(id));
        }
        self.freed = true;
        freed.len()
    }

    pub(crate) fn used_len(&self) -> usize {
        self.used.len() + self.freeze.arrivals.len()
    }
}

/// Page allocator over one or more shared-memory segments.
pub struct Pager {
    name: String,
    backing: Backing,
    page_size: usize,
    pages_per_segment: usize,
    max_segments: usize,
    state: Mutex<PagerState>,
    /// Signalled when pages return to the free pool.
    space: Condvar,
    /// Signalled when a buffer is posted.
    posted: Condvar,
    next_object: AtomicU64,
    kick: Option<Sender<()>>,
}

impl Pager {
    /// Create a pager and map its first segment.
    ///
    /// Failure to map the first segment is fatal: there is no degraded mode.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        Self::with_kick(config, None)
    }

    /// Like [`Pager::new`], nudging `kick` whenever pages are routed.
    pub(crate) fn with_kick(config: &BrokerConfig, kick: Option<Sender<()>>) -> Result<Self> {
        config.validate()?;
        let pager = Self {
            name: config.name.clone(),
            backing: config.backing.clone(),
            page_size: config.page_size,
            pages_per_segment: config.pages_per_segment,
            max_segments: config.max_segments,
            state: Mutex::new(PagerState {
                segments: Vec::with_capacity(config.max_segments),
                used: Vec::new(),
                freeze: FreezeState::default(),
                mailbox: VecDeque::new(),
                closed: false,
                growth_failed: false,
                freed: false,
            }),
            space: Condvar::new(),
            posted: Condvar::new(),
            next_object: AtomicU64::new(1),
            kick,
        };
        {
            let mut st = pager.state.lock();
            pager.grow(&mut st)?;
        }
        Ok(pager)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages available once every segment has been mapped.
    pub fn capacity(&self) -> usize {
        self.pages_per_segment * self.max_segments
    }

    fn pages_for(&self, len: usize) -> usize {
        len.div_ceil(self.page_size).max(1)
    }

    fn grow(&self, st: &mut PagerState) -> Result<()> {
        let number = st.segments.len();
        let bytes = self.page_size * self.pages_per_segment;
        let shm = ShmHandle::for_segment(&self.backing, &self.name, number, bytes).map_err(
            |source| {
                let prefix = match &self.backing {
                    Backing::Named { prefix } => prefix.as_str(),
                    Backing::Anonymous => "",
                };
                BrokerError::SegmentAcquire {
                    name: crate::shm_name::segment_name(prefix, &self.name, number),
                    source,
                }
            },
        )?;
        st.segments
            .push(Segment::carve(shm, number as u16, self.page_size));
        tracing::info!(
            broker = %self.name,
            segment = number,
            pages = self.pages_per_segment,
            "mapped segment"
        );
        Ok(())
    }

    /// Carve `n` pages into a new buffer if they are available, growing by
    /// whole segments while allowed.
    fn take(&self, st: &mut PagerState, n: usize, len: usize, owner: i32) -> Option<Buffer> {
        while st.free_count() < n && st.segments.len() < self.max_segments && !st.growth_failed {
            if let Err(e) = self.grow(st) {
                tracing::warn!(broker = %self.name, error = %e, "segment growth failed; staying at current size");
                st.growth_failed = true;
            }
        }
        if st.free_count() < n {
            return None;
        }

        let object = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        let mut pages = Vec::with_capacity(n);
        for seg in st.segments.iter_mut() {
            while pages.len() < n {
                let Some(idx) = seg.acquire() else { break };
                seg.page_mut(idx).acquire(object, pages.len() as u32, owner);
                pages.push(PageId { segment: seg.number(), index: idx });
            }
        }
        debug_assert_eq!(pages.len(), n);

        Some(Buffer {
            object,
            pages,
            requested: len,
            used: 0,
            out_of_band: false,
            owner_pid: owner,
            routed: 0,
        })
    }

    /// Block until enough pages for `len` bytes are free and return them as
    /// a new buffer owned by this process.
    pub fn request(&self, len: usize) -> Result<Buffer> {
        self.request_as(len, platform::current_pid())
    }

    /// [`Pager::request`] on behalf of producer process `owner`.
    pub fn request_as(&self, len: usize, owner: i32) -> Result<Buffer> {
        let n = self.pages_for(len);
        if n > self.capacity() {
            return Err(BrokerError::TooLarge { pages: n, capacity: self.capacity() });
        }
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(buf) = self.take(&mut st, n, len, owner) {
                return Ok(buf);
            }
            self.space.wait(&mut st);
        }
    }

    /// Never blocks: `Ok(None)` when the pages are not available right now.
    pub fn try_request(&self, len: usize) -> Result<Option<Buffer>> {
        self.try_request_as(len, platform::current_pid())
    }

    pub fn try_request_as(&self, len: usize, owner: i32) -> Result<Option<Buffer>> {
        let n = self.pages_for(len);
        if n > self.capacity() {
            return Err(BrokerError::TooLarge { pages: n, capacity: self.capacity() });
        }
        let mut st = self.state.lock();
        if st.closed {
            return Err(BrokerError::Closed);
        }
        Ok(self.take(&mut st, n, len, owner))
    }

    /// Blocking request for a single-page out-of-band buffer.
    pub fn request_oob(&self) -> Result<Buffer> {
        let mut buf = self.request(self.page_size)?;
        buf.out_of_band = true;
        Ok(buf)
    }

    pub fn try_request_oob(&self) -> Result<Option<Buffer>> {
        Ok(self.try_request(self.page_size)?.map(|mut buf| {
            buf.out_of_band = true;
            buf
        }))
    }

    /// Append `data` to the buffer at its used length. Returns the number of
    /// bytes copied, short if the buffer's pages are full.
    pub fn write(&self, buf: &mut Buffer, data: &[u8]) -> usize {
        let cap = buf.pages.len() * self.page_size;
        let n = data.len().min(cap - buf.used);
        if n == 0 {
            return 0;
        }

        let mut copies = Vec::new();
        {
            let mut st = self.state.lock();
            let mut off = buf.used;
            let end = buf.used + n;
            while off < end {
                let within = off % self.page_size;
                let chunk = (self.page_size - within).min(end - off);
                let id = buf.pages[off / self.page_size];
                let seg = &mut st.segments[id.segment as usize];
                let dst = unsafe { seg.page_ptr(id.index).add(within) };
                seg.page_mut(id.index).len = (within + chunk) as u32;
                copies.push((dst, off - buf.used, chunk));
                off += chunk;
            }
        }
        // The pages are HELD by this buffer, so nobody else touches the bytes.
        for (dst, src_off, len) in copies {
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr().add(src_off), dst, len) };
        }
        buf.used += n;
        n
    }

    fn mark_routed(&self, st: &mut PagerState, buf: &mut Buffer, count: usize, finish: bool) {
        let last = buf.pages.len() - 1;
        let end = (buf.routed + count).min(buf.pages.len());
        for i in buf.routed..end {
            let id = buf.pages[i];
            let page = st.page_mut(id);
            page.flags.remove(PageFlags::HELD);
            page.flags.insert(PageFlags::DIRTY);
            if buf.out_of_band {
                page.flags.insert(PageFlags::OUT_OF_BAND);
            }
            if finish && i == last {
                page.flags.insert(PageFlags::LAST_PAGE);
            }
            st.push_used(id);
        }
        buf.routed = end;
    }

    fn kick(&self) {
        if let Some(k) = &self.kick {
            let _ = k.try_send(());
        }
    }

    /// Hand the whole buffer to the scheduler: every page not yet routed is
    /// marked dirty and appended to the Used List, the final page flagged
    /// as the end of the buffer.
    pub fn route(&self, mut buf: Buffer) {
        {
            let mut st = self.state.lock();
            let rest = buf.pages.len() - buf.routed;
            self.mark_routed(&mut st, &mut buf, rest, true);
        }
        tracing::trace!(object = %buf.object, pages = buf.pages.len(), "routed");
        self.kick();
    }

    /// Route up to `count` more pages of an in-progress buffer. The final
    /// page is withheld until [`Pager::route`], so the scheduler sees an
    /// incomplete buffer until then. Returns the pages routed by this call.
    pub fn route_pages(&self, buf: &mut Buffer, count: usize) -> usize {
        let before = buf.routed;
        let allowed = (buf.pages.len() - 1).saturating_sub(buf.routed).min(count);
        if allowed > 0 {
            let mut st = self.state.lock();
            self.mark_routed(&mut st, buf, allowed, false);
        }
        self.kick();
        buf.routed - before
    }

    /// Return pages to the free pool.
    ///
    /// Returns `false` and changes nothing if any page is unknown, already
    /// free, pinned by a reader, scheduled for consumers, or parked in the
    /// mailbox. Scheduled pages go back only through reclamation.
    pub fn release(&self, pages: &[PageId]) -> bool {
        {
            let mut st = self.state.lock();
            let ok = pages.iter().all(|&id| {
                st.valid(id) && !st.parked(id) && {
                    let p = st.page(id);
                    !p.is_free() && !p.is_pinned() && !p.flags.contains(PageFlags::SCHEDULED)
                }
            });
            if !ok {
                return false;
            }
            st.free_pages(pages);
            st.freed = false;
        }
        self.space.notify_all();
        true
    }

    /// Release an abandoned buffer.
    pub fn release_buffer(&self, buf: Buffer) -> bool {
        self.release(&buf.pages)
    }

    /// Park a complete buffer in the mailbox under `tag` for an inbound link
    /// to [`accept`](Pager::accept).
    pub fn post(&self, buf: Buffer, tag: u32) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.closed {
                st.free_pages(&buf.pages);
                st.freed = false;
                drop(st);
                self.space.notify_all();
                return Err(BrokerError::Closed);
            }
            for &id in &buf.pages {
                st.page_mut(id).tag = tag;
            }
            st.mailbox.push_back(Posted { tag, buffer: buf });
        }
        self.posted.notify_all();
        Ok(())
    }

    fn take_posted(st: &mut PagerState, tag: u32, mask: u32) -> Option<Buffer> {
        let pos = st
            .mailbox
            .iter()
            .position(|p| p.tag & mask == tag & mask)?;
        let mut buf = st.mailbox.remove(pos)?.buffer;
        // The acceptor owns it now; the scavenger must not reclaim it if
        // the producer dies before it is routed.
        let me = platform::current_pid();
        for &id in &buf.pages {
            st.page_mut(id).owner_pid = me;
        }
        buf.owner_pid = me;
        Some(buf)
    }

    /// Wait up to `timeout` for a posted buffer whose tag matches `tag`
    /// under `mask`. `Ok(None)` on timeout.
    pub fn accept(&self, tag: u32, mask: u32, timeout: Duration) -> Result<Option<Buffer>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(buf) = Self::take_posted(&mut st, tag, mask) {
                return Ok(Some(buf));
            }
            if self.posted.wait_until(&mut st, deadline).timed_out() {
                return Ok(Self::take_posted(&mut st, tag, mask));
            }
        }
    }

    /// Non-blocking [`Pager::accept`].
    pub fn try_accept(&self, tag: u32, mask: u32) -> Option<Buffer> {
        let mut st = self.state.lock();
        Self::take_posted(&mut st, tag, mask)
    }

    /// Free every posted buffer whose tag `keep` rejects. Returns the number
    /// of buffers discarded.
    pub(crate) fn discard_posted<F>(&self, keep: F) -> usize
    where
        F: Fn(u32) -> bool,
    {
        let dropped = {
            let mut st = self.state.lock();
            let (kept, dropped): (VecDeque<_>, VecDeque<_>) =
                st.mailbox.drain(..).partition(|p| keep(p.tag));
            st.mailbox = kept;
            for p in &dropped {
                st.free_pages(&p.buffer.pages);
            }
            st.freed = false;
            dropped.len()
        };
        if dropped > 0 {
            self.space.notify_all();
        }
        dropped
    }

    /// Free pages of dead producers: HELD pages, and routed pages of
    /// buffers whose last page never followed (DIRTY, not yet scheduled).
    /// Posted buffers are left alone; they are dropped with their tag.
    /// Returns the pages freed.
    pub(crate) fn reclaim_orphans<F>(&self, mut alive: F) -> usize
    where
        F: FnMut(i32) -> bool,
    {
        let freed = {
            let mut st = self.state.lock();
            let parked: HashSet<PageId> = st
                .mailbox
                .iter()
                .flat_map(|p| p.buffer.pages.iter().copied())
                .collect();
            // Buffers whose last page was routed will be scheduled in full.
            let complete: HashSet<ObjectId> = st
                .segments
                .iter()
                .flat_map(|seg| seg.pages_with(PageFlags::LAST_PAGE))
                .map(|(_, page)| page.object)
                .collect();
            let mut orphans = Vec::new();
            for seg in &st.segments {
                for (idx, page) in seg.pages_with(PageFlags::HELD | PageFlags::DIRTY) {
                    let id = PageId { segment: seg.number(), index: idx };
                    let candidate = if page.flags.contains(PageFlags::HELD) {
                        !parked.contains(&id)
                    } else {
                        !page.flags.intersects(PageFlags::SCHEDULED | PageFlags::OUT_OF_BAND)
                            && !complete.contains(&page.object)
                    };
                    if candidate && !page.is_pinned() && !alive(page.owner_pid) {
                        orphans.push(id);
                    }
                }
            }
            let n = st.free_pages(&orphans);
            st.freed = false;
            n
        };
        if freed > 0 {
            self.space.notify_all();
        }
        freed
    }

    /// Begin a consistent-iteration window over the Used List. Reentrant:
    /// nested freezes share the outermost snapshot, and only the last thaw
    /// merges pages routed or freed in the meantime.
    pub fn freeze(&self) -> UsedListFreeze<'_> {
        let mut st = self.state.lock();
        st.freeze.depth += 1;
        if st.freeze.depth == 1 {
            st.freeze.snapshot = Some(Arc::from(st.used.as_slice()));
        }
        let snapshot = st.freeze.snapshot.clone().unwrap_or_else(|| Arc::from(Vec::new()));
        UsedListFreeze { pager: self, snapshot }
    }

    fn thaw(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.freeze.depth > 0, "thaw without freeze");
        st.freeze.depth = st.freeze.depth.saturating_sub(1);
        if st.freeze.depth == 0 {
            let departed = std::mem::take(&mut st.freeze.departed);
            let arrivals = std::mem::take(&mut st.freeze.arrivals);
            if !departed.is_empty() {
                st.used.retain(|id| !departed.contains(id));
            }
            st.used.extend(arrivals);
            st.freeze.snapshot = None;
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().freeze.depth > 0
    }

    /// Copy of the Used List as it stands (arrivals included).
    pub fn used_list(&self) -> Vec<PageId> {
        let st = self.state.lock();
        st.used.iter().chain(st.freeze.arrivals.iter()).copied().collect()
    }

    /// Descriptor of one page.
    pub fn page(&self, id: PageId) -> Option<Page> {
        let st = self.state.lock();
        st.valid(id).then(|| st.page(id).clone())
    }

    /// Pin `pages` for reading. `None` if any of them is free.
    pub fn pin(&self, pages: &[PageId]) -> Option<PinnedPages<'_>> {
        let mut st = self.state.lock();
        if !pages.iter().all(|&id| st.valid(id) && !st.page(id).is_free()) {
            return None;
        }
        let mut views = Vec::with_capacity(pages.len());
        for &id in pages {
            let seg = &mut st.segments[id.segment as usize];
            let ptr = seg.page_ptr(id.index) as *const u8;
            let page = seg.page_mut(id.index);
            page.pin();
            views.push((id, ptr, page.len as usize));
        }
        Some(PinnedPages { pager: self, views })
    }

    fn unpin(&self, pages: impl Iterator<Item = PageId>) {
        let mut st = self.state.lock();
        for id in pages {
            st.page_mut(id).unpin();
        }
    }

    /// Run `f` with the descriptor state locked, waking blocked requesters
    /// if it freed pages.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PagerState) -> R) -> R {
        let (r, freed) = {
            let mut st: MutexGuard<'_, PagerState> = self.state.lock();
            let r = f(&mut st);
            (r, std::mem::take(&mut st.freed))
        };
        if freed {
            self.space.notify_all();
        }
        r
    }

    /// Refuse further requests and wake everyone blocked in `request` or
    /// `accept`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.space.notify_all();
        self.posted.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PagerStats {
        let st = self.state.lock();
        let total_pages = st.segments.iter().map(Segment::page_count).sum();
        let held_pages = st
            .segments
            .iter()
            .map(|s| s.pages_with(PageFlags::HELD).count())
            .sum();
        PagerStats {
            segments: st.segments.len(),
            total_pages,
            free_pages: st.free_count(),
            used_pages: st.used_len(),
            held_pages,
            posted_buffers: st.mailbox.len(),
            frozen: st.freeze.depth > 0,
        }
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A freeze window over the Used List; thaws on drop.
pub struct UsedListFreeze<'a> {
    pager: &'a Pager,
    snapshot: Arc<[PageId]>,
}

impl UsedListFreeze<'_> {
    /// The Used List as it was when the outermost freeze began.
    pub fn snapshot(&self) -> &[PageId] {
        &self.snapshot
    }

    pub(crate) fn shared_snapshot(&self) -> Arc<[PageId]> {
        Arc::clone(&self.snapshot)
    }
}

impl Drop for UsedListFreeze<'_> {
    fn drop(&mut self) {
        self.pager.thaw();
    }
}

/// Read access to a set of pinned pages; unpins on drop.
pub struct PinnedPages<'a> {
    pager: &'a Pager,
    views: Vec<(PageId, *const u8, usize)>,
}

impl PinnedPages<'_> {
    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Bytes written into page `i`.
    pub fn page(&self, i: usize) -> &[u8] {
        let (_, ptr, len) = self.views[i];
        // Pinned pages cannot be freed, and routed pages are no longer written.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.views.len()).map(move |i| self.page(i))
    }

    pub fn total_len(&self) -> usize {
        self.views.iter().map(|v| v.2).sum()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for chunk in self.iter() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl Drop for PinnedPages<'_> {
    fn drop(&mut self) {
        self.pager.unpin(self.views.iter().map(|v| v.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEAD: i32 = -7;

    fn pager() -> Pager {
        let mut cfg = BrokerConfig::new("pager_unit");
        cfg.page_size = 64;
        cfg.pages_per_segment = 8;
        cfg.max_segments = 1;
        Pager::new(&cfg).unwrap()
    }

    #[test]
    fn orphan_sweep_frees_partial_buffers_only() {
        let p = pager();
        let mut partial = p.request_as(64 * 3, DEAD).unwrap();
        p.route_pages(&mut partial, 2);
        let complete = p.request_as(64 * 2, DEAD).unwrap();
        p.route(complete);
        let posted = p.request_as(64, DEAD).unwrap();
        p.post(posted, 1).unwrap();
        assert_eq!(p.stats().free_pages, 2);

        // Two routed pages and the held remainder of the partial buffer.
        assert_eq!(p.reclaim_orphans(|pid| pid != DEAD), 3);
        assert_eq!(p.used_list().len(), 2);
        assert_eq!(p.stats().posted_buffers, 1);
        assert_eq!(p.reclaim_orphans(|pid| pid != DEAD), 0);
    }

    #[test]
    fn orphan_sweep_skips_live_owners() {
        let p = pager();
        let mut partial = p.request(64 * 2).unwrap();
        p.route_pages(&mut partial, 1);
        assert_eq!(p.reclaim_orphans(|pid| pid != DEAD), 0);
        assert!(p.release_buffer(partial));
    }

    #[test]
    fn discarding_posts_keeps_accepted_tags_in_order() {
        let p = pager();
        for tag in [1, 2, 1, 3] {
            let buf = p.request(64).unwrap();
            p.post(buf, tag).unwrap();
        }
        assert_eq!(p.discard_posted(|tag| tag == 1), 2);
        assert_eq!(p.stats().posted_buffers, 2);
        assert_eq!(p.stats().free_pages, 6);
        assert!(p.try_accept(1, u32::MAX).is_some());
        assert!(p.try_accept(1, u32::MAX).is_some());
        assert!(p.try_accept(2, u32::MAX).is_none());
    }
}
