// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Links: the per-peer threads that move buffers between the pager and the
// outside world, and the registry the scheduler drives them through.
//
// Outbound links deliver scheduled buffers to a `Sink`. Inbound links accept
// posted buffers for their tag and route them into the pager.
//
// A link's tick is the next schedule tick it still has to deliver. Pages
// scheduled at a tick below every outbound link's tick can be reclaimed.
//
// Lifecycle:
//   Running --halt/purge/exit--> CancelRequested --thread exits--> Drained
//   Drained --reaped by the scheduler--> (gone)

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::broker::Shared;
use crate::error::{BrokerError, Result};
use crate::handshake::{Handshake, HandshakePeer, Release};
use crate::page::ObjectId;
use crate::pager::PinnedPages;
use crate::scheduler::ScheduledBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer to pager.
    Inbound,
    /// Pager to peer.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Running,
    /// Asked to stop; its thread has not exited yet.
    CancelRequested,
    /// Thread exited; waiting to be reaped.
    Drained,
}

/// Point-in-time description of a registered link.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub id: LinkId,
    pub direction: Direction,
    pub pid: i32,
    /// `(tag, mask)` of an inbound link.
    pub filter: Option<(u32, u32)>,
    pub state: LinkState,
    /// Next tick an outbound link needs.
    pub tick: Option<u64>,
    /// Buffers delivered (outbound) or routed (inbound).
    pub transferred: u64,
}

// ---------------------------------------------------------------------------
// Consumer surface
// ---------------------------------------------------------------------------

/// A scheduled buffer, pinned for the duration of one delivery.
pub struct BufferView<'a> {
    entry: &'a ScheduledBuffer,
    pages: &'a PinnedPages<'a>,
}

impl<'a> BufferView<'a> {
    pub(crate) fn new(entry: &'a ScheduledBuffer, pages: &'a PinnedPages<'a>) -> Self {
        Self { entry, pages }
    }

    pub fn object(&self) -> ObjectId {
        self.entry.object
    }

    /// Tick the buffer was scheduled at.
    pub fn tick(&self) -> u64 {
        self.entry.tick
    }

    pub fn is_out_of_band(&self) -> bool {
        self.entry.out_of_band
    }

    /// Payload bytes across all pages.
    pub fn len(&self) -> usize {
        self.pages.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, i: usize) -> &[u8] {
        self.pages.page(i)
    }

    pub fn pages(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.pages.iter()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.pages.to_vec()
    }
}

/// Where an outbound link delivers.
///
/// An error from `deliver` or a failed health check cancels the link.
pub trait Sink: Send + 'static {
    fn deliver(&mut self, buffer: &BufferView<'_>) -> io::Result<()>;

    fn health_check(&mut self) -> bool {
        true
    }
}

impl<F> Sink for F
where
    F: FnMut(&BufferView<'_>) -> io::Result<()> + Send + 'static,
{
    fn deliver(&mut self, buffer: &BufferView<'_>) -> io::Result<()> {
        self(buffer)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Unit of work handed to an outbound link: deliver every logged buffer up
/// to and including `upto`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Work {
    pub upto: u64,
    pub health_check: bool,
}

pub(crate) struct LinkShared {
    pub id: LinkId,
    pub direction: Direction,
    pub pid: i32,
    pub tag: u32,
    pub mask: u32,
    pub tick: AtomicU64,
    pub killme: AtomicBool,
    pub transferred: AtomicU64,
}

impl LinkShared {
    pub fn new(id: LinkId, direction: Direction, pid: i32, tag: u32, mask: u32, tick: u64) -> Self {
        Self {
            id,
            direction,
            pid,
            tag,
            mask,
            tick: AtomicU64::new(tick),
            killme: AtomicBool::new(false),
            transferred: AtomicU64::new(0),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.killme.load(Ordering::Acquire)
    }

    /// Returns `true` if this call made the transition.
    pub fn cancel(&self) -> bool {
        !self.killme.swap(true, Ordering::AcqRel)
    }

    fn matches(&self, tag: u32) -> bool {
        tag & self.mask == self.tag & self.mask
    }
}

pub(crate) struct LinkEntry {
    pub link: Arc<LinkShared>,
    pub thread: Option<JoinHandle<()>>,
    pub work: Option<Handshake<Work>>,
}

impl LinkEntry {
    fn state(&self) -> LinkState {
        let finished = self.thread.as_ref().map_or(true, JoinHandle::is_finished);
        match (self.link.cancelled(), finished) {
            (_, true) => LinkState::Drained,
            (true, false) => LinkState::CancelRequested,
            (false, false) => LinkState::Running,
        }
    }

    /// Join the thread. The link must already be cancelled.
    pub fn join(mut self) {
        self.work = None;
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                tracing::error!(link = %self.link.id, "link thread panicked outside its guard");
            }
        }
    }
}

pub(crate) struct LinkRegistry {
    links: BTreeMap<LinkId, LinkEntry>,
    next_id: u32,
    inbound: usize,
    high_water: usize,
}

impl LinkRegistry {
    pub fn new(high_water: usize) -> Self {
        Self { links: BTreeMap::new(), next_id: 1, inbound: 0, high_water }
    }

    pub fn allocate_id(&mut self) -> LinkId {
        let id = LinkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Fail if one more inbound link would exceed the water mark.
    pub fn check_water_mark(&self) -> Result<()> {
        if self.inbound >= self.high_water {
            return Err(BrokerError::WaterMark(self.inbound));
        }
        Ok(())
    }

    pub fn insert(&mut self, entry: LinkEntry) {
        if entry.link.direction == Direction::Inbound {
            self.inbound += 1;
        }
        self.links.insert(entry.link.id, entry);
    }

    fn remove_entry(&mut self, id: LinkId) -> Option<LinkEntry> {
        let entry = self.links.remove(&id)?;
        if entry.link.direction == Direction::Inbound {
            self.inbound -= 1;
        }
        Some(entry)
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound
    }

    pub fn outbound_count(&self) -> usize {
        self.links.len() - self.inbound
    }

    pub fn halt(&self, id: LinkId) -> bool {
        self.links.get(&id).is_some_and(|e| e.link.cancel())
    }

    /// Cancel every inbound link belonging to `pid`. Returns how many were
    /// newly cancelled.
    pub fn purge(&self, pid: i32) -> usize {
        self.links
            .values()
            .filter(|e| e.link.direction == Direction::Inbound && e.link.pid == pid)
            .filter(|e| e.link.cancel())
            .count()
    }

    pub fn state(&self, id: LinkId) -> Option<LinkState> {
        self.links.get(&id).map(LinkEntry::state)
    }

    pub fn tick(&self, id: LinkId) -> Option<u64> {
        self.links
            .get(&id)
            .filter(|e| e.link.direction == Direction::Outbound)
            .map(|e| e.link.tick.load(Ordering::Acquire))
    }

    fn outbound(&self) -> impl Iterator<Item = &LinkEntry> {
        self.links.values().filter(|e| e.link.direction == Direction::Outbound)
    }

    /// Lowest tick any outbound link still needs, or `clock + 1` with none.
    /// Cancelled links count until reaped: their threads may still be reading.
    pub fn min_tick(&self, clock: u64) -> u64 {
        self.outbound()
            .map(|e| e.link.tick.load(Ordering::Acquire))
            .min()
            .unwrap_or(clock + 1)
    }

    /// Release every live outbound link with work through `clock`, without
    /// waiting for any of them. Returns how many were released.
    pub fn release_outbound(&self, clock: u64, health_check: bool) -> usize {
        let mut released = 0;
        for e in self.outbound() {
            if e.link.cancelled() {
                continue;
            }
            let Some(work) = &e.work else { continue };
            work.take_done();
            if e.link.tick.load(Ordering::Acquire) > clock && !health_check {
                continue;
            }
            match work.release(Work { upto: clock, health_check }) {
                Release::Sent => released += 1,
                Release::Pending => {}
                Release::Gone => {
                    e.link.cancel();
                }
            }
        }
        released
    }

    /// Remove links whose threads have exited after cancellation.
    pub fn take_drained(&mut self) -> Vec<LinkEntry> {
        let ids: Vec<LinkId> = self
            .links
            .values()
            .filter(|e| e.link.cancelled() && e.state() == LinkState::Drained)
            .map(|e| e.link.id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove_entry(id)).collect()
    }

    /// Cancel and remove everything.
    pub fn take_all(&mut self) -> Vec<LinkEntry> {
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.remove_entry(id))
            .inspect(|e| {
                e.link.cancel();
            })
            .collect()
    }

    /// Distinct pids of live inbound links.
    pub fn inbound_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self
            .links
            .values()
            .filter(|e| e.link.direction == Direction::Inbound && !e.link.cancelled())
            .map(|e| e.link.pid)
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    /// True if a live inbound link would accept a buffer posted under `tag`.
    pub fn accepts(&self, tag: u32) -> bool {
        self.links.values().any(|e| {
            e.link.direction == Direction::Inbound && !e.link.cancelled() && e.link.matches(tag)
        })
    }

    /// Filters of live inbound links.
    pub fn live_filters(&self) -> Vec<(u32, u32)> {
        self.links
            .values()
            .filter(|e| e.link.direction == Direction::Inbound && !e.link.cancelled())
            .map(|e| (e.link.tag, e.link.mask))
            .collect()
    }

    pub fn infos(&self) -> Vec<LinkInfo> {
        self.links
            .values()
            .map(|e| LinkInfo {
                id: e.link.id,
                direction: e.link.direction,
                pid: e.link.pid,
                filter: (e.link.direction == Direction::Inbound).then_some((e.link.tag, e.link.mask)),
                state: e.state(),
                tick: (e.link.direction == Direction::Outbound)
                    .then(|| e.link.tick.load(Ordering::Acquire)),
                transferred: e.link.transferred.load(Ordering::Relaxed),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Link threads
// ---------------------------------------------------------------------------

/// Sets `killme` however the thread leaves, so the scheduler can reap it.
struct ExitGuard<'a>(&'a LinkShared);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn guarded<F>(link: &LinkShared, body: F)
where
    F: FnOnce() -> io::Result<()>,
{
    let _exit = ExitGuard(link);
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => tracing::debug!(link = %link.id, "link thread exiting"),
        Ok(Err(e)) => tracing::warn!(link = %link.id, pid = link.pid, error = %e, "link failed"),
        Err(_) => tracing::error!(link = %link.id, pid = link.pid, "link thread panicked"),
    }
}

pub(crate) fn run_outbound(
    shared: Arc<Shared>,
    link: Arc<LinkShared>,
    peer: HandshakePeer<Work>,
    mut sink: Box<dyn Sink>,
) {
    guarded(&link, || outbound_loop(&shared, &link, &peer, sink.as_mut()));
}

fn outbound_loop(
    shared: &Shared,
    link: &LinkShared,
    peer: &HandshakePeer<Work>,
    sink: &mut dyn Sink,
) -> io::Result<()> {
    let poll = shared.config.accept_poll;
    loop {
        if link.cancelled() {
            return Ok(());
        }
        let work = match peer.wait(poll) {
            Ok(Some(w)) => w,
            Ok(None) => continue,
            Err(_) => return Ok(()),
        };

        if work.health_check && !sink.health_check() {
            tracing::warn!(link = %link.id, pid = link.pid, "health check failed");
            return Ok(());
        }

        let from = link.tick.load(Ordering::Acquire);
        if work.upto < from {
            peer.done();
            continue;
        }

        let batch = shared.log.range(from, work.upto);
        let (oob, ordinary): (Vec<_>, Vec<_>) = batch.iter().partition(|b| b.out_of_band);
        for entry in oob.into_iter().chain(ordinary) {
            if link.cancelled() {
                return Ok(());
            }
            let Some(pinned) = shared.pager.pin(&entry.pages) else {
                tracing::error!(link = %link.id, object = %entry.object, "scheduled pages vanished before delivery");
                continue;
            };
            sink.deliver(&BufferView::new(entry, &pinned))?;
            link.transferred.fetch_add(1, Ordering::Relaxed);
        }

        link.tick.fetch_max(work.upto + 1, Ordering::AcqRel);
        peer.done();
        shared.kick();
    }
}

pub(crate) fn run_inbound(shared: Arc<Shared>, link: Arc<LinkShared>) {
    guarded(&link, || inbound_loop(&shared, &link));
}

fn inbound_loop(shared: &Shared, link: &LinkShared) -> io::Result<()> {
    let poll = shared.config.accept_poll;
    loop {
        if link.cancelled() {
            return Ok(());
        }
        match shared.pager.accept(link.tag, link.mask, poll) {
            Ok(Some(buf)) => {
                if link.cancelled() {
                    shared.pager.release_buffer(buf);
                    return Ok(());
                }
                shared.pager.route(buf);
                link.transferred.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(BrokerError::Closed) => return Ok(()),
            Err(e) => return Err(io::Error::other(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::handshake;

    fn entry(reg: &mut LinkRegistry, direction: Direction, pid: i32, tag: u32, tick: u64) -> LinkId {
        let id = reg.allocate_id();
        let (work, _peer) = handshake();
        reg.insert(LinkEntry {
            link: Arc::new(LinkShared::new(id, direction, pid, tag, u32::MAX, tick)),
            thread: None,
            work: (direction == Direction::Outbound).then_some(work),
        });
        id
    }

    #[test]
    fn min_tick_defaults_past_clock() {
        let reg = LinkRegistry::new(4);
        assert_eq!(reg.min_tick(9), 10);
    }

    #[test]
    fn min_tick_ignores_inbound() {
        let mut reg = LinkRegistry::new(4);
        entry(&mut reg, Direction::Outbound, 1, 0, 5);
        entry(&mut reg, Direction::Outbound, 1, 0, 7);
        entry(&mut reg, Direction::Inbound, 1, 3, 0);
        assert_eq!(reg.min_tick(9), 5);
    }

    #[test]
    fn water_mark_counts_inbound_only() {
        let mut reg = LinkRegistry::new(1);
        entry(&mut reg, Direction::Outbound, 1, 0, 1);
        assert!(reg.check_water_mark().is_ok());
        entry(&mut reg, Direction::Inbound, 1, 3, 0);
        assert!(matches!(reg.check_water_mark(), Err(BrokerError::WaterMark(1))));
    }

    #[test]
    fn halt_reports_only_new_transitions() {
        let mut reg = LinkRegistry::new(4);
        let id = entry(&mut reg, Direction::Outbound, 1, 0, 1);
        assert!(reg.halt(id));
        assert!(!reg.halt(id));
        assert!(!reg.halt(LinkId(999)));
    }

    #[test]
    fn drained_links_are_taken_once() {
        let mut reg = LinkRegistry::new(4);
        let id = entry(&mut reg, Direction::Inbound, 42, 3, 0);
        // Without a thread the link counts as exited once cancelled.
        assert_eq!(reg.purge(42), 1);
        assert_eq!(reg.purge(42), 0);
        assert_eq!(reg.take_drained().len(), 1);
        assert_eq!(reg.inbound_count(), 0);
        assert!(reg.state(id).is_none());
        assert!(reg.take_drained().is_empty());
    }

    #[test]
    fn accepts_follows_mask() {
        let mut reg = LinkRegistry::new(4);
        let id = reg.allocate_id();
        reg.insert(LinkEntry {
            link: Arc::new(LinkShared::new(id, Direction::Inbound, 1, 0x10, 0xF0, 0)),
            thread: None,
            work: None,
        });
        assert!(reg.accepts(0x1F));
        assert!(!reg.accepts(0x20));
        reg.halt(id);
        assert!(!reg.accepts(0x1F));
    }
}
