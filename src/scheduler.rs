// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The page-manager loop.
//
// One cycle:
//   1. adaptive wait (woken early by routes and link completions)
//   2. probe inbound peers, when due
//   3. reap drained links
//   4. freeze the Used List for the whole cycle
//   5. scan pass 1: out-of-band pages
//   6. scan pass 2: complete ordinary buffers, unless consumers lag
//   7. advance the clock if anything was scheduled
//   8. release outbound links, without waiting for them
//   9. reclaim pages every consumer is past
//  10. step the auxiliary workers, then thaw
//
// Lock order: link registry, then pager state. The schedule log lock is
// never held together with either.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::broker::Shared;
use crate::page::{ObjectId, PageFlags, PageId};
use crate::pager::PagerState;
use crate::workers::{WorkerKind, WorkerPool};

/// A buffer handed to consumers at `tick`.
#[derive(Debug, Clone)]
pub(crate) struct ScheduledBuffer {
    pub object: ObjectId,
    pub tick: u64,
    pub out_of_band: bool,
    pub pages: Vec<PageId>,
}

// ---------------------------------------------------------------------------
// Schedule log
// ---------------------------------------------------------------------------

/// Scheduled buffers in tick order, kept until every consumer is past them.
#[derive(Default)]
pub(crate) struct ScheduleLog {
    entries: Mutex<VecDeque<Arc<ScheduledBuffer>>>,
}

impl ScheduleLog {
    pub fn push(&self, batch: Vec<ScheduledBuffer>) {
        if batch.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        entries.extend(batch.into_iter().map(Arc::new));
    }

    /// Entries scheduled at ticks `from..=upto`, in log order.
    pub fn range(&self, from: u64, upto: u64) -> Vec<Arc<ScheduledBuffer>> {
        let entries = self.entries.lock();
        entries
            .iter()
            .skip_while(|e| e.tick < from)
            .take_while(|e| e.tick <= upto)
            .cloned()
            .collect()
    }

    /// Drop entries below `min_tick`. Returns how many were dropped.
    pub fn trim_below(&self, min_tick: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        while entries.front().is_some_and(|e| e.tick < min_tick) {
            entries.pop_front();
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Scan passes
// ---------------------------------------------------------------------------

/// Pass 1. A dirty out-of-band page at position 0 is a complete buffer and
/// is scheduled at once. Later pages of an out-of-band buffer are never
/// delivered; they are marked for reclamation. Returns the pages discarded.
pub(crate) fn schedule_out_of_band(
    st: &mut PagerState,
    snapshot: &[PageId],
    tick: u64,
    out: &mut Vec<ScheduledBuffer>,
) -> usize {
    let mut discarded = 0;
    for &id in snapshot {
        let page = st.page_mut(id);
        if !page.flags.contains(PageFlags::DIRTY | PageFlags::OUT_OF_BAND) {
            continue;
        }
        page.flags.remove(PageFlags::DIRTY);
        if page.position == 0 {
            page.flags.insert(PageFlags::LAST_PAGE | PageFlags::SCHEDULED);
            page.schedule_tick = tick;
            out.push(ScheduledBuffer {
                object: page.object,
                tick,
                out_of_band: true,
                pages: vec![id],
            });
        } else {
            page.flags.insert(PageFlags::NEVER_DIRTY);
            tracing::debug!(page = %id, object = %page.object, position = page.position, "dropping trailing out-of-band page");
            discarded += 1;
        }
    }
    discarded
}

/// Pass 2. Ordinary buffers are scheduled whole once their last page has
/// been routed, in the order they completed, until `budget` pages have been
/// scheduled. The first buffer of a pass is always taken, however large.
/// Returns the pages scheduled.
pub(crate) fn schedule_ordinary(
    st: &mut PagerState,
    snapshot: &[PageId],
    tick: u64,
    budget: usize,
    out: &mut Vec<ScheduledBuffer>,
) -> usize {
    let mut open: HashMap<ObjectId, Vec<PageId>> = HashMap::new();
    let mut scheduled = 0;
    for &id in snapshot {
        let page = st.page(id);
        if !page.flags.contains(PageFlags::DIRTY)
            || page.flags.intersects(PageFlags::OUT_OF_BAND | PageFlags::NEVER_DIRTY)
        {
            continue;
        }
        let object = page.object;
        let pages = open.entry(object).or_default();
        pages.push(id);
        if !page.flags.contains(PageFlags::LAST_PAGE) {
            continue;
        }
        let expected = page.position as usize + 1;
        let pages = open.remove(&object).unwrap_or_default();
        if pages.len() != expected {
            tracing::debug!(object = %object, have = pages.len(), expected, "buffer missing pages; holding back");
            continue;
        }
        if scheduled > 0 && scheduled + pages.len() > budget {
            break;
        }
        for &p in &pages {
            let page = st.page_mut(p);
            page.flags.remove(PageFlags::DIRTY);
            page.flags.insert(PageFlags::SCHEDULED);
            page.schedule_tick = tick;
        }
        scheduled += pages.len();
        out.push(ScheduledBuffer { object, tick, out_of_band: false, pages });
        if scheduled >= budget {
            break;
        }
    }
    scheduled
}

/// Free snapshot pages that every consumer is past, plus discarded pages.
/// Pinned pages wait for a later cycle. Returns the pages freed.
pub(crate) fn reclaim(st: &mut PagerState, snapshot: &[PageId], min_tick: u64) -> usize {
    let victims: Vec<PageId> = snapshot
        .iter()
        .copied()
        .filter(|&id| {
            let page = st.page(id);
            if page.is_free() || page.is_pinned() {
                return false;
            }
            page.flags.contains(PageFlags::NEVER_DIRTY)
                || (page.flags.contains(PageFlags::SCHEDULED) && page.schedule_tick < min_tick)
        })
        .collect();
    st.free_pages(&victims)
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    kick: Receiver<()>,
    workers: WorkerPool,
    next_pid_check: Instant,
    releases: u64,
}

/// Thread body of the page manager.
pub(crate) fn run(shared: Arc<Shared>) {
    let workers = match WorkerPool::start(&shared) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "cannot start auxiliary workers");
            return;
        }
    };
    let mut sched = Scheduler {
        next_pid_check: Instant::now() + shared.config.pid_check_interval,
        kick: shared.kick_receiver(),
        shared,
        workers,
        releases: 0,
    };
    tracing::info!(broker = %sched.shared.config.name, "scheduler running");
    sched.run_loop();
    sched.finish();
}

impl Scheduler {
    fn run_loop(&mut self) {
        let floor = self.shared.config.min_sleep.max(Duration::from_micros(1));
        let ceiling = self.shared.config.max_sleep.max(floor);
        let mut wait = floor;
        while !self.shared.quit.is_set() {
            match self.kick.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.shared.quit.is_set() {
                break;
            }
            wait = if self.cycle() { floor } else { (wait * 2).min(ceiling) };
        }
    }

    /// One pass of the loop. Returns `true` if work was done or is pending.
    fn cycle(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let cfg = &shared.config;

        let now = Instant::now();
        let pid_due = now >= self.next_pid_check;
        if pid_due {
            shared.check_pids();
            self.next_pid_check = now + cfg.pid_check_interval;
        }
        shared.reap_links();

        let window = shared.pager.freeze();
        let progressed = {
            let scan = shared.pager.freeze();
            let snapshot = scan.shared_snapshot();

            let clock = shared.clock.load(Ordering::Acquire);
            let min_before = shared.links.lock().min_tick(clock);
            let lagging = (clock + 1).saturating_sub(min_before) > cfg.lag_limit;
            let tick = clock + 1;

            let (batch, ordinary_pages, discarded) = shared.pager.with_state(|st| {
                let mut batch = Vec::new();
                let discarded = schedule_out_of_band(st, &snapshot, tick, &mut batch);
                let ordinary = if lagging {
                    0
                } else {
                    schedule_ordinary(st, &snapshot, tick, cfg.pages_per_tick, &mut batch)
                };
                (batch, ordinary, discarded)
            });
            if lagging {
                tracing::debug!(clock, min_tick = min_before, limit = cfg.lag_limit, "consumers lagging; ordinary scheduling paused");
            }
            let scheduled = batch.len();
            shared.log.push(batch);

            let (clock, min_tick, released, reclaimed) = {
                let links = shared.links.lock();
                let clock = if scheduled > 0 {
                    shared.clock.fetch_add(1, Ordering::AcqRel) + 1
                } else {
                    clock
                };
                let min_tick = links.min_tick(clock);
                self.releases += 1;
                let health = cfg.health_test_every > 0 && self.releases % cfg.health_test_every == 0;
                let released = links.release_outbound(clock, health);
                let reclaimed = shared.pager.with_state(|st| reclaim(st, &snapshot, min_tick));
                (clock, min_tick, released, reclaimed)
            };
            shared.min_tick.store(min_tick, Ordering::Release);
            shared.log.trim_below(min_tick);

            let c = &shared.counters;
            c.cycles.fetch_add(1, Ordering::Relaxed);
            c.scheduled_buffers.fetch_add(scheduled as u64, Ordering::Relaxed);
            c.scheduled_pages.fetch_add(ordinary_pages as u64, Ordering::Relaxed);
            c.discarded_pages.fetch_add(discarded as u64, Ordering::Relaxed);
            c.reclaimed_pages.fetch_add(reclaimed as u64, Ordering::Relaxed);

            if scheduled > 0 || reclaimed > 0 {
                tracing::trace!(clock, min_tick, scheduled, released, reclaimed, "cycle");
            }
            scheduled > 0 || reclaimed > 0
        };

        self.workers.step(&shared, WorkerKind::Delivery);
        self.workers.step(&shared, WorkerKind::PageFetch);
        if pid_due {
            self.workers.step(&shared, WorkerKind::Scavenger);
        }
        drop(window);

        progressed || shared.rpc.pending() > 0
    }

    fn finish(self) {
        let Scheduler { shared, workers, .. } = self;
        workers.stop();
        shared.teardown();
        tracing::info!(broker = %shared.config.name, clock = shared.clock.load(Ordering::Acquire), "scheduler stopped");
    }
}
