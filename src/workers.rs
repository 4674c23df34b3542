// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Auxiliary workers stepped by the scheduler once per cycle, while the
// Used List is frozen. Every kind runs the same loop: wait for a step, do
// one bounded unit of work, report done.
//
// A worker that dies is replaced the next time it is stepped.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::broker::Shared;
use crate::error::{BrokerError, Result};
use crate::handshake::{handshake, Completion, Handshake, HandshakePeer, Release};
use crate::pid::PidSweep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Completes pending `AcceptPage` calls from the mailbox.
    Delivery,
    /// Completes pending `RequestPage` calls as pages free up.
    PageFetch,
    /// Frees pages left by dead producers and posts nobody will accept.
    Scavenger,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [WorkerKind::Delivery, WorkerKind::PageFetch, WorkerKind::Scavenger];

    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::Delivery => "delivery",
            WorkerKind::PageFetch => "page-fetch",
            WorkerKind::Scavenger => "scavenger",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// One unit of work. Returns the number of items handled.
    fn step(self, shared: &Shared) -> usize {
        match self {
            WorkerKind::Delivery => shared.rpc.serve_accepts(&shared.pager),
            WorkerKind::PageFetch => shared.rpc.serve_page_requests(&shared.pager),
            WorkerKind::Scavenger => scavenge(shared),
        }
    }
}

fn scavenge(shared: &Shared) -> usize {
    let mut sweep = PidSweep::new();
    let pages = shared.pager.reclaim_orphans(|pid| sweep.alive(pid));
    if pages > 0 {
        let dead: Vec<i32> = sweep.dead().collect();
        tracing::info!(pages, pids = ?dead, "reclaimed pages left by dead producers");
    }

    let filters = shared.links.lock().live_filters();
    let posts = shared
        .pager
        .discard_posted(|tag| filters.iter().any(|&(t, m)| tag & m == t & m));
    if posts > 0 {
        tracing::info!(buffers = posts, "discarded posts with no inbound link");
    }
    shared.counters.reclaimed_pages.fetch_add(pages as u64, Ordering::Relaxed);
    pages + posts
}

struct Worker {
    kind: WorkerKind,
    work: Handshake<()>,
    thread: Option<JoinHandle<()>>,
    /// The last step timed out and has not reported yet.
    overran: bool,
}

/// Release one step and wait for it. An overrun step must report before a
/// new one is released, and no stale completion may stand in for the new
/// step's.
fn run_step(work: &Handshake<()>, overran: &mut bool, timeout: Duration) -> Completion {
    if *overran {
        match work.wait_done(timeout) {
            Completion::Done => *overran = false,
            other => return other,
        }
    }
    work.take_done();
    let done = match work.release(()) {
        Release::Sent | Release::Pending => work.wait_done(timeout),
        Release::Gone => Completion::Gone,
    };
    *overran = done == Completion::TimedOut;
    done
}

pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn start(shared: &Arc<Shared>) -> Result<Self> {
        let workers = WorkerKind::ALL
            .iter()
            .map(|&kind| spawn(shared, kind))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { workers })
    }

    /// Step one worker and wait for it. Returns `true` if the step completed.
    pub fn step(&mut self, shared: &Arc<Shared>, kind: WorkerKind) -> bool {
        let timeout = shared.config.worker_step_timeout;
        let worker = &mut self.workers[kind.index()];
        match run_step(&worker.work, &mut worker.overran, timeout) {
            Completion::Done => true,
            Completion::TimedOut => {
                tracing::warn!(worker = kind.name(), ?timeout, "worker step overran");
                false
            }
            Completion::Gone => {
                self.respawn(shared, kind);
                false
            }
        }
    }

    fn respawn(&mut self, shared: &Arc<Shared>, kind: WorkerKind) {
        let slot = &mut self.workers[kind.index()];
        if let Some(t) = slot.thread.take() {
            if t.join().is_err() {
                tracing::error!(worker = kind.name(), "worker panicked");
            }
        }
        match spawn(shared, kind) {
            Ok(fresh) => {
                *slot = fresh;
                shared.counters.worker_restarts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = kind.name(), "worker restarted");
            }
            Err(e) => tracing::error!(worker = kind.name(), error = %e, "cannot restart worker"),
        }
    }

    pub fn stop(self) {
        for w in self.workers {
            let Worker { kind, work, thread, .. } = w;
            drop(work);
            if let Some(t) = thread {
                if t.join().is_err() {
                    tracing::error!(worker = kind.name(), "worker panicked during shutdown");
                }
            }
        }
    }
}

fn spawn(shared: &Arc<Shared>, kind: WorkerKind) -> Result<Worker> {
    let (work, peer) = handshake();
    let shared = Arc::clone(shared);
    let thread = thread::Builder::new()
        .name(format!("pb-{}", kind.name()))
        .spawn(move || worker_main(kind, &shared, peer))
        .map_err(|source| BrokerError::ThreadSpawn { role: "worker", source })?;
    Ok(Worker { kind, work, thread: Some(thread), overran: false })
}

fn worker_main(kind: WorkerKind, shared: &Shared, peer: HandshakePeer<()>) {
    loop {
        match peer.wait(Duration::from_millis(100)) {
            Ok(Some(())) => {
                let handled = kind.step(shared);
                if handled > 0 {
                    tracing::trace!(worker = kind.name(), handled, "step");
                }
                peer.done();
            }
            Ok(None) => {}
            Err(_) => return,
        }
    }
}
