// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The broker context: pager, link registry, schedule log and clock, shared
// by the scheduler, link threads, workers and the public handle.
//
// Thread layout:
//   pb-scheduler   page-manager loop (owns the auxiliary workers)
//   pb-monitor     supervises the scheduler and the status reporter
//   pb-status      periodic status report
//   pb-out-N       one per outbound link
//   pb-in-N        one per inbound link

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as chan, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::handshake::{handshake, QuitSignal};
use crate::link::{self, Direction, LinkEntry, LinkId, LinkInfo, LinkRegistry, LinkShared, LinkState, Sink};
use crate::monitor::{self, StatusHook};
use crate::page::Buffer;
use crate::pager::{Pager, PagerStats};
use crate::pid;
use crate::rpc::{Call, CallHandle, Client, Directory, Endpoint, Reply, RpcQueues};
use crate::scheduler::{self, ScheduleLog};

/// Point-in-time broker report.
#[derive(Debug, Clone, Default)]
pub struct BrokerStatus {
    pub clock: u64,
    pub min_tick: u64,
    pub cycles: u64,
    pub pager: PagerStats,
    pub inbound_links: usize,
    pub outbound_links: usize,
    /// Scheduled buffers still retained for some consumer.
    pub log_entries: usize,
    pub scheduled_buffers: u64,
    /// Pages of ordinary buffers scheduled.
    pub scheduled_pages: u64,
    pub reclaimed_pages: u64,
    pub discarded_pages: u64,
    pub pending_calls: usize,
    pub status_restarts: u64,
    pub worker_restarts: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub cycles: AtomicU64,
    pub scheduled_buffers: AtomicU64,
    pub scheduled_pages: AtomicU64,
    pub reclaimed_pages: AtomicU64,
    pub discarded_pages: AtomicU64,
    pub status_restarts: AtomicU64,
    pub worker_restarts: AtomicU64,
}

pub(crate) struct Shared {
    pub config: BrokerConfig,
    pub pager: Pager,
    pub log: ScheduleLog,
    pub links: Mutex<LinkRegistry>,
    /// Tick of the most recent cycle that scheduled anything.
    pub clock: AtomicU64,
    pub min_tick: AtomicU64,
    pub counters: Counters,
    pub rpc: RpcQueues,
    pub directory: Arc<Directory>,
    pub quit: QuitSignal,
    pub fatal: AtomicBool,
    kick_tx: Sender<()>,
    kick_rx: Receiver<()>,
}

impl Shared {
    pub fn new(config: BrokerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (kick_tx, kick_rx) = chan::bounded(1);
        let pager = Pager::with_kick(&config, Some(kick_tx.clone()))?;
        Ok(Arc::new(Self {
            links: Mutex::new(LinkRegistry::new(config.inbound_high_water)),
            config,
            pager,
            log: ScheduleLog::default(),
            clock: AtomicU64::new(0),
            min_tick: AtomicU64::new(1),
            counters: Counters::default(),
            rpc: RpcQueues::default(),
            directory: Arc::new(Directory::default()),
            quit: QuitSignal::new(),
            fatal: AtomicBool::new(false),
            kick_tx,
            kick_rx,
        }))
    }

    /// Wake the scheduler early.
    pub fn kick(&self) {
        let _ = self.kick_tx.try_send(());
    }

    pub fn kick_receiver(&self) -> Receiver<()> {
        self.kick_rx.clone()
    }

    pub fn status(&self) -> BrokerStatus {
        let (inbound_links, outbound_links) = {
            let links = self.links.lock();
            (links.inbound_count(), links.outbound_count())
        };
        let c = &self.counters;
        BrokerStatus {
            clock: self.clock.load(Ordering::Acquire),
            min_tick: self.min_tick.load(Ordering::Acquire),
            cycles: c.cycles.load(Ordering::Relaxed),
            pager: self.pager.stats(),
            inbound_links,
            outbound_links,
            log_entries: self.log.len(),
            scheduled_buffers: c.scheduled_buffers.load(Ordering::Relaxed),
            scheduled_pages: c.scheduled_pages.load(Ordering::Relaxed),
            reclaimed_pages: c.reclaimed_pages.load(Ordering::Relaxed),
            discarded_pages: c.discarded_pages.load(Ordering::Relaxed),
            pending_calls: self.rpc.pending(),
            status_restarts: c.status_restarts.load(Ordering::Relaxed),
            worker_restarts: c.worker_restarts.load(Ordering::Relaxed),
        }
    }

    /// Cancel the inbound links of peers that no longer exist.
    pub fn check_pids(&self) {
        let pids = self.links.lock().inbound_pids();
        let dead: Vec<i32> = pids.into_iter().filter(|&p| !pid::pid_alive(p)).collect();
        if dead.is_empty() {
            return;
        }
        let links = self.links.lock();
        for pid in dead {
            let n = links.purge(pid);
            if n > 0 {
                tracing::warn!(pid, links = n, "inbound peer is gone; links cancelled");
            }
        }
    }

    /// Remove and join links whose threads have exited. Posts that no
    /// remaining inbound link would accept are freed.
    pub fn reap_links(&self) {
        let (reaped, filters) = {
            let mut links = self.links.lock();
            let reaped = links.take_drained();
            if reaped.is_empty() {
                return;
            }
            (reaped, links.live_filters())
        };
        let inbound = reaped.iter().any(|e| e.link.direction == Direction::Inbound);
        for entry in reaped {
            tracing::info!(
                link = %entry.link.id,
                direction = ?entry.link.direction,
                pid = entry.link.pid,
                transferred = entry.link.transferred.load(Ordering::Relaxed),
                "link reaped"
            );
            entry.join();
        }
        if inbound {
            let dropped = self
                .pager
                .discard_posted(|tag| filters.iter().any(|&(t, m)| tag & m == t & m));
            if dropped > 0 {
                tracing::info!(buffers = dropped, "discarded posts of reaped inbound links");
            }
        }
    }

    /// Stop everything the scheduler drives. Idempotent.
    pub fn teardown(&self) {
        self.quit.trigger();
        self.pager.close();
        let entries = self.links.lock().take_all();
        for entry in entries {
            entry.join();
        }
        self.rpc.close();
        self.directory.clear();
    }

    fn spawn_outbound(self: &Arc<Self>, pid: i32, sink: Box<dyn Sink>) -> Result<LinkId> {
        let mut links = self.links.lock();
        if self.quit.is_set() {
            return Err(BrokerError::Closed);
        }
        let id = links.allocate_id();
        let tick = self.clock.load(Ordering::Acquire) + 1;
        let link = Arc::new(LinkShared::new(id, Direction::Outbound, pid, 0, 0, tick));
        let (work, peer) = handshake();
        let thread = {
            let shared = Arc::clone(self);
            let link = Arc::clone(&link);
            thread::Builder::new()
                .name(format!("pb-out-{}", id.0))
                .spawn(move || link::run_outbound(shared, link, peer, sink))
                .map_err(|source| BrokerError::ThreadSpawn { role: "outbound link", source })?
        };
        links.insert(LinkEntry { link, thread: Some(thread), work: Some(work) });
        tracing::info!(link = %id, pid, tick, "outbound link scheduled");
        Ok(id)
    }

    fn spawn_inbound(self: &Arc<Self>, pid: i32, tag: u32, mask: u32) -> Result<LinkId> {
        let mut links = self.links.lock();
        if self.quit.is_set() {
            return Err(BrokerError::Closed);
        }
        links.check_water_mark()?;
        let id = links.allocate_id();
        let link = Arc::new(LinkShared::new(id, Direction::Inbound, pid, tag, mask, 0));
        let thread = {
            let shared = Arc::clone(self);
            let link = Arc::clone(&link);
            thread::Builder::new()
                .name(format!("pb-in-{}", id.0))
                .spawn(move || link::run_inbound(shared, link))
                .map_err(|source| BrokerError::ThreadSpawn { role: "inbound link", source })?
        };
        links.insert(LinkEntry { link, thread: Some(thread), work: None });
        tracing::info!(link = %id, pid, tag, mask, water_mark = links.inbound_count(), "inbound link scheduled");
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A running broker. Dropping it shuts the broker down.
pub struct Broker {
    shared: Arc<Shared>,
    monitor: Option<JoinHandle<Result<()>>>,
}

impl Broker {
    /// Map the first segment and start the scheduler and monitor threads.
    pub fn start(config: BrokerConfig) -> Result<Self> {
        Self::launch(config, None)
    }

    /// [`Broker::start`], calling `hook` with every status report.
    pub fn start_with_status_hook(config: BrokerConfig, hook: StatusHook) -> Result<Self> {
        Self::launch(config, Some(hook))
    }

    fn launch(config: BrokerConfig, hook: Option<StatusHook>) -> Result<Self> {
        let shared = Shared::new(config)?;
        let scheduler = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("pb-scheduler".into())
                .spawn(move || scheduler::run(shared))
                .map_err(|source| BrokerError::ThreadSpawn { role: "scheduler", source })?
        };
        let monitor = match monitor::spawn(Arc::clone(&shared), scheduler, hook) {
            Ok(m) => m,
            Err(e) => {
                shared.quit.trigger();
                shared.kick();
                return Err(e);
            }
        };
        tracing::info!(
            broker = %shared.config.name,
            page_size = shared.config.page_size,
            capacity = shared.pager.capacity(),
            "broker started"
        );
        Ok(Self { shared, monitor: Some(monitor) })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Producer surface: request, write, route, release.
    pub fn pager(&self) -> &Pager {
        &self.shared.pager
    }

    /// Post a complete buffer for an inbound link. Returns `Ok(false)`, and
    /// frees the buffer, if no live inbound link accepts `tag`.
    pub fn post(&self, buffer: Buffer, tag: u32) -> Result<bool> {
        if !self.shared.links.lock().accepts(tag) {
            tracing::debug!(tag, object = %buffer.object(), "post refused; no inbound link for tag");
            self.shared.pager.release_buffer(buffer);
            return Ok(false);
        }
        self.shared.pager.post(buffer, tag)?;
        Ok(true)
    }

    /// Register a consumer. It receives every buffer scheduled after now.
    pub fn schedule_outbound<S: Sink>(&self, pid: i32, sink: S) -> Result<LinkId> {
        self.shared.spawn_outbound(pid, Box::new(sink))
    }

    /// Register an inbound link for peer `pid`, accepting posts whose tag
    /// matches `tag` under `mask`.
    pub fn schedule_inbound(&self, pid: i32, tag: u32, mask: u32) -> Result<LinkId> {
        self.shared.spawn_inbound(pid, tag, mask)
    }

    /// Request cancellation of one link. `true` only if this call cancelled it.
    pub fn halt(&self, id: LinkId) -> bool {
        let halted = self.shared.links.lock().halt(id);
        if halted {
            tracing::info!(link = %id, "link halted");
            self.shared.kick();
        }
        halted
    }

    /// Cancel every inbound link of `pid`. Returns how many were newly cancelled.
    pub fn purge(&self, pid: i32) -> usize {
        let n = self.shared.links.lock().purge(pid);
        if n > 0 {
            tracing::info!(pid, links = n, "links purged");
            self.shared.kick();
        }
        n
    }

    /// `None` once the link has been reaped (or never existed).
    pub fn link_state(&self, id: LinkId) -> Option<LinkState> {
        self.shared.links.lock().state(id)
    }

    /// Next tick an outbound link needs.
    pub fn link_tick(&self, id: LinkId) -> Option<u64> {
        self.shared.links.lock().tick(id)
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.shared.links.lock().infos()
    }

    /// Registered inbound links (the water mark).
    pub fn inbound_count(&self) -> usize {
        self.shared.links.lock().inbound_count()
    }

    pub fn clock(&self) -> u64 {
        self.shared.clock.load(Ordering::Acquire)
    }

    /// Oldest tick still needed by a consumer, as of the last cycle.
    pub fn min_tick(&self) -> u64 {
        self.shared.min_tick.load(Ordering::Acquire)
    }

    pub fn status(&self) -> BrokerStatus {
        self.shared.status()
    }

    /// Bind `url` for RPC.
    pub fn listen(&self, url: &str) -> Result<Endpoint> {
        if self.shared.quit.is_set() {
            return Err(BrokerError::Closed);
        }
        self.shared.directory.bind(url)
    }

    pub fn connect(&self, url: &str) -> Result<Client> {
        self.shared.directory.connect(url)
    }

    /// Serve one accepted call. Returns `false` if the handle is unknown.
    pub fn dispatch(&self, endpoint: &Endpoint, handle: CallHandle) -> bool {
        let Some(env) = endpoint.take(handle) else {
            return false;
        };
        match env.call {
            Call::Status => {
                let _ = env.reply.send(Reply::Status(self.status()));
            }
            call => {
                self.shared.rpc.defer(call, env.reply);
                self.shared.kick();
            }
        }
        true
    }

    pub fn is_running(&self) -> bool {
        !self.shared.quit.is_set()
    }

    /// True if the broker stopped because its scheduler died.
    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::Acquire)
    }

    /// Stop the broker and wait for its threads.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    /// Wait until the broker stops on its own (a fatal error, or a
    /// shutdown requested elsewhere).
    pub fn join(mut self) -> Result<()> {
        self.wait()
    }

    /// Ask the broker to stop without waiting.
    pub fn request_shutdown(&self) {
        if self.shared.quit.trigger() {
            tracing::info!(broker = %self.shared.config.name, "shutdown requested");
        }
        self.shared.kick();
    }

    fn stop(&mut self) -> Result<()> {
        self.request_shutdown();
        self.wait()
    }

    fn wait(&mut self) -> Result<()> {
        let Some(monitor) = self.monitor.take() else {
            return Ok(());
        };
        monitor.join().unwrap_or_else(|_| {
            tracing::error!("monitor thread panicked");
            Err(BrokerError::SchedulerDied)
        })
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if self.monitor.is_some() {
            if let Err(e) = self.stop() {
                tracing::error!(error = %e, "broker stopped with error");
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.shared.config.name)
            .field("clock", &self.clock())
            .field("running", &self.is_running())
            .finish()
    }
}
