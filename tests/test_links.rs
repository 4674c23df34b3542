// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Link lifecycle: halt and purge, failing sinks, health checks, the inbound
// water mark, dead peers and the pages they leave behind.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pagebroker::{
    pid, Broker, BrokerConfig, BrokerError, BufferView, Direction, LinkState, Sink,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test_links_{tag}_{n}_{}", std::process::id())
}

fn config(tag: &str) -> BrokerConfig {
    let mut cfg = BrokerConfig::new(&unique_name(tag));
    cfg.page_size = 64;
    cfg.pages_per_segment = 32;
    cfg.max_segments = 1;
    cfg.min_sleep = Duration::from_micros(100);
    cfg.max_sleep = Duration::from_millis(5);
    cfg.accept_poll = Duration::from_millis(5);
    cfg.pid_check_interval = Duration::from_millis(20);
    cfg
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn counter_sink(count: &Arc<AtomicUsize>) -> impl FnMut(&BufferView<'_>) -> io::Result<()> + Send + 'static {
    let count = Arc::clone(count);
    move |_: &BufferView<'_>| -> io::Result<()> {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn route(broker: &Broker, len: usize) {
    let buf = broker.pager().request(len).expect("request");
    broker.pager().route(buf);
}

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> i32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id() as i32;
    child.wait().expect("wait");
    pid
}

// ========== Halt / purge ==========

#[test]
fn halt_cancels_once_and_the_link_is_reaped() {
    let broker = Broker::start(config("halt")).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let id = broker.schedule_outbound(pid::current_pid(), counter_sink(&count)).unwrap();
    assert_eq!(broker.link_state(id), Some(LinkState::Running));

    assert!(broker.halt(id));
    assert!(!broker.halt(id));
    wait_until("reaped", || broker.link_state(id).is_none());
    assert!(!broker.halt(id));

    route(&broker, 10);
    wait_until("reclaimed without consumers", || broker.status().pager.free_pages == 32);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    broker.shutdown().unwrap();
}

#[test]
fn purge_cancels_only_inbound_links_of_that_pid() {
    let broker = Broker::start(config("purge")).unwrap();
    let me = pid::current_pid();
    let count = Arc::new(AtomicUsize::new(0));
    let out = broker.schedule_outbound(me, counter_sink(&count)).unwrap();
    let in_a = broker.schedule_inbound(me, 1, u32::MAX).unwrap();
    let in_b = broker.schedule_inbound(me, 2, u32::MAX).unwrap();
    assert_eq!(broker.inbound_count(), 2);

    assert_eq!(broker.purge(me), 2);
    assert_eq!(broker.purge(me), 0);
    wait_until("inbound reaped", || {
        broker.link_state(in_a).is_none() && broker.link_state(in_b).is_none()
    });
    assert_eq!(broker.inbound_count(), 0);
    assert_eq!(broker.link_state(out), Some(LinkState::Running));
    broker.shutdown().unwrap();
}

// ========== Failing consumers ==========

#[test]
fn sink_error_cancels_the_link() {
    let broker = Broker::start(config("sink_error")).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::clone(&calls);
    let id = broker
        .schedule_outbound(pid::current_pid(), move |_: &BufferView<'_>| -> io::Result<()> {
            c2.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
        })
        .unwrap();

    route(&broker, 10);
    wait_until("link reaped", || broker.link_state(id).is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Its pages do not stay pinned to a consumer that is gone.
    route(&broker, 10);
    wait_until("pages back", || broker.status().pager.free_pages == 32);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    broker.shutdown().unwrap();
}

struct Flaky {
    healthy: Arc<AtomicBool>,
}

impl Sink for Flaky {
    fn deliver(&mut self, _: &BufferView<'_>) -> io::Result<()> {
        Ok(())
    }

    fn health_check(&mut self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[test]
fn failed_health_check_cancels_the_link() {
    let mut cfg = config("health");
    cfg.health_test_every = 1;
    let broker = Broker::start(cfg).unwrap();
    let healthy = Arc::new(AtomicBool::new(true));
    let id = broker
        .schedule_outbound(pid::current_pid(), Flaky { healthy: Arc::clone(&healthy) })
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(broker.link_state(id), Some(LinkState::Running));

    healthy.store(false, Ordering::SeqCst);
    wait_until("unhealthy link reaped", || broker.link_state(id).is_none());
    broker.shutdown().unwrap();
}

// ========== Inbound ==========

#[test]
fn posted_buffers_reach_consumers_through_inbound_links() {
    let broker = Broker::start(config("inbound")).unwrap();
    let me = pid::current_pid();
    let count = Arc::new(AtomicUsize::new(0));
    broker.schedule_outbound(me, counter_sink(&count)).unwrap();
    let inbound = broker.schedule_inbound(me, 0x10, 0xF0).unwrap();

    let buf = broker.pager().request(10).unwrap();
    assert!(broker.post(buf, 0x1A).unwrap());
    wait_until("delivered", || count.load(Ordering::SeqCst) == 1);

    let info = || {
        broker
            .links()
            .into_iter()
            .find(|l| l.id == inbound)
            .expect("inbound link listed")
    };
    assert_eq!(info().direction, Direction::Inbound);
    assert_eq!(info().filter, Some((0x10, 0xF0)));
    assert_eq!(info().tick, None);
    wait_until("transfer counted", || info().transferred == 1);

    // Nobody accepts 0x20; the buffer is freed instead of parked.
    let before = broker.status().pager.free_pages;
    let buf = broker.pager().request(10).unwrap();
    assert!(!broker.post(buf, 0x20).unwrap());
    assert_eq!(broker.status().pager.posted_buffers, 0);
    assert!(broker.status().pager.free_pages >= before);
    broker.shutdown().unwrap();
}

#[test]
fn inbound_water_mark_is_enforced() {
    let mut cfg = config("water_mark");
    cfg.inbound_high_water = 2;
    let broker = Broker::start(cfg).unwrap();
    let me = pid::current_pid();

    let first = broker.schedule_inbound(me, 1, u32::MAX).unwrap();
    broker.schedule_inbound(me, 2, u32::MAX).unwrap();
    assert!(matches!(
        broker.schedule_inbound(me, 3, u32::MAX),
        Err(BrokerError::WaterMark(2))
    ));
    // Outbound links do not count.
    let count = Arc::new(AtomicUsize::new(0));
    broker.schedule_outbound(me, counter_sink(&count)).unwrap();

    broker.halt(first);
    wait_until("slot freed", || broker.inbound_count() == 1);
    broker.schedule_inbound(me, 3, u32::MAX).unwrap();
    broker.shutdown().unwrap();
}

// ========== Dead peers ==========

#[test]
fn inbound_links_of_dead_peers_are_purged() {
    let broker = Broker::start(config("dead_peer")).unwrap();
    let gone = dead_pid();
    let id = broker.schedule_inbound(gone, 0x77, u32::MAX).unwrap();

    wait_until("dead peer purged", || broker.link_state(id).is_none());
    assert_eq!(broker.inbound_count(), 0);
    let buf = broker.pager().request(1).unwrap();
    assert!(!broker.post(buf, 0x77).unwrap());
    broker.shutdown().unwrap();
}

#[test]
fn pages_held_by_dead_producers_are_reclaimed() {
    let broker = Broker::start(config("orphans")).unwrap();
    let gone = dead_pid();
    let orphan = broker.pager().request_as(64 * 5, gone).unwrap();
    assert_eq!(orphan.owner_pid(), gone);
    let mine = broker.pager().request(64).unwrap();
    assert_eq!(broker.status().pager.held_pages, 6);

    wait_until("orphans freed", || broker.status().pager.free_pages == 31);
    assert_eq!(broker.status().pager.held_pages, 1);
    assert!(broker.pager().release_buffer(mine));
    broker.shutdown().unwrap();
}

#[test]
fn partly_routed_buffers_of_dead_producers_are_reclaimed() {
    let broker = Broker::start(config("stranded")).unwrap();
    let gone = dead_pid();
    {
        // The producer dies before routing its last page.
        let mut buf = broker.pager().request_as(64 * 3, gone).unwrap();
        assert_eq!(broker.pager().route_pages(&mut buf, 2), 2);
    }

    wait_until("stranded pages freed", || broker.status().pager.free_pages == 32);
    let status = broker.status();
    assert_eq!(status.pager.used_pages, 0);
    assert_eq!(status.pager.held_pages, 0);
    broker.shutdown().unwrap();
}

#[test]
fn posts_nobody_accepts_are_discarded() {
    let broker = Broker::start(config("unclaimed")).unwrap();
    let inbound = broker.schedule_inbound(pid::current_pid(), 0x10, 0xF0).unwrap();

    // Straight to the pager, past the tag check in Broker::post.
    let unclaimed = broker.pager().request(64 * 2).unwrap();
    broker.pager().post(unclaimed, 0x20).unwrap();
    let claimed = broker.pager().request(64).unwrap();
    broker.pager().post(claimed, 0x1A).unwrap();

    wait_until("mailbox drained", || {
        let s = broker.status();
        s.pager.posted_buffers == 0 && s.pager.free_pages == 32
    });
    let transferred = || {
        broker
            .links()
            .into_iter()
            .find(|l| l.id == inbound)
            .map_or(0, |l| l.transferred)
    };
    wait_until("one transfer", || transferred() == 1);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(transferred(), 1);
    broker.shutdown().unwrap();
}

// ========== Shutdown ==========

#[test]
fn no_new_links_after_shutdown_request() {
    let broker = Broker::start(config("closing")).unwrap();
    broker.request_shutdown();
    assert!(!broker.is_running());
    let count = Arc::new(AtomicUsize::new(0));
    assert!(matches!(
        broker.schedule_outbound(pid::current_pid(), counter_sink(&count)),
        Err(BrokerError::Closed)
    ));
    assert!(matches!(
        broker.schedule_inbound(pid::current_pid(), 1, 1),
        Err(BrokerError::Closed)
    ));
    broker.join().unwrap();
}
