// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Supervision and lifecycle: status reports, reporter restarts, shutdown
// and drop.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pagebroker::{Broker, BrokerConfig, BrokerError, BrokerStatus, StatusHook};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test_monitor_{tag}_{n}_{}", std::process::id())
}

fn config(tag: &str) -> BrokerConfig {
    let mut cfg = BrokerConfig::new(&unique_name(tag));
    cfg.page_size = 64;
    cfg.pages_per_segment = 16;
    cfg.max_segments = 2;
    cfg.status_interval = Duration::from_millis(10);
    cfg.monitor_interval = Duration::from_millis(5);
    cfg.max_sleep = Duration::from_millis(5);
    cfg
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn status_hook_sees_periodic_reports() {
    let reports = Arc::new(AtomicUsize::new(0));
    let last_total = Arc::new(AtomicU64::new(0));
    let (r2, t2) = (Arc::clone(&reports), Arc::clone(&last_total));
    let hook: StatusHook = Arc::new(move |s: &BrokerStatus| {
        r2.fetch_add(1, Ordering::SeqCst);
        t2.store(s.pager.total_pages as u64, Ordering::SeqCst);
    });
    let broker = Broker::start_with_status_hook(config("hook"), hook).unwrap();

    wait_until("three reports", || reports.load(Ordering::SeqCst) >= 3);
    assert_eq!(last_total.load(Ordering::SeqCst), 16);
    broker.shutdown().unwrap();

    let after = reports.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(reports.load(Ordering::SeqCst), after);
}

#[test]
fn reporter_is_restarted_after_a_panic() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::clone(&calls);
    let hook: StatusHook = Arc::new(move |_: &BrokerStatus| {
        if c2.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("status consumer fault");
        }
    });
    let broker = Broker::start_with_status_hook(config("restart"), hook).unwrap();

    wait_until("reports resume", || calls.load(Ordering::SeqCst) >= 3);
    assert!(broker.status().status_restarts >= 1);
    assert!(broker.is_running());
    assert!(!broker.is_fatal());
    broker.shutdown().unwrap();
}

#[test]
fn status_reflects_segment_growth() {
    let broker = Broker::start(config("growth")).unwrap();
    assert_eq!(broker.status().pager.segments, 1);
    let buf = broker.pager().request(64 * 20).unwrap();
    let s = broker.status();
    assert_eq!(s.pager.segments, 2);
    assert_eq!(s.pager.total_pages, 32);
    assert_eq!(s.pager.held_pages, 20);
    assert!(broker.pager().release_buffer(buf));
    broker.shutdown().unwrap();
}

#[test]
fn invalid_config_is_refused_at_start() {
    let mut cfg = config("invalid");
    cfg.pages_per_tick = 0;
    assert!(matches!(Broker::start(cfg), Err(BrokerError::InvalidConfig(_))));
}

#[test]
fn shutdown_wakes_blocked_producers() {
    let mut cfg = config("blocked");
    cfg.max_segments = 1;
    let broker = Broker::start(cfg).unwrap();
    let _hog = broker.pager().request(64 * 16).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| broker.pager().request(64));
        thread::sleep(Duration::from_millis(20));
        broker.request_shutdown();
        assert!(matches!(waiter.join().unwrap(), Err(BrokerError::Closed)));
    });
    broker.join().unwrap();
}

#[test]
fn dropping_the_broker_stops_it() {
    let reports = Arc::new(AtomicUsize::new(0));
    let r2 = Arc::clone(&reports);
    let hook: StatusHook = Arc::new(move |_: &BrokerStatus| {
        r2.fetch_add(1, Ordering::SeqCst);
    });
    let broker = Broker::start_with_status_hook(config("drop"), hook).unwrap();
    wait_until("a report", || reports.load(Ordering::SeqCst) >= 1);
    drop(broker);

    let after = reports.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(reports.load(Ordering::SeqCst), after);
}
