// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RPC surface: binding, status calls, deferred page requests and accepts,
// and behaviour once the broker is closing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pagebroker::{pid, Broker, BrokerConfig, BrokerError, BufferView, CallKind, Client, Endpoint};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test_rpc_{tag}_{n}_{}", std::process::id())
}

fn config(tag: &str) -> BrokerConfig {
    let mut cfg = BrokerConfig::new(&unique_name(tag));
    cfg.page_size = 64;
    cfg.pages_per_segment = 16;
    cfg.max_segments = 1;
    cfg.min_sleep = Duration::from_micros(100);
    cfg.max_sleep = Duration::from_millis(5);
    // Keep the scavenger away from posts made straight to the pager.
    cfg.pid_check_interval = Duration::from_secs(60);
    cfg
}

fn url(tag: &str) -> String {
    format!("pb://{}", unique_name(tag))
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn serve(broker: &Broker, endpoint: &Endpoint, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        if let Some(call) = endpoint.accept(5_000) {
            assert!(broker.dispatch(endpoint, call));
        }
    }
}

// ========== Directory ==========

#[test]
fn urls_bind_once_and_must_exist() {
    let broker = Broker::start(config("bind")).unwrap();
    let u = url("bind");
    assert!(matches!(broker.connect(&u), Err(BrokerError::UnknownEndpoint(_))));
    let ep = broker.listen(&u).unwrap();
    assert_eq!(ep.url(), u);
    assert!(matches!(broker.listen(&u), Err(BrokerError::EndpointInUse(_))));
    assert!(broker.connect(&u).is_ok());
    drop(ep);
    assert!(broker.connect(&u).is_err());
    broker.shutdown().unwrap();
}

// ========== Calls ==========

#[test]
fn status_is_answered_inline() {
    let broker = Broker::start(config("status")).unwrap();
    let u = url("status");
    let ep = broker.listen(&u).unwrap();
    let client = Client::connect(&broker, &u).unwrap();
    assert_eq!(client.url(), u);

    let caller = thread::spawn(move || client.status());
    let h = ep.accept(5_000_000).expect("call");
    assert_eq!(ep.kind(h), Some(CallKind::Status));
    assert!(broker.dispatch(&ep, h));
    assert!(!broker.dispatch(&ep, h));

    let status = caller.join().unwrap().unwrap();
    assert_eq!(status.pager.total_pages, 16);
    assert_eq!(status.pager.segments, 1);
    broker.shutdown().unwrap();
}

#[test]
fn requested_pages_can_be_routed_to_consumers() {
    let broker = Broker::start(config("request")).unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let d2 = Arc::clone(&delivered);
    broker
        .schedule_outbound(pid::current_pid(), move |b: &BufferView<'_>| -> std::io::Result<()> {
            d2.fetch_add(b.len(), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let u = url("request");
    let ep = broker.listen(&u).unwrap();
    let client = broker.connect(&u).unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| serve(&broker, &ep, &stop));

        let mut buf = client.request_page(100).unwrap();
        assert_eq!(buf.page_count(), 2);
        assert!(!buf.is_out_of_band());
        assert_eq!(broker.pager().write(&mut buf, &[3u8; 100]), 100);
        broker.pager().route(buf);

        let oob = client.request_oob(1).unwrap();
        assert!(oob.is_out_of_band());
        assert_eq!(oob.page_count(), 1);
        assert!(broker.pager().release_buffer(oob));

        wait_until("delivery", || delivered.load(Ordering::SeqCst) == 100);
        stop.store(true, Ordering::Release);
    });
    broker.shutdown().unwrap();
}

#[test]
fn page_request_waits_for_free_pages() {
    let broker = Broker::start(config("request_wait")).unwrap();
    let hog = broker.pager().request(64 * 16).unwrap();
    let u = url("request_wait");
    let ep = broker.listen(&u).unwrap();
    let client = broker.connect(&u).unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| serve(&broker, &ep, &stop));
        let caller = s.spawn(|| client.request_page(64 * 4));

        wait_until("call deferred", || broker.status().pending_calls == 1);
        thread::sleep(Duration::from_millis(20));
        assert!(!caller.is_finished());

        assert!(broker.pager().release_buffer(hog));
        let buf = caller.join().unwrap().unwrap();
        assert_eq!(buf.page_count(), 4);
        assert_eq!(broker.status().pending_calls, 0);
        stop.store(true, Ordering::Release);
    });
    broker.shutdown().unwrap();
}

#[test]
fn accept_page_matches_posts_or_times_out() {
    let broker = Broker::start(config("accept")).unwrap();
    let u = url("accept");
    let ep = broker.listen(&u).unwrap();
    let client = broker.connect(&u).unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| serve(&broker, &ep, &stop));

        let start = Instant::now();
        assert!(client.accept_page(0x42, u32::MAX, Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));

        let buf = broker.pager().request(10).unwrap();
        let object = buf.object();
        broker.pager().post(buf, 0x42).unwrap();
        let got = client
            .accept_page(0x40, 0xF0, Duration::from_secs(5))
            .unwrap()
            .expect("posted buffer");
        assert_eq!(got.object(), object);
        assert_eq!(broker.status().pager.posted_buffers, 0);
        stop.store(true, Ordering::Release);
    });
    broker.shutdown().unwrap();
}

// ========== Closing ==========

#[test]
fn calls_fail_once_the_broker_is_closed() {
    let broker = Broker::start(config("closed")).unwrap();
    let u = url("closed");
    let ep = broker.listen(&u).unwrap();
    let client = broker.connect(&u).unwrap();

    broker.request_shutdown();
    wait_until("teardown", || broker.connect(&u).is_err());
    assert!(matches!(broker.listen(&url("closed_late")), Err(BrokerError::Closed)));

    let caller = thread::spawn(move || client.request_page(10));
    let h = ep.accept(5_000_000).expect("call");
    assert!(broker.dispatch(&ep, h));
    assert!(matches!(caller.join().unwrap(), Err(BrokerError::Closed)));

    drop(ep);
    broker.join().unwrap();
}
