// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Run a broker with synthetic producers and consumers.
//
// Usage:
//   pagebroker [--producers N] [--consumers N] [--payload BYTES] [--rate-ms MS]
//              [--oob-every N] [--duration-secs S] [--shm-prefix P] [--rpc-url URL]
//
// Producers alternate between routing buffers directly and posting them for
// the inbound link. Every consumer counts what it receives. Log verbosity is
// taken from RUST_LOG (default "info").

use std::io;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pagebroker::{pid, Backing, Broker, BrokerConfig, BufferView, Sink};

static STOP: AtomicBool = AtomicBool::new(false);

const POST_TAG: u32 = 0x5042;

#[derive(Parser, Debug)]
#[command(name = "pagebroker", about = "Shared-memory page broker")]
struct Args {
    /// Broker name (segment names derive from it).
    #[arg(long, default_value = "pagebroker")]
    name: String,
    /// Back segments with named POSIX shm objects under this prefix.
    #[arg(long)]
    shm_prefix: Option<String>,
    #[arg(long, default_value_t = 4096)]
    page_size: usize,
    #[arg(long, default_value_t = 256)]
    pages_per_segment: usize,
    #[arg(long, default_value_t = 4)]
    max_segments: usize,
    #[arg(long, default_value_t = 64)]
    pages_per_tick: usize,
    #[arg(long, default_value_t = 64)]
    lag_limit: u64,
    /// Seconds between status reports.
    #[arg(long, default_value_t = 5)]
    status_secs: u64,
    #[arg(long, default_value_t = 2)]
    producers: usize,
    #[arg(long, default_value_t = 2)]
    consumers: usize,
    /// Bytes per produced buffer.
    #[arg(long, default_value_t = 10_000)]
    payload: usize,
    /// Pause between buffers per producer.
    #[arg(long, default_value_t = 10)]
    rate_ms: u64,
    /// Make every Nth buffer out-of-band. 0 disables.
    #[arg(long, default_value_t = 16)]
    oob_every: u64,
    /// Stop after this many seconds. 0 runs until interrupted.
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,
    /// Serve RPC calls on this URL.
    #[arg(long)]
    rpc_url: Option<String>,
}

impl Args {
    fn config(&self) -> BrokerConfig {
        let mut cfg = BrokerConfig::new(&self.name);
        if let Some(prefix) = &self.shm_prefix {
            cfg.backing = Backing::Named { prefix: prefix.clone() };
        }
        cfg.page_size = self.page_size;
        cfg.pages_per_segment = self.pages_per_segment;
        cfg.max_segments = self.max_segments;
        cfg.pages_per_tick = self.pages_per_tick;
        cfg.lag_limit = self.lag_limit;
        cfg.status_interval = Duration::from_secs(self.status_secs.max(1));
        cfg
    }
}

#[derive(Clone, Default)]
struct Tally {
    buffers: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    oob: Arc<AtomicU64>,
}

struct CountingSink(Tally);

impl Sink for CountingSink {
    fn deliver(&mut self, buffer: &BufferView<'_>) -> io::Result<()> {
        self.0.buffers.fetch_add(1, Ordering::Relaxed);
        self.0.bytes.fetch_add(buffer.len() as u64, Ordering::Relaxed);
        if buffer.is_out_of_band() {
            self.0.oob.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

fn produce(broker: &Broker, id: usize, args: &Args) {
    let pager = broker.pager();
    let payload: Vec<u8> = (0..args.payload).map(|i| (i + id) as u8).collect();
    let mut seq: u64 = 0;
    while !STOP.load(Ordering::Acquire) {
        seq += 1;
        let oob = args.oob_every > 0 && seq % args.oob_every == 0;
        let next = if oob { pager.try_request_oob() } else { pager.try_request(payload.len()) };
        match next {
            Ok(Some(mut buf)) => {
                pager.write(&mut buf, &payload);
                if seq % 2 == 0 {
                    if let Err(e) = broker.post(buf, POST_TAG) {
                        tracing::debug!(producer = id, error = %e, "post failed");
                    }
                } else {
                    pager.route(buf);
                }
            }
            Ok(None) => tracing::trace!(producer = id, "pool exhausted; backing off"),
            Err(e) => {
                tracing::debug!(producer = id, error = %e, "producer stopping");
                return;
            }
        }
        thread::sleep(Duration::from_millis(args.rate_ms));
    }
}

fn serve(broker: &Broker, url: &str) {
    let endpoint = match broker.listen(url) {
        Ok(ep) => ep,
        Err(e) => {
            tracing::error!(url, error = %e, "cannot bind rpc endpoint");
            return;
        }
    };
    while !STOP.load(Ordering::Acquire) && broker.is_running() {
        if let Some(call) = endpoint.accept(100_000) {
            broker.dispatch(&endpoint, call);
        }
    }
}

fn run(args: &Args) -> pagebroker::Result<()> {
    let broker = Broker::start(args.config())?;
    let me = pid::current_pid();

    let tallies: Vec<Tally> = (0..args.consumers).map(|_| Tally::default()).collect();
    for t in &tallies {
        broker.schedule_outbound(me, CountingSink(t.clone()))?;
    }
    broker.schedule_inbound(me, POST_TAG, u32::MAX)?;

    let deadline = (args.duration_secs > 0).then(|| Instant::now() + Duration::from_secs(args.duration_secs));
    thread::scope(|s| {
        for id in 0..args.producers {
            let broker = &broker;
            s.spawn(move || produce(broker, id, args));
        }
        if let Some(url) = &args.rpc_url {
            let broker = &broker;
            s.spawn(move || serve(broker, url));
        }
        while !STOP.load(Ordering::Acquire)
            && broker.is_running()
            && deadline.map_or(true, |d| Instant::now() < d)
        {
            thread::sleep(Duration::from_millis(100));
        }
        STOP.store(true, Ordering::Release);
    });

    for (i, t) in tallies.iter().enumerate() {
        tracing::info!(
            consumer = i,
            buffers = t.buffers.load(Ordering::Relaxed),
            bytes = t.bytes.load(Ordering::Relaxed),
            oob = t.oob.load(Ordering::Relaxed),
            "consumer totals"
        );
    }
    let status = broker.status();
    tracing::info!(
        clock = status.clock,
        scheduled = status.scheduled_buffers,
        reclaimed = status.reclaimed_pages,
        free_pages = status.pager.free_pages,
        "final status"
    );

    if broker.is_fatal() {
        return broker.join();
    }
    broker.shutdown()
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
    install_stop_handler();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pagebroker failed");
            ExitCode::FAILURE
        }
    }
}

// SIGINT / SIGTERM / SIGHUP set STOP.
fn install_stop_handler() {
    extern "C" fn handler(_: libc::c_int) {
        STOP.store(true, Ordering::Release);
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handler as *const () as libc::sighandler_t);
    }
}
