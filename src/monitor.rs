// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Supervision: the monitor thread watches the scheduler and the status
// reporter. A dead reporter is restarted. A dead scheduler is fatal: the
// broker is torn down and `Broker::join` reports it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::broker::{BrokerStatus, Shared};
use crate::error::{BrokerError, Result};

/// Called with every status report.
pub type StatusHook = Arc<dyn Fn(&BrokerStatus) + Send + Sync + 'static>;

pub(crate) fn spawn(
    shared: Arc<Shared>,
    scheduler: JoinHandle<()>,
    hook: Option<StatusHook>,
) -> Result<JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name("pb-monitor".into())
        .spawn(move || supervise(&shared, scheduler, hook))
        .map_err(|source| BrokerError::ThreadSpawn { role: "monitor", source })
}

fn supervise(shared: &Arc<Shared>, scheduler: JoinHandle<()>, hook: Option<StatusHook>) -> Result<()> {
    let interval = shared.config.monitor_interval;
    let mut reporter = start_reporter(shared, hook.clone());

    loop {
        let quitting = shared.quit.wait_timeout(interval);

        if quitting {
            if scheduler.join().is_err() {
                tracing::error!("scheduler panicked during shutdown");
            }
            stop_reporter(reporter);
            return Ok(());
        }

        // The scheduler only returns on its own once quit is set.
        if scheduler.is_finished() && !shared.quit.is_set() {
            let panicked = scheduler.join().is_err();
            tracing::error!(panicked, "scheduler thread died; shutting the broker down");
            shared.fatal.store(true, Ordering::Release);
            shared.quit.trigger();
            shared.teardown();
            stop_reporter(reporter);
            return Err(BrokerError::SchedulerDied);
        }

        if reporter.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(dead) = reporter.take() {
                let panicked = dead.join().is_err();
                tracing::warn!(panicked, "status reporter died; restarting");
            }
            shared.counters.status_restarts.fetch_add(1, Ordering::Relaxed);
            reporter = start_reporter(shared, hook.clone());
        }
    }
}

fn start_reporter(shared: &Arc<Shared>, hook: Option<StatusHook>) -> Option<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    match thread::Builder::new()
        .name("pb-status".into())
        .spawn(move || report(&shared, hook))
    {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::error!(error = %e, "cannot start status reporter");
            None
        }
    }
}

fn stop_reporter(reporter: Option<JoinHandle<()>>) {
    if let Some(t) = reporter {
        let _ = t.join();
    }
}

fn report(shared: &Shared, hook: Option<StatusHook>) {
    while !shared.quit.wait_timeout(shared.config.status_interval) {
        let s = shared.status();
        tracing::info!(
            clock = s.clock,
            min_tick = s.min_tick,
            free_pages = s.pager.free_pages,
            used_pages = s.pager.used_pages,
            segments = s.pager.segments,
            inbound = s.inbound_links,
            outbound = s.outbound_links,
            "status"
        );
        if let Some(h) = &hook {
            h(&s);
        }
    }
}
