// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Broker configuration.

use std::time::Duration;

use crate::error::{BrokerError, Result};

/// Where segment bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// `MAP_SHARED | MAP_ANONYMOUS`: this process and forked children only.
    Anonymous,
    /// POSIX shm objects named `<prefix>_<broker>_seg<N>`.
    Named { prefix: String },
}

/// Configuration for a [`Broker`](crate::Broker).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker name, used in segment names and log fields.
    pub name: String,
    pub backing: Backing,
    /// Bytes per page.
    pub page_size: usize,
    /// Pages carved from each segment.
    pub pages_per_segment: usize,
    /// Upper bound on segments; the first is acquired at startup.
    pub max_segments: usize,
    /// Ordinary pages the scheduler may schedule per cycle.
    pub pages_per_tick: usize,
    /// Scheduling is suppressed while `clock - minTick` exceeds this.
    pub lag_limit: u64,
    /// Scheduler wait when work is pending.
    pub min_sleep: Duration,
    /// Scheduler wait ceiling when idle.
    pub max_sleep: Duration,
    /// How often inbound peers are probed for liveness.
    pub pid_check_interval: Duration,
    /// Every Nth release of an outbound link carries a health test. 0 disables.
    pub health_test_every: u64,
    /// Maximum concurrently registered inbound links.
    pub inbound_high_water: usize,
    /// Poll interval of inbound link threads blocked in `accept`.
    pub accept_poll: Duration,
    /// Period of the status reporter.
    pub status_interval: Duration,
    /// Period of the monitor's supervision checks.
    pub monitor_interval: Duration,
    /// How long the scheduler waits for one auxiliary worker step.
    pub worker_step_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            backing: Backing::Anonymous,
            page_size: 4096,
            pages_per_segment: 256,
            max_segments: 4,
            pages_per_tick: 64,
            lag_limit: 64,
            min_sleep: Duration::from_micros(200),
            max_sleep: Duration::from_millis(20),
            pid_check_interval: Duration::from_millis(500),
            health_test_every: 0,
            inbound_high_water: 32,
            accept_poll: Duration::from_millis(20),
            status_interval: Duration::from_secs(5),
            monitor_interval: Duration::from_millis(100),
            worker_step_timeout: Duration::from_secs(1),
        }
    }

    /// Total page capacity once every segment has been added.
    pub fn max_pages(&self) -> usize {
        self.pages_per_segment.saturating_mul(self.max_segments)
    }

    /// Bytes mapped per segment.
    pub fn segment_bytes(&self) -> usize {
        self.page_size * self.pages_per_segment
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(BrokerError::InvalidConfig(msg.to_owned()));
        if self.name.is_empty() {
            return fail("name is empty");
        }
        if self.page_size == 0 {
            return fail("page_size is 0");
        }
        // Page descriptors record the bytes written as a u32.
        if self.page_size > u32::MAX as usize {
            return fail("page_size exceeds u32::MAX");
        }
        if self.pages_per_segment == 0 || self.pages_per_segment > u32::MAX as usize {
            return fail("pages_per_segment out of range");
        }
        if self.page_size.checked_mul(self.pages_per_segment).is_none() {
            return fail("segment size overflows");
        }
        if self.max_segments == 0 || self.max_segments > u16::MAX as usize {
            return fail("max_segments out of range");
        }
        if self.pages_per_tick == 0 {
            return fail("pages_per_tick is 0");
        }
        if self.min_sleep > self.max_sleep {
            return fail("min_sleep exceeds max_sleep");
        }
        if self.accept_poll.is_zero() {
            return fail("accept_poll is 0");
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("pagebroker")
    }
}
