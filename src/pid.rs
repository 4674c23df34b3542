// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process liveness probes.

use std::collections::HashMap;

pub use crate::platform::{current_pid, pid_alive};

/// Memoizes [`pid_alive`] for the duration of one sweep so each distinct
/// pid costs one `kill(pid, 0)`.
#[derive(Debug, Default)]
pub struct PidSweep {
    seen: HashMap<i32, bool>,
}

impl PidSweep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alive(&mut self, pid: i32) -> bool {
        *self.seen.entry(pid).or_insert_with(|| pid_alive(pid))
    }

    /// Pids found dead so far.
    pub fn dead(&self) -> impl Iterator<Item = i32> + '_ {
        self.seen.iter().filter(|(_, live)| !**live).map(|(pid, _)| *pid)
    }
}
