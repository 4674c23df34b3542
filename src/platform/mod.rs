// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

#[cfg(not(unix))]
compile_error!("pagebroker needs POSIX shared memory and kill(2); only unix targets are supported");

#[cfg(unix)]
pub use posix::{current_pid, pid_alive, PlatformShm};
