// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A shared-memory buffer broker. Producers fill page-granular buffers in
// POSIX shared memory and route them; a scheduler thread hands complete
// buffers to every registered consumer at a global tick and reclaims the
// pages once all consumers are past that tick.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod error;
pub use error::{BrokerError, Result};

mod config;
pub use config::{Backing, BrokerConfig};

mod page;
pub use page::{Buffer, ObjectId, Page, PageFlags, PageId};

mod segment;

mod pager;
pub use pager::{Pager, PagerStats, PinnedPages, UsedListFreeze};

pub mod handshake;

pub mod pid;

mod link;
pub use link::{BufferView, Direction, LinkId, LinkInfo, LinkState, Sink};

mod scheduler;

mod workers;
pub use workers::WorkerKind;

mod monitor;
pub use monitor::StatusHook;

mod rpc;
pub use rpc::{Call, CallHandle, CallKind, Client, Endpoint, Reply};

mod broker;
pub use broker::{Broker, BrokerStatus};
