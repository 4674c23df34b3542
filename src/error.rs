// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Broker error taxonomy.

use std::io;

use thiserror::Error;

/// Result alias used across the broker.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by the broker.
///
/// Running out of pages is not an error: `request` blocks and
/// `try_request` returns `Ok(None)`. Misuse such as releasing a pinned page
/// or halting an unknown link is reported through `bool` returns instead.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The OS refused a segment's backing store. Fatal at startup.
    #[error("cannot acquire segment {name}: {source}")]
    SegmentAcquire {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A broker thread could not be spawned. Fatal at startup.
    #[error("cannot spawn {role} thread: {source}")]
    ThreadSpawn {
        role: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// More pages than the pager can ever hold.
    #[error("request for {pages} pages exceeds capacity of {capacity}")]
    TooLarge { pages: usize, capacity: usize },

    /// The broker is shutting down.
    #[error("broker is closed")]
    Closed,

    /// Inbound registrations are at the high water mark.
    #[error("inbound water mark reached ({0} links)")]
    WaterMark(usize),

    #[error("no endpoint listening on {0}")]
    UnknownEndpoint(String),

    #[error("endpoint {0} is already bound")]
    EndpointInUse(String),

    /// The peer of a request/response exchange went away.
    #[error("peer disconnected")]
    Disconnected,

    /// The page-manager thread died; the broker has been torn down.
    #[error("scheduler thread died")]
    SchedulerDied,
}
