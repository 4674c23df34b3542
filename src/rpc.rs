// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request/response surface for peers that talk to the broker by URL.
//
// A server binds an `Endpoint`, accepts calls as opaque handles, and hands
// each to `Broker::dispatch`. Status calls are answered at once. Page
// requests and accepts are queued for the auxiliary workers, which answer
// them from inside the scheduler cycle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as chan, RecvTimeoutError};
use parking_lot::Mutex;
use slab::Slab;

use crate::broker::{Broker, BrokerStatus};
use crate::error::{BrokerError, Result};
use crate::page::Buffer;
use crate::pager::Pager;

/// A call a client can make.
#[derive(Debug, Clone)]
pub enum Call {
    /// Pages for `len` bytes; answered when they are available.
    RequestPage { len: usize, out_of_band: bool },
    /// A posted buffer matching `tag` under `mask`, waiting up to `timeout`.
    AcceptPage { tag: u32, mask: u32, timeout: Duration },
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    RequestPage,
    AcceptPage,
    Status,
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Call::RequestPage { .. } => CallKind::RequestPage,
            Call::AcceptPage { .. } => CallKind::AcceptPage,
            Call::Status => CallKind::Status,
        }
    }
}

#[derive(Debug)]
pub enum Reply {
    Page(Buffer),
    /// `None` when the accept timed out.
    Accepted(Option<Buffer>),
    Status(BrokerStatus),
    Failed(BrokerError),
}

pub(crate) struct Envelope {
    pub call: Call,
    pub reply: chan::Sender<Reply>,
}

/// Opaque reference to an accepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle(usize);

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct Directory {
    bound: Mutex<HashMap<String, chan::Sender<Envelope>>>,
}

impl Directory {
    pub fn bind(self: &Arc<Self>, url: &str) -> Result<Endpoint> {
        let mut bound = self.bound.lock();
        if bound.contains_key(url) {
            return Err(BrokerError::EndpointInUse(url.to_owned()));
        }
        let (tx, rx) = chan::unbounded();
        bound.insert(url.to_owned(), tx);
        tracing::info!(url, "endpoint bound");
        Ok(Endpoint {
            url: url.to_owned(),
            incoming: rx,
            calls: Mutex::new(Slab::new()),
            directory: Arc::clone(self),
        })
    }

    pub fn connect(&self, url: &str) -> Result<Client> {
        let bound = self.bound.lock();
        let tx = bound
            .get(url)
            .ok_or_else(|| BrokerError::UnknownEndpoint(url.to_owned()))?;
        Ok(Client { url: url.to_owned(), outgoing: tx.clone() })
    }

    fn unbind(&self, url: &str) {
        self.bound.lock().remove(url);
    }

    /// Unbind everything; connected clients see `Disconnected` once their
    /// endpoint is gone.
    pub fn clear(&self) {
        self.bound.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// A bound URL. Unbinds on drop.
pub struct Endpoint {
    url: String,
    incoming: chan::Receiver<Envelope>,
    calls: Mutex<Slab<Envelope>>,
    directory: Arc<Directory>,
}

impl Endpoint {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait up to `timeout_micros` for the next call.
    pub fn accept(&self, timeout_micros: u64) -> Option<CallHandle> {
        let env = match self.incoming.recv_timeout(Duration::from_micros(timeout_micros)) {
            Ok(env) => env,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        };
        Some(CallHandle(self.calls.lock().insert(env)))
    }

    pub fn kind(&self, handle: CallHandle) -> Option<CallKind> {
        self.calls.lock().get(handle.0).map(|e| e.call.kind())
    }

    /// Accepted calls not yet dispatched.
    pub fn pending(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn take(&self, handle: CallHandle) -> Option<Envelope> {
        self.calls.lock().try_remove(handle.0)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.directory.unbind(&self.url);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("pending", &self.pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Client {
    url: String,
    outgoing: chan::Sender<Envelope>,
}

impl Client {
    /// Connect to an endpoint bound on `broker`.
    pub fn connect(broker: &Broker, url: &str) -> Result<Client> {
        broker.connect(url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a call and block for its reply.
    pub fn call(&self, call: Call) -> Result<Reply> {
        let (tx, rx) = chan::bounded(1);
        self.outgoing
            .send(Envelope { call, reply: tx })
            .map_err(|_| BrokerError::Disconnected)?;
        rx.recv().map_err(|_| BrokerError::Disconnected)
    }

    pub fn request_page(&self, len: usize) -> Result<Buffer> {
        match self.call(Call::RequestPage { len, out_of_band: false })? {
            Reply::Page(buf) => Ok(buf),
            Reply::Failed(e) => Err(e),
            _ => Err(BrokerError::Disconnected),
        }
    }

    pub fn request_oob(&self, len: usize) -> Result<Buffer> {
        match self.call(Call::RequestPage { len, out_of_band: true })? {
            Reply::Page(buf) => Ok(buf),
            Reply::Failed(e) => Err(e),
            _ => Err(BrokerError::Disconnected),
        }
    }

    pub fn accept_page(&self, tag: u32, mask: u32, timeout: Duration) -> Result<Option<Buffer>> {
        match self.call(Call::AcceptPage { tag, mask, timeout })? {
            Reply::Accepted(buf) => Ok(buf),
            Reply::Failed(e) => Err(e),
            _ => Err(BrokerError::Disconnected),
        }
    }

    pub fn status(&self) -> Result<BrokerStatus> {
        match self.call(Call::Status)? {
            Reply::Status(s) => Ok(s),
            Reply::Failed(e) => Err(e),
            _ => Err(BrokerError::Disconnected),
        }
    }
}

// ---------------------------------------------------------------------------
// Deferred calls
// ---------------------------------------------------------------------------

struct PendingPage {
    len: usize,
    out_of_band: bool,
    reply: chan::Sender<Reply>,
}

struct PendingAccept {
    tag: u32,
    mask: u32,
    deadline: Instant,
    reply: chan::Sender<Reply>,
}

/// Calls waiting on the pager, served by the auxiliary workers.
#[derive(Default)]
pub(crate) struct RpcQueues {
    pages: Mutex<VecDeque<PendingPage>>,
    accepts: Mutex<Vec<PendingAccept>>,
    closed: AtomicBool,
}

/// Hand a buffer to a caller, returning it to the pager if the caller left.
fn reply_buffer(pager: &Pager, to: &chan::Sender<Reply>, reply: Reply) {
    if let Err(chan::SendError(unsent)) = to.send(reply) {
        match unsent {
            Reply::Page(buf) | Reply::Accepted(Some(buf)) => {
                pager.release_buffer(buf);
            }
            _ => {}
        }
    }
}

impl RpcQueues {
    /// Queue a call for the workers. Fails it at once after [`close`].
    ///
    /// [`close`]: RpcQueues::close
    pub fn defer(&self, call: Call, reply: chan::Sender<Reply>) {
        let refuse = |reply: chan::Sender<Reply>| {
            let _ = reply.send(Reply::Failed(BrokerError::Closed));
        };
        match call {
            Call::RequestPage { len, out_of_band } => {
                let mut q = self.pages.lock();
                if self.closed.load(Ordering::SeqCst) {
                    return refuse(reply);
                }
                q.push_back(PendingPage { len, out_of_band, reply });
            }
            Call::AcceptPage { tag, mask, timeout } => {
                let mut q = self.accepts.lock();
                if self.closed.load(Ordering::SeqCst) {
                    return refuse(reply);
                }
                q.push(PendingAccept { tag, mask, deadline: Instant::now() + timeout, reply });
            }
            Call::Status => {}
        }
    }

    pub fn pending(&self) -> usize {
        self.pages.lock().len() + self.accepts.lock().len()
    }

    /// Grant page requests in arrival order until one cannot be met.
    pub fn serve_page_requests(&self, pager: &Pager) -> usize {
        let mut served = 0;
        let mut queue = self.pages.lock();
        while let Some(front) = queue.front() {
            let attempt = if front.out_of_band {
                pager.try_request_oob()
            } else {
                pager.try_request(front.len)
            };
            let reply = match attempt {
                Ok(Some(buf)) => Reply::Page(buf),
                Ok(None) => break,
                Err(e) => Reply::Failed(e),
            };
            if let Some(req) = queue.pop_front() {
                reply_buffer(pager, &req.reply, reply);
                served += 1;
            }
        }
        served
    }

    /// Answer accepts that have a matching post or whose deadline passed.
    pub fn serve_accepts(&self, pager: &Pager) -> usize {
        let now = Instant::now();
        let mut served = 0;
        self.accepts.lock().retain(|acc| {
            if let Some(buf) = pager.try_accept(acc.tag, acc.mask) {
                reply_buffer(pager, &acc.reply, Reply::Accepted(Some(buf)));
            } else if now >= acc.deadline {
                let _ = acc.reply.send(Reply::Accepted(None));
            } else {
                return true;
            }
            served += 1;
            false
        });
        served
    }

    /// Fail every deferred call and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for req in self.pages.lock().drain(..) {
            let _ = req.reply.send(Reply::Failed(BrokerError::Closed));
        }
        for acc in self.accepts.lock().drain(..) {
            let _ = acc.reply.send(Reply::Failed(BrokerError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_twice_is_refused() {
        let dir = Arc::new(Directory::default());
        let ep = dir.bind("pb://a").unwrap();
        assert!(matches!(dir.bind("pb://a"), Err(BrokerError::EndpointInUse(_))));
        drop(ep);
        assert!(dir.bind("pb://a").is_ok());
    }

    #[test]
    fn connect_to_unknown_url_fails() {
        let dir = Arc::new(Directory::default());
        assert!(matches!(dir.connect("pb://nowhere"), Err(BrokerError::UnknownEndpoint(_))));
    }

    #[test]
    fn accepted_calls_are_tracked_until_taken() {
        let dir = Arc::new(Directory::default());
        let ep = dir.bind("pb://calls").unwrap();
        let client = dir.connect("pb://calls").unwrap();
        let t = std::thread::spawn(move || client.call(Call::Status));

        let h = ep.accept(2_000_000).expect("call");
        assert_eq!(ep.kind(h), Some(CallKind::Status));
        assert_eq!(ep.pending(), 1);
        let env = ep.take(h).expect("envelope");
        assert!(ep.take(h).is_none());
        drop(env);
        assert!(matches!(t.join().unwrap(), Err(BrokerError::Disconnected)));
    }

    #[test]
    fn accept_times_out_without_calls() {
        let dir = Arc::new(Directory::default());
        let ep = dir.bind("pb://quiet").unwrap();
        assert!(ep.accept(1_000).is_none());
    }
}
