// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ready/busy handshake between the scheduler loop and the threads it drives,
// plus the broker-wide quit signal.
//
// A handshake is two single-slot channels:
//   ready : loop -> peer, carries one unit of work
//   busy  : peer -> loop, signals that unit is finished
//
// Either side dropping its half disconnects the other, which is how a dead
// peer is detected.

use std::time::Duration;

use crossbeam_channel::{self as chan, RecvTimeoutError, TrySendError};
use parking_lot::{Condvar, Mutex};

/// Outcome of [`Handshake::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Sent,
    /// The previous unit has not been picked up yet.
    Pending,
    /// The peer is gone.
    Gone,
}

/// Outcome of [`Handshake::wait_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    TimedOut,
    Gone,
}

/// The peer hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gone;

/// Loop-side half.
pub struct Handshake<T> {
    ready: chan::Sender<T>,
    busy: chan::Receiver<()>,
}

/// Peer-side half.
pub struct HandshakePeer<T> {
    ready: chan::Receiver<T>,
    busy: chan::Sender<()>,
}

pub fn handshake<T>() -> (Handshake<T>, HandshakePeer<T>) {
    let (ready_tx, ready_rx) = chan::bounded(1);
    let (busy_tx, busy_rx) = chan::bounded(1);
    (
        Handshake { ready: ready_tx, busy: busy_rx },
        HandshakePeer { ready: ready_rx, busy: busy_tx },
    )
}

impl<T> Handshake<T> {
    /// Hand one unit of work to the peer without waiting.
    pub fn release(&self, item: T) -> Release {
        match self.ready.try_send(item) {
            Ok(()) => Release::Sent,
            Err(TrySendError::Full(_)) => Release::Pending,
            Err(TrySendError::Disconnected(_)) => Release::Gone,
        }
    }

    /// Block until the peer reports a finished unit.
    pub fn wait_done(&self, timeout: Duration) -> Completion {
        match self.busy.recv_timeout(timeout) {
            Ok(()) => Completion::Done,
            Err(RecvTimeoutError::Timeout) => Completion::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Completion::Gone,
        }
    }

    /// Consume any completion already reported. Returns `true` if there was one.
    pub fn take_done(&self) -> bool {
        self.busy.try_recv().is_ok()
    }
}

impl<T> HandshakePeer<T> {
    /// Wait for the next unit. `Ok(None)` on timeout.
    pub fn wait(&self, timeout: Duration) -> Result<Option<T>, Gone> {
        match self.ready.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Gone),
        }
    }

    /// Report the current unit finished. A completion the loop has not yet
    /// consumed absorbs this one.
    pub fn done(&self) {
        let _ = self.busy.try_send(());
    }
}

// ---------------------------------------------------------------------------
// Quit signal
// ---------------------------------------------------------------------------

/// A sticky flag that sleepers can wait on.
#[derive(Default)]
pub struct QuitSignal {
    quit: Mutex<bool>,
    cond: Condvar,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every sleeper. Returns `true` on the first call.
    pub fn trigger(&self) -> bool {
        let first = {
            let mut q = self.quit.lock();
            !std::mem::replace(&mut *q, true)
        };
        self.cond.notify_all();
        first
    }

    pub fn is_set(&self) -> bool {
        *self.quit.lock()
    }

    /// Sleep up to `timeout`. Returns `true` if the flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut q = self.quit.lock();
        if !*q {
            self.cond.wait_for(&mut q, timeout);
        }
        *q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn second_release_is_pending_until_taken() {
        let (loop_side, peer) = handshake::<u32>();
        assert_eq!(loop_side.release(1), Release::Sent);
        assert_eq!(loop_side.release(2), Release::Pending);
        assert_eq!(peer.wait(Duration::ZERO), Ok(Some(1)));
        assert_eq!(loop_side.release(3), Release::Sent);
    }

    #[test]
    fn dropping_peer_is_visible_to_loop() {
        let (loop_side, peer) = handshake::<()>();
        drop(peer);
        assert_eq!(loop_side.release(()), Release::Gone);
        assert_eq!(loop_side.wait_done(Duration::from_millis(5)), Completion::Gone);
    }

    #[test]
    fn round_trip_across_threads() {
        let (loop_side, peer) = handshake::<u64>();
        let t = thread::spawn(move || {
            let mut sum = 0;
            while let Ok(next) = peer.wait(Duration::from_millis(100)) {
                if let Some(v) = next {
                    sum += v;
                    peer.done();
                }
            }
            sum
        });
        for v in 1..=4 {
            assert_eq!(loop_side.release(v), Release::Sent);
            assert_eq!(loop_side.wait_done(Duration::from_secs(5)), Completion::Done);
        }
        drop(loop_side);
        assert_eq!(t.join().unwrap(), 10);
    }

    #[test]
    fn quit_signal_wakes_sleeper() {
        let q = std::sync::Arc::new(QuitSignal::new());
        let q2 = q.clone();
        let t = thread::spawn(move || q2.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        assert!(q.trigger());
        assert!(!q.trigger());
        assert!(t.join().unwrap());
    }
}
