//! Delayed messages for the dispatch loop
//!
//! A timer is a sleeping task that posts a `Timer` message back into the
//! engine inbox. Each slot stamps its timers with a generation so a timer that
//! was already queued when it got cancelled or replaced is recognised as
//! stale and ignored.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::message::Message;
use crate::ble::transport::ScanKind;
use crate::central::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionTimer {
    ConnectionTimeout,
    CancelConfirm,
    BondLossDisconnect,
    BondLostSettle,
    Rediscover,
    CommandSettle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanTimer {
    /// The scan has run for a full period; stop it.
    Restart,
    /// The pause after stopping is over; start it again.
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Session(SessionKey, SessionTimer),
    Scan(ScanKind, ScanTimer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timer {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Pending timers never keep the engine alive on their own.
#[derive(Clone)]
pub(crate) struct Timers {
    inbox: mpsc::WeakUnboundedSender<Message>,
}

impl Timers {
    pub fn new(inbox: mpsc::WeakUnboundedSender<Message>) -> Self {
        Self { inbox }
    }

    fn schedule(&self, delay: Duration, timer: Timer) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The engine may already be gone.
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Message::Timer(timer));
            }
        })
    }
}

/// One timer purpose; arming replaces whatever was pending.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    pub fn arm(&mut self, timers: &Timers, delay: Duration, kind: TimerKind) {
        self.cancel();
        self.generation += 1;
        let timer = Timer { kind, generation: self.generation };
        self.handle = Some(timers.schedule(delay, timer));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Consume a fired timer. Returns false for stale timers.
    pub fn fire(&mut self, timer: &Timer) -> bool {
        if self.handle.is_some() && timer.generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
