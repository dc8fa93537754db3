//! Render-tick coalescing for one session.
//!
//! Non-forced updates merge into a pending buffer and arm a single deadline
//! one tick out. The owning actor sleeps until that deadline and then takes
//! the buffer. A forced update disarms the deadline and returns the merged
//! buffer immediately. While held, non-forced updates only accumulate.

use std::time::Duration;

use parley_protocol::MessagePatch;
use tokio::time::Instant;

#[derive(Debug)]
pub struct UpdateScheduler {
    tick: Duration,
    pending: Option<MessagePatch>,
    deadline: Option<Instant>,
    held: bool,
}

impl UpdateScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            pending: None,
            deadline: None,
            held: false,
        }
    }

    /// Merge `patch` into the buffer. Returns the patch to apply now, which
    /// is only ever `Some` for forced updates.
    pub fn schedule(
        &mut self,
        patch: MessagePatch,
        force: bool,
        now: Instant,
    ) -> Option<MessagePatch> {
        match self.pending.as_mut() {
            Some(pending) => pending.merge(patch),
            None if patch.is_empty() && !force => return None,
            None => self.pending = Some(patch),
        }

        if force {
            return self.take();
        }
        if self.deadline.is_none() && !self.held {
            self.deadline = Some(now + self.tick);
        }
        None
    }

    /// Hold or release non-forced updates. Holding disarms the deadline;
    /// releasing re-arms it when something is buffered.
    pub fn set_held(&mut self, held: bool, now: Instant) {
        if self.held == held {
            return;
        }
        self.held = held;
        if held {
            self.deadline = None;
        } else if self.pending.is_some() {
            self.deadline = Some(now + self.tick);
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// When the next flush is due, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the buffer if its deadline has passed.
    pub fn poll_due(&mut self, now: Instant) -> Option<MessagePatch> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.take(),
            _ => None,
        }
    }

    /// Disarm the deadline and hand back whatever is buffered.
    pub fn take(&mut self) -> Option<MessagePatch> {
        self.deadline = None;
        self.pending.take().filter(|patch| !patch.is_empty())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
