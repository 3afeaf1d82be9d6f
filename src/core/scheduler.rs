//! Cancellable timer slots.
//!
//! A [`TimerSlot`] holds at most one armed deadline. Every arm hands out a
//! fresh [`TimerToken`]; a callback firing with an older token is ignored, and
//! a closed slot refuses to arm again. This is what makes teardown total even
//! when an external timer still fires later.

use super::clock::Millis;

/// Identifies one arming of a [`TimerSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(u64);

/// Single-deadline timer with generation tokens.
#[derive(Debug, Default)]
pub struct TimerSlot {
    armed: Option<(TimerToken, Millis)>,
    generation: u64,
    closed: bool,
}

impl TimerSlot {
    /// Create an idle slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot for `deadline`, replacing any armed deadline.
    ///
    /// Returns `None` once the slot is closed.
    pub fn arm(&mut self, deadline: Millis) -> Option<TimerToken> {
        if self.closed {
            return None;
        }
        self.generation += 1;
        let token = TimerToken(self.generation);
        self.armed = Some((token, deadline));
        Some(token)
    }

    /// Disarm. Returns the token that was cancelled, if any.
    pub fn cancel(&mut self) -> Option<TimerToken> {
        self.armed.take().map(|(token, _)| token)
    }

    /// Disarm and refuse every future `arm`.
    pub fn close(&mut self) {
        self.armed = None;
        self.closed = true;
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// The pending deadline, if any.
    pub fn deadline(&self) -> Option<Millis> {
        self.armed.map(|(_, deadline)| deadline)
    }

    /// The token of the pending deadline, if any.
    pub fn token(&self) -> Option<TimerToken> {
        self.armed.map(|(token, _)| token)
    }

    /// Disarm and return the token if the deadline has passed at `now`.
    pub fn take_expired(&mut self, now: Millis) -> Option<TimerToken> {
        match self.armed {
            Some((token, deadline)) if now >= deadline => {
                self.armed = None;
                Some(token)
            }
            _ => None,
        }
    }

    /// Consume a callback for `token`. True only if `token` is the live one.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        match self.armed {
            Some((live, _)) if live == token => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }
}
