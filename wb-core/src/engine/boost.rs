//! Time-bounded user boost

use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::time::Instant;

use super::timer::{DelayedAction, TimerKind};
use super::worker::Command;
use crate::constants::boost as boost_const;

/// Owns the expiry of the `User` vote
pub(crate) struct UserBoostTimer {
    expiry: DelayedAction,
}

impl UserBoostTimer {
    pub fn new() -> Self {
        Self {
            expiry: DelayedAction::new(TimerKind::BoostExpiry),
        }
    }

    pub fn clamp(duration: Duration) -> Duration {
        duration.clamp(boost_const::MIN_DURATION, boost_const::MAX_DURATION)
    }

    /// Extend the window to `now + duration` unless it already ends later.
    /// Returns true if the expiry moved.
    pub fn extend(
        &mut self,
        now: Instant,
        duration: Duration,
        tx: &WeakUnboundedSender<Command>,
    ) -> bool {
        let candidate = now + duration;
        match self.expiry.deadline() {
            Some(current) if current >= candidate => false,
            _ => {
                self.expiry.schedule_at(candidate, tx);
                true
            }
        }
    }

    pub fn fire(&mut self, generation: u64) -> bool {
        self.expiry.fire(generation)
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry.deadline()
    }

    pub fn cancel(&mut self) {
        self.expiry.cancel();
    }
}
