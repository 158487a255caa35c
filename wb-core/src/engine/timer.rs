//! Cancellable one-shot timers
//!
//! A [`DelayedAction`] posts `Command::Timer(kind, generation)` back into the
//! controller queue when it expires. Every `schedule_at` and `cancel` bumps the
//! generation, so an expiry that was already queued when it got cancelled is
//! recognised as stale by [`DelayedAction::fire`] and dropped.

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::worker::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    DeferredOff,
    BoostExpiry,
    Resample,
}

#[derive(Debug)]
pub(crate) struct DelayedAction {
    kind: TimerKind,
    generation: u64,
    deadline: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl DelayedAction {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            deadline: None,
            handle: None,
        }
    }

    /// Arm the timer, replacing any pending expiry
    pub fn schedule_at(&mut self, deadline: Instant, tx: &WeakUnboundedSender<Command>) {
        self.cancel();

        // Controller is being torn down
        if tx.upgrade().is_none() {
            return;
        }

        // Weak across the sleep; a pending timer must not keep the queue open
        let tx = tx.clone();
        let kind = self.kind;
        let generation = self.generation;
        self.deadline = Some(deadline);
        self.handle = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Timer(kind, generation));
            }
        }));
    }

    /// Disarm the timer. Returns true if an expiry was pending.
    pub fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.deadline.take().is_some()
    }

    /// Consume an expiry message. Returns false for stale or duplicate ones.
    pub fn fire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.deadline.is_none() {
            return false;
        }
        self.deadline = None;
        self.handle = None;
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }
}

impl Drop for DelayedAction {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn expect_timer(cmd: Option<Command>) -> (TimerKind, u64) {
        match cmd {
            Some(Command::Timer(kind, generation)) => (kind, generation),
            _ => panic!("expected timer expiry"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DelayedAction::new(TimerKind::DeferredOff);

        timer.schedule_at(Instant::now() + Duration::from_millis(50), &tx.downgrade());
        assert!(timer.is_pending());

        let (kind, generation) = expect_timer(rx.recv().await);
        assert_eq!(kind, TimerKind::DeferredOff);
        assert!(timer.fire(generation));
        assert!(!timer.fire(generation));
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_makes_old_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DelayedAction::new(TimerKind::BoostExpiry);

        timer.schedule_at(Instant::now() + Duration::from_millis(10), &tx.downgrade());
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Expiry is queued but not consumed yet
        timer.schedule_at(Instant::now() + Duration::from_millis(100), &tx.downgrade());

        let (_, stale) = expect_timer(rx.recv().await);
        assert!(!timer.fire(stale));
        assert!(timer.is_pending());

        let (_, current) = expect_timer(rx.recv().await);
        assert!(timer.fire(current));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DelayedAction::new(TimerKind::Resample);

        timer.schedule_at(Instant::now() + Duration::from_millis(10), &tx.downgrade());
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_timer_does_not_hold_queue_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DelayedAction::new(TimerKind::DeferredOff);

        timer.schedule_at(Instant::now() + Duration::from_secs(60), &tx.downgrade());
        drop(tx);

        // Closed right away, not after the sleep
        assert!(rx.recv().await.is_none());
        assert!(timer.is_pending());
    }
}
