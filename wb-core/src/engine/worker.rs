//! Serialized control worker
//!
//! All controller state transitions happen on one task that drains the
//! command queue. Public entry points only enqueue; timers and the reset
//! notifier post back into the same queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use wb_error::Result;
use wb_protocol::ThresholdUpdate;

use super::auto::{AutoController, AutoState, Decision, Thresholds};
use super::boost::UserBoostTimer;
use super::sampler::TrafficSampler;
use super::timer::TimerKind;
use super::toggle::{HardwareToggle, WbState};
use super::votes::{ReasonId, VoteRegister};
use crate::device::BlockDevice;

pub(crate) enum Command {
    SetVote {
        reason: ReasonId,
        active: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Boost {
        duration: Duration,
        reply: Option<oneshot::Sender<Result<Duration>>>,
    },
    Evaluate {
        reply: Option<oneshot::Sender<Result<AutoState>>>,
    },
    SetThresholds {
        thresholds: Thresholds,
        reply: oneshot::Sender<()>,
    },
    UpdateThresholds {
        update: ThresholdUpdate,
        reply: oneshot::Sender<Result<Thresholds>>,
    },
    Timer(TimerKind, u64),
    Reset,
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// State readable from any thread without going through the queue
pub(crate) struct Shared {
    pub votes: VoteRegister,
    pub thresholds: RwLock<Thresholds>,
    pub auto_state: RwLock<AutoState>,
    pub boost_expiry: RwLock<Option<Instant>>,
    /// Set while an unsolicited evaluation is queued
    pub eval_pending: AtomicBool,
}

impl Shared {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            votes: VoteRegister::new(),
            thresholds: RwLock::new(thresholds),
            auto_state: RwLock::new(AutoState::Idle),
            boost_expiry: RwLock::new(None),
            eval_pending: AtomicBool::new(false),
        }
    }
}

pub(crate) struct ControlWorker<D: BlockDevice> {
    shared: Arc<Shared>,
    toggle: HardwareToggle<D>,
    sampler: TrafficSampler<D>,
    auto: AutoController,
    boost: UserBoostTimer,
    tx: WeakUnboundedSender<Command>,
}

impl<D: BlockDevice> ControlWorker<D> {
    pub fn new(
        shared: Arc<Shared>,
        toggle: HardwareToggle<D>,
        sampler: TrafficSampler<D>,
        sample_interval: Duration,
        tx: WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            shared,
            toggle,
            sampler,
            auto: AutoController::new(sample_interval),
            boost: UserBoostTimer::new(),
            tx,
        }
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        debug!("Control worker started");
        while let Some(cmd) = rx.recv().await {
            if let Command::Shutdown { reply } = cmd {
                self.teardown().await;
                let _ = reply.send(());
                return;
            }
            self.handle(cmd).await;
            self.publish();
        }
        // Every controller handle is gone
        self.teardown().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::SetVote { reason, active, reply } => {
                let result = self.set_vote(reason, active).await;
                self.publish();
                respond(reply, result, "vote");
            }
            Command::Boost { duration, reply } => {
                let result = self.boost(duration).await;
                self.publish();
                respond(reply, result, "boost");
            }
            Command::Evaluate { reply } => {
                if reply.is_none() {
                    self.shared.eval_pending.store(false, Ordering::Release);
                }
                let result = self.evaluate().await;
                self.publish();
                respond(reply, result, "evaluation");
            }
            Command::SetThresholds { thresholds, reply } => {
                *self.shared.thresholds.write() = thresholds;
                info!(?thresholds, "Thresholds updated");
                let _ = reply.send(());
            }
            Command::UpdateThresholds { update, reply } => {
                let _ = reply.send(self.update_thresholds(&update));
            }
            Command::Timer(kind, generation) => self.on_timer(kind, generation).await,
            Command::Reset => {
                info!("Device reset, reapplying write booster state");
                self.toggle.resync();
                if let Err(e) = self.reconcile().await {
                    error!("Failed to restore write booster after reset: {}", e);
                }
            }
            Command::Flush { reply } => {
                let _ = reply.send(());
            }
            // Consumed by the run loop
            Command::Shutdown { .. } => {}
        }
    }

    fn update_thresholds(&self, update: &ThresholdUpdate) -> Result<Thresholds> {
        let current = *self.shared.thresholds.read();
        let merged: Thresholds = update.apply_to(current.into()).into();
        merged.validate()?;
        *self.shared.thresholds.write() = merged;
        info!(thresholds = ?merged, "Thresholds updated");
        Ok(merged)
    }

    async fn set_vote(&mut self, reason: ReasonId, active: bool) -> Result<()> {
        if self.shared.votes.set(reason, active) {
            debug!(%reason, active, "Vote changed");
        }
        if reason == ReasonId::User && !active {
            self.boost.cancel();
        }
        self.reconcile().await
    }

    async fn boost(&mut self, requested: Duration) -> Result<Duration> {
        let duration = UserBoostTimer::clamp(requested);
        self.shared.votes.set(ReasonId::User, true);
        if self.boost.extend(Instant::now(), duration, &self.tx) {
            debug!(duration_ms = duration.as_millis() as u64, "Boost window extended");
        }
        self.reconcile().await?;
        Ok(duration)
    }

    async fn evaluate(&mut self) -> Result<AutoState> {
        let sample = match self.sampler.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                self.auto.sample_failed(&self.tx);
                return Err(e);
            }
        };
        let thresholds = *self.shared.thresholds.read();
        if self.auto.observe(&sample, &thresholds, &self.tx) != Decision::Hold {
            debug!(state = %self.auto.state(), "Auto state changed");
        }
        // Also retries a toggle that failed on an earlier event
        self.reconcile().await?;
        Ok(self.auto.state())
    }

    async fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        match kind {
            TimerKind::DeferredOff => {
                if !self.auto.fire_deferred_off(generation) {
                    return;
                }
                debug!("Deferred off expired");
                if let Err(e) = self.reconcile().await {
                    error!("Deferred off failed: {}", e);
                }
            }
            TimerKind::BoostExpiry => {
                if !self.boost.fire(generation) {
                    return;
                }
                debug!("Boost window expired");
                self.shared.votes.set(ReasonId::User, false);
                if let Err(e) = self.reconcile().await {
                    error!("Failed to end boost: {}", e);
                }
            }
            TimerKind::Resample => {
                if !self.auto.fire_resample(generation) {
                    return;
                }
                if let Err(e) = self.evaluate().await {
                    warn!("Periodic evaluation failed: {}", e);
                }
            }
        }
    }

    /// Target state from votes and the auto controller. While a deferred off
    /// is pending the hardware keeps whatever it currently has.
    fn desired(&self) -> WbState {
        if self.shared.votes.explicit_demand() || self.auto.state().is_active() {
            WbState::On
        } else if self.auto.deferred_off_pending() {
            self.toggle.last_applied()
        } else {
            WbState::Off
        }
    }

    async fn reconcile(&mut self) -> Result<()> {
        let target = self.desired();
        self.toggle.apply(target).await.map(|_| ())
    }

    fn publish(&self) {
        *self.shared.auto_state.write() = self.auto.state();
        *self.shared.boost_expiry.write() = self.boost.expiry();
    }

    async fn teardown(&mut self) {
        self.auto.stop();
        self.boost.cancel();
        self.shared.votes.clear_all();
        self.publish();
        if let Err(e) = self.toggle.apply(WbState::Off).await {
            error!("Failed to switch write booster off on shutdown: {}", e);
        }
        info!("Control worker stopped");
    }
}

fn respond<T>(reply: Option<oneshot::Sender<Result<T>>>, result: Result<T>, what: &str) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                error!("Asynchronous {} failed: {}", what, e);
            }
        }
    }
}
