//! Public controller handle

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use wb_error::{Result, WbError};
use wb_protocol::{StatusInfo, ThresholdUpdate};

use super::auto::{AutoState, Thresholds};
use super::sampler::TrafficSampler;
use super::toggle::{HardwareToggle, WbState};
use super::votes::ReasonId;
use super::worker::{Command, ControlWorker, Shared};
use crate::constants::{auto as auto_const, DEFAULT_SAMPLE_INTERVAL};
use crate::device::{BlockDevice, StateObserver};

/// Startup parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub thresholds: Thresholds,
    pub sample_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        let ms = self.sample_interval.as_millis();
        let allowed = u128::from(auto_const::MIN_SAMPLE_INTERVAL_MS)
            ..=u128::from(auto_const::MAX_SAMPLE_INTERVAL_MS);
        if !allowed.contains(&ms) {
            return Err(WbError::InvalidConfig {
                field: "sample_interval_ms".into(),
                reason: format!(
                    "must be between {} and {}",
                    auto_const::MIN_SAMPLE_INTERVAL_MS,
                    auto_const::MAX_SAMPLE_INTERVAL_MS
                ),
            });
        }
        Ok(())
    }
}

/// Snapshot of controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub wb_state: WbState,
    pub auto_state: AutoState,
    pub active_votes: Vec<ReasonId>,
    pub boost_remaining: Option<Duration>,
    pub thresholds: Thresholds,
}

impl From<ControllerStatus> for StatusInfo {
    fn from(status: ControllerStatus) -> Self {
        Self {
            wb_state: status.wb_state.to_string(),
            auto_state: status.auto_state.to_string(),
            active_votes: status
                .active_votes
                .iter()
                .map(|r| r.to_string())
                .collect(),
            boost_remaining_ms: status.boost_remaining.map(|d| d.as_millis() as u64),
            thresholds: status.thresholds.into(),
        }
    }
}

/// Callback handed to the device so it can report a reset
#[derive(Clone, Debug)]
pub struct ResetNotifier {
    tx: WeakUnboundedSender<Command>,
}

impl ResetNotifier {
    /// Ask the controller to reapply its state. Safe from any thread.
    pub fn notify(&self) {
        match self.tx.upgrade() {
            Some(tx) => {
                let _ = tx.send(Command::Reset);
            }
            None => debug!("Reset reported after controller stopped"),
        }
    }
}

/// Handle to a running controller
///
/// Cloning is cheap. The controller stops when [`Controller::shutdown`] is
/// called or the last handle is dropped; either way the write booster is left
/// off.
#[derive(Clone)]
pub struct Controller {
    tx: UnboundedSender<Command>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<WbState>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Controller {
    /// Start the worker on the current tokio runtime
    pub fn spawn<D: BlockDevice>(device: Arc<D>, config: ControllerConfig) -> Result<Self> {
        Self::spawn_inner(device, config, None)
    }

    /// Like [`Controller::spawn`], reporting every hardware switch to `observer`
    pub fn spawn_with_observer<D: BlockDevice>(
        device: Arc<D>,
        config: ControllerConfig,
        observer: Arc<dyn StateObserver>,
    ) -> Result<Self> {
        Self::spawn_inner(device, config, Some(observer))
    }

    fn spawn_inner<D: BlockDevice>(
        device: Arc<D>,
        config: ControllerConfig,
        observer: Option<Arc<dyn StateObserver>>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WbState::Off);
        let shared = Arc::new(Shared::new(config.thresholds));

        device.register_reset_notifier(ResetNotifier { tx: tx.downgrade() });

        let worker = ControlWorker::new(
            Arc::clone(&shared),
            HardwareToggle::new(Arc::clone(&device), state_tx, observer),
            TrafficSampler::new(Arc::clone(&device)),
            config.sample_interval,
            tx.downgrade(),
        );
        let handle = tokio::spawn(worker.run(rx));

        info!(
            device = %device.name(),
            on_slots = config.thresholds.on_slots,
            off_slots = config.thresholds.off_slots,
            off_delay_ms = config.thresholds.off_delay_ms,
            "Write booster controller started"
        );

        Ok(Self {
            tx,
            shared,
            state_rx,
            worker: Arc::new(Mutex::new(Some(handle))),
        })
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| WbError::ControllerStopped)
    }

    async fn call<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(cmd(reply_tx))?;
        reply_rx.await.map_err(|_| WbError::ControllerStopped)
    }

    /// Set or clear a vote and wait until the hardware reflects it
    pub async fn set_vote(&self, reason: ReasonId, active: bool) -> Result<()> {
        self.call(|reply| Command::SetVote {
            reason,
            active,
            reply: Some(reply),
        })
        .await?
    }

    /// Set or clear a vote without waiting
    pub fn set_vote_nowait(&self, reason: ReasonId, active: bool) -> Result<()> {
        self.send(Command::SetVote {
            reason,
            active,
            reply: None,
        })
    }

    /// Hold WB on for `duration`, clamped to the allowed boost window.
    /// Returns the effective duration.
    pub async fn request_boost(&self, duration: Duration) -> Result<Duration> {
        self.call(|reply| Command::Boost {
            duration,
            reply: Some(reply),
        })
        .await?
    }

    pub fn request_boost_nowait(&self, duration: Duration) -> Result<()> {
        self.send(Command::Boost {
            duration,
            reply: None,
        })
    }

    /// Hint from the I/O path that traffic may have changed.
    ///
    /// Never blocks. Pokes arriving while an evaluation is already queued are
    /// coalesced into it. Returns true if a new evaluation was queued.
    pub fn poke(&self) -> bool {
        if self.shared.eval_pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.send(Command::Evaluate { reply: None }).is_err() {
            self.shared.eval_pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Sample now and wait for the resulting auto state
    pub async fn evaluate(&self) -> Result<AutoState> {
        self.call(|reply| Command::Evaluate { reply: Some(reply) })
            .await?
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.shared.thresholds.read()
    }

    /// Replace the thresholds. Takes effect from the next sample.
    pub async fn set_thresholds(&self, thresholds: Thresholds) -> Result<()> {
        thresholds.validate()?;
        self.call(|reply| Command::SetThresholds { thresholds, reply })
            .await
    }

    /// Overlay a partial update on the current thresholds. The merge runs in
    /// the worker, serialized with every other threshold write. Returns the
    /// thresholds now in force.
    pub async fn update_thresholds(&self, update: ThresholdUpdate) -> Result<Thresholds> {
        self.call(|reply| Command::UpdateThresholds { update, reply })
            .await?
    }

    /// Callback for the device's reset path
    pub fn reset_notifier(&self) -> ResetNotifier {
        ResetNotifier {
            tx: self.tx.downgrade(),
        }
    }

    /// Report a device reset
    pub fn notify_reset(&self) -> Result<()> {
        self.send(Command::Reset)
    }

    /// Wait until every command queued before this call has been handled
    pub async fn flush(&self) -> Result<()> {
        self.call(|reply| Command::Flush { reply }).await
    }

    /// Last state applied to the hardware
    pub fn wb_state(&self) -> WbState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WbState> {
        self.state_rx.clone()
    }

    pub fn auto_state(&self) -> AutoState {
        *self.shared.auto_state.read()
    }

    pub fn is_vote_active(&self, reason: ReasonId) -> bool {
        self.shared.votes.is_active(reason)
    }

    pub fn status(&self) -> ControllerStatus {
        let boost_remaining = self
            .shared
            .boost_expiry
            .read()
            .map(|expiry| expiry.saturating_duration_since(Instant::now()));
        ControllerStatus {
            wb_state: self.wb_state(),
            auto_state: self.auto_state(),
            active_votes: self.shared.votes.active_reasons(),
            boost_remaining,
            thresholds: self.thresholds(),
        }
    }

    /// Stop the worker, cancel every timer and force WB off.
    ///
    /// Idempotent. Later calls on any clone fail with `ControllerStopped`.
    pub async fn shutdown(&self) -> Result<()> {
        // Ignore the reply error: the worker may already be gone
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| WbError::generic(format!("control worker failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockBlockDevice;
    use mockall::predicate::eq;

    fn mock_device() -> MockBlockDevice {
        let mut device = MockBlockDevice::new();
        device.expect_name().return_const("ufs0".to_string());
        device
            .expect_register_reset_notifier()
            .times(1)
            .return_const(());
        device
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_hardware_call_per_transition() {
        let mut device = mock_device();
        device
            .expect_set_write_booster()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));
        device
            .expect_set_write_booster()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        let controller = Controller::spawn(Arc::new(device), ControllerConfig::default()).unwrap();
        for reason in ReasonId::ALL {
            controller.set_vote(reason, true).await.unwrap();
        }
        for reason in ReasonId::ALL {
            controller.set_vote(reason, false).await.unwrap();
        }
        controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_stopped_controller() {
        let mut device = mock_device();
        device.expect_set_write_booster().never();

        let controller = Controller::spawn(Arc::new(device), ControllerConfig::default()).unwrap();
        controller.shutdown().await.unwrap();

        assert!(matches!(controller.flush().await, Err(WbError::ControllerStopped)));
        assert!(matches!(
            controller.request_boost(Duration::from_millis(500)).await,
            Err(WbError::ControllerStopped)
        ));
        assert!(controller.notify_reset().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        config.sample_interval = Duration::from_secs(120);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_sample_interval_rejected() {
        // 2^61 + 1 seconds wraps into the allowed range when cut to 64 bits
        let config = ControllerConfig {
            sample_interval: Duration::from_secs((1 << 61) + 1),
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WbError::InvalidConfig { .. })
        ));
    }
}
