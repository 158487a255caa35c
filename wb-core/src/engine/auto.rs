//! Traffic-adaptive controller
//!
//! A two-state hysteresis machine driven by [`TrafficSample`]s.
//!
//! # How It Works
//!
//! 1. **Activation**: while Idle, a sample that reaches *any* on-threshold
//!    moves the controller to Active. A pending deferred off is cancelled.
//!
//! 2. **Release**: while Active, a sample below *all* off-thresholds moves the
//!    controller back to Idle and arms the deferred off. Samples in the band
//!    between the two sets of thresholds change nothing.
//!
//! 3. **Debounce**: the hardware is only switched off once the deferred off
//!    expires. A new activation inside that window cancels it, so a short lull
//!    in a busy burst never toggles the device.
//!
//! 4. **Re-sampling**: while Active the controller re-samples on its own
//!    every `sample_interval`, so a quiescent device still gets released.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::time::Instant;
use tracing::{debug, info};
use wb_error::{Result, WbError};
use wb_protocol::ThresholdInfo;

use super::sampler::TrafficSample;
use super::timer::{DelayedAction, TimerKind};
use super::worker::Command;
use crate::constants::auto as auto_const;

/// Traffic-adaptive controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoState {
    #[default]
    Idle,
    Active,
}

impl AutoState {
    pub fn is_active(self) -> bool {
        self == AutoState::Active
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AutoState::Idle => "idle",
            AutoState::Active => "active",
        }
    }
}

impl fmt::Display for AutoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On/off thresholds with the off-delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_on_slots")]
    pub on_slots: u32,
    #[serde(default = "default_on_bytes")]
    pub on_bytes: u64,
    #[serde(default = "default_on_sync_bytes")]
    pub on_sync_bytes: u64,
    #[serde(default = "default_off_slots")]
    pub off_slots: u32,
    #[serde(default = "default_off_bytes")]
    pub off_bytes: u64,
    #[serde(default = "default_off_sync_bytes")]
    pub off_sync_bytes: u64,
    #[serde(default = "default_off_delay_ms")]
    pub off_delay_ms: u64,
}

fn default_on_slots() -> u32 {
    auto_const::DEFAULT_QUEUE_DEPTH * auto_const::DEFAULT_ON_PERCENT / 100
}

fn default_on_bytes() -> u64 {
    auto_const::DEFAULT_ON_BYTES
}

fn default_on_sync_bytes() -> u64 {
    auto_const::DEFAULT_ON_SYNC_BYTES
}

fn default_off_slots() -> u32 {
    auto_const::DEFAULT_QUEUE_DEPTH * auto_const::DEFAULT_OFF_PERCENT / 100
}

fn default_off_bytes() -> u64 {
    auto_const::DEFAULT_OFF_BYTES
}

fn default_off_sync_bytes() -> u64 {
    auto_const::DEFAULT_OFF_SYNC_BYTES
}

fn default_off_delay_ms() -> u64 {
    auto_const::DEFAULT_OFF_DELAY_MS
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            on_slots: default_on_slots(),
            on_bytes: default_on_bytes(),
            on_sync_bytes: default_on_sync_bytes(),
            off_slots: default_off_slots(),
            off_bytes: default_off_bytes(),
            off_sync_bytes: default_off_sync_bytes(),
            off_delay_ms: default_off_delay_ms(),
        }
    }
}

impl Thresholds {
    /// Derive the slot thresholds from a queue depth and two percentages.
    /// Byte thresholds and the delay keep their defaults.
    pub fn from_queue_depth(queue_depth: u32, on_percent: u32, off_percent: u32) -> Self {
        let scale = |pct: u32| (u64::from(queue_depth) * u64::from(pct) / 100) as u32;
        Self {
            on_slots: scale(on_percent),
            off_slots: scale(off_percent),
            ..Self::default()
        }
    }

    pub fn off_delay(&self) -> Duration {
        Duration::from_millis(self.off_delay_ms)
    }

    /// Reject inverted pairs, a zero on-slot threshold and out-of-range delays
    pub fn validate(&self) -> Result<()> {
        if self.on_slots == 0 {
            return Err(WbError::invalid_threshold("on_slots", "must be at least 1"));
        }
        if self.off_slots > self.on_slots {
            return Err(WbError::invalid_threshold(
                "off_slots",
                format!("must not exceed on_slots ({} > {})", self.off_slots, self.on_slots),
            ));
        }
        if self.off_bytes > self.on_bytes {
            return Err(WbError::invalid_threshold(
                "off_bytes",
                format!("must not exceed on_bytes ({} > {})", self.off_bytes, self.on_bytes),
            ));
        }
        if self.off_sync_bytes > self.on_sync_bytes {
            return Err(WbError::invalid_threshold(
                "off_sync_bytes",
                format!(
                    "must not exceed on_sync_bytes ({} > {})",
                    self.off_sync_bytes, self.on_sync_bytes
                ),
            ));
        }
        if self.off_delay_ms > auto_const::MAX_OFF_DELAY_MS {
            return Err(WbError::invalid_threshold(
                "off_delay_ms",
                format!("must be at most {}ms", auto_const::MAX_OFF_DELAY_MS),
            ));
        }
        Ok(())
    }

    /// Any on-threshold reached
    pub fn should_activate(&self, sample: &TrafficSample) -> bool {
        sample.occupied_slots >= self.on_slots
            || sample.write_bytes >= self.on_bytes
            || sample.sync_write_bytes >= self.on_sync_bytes
    }

    /// Every metric below its off-threshold
    pub fn should_release(&self, sample: &TrafficSample) -> bool {
        sample.occupied_slots < self.off_slots
            && sample.write_bytes < self.off_bytes
            && sample.sync_write_bytes < self.off_sync_bytes
    }
}

impl From<Thresholds> for ThresholdInfo {
    fn from(t: Thresholds) -> Self {
        Self {
            on_slots: t.on_slots,
            on_bytes: t.on_bytes,
            on_sync_bytes: t.on_sync_bytes,
            off_slots: t.off_slots,
            off_bytes: t.off_bytes,
            off_sync_bytes: t.off_sync_bytes,
            off_delay_ms: t.off_delay_ms,
        }
    }
}

impl From<ThresholdInfo> for Thresholds {
    fn from(t: ThresholdInfo) -> Self {
        Self {
            on_slots: t.on_slots,
            on_bytes: t.on_bytes,
            on_sync_bytes: t.on_sync_bytes,
            off_slots: t.off_slots,
            off_bytes: t.off_bytes,
            off_sync_bytes: t.off_sync_bytes,
            off_delay_ms: t.off_delay_ms,
        }
    }
}

/// Outcome of feeding one sample to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Activate,
    Release,
    Hold,
}

/// Pure transition function
pub fn decide(state: AutoState, sample: &TrafficSample, thresholds: &Thresholds) -> Decision {
    match state {
        AutoState::Idle if thresholds.should_activate(sample) => Decision::Activate,
        AutoState::Active if thresholds.should_release(sample) => Decision::Release,
        _ => Decision::Hold,
    }
}

/// State machine plus its two timers
pub(crate) struct AutoController {
    state: AutoState,
    sample_interval: Duration,
    deferred_off: DelayedAction,
    resample: DelayedAction,
}

impl AutoController {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            state: AutoState::Idle,
            sample_interval,
            deferred_off: DelayedAction::new(TimerKind::DeferredOff),
            resample: DelayedAction::new(TimerKind::Resample),
        }
    }

    pub fn state(&self) -> AutoState {
        self.state
    }

    /// Hardware must hold its current state while this is true
    pub fn deferred_off_pending(&self) -> bool {
        self.deferred_off.is_pending()
    }

    pub fn observe(
        &mut self,
        sample: &TrafficSample,
        thresholds: &Thresholds,
        tx: &WeakUnboundedSender<Command>,
    ) -> Decision {
        let decision = decide(self.state, sample, thresholds);
        match decision {
            Decision::Activate => {
                if self.deferred_off.cancel() {
                    debug!("Traffic resumed, deferred off cancelled");
                }
                self.state = AutoState::Active;
                self.arm_resample(tx);
                info!(
                    slots = sample.occupied_slots,
                    write_bytes = sample.write_bytes,
                    sync_bytes = sample.sync_write_bytes,
                    "Auto controller active"
                );
            }
            Decision::Release => {
                self.state = AutoState::Idle;
                self.resample.cancel();
                self.deferred_off
                    .schedule_at(Instant::now() + thresholds.off_delay(), tx);
                info!(delay_ms = thresholds.off_delay_ms, "Auto controller idle, deferring off");
            }
            Decision::Hold => {
                if self.state.is_active() {
                    self.arm_resample(tx);
                }
            }
        }
        decision
    }

    /// Keep polling after a failed sample so Active never gets stuck
    pub fn sample_failed(&mut self, tx: &WeakUnboundedSender<Command>) {
        if self.state.is_active() {
            self.arm_resample(tx);
        }
    }

    pub fn fire_deferred_off(&mut self, generation: u64) -> bool {
        self.deferred_off.fire(generation)
    }

    pub fn fire_resample(&mut self, generation: u64) -> bool {
        self.resample.fire(generation)
    }

    /// Drop both timers and return to Idle
    pub fn stop(&mut self) {
        self.deferred_off.cancel();
        self.resample.cancel();
        self.state = AutoState::Idle;
    }

    fn arm_resample(&mut self, tx: &WeakUnboundedSender<Command>) {
        self.resample
            .schedule_at(Instant::now() + self.sample_interval, tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn thresholds() -> Thresholds {
        Thresholds {
            on_slots: 32,
            off_slots: 13,
            on_bytes: u64::MAX,
            off_bytes: u64::MAX,
            on_sync_bytes: u64::MAX,
            off_sync_bytes: u64::MAX,
            off_delay_ms: 5000,
        }
    }

    fn slots(n: u32) -> TrafficSample {
        TrafficSample {
            occupied_slots: n,
            ..TrafficSample::default()
        }
    }

    #[test]
    fn test_defaults_follow_queue_depth() {
        let t = Thresholds::default();
        assert_eq!(t.on_slots, 28);
        assert_eq!(t.off_slots, 12);
        assert_eq!(t, Thresholds::from_queue_depth(32, 90, 40));
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_from_queue_depth_truncates() {
        let t = Thresholds::from_queue_depth(15, 90, 40);
        assert_eq!(t.on_slots, 13);
        assert_eq!(t.off_slots, 6);
    }

    #[test]
    fn test_validate_rejects_inverted_pairs() {
        let mut t = thresholds();
        t.off_slots = 40;
        assert!(matches!(
            t.validate(),
            Err(WbError::InvalidThreshold { field: "off_slots", .. })
        ));

        let mut t = Thresholds::default();
        t.off_sync_bytes = t.on_sync_bytes + 1;
        assert!(matches!(
            t.validate(),
            Err(WbError::InvalidThreshold { field: "off_sync_bytes", .. })
        ));

        let mut t = Thresholds::default();
        t.off_delay_ms = auto_const::MAX_OFF_DELAY_MS + 1;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_any_metric_activates() {
        let t = Thresholds::default();
        let sample = TrafficSample {
            occupied_slots: 1,
            write_bytes: 0,
            sync_write_bytes: t.on_sync_bytes,
        };
        assert_eq!(decide(AutoState::Idle, &sample, &t), Decision::Activate);
    }

    #[test]
    fn test_release_needs_every_metric_low() {
        let t = Thresholds::default();
        let sample = TrafficSample {
            occupied_slots: 0,
            write_bytes: t.off_bytes,
            sync_write_bytes: 0,
        };
        assert_eq!(decide(AutoState::Active, &sample, &t), Decision::Hold);
        assert_eq!(decide(AutoState::Active, &slots(0), &t), Decision::Release);
    }

    #[test]
    fn test_band_never_flips_state() {
        let t = thresholds();
        for n in 13..32 {
            assert_eq!(decide(AutoState::Idle, &slots(n), &t), Decision::Hold);
            assert_eq!(decide(AutoState::Active, &slots(n), &t), Decision::Hold);
        }
        assert_eq!(decide(AutoState::Idle, &slots(32), &t), Decision::Activate);
        assert_eq!(decide(AutoState::Active, &slots(12), &t), Decision::Release);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_arms_deferred_off_and_activation_cancels_it() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let weak = tx.downgrade();
        let t = thresholds();
        let mut auto = AutoController::new(Duration::from_secs(1));

        assert_eq!(auto.observe(&slots(40), &t, &weak), Decision::Activate);
        assert!(!auto.deferred_off_pending());

        assert_eq!(auto.observe(&slots(5), &t, &weak), Decision::Release);
        assert_eq!(auto.state(), AutoState::Idle);
        assert!(auto.deferred_off_pending());

        assert_eq!(auto.observe(&slots(40), &t, &weak), Decision::Activate);
        assert!(!auto.deferred_off_pending());

        auto.stop();
        assert_eq!(auto.state(), AutoState::Idle);
    }
}
