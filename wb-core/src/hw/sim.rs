//! In-memory device for simulation and tests

use parking_lot::Mutex;
use tracing::debug;
use wb_error::{Result, WbError};

use crate::device::{BlockDevice, SlotInfo};
use crate::engine::ResetNotifier;

#[derive(Debug, Default)]
struct SimInner {
    slots: Vec<SlotInfo>,
    wb_on: bool,
    toggle_calls: Vec<bool>,
    fail_toggles: u32,
    fail_samples: u32,
}

/// Simulated storage device
///
/// Load is whatever the caller last put into the slot pool. Toggle calls are
/// recorded, and failures can be injected for both toggling and sampling.
#[derive(Debug, Default)]
pub struct SimDevice {
    name: String,
    inner: Mutex<SimInner>,
    reset: Mutex<Option<ResetNotifier>>,
}

impl SimDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn set_slots(&self, slots: Vec<SlotInfo>) {
        self.inner.lock().slots = slots;
    }

    /// Fill the pool with `occupied` zero-length reads
    pub fn set_load(&self, occupied: u32) {
        self.set_slots((0..occupied).map(|_| SlotInfo::read(0)).collect());
    }

    pub fn wb_on(&self) -> bool {
        self.inner.lock().wb_on
    }

    /// Every successful `set_write_booster` argument, in order
    pub fn toggle_calls(&self) -> Vec<bool> {
        self.inner.lock().toggle_calls.clone()
    }

    pub fn fail_next_toggles(&self, count: u32) {
        self.inner.lock().fail_toggles = count;
    }

    pub fn fail_next_samples(&self, count: u32) {
        self.inner.lock().fail_samples = count;
    }

    /// Drop the hardware state as a real reset would, then tell the controller
    pub fn trigger_reset(&self) {
        self.inner.lock().wb_on = false;
        let notifier = self.reset.lock().clone();
        match notifier {
            Some(notifier) => notifier.notify(),
            None => debug!("Reset on {} with no controller attached", self.name),
        }
    }
}

impl BlockDevice for SimDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_write_booster(&self, on: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_toggles > 0 {
            inner.fail_toggles -= 1;
            return Err(WbError::hardware(on, "injected failure"));
        }
        inner.wb_on = on;
        inner.toggle_calls.push(on);
        Ok(())
    }

    fn inflight_slots(&self) -> Result<Vec<SlotInfo>> {
        let mut inner = self.inner.lock();
        if inner.fail_samples > 0 {
            inner.fail_samples -= 1;
            return Err(WbError::generic("injected sampling failure"));
        }
        Ok(inner.slots.clone())
    }

    fn register_reset_notifier(&self, notifier: ResetNotifier) {
        *self.reset.lock() = Some(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_toggle_failure() {
        let device = SimDevice::new("sim0");
        device.fail_next_toggles(1);
        assert!(device.set_write_booster(true).is_err());
        assert!(!device.wb_on());
        device.set_write_booster(true).unwrap();
        assert!(device.wb_on());
        assert_eq!(device.toggle_calls(), vec![true]);
    }

    #[test]
    fn test_load() {
        let device = SimDevice::new("sim0");
        device.set_load(4);
        assert_eq!(device.inflight_slots().unwrap().len(), 4);
        device.fail_next_samples(1);
        assert!(device.inflight_slots().is_err());
        assert_eq!(device.inflight_slots().unwrap().len(), 4);
    }
}
