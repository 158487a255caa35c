//! Sole writer of the physical write-booster switch

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wb_error::{Result, WbError};

use crate::device::{BlockDevice, StateObserver};

/// Physical write-booster state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WbState {
    #[default]
    Off,
    On,
}

impl WbState {
    pub fn from_on(on: bool) -> Self {
        if on {
            WbState::On
        } else {
            WbState::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == WbState::On
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WbState::Off => "off",
            WbState::On => "on",
        }
    }
}

impl fmt::Display for WbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives the device toward a target state and remembers what was applied
pub(crate) struct HardwareToggle<D: BlockDevice> {
    device: Arc<D>,
    last_applied: WbState,
    state_tx: watch::Sender<WbState>,
    observer: Option<Arc<dyn StateObserver>>,
}

impl<D: BlockDevice> HardwareToggle<D> {
    pub fn new(
        device: Arc<D>,
        state_tx: watch::Sender<WbState>,
        observer: Option<Arc<dyn StateObserver>>,
    ) -> Self {
        Self {
            device,
            last_applied: WbState::Off,
            state_tx,
            observer,
        }
    }

    pub fn last_applied(&self) -> WbState {
        self.last_applied
    }

    /// Apply `target` unless it is already in effect.
    ///
    /// Returns Ok(true) when the device was switched. On failure the
    /// remembered state is left untouched so the next request retries.
    pub async fn apply(&mut self, target: WbState) -> Result<bool> {
        if target == self.last_applied {
            return Ok(false);
        }

        let device = Arc::clone(&self.device);
        let on = target.is_on();
        tokio::task::spawn_blocking(move || device.set_write_booster(on))
            .await
            .map_err(|e| WbError::hardware(on, format!("toggle task failed: {}", e)))??;

        self.last_applied = target;
        self.state_tx.send_replace(target);
        info!(device = %self.device.name(), state = %target, "Write booster switched");

        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_state_change(target) {
                warn!("State observer failed: {}", e);
            }
        }
        Ok(true)
    }

    /// Forget the applied state after the device lost it (reset, power cycle)
    pub fn resync(&mut self) {
        debug!(previous = %self.last_applied, "Resyncing write booster state");
        self.last_applied = WbState::Off;
        self.state_tx.send_replace(WbState::Off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockBlockDevice;
    use mockall::predicate::eq;
    use parking_lot::Mutex;

    struct RecordingObserver(Mutex<Vec<WbState>>);

    impl StateObserver for RecordingObserver {
        fn on_state_change(&self, state: WbState) -> Result<()> {
            self.0.lock().push(state);
            Err(WbError::generic("uevent channel closed"))
        }
    }

    fn mock_device() -> MockBlockDevice {
        let mut device = MockBlockDevice::new();
        device.expect_name().return_const("ufs0".to_string());
        device
    }

    #[tokio::test]
    async fn test_apply_skips_when_unchanged() {
        let mut device = mock_device();
        device
            .expect_set_write_booster()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));

        let (tx, rx) = watch::channel(WbState::Off);
        let mut toggle = HardwareToggle::new(Arc::new(device), tx, None);

        assert!(!toggle.apply(WbState::Off).await.unwrap());
        assert!(toggle.apply(WbState::On).await.unwrap());
        assert!(!toggle.apply(WbState::On).await.unwrap());
        assert_eq!(*rx.borrow(), WbState::On);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_applied() {
        let mut device = mock_device();
        let mut seq = mockall::Sequence::new();
        device
            .expect_set_write_booster()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|on| Err(WbError::hardware(on, "link down")));
        device
            .expect_set_write_booster()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (tx, _rx) = watch::channel(WbState::Off);
        let mut toggle = HardwareToggle::new(Arc::new(device), tx, None);

        let err = toggle.apply(WbState::On).await.unwrap_err();
        assert!(err.is_hardware());
        assert_eq!(toggle.last_applied(), WbState::Off);

        assert!(toggle.apply(WbState::On).await.unwrap());
        assert_eq!(toggle.last_applied(), WbState::On);
    }

    #[tokio::test]
    async fn test_observer_failure_is_not_fatal() {
        let mut device = mock_device();
        device.expect_set_write_booster().returning(|_| Ok(()));
        let observer = Arc::new(RecordingObserver(Mutex::new(Vec::new())));

        let (tx, _rx) = watch::channel(WbState::Off);
        let mut toggle = HardwareToggle::new(
            Arc::new(device),
            tx,
            Some(observer.clone() as Arc<dyn StateObserver>),
        );

        assert!(toggle.apply(WbState::On).await.unwrap());
        assert!(toggle.apply(WbState::Off).await.unwrap());
        assert_eq!(*observer.0.lock(), vec![WbState::On, WbState::Off]);
    }

    #[tokio::test]
    async fn test_resync_allows_reapply() {
        let mut device = mock_device();
        device
            .expect_set_write_booster()
            .with(eq(true))
            .times(2)
            .returning(|_| Ok(()));

        let (tx, _rx) = watch::channel(WbState::Off);
        let mut toggle = HardwareToggle::new(Arc::new(device), tx, None);

        toggle.apply(WbState::On).await.unwrap();
        toggle.resync();
        assert_eq!(toggle.last_applied(), WbState::Off);
        assert!(toggle.apply(WbState::On).await.unwrap());
    }
}
