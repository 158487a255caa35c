//! Traffic sampling over the device's in-flight slots

use std::sync::Arc;

use wb_error::{Result, WbError};

use crate::device::{BlockDevice, OpKind, SlotInfo};

/// Point-in-time load summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSample {
    /// Number of claimed slots, regardless of kind
    pub occupied_slots: u32,
    /// Bytes of in-flight writes
    pub write_bytes: u64,
    /// Bytes of in-flight synchronous writes
    pub sync_write_bytes: u64,
}

impl TrafficSample {
    pub fn from_slots<'a>(slots: impl IntoIterator<Item = &'a SlotInfo>) -> Self {
        slots.into_iter().fold(Self::default(), |mut acc, slot| {
            acc.occupied_slots = acc.occupied_slots.saturating_add(1);
            if slot.op == OpKind::Write {
                acc.write_bytes = acc.write_bytes.saturating_add(slot.byte_len);
                if slot.sync {
                    acc.sync_write_bytes = acc.sync_write_bytes.saturating_add(slot.byte_len);
                }
            }
            acc
        })
    }
}

/// Read-only observer of a [`BlockDevice`]'s slot pool
pub(crate) struct TrafficSampler<D: BlockDevice> {
    device: Arc<D>,
}

impl<D: BlockDevice> TrafficSampler<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self { device }
    }

    /// Take a sample on the blocking pool
    pub async fn sample(&self) -> Result<TrafficSample> {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            device
                .inflight_slots()
                .map(|slots| TrafficSample::from_slots(&slots))
        })
        .await
        .map_err(|e| WbError::generic(format!("sampling task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockBlockDevice;

    #[test]
    fn test_empty_pool() {
        assert_eq!(TrafficSample::from_slots(&Vec::<SlotInfo>::new()), TrafficSample::default());
    }

    #[test]
    fn test_counts_every_slot_but_only_write_bytes() {
        let slots = [
            SlotInfo::read(1 << 20),
            SlotInfo::write(4096),
            SlotInfo::sync_write(8192),
            SlotInfo::other(),
        ];
        let sample = TrafficSample::from_slots(&slots);
        assert_eq!(sample.occupied_slots, 4);
        assert_eq!(sample.write_bytes, 4096 + 8192);
        assert_eq!(sample.sync_write_bytes, 8192);
    }

    #[tokio::test]
    async fn test_sample_propagates_device_error() {
        let mut device = MockBlockDevice::new();
        device
            .expect_inflight_slots()
            .returning(|| Err(WbError::DeviceNotFound("sdz".into())));

        let sampler = TrafficSampler::new(Arc::new(device));
        assert!(matches!(
            sampler.sample().await,
            Err(WbError::DeviceNotFound(_))
        ));
    }
}
