//! Linux sysfs back-end
//!
//! # Files Used
//!
//! - `wb_on` on the UFS host: write `1` or `0` to switch the write booster
//! - `/sys/block/<dev>/inflight`: two counters, in-flight reads and writes
//! - `/sys/block/<dev>/stat`: field 7 is the cumulative number of 512-byte
//!   sectors written
//!
//! The block layer does not expose per-request sizes, so the write volume
//! since the previous sample is spread across the in-flight write slots.
//! Sync flags are not visible through sysfs and are always reported false.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;
use wb_error::{Result, WbError};

use crate::constants::SECTOR_SIZE;
use crate::device::{BlockDevice, SlotInfo};
use crate::settings::DeviceSettings;

/// Index of "write sectors" in /sys/block/<dev>/stat
const STAT_WRITE_SECTORS: usize = 6;

/// Upper bound on a plausible in-flight counter; larger values are corrupt
const MAX_INFLIGHT: u32 = 1 << 16;

pub struct SysfsDevice {
    name: String,
    wb_on_path: PathBuf,
    inflight_path: PathBuf,
    stat_path: PathBuf,
    last_sectors_written: Mutex<Option<u64>>,
}

impl SysfsDevice {
    pub fn new(block_device: &str, wb_on_path: impl Into<PathBuf>, sys_block: &Path) -> Self {
        let dev_dir = sys_block.join(block_device);
        Self {
            name: block_device.to_string(),
            wb_on_path: wb_on_path.into(),
            inflight_path: dev_dir.join("inflight"),
            stat_path: dev_dir.join("stat"),
            last_sectors_written: Mutex::new(None),
        }
    }

    /// Build from settings, failing if any of the files is missing
    pub fn from_settings(settings: &DeviceSettings) -> Result<Self> {
        let device = Self::new(
            &settings.block_device,
            &settings.wb_on_path,
            &settings.sys_block_path,
        );
        for path in [&device.wb_on_path, &device.inflight_path, &device.stat_path] {
            if !path.exists() {
                return Err(WbError::DeviceNotFound(path.display().to_string()));
            }
        }
        Ok(device)
    }

    /// Current value of the `wb_on` attribute
    pub fn read_wb_on(&self) -> Result<bool> {
        let content = read_attr(&self.wb_on_path)?;
        match content.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(WbError::SysfsParse {
                path: self.wb_on_path.clone(),
                reason: format!("unexpected value '{}'", other),
            }),
        }
    }

    fn write_delta_bytes(&self) -> Result<u64> {
        let sectors = parse_sectors_written(&self.stat_path, &read_attr(&self.stat_path)?)?;
        let mut last = self.last_sectors_written.lock();
        // First sample only establishes the baseline; counters may also wrap
        let delta = last.map_or(0, |prev| sectors.saturating_sub(prev));
        *last = Some(sectors);
        Ok(delta.saturating_mul(SECTOR_SIZE))
    }
}

impl BlockDevice for SysfsDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_write_booster(&self, on: bool) -> Result<()> {
        fs::write(&self.wb_on_path, if on { "1" } else { "0" })
            .map_err(|e| WbError::hardware(on, format!("{}: {}", self.wb_on_path.display(), e)))
    }

    fn inflight_slots(&self) -> Result<Vec<SlotInfo>> {
        let (reads, writes) = parse_inflight(&self.inflight_path, &read_attr(&self.inflight_path)?)?;
        let written = self.write_delta_bytes()?;
        debug!(reads, writes, written, "Sampled {}", self.name);
        Ok(build_slots(reads, writes, written))
    }
}

fn read_attr(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| WbError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })
}

fn parse_inflight(path: &Path, content: &str) -> Result<(u32, u32)> {
    let mut fields = content.split_whitespace().map(|f| f.parse::<u32>());
    match (fields.next(), fields.next()) {
        (Some(Ok(reads)), Some(Ok(writes))) if reads <= MAX_INFLIGHT && writes <= MAX_INFLIGHT => {
            Ok((reads, writes))
        }
        _ => Err(WbError::SysfsParse {
            path: path.to_path_buf(),
            reason: format!("expected two counters, got '{}'", content.trim()),
        }),
    }
}

fn parse_sectors_written(path: &Path, content: &str) -> Result<u64> {
    content
        .split_whitespace()
        .nth(STAT_WRITE_SECTORS)
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| WbError::SysfsParse {
            path: path.to_path_buf(),
            reason: "missing write sector counter".into(),
        })
}

fn build_slots(reads: u32, writes: u32, written: u64) -> Vec<SlotInfo> {
    let mut slots = Vec::with_capacity(reads as usize + writes as usize);
    slots.extend((0..reads).map(|_| SlotInfo::read(0)));
    if writes > 0 {
        let share = written / u64::from(writes);
        let remainder = written % u64::from(writes);
        slots.extend((0..writes).map(|i| SlotInfo::write(if i == 0 { share + remainder } else { share })));
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrafficSample;
    use tempfile::TempDir;

    const STAT_TEMPLATE: &str =
        "    1200        0    96000      300     {w}        0     {s}     2000        0     1500     2300";

    fn fake_sysfs(inflight: &str, sectors: u64) -> (TempDir, SysfsDevice) {
        let dir = TempDir::new().unwrap();
        let dev = dir.path().join("block").join("sda");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("inflight"), inflight).unwrap();
        write_stat(&dev, sectors);
        let wb_on = dir.path().join("wb_on");
        fs::write(&wb_on, "0\n").unwrap();
        let device = SysfsDevice::new("sda", wb_on, &dir.path().join("block"));
        (dir, device)
    }

    fn write_stat(dev: &Path, sectors: u64) {
        let stat = STAT_TEMPLATE
            .replace("{w}", "800")
            .replace("{s}", &sectors.to_string());
        fs::write(dev.join("stat"), stat).unwrap();
    }

    #[test]
    fn test_toggle_writes_attribute() {
        let (_dir, device) = fake_sysfs("0 0\n", 0);
        assert!(!device.read_wb_on().unwrap());
        device.set_write_booster(true).unwrap();
        assert!(device.read_wb_on().unwrap());
        device.set_write_booster(false).unwrap();
        assert!(!device.read_wb_on().unwrap());
    }

    #[test]
    fn test_toggle_failure_is_hardware_error() {
        let device = SysfsDevice::new("sda", "/nonexistent/wb_on", Path::new("/nonexistent"));
        assert!(device.set_write_booster(true).unwrap_err().is_hardware());
    }

    #[test]
    fn test_first_sample_is_baseline() {
        let (_dir, device) = fake_sysfs("       3       5\n", 1000);
        let sample = TrafficSample::from_slots(&device.inflight_slots().unwrap());
        assert_eq!(sample.occupied_slots, 8);
        assert_eq!(sample.write_bytes, 0);
    }

    #[test]
    fn test_write_delta_spread_over_write_slots() {
        let (dir, device) = fake_sysfs("0 3\n", 1000);
        device.inflight_slots().unwrap();

        write_stat(&dir.path().join("block").join("sda"), 1010);
        let slots = device.inflight_slots().unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots.iter().map(|s| s.byte_len).sum::<u64>(), 10 * SECTOR_SIZE);
        assert!(slots.iter().all(|s| !s.sync));
    }

    #[test]
    fn test_parse_errors() {
        let path = Path::new("inflight");
        assert!(parse_inflight(path, "12\n").is_err());
        assert!(parse_inflight(path, "a b\n").is_err());
        assert!(parse_sectors_written(path, "1 2 3").is_err());
    }

    #[test]
    fn test_corrupt_inflight_counters_rejected() {
        let path = Path::new("inflight");
        assert!(parse_inflight(path, "4294967295 4294967295\n").is_err());
        assert!(parse_inflight(path, "0 70000\n").is_err());
        assert_eq!(parse_inflight(path, "65536 0\n").unwrap(), (65536, 0));
    }

    #[test]
    fn test_corrupt_inflight_file_fails_sample() {
        let (_dir, device) = fake_sysfs("4294967295 1\n", 0);
        assert!(matches!(
            device.inflight_slots(),
            Err(WbError::SysfsParse { .. })
        ));
    }

    #[test]
    fn test_from_settings_requires_files() {
        let settings = DeviceSettings {
            block_device: "nvme9n9".into(),
            wb_on_path: "/nonexistent/wb_on".into(),
            sys_block_path: "/nonexistent".into(),
        };
        assert!(matches!(
            SysfsDevice::from_settings(&settings),
            Err(WbError::DeviceNotFound(_))
        ));
    }
}
