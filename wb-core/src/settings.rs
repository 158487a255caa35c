//! Daemon Settings
//!
//! Persistent settings stored as JSON in /etc/wbooster/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wb_error::{Result, WbError};

use crate::constants::{auto as auto_const, daemon as daemon_const, paths};
use crate::engine::{ControllerConfig, Thresholds};

/// Top-level settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub controller: ControllerSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub daemon: DaemonSettings,
}

/// Thresholds and sampling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default)]
    pub thresholds: Thresholds,

    /// When set, slot thresholds are derived from this queue depth and the
    /// two percentages instead of `thresholds.on_slots/off_slots`
    #[serde(default)]
    pub queue_depth: Option<u32>,

    #[serde(default = "default_on_percent")]
    pub on_percent: u32,

    #[serde(default = "default_off_percent")]
    pub off_percent: u32,

    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_on_percent() -> u32 {
    auto_const::DEFAULT_ON_PERCENT
}

fn default_off_percent() -> u32 {
    auto_const::DEFAULT_OFF_PERCENT
}

fn default_sample_interval_ms() -> u64 {
    auto_const::DEFAULT_SAMPLE_INTERVAL_MS
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            queue_depth: None,
            on_percent: default_on_percent(),
            off_percent: default_off_percent(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl ControllerSettings {
    /// Thresholds after applying the queue-depth shortcut
    pub fn effective_thresholds(&self) -> Thresholds {
        match self.queue_depth {
            Some(depth) => {
                let derived = Thresholds::from_queue_depth(depth, self.on_percent, self.off_percent);
                Thresholds {
                    on_slots: derived.on_slots,
                    off_slots: derived.off_slots,
                    ..self.thresholds
                }
            }
            None => self.thresholds,
        }
    }

    pub fn to_config(&self) -> ControllerConfig {
        ControllerConfig {
            thresholds: self.effective_thresholds(),
            sample_interval: Duration::from_millis(self.sample_interval_ms),
        }
    }
}

/// Which device to drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_block_device")]
    pub block_device: String,

    #[serde(default = "default_wb_on_path")]
    pub wb_on_path: PathBuf,

    #[serde(default = "default_sys_block_path")]
    pub sys_block_path: PathBuf,
}

fn default_block_device() -> String {
    paths::DEFAULT_BLOCK_DEVICE.to_string()
}

fn default_wb_on_path() -> PathBuf {
    PathBuf::from(paths::DEFAULT_WB_ON_PATH)
}

fn default_sys_block_path() -> PathBuf {
    PathBuf::from(paths::SYS_BLOCK)
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            block_device: default_block_device(),
            wb_on_path: default_wb_on_path(),
            sys_block_path: default_sys_block_path(),
        }
    }
}

/// Daemon behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Poke interval standing in for I/O completion accounting
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Executable run as `<hook> on|off` after every hardware switch
    #[serde(default)]
    pub state_hook: Option<PathBuf>,
}

fn default_poll_interval_ms() -> u64 {
    daemon_const::DEFAULT_POLL_INTERVAL_MS
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            socket_path: None,
            state_hook: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.queue_depth == Some(0) {
            return Err(invalid("controller.queue_depth", "must be at least 1"));
        }
        if c.on_percent > 100 || c.off_percent > c.on_percent {
            return Err(invalid(
                "controller.off_percent",
                format!("need off_percent <= on_percent <= 100, got {} / {}", c.off_percent, c.on_percent),
            ));
        }
        c.to_config().validate()?;

        if self.device.block_device.is_empty() || self.device.block_device.contains('/') {
            return Err(invalid("device.block_device", "must be a bare device name"));
        }
        if self.daemon.poll_interval_ms < daemon_const::MIN_POLL_INTERVAL_MS {
            return Err(invalid(
                "daemon.poll_interval_ms",
                format!("must be at least {}", daemon_const::MIN_POLL_INTERVAL_MS),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> WbError {
    WbError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Settings file location: `$WBOOSTER_CONFIG` or the system default
pub fn settings_path() -> PathBuf {
    std::env::var_os(paths::CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(paths::CONFIG_FILE))
}

/// Load and validate settings. A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| WbError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| WbError::config(format!("Failed to parse {}: {}", path.display(), e)))?;
    settings.validate()?;
    Ok(settings)
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from(&settings_path())
}

/// Atomic write: temp file, fsync, rename
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;

    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| WbError::config(format!("Failed to serialize settings: {}", e)))?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| WbError::FileWrite {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
    }

    let temp_path = path.with_extension("json.tmp");
    let write_err = |e| WbError::FileWrite {
        path: temp_path.clone(),
        source: e,
    };

    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(json.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| WbError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.controller.to_config(), ControllerConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"controller": {"thresholds": {"off_delay_ms": 2000}, "queue_depth": 64}}"#,
        )
        .unwrap();

        let settings = load_settings_from(&path).unwrap();
        let t = settings.controller.effective_thresholds();
        assert_eq!(t.off_delay_ms, 2000);
        assert_eq!(t.on_slots, 57);
        assert_eq!(t.off_slots, 25);
        assert_eq!(t.on_bytes, auto_const::DEFAULT_ON_BYTES);
        assert_eq!(settings.daemon.poll_interval_ms, daemon_const::DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"controller": {"thresholds": {"on_slots": 4, "off_slots": 8}}}"#).unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(WbError::InvalidThreshold { field: "off_slots", .. })
        ));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(WbError::Config(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.device.block_device = "sdb".into();
        settings.daemon.state_hook = Some(PathBuf::from("/usr/libexec/wb-hook"));
        save_settings_to(&path, &settings).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_validate_poll_interval() {
        let mut settings = Settings::default();
        settings.daemon.poll_interval_ms = 1;
        assert!(matches!(
            settings.validate(),
            Err(WbError::InvalidConfig { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_settings_path_env_override() {
        std::env::set_var(paths::CONFIG_ENV, "/tmp/wb-test.json");
        assert_eq!(settings_path(), PathBuf::from("/tmp/wb-test.json"));
        std::env::remove_var(paths::CONFIG_ENV);
        assert_eq!(settings_path(), PathBuf::from(paths::CONFIG_FILE));
    }
}
