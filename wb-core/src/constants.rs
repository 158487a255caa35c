//! Constants and configuration values for wbooster
//!
//! Centralizes all magic numbers, paths, and configuration defaults.
//! Never use magic numbers in other files - add them here first.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Default settings file
    pub const CONFIG_FILE: &str = "/etc/wbooster/settings.json";

    /// Environment variable overriding the settings file location
    pub const CONFIG_ENV: &str = "WBOOSTER_CONFIG";

    /// Root of the block layer sysfs tree
    pub const SYS_BLOCK: &str = "/sys/block";

    /// UFS host write-booster switch. The instance directory under
    /// `ufshcd/` is platform specific and normally overridden in settings.
    pub const DEFAULT_WB_ON_PATH: &str = "/sys/bus/platform/drivers/ufshcd/ufshc/wb_on";

    /// Block device sampled when settings do not name one
    pub const DEFAULT_BLOCK_DEVICE: &str = "sda";

    /// Control socket
    pub const DEFAULT_SOCKET: &str = "/run/wbooster.sock";
}

/// User boost window bounds
pub mod boost {
    use std::time::Duration;

    pub const MIN_DURATION: Duration = Duration::from_millis(wb_protocol::MIN_BOOST_MS as u64);
    pub const MAX_DURATION: Duration = Duration::from_millis(wb_protocol::MAX_BOOST_MS as u64);
}

/// Traffic-adaptive controller defaults
pub mod auto {
    /// Typical UFS queue depth (tags per LU)
    pub const DEFAULT_QUEUE_DEPTH: u32 = 32;

    /// Share of the queue that must be busy to turn WB on
    pub const DEFAULT_ON_PERCENT: u32 = 90;

    /// Share of the queue below which WB may be released
    pub const DEFAULT_OFF_PERCENT: u32 = 40;

    pub const DEFAULT_ON_BYTES: u64 = 8 * 1024 * 1024;
    pub const DEFAULT_ON_SYNC_BYTES: u64 = 1024 * 1024;
    pub const DEFAULT_OFF_BYTES: u64 = 2 * 1024 * 1024;
    pub const DEFAULT_OFF_SYNC_BYTES: u64 = 256 * 1024;

    /// How long traffic must stay low before the hardware is switched off
    pub const DEFAULT_OFF_DELAY_MS: u64 = 5000;

    /// Upper bound accepted for the off delay
    pub const MAX_OFF_DELAY_MS: u64 = wb_protocol::MAX_OFF_DELAY_MS;

    /// Re-sampling period while the controller is Active
    pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;
    pub const MIN_SAMPLE_INTERVAL_MS: u64 = 50;
    pub const MAX_SAMPLE_INTERVAL_MS: u64 = 60_000;
}

/// Daemon loop defaults
pub mod daemon {
    /// How often the daemon pokes the controller on behalf of the I/O path
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
    pub const MIN_POLL_INTERVAL_MS: u64 = 20;

    /// Maximum runtime of the state-change hook
    pub const HOOK_TIMEOUT_MS: u64 = 2000;
}

/// Block layer sector size used by /sys/block/<dev>/stat
pub const SECTOR_SIZE: u64 = 512;

/// Convenience for the default re-sampling period
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(auto::DEFAULT_SAMPLE_INTERVAL_MS);
