//! wbooster Core Library
//!
//! Adaptive write-booster admission control for UFS-style block devices.
//!
//! # Features
//!
//! - **Votes**: independent subsystems hold WB on through a per-reason register
//! - **User Boost**: time-bounded On windows that only ever extend
//! - **Traffic Adaptation**: hysteresis on in-flight slots and write volume,
//!   with a debounced off
//! - **Serialized Control**: one worker task owns every hardware transition
//!
//! # Module Structure
//!
//! - `engine/` - votes, boost timer, auto controller and the control worker
//! - `hw/` - sysfs and simulated device back-ends
//! - `device` - the traits the controller consumes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wb_core::{Controller, ControllerConfig, ReasonId, SimDevice};
//!
//! # async fn demo() -> wb_error::Result<()> {
//! let device = Arc::new(SimDevice::new("sim0"));
//! let controller = Controller::spawn(device, ControllerConfig::default())?;
//!
//! controller.set_vote(ReasonId::Scheduler, true).await?;
//! controller.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Grouped modules
pub mod engine;
pub mod hw;

// Standalone modules
pub mod constants;
pub mod device;
pub mod settings;

pub use device::{BlockDevice, OpKind, SlotInfo, StateObserver};
pub use engine::{
    decide, AutoState, Controller, ControllerConfig, ControllerStatus, Decision, ReasonId,
    ResetNotifier, Thresholds, TrafficSample, VoteRegister, WbState,
};
pub use hw::{SimDevice, SysfsDevice};
pub use settings::{
    load_settings, load_settings_from, save_settings, save_settings_to, settings_path,
    ControllerSettings, DaemonSettings, DeviceSettings, Settings,
};

// Re-export error types
pub use wb_error::{Result, WbError};
