//! Device back-ends
//!
//! - `sysfs` - real UFS hosts through the Linux sysfs attributes
//! - `sim` - in-memory device for `--simulate` and tests

mod sim;
mod sysfs;

pub use sim::SimDevice;
pub use sysfs::SysfsDevice;
