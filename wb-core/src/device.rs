//! Device boundary
//!
//! The controller never owns the storage device. It talks to it through
//! [`BlockDevice`], which exposes the physical write-booster switch and a
//! read-only snapshot of the in-flight request slots, and reports state
//! changes to an optional [`StateObserver`].

use wb_error::Result;

use crate::engine::{ResetNotifier, WbState};

/// Kind of request occupying a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    /// Flush, discard, query and other non-data commands
    Other,
}

/// One claimed slot of the device's concurrency token pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub op: OpKind,
    pub byte_len: u64,
    /// Write marked synchronous / high priority
    pub sync: bool,
}

impl SlotInfo {
    pub fn read(byte_len: u64) -> Self {
        Self { op: OpKind::Read, byte_len, sync: false }
    }

    pub fn write(byte_len: u64) -> Self {
        Self { op: OpKind::Write, byte_len, sync: false }
    }

    pub fn sync_write(byte_len: u64) -> Self {
        Self { op: OpKind::Write, byte_len, sync: true }
    }

    pub fn other() -> Self {
        Self { op: OpKind::Other, byte_len: 0, sync: false }
    }
}

/// Capability object for the storage device
///
/// Implementations must tolerate being asked for the state they are already
/// in. `set_write_booster` may block; the controller always calls it from
/// the blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait BlockDevice: Send + Sync + 'static {
    /// Short name used in log lines
    fn name(&self) -> String;

    /// Physically enable or disable the write booster
    fn set_write_booster(&self, on: bool) -> Result<()>;

    /// Snapshot of the currently claimed request slots
    fn inflight_slots(&self) -> Result<Vec<SlotInfo>>;

    /// Hand the device a callback to invoke after it has been reset
    fn register_reset_notifier(&self, _notifier: ResetNotifier) {}
}

/// Best-effort external notification of hardware state changes
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, state: WbState) -> Result<()>;
}
