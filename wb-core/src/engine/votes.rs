//! Explicit on-votes
//!
//! Each independent subsystem that wants the write booster owns one
//! [`ReasonId`]. The register is a bitmask: at most one vote per reason,
//! and WB is explicitly demanded while any bit is set.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use wb_error::WbError;

/// Identity of a vote owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonId {
    /// Latency-sensitive foreground work flagged by the scheduler
    Scheduler,
    /// Time-bounded user boost
    User,
    /// Operator override from the control socket
    Manual,
}

impl ReasonId {
    pub const ALL: [ReasonId; 3] = [ReasonId::Scheduler, ReasonId::User, ReasonId::Manual];

    fn bit(self) -> u32 {
        match self {
            ReasonId::Scheduler => 1 << 0,
            ReasonId::User => 1 << 1,
            ReasonId::Manual => 1 << 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReasonId::Scheduler => "scheduler",
            ReasonId::User => "user",
            ReasonId::Manual => "manual",
        }
    }
}

impl fmt::Display for ReasonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonId {
    type Err = WbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReasonId::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| WbError::UnknownReason(s.to_string()))
    }
}

/// Set of currently active reasons
#[derive(Debug, Default)]
pub struct VoteRegister {
    bits: Mutex<u32>,
}

impl VoteRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear a reason. Returns true if the register changed.
    pub fn set(&self, reason: ReasonId, active: bool) -> bool {
        let mut bits = self.bits.lock();
        let before = *bits;
        if active {
            *bits |= reason.bit();
        } else {
            *bits &= !reason.bit();
        }
        before != *bits
    }

    pub fn is_active(&self, reason: ReasonId) -> bool {
        *self.bits.lock() & reason.bit() != 0
    }

    /// True while any reason holds a vote
    pub fn explicit_demand(&self) -> bool {
        *self.bits.lock() != 0
    }

    pub fn active_reasons(&self) -> Vec<ReasonId> {
        let bits = *self.bits.lock();
        ReasonId::ALL
            .into_iter()
            .filter(|r| bits & r.bit() != 0)
            .collect()
    }

    pub fn clear_all(&self) {
        *self.bits.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_votes_are_independent() {
        let votes = VoteRegister::new();
        assert!(!votes.explicit_demand());

        assert!(votes.set(ReasonId::Scheduler, true));
        assert!(votes.set(ReasonId::User, true));
        assert!(votes.set(ReasonId::Scheduler, false));

        assert!(votes.explicit_demand());
        assert!(votes.is_active(ReasonId::User));
        assert_eq!(votes.active_reasons(), vec![ReasonId::User]);
    }

    #[test]
    fn test_set_is_idempotent() {
        let votes = VoteRegister::new();
        assert!(votes.set(ReasonId::Manual, true));
        assert!(!votes.set(ReasonId::Manual, true));
        assert!(!votes.set(ReasonId::User, false));
    }

    #[test]
    fn test_reason_parse() {
        assert_eq!("scheduler".parse::<ReasonId>().unwrap(), ReasonId::Scheduler);
        assert!(matches!(
            "thermal".parse::<ReasonId>(),
            Err(WbError::UnknownReason(_))
        ));
        for reason in ReasonId::ALL {
            assert!(wb_protocol::KNOWN_REASONS.contains(&reason.as_str()));
        }
    }

    #[test]
    fn test_clear_all() {
        let votes = VoteRegister::new();
        votes.set(ReasonId::Scheduler, true);
        votes.set(ReasonId::Manual, true);
        votes.clear_all();
        assert!(votes.active_reasons().is_empty());
    }
}
