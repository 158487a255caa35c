//! Write-booster control engine
//!
//! Contains the vote register, the user boost timer, the traffic-adaptive
//! state machine and the serialized worker that ties them to the hardware.

mod auto;
mod boost;
mod controller;
mod sampler;
mod timer;
mod toggle;
mod votes;
mod worker;

pub use auto::{decide, AutoState, Decision, Thresholds};
pub use controller::{Controller, ControllerConfig, ControllerStatus, ResetNotifier};
pub use sampler::TrafficSample;
pub use toggle::WbState;
pub use votes::{ReasonId, VoteRegister};
