//! Controllers that place setpoints on the power engine every cycle.

pub mod cycle;
pub mod pid;
pub mod ramp;

pub use cycle::{Controller, ControllerStatus, CycleRunner, SetpointController};
pub use pid::PidFilter;
pub use ramp::{RampConfig, RampLimiter};
