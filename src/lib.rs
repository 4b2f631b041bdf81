//! Per-cycle power dispatch for energy storage systems.
//!
//! Controllers place constraints on ESS and clusters through [`power::EssPower`];
//! each cycle the constraints are solved as a linear program and one
//! active/reactive setpoint per phase is sent to every device.

pub mod config;
pub mod controller;
pub mod domain;
pub mod power;
pub mod soc;
pub mod telemetry;

pub use power::{CycleReport, EssPower, PowerError};
