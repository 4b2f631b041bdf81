use anyhow::Result;
use std::fmt;
use std::sync::Arc;

use super::types::{Phase, Pwr, Topology};

/// A controllable energy storage system as seen by the power engine.
///
/// Capability callbacks are read once per cycle and may change from one cycle
/// to the next (SoC evolves, temperature derates). Sign convention: positive
/// active power discharges, negative charges.
pub trait ManagedEss: Send + Sync {
    fn id(&self) -> &str;

    fn topology(&self) -> Topology;

    /// Lower power bound for the phase slot this cycle.
    fn min_power(&self, phase: Phase, pwr: Pwr) -> i32;

    /// Upper power bound for the phase slot this cycle.
    fn max_power(&self, phase: Phase, pwr: Pwr) -> i32;

    /// Rounding granularity of setpoints in W/var.
    fn power_precision(&self) -> i32 {
        1
    }

    /// A device that is not runnable is held at zero power.
    fn is_runnable(&self) -> bool {
        true
    }

    /// Maximum apparent power reported by the inverter, if any.
    fn max_apparent_power(&self) -> Option<i32> {
        None
    }

    /// State of charge in percent.
    fn soc(&self) -> Option<i32> {
        None
    }

    /// Usable capacity in Wh.
    fn capacity(&self) -> Option<i32> {
        None
    }

    /// Last measured active power.
    fn active_power(&self) -> Option<i32> {
        None
    }

    /// Hardware sink for symmetric devices.
    fn apply_power(&self, active: i32, reactive: i32) -> Result<()>;

    /// Hardware sink for asymmetric devices.
    ///
    /// The default spreads the totals onto the symmetric sink so that devices
    /// which only implement one entry point still receive a command.
    fn apply_power_per_phase(&self, setpoints: PhaseSetpoints) -> Result<()> {
        self.apply_power(setpoints.total_active(), setpoints.total_reactive())
    }
}

/// Per-phase setpoints handed to an asymmetric device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseSetpoints {
    pub active_l1: i32,
    pub reactive_l1: i32,
    pub active_l2: i32,
    pub reactive_l2: i32,
    pub active_l3: i32,
    pub reactive_l3: i32,
}

impl PhaseSetpoints {
    pub fn total_active(&self) -> i32 {
        self.active_l1 + self.active_l2 + self.active_l3
    }

    pub fn total_reactive(&self) -> i32 {
        self.reactive_l1 + self.reactive_l2 + self.reactive_l3
    }

    pub fn get(&self, phase: Phase, pwr: Pwr) -> i32 {
        match (phase, pwr) {
            (Phase::L1, Pwr::Active) => self.active_l1,
            (Phase::L1, Pwr::Reactive) => self.reactive_l1,
            (Phase::L2, Pwr::Active) => self.active_l2,
            (Phase::L2, Pwr::Reactive) => self.reactive_l2,
            (Phase::L3, Pwr::Active) => self.active_l3,
            (Phase::L3, Pwr::Reactive) => self.reactive_l3,
            (Phase::All, Pwr::Active) => self.total_active(),
            (Phase::All, Pwr::Reactive) => self.total_reactive(),
        }
    }

    pub fn set(&mut self, phase: Phase, pwr: Pwr, value: i32) {
        match (phase, pwr) {
            (Phase::L1, Pwr::Active) => self.active_l1 = value,
            (Phase::L1, Pwr::Reactive) => self.reactive_l1 = value,
            (Phase::L2, Pwr::Active) => self.active_l2 = value,
            (Phase::L2, Pwr::Reactive) => self.reactive_l2 = value,
            (Phase::L3, Pwr::Active) => self.active_l3 = value,
            (Phase::L3, Pwr::Reactive) => self.reactive_l3 = value,
            (Phase::All, _) => {}
        }
    }
}

impl fmt::Display for PhaseSetpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L1 {}W/{}var, L2 {}W/{}var, L3 {}W/{}var",
            self.active_l1, self.reactive_l1, self.active_l2, self.reactive_l2, self.active_l3, self.reactive_l3
        )
    }
}

/// Shared handle to a managed device.
pub type EssRef = Arc<dyn ManagedEss>;
