use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::device::{ManagedEss, PhaseSetpoints};
use super::types::{Phase, Pwr, Topology};

/// Static parameters of a simulated ESS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedEssConfig {
    pub id: String,
    #[serde(default = "default_topology")]
    pub topology: Topology,
    /// Usable capacity (Wh). `None` simulates a device that does not report it.
    #[serde(default)]
    pub capacity_wh: Option<i32>,
    #[serde(default)]
    pub initial_soc_percent: Option<f64>,
    /// Most negative active power (charge), W.
    pub max_charge_w: i32,
    /// Most positive active power (discharge), W.
    pub max_discharge_w: i32,
    #[serde(default)]
    pub max_apparent_power_va: Option<i32>,
    #[serde(default = "default_precision")]
    pub power_precision: i32,
}

fn default_topology() -> Topology {
    Topology::Symmetric
}

fn default_precision() -> i32 {
    1
}

/// A command received through one of the apply sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedCommand {
    Symmetric { active: i32, reactive: i32 },
    PerPhase(PhaseSetpoints),
}

#[derive(Debug)]
struct SimState {
    soc_percent: Option<f64>,
    active_power_w: i32,
    reactive_power_var: i32,
    runnable: bool,
    limit_override: Option<(i32, i32)>,
    applied: Vec<AppliedCommand>,
}

/// In-memory ESS that records every command and integrates its own SoC.
#[derive(Debug)]
pub struct SimulatedEss {
    cfg: SimulatedEssConfig,
    state: RwLock<SimState>,
}

impl SimulatedEss {
    pub fn new(cfg: SimulatedEssConfig) -> Self {
        let state = SimState {
            soc_percent: cfg.initial_soc_percent,
            active_power_w: 0,
            reactive_power_var: 0,
            runnable: true,
            limit_override: None,
            applied: Vec::new(),
        };
        Self {
            cfg,
            state: RwLock::new(state),
        }
    }

    /// Symmetric device with the given active power envelope and precision 1.
    pub fn symmetric(id: impl Into<String>, min_w: i32, max_w: i32) -> Self {
        Self::new(SimulatedEssConfig {
            id: id.into(),
            topology: Topology::Symmetric,
            capacity_wh: None,
            initial_soc_percent: None,
            max_charge_w: min_w,
            max_discharge_w: max_w,
            max_apparent_power_va: None,
            power_precision: 1,
        })
    }

    /// Asymmetric device with the given total active power envelope.
    pub fn asymmetric(id: impl Into<String>, min_w: i32, max_w: i32) -> Self {
        let mut ess = Self::symmetric(id, min_w, max_w);
        ess.cfg.topology = Topology::Asymmetric;
        ess
    }

    pub fn with_capacity(mut self, capacity_wh: Option<i32>, soc_percent: Option<f64>) -> Self {
        self.cfg.capacity_wh = capacity_wh;
        self.state.get_mut().soc_percent = soc_percent;
        self
    }

    pub fn with_max_apparent_power(mut self, va: i32) -> Self {
        self.cfg.max_apparent_power_va = Some(va);
        self
    }

    pub fn with_precision(mut self, precision: i32) -> Self {
        self.cfg.power_precision = precision;
        self
    }

    /// Replaces the reported active power envelope, even with `max < min`.
    pub fn set_active_limits(&self, min_w: i32, max_w: i32) {
        self.state.write().limit_override = Some((min_w, max_w));
    }

    pub fn set_runnable(&self, runnable: bool) {
        self.state.write().runnable = runnable;
    }

    pub fn set_soc(&self, soc_percent: Option<f64>) {
        self.state.write().soc_percent = soc_percent;
    }

    /// Overrides the measured active power.
    pub fn set_measured_active_power(&self, watts: i32) {
        self.state.write().active_power_w = watts;
    }

    pub fn applied(&self) -> Vec<AppliedCommand> {
        self.state.read().applied.clone()
    }

    pub fn last_applied(&self) -> Option<AppliedCommand> {
        self.state.read().applied.last().copied()
    }

    pub fn reactive_power(&self) -> i32 {
        self.state.read().reactive_power_var
    }

    /// Integrates SoC over `elapsed` at the last applied active power.
    pub fn advance(&self, elapsed: Duration) {
        let Some(capacity) = self.cfg.capacity_wh.filter(|c| *c > 0) else {
            return;
        };
        let mut state = self.state.write();
        if let Some(soc) = state.soc_percent {
            let energy_wh = state.active_power_w as f64 * elapsed.as_secs_f64() / 3600.0;
            let next = (soc - energy_wh / capacity as f64 * 100.0).clamp(0.0, 100.0);
            state.soc_percent = Some(next);
        }
    }

    fn active_envelope(&self) -> (i32, i32) {
        let state = self.state.read();
        if let Some(limits) = state.limit_override {
            return limits;
        }
        let mut min = self.cfg.max_charge_w;
        let mut max = self.cfg.max_discharge_w;
        match state.soc_percent {
            Some(soc) if soc <= 0.0 => max = max.min(0),
            Some(soc) if soc >= 100.0 => min = min.max(0),
            _ => {}
        }
        (min, max)
    }

    fn reactive_envelope(&self) -> (i32, i32) {
        let limit = self
            .cfg
            .max_apparent_power_va
            .unwrap_or_else(|| self.cfg.max_discharge_w.abs().max(self.cfg.max_charge_w.abs()));
        (-limit, limit)
    }

    fn record(&self, command: AppliedCommand, active: i32, reactive: i32) {
        let mut state = self.state.write();
        state.active_power_w = active;
        state.reactive_power_var = reactive;
        state.applied.push(command);
    }
}

impl ManagedEss for SimulatedEss {
    fn id(&self) -> &str {
        &self.cfg.id
    }

    fn topology(&self) -> Topology {
        self.cfg.topology
    }

    fn min_power(&self, phase: Phase, pwr: Pwr) -> i32 {
        let min = match pwr {
            Pwr::Active => self.active_envelope().0,
            Pwr::Reactive => self.reactive_envelope().0,
        };
        if phase.is_single() {
            min / 3
        } else {
            min
        }
    }

    fn max_power(&self, phase: Phase, pwr: Pwr) -> i32 {
        let max = match pwr {
            Pwr::Active => self.active_envelope().1,
            Pwr::Reactive => self.reactive_envelope().1,
        };
        if phase.is_single() {
            max / 3
        } else {
            max
        }
    }

    fn power_precision(&self) -> i32 {
        self.cfg.power_precision
    }

    fn is_runnable(&self) -> bool {
        self.state.read().runnable
    }

    fn max_apparent_power(&self) -> Option<i32> {
        self.cfg.max_apparent_power_va
    }

    fn soc(&self) -> Option<i32> {
        self.state.read().soc_percent.map(|soc| soc.round() as i32)
    }

    fn capacity(&self) -> Option<i32> {
        self.cfg.capacity_wh
    }

    fn active_power(&self) -> Option<i32> {
        Some(self.state.read().active_power_w)
    }

    fn apply_power(&self, active: i32, reactive: i32) -> Result<()> {
        debug!(ess = %self.cfg.id, active, reactive, "simulated ESS applying power");
        self.record(AppliedCommand::Symmetric { active, reactive }, active, reactive);
        Ok(())
    }

    fn apply_power_per_phase(&self, setpoints: PhaseSetpoints) -> Result<()> {
        debug!(ess = %self.cfg.id, %setpoints, "simulated ESS applying per-phase power");
        self.record(
            AppliedCommand::PerPhase(setpoints),
            setpoints.total_active(),
            setpoints.total_reactive(),
        );
        Ok(())
    }
}
