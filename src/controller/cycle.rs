use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ramp::{RampConfig, RampLimiter};
use crate::domain::{ConstraintLifetime, Phase, Relationship};
use crate::power::{CycleReport, EssPower, PowerError};

/// A participant of the control cycle.
///
/// Controllers run after the device bounds are seeded and before the cycle is
/// solved. Anything they add with a static lifetime is gone next cycle.
pub trait Controller: Send {
    fn id(&self) -> &str;

    fn run(&mut self, power: &mut EssPower, elapsed: Option<Duration>) -> Result<(), PowerError>;
}

/// Run status of one controller
#[derive(Debug, Clone, Default)]
pub struct ControllerStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Drives `begin_cycle()`, the controllers in order, then `apply_power()`.
#[derive(Default)]
pub struct CycleRunner {
    controllers: Vec<Box<dyn Controller>>,
    status: HashMap<String, ControllerStatus>,
}

impl CycleRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_controller(&mut self, controller: Box<dyn Controller>) {
        self.status.insert(controller.id().to_string(), ControllerStatus::default());
        self.controllers.push(controller);
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn status(&self, id: &str) -> Option<&ControllerStatus> {
        self.status.get(id)
    }

    /// Runs one full cycle. A failing controller is logged and skipped, the
    /// cycle still solves with whatever the others registered.
    pub fn run_cycle(&mut self, power: &mut EssPower, elapsed: Option<Duration>) -> Result<CycleReport, PowerError> {
        power.begin_cycle()?;

        for controller in &mut self.controllers {
            let now = Utc::now();
            let result = controller.run(power, elapsed);
            let status = self.status.entry(controller.id().to_string()).or_default();
            status.last_run = Some(now);
            status.run_count += 1;
            match result {
                Ok(()) => {
                    status.last_success = Some(now);
                    status.success_count += 1;
                    status.last_error = None;
                }
                Err(e) => {
                    warn!(controller = controller.id(), error = %e, "controller failed");
                    status.error_count += 1;
                    status.last_error = Some(e.to_string());
                }
            }
        }

        let report = power.apply_power();
        if report.is_degraded() {
            warn!(cycle = report.cycle, failures = report.failures().count(), "cycle degraded");
        } else {
            debug!(cycle = report.cycle, "cycle completed");
        }
        Ok(report)
    }
}

/// Holds an ESS or cluster at a fixed setpoint, optionally ramped.
pub struct SetpointController {
    id: String,
    target: String,
    active_power_w: i32,
    reactive_power_var: Option<i32>,
    ramp: Option<RampLimiter>,
}

impl SetpointController {
    pub fn new(target: impl Into<String>, active_power_w: i32) -> Self {
        let target = target.into();
        Self {
            id: format!("setpoint:{target}"),
            target,
            active_power_w,
            reactive_power_var: None,
            ramp: None,
        }
    }

    pub fn with_reactive_power(mut self, var: i32) -> Self {
        self.reactive_power_var = Some(var);
        self
    }

    pub fn ramped(mut self, config: &RampConfig) -> Self {
        self.ramp = Some(RampLimiter::new(config));
        self
    }

    pub fn set_active_power(&mut self, watts: i32) {
        if watts != self.active_power_w {
            info!(ess = %self.target, from = self.active_power_w, to = watts, "setpoint changed");
        }
        self.active_power_w = watts;
    }
}

impl Controller for SetpointController {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, power: &mut EssPower, elapsed: Option<Duration>) -> Result<(), PowerError> {
        match &mut self.ramp {
            Some(ramp) => {
                ramp.accept(power, &self.target, self.active_power_w, elapsed)?;
            }
            None => {
                power.set_active_power_and_solve(
                    &self.target,
                    Phase::All,
                    ConstraintLifetime::Static,
                    Relationship::Eq,
                    self.active_power_w as f64,
                )?;
            }
        }
        if let Some(var) = self.reactive_power_var {
            power.set_reactive_power_and_solve(
                &self.target,
                Phase::All,
                ConstraintLifetime::Static,
                Relationship::Eq,
                var as f64,
            )?;
        }
        Ok(())
    }
}
