//! # Power Ramping
//!
//! Smooths the active power commanded to one ESS or cluster across cycles.
//! A PID step moves the setpoint towards the target, an optional rate limit
//! caps the change per second, and the result always stays inside the
//! envelope the device reports for the current cycle.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use validator::Validate;

use super::pid::PidFilter;
use crate::config::finite_non_negative;
use crate::domain::{ConstraintLifetime, Phase, Pwr, Relationship};
use crate::power::{CoefficientConstraint, EssPower, PowerError};

/// Ramp configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RampConfig {
    #[validate(custom(function = "finite_non_negative"))]
    pub p: f64,
    #[validate(custom(function = "finite_non_negative"))]
    pub i: f64,
    #[validate(custom(function = "finite_non_negative"))]
    pub d: f64,
    /// Maximum rate of power change in W/s. `None` disables the rate limit.
    #[validate(custom(function = "finite_non_negative"))]
    pub max_rate_w_per_s: Option<f64>,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            p: 0.3,
            i: 0.3,
            d: 0.1,
            max_rate_w_per_s: None,
        }
    }
}

/// Stateful ramp for a single ESS or cluster.
#[derive(Debug, Clone)]
pub struct RampLimiter {
    pid: PidFilter,
    max_rate_w_per_s: Option<f64>,
    last_output: Option<i32>,
}

impl RampLimiter {
    pub fn new(config: &RampConfig) -> Self {
        Self {
            pid: PidFilter::new(config.p, config.i, config.d),
            max_rate_w_per_s: config.max_rate_w_per_s,
            last_output: None,
        }
    }

    pub fn last_output(&self) -> Option<i32> {
        self.last_output
    }

    pub fn reset(&mut self) {
        self.pid.reset();
        self.last_output = None;
    }

    /// Next setpoint from the measured `input`, the requested `target` and the
    /// live `[min, max]` envelope. `max < min` collapses onto `min`.
    pub fn apply(&mut self, input: i32, target: i32, min: i32, max: i32, elapsed: Option<Duration>) -> i32 {
        self.pid.set_limits(Some(min), Some(max));
        let mut output = self.pid.apply(input, target);

        if let (Some(rate), Some(elapsed)) = (self.max_rate_w_per_s, elapsed) {
            let step = (rate * elapsed.as_secs_f64()).floor() as i64;
            let delta = (output as i64 - input as i64).clamp(-step, step);
            let (lower, upper) = self.pid.limits();
            let lower = lower.unwrap_or(i32::MIN) as i64;
            let upper = upper.unwrap_or(i32::MAX) as i64;
            output = (input as i64 + delta).clamp(lower, upper) as i32;
        }

        self.last_output = Some(output);
        output
    }

    /// Ramps `target` on `ess` and registers the result as this cycle's
    /// active power. Must be called after `begin_cycle()`.
    pub fn accept(
        &mut self,
        power: &mut EssPower,
        ess: &str,
        target: i32,
        elapsed: Option<Duration>,
    ) -> Result<CoefficientConstraint, PowerError> {
        let input = power
            .device(ess)
            .and_then(|d| d.active_power())
            .or(self.last_output)
            .unwrap_or(0);
        let min = power.min_power(ess, Phase::All, Pwr::Active);
        let max = power.max_power(ess, Phase::All, Pwr::Active);

        let output = self.apply(input, target, min, max, elapsed);
        debug!(ess, input, target, min, max, output, "ramped active power");

        power.set_active_power_and_solve(
            ess,
            Phase::All,
            ConstraintLifetime::Static,
            Relationship::Eq,
            output as f64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RampLimiter {
        RampLimiter::new(&RampConfig::default())
    }

    #[test]
    fn test_degenerate_envelope_clamps_to_min() {
        let mut ramp = limiter();
        let mut actual = 0;
        for target in [-100_000, 0, 5, 0] {
            actual = ramp.apply(actual, target, 5, 4, None);
            assert_eq!(actual, 5);
        }
    }

    #[test]
    fn test_converges_to_target() {
        let mut ramp = limiter();
        let mut actual = 0;
        let mut previous = 0;
        for _ in 0..40 {
            actual = ramp.apply(actual, 10_000, -10_000, 10_000, None);
            assert!(actual >= previous);
            previous = actual;
        }
        assert_eq!(actual, 10_000);
    }

    #[test]
    fn test_rate_limit_caps_step() {
        let mut ramp = RampLimiter::new(&RampConfig {
            max_rate_w_per_s: Some(500.0),
            ..RampConfig::default()
        });
        let out = ramp.apply(0, 10_000, -10_000, 10_000, Some(Duration::from_secs(2)));
        assert_eq!(out, 1000);
        let out = ramp.apply(out, 10_000, -10_000, 10_000, Some(Duration::from_secs(2)));
        assert_eq!(out, 2000);
    }

    #[test]
    fn test_rate_limit_ignored_without_elapsed() {
        let mut ramp = RampLimiter::new(&RampConfig {
            max_rate_w_per_s: Some(1.0),
            ..RampConfig::default()
        });
        assert_eq!(ramp.apply(0, 10_000, -10_000, 10_000, None), 3000);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut ramp = limiter();
        ramp.apply(0, 10_000, -10_000, 10_000, None);
        assert_eq!(ramp.last_output(), Some(3000));
        ramp.reset();
        assert_eq!(ramp.last_output(), None);
        assert_eq!(ramp.apply(0, 10_000, -10_000, 10_000, None), 3000);
    }
}
