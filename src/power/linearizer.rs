//! Inscribed polygon approximation of the apparent power circle.
//!
//! `sqrt(P² + Q²) <= S` is replaced by `n` half-planes
//! `cos(θk)·P + sin(θk)·Q <= S·cos(π/n)` with `θk = (2k+1)π/n`. The polygon's
//! vertices lie on the circle at `2πk/n`, so every admitted point is inside
//! it and pure active or pure reactive power can still reach `S`.

use std::f64::consts::PI;

use crate::domain::{Phase, Pwr, Relationship};

use super::constraints::CoefficientConstraint;
use super::error::PowerError;
use super::variables::VariableSpace;

pub const DEFAULT_FACETS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApparentPowerLinearizer {
    facets: usize,
}

impl Default for ApparentPowerLinearizer {
    fn default() -> Self {
        Self::new(DEFAULT_FACETS)
    }
}

impl ApparentPowerLinearizer {
    /// Fewer than 4 facets would not bound both axes, so the count is raised to 4.
    pub fn new(facets: usize) -> Self {
        Self {
            facets: facets.max(4),
        }
    }

    pub fn facets(&self) -> usize {
        self.facets
    }

    /// Half-planes limiting `(phase)` of `id` to `max_apparent_power`.
    ///
    /// For an asymmetric device `Phase::All` limits the sum over its phases.
    /// A negative limit is treated as zero.
    pub fn limit(
        &self,
        vars: &VariableSpace,
        id: &str,
        phase: Phase,
        max_apparent_power: f64,
    ) -> Result<Vec<CoefficientConstraint>, PowerError> {
        let active = vars.indices_for(id, phase, Pwr::Active)?;
        let reactive = vars.indices_for(id, phase, Pwr::Reactive)?;
        let radius = max_apparent_power.max(0.0);
        let apothem = radius * (PI / self.facets as f64).cos();

        let constraints = (0..self.facets)
            .map(|k| {
                let theta = (2 * k + 1) as f64 * PI / self.facets as f64;
                let (sin, cos) = theta.sin_cos();
                let mut coefficients = vars.zero_coefficients();
                for &i in &active {
                    coefficients[i] = snap(cos);
                }
                for &i in &reactive {
                    coefficients[i] = snap(sin);
                }
                CoefficientConstraint::new(
                    format!("[{id}] apparent power {phase} <= {radius}VA (facet {k})"),
                    coefficients,
                    Relationship::Leq,
                    apothem,
                )
            })
            .collect();
        Ok(constraints)
    }
}

/// Removes floating point noise such as `cos(π/2) = 6e-17`.
fn snap(value: f64) -> f64 {
    if value.abs() < 1e-12 {
        0.0
    } else {
        value
    }
}
