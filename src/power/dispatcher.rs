use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{EssRef, Phase, PhaseSetpoints, Pwr, Topology};

use super::constraints::{ApparentLimit, VariableBound};
use super::error::PowerError;
use super::solver::Solution;
use super::variables::VariableSpace;

/// How solved values are snapped onto a device's precision grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Nearest multiple of the precision.
    #[default]
    Nearest,
    /// Rounds away from zero when the SoC favours the direction (discharge
    /// above 50 %, charge below 50 %), towards zero otherwise.
    SocAware,
}

/// What was sent to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setpoint {
    Symmetric { active: i32, reactive: i32 },
    PerPhase(PhaseSetpoints),
}

impl Setpoint {
    pub fn active(&self) -> i32 {
        match self {
            Setpoint::Symmetric { active, .. } => *active,
            Setpoint::PerPhase(s) => s.total_active(),
        }
    }

    pub fn reactive(&self) -> i32 {
        match self {
            Setpoint::Symmetric { reactive, .. } => *reactive,
            Setpoint::PerPhase(s) => s.total_reactive(),
        }
    }
}

/// Outcome of dispatching one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDispatch {
    pub ess: String,
    pub setpoint: Setpoint,
    /// Error reported by the device's apply sink.
    pub apply_error: Option<String>,
}

/// Turns a [`Solution`] into device commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    rounding: RoundingMode,
}

impl Dispatcher {
    pub fn new(rounding: RoundingMode) -> Self {
        Self { rounding }
    }

    /// Rounds and applies the solution, calling each device's sink once.
    pub fn apply(
        &self,
        vars: &VariableSpace,
        devices: &[EssRef],
        bounds: &[VariableBound],
        apparent: &[ApparentLimit],
        solution: Solution,
    ) -> Result<Vec<DeviceDispatch>, PowerError> {
        let mut dispatched = Vec::with_capacity(devices.len());
        for ess in devices {
            let setpoint = self.setpoint_for(vars, ess, bounds, apparent, &solution)?;
            dispatched.push(send(ess, setpoint));
        }
        Ok(dispatched)
    }

    /// Holds every device at zero power.
    pub fn apply_zero(&self, devices: &[EssRef]) -> Vec<DeviceDispatch> {
        devices
            .iter()
            .map(|ess| {
                let setpoint = match ess.topology() {
                    Topology::Symmetric => Setpoint::Symmetric { active: 0, reactive: 0 },
                    Topology::Asymmetric => Setpoint::PerPhase(PhaseSetpoints::default()),
                };
                send(ess, setpoint)
            })
            .collect()
    }

    fn setpoint_for(
        &self,
        vars: &VariableSpace,
        ess: &EssRef,
        bounds: &[VariableBound],
        apparent: &[ApparentLimit],
        solution: &Solution,
    ) -> Result<Setpoint, PowerError> {
        let id = ess.id();
        let precision = ess.power_precision().max(1);
        let soc = ess.soc();

        let range_of = |phase: Phase, pwr: Pwr| -> Result<Range, PowerError> {
            let index = vars.index_of(id, phase, pwr)?;
            Ok(bounds.iter().find(|b| b.index == index).map(|b| (b.min, b.max)))
        };
        let value_of = |phase: Phase, pwr: Pwr| -> Result<i32, PowerError> {
            let index = vars.index_of(id, phase, pwr)?;
            let rounded = round_to_precision(solution.get(index), precision, self.rounding, soc);
            Ok(match range_of(phase, pwr)? {
                Some((min, max)) => clamp_to_grid(rounded, min, max, precision),
                None => rounded,
            })
        };

        match ess.topology() {
            Topology::Symmetric => {
                let mut active = value_of(Phase::All, Pwr::Active)?;
                let mut reactive = value_of(Phase::All, Pwr::Reactive)?;
                if let Some(limit) = find_limit(apparent, id, Phase::All) {
                    let ranges = (range_of(Phase::All, Pwr::Active)?, range_of(Phase::All, Pwr::Reactive)?);
                    (active, reactive) = fit_into_circle(active, reactive, limit, precision, ranges);
                }
                Ok(Setpoint::Symmetric { active, reactive })
            }
            Topology::Asymmetric => {
                let mut setpoints = PhaseSetpoints::default();
                let mut ranges = Vec::with_capacity(Phase::SINGLE.len());
                for phase in Phase::SINGLE {
                    let mut active = value_of(phase, Pwr::Active)?;
                    let mut reactive = value_of(phase, Pwr::Reactive)?;
                    let phase_ranges = (range_of(phase, Pwr::Active)?, range_of(phase, Pwr::Reactive)?);
                    if let Some(limit) = find_limit(apparent, id, phase) {
                        (active, reactive) = fit_into_circle(active, reactive, limit, precision, phase_ranges);
                    }
                    setpoints.set(phase, Pwr::Active, active);
                    setpoints.set(phase, Pwr::Reactive, reactive);
                    ranges.push((phase, phase_ranges));
                }
                if let Some(limit) = find_limit(apparent, id, Phase::All) {
                    let reactive_range = |phase: Phase| {
                        ranges
                            .iter()
                            .find(|(p, _)| *p == phase)
                            .and_then(|(_, (_, reactive))| *reactive)
                    };
                    fit_total_into_circle(&mut setpoints, limit, precision, reactive_range);
                }
                Ok(Setpoint::PerPhase(setpoints))
            }
        }
    }
}

/// Live `[min, max]` of a variable, `None` when unbounded.
type Range = Option<(f64, f64)>;

fn within(value: i32, range: Range) -> bool {
    match range {
        Some((min, max)) => (value as f64) >= min && (value as f64) <= max,
        None => true,
    }
}

fn send(ess: &EssRef, setpoint: Setpoint) -> DeviceDispatch {
    let result = match &setpoint {
        Setpoint::Symmetric { active, reactive } => ess.apply_power(*active, *reactive),
        Setpoint::PerPhase(setpoints) => ess.apply_power_per_phase(*setpoints),
    };
    let apply_error = match result {
        Ok(()) => {
            debug!(ess = ess.id(), ?setpoint, "applied power");
            None
        }
        Err(err) => {
            warn!(ess = ess.id(), ?setpoint, error = %err, "ESS rejected power setpoint");
            Some(err.to_string())
        }
    };
    DeviceDispatch {
        ess: ess.id().to_string(),
        setpoint,
        apply_error,
    }
}

fn find_limit(apparent: &[ApparentLimit], id: &str, phase: Phase) -> Option<f64> {
    apparent
        .iter()
        .find(|l| l.ess == id && l.phase == phase)
        .map(|l| l.value)
}

/// Snaps `value` onto multiples of `precision`.
pub fn round_to_precision(value: f64, precision: i32, mode: RoundingMode, soc: Option<i32>) -> i32 {
    let step = precision.max(1) as f64;
    let mut scaled = value / step;
    // solver noise such as 499.9999999
    if (scaled - scaled.round()).abs() < 1e-6 {
        scaled = scaled.round();
    }
    let steps = match mode {
        RoundingMode::Nearest => scaled.round(),
        RoundingMode::SocAware => {
            let away_from_zero = match soc {
                Some(soc) => (value > 0.0 && soc > 50) || (value < 0.0 && soc < 50),
                None => false,
            };
            if !away_from_zero {
                scaled.trunc()
            } else if scaled > 0.0 {
                scaled.ceil()
            } else {
                scaled.floor()
            }
        }
    };
    (steps * step) as i32
}

/// Moves a rounded value back inside `[min, max]`, staying on the grid when
/// the grid has a point inside the interval.
fn clamp_to_grid(value: i32, min: f64, max: f64, precision: i32) -> i32 {
    let step = precision as f64;
    let v = value as f64;
    if v > max {
        let snapped = (max / step).floor() * step;
        if snapped >= min {
            return snapped as i32;
        }
        return max as i32;
    }
    if v < min {
        let snapped = (min / step).ceil() * step;
        if snapped <= max {
            return snapped as i32;
        }
        return min as i32;
    }
    value
}

fn truncate_to_grid(value: f64, precision: i32) -> i32 {
    let step = precision as f64;
    ((value / step).trunc() * step) as i32
}

fn exceeds(active: i32, reactive: i32, limit: f64) -> bool {
    (active as f64).hypot(reactive as f64) > limit.max(0.0)
}

/// Fits `(active, reactive)` into the circle without leaving the variable
/// ranges. Scales towards zero when that stays in range, otherwise holds the
/// active value in its range and takes the excess out of reactive power.
fn fit_into_circle(active: i32, reactive: i32, limit: f64, precision: i32, ranges: (Range, Range)) -> (i32, i32) {
    if !exceeds(active, reactive, limit) {
        return (active, reactive);
    }
    let (active_range, reactive_range) = ranges;
    let limit = limit.max(0.0);
    let scale = limit / (active as f64).hypot(reactive as f64);
    let scaled = (
        truncate_to_grid(active as f64 * scale, precision),
        truncate_to_grid(reactive as f64 * scale, precision),
    );
    let scaled_fits = !exceeds(scaled.0, scaled.1, limit);
    if scaled_fits && within(scaled.0, active_range) && within(scaled.1, reactive_range) {
        return scaled;
    }

    if let Some(p) = active_inside_circle(active, limit, precision, active_range) {
        let headroom = (limit * limit - (p as f64).powi(2)).max(0.0).sqrt();
        let q = reactive.signum() * truncate_to_grid(headroom.min(reactive.abs() as f64), precision);
        if !exceeds(p, q, limit) && within(q, reactive_range) {
            return (p, q);
        }
    }

    if scaled_fits {
        // no point inside both the circle and the ranges
        return scaled;
    }
    (0, 0)
}

/// `active`, or the value of its range nearest to it that the circle admits.
fn active_inside_circle(active: i32, limit: f64, precision: i32, range: Range) -> Option<i32> {
    if (active as f64).abs() <= limit {
        return Some(active);
    }
    let mut candidate = active.signum() * truncate_to_grid(limit, precision);
    if let Some((min, max)) = range {
        candidate = candidate.clamp(min.ceil() as i32, max.floor() as i32);
    }
    ((candidate as f64).abs() <= limit).then_some(candidate)
}

/// Fits the phase totals into the circle. Reactive power is reduced first
/// with the active values left untouched, then every value is shrunk.
fn fit_total_into_circle(
    setpoints: &mut PhaseSetpoints,
    limit: f64,
    precision: i32,
    reactive_range: impl Fn(Phase) -> Range,
) {
    if !exceeds(setpoints.total_active(), setpoints.total_reactive(), limit) {
        return;
    }
    let limit = limit.max(0.0);

    let total_active = setpoints.total_active() as f64;
    let total_reactive = setpoints.total_reactive() as f64;
    if total_active.abs() <= limit && total_reactive != 0.0 {
        let factor = (limit * limit - total_active * total_active).max(0.0).sqrt() / total_reactive.abs();
        let mut candidate = *setpoints;
        for phase in Phase::SINGLE {
            let value = candidate.get(phase, Pwr::Reactive) as f64 * factor.min(1.0);
            candidate.set(phase, Pwr::Reactive, truncate_to_grid(value, precision));
        }
        let in_range = Phase::SINGLE
            .iter()
            .all(|phase| within(candidate.get(*phase, Pwr::Reactive), reactive_range(*phase)));
        if in_range && !exceeds(candidate.total_active(), candidate.total_reactive(), limit) {
            *setpoints = candidate;
            return;
        }
    }

    let mut shrink = 1.0;
    for _ in 0..8 {
        if !exceeds(setpoints.total_active(), setpoints.total_reactive(), limit) {
            return;
        }
        let total = (setpoints.total_active() as f64).hypot(setpoints.total_reactive() as f64);
        shrink *= limit / total;
        for phase in Phase::SINGLE {
            for pwr in [Pwr::Active, Pwr::Reactive] {
                let value = setpoints.get(phase, pwr) as f64 * shrink;
                setpoints.set(phase, pwr, truncate_to_grid(value, precision));
            }
        }
        shrink = 0.999;
    }
    if exceeds(setpoints.total_active(), setpoints.total_reactive(), limit) {
        *setpoints = PhaseSetpoints::default();
    }
}
