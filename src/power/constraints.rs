use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{ConstraintLifetime, EssCluster, EssRef, Phase, Pwr, Relationship, Topology};

use super::error::PowerError;
use super::linearizer::ApparentPowerLinearizer;
use super::variables::VariableSpace;

/// A requirement on one `(phase, pwr)` of an ESS or cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub description: String,
    /// ESS or cluster id.
    pub target: String,
    pub phase: Phase,
    pub pwr: Pwr,
    pub relationship: Relationship,
    pub value: f64,
    pub lifetime: ConstraintLifetime,
}

impl Constraint {
    pub fn new(
        target: impl Into<String>,
        phase: Phase,
        pwr: Pwr,
        relationship: Relationship,
        value: f64,
        lifetime: ConstraintLifetime,
    ) -> Self {
        let target = target.into();
        Self {
            description: format!("[{target}] {pwr} {phase} {relationship} {value}"),
            target,
            phase,
            pwr,
            relationship,
            value,
            lifetime,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Identity of a caller constraint inside a [`ConstraintStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintId(u64);

/// Compiled linear form `Σ cᵢ·xᵢ <rel> value` over the full variable vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientConstraint {
    id: Option<ConstraintId>,
    description: String,
    coefficients: Vec<f64>,
    relationship: Relationship,
    value: f64,
}

impl CoefficientConstraint {
    pub fn new(description: impl Into<String>, coefficients: Vec<f64>, relationship: Relationship, value: f64) -> Self {
        Self {
            id: None,
            description: description.into(),
            coefficients,
            relationship,
            value,
        }
    }

    pub fn id(&self) -> Option<ConstraintId> {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn no_of_coefficients(&self) -> usize {
        self.coefficients.len()
    }

    pub fn relationship(&self) -> Relationship {
        self.relationship
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn non_zero_indices(&self) -> Vec<usize> {
        self.coefficients
            .iter()
            .positions(|c| *c != 0.0)
            .collect()
    }

    /// Exactly one coefficient, of magnitude one.
    pub fn is_single_coefficient(&self) -> bool {
        let non_zero = self.non_zero_indices();
        non_zero.len() == 1 && self.coefficients[non_zero[0]].abs() == 1.0
    }

    pub fn evaluate(&self, values: &[f64]) -> f64 {
        self.coefficients
            .iter()
            .zip(values)
            .map(|(c, x)| c * x)
            .sum()
    }

    pub fn is_satisfied_by(&self, values: &[f64], tolerance: f64) -> bool {
        self.relationship.holds(self.evaluate(values), self.value, tolerance)
    }
}

impl fmt::Display for CoefficientConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms = self
            .coefficients
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0.0)
            .map(|(i, c)| format!("{c}*x{i}"))
            .join(" + ");
        write!(f, "{}: {} {} {}", self.description, terms, self.relationship, self.value)
    }
}

/// Live envelope of one decision variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariableBound {
    pub index: usize,
    pub min: f64,
    pub max: f64,
}

/// Apparent power limit in force on an `(ess, phase)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApparentLimit {
    pub ess: String,
    pub phase: Phase,
    pub value: f64,
}

/// Objective hints: variable index to desired value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetHints {
    hints: BTreeMap<usize, (u8, f64)>,
}

impl TargetHints {
    /// Keeps the hint with the higher rank. On equal rank the later one wins.
    pub fn insert(&mut self, index: usize, rank: u8, value: f64) {
        match self.hints.get(&index) {
            Some((existing, _)) if *existing > rank => {}
            _ => {
                self.hints.insert(index, (rank, value));
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.hints.get(&index).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.hints.iter().map(|(i, (_, v))| (*i, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

/// How a cluster target is shared out among the members' hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStrategy {
    /// Every member gets the same share.
    #[default]
    Equal,
    /// Active power shares follow each member's SoC headroom in the
    /// requested direction: SoC when discharging, 100 - SoC when charging.
    /// Falls back to equal shares when a member has no SoC.
    SocWeighted,
}

// Hint ranks, most specific wins.
const RANK_CLUSTER: u8 = 1;
const RANK_DEVICE_TOTAL: u8 = 2;
const RANK_PHASE_SLOT: u8 = 3;

#[derive(Debug, Clone)]
struct Entry {
    source: Constraint,
    compiled: CoefficientConstraint,
}

/// Linear constraints of one independently solved group of devices.
#[derive(Debug, Clone, Default)]
pub struct ConstraintStore {
    clusters: Vec<EssCluster>,
    bounds: Vec<CoefficientConstraint>,
    variable_bounds: Vec<VariableBound>,
    device_apparent: Vec<(ApparentLimit, Vec<CoefficientConstraint>)>,
    caller_apparent: Vec<(ApparentLimit, Vec<CoefficientConstraint>)>,
    persistent: Vec<Entry>,
    cycle: Vec<Entry>,
    soft_targets: Vec<Constraint>,
    strategy: ClusterStrategy,
    // SoC per runnable device as of the last seed, `None` when unknown
    socs: BTreeMap<String, Option<i32>>,
    next_id: u64,
}

impl ConstraintStore {
    pub fn new(clusters: Vec<EssCluster>) -> Self {
        Self {
            clusters,
            ..Self::default()
        }
    }

    pub fn with_cluster_strategy(mut self, strategy: ClusterStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn clusters(&self) -> &[EssCluster] {
        &self.clusters
    }

    pub fn knows(&self, vars: &VariableSpace, target: &str) -> bool {
        vars.contains(target) || self.cluster(target).is_some()
    }

    /// Rebuilds the device bound constraints from the devices' live state.
    pub fn seed(&mut self, vars: &VariableSpace, devices: &[EssRef], linearizer: &ApparentPowerLinearizer) -> Result<(), PowerError> {
        self.bounds.clear();
        self.variable_bounds.clear();
        self.device_apparent.clear();
        self.socs.clear();

        for ess in devices {
            let id = ess.id();
            let topology = vars.topology_of(id)?;

            if !ess.is_runnable() {
                debug!(ess = id, "ESS not runnable, holding zero power");
                for phase in topology.phases() {
                    for pwr in [Pwr::Active, Pwr::Reactive] {
                        let index = vars.index_of(id, *phase, pwr)?;
                        let mut coefficients = vars.zero_coefficients();
                        coefficients[index] = 1.0;
                        self.bounds.push(CoefficientConstraint::new(
                            format!("[{id}] not runnable: {pwr} {phase} = 0"),
                            coefficients,
                            Relationship::Eq,
                            0.0,
                        ));
                        self.variable_bounds.push(VariableBound { index, min: 0.0, max: 0.0 });
                    }
                }
                continue;
            }
            self.socs.insert(id.to_string(), ess.soc());

            for phase in topology.phases() {
                for pwr in [Pwr::Active, Pwr::Reactive] {
                    let index = vars.index_of(id, *phase, pwr)?;
                    let (min, max) = envelope(ess, *phase, pwr);
                    self.push_bounds(vars, id, *phase, pwr, &[index], min, max);
                    self.variable_bounds.push(VariableBound { index, min, max });
                }
            }

            if topology == Topology::Asymmetric {
                for pwr in [Pwr::Active, Pwr::Reactive] {
                    let indices = vars.indices_for(id, Phase::All, pwr)?;
                    let (min, max) = envelope(ess, Phase::All, pwr);
                    self.push_bounds(vars, id, Phase::All, pwr, &indices, min, max);
                }
            }

            if let Some(apparent) = ess.max_apparent_power() {
                let limit = ApparentLimit {
                    ess: id.to_string(),
                    phase: Phase::All,
                    value: apparent as f64,
                };
                let constraints = linearizer.limit(vars, id, Phase::All, limit.value)?;
                self.device_apparent.push((limit, constraints));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn push_bounds(&mut self, vars: &VariableSpace, id: &str, phase: Phase, pwr: Pwr, indices: &[usize], min: f64, max: f64) {
        let mut coefficients = vars.zero_coefficients();
        for &i in indices {
            coefficients[i] = 1.0;
        }
        self.bounds.push(CoefficientConstraint::new(
            format!("[{id}] min {pwr} {phase}"),
            coefficients.clone(),
            Relationship::Geq,
            min,
        ));
        self.bounds.push(CoefficientConstraint::new(
            format!("[{id}] max {pwr} {phase}"),
            coefficients,
            Relationship::Leq,
            max,
        ));
    }

    /// Compiles a caller constraint without storing it.
    pub fn compile(&self, vars: &VariableSpace, constraint: &Constraint) -> Result<CoefficientConstraint, PowerError> {
        if !constraint.value.is_finite() {
            return Err(PowerError::InvalidConstraint(format!(
                "{}: value {} is not finite",
                constraint.description, constraint.value
            )));
        }
        let coefficients = self.coefficients_for(vars, &constraint.target, constraint.phase, constraint.pwr)?;
        Ok(CoefficientConstraint::new(
            constraint.description.clone(),
            coefficients,
            constraint.relationship,
            constraint.value,
        ))
    }

    /// Compiles and stores a caller constraint.
    pub fn add(&mut self, vars: &VariableSpace, constraint: Constraint) -> Result<CoefficientConstraint, PowerError> {
        let mut compiled = self.compile(vars, &constraint)?;
        self.next_id += 1;
        compiled.id = Some(ConstraintId(self.next_id));
        debug!(constraint = %compiled, lifetime = %constraint.lifetime, "adding constraint");
        let entry = Entry {
            source: constraint,
            compiled: compiled.clone(),
        };
        match entry.source.lifetime {
            ConstraintLifetime::Static => self.cycle.push(entry),
            ConstraintLifetime::Persistent => self.persistent.push(entry),
        }
        Ok(compiled)
    }

    /// Removes a stored caller constraint. Returns whether it was found.
    pub fn remove(&mut self, id: ConstraintId) -> bool {
        let before = self.persistent.len() + self.cycle.len();
        self.persistent.retain(|e| e.compiled.id != Some(id));
        self.cycle.retain(|e| e.compiled.id != Some(id));
        before != self.persistent.len() + self.cycle.len()
    }

    /// Registers an objective hint that does not constrain feasibility.
    pub fn add_soft_target(&mut self, vars: &VariableSpace, target: Constraint) -> Result<(), PowerError> {
        self.coefficients_for(vars, &target.target, target.phase, target.pwr)?;
        self.soft_targets.push(target);
        Ok(())
    }

    /// Replaces the caller apparent power limit of `(ess, phase)`.
    pub fn set_apparent_limit(
        &mut self,
        vars: &VariableSpace,
        linearizer: &ApparentPowerLinearizer,
        ess: &str,
        phase: Phase,
        value: f64,
    ) -> Result<Vec<CoefficientConstraint>, PowerError> {
        if !value.is_finite() {
            return Err(PowerError::InvalidConstraint(format!("[{ess}] apparent power {value} is not finite")));
        }
        let constraints = linearizer.limit(vars, ess, phase, value)?;
        self.caller_apparent.retain(|(limit, _)| !(limit.ess == ess && limit.phase == phase));
        self.caller_apparent.push((
            ApparentLimit {
                ess: ess.to_string(),
                phase,
                value,
            },
            constraints.clone(),
        ));
        Ok(constraints)
    }

    /// Removes the caller apparent power limit of `(ess, phase)`. The device's
    /// own rating stays in force. Returns whether a limit was set.
    pub fn clear_apparent_limit(&mut self, ess: &str, phase: Phase) -> bool {
        let before = self.caller_apparent.len();
        self.caller_apparent.retain(|(limit, _)| !(limit.ess == ess && limit.phase == phase));
        before != self.caller_apparent.len()
    }

    /// Drops every static constraint and soft target.
    pub fn clear_static(&mut self) {
        self.cycle.clear();
        self.soft_targets.clear();
    }

    pub fn all(&self) -> Vec<&CoefficientConstraint> {
        self.bounds
            .iter()
            .chain(self.device_apparent.iter().flat_map(|(_, c)| c.iter()))
            .chain(self.caller_apparent.iter().flat_map(|(_, c)| c.iter()))
            .chain(self.persistent.iter().map(|e| &e.compiled))
            .chain(self.cycle.iter().map(|e| &e.compiled))
            .collect()
    }

    pub fn static_count(&self) -> usize {
        self.cycle.len()
    }

    pub fn variable_bounds(&self) -> &[VariableBound] {
        &self.variable_bounds
    }

    /// Tightest apparent limit per `(ess, phase)`.
    pub fn apparent_limits(&self) -> Vec<ApparentLimit> {
        let mut limits: Vec<ApparentLimit> = Vec::new();
        for (limit, _) in self.device_apparent.iter().chain(self.caller_apparent.iter()) {
            match limits.iter_mut().find(|l| l.ess == limit.ess && l.phase == limit.phase) {
                Some(existing) => existing.value = existing.value.min(limit.value),
                None => limits.push(limit.clone()),
            }
        }
        limits
    }

    /// Objective hints derived from EQ constraints and soft targets.
    pub fn target_hints(&self, vars: &VariableSpace) -> TargetHints {
        let mut hints = TargetHints::default();
        let eq_constraints = self
            .persistent
            .iter()
            .chain(self.cycle.iter())
            .map(|e| &e.source)
            .filter(|c| c.relationship == Relationship::Eq);
        for target in eq_constraints.chain(self.soft_targets.iter()) {
            self.spread_hint(vars, &mut hints, target);
        }
        hints
    }

    fn spread_hint(&self, vars: &VariableSpace, hints: &mut TargetHints, target: &Constraint) {
        if vars.contains(&target.target) {
            self.device_hint(vars, hints, &target.target, target.phase, target.pwr, target.value, false);
        } else if let Some(cluster) = self.cluster(&target.target) {
            let weights = self.member_weights(cluster, target.pwr, target.value);
            let total: f64 = weights.iter().sum();
            for (member, weight) in cluster.members().iter().zip(&weights) {
                let share = target.value * weight / total;
                self.device_hint(vars, hints, member, target.phase, target.pwr, share, true);
            }
        }
    }

    /// Relative share of each cluster member, never all zero.
    fn member_weights(&self, cluster: &EssCluster, pwr: Pwr, value: f64) -> Vec<f64> {
        let equal = vec![1.0; cluster.members().len()];
        if self.strategy == ClusterStrategy::Equal || pwr != Pwr::Active || value == 0.0 {
            return equal;
        }
        let weights: Option<Vec<f64>> = cluster
            .members()
            .iter()
            .map(|member| match self.socs.get(member) {
                // not runnable, takes no share
                None => Some(0.0),
                Some(soc) => soc.map(|soc| {
                    let soc = soc.clamp(0, 100) as f64;
                    if value > 0.0 {
                        soc
                    } else {
                        100.0 - soc
                    }
                }),
            })
            .collect();
        match weights {
            Some(weights) if weights.iter().sum::<f64>() > 0.0 => weights,
            _ => equal,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn device_hint(
        &self,
        vars: &VariableSpace,
        hints: &mut TargetHints,
        id: &str,
        phase: Phase,
        pwr: Pwr,
        value: f64,
        from_cluster: bool,
    ) {
        let Ok(topology) = vars.topology_of(id) else {
            return;
        };
        let (indices, per_index, rank) = match (topology, phase) {
            (Topology::Symmetric, Phase::All) => (vars.indices_for(id, phase, pwr), value, RANK_PHASE_SLOT),
            (Topology::Symmetric, _) => (vars.indices_for(id, Phase::All, pwr), value * 3.0, RANK_CLUSTER),
            (Topology::Asymmetric, Phase::All) => (vars.indices_for(id, phase, pwr), value / 3.0, RANK_DEVICE_TOTAL),
            (Topology::Asymmetric, _) => (vars.indices_for(id, phase, pwr), value, RANK_PHASE_SLOT),
        };
        let rank = if from_cluster { RANK_CLUSTER } else { rank };
        if let Ok(indices) = indices {
            for index in indices {
                hints.insert(index, rank, per_index);
            }
        }
    }

    fn coefficients_for(&self, vars: &VariableSpace, target: &str, phase: Phase, pwr: Pwr) -> Result<Vec<f64>, PowerError> {
        let mut coefficients = vars.zero_coefficients();
        if vars.contains(target) {
            for index in vars.indices_for(target, phase, pwr)? {
                coefficients[index] = 1.0;
            }
            return Ok(coefficients);
        }

        let cluster = self
            .cluster(target)
            .ok_or_else(|| PowerError::UnknownDevice(target.to_string()))?;
        for member in cluster.members() {
            match (vars.topology_of(member)?, phase.is_single()) {
                (Topology::Symmetric, true) => {
                    let index = vars.index_of(member, Phase::All, pwr)?;
                    coefficients[index] += 1.0 / 3.0;
                }
                _ => {
                    for index in vars.indices_for(member, phase, pwr)? {
                        coefficients[index] += 1.0;
                    }
                }
            }
        }
        Ok(coefficients)
    }

    fn cluster(&self, id: &str) -> Option<&EssCluster> {
        self.clusters.iter().find(|c| c.id() == id)
    }
}

/// Device envelope with `max < min` collapsed onto `min`.
fn envelope(ess: &EssRef, phase: Phase, pwr: Pwr) -> (f64, f64) {
    let min = ess.min_power(phase, pwr);
    let max = ess.max_power(phase, pwr);
    if max < min {
        debug!(ess = ess.id(), %phase, %pwr, min, max, "degenerate envelope, clamping to min");
        (min as f64, min as f64)
    } else {
        (min as f64, max as f64)
    }
}
