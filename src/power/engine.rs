use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::{ConstraintLifetime, EssCluster, EssRef, ManagedEss, Phase, Pwr, Relationship};
use crate::soc::CalculateSoc;

use super::constraints::{ClusterStrategy, CoefficientConstraint, Constraint, ConstraintStore};
use super::dispatcher::{DeviceDispatch, Dispatcher, RoundingMode};
use super::error::{PowerError, SolverError};
use super::linearizer::ApparentPowerLinearizer;
use super::solver::{Goal, Solver};
use super::variables::VariableSpace;

/// Devices linked through clusters, solved as one LP.
struct Group {
    devices: Vec<EssRef>,
    vars: VariableSpace,
    store: ConstraintStore,
}

impl Group {
    fn contains(&self, target: &str) -> bool {
        self.store.knows(&self.vars, target)
    }

    fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id().to_string()).collect()
    }
}

/// Result of solving and dispatching one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub devices: Vec<String>,
    /// Why the group was held at zero, if it was.
    pub failure: Option<PowerError>,
    pub dispatched: Vec<DeviceDispatch>,
}

/// Everything one `apply_power()` did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub groups: Vec<GroupReport>,
}

impl CycleReport {
    pub fn is_degraded(&self) -> bool {
        self.groups.iter().any(|g| g.failure.is_some())
    }

    pub fn failures(&self) -> impl Iterator<Item = &PowerError> {
        self.groups.iter().filter_map(|g| g.failure.as_ref())
    }

    pub fn dispatch_for(&self, ess: &str) -> Option<&DeviceDispatch> {
        self.groups
            .iter()
            .flat_map(|g| g.dispatched.iter())
            .find(|d| d.ess == ess)
    }
}

#[derive(Default)]
pub struct EssPowerBuilder {
    devices: Vec<EssRef>,
    clusters: Vec<EssCluster>,
    linearizer: ApparentPowerLinearizer,
    solver: Solver,
    rounding: RoundingMode,
    cluster_strategy: ClusterStrategy,
}

impl EssPowerBuilder {
    pub fn add_ess(mut self, ess: EssRef) -> Self {
        self.devices.push(ess);
        self
    }

    pub fn add_cluster(mut self, cluster: EssCluster) -> Self {
        self.clusters.push(cluster);
        self
    }

    pub fn apparent_power_facets(mut self, facets: usize) -> Self {
        self.linearizer = ApparentPowerLinearizer::new(facets);
        self
    }

    pub fn solver(mut self, solver: Solver) -> Self {
        self.solver = solver;
        self
    }

    pub fn rounding(mut self, rounding: RoundingMode) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn cluster_strategy(mut self, strategy: ClusterStrategy) -> Self {
        self.cluster_strategy = strategy;
        self
    }

    pub fn build(self) -> Result<EssPower, PowerError> {
        let mut devices: Vec<EssRef> = Vec::with_capacity(self.devices.len());
        for ess in self.devices {
            match devices.iter().find(|d| d.id() == ess.id()) {
                Some(existing) if Arc::ptr_eq(existing, &ess) => continue,
                Some(existing) if existing.topology() != ess.topology() => {
                    return Err(PowerError::TopologyConflict {
                        id: ess.id().to_string(),
                        registered: existing.topology(),
                        requested: ess.topology(),
                    })
                }
                Some(_) => return Err(PowerError::DuplicateId(ess.id().to_string())),
                None => devices.push(ess),
            }
        }

        for cluster in &self.clusters {
            if cluster.members().is_empty() {
                return Err(PowerError::EmptyCluster(cluster.id().to_string()));
            }
            if devices.iter().any(|d| d.id() == cluster.id())
                || self.clusters.iter().filter(|c| c.id() == cluster.id()).count() > 1
            {
                return Err(PowerError::DuplicateId(cluster.id().to_string()));
            }
            if let Some(missing) = cluster.members().iter().find(|m| !devices.iter().any(|d| d.id() == m.as_str())) {
                return Err(PowerError::UnknownDevice(missing.clone()));
            }
        }

        let groups = partition(&devices, &self.clusters)
            .into_iter()
            .map(|members| -> Result<Group, PowerError> {
                let group_devices: Vec<EssRef> = members.iter().map(|i| devices[*i].clone()).collect();
                let mut vars = VariableSpace::new();
                for ess in &group_devices {
                    vars.register(ess.id(), ess.topology())?;
                }
                let clusters = self
                    .clusters
                    .iter()
                    .filter(|c| c.members().iter().any(|m| vars.contains(m)))
                    .cloned()
                    .collect();
                Ok(Group {
                    devices: group_devices,
                    vars,
                    store: ConstraintStore::new(clusters).with_cluster_strategy(self.cluster_strategy),
                })
            })
            .collect::<Result<Vec<_>, PowerError>>()?;

        let mut power = EssPower {
            groups,
            linearizer: self.linearizer,
            solver: self.solver,
            dispatcher: Dispatcher::new(self.rounding),
            cycle: 0,
        };
        power.begin_cycle()?;
        info!(groups = power.groups.len(), "ESS power engine ready");
        Ok(power)
    }
}

/// Indices of `devices` grouped so that every cluster lies in one group.
fn partition(devices: &[EssRef], clusters: &[EssCluster]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..devices.len()).collect();

    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let position = |id: &str| devices.iter().position(|d| d.id() == id);
    for cluster in clusters {
        let mut members = cluster.members().iter().filter_map(|m| position(m.as_str()));
        if let Some(first) = members.next() {
            for other in members {
                let (a, b) = (root(&mut parent, first), root(&mut parent, other));
                if a != b {
                    parent[b.max(a)] = a.min(b);
                }
            }
        }
    }

    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    for i in 0..devices.len() {
        let r = root(&mut parent, i);
        match groups.iter_mut().find(|(key, _)| *key == r) {
            Some((_, members)) => members.push(i),
            None => groups.push((r, vec![i])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

/// Per-cycle power engine.
///
/// A cycle is `begin_cycle()`, any number of constraint calls from
/// controllers, then `apply_power()`. `apply_power()` reseeds the device
/// bounds once it has dispatched, so extrema queried between cycles already
/// reflect the devices' state after the last dispatch. Calling
/// `begin_cycle()` again picks up anything that changed since.
pub struct EssPower {
    groups: Vec<Group>,
    linearizer: ApparentPowerLinearizer,
    solver: Solver,
    dispatcher: Dispatcher,
    cycle: u64,
}

impl EssPower {
    pub fn builder() -> EssPowerBuilder {
        EssPowerBuilder::default()
    }

    /// Reseeds device bounds from live device state.
    pub fn begin_cycle(&mut self) -> Result<(), PowerError> {
        for group in &mut self.groups {
            group.store.seed(&group.vars, &group.devices, &self.linearizer)?;
        }
        Ok(())
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn device(&self, id: &str) -> Option<&EssRef> {
        self.groups
            .iter()
            .flat_map(|g| g.devices.iter())
            .find(|d| d.id() == id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &EssRef> {
        self.groups.iter().flat_map(|g| g.devices.iter())
    }

    /// Compiled constraints currently in force for the group of `target`.
    pub fn constraints_for(&self, target: &str) -> Result<Vec<CoefficientConstraint>, PowerError> {
        let group = self.group(target)?;
        Ok(group.store.all().into_iter().cloned().collect())
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<CoefficientConstraint, PowerError> {
        let group = self.group_mut(&constraint.target)?;
        group.store.add(&group.vars, constraint)
    }

    /// Adds the constraint only if the group stays solvable with it.
    pub fn add_constraint_and_validate(&mut self, constraint: Constraint) -> Result<CoefficientConstraint, PowerError> {
        let solver = self.solver;
        let group = self.group_mut(&constraint.target)?;
        let compiled = group.store.add(&group.vars, constraint)?;
        if solver.is_feasible(group.vars.size(), &group.store.all()) {
            return Ok(compiled);
        }
        warn!(constraint = %compiled, "constraint would make the power distribution infeasible");
        if let Some(id) = compiled.id() {
            group.store.remove(id);
        }
        Err(PowerError::Solver(SolverError::Infeasible))
    }

    /// Removes a caller constraint. Returns whether it was still stored.
    pub fn remove_constraint(&mut self, constraint: &CoefficientConstraint) -> bool {
        let Some(id) = constraint.id() else {
            return false;
        };
        self.groups.iter_mut().any(|g| g.store.remove(id))
    }

    pub fn set_active_power(
        &mut self,
        target: &str,
        phase: Phase,
        lifetime: ConstraintLifetime,
        relationship: Relationship,
        value: f64,
    ) -> Result<CoefficientConstraint, PowerError> {
        self.add_constraint(Constraint::new(target, phase, Pwr::Active, relationship, value, lifetime))
    }

    pub fn set_active_power_and_solve(
        &mut self,
        target: &str,
        phase: Phase,
        lifetime: ConstraintLifetime,
        relationship: Relationship,
        value: f64,
    ) -> Result<CoefficientConstraint, PowerError> {
        self.add_constraint_and_validate(Constraint::new(target, phase, Pwr::Active, relationship, value, lifetime))
    }

    pub fn set_reactive_power(
        &mut self,
        target: &str,
        phase: Phase,
        lifetime: ConstraintLifetime,
        relationship: Relationship,
        value: f64,
    ) -> Result<CoefficientConstraint, PowerError> {
        self.add_constraint(Constraint::new(target, phase, Pwr::Reactive, relationship, value, lifetime))
    }

    pub fn set_reactive_power_and_solve(
        &mut self,
        target: &str,
        phase: Phase,
        lifetime: ConstraintLifetime,
        relationship: Relationship,
        value: f64,
    ) -> Result<CoefficientConstraint, PowerError> {
        self.add_constraint_and_validate(Constraint::new(target, phase, Pwr::Reactive, relationship, value, lifetime))
    }

    /// Objective hint for this cycle, without a hard constraint.
    pub fn set_target(&mut self, target: &str, phase: Phase, pwr: Pwr, value: f64) -> Result<(), PowerError> {
        let group = self.group_mut(target)?;
        let soft = Constraint::new(target, phase, pwr, Relationship::Eq, value, ConstraintLifetime::Static)
            .with_description(format!("[{target}] target {pwr} {phase} {value}"));
        group.store.add_soft_target(&group.vars, soft)
    }

    /// Limits the total apparent power of an ESS until changed.
    pub fn set_max_apparent_power(&mut self, ess: &str, value: f64) -> Result<Vec<CoefficientConstraint>, PowerError> {
        self.set_max_apparent_power_on(ess, Phase::All, value)
    }

    pub fn set_max_apparent_power_on(
        &mut self,
        ess: &str,
        phase: Phase,
        value: f64,
    ) -> Result<Vec<CoefficientConstraint>, PowerError> {
        let linearizer = self.linearizer;
        let group = self.group_mut(ess)?;
        if !group.vars.contains(ess) {
            return Err(PowerError::UnknownDevice(ess.to_string()));
        }
        group.store.set_apparent_limit(&group.vars, &linearizer, ess, phase, value)
    }

    /// Drops the limit set by [`set_max_apparent_power`](Self::set_max_apparent_power).
    /// The device's own rating still applies. Returns whether a limit was set.
    pub fn clear_max_apparent_power(&mut self, ess: &str) -> bool {
        self.clear_max_apparent_power_on(ess, Phase::All)
    }

    pub fn clear_max_apparent_power_on(&mut self, ess: &str, phase: Phase) -> bool {
        match self.group_mut(ess) {
            Ok(group) => group.store.clear_apparent_limit(ess, phase),
            Err(_) => false,
        }
    }

    /// Largest feasible value of `(phase, pwr)`, or 0 if none can be found.
    pub fn max_power(&self, target: &str, phase: Phase, pwr: Pwr) -> i32 {
        self.extremum(target, phase, pwr, Goal::Maximize)
            .map(|v| (v + 1e-6).floor() as i32)
            .unwrap_or(0)
    }

    /// Smallest feasible value of `(phase, pwr)`, or 0 if none can be found.
    pub fn min_power(&self, target: &str, phase: Phase, pwr: Pwr) -> i32 {
        self.extremum(target, phase, pwr, Goal::Minimize)
            .map(|v| (v - 1e-6).ceil() as i32)
            .unwrap_or(0)
    }

    fn extremum(&self, target: &str, phase: Phase, pwr: Pwr, goal: Goal) -> Option<f64> {
        let result = self.group(target).and_then(|group| {
            let selection = Constraint::new(target, phase, pwr, Relationship::Eq, 0.0, ConstraintLifetime::Static);
            let objective = group.store.compile(&group.vars, &selection)?;
            Ok(self
                .solver
                .extremum(group.vars.size(), &group.store.all(), objective.coefficients(), goal)?)
        });
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(ess = target, %phase, %pwr, ?goal, error = %err, "unable to compute power extremum");
                None
            }
        }
    }

    pub fn is_solvable(&self) -> bool {
        self.groups
            .iter()
            .all(|g| self.solver.is_feasible(g.vars.size(), &g.store.all()))
    }

    /// Aggregate SoC of an ESS or cluster.
    pub fn soc(&self, target: &str) -> Option<i32> {
        let group = self.group(target).ok()?;
        let members: Vec<&dyn ManagedEss> = match group.store.clusters().iter().find(|c| c.id() == target) {
            Some(cluster) => group
                .devices
                .iter()
                .filter(|d| cluster.contains(d.id()))
                .map(|d| &**d)
                .collect(),
            None => group
                .devices
                .iter()
                .filter(|d| d.id() == target)
                .map(|d| &**d)
                .collect(),
        };
        CalculateSoc::new().add(members).calculate()
    }

    /// Solves every group and dispatches the result, then drops static
    /// constraints and reseeds the device bounds. Infeasible groups are held
    /// at zero power.
    pub fn apply_power(&mut self) -> CycleReport {
        self.cycle += 1;
        let mut reports = Vec::with_capacity(self.groups.len());

        for group in &mut self.groups {
            let (dispatched, failure) = {
                let constraints = group.store.all();
                let hints = group.store.target_hints(&group.vars);
                let outcome = self
                    .solver
                    .solve(group.vars.size(), &constraints, &hints)
                    .map_err(PowerError::from)
                    .and_then(|solution| {
                        let apparent = group.store.apparent_limits();
                        self.dispatcher.apply(
                            &group.vars,
                            &group.devices,
                            group.store.variable_bounds(),
                            &apparent,
                            solution,
                        )
                    });
                match outcome {
                    Ok(dispatched) => (dispatched, None),
                    Err(err) => {
                        warn!(
                            cycle = self.cycle,
                            devices = ?group.device_ids(),
                            error = %err,
                            "no valid power distribution, holding zero power"
                        );
                        (self.dispatcher.apply_zero(&group.devices), Some(err))
                    }
                }
            };
            group.store.clear_static();
            if let Err(err) = group.store.seed(&group.vars, &group.devices, &self.linearizer) {
                warn!(cycle = self.cycle, error = %err, "unable to reseed device bounds");
            }
            reports.push(GroupReport {
                devices: group.device_ids(),
                failure,
                dispatched,
            });
        }

        debug!(cycle = self.cycle, groups = reports.len(), "cycle applied");
        CycleReport {
            cycle: self.cycle,
            timestamp: Utc::now(),
            groups: reports,
        }
    }

    fn group(&self, target: &str) -> Result<&Group, PowerError> {
        self.groups
            .iter()
            .find(|g| g.contains(target))
            .ok_or_else(|| PowerError::UnknownDevice(target.to_string()))
    }

    fn group_mut(&mut self, target: &str) -> Result<&mut Group, PowerError> {
        self.groups
            .iter_mut()
            .find(|g| g.contains(target))
            .ok_or_else(|| PowerError::UnknownDevice(target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AppliedCommand, PhaseSetpoints, SimulatedEss};

    fn single(ess: SimulatedEss) -> (Arc<SimulatedEss>, EssPower) {
        let ess = Arc::new(ess);
        let power = EssPower::builder().add_ess(ess.clone()).build().unwrap();
        (ess, power)
    }

    #[test]
    fn test_zero_round_trip() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        power
            .set_active_power("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 0.0)
            .unwrap();
        power
            .set_reactive_power("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 0.0)
            .unwrap();
        let report = power.apply_power();
        assert!(!report.is_degraded());
        assert_eq!(ess.applied(), vec![AppliedCommand::Symmetric { active: 0, reactive: 0 }]);
    }

    #[test]
    fn test_static_constraint_index_layout() {
        let (_, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        let compiled = power
            .set_active_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Leq, 1000.0)
            .unwrap();
        assert!(compiled.is_single_coefficient());
        assert_eq!(compiled.no_of_coefficients(), 2);
        assert_eq!(compiled.non_zero_indices(), vec![0]);
        assert_eq!(compiled.relationship(), Relationship::Leq);
        assert_eq!(compiled.value(), 1000.0);
    }

    #[test]
    fn test_equality_target_is_dispatched() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        power
            .set_active_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 2500.0)
            .unwrap();
        power.apply_power();
        assert_eq!(ess.active_power(), Some(2500));
        assert_eq!(ess.reactive_power(), 0);
    }

    #[test]
    fn test_static_constraints_cleared_after_apply() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        power
            .set_active_power("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 1000.0)
            .unwrap();
        power.apply_power();
        power.begin_cycle().unwrap();
        power.apply_power();
        let applied = ess.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1], AppliedCommand::Symmetric { active: 0, reactive: 0 });
    }

    #[test]
    fn test_persistent_constraint_survives_cycles() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        let handle = power
            .set_active_power("ess0", Phase::All, ConstraintLifetime::Persistent, Relationship::Geq, 700.0)
            .unwrap();
        power.apply_power();
        power.begin_cycle().unwrap();
        power.apply_power();
        assert_eq!(ess.active_power(), Some(700));

        assert!(power.remove_constraint(&handle));
        power.begin_cycle().unwrap();
        power.apply_power();
        assert_eq!(ess.active_power(), Some(0));
    }

    #[test]
    fn test_and_solve_rejects_infeasible_request() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        let err = power
            .set_active_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 9000.0)
            .unwrap_err();
        assert_eq!(err, PowerError::Solver(SolverError::Infeasible));
        // the rejected constraint does not poison the cycle
        let report = power.apply_power();
        assert!(!report.is_degraded());
        assert_eq!(ess.active_power(), Some(0));
    }

    #[test]
    fn test_infeasible_cycle_degrades_to_zero() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        power
            .set_active_power("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 100.0)
            .unwrap();
        power
            .set_active_power("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 200.0)
            .unwrap();
        let report = power.apply_power();
        assert!(report.is_degraded());
        assert_eq!(
            report.failures().next(),
            Some(&PowerError::Solver(SolverError::Infeasible))
        );
        assert_eq!(ess.last_applied(), Some(AppliedCommand::Symmetric { active: 0, reactive: 0 }));
    }

    #[test]
    fn test_failure_is_local_to_its_group() {
        let broken = Arc::new(SimulatedEss::symmetric("ess1", -5000, 5000));
        let healthy = Arc::new(SimulatedEss::symmetric("ess2", -5000, 5000));
        let mut power = EssPower::builder()
            .add_ess(broken.clone())
            .add_ess(healthy.clone())
            .build()
            .unwrap();
        power
            .set_active_power("ess1", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 6000.0)
            .unwrap();
        power
            .set_active_power("ess2", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 1500.0)
            .unwrap();
        let report = power.apply_power();
        assert_eq!(report.failures().count(), 1);
        assert_eq!(broken.active_power(), Some(0));
        assert_eq!(healthy.active_power(), Some(1500));
    }

    #[test]
    fn test_not_runnable_device_held_at_zero() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000));
        ess.set_runnable(false);
        power.begin_cycle().unwrap();
        assert_eq!(power.max_power("ess0", Phase::All, Pwr::Active), 0);
        power.set_target("ess0", Phase::All, Pwr::Active, 3000.0).unwrap();
        power.apply_power();
        assert_eq!(ess.active_power(), Some(0));
    }

    #[test]
    fn test_extrema_follow_constraints() {
        let (_, mut power) = single(SimulatedEss::symmetric("ess0", -4000, 3000));
        assert_eq!(power.max_power("ess0", Phase::All, Pwr::Active), 3000);
        assert_eq!(power.min_power("ess0", Phase::All, Pwr::Active), -4000);
        power
            .set_active_power("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Leq, 1200.0)
            .unwrap();
        assert_eq!(power.max_power("ess0", Phase::All, Pwr::Active), 1200);
        assert_eq!(power.max_power("ess9", Phase::All, Pwr::Active), 0);
    }

    #[test]
    fn test_asymmetric_phases_are_independent() {
        let (ess, mut power) = single(SimulatedEss::asymmetric("ess0", -9000, 9000));
        for (phase, value) in [(Phase::L1, 1000.0), (Phase::L2, 800.0), (Phase::L3, 1200.0)] {
            power
                .set_active_power_and_solve("ess0", phase, ConstraintLifetime::Static, Relationship::Eq, value)
                .unwrap();
        }
        power.apply_power();
        assert_eq!(
            ess.last_applied(),
            Some(AppliedCommand::PerPhase(PhaseSetpoints {
                active_l1: 1000,
                active_l2: 800,
                active_l3: 1200,
                ..Default::default()
            }))
        );
    }

    #[test]
    fn test_cluster_distributes_equally() {
        let ess1 = Arc::new(SimulatedEss::symmetric("ess1", -5000, 5000));
        let ess2 = Arc::new(SimulatedEss::symmetric("ess2", -5000, 5000));
        let mut power = EssPower::builder()
            .add_ess(ess1.clone())
            .add_ess(ess2.clone())
            .add_cluster(EssCluster::new("ess0", vec!["ess1".into(), "ess2".into()]).unwrap())
            .build()
            .unwrap();
        power
            .set_active_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 1000.0)
            .unwrap();
        power
            .set_reactive_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 500.0)
            .unwrap();
        power.apply_power();
        assert_eq!(ess1.last_applied(), Some(AppliedCommand::Symmetric { active: 500, reactive: 250 }));
        assert_eq!(ess2.last_applied(), Some(AppliedCommand::Symmetric { active: 500, reactive: 250 }));
    }

    #[test]
    fn test_cluster_share_respects_member_limits() {
        let ess1 = Arc::new(SimulatedEss::symmetric("ess1", -5000, 300));
        let ess2 = Arc::new(SimulatedEss::symmetric("ess2", -5000, 5000));
        let mut power = EssPower::builder()
            .add_ess(ess1.clone())
            .add_ess(ess2.clone())
            .add_cluster(EssCluster::new("ess0", vec!["ess1".into(), "ess2".into()]).unwrap())
            .build()
            .unwrap();
        power
            .set_active_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 1000.0)
            .unwrap();
        power.apply_power();
        assert_eq!(ess1.active_power(), Some(300));
        assert_eq!(ess2.active_power(), Some(700));
    }

    #[test]
    fn test_apparent_power_limits_dispatch() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -10_000, 10_000));
        power.set_max_apparent_power("ess0", 5000.0).unwrap();
        power.set_target("ess0", Phase::All, Pwr::Active, 4000.0).unwrap();
        power.set_target("ess0", Phase::All, Pwr::Reactive, 4000.0).unwrap();
        power.apply_power();
        let p = ess.active_power().unwrap() as f64;
        let q = ess.reactive_power() as f64;
        assert!(p.hypot(q) <= 5000.0);
        assert!(p.hypot(q) > 4800.0);
    }

    #[test]
    fn test_cleared_apparent_limit_restores_range() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -10_000, 10_000));
        power.set_max_apparent_power("ess0", 3000.0).unwrap();
        assert_eq!(power.max_power("ess0", Phase::All, Pwr::Active), 3000);

        assert!(power.clear_max_apparent_power("ess0"));
        assert!(!power.clear_max_apparent_power("ess0"));
        assert_eq!(power.max_power("ess0", Phase::All, Pwr::Active), 10_000);
        power.set_target("ess0", Phase::All, Pwr::Active, 8000.0).unwrap();
        power.apply_power();
        assert_eq!(ess.active_power(), Some(8000));
    }

    #[test]
    fn test_apply_reseeds_device_bounds() {
        let (ess, mut power) = single(SimulatedEss::symmetric("ess0", -5000, 5000).with_capacity(Some(10_000), Some(50.0)));
        power.begin_cycle().unwrap();
        assert_eq!(power.min_power("ess0", Phase::All, Pwr::Active), -5000);
        ess.set_soc(Some(100.0));
        power.apply_power();
        // no begin_cycle in between
        assert_eq!(power.min_power("ess0", Phase::All, Pwr::Active), 0);
    }

    #[test]
    fn test_soc_weighted_cluster_favours_fuller_member() {
        let ess1 = Arc::new(SimulatedEss::symmetric("ess1", -5000, 5000).with_capacity(Some(10_000), Some(80.0)));
        let ess2 = Arc::new(SimulatedEss::symmetric("ess2", -5000, 5000).with_capacity(Some(10_000), Some(20.0)));
        let mut power = EssPower::builder()
            .add_ess(ess1.clone())
            .add_ess(ess2.clone())
            .add_cluster(EssCluster::new("ess0", vec!["ess1".into(), "ess2".into()]).unwrap())
            .cluster_strategy(ClusterStrategy::SocWeighted)
            .build()
            .unwrap();

        power
            .set_active_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, 5000.0)
            .unwrap();
        power.apply_power();
        assert_eq!(ess1.active_power(), Some(4000));
        assert_eq!(ess2.active_power(), Some(1000));

        power.begin_cycle().unwrap();
        power
            .set_active_power_and_solve("ess0", Phase::All, ConstraintLifetime::Static, Relationship::Eq, -5000.0)
            .unwrap();
        power.apply_power();
        assert_eq!(ess1.active_power(), Some(-1000));
        assert_eq!(ess2.active_power(), Some(-4000));
    }

    #[test]
    fn test_cluster_soc() {
        let ess1 = Arc::new(SimulatedEss::symmetric("ess1", -5000, 5000).with_capacity(Some(10_000), Some(40.0)));
        let ess2 = Arc::new(SimulatedEss::symmetric("ess2", -5000, 5000).with_capacity(Some(20_000), Some(60.0)));
        let power = EssPower::builder()
            .add_ess(ess1)
            .add_ess(ess2)
            .add_cluster(EssCluster::new("ess0", vec!["ess1".into(), "ess2".into()]).unwrap())
            .build()
            .unwrap();
        assert_eq!(power.soc("ess0"), Some(53));
        assert_eq!(power.soc("ess1"), Some(40));
        assert_eq!(power.soc("ess5"), None);
    }

    #[test]
    fn test_builder_rejects_unknown_cluster_member() {
        let result = EssPower::builder()
            .add_ess(Arc::new(SimulatedEss::symmetric("ess1", -5000, 5000)))
            .add_cluster(EssCluster::new("ess0", vec!["ess1".into(), "ess4".into()]).unwrap())
            .build();
        assert!(matches!(result, Err(PowerError::UnknownDevice(id)) if id == "ess4"));
    }

    #[test]
    fn test_same_instance_registered_twice_is_idempotent() {
        let ess = Arc::new(SimulatedEss::symmetric("ess0", -5000, 5000));
        let power = EssPower::builder().add_ess(ess.clone()).add_ess(ess).build().unwrap();
        assert_eq!(power.devices().count(), 1);
    }

    #[test]
    fn test_partition_links_clusters() {
        let devices: Vec<EssRef> = (1..=4)
            .map(|i| Arc::new(SimulatedEss::symmetric(format!("ess{i}"), -1, 1)) as EssRef)
            .collect();
        let clusters = vec![
            EssCluster::new("c1", vec!["ess1".into(), "ess3".into()]).unwrap(),
            EssCluster::new("c2", vec!["ess3".into(), "ess4".into()]).unwrap(),
        ];
        assert_eq!(partition(&devices, &clusters), vec![vec![0, 2, 3], vec![1]]);
    }
}
