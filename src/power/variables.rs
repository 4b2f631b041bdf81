use crate::domain::{Phase, Pwr, Topology};

use super::error::PowerError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    id: String,
    topology: Topology,
    start: usize,
}

/// Maps `(ess, phase, pwr)` onto decision variable indices.
///
/// Each device owns a contiguous block: `[P, Q]` for symmetric devices,
/// `[P1, Q1, P2, Q2, P3, Q3]` for asymmetric ones. Blocks are laid out in
/// registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSpace {
    slots: Vec<Slot>,
    size: usize,
}

impl VariableSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. Registering the same id with the same topology
    /// again is a no-op.
    pub fn register(&mut self, id: &str, topology: Topology) -> Result<&mut Self, PowerError> {
        if let Some(existing) = self.slots.iter().find(|s| s.id == id) {
            if existing.topology != topology {
                return Err(PowerError::TopologyConflict {
                    id: id.to_string(),
                    registered: existing.topology,
                    requested: topology,
                });
            }
            return Ok(self);
        }
        self.slots.push(Slot {
            id: id.to_string(),
            topology,
            start: self.size,
        });
        self.size += topology.variable_count();
        Ok(self)
    }

    pub fn index_of(&self, id: &str, phase: Phase, pwr: Pwr) -> Result<usize, PowerError> {
        let slot = self.slot(id)?;
        let position = slot
            .topology
            .phases()
            .iter()
            .position(|p| *p == phase)
            .ok_or_else(|| PowerError::PhaseNotAvailable {
                id: id.to_string(),
                topology: slot.topology,
                phase,
            })?;
        Ok(slot.start + position * 2 + pwr.offset())
    }

    /// Indices whose sum is the device's `(phase, pwr)` power.
    ///
    /// `All` on an asymmetric device expands to its three phase variables.
    pub fn indices_for(&self, id: &str, phase: Phase, pwr: Pwr) -> Result<Vec<usize>, PowerError> {
        let slot = self.slot(id)?;
        match (slot.topology, phase) {
            (Topology::Asymmetric, Phase::All) => Phase::SINGLE
                .iter()
                .map(|p| self.index_of(id, *p, pwr))
                .collect(),
            _ => Ok(vec![self.index_of(id, phase, pwr)?]),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.iter().any(|s| s.id == id)
    }

    pub fn topology_of(&self, id: &str) -> Result<Topology, PowerError> {
        Ok(self.slot(id)?.topology)
    }

    /// Registered device ids in registration order.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.id.as_str())
    }

    /// A coefficient vector of the right length with every entry zero.
    pub fn zero_coefficients(&self) -> Vec<f64> {
        vec![0.0; self.size]
    }

    fn slot(&self, id: &str) -> Result<&Slot, PowerError> {
        self.slots
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| PowerError::UnknownDevice(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_layout() {
        let mut vars = VariableSpace::new();
        vars.register("ess0", Topology::Symmetric).unwrap();
        assert_eq!(vars.size(), 2);
        assert_eq!(vars.index_of("ess0", Phase::All, Pwr::Active).unwrap(), 0);
        assert_eq!(vars.index_of("ess0", Phase::All, Pwr::Reactive).unwrap(), 1);
    }

    #[test]
    fn test_mixed_layout_follows_registration_order() {
        let mut vars = VariableSpace::new();
        vars.register("ess1", Topology::Asymmetric)
            .unwrap()
            .register("ess2", Topology::Symmetric)
            .unwrap();
        assert_eq!(vars.size(), 8);
        assert_eq!(vars.index_of("ess1", Phase::L2, Pwr::Active).unwrap(), 2);
        assert_eq!(vars.index_of("ess1", Phase::L3, Pwr::Reactive).unwrap(), 5);
        assert_eq!(vars.index_of("ess2", Phase::All, Pwr::Active).unwrap(), 6);
        assert_eq!(vars.indices_for("ess1", Phase::All, Pwr::Active).unwrap(), vec![0, 2, 4]);
        assert_eq!(vars.device_ids().collect::<Vec<_>>(), vec!["ess1", "ess2"]);
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut vars = VariableSpace::new();
        vars.register("ess0", Topology::Symmetric).unwrap();
        vars.register("ess0", Topology::Symmetric).unwrap();
        assert_eq!(vars.size(), 2);
    }

    #[test]
    fn test_topology_conflict_is_rejected() {
        let mut vars = VariableSpace::new();
        vars.register("ess0", Topology::Symmetric).unwrap();
        let err = vars.register("ess0", Topology::Asymmetric).unwrap_err();
        assert!(matches!(err, PowerError::TopologyConflict { .. }));
    }

    #[test]
    fn test_symmetric_device_has_no_single_phase_slot() {
        let mut vars = VariableSpace::new();
        vars.register("ess0", Topology::Symmetric).unwrap();
        let err = vars.index_of("ess0", Phase::L1, Pwr::Active).unwrap_err();
        assert!(matches!(err, PowerError::PhaseNotAvailable { phase: Phase::L1, .. }));
        assert!(matches!(
            vars.index_of("ess9", Phase::All, Pwr::Active),
            Err(PowerError::UnknownDevice(_))
        ));
    }
}
