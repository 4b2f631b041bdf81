use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

// ============================================================================
// Electrical Axes
// ============================================================================

/// Grid phase a power value refers to.
///
/// Symmetric devices are addressed only through `All`; asymmetric devices
/// carry one variable slot per physical phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Phase {
    All,
    L1,
    L2,
    L3,
}

impl Phase {
    /// Physical phases in slot order.
    pub const SINGLE: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn is_single(&self) -> bool {
        !matches!(self, Phase::All)
    }
}

/// Kind of power a variable carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Pwr {
    Active,
    Reactive,
}

impl Pwr {
    /// Offset of this kind inside a phase slot.
    pub fn offset(&self) -> usize {
        match self {
            Pwr::Active => 0,
            Pwr::Reactive => 1,
        }
    }
}

// ============================================================================
// Constraint Vocabulary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Relationship {
    /// Equal to
    Eq,
    /// Less than or equal to
    Leq,
    /// Greater than or equal to
    Geq,
}

impl Relationship {
    /// Whether `lhs <rel> rhs` holds within `tolerance`.
    pub fn holds(&self, lhs: f64, rhs: f64, tolerance: f64) -> bool {
        match self {
            Relationship::Eq => (lhs - rhs).abs() <= tolerance,
            Relationship::Leq => lhs <= rhs + tolerance,
            Relationship::Geq => lhs >= rhs - tolerance,
        }
    }
}

/// How long a caller constraint lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintLifetime {
    /// Discarded after the cycle's `apply_power()`.
    Static,
    /// Kept until removed explicitly.
    Persistent,
}

// ============================================================================
// Device Topology
// ============================================================================

/// Control topology of a managed ESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Topology {
    /// Controlled as one aggregate three-phase quantity.
    Symmetric,
    /// Controlled independently per phase.
    Asymmetric,
}

impl Topology {
    /// Phase slots a device of this topology owns, in variable order.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            Topology::Symmetric => &[Phase::All],
            Topology::Asymmetric => &Phase::SINGLE,
        }
    }

    /// Number of decision variables a device of this topology needs.
    pub fn variable_count(&self) -> usize {
        self.phases().len() * 2
    }
}
