//! Power dispatch engine
//!
//! Collects the constraints that devices and controllers place on every ESS,
//! solves them as a linear program per group of linked devices and sends one
//! setpoint to each device per cycle.

pub mod constraints;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod linearizer;
pub mod solver;
pub mod variables;

pub use constraints::{ClusterStrategy, CoefficientConstraint, Constraint, ConstraintId, ConstraintStore, TargetHints};
pub use dispatcher::{DeviceDispatch, Dispatcher, RoundingMode, Setpoint};
pub use engine::{CycleReport, EssPower, EssPowerBuilder, GroupReport};
pub use error::{PowerError, SolverError};
pub use linearizer::ApparentPowerLinearizer;
pub use solver::{Goal, Solution, Solver};
pub use variables::VariableSpace;
