use thiserror::Error;

use crate::domain::{Phase, Topology};

/// Failures of the linear program itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SolverError {
    #[error("no power distribution satisfies all constraints")]
    Infeasible,
    #[error("objective is unbounded")]
    Unbounded,
}

impl From<minilp::Error> for SolverError {
    fn from(err: minilp::Error) -> Self {
        match err {
            minilp::Error::Infeasible => SolverError::Infeasible,
            minilp::Error::Unbounded => SolverError::Unbounded,
        }
    }
}

/// Power engine errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PowerError {
    #[error("unknown ESS or cluster: {0}")]
    UnknownDevice(String),
    #[error("ESS {id} is {topology} and has no {phase} phase slot")]
    PhaseNotAvailable {
        id: String,
        topology: Topology,
        phase: Phase,
    },
    #[error("ESS {id} is already registered as {registered}, not {requested}")]
    TopologyConflict {
        id: String,
        registered: Topology,
        requested: Topology,
    },
    #[error("id {0} is used by more than one ESS or cluster")]
    DuplicateId(String),
    #[error("cluster {0} has no members")]
    EmptyCluster(String),
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),
    #[error("solver failed: {0}")]
    Solver(#[from] SolverError),
}
