use anyhow::{anyhow, Result};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::borrow::Borrow;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::controller::RampConfig;
use crate::domain::{EssCluster, SimulatedEssConfig};
use crate::power::{ClusterStrategy, RoundingMode, Solver};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub cycle: CycleConfig,
    #[serde(default)]
    #[validate(nested)]
    pub solver: SolverConfig,
    #[serde(default)]
    #[validate(nested)]
    pub ramp: RampConfig,
    #[serde(default)]
    pub devices: Vec<SimulatedEssConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub setpoints: Vec<SetpointConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CycleConfig {
    #[validate(range(min = 1))]
    pub period_ms: u64,
}
impl CycleConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SolverConfig {
    /// Edges of the polygon approximating the apparent power circle
    #[validate(range(min = 4, max = 64))]
    pub facets: usize,
    #[validate(custom(function = "finite_non_negative"))]
    pub target_weight: f64,
    #[validate(custom(function = "finite_non_negative"))]
    pub zero_weight: f64,
    #[serde(default)]
    pub rounding: RoundingMode,
    #[serde(default)]
    pub cluster_strategy: ClusterStrategy,
}

impl Default for SolverConfig {
    fn default() -> Self {
        let solver = Solver::default();
        Self {
            facets: 16,
            target_weight: solver.target_weight,
            zero_weight: solver.zero_weight,
            rounding: RoundingMode::default(),
            cluster_strategy: ClusterStrategy::default(),
        }
    }
}

impl SolverConfig {
    pub fn solver(&self) -> Solver {
        Solver::new(self.target_weight, self.zero_weight)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ClusterConfig {
    pub id: String,
    #[validate(length(min = 1))]
    pub members: Vec<String>,
}

impl ClusterConfig {
    pub fn cluster(&self) -> Result<EssCluster> {
        EssCluster::new(self.id.clone(), self.members.clone())
            .ok_or_else(|| anyhow!("cluster {} has no members", self.id))
    }
}

/// Demo setpoint applied every cycle to an ESS or cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct SetpointConfig {
    pub target: String,
    pub active_power_w: i32,
    #[serde(default)]
    pub reactive_power_var: Option<i32>,
    /// Route the active power through a ramp limiter.
    #[serde(default)]
    pub ramp: bool,
}

pub(crate) fn finite_non_negative<T: Borrow<f64>>(value: T) -> Result<(), ValidationError> {
    let value = *value.borrow();
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("finite_non_negative"))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("ESS__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }
}
