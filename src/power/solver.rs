//! Linear program over the decision variables of one device group.
//!
//! The distribution solve minimizes
//! `Σ w_t·|xᵢ - hintᵢ| + Σ w_0·|xᵢ|` subject to every stored constraint.
//! Absolute values are expressed with non-negative split variables
//! (`x - h = d⁺ - d⁻`), the usual L1 reformulation.

use minilp::{ComparisonOp, LinearExpr, OptimizationDirection, Problem, Variable};
use tracing::debug;

use crate::domain::Relationship;

use super::constraints::{CoefficientConstraint, TargetHints};
use super::error::SolverError;

/// Solved values, one per variable index.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    values: Vec<f64>,
    objective: f64,
}

impl Solution {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, objective: 0.0 }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, index: usize) -> f64 {
        self.values.get(index).copied().unwrap_or(0.0)
    }

    pub fn objective(&self) -> f64 {
        self.objective
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Goal {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solver {
    /// Weight of the deviation from a target hint.
    pub target_weight: f64,
    /// Weight of the pull towards zero power.
    pub zero_weight: f64,
}

impl Default for Solver {
    fn default() -> Self {
        Self {
            target_weight: 1.0,
            zero_weight: 0.001,
        }
    }
}

impl Solver {
    pub fn new(target_weight: f64, zero_weight: f64) -> Self {
        Self {
            target_weight,
            zero_weight,
        }
    }

    /// Feasible point closest to the hints, ties broken towards zero.
    pub fn solve(
        &self,
        size: usize,
        constraints: &[&CoefficientConstraint],
        hints: &TargetHints,
    ) -> Result<Solution, SolverError> {
        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let vars = free_variables(&mut problem, size, |_| 0.0);

        for (i, x) in vars.iter().enumerate() {
            // |x| via x = up - down
            add_abs_term(&mut problem, *x, 0.0, self.zero_weight);
            if let Some(hint) = hints.get(i) {
                add_abs_term(&mut problem, *x, hint, self.target_weight);
            }
        }
        add_constraints(&mut problem, &vars, constraints);

        let solution = problem.solve()?;
        let values: Vec<f64> = vars.iter().map(|x| solution[*x]).collect();
        debug!(?values, objective = solution.objective(), "solved power distribution");
        Ok(Solution {
            values,
            objective: solution.objective(),
        })
    }

    /// Optimum of `Σ objective[i]·xᵢ` over the feasible region.
    pub fn extremum(
        &self,
        size: usize,
        constraints: &[&CoefficientConstraint],
        objective: &[f64],
        goal: Goal,
    ) -> Result<f64, SolverError> {
        let direction = match goal {
            Goal::Maximize => OptimizationDirection::Maximize,
            Goal::Minimize => OptimizationDirection::Minimize,
        };
        let mut problem = Problem::new(direction);
        let referenced = referenced_indices(size, constraints);
        let vars: Vec<Variable> = (0..size)
            .map(|i| {
                let coefficient = objective.get(i).copied().unwrap_or(0.0);
                // a column that is neither constrained nor scored is irrelevant
                let bounds = if referenced[i] || coefficient != 0.0 {
                    (f64::NEG_INFINITY, f64::INFINITY)
                } else {
                    (0.0, 0.0)
                };
                problem.add_var(coefficient, bounds)
            })
            .collect();
        add_constraints(&mut problem, &vars, constraints);
        let solution = problem.solve()?;
        Ok(solution.objective())
    }

    pub fn is_feasible(&self, size: usize, constraints: &[&CoefficientConstraint]) -> bool {
        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let vars = free_variables(&mut problem, size, |_| 0.0);
        add_constraints(&mut problem, &vars, constraints);
        !matches!(problem.solve(), Err(minilp::Error::Infeasible))
    }
}

fn free_variables(problem: &mut Problem, size: usize, objective: impl Fn(usize) -> f64) -> Vec<Variable> {
    (0..size)
        .map(|i| problem.add_var(objective(i), (f64::NEG_INFINITY, f64::INFINITY)))
        .collect()
}

fn referenced_indices(size: usize, constraints: &[&CoefficientConstraint]) -> Vec<bool> {
    let mut referenced = vec![false; size];
    for constraint in constraints {
        for index in constraint.non_zero_indices() {
            if let Some(slot) = referenced.get_mut(index) {
                *slot = true;
            }
        }
    }
    referenced
}

/// Adds `weight·|x - center|` to the objective.
fn add_abs_term(problem: &mut Problem, x: Variable, center: f64, weight: f64) {
    let up = problem.add_var(weight, (0.0, f64::INFINITY));
    let down = problem.add_var(weight, (0.0, f64::INFINITY));
    let mut expr = LinearExpr::empty();
    expr.add(x, 1.0);
    expr.add(up, -1.0);
    expr.add(down, 1.0);
    problem.add_constraint(expr, ComparisonOp::Eq, center);
}

fn add_constraints(problem: &mut Problem, vars: &[Variable], constraints: &[&CoefficientConstraint]) {
    for constraint in constraints {
        let mut expr = LinearExpr::empty();
        let mut terms = 0;
        for (i, c) in constraint.coefficients().iter().enumerate() {
            if *c != 0.0 {
                if let Some(x) = vars.get(i) {
                    expr.add(*x, *c);
                    terms += 1;
                }
            }
        }
        if terms == 0 {
            // 0 <rel> value, expressed through a variable pinned to zero
            let zero = problem.add_var(0.0, (0.0, 0.0));
            expr.add(zero, 1.0);
        }
        let op = match constraint.relationship() {
            Relationship::Eq => ComparisonOp::Eq,
            Relationship::Leq => ComparisonOp::Le,
            Relationship::Geq => ComparisonOp::Ge,
        };
        problem.add_constraint(expr, op, constraint.value());
    }
}
