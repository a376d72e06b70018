use std::fmt;

use good_lp::{
    constraint, microlp, variable, Expression, ProblemVariables, ResolutionError, Solution,
    SolverModel, Variable as LpVariable,
};
use thiserror::Error;

use crate::model::{LinearExpr, LinearModel, Relation, VarKind};

/// Assignment returned by a backend, indexed like the model's variables.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSolution {
    /// Variable values.
    pub values: Vec<f64>,
    /// Objective at `values`.
    pub objective: f64,
}

/// Backend failure before tier information is attached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// No feasible point exists.
    #[error("infeasible: {0}")]
    Infeasible(String),
    /// Anything else, including unboundedness.
    #[error("{0}")]
    Failed(String),
}

/// Seam between the model and a concrete MILP solver.
pub trait SolveBackend: Send + Sync + fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Minimises the model's objective.
    ///
    /// # Errors
    ///
    /// [`BackendError::Infeasible`] when no feasible point exists.
    fn solve(&self, model: &LinearModel) -> Result<BackendSolution, BackendError>;
}

/// Pure-Rust branch-and-bound backend through `good_lp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroLpBackend;

fn to_expression(expr: &LinearExpr, vars: &[LpVariable]) -> Expression {
    let mut out = Expression::with_capacity(expr.terms.len());
    for (var, coef) in &expr.terms {
        out.add_mul(*coef, vars[var.0]);
    }
    out += expr.constant;
    out
}

impl SolveBackend for MicroLpBackend {
    fn name(&self) -> &'static str {
        "microlp"
    }

    fn solve(&self, model: &LinearModel) -> Result<BackendSolution, BackendError> {
        let mut problem = ProblemVariables::new();
        let vars: Vec<LpVariable> = model
            .variables
            .iter()
            .map(|declared| {
                let mut definition = variable().name(declared.name.clone());
                definition = match declared.kind {
                    VarKind::Binary => definition.binary(),
                    VarKind::Continuous => {
                        let mut bounded = definition.min(declared.lower);
                        if declared.upper.is_finite() {
                            bounded = bounded.max(declared.upper);
                        }
                        bounded
                    }
                };
                problem.add(definition)
            })
            .collect();

        let objective = to_expression(&model.objective_expr(), &vars);
        let mut solver = problem.minimise(objective).using(microlp);
        for declared in &model.constraints {
            let lhs = to_expression(&declared.expr, &vars);
            solver = solver.with(match declared.relation {
                Relation::LessEq => constraint::leq(lhs, declared.rhs),
                Relation::GreaterEq => constraint::geq(lhs, declared.rhs),
                Relation::Equal => constraint::eq(lhs, declared.rhs),
            });
        }

        let solution = solver.solve().map_err(|err| match err {
            ResolutionError::Infeasible => BackendError::Infeasible("no feasible schedule".into()),
            other => BackendError::Failed(other.to_string()),
        })?;
        let values: Vec<f64> = vars.iter().map(|var| solution.value(*var)).collect();
        let objective = model.evaluate_objective(&values);
        Ok(BackendSolution { values, objective })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_small_mixed_integer_program() {
        // min 3x + 2y, x + y ≥ 1.5, y binary, x ∈ [0, 5]
        let mut model = LinearModel::new();
        let x = model.continuous("x", 0.0, 5.0);
        let y = model.binary("y");
        model.constrain(
            "cover",
            LinearExpr::term(x, 1.0).plus(y, 1.0),
            Relation::GreaterEq,
            1.5,
        );
        model.add_objective("cost", 1.0, LinearExpr::term(x, 3.0).plus(y, 2.0));
        let solution = MicroLpBackend.solve(&model).unwrap();
        assert!((solution.values[1] - 1.0).abs() < 1e-6);
        assert!((solution.values[0] - 0.5).abs() < 1e-6);
        assert!((solution.objective - 3.5).abs() < 1e-6);
    }

    #[test]
    fn reports_infeasibility() {
        let mut model = LinearModel::new();
        let x = model.continuous("x", 0.0, 1.0);
        model.constrain("impossible", LinearExpr::term(x, 1.0), Relation::GreaterEq, 2.0);
        model.add_objective("cost", 1.0, LinearExpr::term(x, 1.0));
        let err = MicroLpBackend.solve(&model).unwrap_err();
        assert!(matches!(err, BackendError::Infeasible(_)));
    }
}
