use serde::{Deserialize, Serialize};

/// Index of a decision variable inside a [`LinearModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarId(pub usize);

/// Domain of a decision variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    /// 0/1 variable.
    Binary,
    /// Real variable within its bounds.
    Continuous,
}

/// Declared decision variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Readable name, e.g. `on[P1][3]`.
    pub name: String,
    /// Domain.
    pub kind: VarKind,
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

/// Affine expression `Σ coef·var + constant`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearExpr {
    /// Terms; a variable may appear more than once.
    pub terms: Vec<(VarId, f64)>,
    /// Constant offset.
    pub constant: f64,
}

impl LinearExpr {
    /// Empty expression.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expression holding a single term.
    #[must_use]
    pub fn term(var: VarId, coef: f64) -> Self {
        Self {
            terms: vec![(var, coef)],
            constant: 0.0,
        }
    }

    /// Adds `coef·var`, skipping zero coefficients.
    #[must_use]
    pub fn plus(mut self, var: VarId, coef: f64) -> Self {
        self.add_term(var, coef);
        self
    }

    /// Adds a constant.
    #[must_use]
    pub fn plus_constant(mut self, constant: f64) -> Self {
        self.constant += constant;
        self
    }

    /// In-place `coef·var`.
    pub fn add_term(&mut self, var: VarId, coef: f64) {
        if coef != 0.0 {
            self.terms.push((var, coef));
        }
    }

    /// In-place `factor·other`.
    pub fn add_scaled(&mut self, other: &Self, factor: f64) {
        if factor == 0.0 {
            return;
        }
        for (var, coef) in &other.terms {
            self.add_term(*var, coef * factor);
        }
        self.constant += other.constant * factor;
    }

    /// Evaluates the expression for a full assignment.
    #[must_use]
    pub fn evaluate(&self, values: &[f64]) -> f64 {
        self.terms
            .iter()
            .map(|(var, coef)| coef * values.get(var.0).copied().unwrap_or(0.0))
            .sum::<f64>()
            + self.constant
    }
}

/// Comparison in a linear constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    /// `expr ≤ rhs`.
    LessEq,
    /// `expr ≥ rhs`.
    GreaterEq,
    /// `expr = rhs`.
    Equal,
}

/// Labelled linear constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConstraint {
    /// Family label, e.g. `mass_balance`.
    pub label: String,
    /// Left-hand side.
    pub expr: LinearExpr,
    /// Comparison.
    pub relation: Relation,
    /// Right-hand side.
    pub rhs: f64,
}

impl LinearConstraint {
    /// Whether an assignment satisfies the constraint within `tol`.
    #[must_use]
    pub fn is_satisfied(&self, values: &[f64], tol: f64) -> bool {
        let lhs = self.expr.evaluate(values);
        match self.relation {
            Relation::LessEq => lhs <= self.rhs + tol,
            Relation::GreaterEq => lhs >= self.rhs - tol,
            Relation::Equal => (lhs - self.rhs).abs() <= tol,
        }
    }
}

/// Named, weighted piece of the objective, kept apart for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveTerm {
    /// Term name, e.g. `energy_cost`.
    pub name: String,
    /// Weight applied to `expr`.
    pub weight: f64,
    /// Unweighted expression.
    pub expr: LinearExpr,
}

/// Minimisation problem over binary and continuous variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// Declared variables, indexed by [`VarId`].
    pub variables: Vec<Variable>,
    /// Constraint set.
    pub constraints: Vec<LinearConstraint>,
    /// Objective terms; the objective is their weighted sum.
    pub objective: Vec<ObjectiveTerm>,
}

impl LinearModel {
    /// Empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a binary variable.
    pub fn binary(&mut self, name: impl Into<String>) -> VarId {
        self.push(name.into(), VarKind::Binary, 0.0, 1.0)
    }

    /// Declares a bounded continuous variable.
    pub fn continuous(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> VarId {
        self.push(name.into(), VarKind::Continuous, lower, upper.max(lower))
    }

    fn push(&mut self, name: String, kind: VarKind, lower: f64, upper: f64) -> VarId {
        self.variables.push(Variable {
            name,
            kind,
            lower,
            upper,
        });
        VarId(self.variables.len() - 1)
    }

    /// Adds a constraint.
    pub fn constrain(
        &mut self,
        label: &str,
        expr: LinearExpr,
        relation: Relation,
        rhs: f64,
    ) {
        self.constraints.push(LinearConstraint {
            label: label.to_owned(),
            expr,
            relation,
            rhs,
        });
    }

    /// Adds a weighted objective term. Zero weights and empty expressions are dropped.
    pub fn add_objective(&mut self, name: &str, weight: f64, expr: LinearExpr) {
        if weight == 0.0 || (expr.terms.is_empty() && expr.constant == 0.0) {
            return;
        }
        self.objective.push(ObjectiveTerm {
            name: name.to_owned(),
            weight,
            expr,
        });
    }

    /// Weight of a named objective term, zero when absent.
    #[must_use]
    pub fn objective_weight(&self, name: &str) -> f64 {
        self.objective
            .iter()
            .filter(|term| term.name == name)
            .map(|term| term.weight)
            .sum()
    }

    /// Flattened weighted objective.
    #[must_use]
    pub fn objective_expr(&self) -> LinearExpr {
        let mut expr = LinearExpr::new();
        for term in &self.objective {
            expr.add_scaled(&term.expr, term.weight);
        }
        expr
    }

    /// Objective value of an assignment.
    #[must_use]
    pub fn evaluate_objective(&self, values: &[f64]) -> f64 {
        self.objective_expr().evaluate(values)
    }

    /// Number of binary variables.
    #[must_use]
    pub fn binary_count(&self) -> usize {
        self.variables
            .iter()
            .filter(|var| var.kind == VarKind::Binary)
            .count()
    }

    /// Labels of constraints violated by an assignment.
    #[must_use]
    pub fn violated(&self, values: &[f64], tol: f64) -> Vec<&str> {
        self.constraints
            .iter()
            .filter(|constraint| !constraint.is_satisfied(values, tol))
            .map(|constraint| constraint.label.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expressions_evaluate_with_constants() {
        let mut model = LinearModel::new();
        let x = model.continuous("x", 0.0, 10.0);
        let y = model.binary("y");
        let expr = LinearExpr::term(x, 2.0).plus(y, -3.0).plus_constant(1.0);
        assert!((expr.evaluate(&[4.0, 1.0]) - 6.0).abs() < 1e-12);
        assert_eq!(model.binary_count(), 1);
    }

    #[test]
    fn objective_combines_weighted_terms() {
        let mut model = LinearModel::new();
        let x = model.continuous("x", 0.0, 10.0);
        model.add_objective("cost", 2.0, LinearExpr::term(x, 1.5));
        model.add_objective("ignored", 0.0, LinearExpr::term(x, 100.0));
        assert_eq!(model.objective.len(), 1);
        assert!((model.evaluate_objective(&[2.0]) - 6.0).abs() < 1e-12);
        assert!((model.objective_weight("cost") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn violated_reports_labels() {
        let mut model = LinearModel::new();
        let x = model.continuous("x", 0.0, 10.0);
        model.constrain("cap", LinearExpr::term(x, 1.0), Relation::LessEq, 3.0);
        model.constrain("floor", LinearExpr::term(x, 1.0), Relation::GreaterEq, 1.0);
        assert!(model.violated(&[2.0], 1e-9).is_empty());
        assert_eq!(model.violated(&[4.0], 1e-9), vec!["cap"]);
    }
}
