//! Linear model types, the piecewise-linear pump power curve and the builder
//! that assembles a cycle's MILP from state, forecast and constraints.

/// Cycle model assembly.
pub mod builder;
/// Variables, expressions and constraints.
pub mod linear;
/// Piecewise-linear pump power.
pub mod power;

pub use builder::{ConstraintModelBuilder, DecisionModel, ModelFidelity, PumpVars};
pub use linear::{LinearConstraint, LinearExpr, LinearModel, ObjectiveTerm, Relation, VarId, VarKind};
pub use power::{PowerCurve, PowerLine};
