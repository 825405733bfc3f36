//! Constraint resolution for articulated rigid-body simulation.
//!
//! Each step, a group of contact and joint constraints is assembled into a
//! dense boxed linear complementarity problem by probing every constraint
//! with unit impulses, solved under box and friction-cone bounds, and the
//! resulting impulses are applied back to the bodies. A direct pivoting
//! solver handles the common case; a projected Gauss-Seidel fallback keeps
//! degenerate systems from derailing the simulation.

pub mod math;

pub mod body;

pub mod constraint;
pub use constraint::{BallConstraint, Constraint, ConstraintInfo, ContactConstraint, Stabilization};

pub mod gradient;
pub use gradient::GradientCollector;

pub mod solver;
pub use solver::{
    BoxedLcp, ConstrainedGroup, DantzigSolver, GroupSolver, PgsOptions, PgsSolver, SolveError,
    SolvePath, SolveReport,
};

pub mod joint;
pub use joint::BallJoint;
