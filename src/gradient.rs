//! Hook for differentiable-simulation consumers.
//!
//! The solver knows nothing about gradients. It exposes a capability that a
//! gradient consumer can attach to a constrained group; the solver then
//! calls into it at fixed points of the step so the consumer can snapshot
//! whatever it needs, and gives it one chance to *replace* the solve
//! entirely by standardizing the previous step's solution (the warm start).

/// Snapshot of the assembled problem handed to a [`GradientCollector`].
///
/// `a` is the square `n`×`n` system matrix with the row padding stripped,
/// in row-major order. `col_norms_sq` holds the squared Euclidean norm of
/// each of its columns.
#[derive(Clone, Copy, Debug)]
pub struct LcpSnapshot<'a> {
    pub n: usize,
    pub a: &'a [f64],
    pub b: &'a [f64],
    pub lo: &'a [f64],
    pub hi: &'a [f64],
    pub findex: &'a [isize],
    pub col_norms_sq: &'a [f64],
}

/// Per-constraint registration data captured during assembly,
/// before friction indices are rebased to global rows.
#[derive(Clone, Copy, Debug)]
pub struct ConstraintRegistration<'a> {
    /// Position of the constraint in the group's iteration order.
    pub index: usize,
    /// First global row of the constraint.
    pub offset: usize,
    pub lo: &'a [f64],
    pub hi: &'a [f64],
    pub b: &'a [f64],
    /// Local friction indices (−1 or `0..dimension`).
    pub findex: &'a [isize],
}

/// Capability implemented by a gradient-matrix consumer.
///
/// Attach one to a [`ConstrainedGroup`](crate::ConstrainedGroup) to receive
/// callbacks; the solver works identically whether or not one is attached,
/// except for the warm-start path which requires one.
pub trait GradientCollector {
    /// Called once per constraint during assembly, right after the
    /// constraint has filled its workspace slice.
    fn register_constraint(&mut self, registration: ConstraintRegistration<'_>);

    /// Called while constraint `index` is excited, after all of its rows
    /// have been probed.
    fn measure_constraint_impulse(&mut self, index: usize);

    /// Called with the final solution of a full (non-warm-started) solve.
    fn register_lcp_results(&mut self, snapshot: LcpSnapshot<'_>, x: &[f64]);

    /// Derive the active-set partition implied by a solution `x` of the
    /// problem in `snapshot`. Returns false when no valid partition exists.
    fn construct_matrices(&mut self, snapshot: LcpSnapshot<'_>, x: &[f64]) -> bool;

    /// Project `x` onto the nearest solution of the problem in `snapshot`
    /// under the partition derived by the last `construct_matrices` call.
    ///
    /// Returning true means `x` now solves the new problem and the solver
    /// may skip the solve; false means fall through to a full solve.
    fn opportunistically_standardize_results(
        &mut self,
        snapshot: LcpSnapshot<'_>,
        x: &mut [f64],
    ) -> bool;
}
