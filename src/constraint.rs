//! The probe interface between individual constraints and the group solver.
//!
//! A constraint doesn't hand the solver a Jacobian. Instead the solver
//! *probes* it: apply a unit impulse on one row, read back the velocity
//! response of every row, and let the responses form the system matrix one
//! row at a time. This keeps the solver completely ignorant of joint types
//! and body models.

mod contact;
pub use contact::ContactConstraint;

mod ball;
pub use ball::BallConstraint;

/// View into one constraint's slice of the group workspace,
/// handed to [`Constraint::fill_info`] once per step.
///
/// All slices have the constraint's dimension. `findex` entries are written
/// in *local* row indices (−1 or `0..d`); the assembler rebases them to
/// global rows afterwards.
pub struct ConstraintInfo<'a> {
    /// Lower impulse bounds, `lo[k] <= 0`.
    pub lo: &'a mut [f64],
    /// Upper impulse bounds, `hi[k] >= 0`.
    pub hi: &'a mut [f64],
    /// Desired post-step relative velocity offset per row.
    pub b: &'a mut [f64],
    /// Residual output, pre-zeroed by the assembler.
    pub w: &'a mut [f64],
    /// Friction index per row: −1 for an independent row, otherwise the
    /// local index of the normal row whose solved impulse scales this
    /// row's bounds.
    pub findex: &'a mut [isize],
    /// Inverse of the orchestrator's time step.
    pub inv_dt: f64,
}

/// A group of constraint rows over some set of bodies.
///
/// Call order per step: `fill_info`, then `excite`, then for each local row
/// `apply_unit_impulse` followed by `velocity_change` calls on this and
/// every other constraint in the group, then `unexcite`. After the solve,
/// `apply_impulse` receives the final impulses.
pub trait Constraint {
    /// Number of rows this constraint contributes to the system. At least 1.
    fn dimension(&self) -> usize;

    /// Fill bounds, right-hand side and friction indices for this step.
    fn fill_info(&mut self, info: ConstraintInfo<'_>);

    /// Enter the impulse-probe phase.
    fn excite(&mut self);

    /// Leave the impulse-probe phase.
    fn unexcite(&mut self);

    /// Apply a unit impulse on local row `row` to the probe state of the
    /// attached bodies.
    fn apply_unit_impulse(&mut self, row: usize);

    /// Read the velocity response of this constraint's rows to the most
    /// recent unit impulse into `dest` (length = dimension).
    ///
    /// `with_cfm` is true only when the probing row belongs to this same
    /// constraint, i.e. on the diagonal block; the implementation then
    /// inflates its own diagonal entry as a regularizer.
    fn velocity_change(&self, dest: &mut [f64], with_cfm: bool);

    /// Apply the final solved impulses (length = dimension) to the bodies.
    fn apply_impulse(&mut self, impulses: &[f64]);
}

/// Tuning knobs for positional error correction shared by the example
/// constraints.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde-types", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct Stabilization {
    /// Positional error below this is not corrected at all.
    pub error_allowance: f64,
    /// Fraction of the remaining error corrected per step.
    pub error_reduction: f64,
    /// Cap on the correction velocity injected per step.
    pub max_correction_velocity: f64,
    /// Constraint force mixing: relative inflation of the diagonal of the
    /// system matrix. Trades a little constraint violation for conditioning.
    pub cfm: f64,
}

impl Default for Stabilization {
    fn default() -> Self {
        Self {
            error_allowance: 0.0,
            error_reduction: 0.01,
            max_correction_velocity: 1e3,
            cfm: 1e-5,
        }
    }
}

impl Stabilization {
    /// Correction velocity for a (signed) positional error.
    pub(crate) fn correction_velocity(&self, error: f64, inv_dt: f64) -> f64 {
        let past_allowance = if error > self.error_allowance {
            error - self.error_allowance
        } else if error < -self.error_allowance {
            error + self.error_allowance
        } else {
            return 0.0;
        };
        (self.error_reduction * inv_dt * past_allowance)
            .clamp(-self.max_correction_velocity, self.max_correction_velocity)
    }
}
