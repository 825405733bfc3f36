//! Assembly and solving of constraint groups as boxed linear
//! complementarity problems.
//!
//! Once per step, [`GroupSolver`] turns a [`ConstrainedGroup`] into a dense
//! system by unit-impulse probing, solves it under box and friction-cone
//! bounds, and writes the resulting impulses back into the constraints.
//! A direct pivoting solver does the work on healthy systems; a projected
//! Gauss-Seidel fallback catches the degenerate ones.

pub(crate) mod assembly;

mod dantzig;
pub use dantzig::DantzigSolver;

mod pgs;
pub use pgs::{PgsOptions, PgsSolver};

use crate::{
    constraint::Constraint,
    gradient::{GradientCollector, LcpSnapshot},
};

use itertools::izip;
use std::rc::Rc;
use thiserror::Error;

/// Ways a boxed-LCP solve can go wrong.
///
/// Any of these makes the orchestrator fall back to its secondary solver
/// (when one is configured) and, failing that, clamp the solution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SolveError {
    /// The pivoting solver hit a singular free-set submatrix.
    #[error("unresolvable pivot on row {row}")]
    PivotBreakdown { row: usize },
    /// The solver ran out of iterations without converging.
    #[error("iteration limit reached without convergence")]
    IterationLimit,
    /// The solution contains NaN or infinity.
    #[error("solution is not finite")]
    NonFinite,
}

/// Mutable view of the assembled problem handed to a solver.
///
/// Solvers are allowed to clobber everything in here except `findex`; the
/// orchestrator keeps backups for the fallback path.
pub struct ProblemView<'a> {
    pub n: usize,
    /// Row stride of `a`; `n` rounded up to a multiple of 4.
    pub n_skip: usize,
    /// Leading rows that are unbounded equality rows regardless of bounds.
    pub nub: usize,
    /// Row-major `n` × `n_skip` system matrix. Padding columns are dead.
    pub a: &'a mut [f64],
    pub x: &'a mut [f64],
    pub b: &'a mut [f64],
    pub w: &'a mut [f64],
    pub lo: &'a mut [f64],
    pub hi: &'a mut [f64],
    /// Global friction indices; −1 or the row whose solution scales bounds.
    pub findex: &'a [isize],
}

impl ProblemView<'_> {
    /// Effective bounds of row `k`, with friction coupling applied against
    /// the current content of `x`.
    pub(crate) fn effective_bounds(&self, k: usize) -> (f64, f64) {
        let fi = self.findex[k];
        if fi >= 0 {
            let scale = self.x[fi as usize].abs();
            (self.lo[k] * scale, self.hi[k] * scale)
        } else {
            (self.lo[k], self.hi[k])
        }
    }

    pub(crate) fn row(&self, k: usize) -> &[f64] {
        &self.a[k * self.n_skip..k * self.n_skip + self.n]
    }
}

/// A solver for the boxed mixed linear complementarity problem:
/// find x, w with A·x + b = w, `lo[k] <= x[k] <= hi[k]` (bounds scaled by
/// `|x[findex[k]]|` for friction rows) and complementary slack per row.
pub trait BoxedLcp {
    /// Solve the problem in place, leaving the solution in `problem.x` and
    /// the residuals in `problem.w`.
    ///
    /// With `early_exit` the solver may give up at the first sign of
    /// numerical trouble instead of grinding to its iteration cap; the
    /// caller promises it has a fallback.
    fn solve(&self, problem: ProblemView<'_>, early_exit: bool) -> Result<(), SolveError>;

    /// Short name for log messages.
    fn name(&self) -> &'static str;
}

/// An ordered set of constraints solved together, plus an optional
/// gradient consumer observing the solve.
///
/// Groups should be partitioned so that different groups touch disjoint
/// bodies; constraints within one group are processed strictly in
/// insertion order, which also fixes the row layout of the system.
#[derive(Default)]
pub struct ConstrainedGroup {
    pub(crate) constraints: Vec<Box<dyn Constraint>>,
    pub(crate) collector: Option<Box<dyn GradientCollector>>,
}

impl ConstrainedGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, constraint: impl Constraint + 'static) {
        self.constraints.push(Box::new(constraint));
    }

    /// Attach a gradient consumer. This also enables the warm-start path.
    pub fn attach_collector(&mut self, collector: impl GradientCollector + 'static) {
        self.collector = Some(Box::new(collector));
    }

    pub fn detach_collector(&mut self) -> Option<Box<dyn GradientCollector>> {
        self.collector.take()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Total number of rows the group contributes to a system.
    pub fn total_dimension(&self) -> usize {
        self.constraints.iter().map(|c| c.dimension()).sum()
    }
}

/// Which path produced the impulses of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolvePath {
    /// The group had no rows; nothing was done.
    Empty,
    /// The previous step's solution was standardized into a solution of
    /// the new problem without running a solver.
    WarmStart,
    Primary,
    Secondary,
    /// Every solver failed; impulses were zeroed.
    Clamped,
}

/// Outcome of [`GroupSolver::step`].
#[derive(Clone, Copy, Debug)]
pub struct SolveReport {
    pub path: SolvePath,
    /// Total dimension of the solved system.
    pub dimension: usize,
}

/// Working buffers for one group's LCP, reused across steps.
///
/// `x` is deliberately retained from step to step: it is the previous
/// solution the warm-start path standardizes.
pub(crate) struct LcpBuffers {
    pub n: usize,
    pub n_skip: usize,
    pub a: Vec<f64>,
    pub x: Vec<f64>,
    pub b: Vec<f64>,
    pub w: Vec<f64>,
    pub lo: Vec<f64>,
    pub hi: Vec<f64>,
    pub findex: Vec<isize>,
    /// Global starting row per constraint; one extra entry holding `n`.
    pub offsets: Vec<usize>,
    // pre-solve backups for the fallback path
    backup_a: Vec<f64>,
    backup_x: Vec<f64>,
    backup_b: Vec<f64>,
    backup_lo: Vec<f64>,
    backup_hi: Vec<f64>,
    backup_findex: Vec<isize>,
    // pre-solve snapshots for gradient consumers
    square_a: Vec<f64>,
    col_norms_sq: Vec<f64>,
    grad_b: Vec<f64>,
    grad_lo: Vec<f64>,
    grad_hi: Vec<f64>,
    grad_findex: Vec<isize>,
}

impl LcpBuffers {
    fn new() -> Self {
        Self {
            n: 0,
            n_skip: 0,
            a: Vec::new(),
            x: Vec::new(),
            b: Vec::new(),
            w: Vec::new(),
            lo: Vec::new(),
            hi: Vec::new(),
            findex: Vec::new(),
            offsets: Vec::new(),
            backup_a: Vec::new(),
            backup_x: Vec::new(),
            backup_b: Vec::new(),
            backup_lo: Vec::new(),
            backup_hi: Vec::new(),
            backup_findex: Vec::new(),
            square_a: Vec::new(),
            col_norms_sq: Vec::new(),
            grad_b: Vec::new(),
            grad_lo: Vec::new(),
            grad_hi: Vec::new(),
            grad_findex: Vec::new(),
        }
    }

    /// Recompute offsets and resize buffers for a group's dimensions.
    /// Returns true if `x` changed size (which invalidates warm starts).
    fn resize_for(&mut self, dims: &[usize]) -> bool {
        self.offsets.clear();
        self.offsets.push(0);
        let mut n = 0;
        for d in dims {
            n += d;
            self.offsets.push(n);
        }

        let x_resized = n != self.x.len();
        if x_resized {
            self.x.clear();
            self.x.resize(n, 0.0);
        }
        if n != self.n {
            self.n = n;
            self.n_skip = (n + 3) & !3;
            self.a.resize(self.n * self.n_skip, 0.0);
        }
        self.b.resize(n, 0.0);
        self.w.resize(n, 0.0);
        self.lo.resize(n, 0.0);
        self.hi.resize(n, 0.0);
        self.findex.resize(n, -1);
        x_resized
    }

    fn problem_view(&mut self) -> ProblemView<'_> {
        ProblemView {
            n: self.n,
            n_skip: self.n_skip,
            nub: 0,
            a: &mut self.a,
            x: &mut self.x,
            b: &mut self.b,
            w: &mut self.w,
            lo: &mut self.lo,
            hi: &mut self.hi,
            findex: &self.findex,
        }
    }

    fn backup(&mut self) {
        self.backup_a.clone_from(&self.a);
        self.backup_x.clone_from(&self.x);
        self.backup_b.clone_from(&self.b);
        self.backup_lo.clone_from(&self.lo);
        self.backup_hi.clone_from(&self.hi);
        self.backup_findex.clone_from(&self.findex);
    }

    fn restore(&mut self) {
        self.a.clone_from(&self.backup_a);
        self.x.clone_from(&self.backup_x);
        self.b.clone_from(&self.backup_b);
        self.lo.clone_from(&self.backup_lo);
        self.hi.clone_from(&self.backup_hi);
        self.findex.clone_from(&self.backup_findex);
    }

    /// Copy the square part of the system (padding stripped) and the other
    /// inputs for gradient use, and precompute columnwise squared norms.
    fn snapshot_for_gradients(&mut self) {
        let n = self.n;
        self.square_a.resize(n * n, 0.0);
        for row in 0..n {
            self.square_a[row * n..(row + 1) * n]
                .copy_from_slice(&self.a[row * self.n_skip..row * self.n_skip + n]);
        }
        self.col_norms_sq.clear();
        self.col_norms_sq.resize(n, 0.0);
        for row in 0..n {
            for col in 0..n {
                let v = self.square_a[row * n + col];
                self.col_norms_sq[col] += v * v;
            }
        }
        self.grad_b.clone_from(&self.b);
        self.grad_lo.clone_from(&self.lo);
        self.grad_hi.clone_from(&self.hi);
        self.grad_findex.clone_from(&self.findex);
    }

    fn x_has_nan(&self) -> bool {
        self.x.iter().any(|v| v.is_nan())
    }

    /// Textual dump of the whole problem for debugging failed solves.
    /// `A·x` and `b + w` should match on a correctly solved system.
    fn dump(&self) -> String {
        use std::fmt::Write;
        let n = self.n;
        let mut out = String::new();
        let _ = writeln!(out, "A =");
        for row in 0..n {
            let _ = writeln!(
                out,
                "  {:?}",
                &self.a[row * self.n_skip..row * self.n_skip + n]
            );
        }
        let _ = writeln!(out, "x = {:?}", self.x);
        let _ = writeln!(out, "b = {:?}", self.b);
        let _ = writeln!(out, "w = {:?}", self.w);
        let _ = writeln!(out, "findex = {:?}", self.findex);
        let ax: Vec<f64> = (0..n)
            .map(|row| {
                let r = &self.a[row * self.n_skip..row * self.n_skip + n];
                r.iter().zip(&self.x).map(|(a, x)| a * x).sum()
            })
            .collect();
        let bw: Vec<f64> = izip!(&self.b, &self.w).map(|(b, w)| b + w).collect();
        let _ = writeln!(out, "A*x = {ax:?}");
        let _ = writeln!(out, "b + w = {bw:?}");
        out
    }
}

/// Per-step driver: assembles a group into a boxed LCP, runs the
/// primary/secondary solver cascade and applies the impulses.
pub struct GroupSolver {
    time_step: f64,
    cfm_enabled: bool,
    primary: Rc<dyn BoxedLcp>,
    secondary: Option<Rc<dyn BoxedLcp>>,
    bufs: LcpBuffers,
}

impl GroupSolver {
    /// A solver with the default cascade: pivoting primary,
    /// projected Gauss-Seidel secondary.
    pub fn new(time_step: f64) -> Self {
        let mut solver = Self {
            time_step: 1.0 / 60.0,
            cfm_enabled: true,
            primary: Rc::new(DantzigSolver::default()),
            secondary: Some(Rc::new(PgsSolver::default())),
            bufs: LcpBuffers::new(),
        };
        solver.set_time_step(time_step);
        solver
    }

    pub fn with_primary(mut self, solver: Rc<dyn BoxedLcp>) -> Self {
        self.set_primary(Some(solver));
        self
    }

    pub fn with_secondary(mut self, solver: Option<Rc<dyn BoxedLcp>>) -> Self {
        self.set_secondary(solver);
        self
    }

    /// Toggle constraint force mixing on the diagonal blocks of assembled
    /// systems.
    pub fn with_cfm(mut self, enabled: bool) -> Self {
        self.cfm_enabled = enabled;
        self
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn set_time_step(&mut self, time_step: f64) {
        if time_step > 0.0 {
            self.time_step = time_step;
        } else {
            log::warn!("ignoring non-positive time step {time_step}");
        }
    }

    /// Set the primary solver. `None` is a misconfiguration and substitutes
    /// the default pivoting solver.
    pub fn set_primary(&mut self, solver: Option<Rc<dyn BoxedLcp>>) {
        match solver {
            Some(s) => self.primary = s,
            None => {
                log::warn!("primary solver cannot be unset, substituting the pivoting solver");
                self.primary = Rc::new(DantzigSolver::default());
            }
        }
        self.check_distinct_solvers();
    }

    /// Set or clear the fallback solver. Clearing it also disables the
    /// backup and early-termination machinery.
    pub fn set_secondary(&mut self, solver: Option<Rc<dyn BoxedLcp>>) {
        self.secondary = solver;
        self.check_distinct_solvers();
    }

    fn check_distinct_solvers(&mut self) {
        let same_instance = matches!(
            &self.secondary,
            Some(secondary) if Rc::ptr_eq(&self.primary, secondary)
        );
        if same_instance {
            log::warn!(
                "primary and secondary solvers are the same instance, dropping the fallback"
            );
            self.secondary = None;
        }
    }

    /// Run one step of the constraint-resolution pipeline on a group:
    /// assemble, solve with fallback, sanitize, apply impulses.
    ///
    /// Always succeeds in the sense that every constraint receives finite
    /// (possibly zero) impulses; the report says how degraded the path was.
    pub fn step(&mut self, group: &mut ConstrainedGroup) -> SolveReport {
        let _span = tracy_client::span!("solve constrained group");

        let dims: Vec<usize> = group.constraints.iter().map(|c| c.dimension()).collect();
        debug_assert!(dims.iter().all(|&d| d >= 1));
        let x_resized = self.bufs.resize_for(&dims);
        let n = self.bufs.n;
        if n == 0 {
            return SolveReport {
                path: SolvePath::Empty,
                dimension: 0,
            };
        }

        assembly::assemble(
            &mut self.bufs,
            &mut group.constraints,
            group.collector.as_deref_mut(),
            1.0 / self.time_step,
            self.cfm_enabled,
        );

        if self.secondary.is_some() {
            self.bufs.backup();
        }
        if group.collector.is_some() {
            self.bufs.snapshot_for_gradients();
        }

        // Warm start: with a gradient consumer attached and a previous
        // solution of the right size, let the consumer try to standardize
        // that solution into one of the new problem. On success the whole
        // solver cascade is skipped, which keeps the solution continuous in
        // the inputs across steps.
        let mut path: Option<SolvePath> = None;
        if !x_resized {
            if let Some(collector) = group.collector.as_deref_mut() {
                let snap = LcpSnapshot {
                    n,
                    a: &self.bufs.square_a,
                    b: &self.bufs.grad_b,
                    lo: &self.bufs.grad_lo,
                    hi: &self.bufs.grad_hi,
                    findex: &self.bufs.grad_findex,
                    col_norms_sq: &self.bufs.col_norms_sq,
                };
                if collector.construct_matrices(snap, &self.bufs.x)
                    && collector.opportunistically_standardize_results(snap, &mut self.bufs.x)
                {
                    path = Some(SolvePath::WarmStart);
                }
            }
        }

        if path.is_none() {
            let _solve_span = tracy_client::span!("boxed lcp solve");
            let early_exit = self.secondary.is_some();
            let primary_result = self.primary.solve(self.bufs.problem_view(), early_exit);

            if primary_result.is_ok() && !self.bufs.x_has_nan() {
                path = Some(SolvePath::Primary);
            } else if let Some(secondary) = &self.secondary {
                match &primary_result {
                    Err(err) => log::warn!(
                        "{} failed ({err}), falling back to {}",
                        self.primary.name(),
                        secondary.name()
                    ),
                    Ok(()) => log::warn!(
                        "{} produced NaN, falling back to {}",
                        self.primary.name(),
                        secondary.name()
                    ),
                }
                self.bufs.restore();
                // the fallback's own verdict doesn't matter, its solution
                // is used as-is after the NaN clamp below
                let _ = secondary.solve(self.bufs.problem_view(), false);
                path = Some(SolvePath::Secondary);
            } else {
                match &primary_result {
                    // a finite but failed solve leaves partial garbage in
                    // x; with no fallback the only safe impulses are zero
                    Err(err) => {
                        log::warn!(
                            "{} failed ({err}) with no fallback configured, zeroing impulses",
                            self.primary.name()
                        );
                        self.bufs.x.fill(0.0);
                        path = Some(SolvePath::Clamped);
                    }
                    Ok(()) => path = Some(SolvePath::Primary),
                }
            }
        }

        let mut path = path.unwrap();
        if self.bufs.x_has_nan() {
            log::error!("constraint impulses are NaN after every solver, zeroing them");
            log::debug!("offending problem:\n{}", self.bufs.dump());
            self.bufs.x.fill(0.0);
            path = SolvePath::Clamped;
        }

        // hand the final solution to the gradient consumer, unless the warm
        // start already validated it against the current problem
        if path != SolvePath::WarmStart {
            if let Some(collector) = group.collector.as_deref_mut() {
                let snap = LcpSnapshot {
                    n,
                    a: &self.bufs.square_a,
                    b: &self.bufs.grad_b,
                    lo: &self.bufs.grad_lo,
                    hi: &self.bufs.grad_hi,
                    findex: &self.bufs.grad_findex,
                    col_norms_sq: &self.bufs.col_norms_sq,
                };
                collector.register_lcp_results(snap, &self.bufs.x);
                // a rank-deficient system has many solutions; let the
                // consumer replace ours with the least-squares one
                if collector.construct_matrices(snap, &self.bufs.x) {
                    collector.opportunistically_standardize_results(snap, &mut self.bufs.x);
                }
            }
        }

        for (constraint, rows) in izip!(&mut group.constraints, self.bufs.offsets.windows(2)) {
            constraint.apply_impulse(&self.bufs.x[rows[0]..rows[1]]);
            // mark the constraint active for downstream integration
            constraint.excite();
        }

        SolveReport {
            path,
            dimension: n,
        }
    }
}

//
// tests
//
