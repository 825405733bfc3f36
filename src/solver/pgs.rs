//! Projected Gauss-Seidel solver, the robust fallback of the cascade.

use super::{BoxedLcp, ProblemView, SolveError};

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

/// Diagonal magnitudes below this mark a row the iteration cannot control;
/// such rows are skipped instead of divided by.
const DIVISION_EPSILON: f64 = 1e-9;

/// Tuning for [`PgsSolver`].
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde-types", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct PgsOptions {
    /// Hard cap on sweeps over the system.
    pub max_iterations: u32,
    /// Converged when the norm of a sweep's impulse deltas drops below this.
    pub outer_tolerance: f64,
    /// Converged when every single impulse delta in a sweep is below this.
    pub inner_tolerance: f64,
    /// Converged when the worst complementarity violation is below this.
    pub complementarity_tolerance: f64,
    /// Shuffle the sweep order every iteration. Breaks up the systematic
    /// bias of a fixed ordering on some systems.
    pub randomize_order: bool,
    /// Guard the diagonal divisions with a small extra term.
    pub use_cfm: bool,
}

impl Default for PgsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            outer_tolerance: 1e-6,
            inner_tolerance: 1e-8,
            complementarity_tolerance: 1e-6,
            randomize_order: false,
            use_cfm: true,
        }
    }
}

impl PgsOptions {
    /// Preset tight enough to serve as ground truth when finite-difference
    /// testing gradients. Far too slow for stepping a simulation.
    pub fn hyper_accurate() -> Self {
        Self {
            max_iterations: 1000,
            outer_tolerance: 1e-10,
            inner_tolerance: 1e-8,
            complementarity_tolerance: 1e-8,
            randomize_order: false,
            use_cfm: true,
        }
    }
}

/// Iterative boxed-LCP solver.
///
/// Slower to converge than the pivoting solver and only approximately
/// complementary, but monotone and indifferent to rank deficiency: a row
/// the system cannot control is simply left clamped instead of poisoning
/// the solution. Friction bounds are re-read from the live solution on
/// every projection, so the friction cone holds even while the coupled
/// normal impulse is still moving.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgsSolver {
    pub options: PgsOptions,
}

impl PgsSolver {
    pub fn new(options: PgsOptions) -> Self {
        Self { options }
    }

    pub fn hyper_accurate() -> Self {
        Self {
            options: PgsOptions::hyper_accurate(),
        }
    }
}

impl BoxedLcp for PgsSolver {
    fn solve(&self, mut p: ProblemView<'_>, _early_exit: bool) -> Result<(), SolveError> {
        let n = p.n;
        if n == 0 {
            return Ok(());
        }
        let opts = &self.options;
        let guard = if opts.use_cfm { DIVISION_EPSILON } else { 0.0 };

        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = SmallRng::seed_from_u64(0x9e3779b97f4a7c15);

        for _ in 0..opts.max_iterations {
            if opts.randomize_order {
                order.shuffle(&mut rng);
            }

            let mut max_delta: f64 = 0.0;
            let mut delta_norm_sq = 0.0;
            for &k in &order {
                let diag = p.a[k * p.n_skip + k];
                let (elo, ehi) = p.effective_bounds(k);
                if !(diag.abs() > DIVISION_EPSILON) {
                    // uncontrollable row; keep it inside its bounds and
                    // move on
                    p.x[k] = p.x[k].clamp(elo, ehi);
                    continue;
                }

                let residual = p.b[k]
                    + p.row(k)
                        .iter()
                        .zip(&*p.x)
                        .map(|(a, x)| a * x)
                        .sum::<f64>();
                let new_x = (p.x[k] - residual / (diag + guard)).clamp(elo, ehi);
                let delta = new_x - p.x[k];
                p.x[k] = new_x;
                max_delta = max_delta.max(delta.abs());
                delta_norm_sq += delta * delta;
            }

            if max_delta <= opts.inner_tolerance
                || delta_norm_sq.sqrt() <= opts.outer_tolerance
                || worst_complementarity_violation(&p) <= opts.complementarity_tolerance
            {
                break;
            }
        }

        // leave the residuals behind for the caller
        for k in 0..n {
            p.w[k] = p.b[k]
                + p.row(k)
                    .iter()
                    .zip(&*p.x)
                    .map(|(a, x)| a * x)
                    .sum::<f64>();
        }

        if p.x.iter().any(|v| !v.is_finite()) {
            return Err(SolveError::NonFinite);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "projected gauss-seidel"
    }
}

/// Worst violation of the boxed complementarity conditions by the current
/// solution. Rows the iteration cannot control are excluded; they would
/// report a violation forever.
fn worst_complementarity_violation(p: &ProblemView<'_>) -> f64 {
    let mut worst: f64 = 0.0;
    for k in 0..p.n {
        let diag = p.a[k * p.n_skip + k];
        if !(diag.abs() > DIVISION_EPSILON) {
            continue;
        }
        let w = p.b[k]
            + p.row(k)
                .iter()
                .zip(&*p.x)
                .map(|(a, x)| a * x)
                .sum::<f64>();
        let (elo, ehi) = p.effective_bounds(k);
        let violation = if (p.x[k] - elo).abs() < 1e-12 {
            (-w).max(0.0)
        } else if (p.x[k] - ehi).abs() < 1e-12 {
            w.max(0.0)
        } else {
            w.abs()
        };
        worst = worst.max(violation);
    }
    worst
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;

    const INF: f64 = f64::INFINITY;

    fn solve_with(
        solver: &PgsSolver,
        a: &[f64],
        b: &[f64],
        lo: &[f64],
        hi: &[f64],
        findex: &[isize],
    ) -> (Vec<f64>, Vec<f64>) {
        let n = b.len();
        let n_skip = (n + 3) & !3;
        let mut a_padded = vec![0.0; n * n_skip];
        for row in 0..n {
            a_padded[row * n_skip..row * n_skip + n].copy_from_slice(&a[row * n..(row + 1) * n]);
        }
        let mut x = vec![0.0; n];
        let mut w = vec![0.0; n];
        let (mut b, mut lo, mut hi) = (b.to_vec(), lo.to_vec(), hi.to_vec());
        solver
            .solve(
                ProblemView {
                    n,
                    n_skip,
                    nub: 0,
                    a: &mut a_padded,
                    x: &mut x,
                    b: &mut b,
                    w: &mut w,
                    lo: &mut lo,
                    hi: &mut hi,
                    findex,
                },
                false,
            )
            .unwrap();
        (x, w)
    }

    #[test]
    fn matches_pivoting_solver_on_coupled_contacts() {
        let (x, _) = solve_with(
            &PgsSolver::hyper_accurate(),
            &[2.0, 1.0, 1.0, 2.0],
            &[-1.0, -1.0],
            &[0.0, 0.0],
            &[INF, INF],
            &[-1, -1],
        );
        assert!((x[0] - 1.0 / 3.0).abs() < 1e-6);
        assert!((x[1] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn survives_a_zero_row() {
        let a = [
            0.0, 0.0, //
            0.0, 2.0,
        ];
        let (x, _) = solve_with(
            &PgsSolver::default(),
            &a,
            &[-1.0, -1.0],
            &[0.0, 0.0],
            &[INF, INF],
            &[-1, -1],
        );
        assert!(x.iter().all(|v| v.is_finite()));
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn survives_rank_deficiency() {
        // duplicated contact: singular but consistent
        let a = [
            2.0, 2.0, //
            2.0, 2.0,
        ];
        let (x, w) = solve_with(
            &PgsSolver::hyper_accurate(),
            &a,
            &[-1.0, -1.0],
            &[0.0, 0.0],
            &[INF, INF],
            &[-1, -1],
        );
        assert!(x.iter().all(|v| v.is_finite()));
        // total impulse is what matters on a duplicated row
        assert!((2.0 * (x[0] + x[1]) - 1.0).abs() < 1e-6);
        assert!(w.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn friction_reads_live_normal_impulse() {
        // sliding block: tangential row saturates at mu times the *final*
        // normal impulse
        let a = [
            2.0, 0.0, //
            0.0, 1.0,
        ];
        let (x, _) = solve_with(
            &PgsSolver::hyper_accurate(),
            &a,
            &[-1.0, 3.0],
            &[0.0, -0.5],
            &[INF, 0.5],
            &[-1, 0],
        );
        assert!((x[0] - 0.5).abs() < 1e-6);
        assert!((x[1] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn randomized_order_still_converges() {
        let solver = PgsSolver::new(PgsOptions {
            randomize_order: true,
            max_iterations: 200,
            ..Default::default()
        });
        let (x, _) = solve_with(
            &solver,
            &[2.0, 1.0, 1.0, 2.0],
            &[-1.0, -1.0],
            &[0.0, 0.0],
            &[INF, INF],
            &[-1, -1],
        );
        assert!((x[0] - 1.0 / 3.0).abs() < 1e-4);
        assert!((x[1] - 1.0 / 3.0).abs() < 1e-4);
    }
}
