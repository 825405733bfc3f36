//! Direct boxed-LCP solver built on principal pivoting.

use super::{BoxedLcp, ProblemView, SolveError};

/// Pivot magnitudes below this are treated as a singular free block.
const ZERO_PIVOT: f64 = 1e-12;
/// Slack allowed on bound and residual sign checks.
const TOL: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RowSet {
    Lower,
    Upper,
    Free,
}

/// Principal-pivoting solver for the boxed mixed LCP.
///
/// Guesses a partition of rows into free rows (zero residual) and rows
/// clamped at a bound, solves the free block directly, and flips the worst
/// violator until the partition is consistent. Exact and fast when the
/// system is symmetric positive-semidefinite on the free rows, but brittle
/// on rank-deficient input; callers should keep a fallback around.
#[derive(Clone, Copy, Debug, Default)]
pub struct DantzigSolver;

impl BoxedLcp for DantzigSolver {
    fn solve(&self, mut p: ProblemView<'_>, early_exit: bool) -> Result<(), SolveError> {
        let n = p.n;
        if n == 0 {
            return Ok(());
        }

        // the previous solution is no use to a direct method
        p.x.fill(0.0);

        let mut state: Vec<RowSet> = (0..n)
            .map(|k| {
                if k < p.nub || (p.lo[k] == f64::NEG_INFINITY && p.hi[k] == f64::INFINITY) {
                    RowSet::Free
                } else if p.lo[k] == f64::NEG_INFINITY {
                    RowSet::Upper
                } else {
                    RowSet::Lower
                }
            })
            .collect();

        // scratch for the free-block solves
        let mut free: Vec<usize> = Vec::with_capacity(n);
        let mut sub = vec![0.0; n * n];
        let mut rhs = vec![0.0; n];

        let max_pivots = 16 + 4 * n;
        for _ in 0..max_pivots {
            // clamp bound rows at their effective bounds; friction bounds
            // move between pivots as the coupled normal impulses change
            for k in 0..n {
                let (elo, ehi) = p.effective_bounds(k);
                match state[k] {
                    RowSet::Lower => p.x[k] = elo,
                    RowSet::Upper => p.x[k] = ehi,
                    RowSet::Free => (),
                }
            }

            free.clear();
            free.extend((0..n).filter(|&k| state[k] == RowSet::Free));

            if !free.is_empty() {
                // A_FF x_F = -b_F - A_FC x_C
                let nf = free.len();
                for (fi, &row) in free.iter().enumerate() {
                    let a_row = &p.a[row * p.n_skip..row * p.n_skip + n];
                    let mut r = -p.b[row];
                    for k in 0..n {
                        if state[k] != RowSet::Free {
                            r -= a_row[k] * p.x[k];
                        }
                    }
                    rhs[fi] = r;
                    for (fj, &col) in free.iter().enumerate() {
                        sub[fi * nf + fj] = a_row[col];
                    }
                }

                if let Err(col) = solve_dense(&mut sub[..nf * nf], &mut rhs[..nf]) {
                    let row = free[col];
                    if early_exit {
                        return Err(SolveError::PivotBreakdown { row });
                    }
                    // without the early out, demote the offending row to a
                    // bound and keep pivoting; a row with no finite bound
                    // can't be demoted and ends the solve
                    let (elo, ehi) = p.effective_bounds(row);
                    state[row] = if elo.is_finite() {
                        RowSet::Lower
                    } else if ehi.is_finite() {
                        RowSet::Upper
                    } else {
                        return Err(SolveError::PivotBreakdown { row });
                    };
                    continue;
                }
                for (fi, &row) in free.iter().enumerate() {
                    p.x[row] = rhs[fi];
                }
            }

            for k in 0..n {
                let a_row = &p.a[k * p.n_skip..k * p.n_skip + n];
                p.w[k] = p.b[k] + a_row.iter().zip(&*p.x).map(|(a, x)| a * x).sum::<f64>();
            }

            // find the single worst violation of the partition
            let mut worst: Option<(f64, usize, RowSet)> = None;
            let mut consider = |violation: f64, row: usize, target: RowSet| {
                if violation > worst.map_or(TOL, |(v, _, _)| v) {
                    worst = Some((violation, row, target));
                }
            };
            for k in 0..n {
                let (elo, ehi) = p.effective_bounds(k);
                match state[k] {
                    RowSet::Free => {
                        if p.x[k] < elo {
                            consider(elo - p.x[k], k, RowSet::Lower);
                        } else if p.x[k] > ehi {
                            consider(p.x[k] - ehi, k, RowSet::Upper);
                        }
                    }
                    // a pinned row (elo == ehi) stays clamped no matter
                    // what its residual is
                    RowSet::Lower => {
                        if ehi > elo && p.w[k] < 0.0 {
                            consider(-p.w[k], k, RowSet::Free);
                        }
                    }
                    RowSet::Upper => {
                        if ehi > elo && p.w[k] > 0.0 {
                            consider(p.w[k], k, RowSet::Free);
                        }
                    }
                }
            }

            match worst {
                None => {
                    // friction bounds move with the freshly solved normal
                    // impulses; if a clamped row slid off its bound, go
                    // around once more with the partition unchanged
                    let drifted = (0..n).any(|k| {
                        let (elo, ehi) = p.effective_bounds(k);
                        let target = match state[k] {
                            RowSet::Lower => elo,
                            RowSet::Upper => ehi,
                            RowSet::Free => return false,
                        };
                        (p.x[k] - target).abs() > TOL
                    });
                    if !drifted {
                        if p.x.iter().any(|v| !v.is_finite()) {
                            return Err(SolveError::NonFinite);
                        }
                        return Ok(());
                    }
                }
                Some((_, row, target)) => state[row] = target,
            }
        }

        Err(SolveError::IterationLimit)
    }

    fn name(&self) -> &'static str {
        "dantzig"
    }
}

/// In-place Gaussian elimination with partial pivoting on a dense square
/// row-major system. On a too-small pivot, returns the offending column.
fn solve_dense(m: &mut [f64], rhs: &mut [f64]) -> Result<(), usize> {
    let n = rhs.len();
    for col in 0..n {
        // partial pivot
        let mut pivot_row = col;
        let mut pivot_mag = m[col * n + col].abs();
        for row in (col + 1)..n {
            let mag = m[row * n + col].abs();
            if mag > pivot_mag {
                pivot_row = row;
                pivot_mag = mag;
            }
        }
        if !(pivot_mag > ZERO_PIVOT) {
            return Err(col);
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap(col * n + k, pivot_row * n + k);
            }
            rhs.swap(col, pivot_row);
        }

        let pivot = m[col * n + col];
        for row in (col + 1)..n {
            let factor = m[row * n + col] / pivot;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                m[row * n + k] -= factor * m[col * n + k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    // back substitution
    for col in (0..n).rev() {
        let mut v = rhs[col];
        for k in (col + 1)..n {
            v -= m[col * n + k] * rhs[k];
        }
        rhs[col] = v / m[col * n + col];
    }
    Ok(())
}

//
// tests
//
