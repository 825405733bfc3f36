//! Dense assembly of a constraint group's boxed LCP by unit-impulse
//! probing.
//!
//! Only the upper triangle of the system matrix is ever measured; the
//! lower triangle is mirrored from it. Probing is by far the most
//! expensive part of a step (each entry costs a propagation through the
//! articulated-body dynamics), so halving the probe count this way matters
//! more than anything else here. The mirroring is also what makes the
//! symmetry invariant hold by construction rather than by luck.

use super::LcpBuffers;
use crate::{
    constraint::{Constraint, ConstraintInfo},
    gradient::{ConstraintRegistration, GradientCollector},
};

/// Fill `bufs` from the group's constraints.
///
/// Expects `bufs` to be resized for the group already (`offsets` in
/// particular). Local friction indices are rebased to global rows here.
pub(crate) fn assemble<'a>(
    bufs: &mut LcpBuffers,
    constraints: &mut [Box<dyn Constraint>],
    mut collector: Option<&'a mut (dyn GradientCollector + 'static)>,
    inv_dt: f64,
    with_cfm: bool,
) {
    let _span = tracy_client::span!("assemble group lcp");

    let n = bufs.n;
    if n == 0 {
        return;
    }
    let n_skip = bufs.n_skip;

    bufs.w.fill(0.0);
    bufs.findex.fill(-1);
    if cfg!(debug_assertions) {
        // release builds skip this; every live entry is written below
        bufs.a.fill(0.0);
    }

    for i in 0..constraints.len() {
        let offset = bufs.offsets[i];
        let dim = bufs.offsets[i + 1] - offset;

        constraints[i].fill_info(ConstraintInfo {
            lo: &mut bufs.lo[offset..offset + dim],
            hi: &mut bufs.hi[offset..offset + dim],
            b: &mut bufs.b[offset..offset + dim],
            w: &mut bufs.w[offset..offset + dim],
            findex: &mut bufs.findex[offset..offset + dim],
            inv_dt,
        });

        if let Some(collector) = collector.as_deref_mut() {
            collector.register_constraint(ConstraintRegistration {
                index: i,
                offset,
                lo: &bufs.lo[offset..offset + dim],
                hi: &bufs.hi[offset..offset + dim],
                b: &bufs.b[offset..offset + dim],
                findex: &bufs.findex[offset..offset + dim],
            });
        }

        constraints[i].excite();
        for k in 0..dim {
            let row = offset + k;
            if bufs.findex[row] >= 0 {
                bufs.findex[row] += offset as isize;
            }

            constraints[i].apply_unit_impulse(k);

            let row_start = row * n_skip;
            // diagonal block, with the regularizer
            constraints[i].velocity_change(
                &mut bufs.a[row_start + offset..row_start + offset + dim],
                with_cfm,
            );
            // off-diagonal blocks of every later constraint
            for m in (i + 1)..constraints.len() {
                let m_offset = bufs.offsets[m];
                let m_dim = bufs.offsets[m + 1] - m_offset;
                constraints[m].velocity_change(
                    &mut bufs.a[row_start + m_offset..row_start + m_offset + m_dim],
                    false,
                );
            }
            // columns of earlier constraints are mirrors of already
            // measured rows
            for col in 0..offset {
                bufs.a[row_start + col] = bufs.a[col * n_skip + row];
            }
        }
        if let Some(collector) = collector.as_deref_mut() {
            collector.measure_constraint_impulse(i);
        }
        constraints[i].unexcite();

        debug_assert_symmetric(bufs, offset + dim);
    }

    debug_assert_symmetric(bufs, n);
}

/// Debug check that the leading `rows` × `rows` block is symmetric.
/// A violation means a constraint's probe responses are inconsistent.
fn debug_assert_symmetric(bufs: &LcpBuffers, rows: usize) {
    if !cfg!(debug_assertions) {
        return;
    }
    for r in 0..rows {
        for c in 0..r {
            let upper = bufs.a[c * bufs.n_skip + r];
            let lower = bufs.a[r * bufs.n_skip + c];
            debug_assert!(
                (upper - lower).abs() <= 1e-6,
                "asymmetric system: A[{r},{c}] = {lower} vs A[{c},{r}] = {upper}\n{}",
                bufs.dump()
            );
        }
    }
}
