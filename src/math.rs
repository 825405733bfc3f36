//! Rotation-group math used by the ball-joint integrator.
//!
//! Everything here works on exponential coordinates, i.e. a rotation
//! represented as an axis-angle vector `q` with angle `|q|`.

pub use ultraviolet as uv;

use uv::{DMat3, DVec3};

/// Angle below which trigonometric coefficients switch to their Taylor expansions.
const SMALL_ANGLE: f64 = 1e-6;

/// Cross-product matrix, `skew(a) * b == a.cross(b)`.
pub fn skew(v: DVec3) -> DMat3 {
    DMat3::new(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// Exponential map from a rotation vector to a rotation matrix (Rodrigues' formula).
pub fn exp_map(q: DVec3) -> DMat3 {
    let theta = q.mag();
    let qx = skew(q);
    if theta < SMALL_ANGLE {
        // sin x / x -> 1, (1 - cos x) / x^2 -> 1/2
        return DMat3::identity() + qx + qx * qx * 0.5;
    }
    DMat3::identity()
        + qx * (theta.sin() / theta)
        + qx * qx * ((1.0 - theta.cos()) / (theta * theta))
}

/// Logarithm map from a rotation matrix back to a rotation vector.
///
/// Inverse of [`exp_map`] for angles in [0, π].
pub fn log_map(r: DMat3) -> DVec3 {
    let trace = r.cols[0].x + r.cols[1].y + r.cols[2].z;
    let cos_theta = ((trace - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();

    // off-diagonal antisymmetric part, equals sin(theta) * axis
    let axis_unnormalized = DVec3::new(
        r.cols[1].z - r.cols[2].y,
        r.cols[2].x - r.cols[0].z,
        r.cols[0].y - r.cols[1].x,
    ) * 0.5;

    if theta < SMALL_ANGLE {
        // sin(theta)/theta -> 1
        return axis_unnormalized;
    }
    if theta > std::f64::consts::PI - 1e-6 {
        // near a half turn the antisymmetric part vanishes,
        // recover the axis from the diagonal instead
        let diag = DVec3::new(r.cols[0].x, r.cols[1].y, r.cols[2].z);
        let axis_sq = (diag + DVec3::one()) * 0.5;
        let mut axis = DVec3::new(
            axis_sq.x.max(0.0).sqrt(),
            axis_sq.y.max(0.0).sqrt(),
            axis_sq.z.max(0.0).sqrt(),
        );
        // fix signs using the symmetric off-diagonal entries
        if r.cols[0].y + r.cols[1].x < 0.0 {
            axis.y = -axis.y;
        }
        if r.cols[0].z + r.cols[2].x < 0.0 {
            axis.z = -axis.z;
        }
        return axis.normalized() * theta;
    }
    axis_unnormalized * (theta / theta.sin())
}

/// Right Jacobian of SO(3) at `q`: the matrix `S` satisfying
/// `d/dt exp(q) = exp(q) * skew(S * dq/dt)`.
pub fn right_jacobian(q: DVec3) -> DMat3 {
    let theta = q.mag();
    let qx = skew(q);
    let (a, b) = jac_coefficients(theta);
    DMat3::identity() + qx * (-a) + qx * qx * b
}

/// Time derivative of [`right_jacobian`] along the coordinate velocity `dq`.
pub fn right_jacobian_deriv(q: DVec3, dq: DVec3) -> DMat3 {
    let theta = q.mag();
    let qx = skew(q);
    let dqx = skew(dq);
    let (a, b) = jac_coefficients(theta);
    let (da, db) = jac_coefficient_derivs(theta);
    // d(theta)/dt; zero when the rotation vector itself is zero
    let theta_dot = if theta < SMALL_ANGLE {
        0.0
    } else {
        q.dot(dq) / theta
    };
    qx * (-da * theta_dot)
        + dqx * (-a)
        + qx * qx * (db * theta_dot)
        + (dqx * qx + qx * dqx) * b
}

// coefficients of I - a*[q]x + b*[q]x^2
fn jac_coefficients(theta: f64) -> (f64, f64) {
    if theta < SMALL_ANGLE {
        let t2 = theta * theta;
        (0.5 - t2 / 24.0, 1.0 / 6.0 - t2 / 120.0)
    } else {
        let t2 = theta * theta;
        (
            (1.0 - theta.cos()) / t2,
            (theta - theta.sin()) / (t2 * theta),
        )
    }
}

fn jac_coefficient_derivs(theta: f64) -> (f64, f64) {
    if theta < SMALL_ANGLE {
        (-theta / 12.0, -theta / 60.0)
    } else {
        let t2 = theta * theta;
        (
            (theta * theta.sin() - 2.0 * (1.0 - theta.cos())) / (t2 * theta),
            ((1.0 - theta.cos()) * theta - 3.0 * (theta - theta.sin())) / (t2 * t2),
        )
    }
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;

    fn mat_approx_eq(a: DMat3, b: DMat3, tol: f64) -> bool {
        (0..3).all(|c| (a.cols[c] - b.cols[c]).mag() < tol)
    }

    #[test]
    fn exp_log_round_trip() {
        let qs = [
            DVec3::zero(),
            DVec3::new(0.1, -0.2, 0.3),
            DVec3::new(1.0, 1.0, -1.0),
            DVec3::new(3.0, 0.5, 0.0),
            DVec3::new(1e-9, 0.0, -1e-9),
        ];
        for q in qs {
            let back = log_map(exp_map(q));
            assert!(
                (back - q).mag() < 1e-9,
                "round trip failed for {q:?}: {back:?}"
            );
        }
    }

    #[test]
    fn log_near_half_turn() {
        let q = DVec3::new(0.0, std::f64::consts::PI - 1e-9, 0.0);
        let back = log_map(exp_map(q));
        assert!((back - q).mag() < 1e-6);
    }

    #[test]
    fn right_jacobian_matches_directional_derivative() {
        // exp(q + dq) ≈ exp(q) * exp(J_r(q) * dq) for small dq
        let q = DVec3::new(0.4, -0.7, 0.2);
        let jac = right_jacobian(q);
        let eps = 1e-7;
        for i in 0..3 {
            let mut dq = DVec3::zero();
            dq[i] = eps;
            let fd = exp_map(q).transposed() * exp_map(q + dq);
            let expected = exp_map(jac * dq);
            assert!(
                mat_approx_eq(fd, expected, 1e-10),
                "right jacobian mismatch in column {i}"
            );
        }
    }

    #[test]
    fn jacobian_deriv_matches_finite_difference() {
        let q = DVec3::new(0.3, 0.1, -0.5);
        let dq = DVec3::new(-0.2, 0.4, 0.7);
        let eps = 1e-7;
        let jp = right_jacobian(q + dq * eps);
        let jm = right_jacobian(q + dq * -eps);
        let analytic = right_jacobian_deriv(q, dq);
        for c in 0..3 {
            let fd_col = (jp.cols[c] - jm.cols[c]) * (0.5 / eps);
            assert!((fd_col - analytic.cols[c]).mag() < 1e-6);
        }
    }
}
