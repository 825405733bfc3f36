//! Ball-joint position integration on the rotation group.
//!
//! This is the shape of collaborator the constraint solver is built
//! against: joint types own their generalized coordinates and velocities
//! and know how to integrate positions and expose a relative Jacobian.
//! The three coordinates of a ball joint are an exponential-map rotation
//! vector, so integration composes rotations instead of adding angles.

use crate::math::{self as m, uv};

use uv::{DMat3, DVec3};

/// Default perturbation for the finite-difference cross-check helpers.
const FD_EPS: f64 = 1e-7;

/// A three-degree-of-freedom rotational joint.
#[derive(Clone, Copy, Debug, Default)]
pub struct BallJoint {
    positions: DVec3,
    velocities: DVec3,
    /// Offset from the joint frame to the child body frame, expressed in
    /// the joint frame. Couples rotation into translation of the child.
    child_offset: DVec3,
}

/// A 6×3 joint Jacobian split into its rotational (top) and translational
/// (bottom) 3×3 halves. Each column is one degree of freedom.
#[derive(Clone, Copy, Debug)]
pub struct RelativeJacobian {
    pub angular: DMat3,
    pub linear: DMat3,
}

impl BallJoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_child_offset(mut self, offset: DVec3) -> Self {
        self.child_offset = offset;
        self
    }

    pub fn positions(&self) -> DVec3 {
        self.positions
    }

    pub fn set_positions(&mut self, q: DVec3) {
        self.positions = q;
    }

    pub fn velocities(&self) -> DVec3 {
        self.velocities
    }

    pub fn set_velocities(&mut self, v: DVec3) {
        self.velocities = v;
    }

    /// Generalized positions to a rotation matrix (the exponential map).
    pub fn convert_to_rotation(q: DVec3) -> DMat3 {
        m::exp_map(q)
    }

    /// Rotation matrix back to generalized positions (the log map).
    pub fn convert_to_positions(r: DMat3) -> DVec3 {
        m::log_map(r)
    }

    /// The positions that subtracted from `q2` leave `q1`, composed on the
    /// group rather than componentwise.
    pub fn position_difference(q2: DVec3, q1: DVec3) -> DVec3 {
        m::log_map(m::exp_map(q1).transposed() * m::exp_map(q2))
    }

    /// One explicit integration step:
    /// `R(q_next) = R(q) · exp(S(q) · v · dt)` with `S` the right Jacobian.
    pub fn integrate_positions_explicit(q: DVec3, v: DVec3, dt: f64) -> DVec3 {
        let step = m::right_jacobian(q) * v * dt;
        m::log_map(m::exp_map(q) * m::exp_map(step))
    }

    /// Advance the stored positions by `dt` at the stored velocities.
    pub fn integrate_positions(&mut self, dt: f64) {
        self.positions = Self::integrate_positions_explicit(self.positions, self.velocities, dt);
    }

    /// The 6×3 Jacobian mapping generalized velocities to the spatial
    /// velocity of the child body.
    pub fn relative_jacobian(&self) -> RelativeJacobian {
        let angular = m::right_jacobian(self.positions);
        RelativeJacobian {
            angular,
            // velocity of the child origin is ω × offset
            linear: m::skew(-self.child_offset) * angular,
        }
    }

    /// Time derivative of [`relative_jacobian`](Self::relative_jacobian)
    /// at the stored velocities.
    pub fn relative_jacobian_deriv(&self) -> RelativeJacobian {
        let angular = m::right_jacobian_deriv(self.positions, self.velocities);
        RelativeJacobian {
            angular,
            linear: m::skew(-self.child_offset) * angular,
        }
    }

    /// The joint's screw axes in the world frame, given the world rotation
    /// of the parent-side joint frame.
    pub fn world_axes(&self, parent_rotation: DMat3) -> [DVec3; 3] {
        let s = parent_rotation * m::right_jacobian(self.positions);
        [s.cols[0], s.cols[1], s.cols[2]]
    }

    /// Finite-difference Jacobian of the integrated positions with respect
    /// to the current positions, for cross-checking gradients.
    pub fn fd_pos_pos_jacobian(&self, dt: f64) -> DMat3 {
        let mut cols = [DVec3::zero(); 3];
        for (i, col) in cols.iter_mut().enumerate() {
            let mut dq = DVec3::zero();
            dq[i] = FD_EPS;
            let plus =
                Self::integrate_positions_explicit(self.positions + dq, self.velocities, dt);
            let minus =
                Self::integrate_positions_explicit(self.positions - dq, self.velocities, dt);
            *col = (plus - minus) * (0.5 / FD_EPS);
        }
        DMat3::new(cols[0], cols[1], cols[2])
    }

    /// Finite-difference Jacobian of the integrated positions with respect
    /// to the current velocities.
    pub fn fd_vel_pos_jacobian(&self, dt: f64) -> DMat3 {
        let mut cols = [DVec3::zero(); 3];
        for (i, col) in cols.iter_mut().enumerate() {
            let mut dv = DVec3::zero();
            dv[i] = FD_EPS;
            let plus =
                Self::integrate_positions_explicit(self.positions, self.velocities + dv, dt);
            let minus =
                Self::integrate_positions_explicit(self.positions, self.velocities - dv, dt);
            *col = (plus - minus) * (0.5 / FD_EPS);
        }
        DMat3::new(cols[0], cols[1], cols[2])
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
    fn integration_composes_on_the_group() {
        let q = DVec3::new(0.3, -0.8, 0.5);
        let v = DVec3::new(1.0, 0.4, -2.0);
        let dt = 0.01;
        let next = BallJoint::integrate_positions_explicit(q, v, dt);

        let expected =
            m::exp_map(q) * m::exp_map(m::right_jacobian(q) * v * dt);
        assert!(mat_approx_eq(m::exp_map(next), expected, 1e-10));
    }

    #[test]
    fn integrating_at_zero_velocity_is_identity() {
        let mut joint = BallJoint::new();
        joint.set_positions(DVec3::new(0.2, 0.4, -0.1));
        joint.integrate_positions(1.0);
        assert!((joint.positions() - DVec3::new(0.2, 0.4, -0.1)).mag() < 1e-12);
    }

    #[test]
    fn position_difference_inverts_composition() {
        let q1 = DVec3::new(0.1, 0.2, 0.3);
        let diff = DVec3::new(-0.4, 0.0, 0.25);
        let q2 = m::log_map(m::exp_map(q1) * m::exp_map(diff));
        let recovered = BallJoint::position_difference(q2, q1);
        assert!((recovered - diff).mag() < 1e-10);
    }

    #[test]
    fn vel_pos_jacobian_at_rest_is_dt_times_identity() {
        // d(log(exp(q) exp(S(q) v dt)))/dv at v = 0 collapses to dt·I
        // because the log's Jacobian cancels the right Jacobian exactly
        let mut joint = BallJoint::new();
        joint.set_positions(DVec3::new(0.7, -0.3, 0.2));
        let dt = 0.5;
        let fd = joint.fd_vel_pos_jacobian(dt);
        let expected = DMat3::identity() * dt;
        for c in 0..3 {
            assert!((fd.cols[c] - expected.cols[c]).mag() < 1e-5);
        }
    }

    #[test]
    fn pos_pos_jacobian_at_rest_is_identity() {
        let mut joint = BallJoint::new();
        joint.set_positions(DVec3::new(-0.2, 0.6, 0.1));
        let fd = joint.fd_pos_pos_jacobian(0.25);
        for c in 0..3 {
            let mut expected = DVec3::zero();
            expected[c] = 1.0;
            assert!((fd.cols[c] - expected).mag() < 1e-5);
        }
    }

    #[test]
    fn child_offset_couples_into_translation() {
        let joint = BallJoint::new().with_child_offset(DVec3::new(0.0, 1.0, 0.0));
        let jac = joint.relative_jacobian();
        // at q = 0 the angular half is the identity; spinning about x moves
        // a child one unit up the y axis in the +z direction
        let linear_about_x = jac.linear.cols[0];
        assert!((linear_about_x - DVec3::new(0.0, 0.0, 1.0)).mag() < 1e-12);
    }
}
