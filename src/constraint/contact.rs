//! A point contact between two bodies, with a Coulomb friction pyramid.

use super::{Constraint, ConstraintInfo, Stabilization};
use crate::{body::BodyRef, math::uv};

/// One contact point: a unilateral normal row and, when friction is
/// nonzero, two friction rows coupled to the normal via the friction index.
pub struct ContactConstraint {
    bodies: [BodyRef; 2],
    normal: uv::DVec3,
    tangents: [uv::DVec3; 2],
    friction: f64,
    restitution: f64,
    /// Penetration depth along the normal, as reported by collision detection.
    depth: f64,
    stab: Stabilization,
    last_probed_row: usize,
}

impl ContactConstraint {
    /// `normal` points from `bodies[1]` towards `bodies[0]`.
    pub fn new(bodies: [BodyRef; 2], normal: uv::DVec3, depth: f64) -> Self {
        let normal = normal.normalized();
        Self {
            bodies,
            normal,
            tangents: tangent_basis(normal),
            friction: 0.0,
            restitution: 0.0,
            depth,
            stab: Stabilization::default(),
            last_probed_row: 0,
        }
    }

    pub fn with_friction(mut self, coefficient: f64) -> Self {
        self.friction = coefficient;
        self
    }

    pub fn with_restitution(mut self, coefficient: f64) -> Self {
        self.restitution = coefficient;
        self
    }

    pub fn with_stabilization(mut self, stab: Stabilization) -> Self {
        self.stab = stab;
        self
    }

    fn row_direction(&self, row: usize) -> uv::DVec3 {
        match row {
            0 => self.normal,
            r => self.tangents[r - 1],
        }
    }

    fn relative_velocity(&self) -> uv::DVec3 {
        self.bodies[0].borrow().velocity - self.bodies[1].borrow().velocity
    }

    fn relative_probe_response(&self) -> uv::DVec3 {
        self.bodies[0].borrow().probe_response - self.bodies[1].borrow().probe_response
    }
}

impl Constraint for ContactConstraint {
    fn dimension(&self) -> usize {
        if self.friction > 0.0 {
            3
        } else {
            1
        }
    }

    fn fill_info(&mut self, info: ConstraintInfo<'_>) {
        let vel = self.relative_velocity();
        let approach_speed = -vel.dot(self.normal);

        // the post-step normal velocity must reach whichever is larger:
        // the bounce velocity or the penetration correction
        let bounce = self.restitution * approach_speed.max(0.0);
        let correction = self
            .stab
            .correction_velocity(self.depth.max(0.0), info.inv_dt)
            .max(0.0);
        info.b[0] = vel.dot(self.normal) - bounce.max(correction);
        info.lo[0] = 0.0;
        info.hi[0] = f64::INFINITY;
        info.findex[0] = -1;

        for (r, tangent) in self.tangents.iter().enumerate() {
            let row = r + 1;
            if row >= info.b.len() {
                break;
            }
            info.b[row] = vel.dot(*tangent);
            // bounds scale with the solved normal impulse through findex
            info.lo[row] = -self.friction;
            info.hi[row] = self.friction;
            info.findex[row] = 0;
        }
    }

    fn excite(&mut self) {
        for body in &self.bodies {
            body.borrow_mut().probe_response = uv::DVec3::zero();
        }
    }

    fn unexcite(&mut self) {
        for body in &self.bodies {
            body.borrow_mut().probe_response = uv::DVec3::zero();
        }
    }

    fn apply_unit_impulse(&mut self, row: usize) {
        let dir = self.row_direction(row);
        self.bodies[0].borrow_mut().apply_probe_impulse(dir);
        self.bodies[1].borrow_mut().apply_probe_impulse(-dir);
        self.last_probed_row = row;
    }

    fn velocity_change(&self, dest: &mut [f64], with_cfm: bool) {
        let response = self.relative_probe_response();
        for (row, d) in dest.iter_mut().enumerate() {
            *d = response.dot(self.row_direction(row));
        }
        if with_cfm {
            dest[self.last_probed_row] += dest[self.last_probed_row] * self.stab.cfm;
        }
    }

    fn apply_impulse(&mut self, impulses: &[f64]) {
        let mut total = uv::DVec3::zero();
        for (row, imp) in impulses.iter().enumerate() {
            total += self.row_direction(row) * *imp;
        }
        self.bodies[0].borrow_mut().apply_impulse(total);
        self.bodies[1].borrow_mut().apply_impulse(-total);
    }
}

/// Two unit vectors orthogonal to `n` and each other.
fn tangent_basis(n: uv::DVec3) -> [uv::DVec3; 2] {
    // pick the world axis least aligned with n to avoid degeneracy
    let helper = if n.x.abs() < 0.57 {
        uv::DVec3::unit_x()
    } else {
        uv::DVec3::unit_y()
    };
    let t1 = n.cross(helper).normalized();
    let t2 = n.cross(t1);
    [t1, t2]
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::PointMass;

    #[test]
    fn probe_reads_inverse_mass_sum() {
        let a = PointMass::new(0.5, uv::DVec3::zero());
        let b = PointMass::fixed(uv::DVec3::new(0.0, -1.0, 0.0));
        let mut contact = ContactConstraint::new([a, b], uv::DVec3::unit_y(), 0.0);

        contact.excite();
        contact.apply_unit_impulse(0);
        let mut dv = [0.0];
        contact.velocity_change(&mut dv, false);
        contact.unexcite();

        // only body a moves, inv mass 2
        assert!((dv[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn cfm_inflates_own_diagonal_only() {
        let a = PointMass::new(1.0, uv::DVec3::zero());
        let b = PointMass::new(1.0, uv::DVec3::zero());
        let stab = Stabilization {
            cfm: 0.5,
            ..Default::default()
        };
        let mut contact = ContactConstraint::new([a, b], uv::DVec3::unit_y(), 0.0)
            .with_friction(1.0)
            .with_stabilization(stab);

        contact.excite();
        contact.apply_unit_impulse(0);
        let mut with = [0.0; 3];
        let mut without = [0.0; 3];
        contact.velocity_change(&mut with, true);
        contact.velocity_change(&mut without, false);
        contact.unexcite();

        assert!((with[0] - without[0] * 1.5).abs() < 1e-12);
        assert_eq!(with[1], without[1]);
        assert_eq!(with[2], without[2]);
    }

    #[test]
    fn friction_rows_point_at_normal_row() {
        let a = PointMass::new(1.0, uv::DVec3::zero());
        let b = PointMass::new(1.0, uv::DVec3::zero());
        let mut contact =
            ContactConstraint::new([a, b], uv::DVec3::unit_y(), 0.0).with_friction(0.5);

        let (mut lo, mut hi, mut bb, mut w) = ([0.0; 3], [0.0; 3], [0.0; 3], [0.0; 3]);
        let mut findex = [-1_isize; 3];
        contact.fill_info(ConstraintInfo {
            lo: &mut lo,
            hi: &mut hi,
            b: &mut bb,
            w: &mut w,
            findex: &mut findex,
            inv_dt: 60.0,
        });

        assert_eq!(findex, [-1, 0, 0]);
        assert_eq!(lo, [0.0, -0.5, -0.5]);
        assert_eq!(hi, [f64::INFINITY, 0.5, 0.5]);
    }
}
