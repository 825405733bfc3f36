//! A minimal point-mass body for driving the constraint probe interface.
//!
//! The solver itself never touches bodies directly; it only sees them
//! through [`Constraint`](crate::Constraint) implementations. This stub is
//! what the example constraints in [`constraint`](crate::constraint) push
//! their impulses into, standing in for a full articulated-body model.

use crate::math::uv;

use std::{cell::RefCell, rc::Rc};

/// Shared handle to a body, as held by the constraints attached to it.
///
/// The solve is single-threaded by contract, so plain `Rc<RefCell>` is enough.
pub type BodyRef = Rc<RefCell<PointMass>>;

/// A body with mass but no rotational state.
#[derive(Clone, Copy, Debug)]
pub struct PointMass {
    pub inv_mass: f64,
    pub position: uv::DVec3,
    pub velocity: uv::DVec3,
    /// Velocity response to the unit impulse applied during the probe phase.
    /// Only meaningful between `excite` and `unexcite` of a constraint.
    pub(crate) probe_response: uv::DVec3,
}

impl PointMass {
    pub fn new(mass: f64, position: uv::DVec3) -> BodyRef {
        Rc::new(RefCell::new(PointMass {
            inv_mass: if mass == 0.0 { 0.0 } else { 1.0 / mass },
            position,
            velocity: uv::DVec3::zero(),
            probe_response: uv::DVec3::zero(),
        }))
    }

    /// A body that never moves, used as the ground side of one-body constraints.
    pub fn fixed(position: uv::DVec3) -> BodyRef {
        Rc::new(RefCell::new(PointMass {
            inv_mass: 0.0,
            position,
            velocity: uv::DVec3::zero(),
            probe_response: uv::DVec3::zero(),
        }))
    }

    /// Apply an impulse to the real velocity.
    pub fn apply_impulse(&mut self, impulse: uv::DVec3) {
        self.velocity += impulse * self.inv_mass;
    }

    /// Apply an impulse to the probe-response buffer instead of the real velocity.
    pub(crate) fn apply_probe_impulse(&mut self, impulse: uv::DVec3) {
        self.probe_response = impulse * self.inv_mass;
    }
}
