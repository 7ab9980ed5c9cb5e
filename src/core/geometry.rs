use std::f64::consts::PI;

use nalgebra::{Matrix3, Quaternion, UnitQuaternion};

use crate::core::autodiff::Real;

/// Rotation matrix for a `(w, x, y, z)` quaternion. The quaternion is normalized first;
/// returns `None` for non-finite or (near-)zero input.
pub fn rotation_from_quaternion(q: [f64; 4]) -> Option<Matrix3<f64>> {
    if q.iter().any(|c| !c.is_finite()) {
        return None;
    }
    let raw = Quaternion::new(q[0], q[1], q[2], q[3]);
    if raw.norm() < 1e-12 {
        return None;
    }
    let unit = UnitQuaternion::from_quaternion(raw);
    Some(unit.to_rotation_matrix().into_inner())
}

/// Half-length of an ellipsoid along the lab-frame unit direction `u`:
/// `sqrt(uᵀ R A² Rᵀ u)` with `A = diag(semi_axes)`.
///
/// `rotation` and `semi_axes` are constants; only `u` carries derivatives.
#[inline]
pub fn projected_extent<S: Real>(rotation: &Matrix3<f64>, semi_axes: &[f64; 3], u: &[S; 3]) -> S {
    let body = |k: usize| u[0] * rotation[(0, k)] + u[1] * rotation[(1, k)] + u[2] * rotation[(2, k)];
    let a0 = body(0) * semi_axes[0];
    let a1 = body(1) * semi_axes[1];
    let a2 = body(2) * semi_axes[2];
    (a0 * a0 + a1 * a1 + a2 * a2).sqrt()
}

/// Smooth switching function, 1 at r = 0 and 0 (with zero slope) at `cutoff`.
#[inline]
pub fn cosine_cutoff<S: Real>(r: S, cutoff: f64) -> S {
    ((r * (PI / cutoff)).cos() + 1.0) * 0.5
}
