//! Frame transforms between sensor, avatar and world space.
//!
//! A [`Pose`] is a uniform-scale similarity transform (scale, rotation,
//! translation). The stack keeps three of them alive every frame:
//!
//! - the body-in-sensor pose (always unit scale),
//! - the sensor-to-world pose (scale is the eye-height ratio),
//! - the avatar-to-world pose reported by physics (unit scale).
//!
//! All frames are Y-up with −Z forward.
//!
//! # Example
//!
//! ```rust
//! use avatar_perception::transform::Pose;
//! use glam::{Quat, Vec3};
//!
//! let sensor_to_world = Pose::new(2.0, Quat::IDENTITY, Vec3::new(10.0, 0.0, 0.0));
//! let body = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.0, 1.0, 0.0));
//!
//! let world = sensor_to_world * body;
//! assert!((world.translation - Vec3::new(10.0, 2.0, 0.0)).length() < 1e-5);
//!
//! let back = sensor_to_world.inverse() * world;
//! assert!((back.translation - body.translation).length() < 1e-5);
//! ```

use avatar_types::SensorPose;
use glam::{Mat3, Mat4, Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

const ALMOST_ZERO: f32 = 1.0e-4;

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// Uniform scale, then rotation, then translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub scale: f32,
    pub rotation: Quat,
    pub translation: Vec3,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    pub fn new(scale: f32, rotation: Quat, translation: Vec3) -> Self {
        Self {
            scale,
            rotation,
            translation,
        }
    }

    /// Unit-scale pose.
    pub fn from_rotation_translation(rotation: Quat, translation: Vec3) -> Self {
        Self::new(1.0, rotation, translation)
    }

    /// Exact inverse. `scale` must be non-zero.
    pub fn inverse(&self) -> Self {
        let inv_scale = 1.0 / self.scale;
        let inv_rot = self.rotation.inverse();
        Self {
            scale: inv_scale,
            rotation: inv_rot,
            translation: -(inv_rot * self.translation) * inv_scale,
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.translation + self.rotation * (point * self.scale)
    }

    /// Rotate and scale a direction; translation is ignored.
    pub fn transform_vector(&self, vector: Vec3) -> Vec3 {
        self.rotation * (vector * self.scale)
    }

    /// Re-express a tracked pose in the frame this transform maps into.
    ///
    /// Velocities are scaled along with positions; the validity flag is kept.
    pub fn transform_sensor_pose(&self, pose: &SensorPose) -> SensorPose {
        SensorPose {
            translation: self.transform_point(pose.translation),
            rotation: (self.rotation * pose.rotation).normalize(),
            velocity: self.transform_vector(pose.velocity),
            angular_velocity: self.rotation * pose.angular_velocity,
            valid: pose.valid,
        }
    }

    /// Same pose with the scale forced to one.
    pub fn unit_scale(&self) -> Self {
        Self {
            scale: 1.0,
            ..*self
        }
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(Vec3::splat(self.scale), self.rotation, self.translation)
    }

    /// Decompose a matrix. Non-uniform scale collapses to its mean.
    pub fn from_mat4(matrix: &Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self::new((scale.x + scale.y + scale.z) / 3.0, rotation.normalize(), translation)
    }

    /// `true` when the two poses agree within `epsilon` on every component.
    pub fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        (self.scale - other.scale).abs() <= epsilon
            && self.translation.abs_diff_eq(other.translation, epsilon)
            && self.rotation.dot(other.rotation).abs() >= 1.0 - epsilon
    }

    pub fn is_finite(&self) -> bool {
        self.scale.is_finite() && self.rotation.is_finite() && self.translation.is_finite()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Pose {
    type Output = Pose;

    /// `self * rhs` applies `rhs` first.
    fn mul(self, rhs: Pose) -> Pose {
        Pose {
            scale: self.scale * rhs.scale,
            rotation: (self.rotation * rhs.rotation).normalize(),
            translation: self.transform_point(rhs.translation),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Facing helpers
// ────────────────────────────────────────────────────────────────────────────

/// Horizontal facing of `rotation` as an `(x, z)` unit vector.
///
/// When the forward axis is (nearly) vertical the top of the head is used
/// instead, so a user looking straight down still faces somewhere.
pub fn facing_dir_2d(rotation: Quat) -> Vec2 {
    let forward = rotation * Vec3::NEG_Z;
    let facing = Vec2::new(forward.x, forward.z);
    if facing.length() >= ALMOST_ZERO {
        return facing.normalize();
    }
    let up = rotation * Vec3::Y;
    let fallback = Vec2::new(up.x, up.z);
    if fallback.length() >= ALMOST_ZERO {
        fallback.normalize()
    } else {
        Vec2::new(0.0, -1.0)
    }
}

/// Yaw-only rotation whose −Z axis points along the horizontal `facing`.
pub fn yaw_from_facing(facing: Vec2) -> Quat {
    Quat::from_rotation_y((-facing.x).atan2(-facing.y))
}

/// Strip pitch and roll, keeping only rotation about +Y.
pub fn cancel_out_roll_and_pitch(rotation: Quat) -> Quat {
    yaw_from_facing(facing_dir_2d(rotation))
}

/// Body facing derived from a head rotation.
///
/// Nodding far down or up swaps the forward axis for the top of the head so
/// the body does not flip when the user looks at their feet.
pub fn body_facing_from_head(head_rotation: Quat, up: Vec3) -> Quat {
    let up = up.normalize_or(Vec3::Y);
    let head_forward = head_rotation * Vec3::NEG_Z;
    let head_up = head_rotation * Vec3::Y;
    let head_right = head_rotation * Vec3::X;

    let nod_threshold = 45.0_f32.to_radians().cos();
    let tilt_threshold = 30.0_f32.to_radians().cos();

    let nod = head_forward.dot(up);
    let tilt = head_right.dot(up);

    let mut body_forward = head_forward;
    if tilt.abs() < tilt_threshold {
        if nod < -nod_threshold {
            body_forward = head_up;
        } else if nod > nod_threshold {
            body_forward = -head_up;
        }
    }
    let body_forward = body_forward.reject_from_normalized(up);
    if body_forward.length() < ALMOST_ZERO {
        return Quat::IDENTITY;
    }
    rotation_from_up_and_forward(up, body_forward)
}

/// Orthonormal rotation with `+Y` along `up` and `−Z` as close to `forward`
/// as the constraint allows.
pub fn rotation_from_up_and_forward(up: Vec3, forward: Vec3) -> Quat {
    let y = up.normalize_or(Vec3::Y);
    let mut back = (-forward).reject_from_normalized(y);
    if back.length() < ALMOST_ZERO {
        back = y.any_orthonormal_vector();
    }
    let z = back.normalize();
    let x = y.cross(z);
    Quat::from_mat3(&Mat3::from_cols(x, y, z)).normalize()
}

// ────────────────────────────────────────────────────────────────────────────
// Soft clamping
// ────────────────────────────────────────────────────────────────────────────

/// Ease curve `t / (1 + t)`: linear near zero, asymptotic to one.
pub fn slope(t: f32) -> f32 {
    if t > 0.0 { t / (1.0 + t) } else { 0.0 }
}

/// Softly clamp `value` toward `limit` (same sign) using [`slope`].
///
/// The result never exceeds `|limit|` in magnitude.
pub fn soft_clamp(value: f32, limit: f32) -> f32 {
    if limit == 0.0 {
        return 0.0;
    }
    limit * slope(value / limit)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_PI_2, PI};

    #[test]
    fn compose_then_inverse_is_identity() {
        let a = Pose::new(1.7, Quat::from_rotation_y(0.8), Vec3::new(3.0, -1.0, 2.0));
        let round = a.inverse() * a;
        assert!(round.abs_diff_eq(&Pose::IDENTITY, 1e-5), "{round:?}");
    }

    #[test]
    fn matrix_roundtrip() {
        let a = Pose::new(0.5, Quat::from_rotation_x(0.3), Vec3::new(1.0, 2.0, 3.0));
        let back = Pose::from_mat4(&a.to_mat4());
        assert!(back.abs_diff_eq(&a, 1e-5));
    }

    #[test]
    fn transform_point_applies_scale_before_translation() {
        let p = Pose::new(2.0, Quat::from_rotation_y(FRAC_PI_2), Vec3::new(1.0, 0.0, 0.0));
        // -Z rotated +90° about Y points to -X.
        let out = p.transform_point(Vec3::NEG_Z);
        assert!(out.abs_diff_eq(Vec3::new(-1.0, 0.0, 0.0), 1e-5), "{out}");
    }

    #[test]
    fn transform_sensor_pose_keeps_validity() {
        let p = Pose::new(2.0, Quat::IDENTITY, Vec3::ZERO);
        let pose = SensorPose::invalid();
        assert!(!p.transform_sensor_pose(&pose).valid);
        let moving = SensorPose::new(Vec3::ONE, Quat::IDENTITY).with_velocity(Vec3::X, Vec3::Y);
        let out = p.transform_sensor_pose(&moving);
        assert!(out.velocity.abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-6));
        assert!(out.angular_velocity.abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn facing_of_identity_is_negative_z() {
        let f = facing_dir_2d(Quat::IDENTITY);
        assert!(f.abs_diff_eq(Vec2::new(0.0, -1.0), 1e-6));
    }

    #[test]
    fn facing_looking_straight_down_uses_head_top() {
        let f = facing_dir_2d(Quat::from_rotation_x(-FRAC_PI_2));
        assert!(f.abs_diff_eq(Vec2::new(0.0, -1.0), 1e-4), "{f}");
    }

    #[test]
    fn cancel_roll_and_pitch_keeps_yaw() {
        let q = Quat::from_rotation_y(0.7) * Quat::from_rotation_x(0.4) * Quat::from_rotation_z(0.2);
        let yaw = cancel_out_roll_and_pitch(q);
        let expected = Quat::from_rotation_y(0.7);
        let fq = yaw * Vec3::NEG_Z;
        let fe = expected * Vec3::NEG_Z;
        assert!(fq.abs_diff_eq(fe, 1e-2), "{fq} vs {fe}");
        assert!((yaw * Vec3::Y).abs_diff_eq(Vec3::Y, 1e-5));
    }

    #[test]
    fn yaw_from_facing_roundtrips() {
        for angle in [0.0_f32, 0.5, -1.2, PI - 0.01] {
            let q = Quat::from_rotation_y(angle);
            let back = yaw_from_facing(facing_dir_2d(q));
            assert!(back.dot(q).abs() > 1.0 - 1e-5, "angle {angle}");
        }
    }

    #[test]
    fn body_facing_ignores_downward_nod() {
        let head = Quat::from_rotation_y(0.5) * Quat::from_rotation_x(-1.3);
        let body = body_facing_from_head(head, Vec3::Y);
        let expected = Quat::from_rotation_y(0.5) * Vec3::NEG_Z;
        assert!((body * Vec3::NEG_Z).abs_diff_eq(expected, 1e-4));
    }

    #[test]
    fn rotation_from_up_and_forward_is_orthonormal() {
        let q = rotation_from_up_and_forward(Vec3::new(0.1, 1.0, 0.0), Vec3::new(0.0, 0.0, -1.0));
        assert!((q.length() - 1.0).abs() < 1e-5);
        let up = q * Vec3::Y;
        assert!(up.abs_diff_eq(Vec3::new(0.1, 1.0, 0.0).normalize(), 1e-5));
    }

    #[test]
    fn soft_clamp_never_exceeds_limit() {
        for v in [0.0_f32, 0.01, 0.1, 1.0, 10.0, 1000.0] {
            let c = soft_clamp(v, 0.25);
            assert!(c <= 0.25 && c >= 0.0, "{v} -> {c}");
            let n = soft_clamp(-v, -0.25);
            assert!(n >= -0.25 && n <= 0.0, "{v} -> {n}");
        }
        assert!(soft_clamp(0.3, -0.25).abs() < f32::EPSILON, "opposite sign clamps to zero");
    }

    #[test]
    fn slope_is_linear_near_zero() {
        assert!((slope(0.001) - 0.001).abs() < 1e-5);
        assert_eq!(slope(-1.0), 0.0);
    }
}
