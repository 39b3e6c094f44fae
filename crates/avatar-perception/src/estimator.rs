//! Hips estimation from tracked head, hand and hip poses.
//!
//! [`BodyEstimator`] answers "where should the hips be?" with one of two
//! strategies:
//!
//! - **HMD-relative** ([`BodyEstimator::derive_from_hmd`]): hang the rig's
//!   default neck and hips offsets below the head, rotating the head-to-neck
//!   segment with the full head orientation and the neck-to-hips segment with
//!   head yaw only. A tracked hip overrides horizontal position and yaw.
//! - **Center of gravity** ([`BodyEstimator::derive_from_cg`]): balance a
//!   mass-weighted centroid of head and hands over a soft-clamped base of
//!   support, solve hip height from the head-to-hips rest length, and blend
//!   hip yaw 30 % toward the head's body facing.
//!
//! Both return a [`HipsEstimate`] in sensor space.

use avatar_types::Action;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sensor_frame::SensorFrame;
use crate::transform::{Pose, body_facing_from_head, cancel_out_roll_and_pitch, rotation_from_up_and_forward, soft_clamp};

// ────────────────────────────────────────────────────────────────────────────
// Rig defaults
// ────────────────────────────────────────────────────────────────────────────

/// Default joint positions of the rig at unit scale, floor-relative, −Z
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigDefaults {
    /// Total standing height (metres).
    pub height: f32,
    /// Midpoint between the eyes; where the HMD sits.
    pub eyes: Vec3,
    pub head: Vec3,
    pub neck: Vec3,
    pub spine2: Vec3,
    pub hips: Vec3,
    pub left_hand: Vec3,
    pub right_hand: Vec3,
    pub left_foot: Vec3,
    pub right_foot: Vec3,
}

impl Default for RigDefaults {
    fn default() -> Self {
        Self {
            height: 1.755,
            eyes: Vec3::new(0.0, 1.645, -0.08),
            head: Vec3::new(0.0, 1.58, 0.0),
            neck: Vec3::new(0.0, 1.5, 0.0),
            spine2: Vec3::new(0.0, 1.25, 0.0),
            hips: Vec3::new(0.0, 0.93, 0.0),
            left_hand: Vec3::new(-0.25, 0.85, 0.0),
            right_hand: Vec3::new(0.25, 0.85, 0.0),
            left_foot: Vec3::new(-0.1, 0.0, 0.0),
            right_foot: Vec3::new(0.1, 0.0, 0.0),
        }
    }
}

impl RigDefaults {
    pub fn eye_height(&self) -> f32 {
        self.eyes.y
    }

    /// Eye height of a user of the given total height, by rig proportions.
    pub fn user_eye_height(&self, user_height: f32) -> f32 {
        user_height * self.eyes.y / self.height
    }

    /// Default position of `joint` relative to the hips.
    pub fn relative_to_hips(&self, joint: Action) -> Vec3 {
        let absolute = match joint {
            Action::Head => self.head,
            Action::LeftHand => self.left_hand,
            Action::RightHand => self.right_hand,
            Action::LeftFoot => self.left_foot,
            Action::RightFoot => self.right_foot,
            Action::Spine2 => self.spine2,
            _ => self.hips,
        };
        absolute - self.hips
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub head_mass: f32,
    pub left_hand_mass: f32,
    pub right_hand_mass: f32,
    pub hips_mass: f32,
    /// Base-of-support extents relative to the hips; front and left are
    /// negative.
    pub support_front: f32,
    pub support_back: f32,
    pub support_left: f32,
    pub support_right: f32,
    /// Applied to the front extent; hip flexion starts well before the edge.
    pub forward_dampening: f32,
    /// Applied to the back and side extents.
    pub lateral_dampening: f32,
    /// How far the hips may rise above their rest height (toe raise).
    pub hips_lift_margin: f32,
    /// Fraction of the body facing blended into hip yaw.
    pub hips_yaw_mix: f32,
    /// Hips below `hips - fraction * leg` count as a squat.
    pub upper_leg_fraction: f32,
    /// Follow the head vertically (crouching) instead of pinning the hips at
    /// rest height.
    pub crouch_recenter: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            head_mass: 20.0,
            left_hand_mass: 2.0,
            right_hand_mass: 2.0,
            hips_mass: 40.0,
            support_front: -0.20,
            support_back: 0.12,
            support_left: -0.25,
            support_right: 0.25,
            forward_dampening: 0.5,
            lateral_dampening: 2.0,
            hips_lift_margin: 0.05,
            hips_yaw_mix: 0.3,
            upper_leg_fraction: 0.3333,
            crouch_recenter: true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output
// ────────────────────────────────────────────────────────────────────────────

/// Whether the hips came from a tracker or a heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimateSource {
    Measured,
    Estimated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HipsEstimate {
    /// Full hips pose in sensor space (unit scale), including spine lean.
    pub hips: Pose,
    /// Upright, yaw-only body pose in sensor space (unit scale). This is the
    /// desired body the follow axes chase.
    pub body: Pose,
    pub source: EstimateSource,
    /// The CG model found the hips below the squat threshold.
    pub squat_detected: bool,
}

/// Frames needed to move between sensor and avatar space.
#[derive(Debug, Clone, Copy)]
pub struct EstimatorFrames {
    pub sensor_to_world: Pose,
    /// Physics-reported avatar pose; unit scale.
    pub avatar_to_world: Pose,
    pub avatar_scale: f32,
    /// Calibrated eye height of the user, sensor space.
    pub user_eye_height: f32,
}

impl EstimatorFrames {
    /// Maps sensor space into avatar space.
    pub fn avatar_from_sensor(&self) -> Pose {
        self.avatar_to_world.inverse() * self.sensor_to_world
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BodyEstimator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct BodyEstimator {
    rig: RigDefaults,
    config: EstimatorConfig,
}

impl BodyEstimator {
    pub fn new(rig: RigDefaults, config: EstimatorConfig) -> Self {
        Self { rig, config }
    }

    pub fn rig(&self) -> &RigDefaults {
        &self.rig
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Highest hips offset above rest height the CG model will produce, in
    /// avatar space at the given scale.
    pub fn max_hips_lift(&self, avatar_scale: f32) -> f32 {
        self.config.hips_lift_margin * avatar_scale
    }

    /// HMD-relative estimate.
    ///
    /// `force_follow_y` keeps the head-derived height even when crouch
    /// recentering is disabled.
    pub fn derive_from_hmd(&self, frame: &SensorFrame, user_eye_height: f32, force_follow_y: bool) -> HipsEstimate {
        let head = frame.tracked(Action::Head);
        let (head_position, head_rotation) = match head {
            Some(pose) => (pose.translation, pose.rotation),
            None => (Vec3::new(0.0, user_eye_height, 0.0), Quat::IDENTITY),
        };
        let head_yaw = cancel_out_roll_and_pitch(head_rotation);

        // rig offsets are at rig proportions; bring them into sensor metres
        let offset_scale = user_eye_height / self.rig.eye_height();
        let local_eyes = self.rig.eyes - self.rig.hips;
        let local_neck = self.rig.neck - self.rig.hips;
        let eyes_to_neck = head_rotation * (local_neck - local_eyes);
        let neck_to_root = head_yaw * -local_neck;
        let mut body_position = head_position + offset_scale * (eyes_to_neck + neck_to_root);
        let mut body_rotation = head_yaw;
        let mut source = EstimateSource::Estimated;

        if let Some(hips) = frame.tracked(Action::Hips) {
            body_position.x = hips.translation.x;
            body_position.z = hips.translation.z;
            body_rotation = cancel_out_roll_and_pitch(hips.rotation);
            source = EstimateSource::Measured;
        }

        if !force_follow_y && !self.config.crouch_recenter {
            body_position.y = offset_scale * self.rig.hips.y;
        }

        let body = Pose::from_rotation_translation(body_rotation, body_position);
        let hips = match frame.tracked(Action::Hips) {
            Some(tracked) => Pose::from_rotation_translation(tracked.rotation, tracked.translation),
            None => body,
        };
        HipsEstimate {
            hips,
            body,
            source,
            squat_detected: false,
        }
    }

    /// Center-of-gravity estimate.
    ///
    /// Falls back to [`derive_from_hmd`](Self::derive_from_hmd) when the head
    /// is untracked or a hip tracker is present.
    pub fn derive_from_cg(&self, frame: &SensorFrame, frames: &EstimatorFrames) -> HipsEstimate {
        let Some(head_sensor) = frame.tracked(Action::Head) else {
            return self.derive_from_hmd(frame, frames.user_eye_height, false);
        };
        if frame.is_tracked(Action::Hips) {
            return self.derive_from_hmd(frame, frames.user_eye_height, false);
        }

        let avatar_from_sensor = frames.avatar_from_sensor();
        let head = avatar_from_sensor.transform_sensor_pose(&head_sensor);
        let hand = |action: Action| -> Vec3 {
            match frame.tracked(action) {
                Some(pose) => avatar_from_sensor.transform_point(pose.translation),
                None => self.rig.relative_to_hips(action) * frames.avatar_scale,
            }
        };
        let left = hand(Action::LeftHand);
        let right = hand(Action::RightHand);

        let (hips_position, squat_detected) = self.counter_balance(head.translation, left, right, frames.avatar_scale);

        let body_facing = body_facing_from_head(head.rotation, Vec3::Y);
        let hips_yaw = Quat::IDENTITY.slerp(body_facing, self.config.hips_yaw_mix);
        let hips_facing = hips_yaw * Vec3::NEG_Z;
        let spine = head.translation - hips_position;
        let hips_rotation = rotation_from_up_and_forward(spine, hips_facing);
        let hips_avatar = Pose::from_rotation_translation(hips_rotation, hips_position);

        let sensor_from_avatar = avatar_from_sensor.inverse();
        let hips = (sensor_from_avatar * hips_avatar).unit_scale();
        let body = Pose::from_rotation_translation(cancel_out_roll_and_pitch(hips.rotation), hips.translation);

        if squat_detected {
            debug!(hips_y = hips_position.y, "cg model detected a squat");
        }
        HipsEstimate {
            hips,
            body,
            source: EstimateSource::Estimated,
            squat_detected,
        }
    }

    /// Hips position (avatar space, relative to rest hips) that balances the
    /// given head and hand positions. Returns `(hips, squat_detected)`.
    pub fn counter_balance(&self, head: Vec3, left_hand: Vec3, right_hand: Vec3, avatar_scale: f32) -> (Vec3, bool) {
        let cfg = &self.config;
        let sum_of_moments = cfg.head_mass * head + cfg.left_hand_mass * left_hand + cfg.right_hand_mass * right_hand;
        let total_mass = cfg.head_mass + cfg.left_hand_mass + cfg.right_hand_mass;

        let mut current_cg = sum_of_moments / total_mass;
        current_cg.y = 0.0;
        let desired_cg = self.dampen_cg(current_cg, avatar_scale);

        let counter_balanced_for_head = (total_mass + cfg.hips_mass) * desired_cg - sum_of_moments;
        let mut hips = counter_balanced_for_head / cfg.hips_mass;

        let tpose_head = self.rig.relative_to_hips(Action::Head) * avatar_scale;
        let tpose_foot = self.rig.relative_to_hips(Action::RightFoot) * avatar_scale;
        let head_hips_rest = tpose_head.length();
        let hips_to_foot = -tpose_foot.y;
        let squat_threshold = -cfg.upper_leg_fraction * hips_to_foot;

        let horizontal = Vec3::new(head.x - hips.x, 0.0, head.z - hips.z).length();
        let hips_drop = if head_hips_rest > horizontal {
            (head_hips_rest * head_hips_rest - horizontal * horizontal).sqrt()
        } else {
            0.0
        };
        hips.y = head.y - hips_drop;

        let max_lift = self.max_hips_lift(avatar_scale);
        let mut squat = false;
        if hips.y > max_lift {
            hips.y = max_lift;
        } else if hips.y < squat_threshold {
            squat = true;
        }
        (hips, squat)
    }

    /// Softly clamp a horizontal CG offset into the base of support.
    pub fn dampen_cg(&self, cg: Vec3, scale: f32) -> Vec3 {
        let cfg = &self.config;
        let clamp_front = cfg.support_front * cfg.forward_dampening * scale;
        let clamp_back = cfg.support_back * cfg.lateral_dampening * scale;
        let clamp_left = cfg.support_left * cfg.lateral_dampening * scale;
        let clamp_right = cfg.support_right * cfg.lateral_dampening * scale;

        let z = if cg.z < 0.0 { soft_clamp(cg.z, clamp_front) } else { soft_clamp(cg.z, clamp_back) };
        let x = if cg.x > 0.0 { soft_clamp(cg.x, clamp_right) } else { soft_clamp(cg.x, clamp_left) };
        Vec3::new(x, 0.0, z)
    }
}

/// Convenience: `true` when `pose` is usable by the CG model.
pub fn cg_ready(frame: &SensorFrame) -> bool {
    frame.is_tracked(Action::Head) && !frame.is_tracked(Action::Hips)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_types::SensorPose;

    fn estimator() -> BodyEstimator {
        BodyEstimator::new(RigDefaults::default(), EstimatorConfig::default())
    }

    fn frame_with(poses: &[(Action, SensorPose)]) -> SensorFrame {
        SensorFrame::from_poses(poses.iter().copied())
    }

    fn identity_frames(eye: f32) -> EstimatorFrames {
        EstimatorFrames {
            sensor_to_world: Pose::IDENTITY,
            avatar_to_world: Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.0, 0.93, 0.0)),
            avatar_scale: 1.0,
            user_eye_height: eye,
        }
    }

    // ------------------------------------------------------------------ HMD-relative

    #[test]
    fn hmd_relative_puts_hips_under_level_head() {
        let est = estimator();
        let eye = est.rig().eye_height();
        let head = SensorPose::new(Vec3::new(0.3, eye, -0.2), Quat::IDENTITY);
        let out = est.derive_from_hmd(&frame_with(&[(Action::Head, head)]), eye, false);
        // eyes sit 8 cm in front of the neck column
        assert!((out.body.translation.x - 0.3).abs() < 1e-5);
        assert!((out.body.translation.z - (-0.2 + 0.08)).abs() < 1e-5, "{}", out.body.translation);
        assert!((out.body.translation.y - 0.93).abs() < 1e-4, "{}", out.body.translation);
        assert_eq!(out.source, EstimateSource::Estimated);
        assert_eq!(out.body.scale, 1.0);
    }

    #[test]
    fn hmd_relative_ignores_head_pitch_for_body_yaw() {
        let est = estimator();
        let eye = est.rig().eye_height();
        let head = SensorPose::new(Vec3::new(0.0, eye, 0.0), Quat::from_rotation_y(0.6) * Quat::from_rotation_x(0.5));
        let out = est.derive_from_hmd(&frame_with(&[(Action::Head, head)]), eye, false);
        let up = out.body.rotation * Vec3::Y;
        assert!(up.abs_diff_eq(Vec3::Y, 1e-5), "body must stay upright");
        let forward = out.body.rotation * Vec3::NEG_Z;
        assert!(forward.abs_diff_eq(Quat::from_rotation_y(0.6) * Vec3::NEG_Z, 1e-4));
    }

    #[test]
    fn hip_tracker_overrides_horizontal_and_yaw() {
        let est = estimator();
        let eye = est.rig().eye_height();
        let head = SensorPose::new(Vec3::new(0.0, eye, 0.0), Quat::IDENTITY);
        let hips = SensorPose::new(Vec3::new(0.5, 0.9, 0.4), Quat::from_rotation_y(1.0));
        let out = est.derive_from_hmd(&frame_with(&[(Action::Head, head), (Action::Hips, hips)]), eye, false);
        assert_eq!(out.source, EstimateSource::Measured);
        assert!((out.body.translation.x - 0.5).abs() < 1e-6);
        assert!((out.body.translation.z - 0.4).abs() < 1e-6);
        assert!(out.body.rotation.dot(Quat::from_rotation_y(1.0)).abs() > 0.9999);
    }

    #[test]
    fn untracked_head_uses_default_standing_head() {
        let est = estimator();
        let eye = est.rig().eye_height();
        let out = est.derive_from_hmd(&SensorFrame::default(), eye, false);
        assert!(out.body.is_finite());
        assert!((out.body.translation.y - 0.93).abs() < 1e-4);
    }

    #[test]
    fn pinned_hips_height_without_crouch_recenter() {
        let est = BodyEstimator::new(
            RigDefaults::default(),
            EstimatorConfig {
                crouch_recenter: false,
                ..Default::default()
            },
        );
        let eye = est.rig().eye_height();
        let crouched = SensorPose::new(Vec3::new(0.0, 1.0, 0.0), Quat::IDENTITY);
        let out = est.derive_from_hmd(&frame_with(&[(Action::Head, crouched)]), eye, false);
        assert!((out.body.translation.y - 0.93).abs() < 1e-5);
        let forced = est.derive_from_hmd(&frame_with(&[(Action::Head, crouched)]), eye, true);
        assert!(forced.body.translation.y < 0.5);
    }

    // ------------------------------------------------------------------ CG model

    #[test]
    fn cg_hips_never_rise_above_standing_height() {
        let est = estimator();
        let lift = est.max_hips_lift(1.0);
        for (hx, hy, hz) in [
            (0.0, 0.65, 0.0),
            (0.0, 2.5, 0.0),
            (0.4, 0.7, -0.3),
            (-0.2, 0.2, 0.5),
            (0.0, -0.5, 0.0),
            (1.0, 0.65, 1.0),
        ] {
            for hand in [Vec3::new(-0.25, -0.08, 0.0), Vec3::new(0.6, 1.0, -0.5)] {
                let (hips, _) = est.counter_balance(Vec3::new(hx, hy, hz), hand, -hand, 1.0);
                assert!(hips.y <= lift + 1e-6, "head ({hx},{hy},{hz}) gave hips {}", hips.y);
            }
        }
    }

    #[test]
    fn cg_hips_scale_with_avatar() {
        let est = estimator();
        let (hips, _) = est.counter_balance(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ZERO, 2.0);
        assert!(hips.y <= est.max_hips_lift(2.0) + 1e-6);
    }

    #[test]
    fn cg_hips_drop_under_a_lowered_head() {
        let est = estimator();
        let rest = est.rig().relative_to_hips(Action::Head);
        let (standing, _) = est.counter_balance(rest, Vec3::new(-0.25, -0.08, 0.0), Vec3::new(0.25, -0.08, 0.0), 1.0);
        let (lowered, squat) = est.counter_balance(rest - Vec3::new(0.0, 0.5, 0.0), Vec3::new(-0.25, -0.08, 0.0), Vec3::new(0.25, -0.08, 0.0), 1.0);
        assert!(lowered.y < standing.y);
        assert!(squat, "hips half a metre down is a squat");
    }

    #[test]
    fn cg_forward_offset_is_softly_clamped() {
        let est = estimator();
        let far = est.dampen_cg(Vec3::new(0.0, 0.0, -5.0), 1.0);
        let near = est.dampen_cg(Vec3::new(0.0, 0.0, -0.01), 1.0);
        assert!(far.z >= -0.1 && far.z < -0.09, "front clamp is 0.2 * 0.5: {}", far.z);
        assert!((near.z + 0.01).abs() < 2e-3, "small offsets pass almost untouched: {}", near.z);
    }

    #[test]
    fn cg_estimate_is_upright_and_unit_scale() {
        let est = estimator();
        let eye = est.rig().eye_height();
        let head = SensorPose::new(Vec3::new(0.05, eye, -0.05), Quat::from_rotation_y(0.3));
        let frame = frame_with(&[(Action::Head, head)]);
        let out = est.derive_from_cg(&frame, &identity_frames(eye));
        assert_eq!(out.source, EstimateSource::Estimated);
        assert!((out.hips.scale - 1.0).abs() < 1e-6);
        assert!((out.body.rotation * Vec3::Y).abs_diff_eq(Vec3::Y, 1e-5));
        assert!(out.body.is_finite());
    }

    #[test]
    fn cg_falls_back_to_hmd_with_hip_tracker() {
        let est = estimator();
        let eye = est.rig().eye_height();
        let head = SensorPose::new(Vec3::new(0.0, eye, 0.0), Quat::IDENTITY);
        let hips = SensorPose::new(Vec3::new(0.2, 0.9, 0.0), Quat::IDENTITY);
        let frame = frame_with(&[(Action::Head, head), (Action::Hips, hips)]);
        assert!(!cg_ready(&frame));
        let out = est.derive_from_cg(&frame, &identity_frames(eye));
        assert_eq!(out.source, EstimateSource::Measured);
    }
}
