//! [`FollowHelper`] – decides when the virtual body chases the estimated body.
//!
//! The body is recentered independently on three axes:
//!
//! | Axis | Activates when |
//! |---|---|
//! | [`FollowAxis::Rotation`] | averaged head facing drifts past a threshold from the body facing (snaps when the hips are tracked) |
//! | [`FollowAxis::Horizontal`] | sitting: the user leans too far; standing: a footstep is detected, the user is walking, or the spine stretches |
//! | [`FollowAxis::Vertical`] | sit/stand changes, or the desired body leaves a vertical tolerance cylinder |
//!
//! Drive input activates all three. An active axis stays active until its
//! time remaining reaches zero; the time decrements once per physics
//! substep.
//!
//! # Example
//!
//! ```
//! use avatar_recenter::follow::{FollowAxis, FollowConfig, FollowHelper};
//! use avatar_perception::RigDefaults;
//! use avatar_types::FOLLOW_TIME_IMMEDIATE_SNAP;
//!
//! let mut follow = FollowHelper::new(FollowConfig::default(), RigDefaults::default());
//! follow.activate(FollowAxis::Rotation, true);
//! assert_eq!(follow.time_remaining(FollowAxis::Rotation), FOLLOW_TIME_IMMEDIATE_SNAP);
//! follow.decrement_time_remaining(0.001);
//! assert_eq!(follow.time_remaining(FollowAxis::Rotation), 0.0);
//! ```

use avatar_perception::transform::facing_dir_2d;
use avatar_perception::{HeadAverages, Pose, RigDefaults, SensorFrame};
use avatar_types::{Action, FOLLOW_TIME_IMMEDIATE_SNAP, SensorPose};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::step_detector::{StepDetector, StepSample};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowConfig {
    /// Seconds a non-snap follow takes to reach the desired pose.
    pub follow_time: f32,
    /// Head-to-body facing angle that triggers rotation recentering.
    pub rotation_threshold_degrees: f32,
    /// Time constant of the head facing average (seconds).
    pub rotation_filter_length: f32,
    /// Whether the user may lean outside the base of support without a step.
    pub lean_allowed: bool,
    /// A detected footstep also recenters rotation.
    pub step_resets_rotation: bool,

    /// Sitting lean limits along the body axes (metres, sensor space).
    pub sitting_forward_limit: f32,
    pub sitting_backward_limit: f32,
    pub sitting_lateral_limit: f32,

    /// Base of support half-extents around the rest head position (rig
    /// units).
    pub support_anterior: f32,
    pub support_posterior: f32,
    pub support_lateral: f32,
    /// Fraction beyond the rest head-to-hips length that counts as a stretch.
    pub spine_stretch_limit: f32,
    /// Head speed above which a step puts the avatar into the walking state.
    pub walk_speed_threshold: f32,

    /// Vertical tolerance cylinder (metres, desired minus current).
    pub cylinder_top: f32,
    pub cylinder_bottom: f32,
    pub sitting_bottom: f32,

    // step detector thresholds
    pub head_angular_velocity_threshold: f32,
    pub mode_height_threshold: f32,
    pub hand_direction_threshold: f32,
    pub hand_angular_velocity_threshold: f32,
    pub head_velocity_threshold: f32,
    pub head_level_tolerance_degrees: f32,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            follow_time: 0.5,
            rotation_threshold_degrees: 30.0,
            rotation_filter_length: 4.0,
            lean_allowed: true,
            step_resets_rotation: true,
            sitting_forward_limit: 0.15,
            sitting_backward_limit: 0.1,
            sitting_lateral_limit: 0.3,
            support_anterior: 0.04,
            support_posterior: 0.05,
            support_lateral: 0.10,
            spine_stretch_limit: 0.04,
            walk_speed_threshold: 0.15,
            cylinder_top: 0.1,
            cylinder_bottom: -1.5,
            sitting_bottom: -0.02,
            head_angular_velocity_threshold: 0.3,
            mode_height_threshold: -0.02,
            hand_direction_threshold: 0.4,
            hand_angular_velocity_threshold: 3.3,
            head_velocity_threshold: 0.15,
            head_level_tolerance_degrees: 7.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs and outputs
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowAxis {
    Rotation,
    Horizontal,
    Vertical,
}

impl FollowAxis {
    pub const ALL: [FollowAxis; 3] = [FollowAxis::Rotation, FollowAxis::Horizontal, FollowAxis::Vertical];

    fn index(self) -> usize {
        match self {
            FollowAxis::Rotation => 0,
            FollowAxis::Horizontal => 1,
            FollowAxis::Vertical => 2,
        }
    }
}

/// Real-world posture as reported by the sit/stand tracker this frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Posture {
    pub sitting: bool,
    /// One-shot: the posture flipped this frame.
    pub changed: bool,
    pub locked: bool,
    /// Standing head height mode (metres).
    pub standing_mode: f32,
}

/// Per-frame view of the avatar needed to decide activation.
#[derive(Debug, Clone, Copy)]
pub struct FollowInputs<'a> {
    /// Tracked poses in sensor space.
    pub frame: &'a SensorFrame,
    pub head_averages: &'a HeadAverages,
    /// Estimated body (hips, yaw only) in sensor space.
    pub desired_body: Pose,
    /// Current body in sensor space.
    pub current_body: Pose,
    pub posture: Posture,
    /// Rig units per sensor metre.
    pub rig_units_per_meter: f32,
    /// Sensor-to-world scale.
    pub scale: f32,
    pub has_drive_input: bool,
}

/// Side requests raised while deciding activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FollowRequests {
    /// The walking state was entered this frame.
    pub enter_walking: bool,
    /// Drop the standing height mode to the current head height.
    pub reset_height_mode: bool,
    /// Snap the head facing average to the current head facing.
    pub reset_head_facing: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// FollowHelper
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FollowHelper {
    config: FollowConfig,
    rig: RigDefaults,
    detector: StepDetector,
    time_remaining: [f32; 3],
    walking: bool,
}

impl FollowHelper {
    pub fn new(config: FollowConfig, rig: RigDefaults) -> Self {
        let detector = StepDetector::from_config(&config);
        Self {
            config,
            rig,
            detector,
            time_remaining: [0.0; 3],
            walking: false,
        }
    }

    pub fn config(&self) -> &FollowConfig {
        &self.config
    }

    // ── axis state ─────────────────────────────────────────────────────────

    pub fn activate(&mut self, axis: FollowAxis, snap: bool) {
        self.time_remaining[axis.index()] = if snap { FOLLOW_TIME_IMMEDIATE_SNAP } else { self.config.follow_time };
        debug!(?axis, snap, "follow activated");
    }

    pub fn deactivate(&mut self, axis: FollowAxis) {
        self.time_remaining[axis.index()] = 0.0;
    }

    pub fn deactivate_all(&mut self) {
        self.time_remaining = [0.0; 3];
    }

    pub fn is_active(&self, axis: FollowAxis) -> bool {
        self.time_remaining[axis.index()] > 0.0
    }

    pub fn is_any_active(&self) -> bool {
        self.time_remaining.iter().any(|t| *t > 0.0)
    }

    pub fn time_remaining(&self, axis: FollowAxis) -> f32 {
        self.time_remaining[axis.index()]
    }

    /// The longest time remaining over all axes; this is what the
    /// character controller is given.
    pub fn max_time_remaining(&self) -> f32 {
        self.time_remaining.iter().copied().fold(0.0, f32::max)
    }

    /// One physics substep elapsed. The snap sentinel always resolves to
    /// zero.
    pub fn decrement_time_remaining(&mut self, dt: f32) {
        for time in &mut self.time_remaining {
            if *time == FOLLOW_TIME_IMMEDIATE_SNAP {
                *time = 0.0;
            } else {
                *time = (*time - dt).max(0.0);
            }
        }
    }

    pub fn is_walking(&self) -> bool {
        self.walking
    }

    pub fn set_walking(&mut self, walking: bool) {
        self.walking = walking;
    }

    // ── activation rules ───────────────────────────────────────────────────

    pub fn should_activate_rotation(&self, inputs: &FollowInputs<'_>) -> bool {
        let body_facing = facing_dir_2d(inputs.current_body.rotation);
        let head_facing = inputs.head_averages.facing_average();
        body_facing.dot(head_facing) < self.config.rotation_threshold_degrees.to_radians().cos()
    }

    /// Horizontal offset of the head from its rest position over the current
    /// body, in the body's frame and rig units. `None` when the head is not
    /// tracked.
    pub fn head_offset(&self, inputs: &FollowInputs<'_>) -> Option<Vec3> {
        let head = inputs.frame.tracked(Action::Head)?;
        let local = inputs.current_body.unit_scale().inverse().transform_point(head.translation) * inputs.rig_units_per_meter;
        Some(local - (self.rig.eyes - self.rig.hips))
    }

    /// `true` while the head stays inside the asymmetric base of support.
    /// An untracked head counts as inside.
    pub fn within_base_of_support(&self, inputs: &FollowInputs<'_>) -> bool {
        let Some(offset) = self.head_offset(inputs) else {
            return true;
        };
        offset.z > -self.config.support_anterior
            && offset.z < self.config.support_posterior
            && offset.x.abs() < self.config.support_lateral
    }

    /// Horizontal activation while the user sits: lean along the body axes.
    pub fn should_activate_horizontal_sitting(&self, inputs: &FollowInputs<'_>) -> bool {
        let offset = inputs.desired_body.translation - inputs.current_body.translation;
        let forward = inputs.current_body.rotation * Vec3::NEG_Z;
        let right = inputs.current_body.rotation * Vec3::X;
        let forward_lean = forward.dot(offset);
        let lateral_lean = right.dot(offset);

        let leaning = forward_lean > self.config.sitting_forward_limit
            || forward_lean < -self.config.sitting_backward_limit
            || lateral_lean.abs() > self.config.sitting_lateral_limit;
        leaning || (!self.config.lean_allowed && !self.within_base_of_support(inputs))
    }

    /// Horizontal activation while the user stands: walking, a detected
    /// step, or a stretched spine.
    pub fn should_activate_horizontal_standing(&mut self, inputs: &FollowInputs<'_>, requests: &mut FollowRequests) -> bool {
        if self.walking {
            return true;
        }
        let head = inputs.frame.pose(Action::Head);
        if !self.within_base_of_support(inputs) {
            if !self.config.lean_allowed {
                return true;
            }
            let sample = StepSample::new(head, inputs.frame.pose(Action::LeftHand), inputs.frame.pose(Action::RightHand))
                .with_rotation_average(inputs.head_averages.rotation_average())
                .with_standing_mode(inputs.posture.standing_mode, inputs.scale);
            match self.detector.first_rejection(&sample) {
                None => {
                    debug!("footstep detected");
                    return true;
                }
                Some(rule) => debug!(rule, "step rejected"),
            }
        }

        if self.is_active(FollowAxis::Horizontal) || self.is_active(FollowAxis::Vertical) {
            return false;
        }
        let Some(offset) = self.head_offset(inputs) else {
            return false;
        };
        let head_from_hips = offset + (self.rig.eyes - self.rig.hips);
        let rest_length = (self.rig.eyes - self.rig.hips).length();
        if head_from_hips.length() > rest_length * (1.0 + self.config.spine_stretch_limit) {
            debug!(stretch = head_from_hips.length() / rest_length, "spine stretch recenter");
            requests.reset_height_mode = true;
            if horizontal_speed(&head) > self.config.walk_speed_threshold {
                requests.enter_walking = true;
                self.walking = true;
            }
            return true;
        }
        false
    }

    pub fn should_activate_vertical(&self, inputs: &FollowInputs<'_>) -> bool {
        let offset = inputs.desired_body.translation.y - inputs.current_body.translation.y;
        let posture = inputs.posture;
        if posture.changed {
            true
        } else if posture.sitting {
            (posture.locked && offset > self.config.cylinder_top) || offset < self.config.sitting_bottom
        } else {
            offset > self.config.cylinder_top || offset < self.config.cylinder_bottom
        }
    }

    /// Evaluate every inactive axis and activate those whose rule fires.
    pub fn pre_physics_update(&mut self, inputs: &FollowInputs<'_>) -> FollowRequests {
        let mut requests = FollowRequests::default();
        let head = inputs.frame.pose(Action::Head);
        if self.walking && !self.is_active(FollowAxis::Horizontal) && horizontal_speed(&head) < self.config.walk_speed_threshold {
            debug!("leaving walking state");
            self.walking = false;
        }

        if !self.is_active(FollowAxis::Rotation) && (inputs.has_drive_input || self.should_activate_rotation(inputs)) {
            let snap = inputs.frame.is_tracked(Action::Hips);
            self.activate(FollowAxis::Rotation, snap);
            requests.reset_head_facing = true;
        }

        if !self.is_active(FollowAxis::Horizontal) {
            let activate = inputs.has_drive_input
                || if inputs.posture.sitting {
                    self.should_activate_horizontal_sitting(inputs)
                } else {
                    self.should_activate_horizontal_standing(inputs, &mut requests)
                };
            if activate {
                self.activate(FollowAxis::Horizontal, false);
                if self.config.step_resets_rotation && !inputs.posture.sitting && !self.is_active(FollowAxis::Rotation) {
                    self.activate(FollowAxis::Rotation, inputs.frame.is_tracked(Action::Hips));
                    requests.reset_head_facing = true;
                }
            }
        }

        if !self.is_active(FollowAxis::Vertical) && (inputs.has_drive_input || self.should_activate_vertical(inputs)) {
            self.activate(FollowAxis::Vertical, false);
        }
        requests
    }

    /// Current world pose with only the active axes replaced by the desired
    /// pose. Scale is removed.
    pub fn follow_world_pose(&self, desired_world: &Pose, current_world: &Pose) -> Pose {
        let mut follow = current_world.unit_scale();
        if self.is_active(FollowAxis::Rotation) {
            follow.rotation = desired_world.rotation;
        }
        if self.is_active(FollowAxis::Horizontal) {
            follow.translation.x = desired_world.translation.x;
            follow.translation.z = desired_world.translation.z;
        }
        if self.is_active(FollowAxis::Vertical) {
            follow.translation.y = desired_world.translation.y;
        }
        follow
    }

    /// Consume the substeps the controller ran and fold its world-space
    /// follow displacement back into the sensor-space body.
    pub fn post_physics_update(
        &mut self,
        substeps: &[f32],
        current_body: &Pose,
        linear_displacement: Vec3,
        angular_displacement: Quat,
        sensor_to_world: &Pose,
    ) -> Pose {
        if !self.is_any_active() {
            return *current_body;
        }
        for dt in substeps {
            self.decrement_time_remaining(*dt);
        }
        let world_to_sensor = sensor_to_world.inverse();
        let sensor_linear = world_to_sensor.transform_vector(linear_displacement);
        let sensor_angular = (world_to_sensor.rotation * angular_displacement * sensor_to_world.rotation).normalize();
        Pose::from_rotation_translation(
            (sensor_angular * current_body.rotation).normalize(),
            current_body.translation + sensor_linear,
        )
    }
}

fn horizontal_speed(pose: &SensorPose) -> f32 {
    if pose.is_valid() {
        Vec3::new(pose.velocity.x, 0.0, pose.velocity.z).length()
    } else {
        0.0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
