//! [`StepDetector`] – heuristic classifier for "the user took a real footstep".
//!
//! A step is only recognised when every registered [`StepRule`] agrees. Rules
//! are evaluated in insertion order and the first one that rejects the
//! sample is reported, which keeps the reason visible in debug logs.
//!
//! The default rule set:
//! - [`HeadAngularVelocityRule`] – the head is not spinning.
//! - [`HeightModeRule`] – the head is near its usual standing height.
//! - [`HandDirectionRule`] – both hands move the same way as the head.
//! - [`HandAngularVelocityRule`] – the hands are not spinning.
//! - [`HeadVelocityRule`] – the head is actually translating.
//! - [`HeadLevelRule`] – the head is level with its recent average.
//!
//! # Example
//!
//! ```
//! use avatar_recenter::step_detector::{StepDetector, StepSample, HeadVelocityRule};
//! use avatar_types::SensorPose;
//! use glam::{Quat, Vec3};
//!
//! let mut detector = StepDetector::new();
//! detector.add_rule(Box::new(HeadVelocityRule { min_speed: 0.15 }));
//!
//! let head = SensorPose::new(Vec3::new(0.0, 1.6, 0.0), Quat::IDENTITY)
//!     .with_velocity(Vec3::new(0.4, 0.0, 0.0), Vec3::ZERO);
//! let sample = StepSample::new(head, SensorPose::invalid(), SensorPose::invalid());
//! assert!(detector.is_step(&sample));
//! ```

use avatar_types::SensorPose;
use glam::{EulerRot, Quat, Vec3};

use crate::follow::FollowConfig;

const VELOCITY_EPSILON: f32 = 0.02;

// ────────────────────────────────────────────────────────────────────────────
// Sample
// ────────────────────────────────────────────────────────────────────────────

/// Everything the rules look at, in sensor space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSample {
    pub head: SensorPose,
    pub left_hand: SensorPose,
    pub right_hand: SensorPose,
    /// Low-pass filtered head orientation.
    pub head_rotation_average: Quat,
    /// Usual standing head height (metres).
    pub standing_mode: f32,
    /// Sensor-to-world scale; the height rule tolerance grows with it.
    pub scale: f32,
}

impl StepSample {
    pub fn new(head: SensorPose, left_hand: SensorPose, right_hand: SensorPose) -> Self {
        Self {
            head,
            left_hand,
            right_hand,
            head_rotation_average: head.rotation,
            standing_mode: head.translation.y,
            scale: 1.0,
        }
    }

    pub fn with_rotation_average(mut self, rotation: Quat) -> Self {
        self.head_rotation_average = rotation;
        self
    }

    pub fn with_standing_mode(mut self, mode: f32, scale: f32) -> Self {
        self.standing_mode = mode;
        self.scale = scale;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// One condition a footstep must satisfy.
pub trait StepRule: Send + Sync {
    /// Short name used in debug logs.
    fn name(&self) -> &str;

    /// `true` when the sample is consistent with a footstep.
    fn check(&self, sample: &StepSample) -> bool;
}

// ────────────────────────────────────────────────────────────────────────────
// StepDetector
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct StepDetector {
    rules: Vec<Box<dyn StepRule>>,
}

impl std::fmt::Debug for StepDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDetector")
            .field("rules", &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl StepDetector {
    /// Create an empty detector. With no rules every sample is a step.
    pub fn new() -> Self {
        Self::default()
    }

    /// The six standard rules with thresholds from `config`.
    pub fn from_config(config: &FollowConfig) -> Self {
        let mut detector = Self::new();
        detector.add_rule(Box::new(HeadAngularVelocityRule {
            max_angular_speed: config.head_angular_velocity_threshold,
        }));
        detector.add_rule(Box::new(HeightModeRule {
            tolerance: config.mode_height_threshold,
        }));
        detector.add_rule(Box::new(HandDirectionRule {
            min_alignment: config.hand_direction_threshold,
        }));
        detector.add_rule(Box::new(HandAngularVelocityRule {
            max_angular_speed: config.hand_angular_velocity_threshold,
        }));
        detector.add_rule(Box::new(HeadVelocityRule {
            min_speed: config.head_velocity_threshold,
        }));
        detector.add_rule(Box::new(HeadLevelRule {
            tolerance_degrees: config.head_level_tolerance_degrees,
        }));
        detector
    }

    /// Register a rule. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn StepRule>) {
        self.rules.push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Name of the first rule that rejects `sample`, if any.
    pub fn first_rejection(&self, sample: &StepSample) -> Option<&str> {
        self.rules.iter().find(|rule| !rule.check(sample)).map(|rule| rule.name())
    }

    pub fn is_step(&self, sample: &StepSample) -> bool {
        self.first_rejection(sample).is_none()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Head angular speed (rad/s) must stay below `max_angular_speed`.
pub struct HeadAngularVelocityRule {
    pub max_angular_speed: f32,
}

impl StepRule for HeadAngularVelocityRule {
    fn name(&self) -> &str {
        "head_angular_velocity"
    }

    fn check(&self, sample: &StepSample) -> bool {
        !sample.head.is_valid() || sample.head.angular_velocity.length() < self.max_angular_speed
    }
}

/// Head height minus the standing mode must exceed `tolerance × scale`
/// (tolerance is negative: a little below the mode is fine).
pub struct HeightModeRule {
    pub tolerance: f32,
}

impl StepRule for HeightModeRule {
    fn name(&self) -> &str {
        "height_mode"
    }

    fn check(&self, sample: &StepSample) -> bool {
        sample.head.is_valid() && sample.head.translation.y - sample.standing_mode > self.tolerance * sample.scale
    }
}

/// Each tracked hand's horizontal velocity must point along the head's.
pub struct HandDirectionRule {
    /// Minimum cosine between hand and head horizontal velocity.
    pub min_alignment: f32,
}

impl HandDirectionRule {
    fn hand_matches(&self, hand: &SensorPose, head: &SensorPose) -> bool {
        if !hand.is_valid() || !head.is_valid() {
            return true;
        }
        let hand_velocity = horizontal(hand.velocity);
        let head_velocity = horizontal(head.velocity);
        if hand_velocity.length() <= VELOCITY_EPSILON || head_velocity.length() <= VELOCITY_EPSILON {
            return false;
        }
        hand_velocity.normalize().dot(head_velocity.normalize()) > self.min_alignment
    }
}

impl StepRule for HandDirectionRule {
    fn name(&self) -> &str {
        "hand_direction"
    }

    fn check(&self, sample: &StepSample) -> bool {
        self.hand_matches(&sample.left_hand, &sample.head) && self.hand_matches(&sample.right_hand, &sample.head)
    }
}

/// Each tracked hand's angular speed must stay below `max_angular_speed`.
pub struct HandAngularVelocityRule {
    pub max_angular_speed: f32,
}

impl StepRule for HandAngularVelocityRule {
    fn name(&self) -> &str {
        "hand_angular_velocity"
    }

    fn check(&self, sample: &StepSample) -> bool {
        [sample.left_hand, sample.right_hand]
            .iter()
            .all(|hand| !hand.is_valid() || hand.angular_velocity.length() < self.max_angular_speed)
    }
}

/// Horizontal head speed must exceed `min_speed`.
pub struct HeadVelocityRule {
    pub min_speed: f32,
}

impl StepRule for HeadVelocityRule {
    fn name(&self) -> &str {
        "head_velocity"
    }

    fn check(&self, sample: &StepSample) -> bool {
        sample.head.is_valid() && horizontal(sample.head.velocity).length() > self.min_speed
    }
}

/// Head pitch and roll must stay within `tolerance_degrees` of the averaged
/// head orientation.
pub struct HeadLevelRule {
    pub tolerance_degrees: f32,
}

impl StepRule for HeadLevelRule {
    fn name(&self) -> &str {
        "head_level"
    }

    fn check(&self, sample: &StepSample) -> bool {
        if !sample.head.is_valid() {
            return false;
        }
        let (_, current_pitch, current_roll) = sample.head.rotation.to_euler(EulerRot::YXZ);
        let (_, average_pitch, average_roll) = sample.head_rotation_average.to_euler(EulerRot::YXZ);
        let tolerance = self.tolerance_degrees.to_radians();
        (current_pitch - average_pitch).abs() < tolerance && (current_roll - average_roll).abs() < tolerance
    }
}

fn horizontal(v: Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn walking_sample() -> StepSample {
        let stride = Vec3::new(0.0, 0.0, -0.5);
        let head = SensorPose::new(Vec3::new(0.0, 1.65, -0.2), Quat::IDENTITY).with_velocity(stride, Vec3::ZERO);
        let left = SensorPose::new(Vec3::new(-0.25, 1.0, -0.2), Quat::IDENTITY).with_velocity(stride * 0.8, Vec3::ZERO);
        let right = SensorPose::new(Vec3::new(0.25, 1.0, -0.2), Quat::IDENTITY).with_velocity(stride * 0.9, Vec3::ZERO);
        StepSample::new(head, left, right).with_standing_mode(1.65, 1.0)
    }

    fn detector() -> StepDetector {
        StepDetector::from_config(&FollowConfig::default())
    }

    // ---- detector ---------------------------------------------------------

    #[test]
    fn empty_detector_accepts_everything() {
        let d = StepDetector::new();
        assert_eq!(d.rule_count(), 0);
        assert!(d.is_step(&StepSample::new(SensorPose::invalid(), SensorPose::invalid(), SensorPose::invalid())));
    }

    #[test]
    fn clean_walk_is_a_step() {
        let d = detector();
        assert_eq!(d.rule_count(), 6);
        assert_eq!(d.first_rejection(&walking_sample()), None);
    }

    #[test]
    fn first_failing_rule_is_reported() {
        let mut sample = walking_sample();
        sample.head.angular_velocity = Vec3::new(0.0, 2.0, 0.0);
        sample.head.velocity = Vec3::ZERO;
        assert_eq!(detector().first_rejection(&sample), Some("head_angular_velocity"));
    }

    // ---- individual rules -------------------------------------------------

    #[test]
    fn standing_still_is_not_a_step() {
        let mut sample = walking_sample();
        sample.head.velocity = Vec3::new(0.0, 0.0, -0.05);
        sample.left_hand.velocity = Vec3::new(0.0, 0.0, -0.05);
        sample.right_hand.velocity = Vec3::new(0.0, 0.0, -0.05);
        assert!(!detector().is_step(&sample));
    }

    #[test]
    fn crouching_fails_height_mode() {
        let rule = HeightModeRule { tolerance: -0.02 };
        let mut sample = walking_sample();
        assert!(rule.check(&sample));
        sample.head.translation.y = 1.60;
        assert!(!rule.check(&sample));
        sample.scale = 3.0;
        assert!(rule.check(&sample), "tolerance scales with the sensor scale");
    }

    #[test]
    fn hands_moving_against_head_fail_direction() {
        let rule = HandDirectionRule { min_alignment: 0.4 };
        let mut sample = walking_sample();
        sample.right_hand.velocity = Vec3::new(0.0, 0.0, 0.5);
        assert!(!rule.check(&sample));
    }

    #[test]
    fn untracked_hands_do_not_block_direction() {
        let rule = HandDirectionRule { min_alignment: 0.4 };
        let mut sample = walking_sample();
        sample.left_hand = SensorPose::invalid();
        sample.right_hand = SensorPose::invalid();
        assert!(rule.check(&sample));
    }

    #[test]
    fn still_hands_fail_direction() {
        let rule = HandDirectionRule { min_alignment: 0.4 };
        let mut sample = walking_sample();
        sample.left_hand.velocity = Vec3::ZERO;
        assert!(!rule.check(&sample));
    }

    #[test]
    fn spinning_hand_fails_angular_rule() {
        let rule = HandAngularVelocityRule { max_angular_speed: 3.3 };
        let mut sample = walking_sample();
        assert!(rule.check(&sample));
        sample.left_hand.angular_velocity = Vec3::new(4.0, 0.0, 0.0);
        assert!(!rule.check(&sample));
    }

    #[test]
    fn vertical_head_motion_is_not_walking() {
        let rule = HeadVelocityRule { min_speed: 0.15 };
        let mut sample = walking_sample();
        sample.head.velocity = Vec3::new(0.0, -1.0, 0.0);
        assert!(!rule.check(&sample));
    }

    #[test]
    fn nodding_fails_head_level() {
        let rule = HeadLevelRule { tolerance_degrees: 7.0 };
        let mut sample = walking_sample();
        assert!(rule.check(&sample));
        sample.head.rotation = Quat::from_rotation_x(10.0_f32.to_radians());
        assert!(!rule.check(&sample));
        sample.head_rotation_average = Quat::from_rotation_x(6.0_f32.to_radians());
        assert!(rule.check(&sample), "level relative to the average");
    }

    #[test]
    fn turning_head_is_still_level() {
        let rule = HeadLevelRule { tolerance_degrees: 7.0 };
        let mut sample = walking_sample();
        sample.head.rotation = Quat::from_rotation_y(1.0);
        assert!(rule.check(&sample));
    }
}
