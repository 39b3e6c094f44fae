//! Aggregate configuration for a [`LocalAvatar`](crate::avatar::LocalAvatar).
//!
//! Every layer owns its own `#[serde(default)]` struct; [`AvatarConfig`]
//! nests them so a single TOML document can tune the whole pipeline and any
//! omitted table falls back to the built-in defaults.

use avatar_perception::{EstimatorConfig, RigDefaults, SitStandConfig};
use avatar_physics::ControllerConfig;
use avatar_recenter::FollowConfig;
use avatar_types::AvatarError;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::motion::MotionConfig;

pub const MIN_AVATAR_SCALE: f32 = 0.005;
pub const MAX_AVATAR_SCALE: f32 = 1000.0;
/// Multiplier applied by one `increase_size` / `decrease_size` step.
pub const SCALE_STEP: f32 = 1.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Real-world height of the user (m).
    pub user_height: f32,
    pub avatar_scale: f32,
    /// Use the center-of-gravity estimator while standing still.
    pub cg_model: bool,
    pub flying_allowed: bool,
    /// Horizontal half extent of the collision bounding box at scale 1 (m).
    pub body_radius: f32,
    /// Destination for `go_home`.
    pub home_position: Vec3,
    /// How far above and below the avatar a safe-landing ray searches (m).
    pub safe_landing_search: f32,
    pub rig: RigDefaults,
    pub estimator: EstimatorConfig,
    pub sit_stand: SitStandConfig,
    pub controller: ControllerConfig,
    pub follow: FollowConfig,
    pub motion: MotionConfig,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            user_height: 1.755,
            avatar_scale: 1.0,
            cg_model: true,
            flying_allowed: true,
            body_radius: 0.25,
            home_position: Vec3::ZERO,
            safe_landing_search: 20.0,
            rig: RigDefaults::default(),
            estimator: EstimatorConfig::default(),
            sit_stand: SitStandConfig::default(),
            controller: ControllerConfig::default(),
            follow: FollowConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

fn positive(field: &str, value: f32) -> Result<(), AvatarError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AvatarError::InvalidConfig {
            field: field.to_string(),
            details: format!("must be positive and finite, got {value}"),
        })
    }
}

impl AvatarConfig {
    /// Reject non-finite or non-positive heights, scales, radii and rates.
    pub fn validate(&self) -> Result<(), AvatarError> {
        positive("user_height", self.user_height)?;
        positive("avatar_scale", self.avatar_scale)?;
        if !(MIN_AVATAR_SCALE..=MAX_AVATAR_SCALE).contains(&self.avatar_scale) {
            return Err(AvatarError::InvalidConfig {
                field: "avatar_scale".to_string(),
                details: format!("must be within [{MIN_AVATAR_SCALE}, {MAX_AVATAR_SCALE}], got {}", self.avatar_scale),
            });
        }
        positive("body_radius", self.body_radius)?;
        positive("safe_landing_search", self.safe_landing_search)?;
        positive("rig.height", self.rig.height)?;
        positive("rig.eyes.y", self.rig.eyes.y)?;
        positive("rig.hips.y", self.rig.hips.y)?;
        positive("follow.follow_time", self.follow.follow_time)?;
        positive("follow.rotation_filter_length", self.follow.rotation_filter_length)?;
        positive("motion.walk_speed", self.motion.walk_speed)?;
        positive("motion.sprint_speed", self.motion.sprint_speed)?;
        positive("motion.max_flying_speed", self.motion.max_flying_speed)?;
        positive("controller.fall_height", self.controller.fall_height)?;
        if !self.home_position.is_finite() {
            return Err(AvatarError::InvalidConfig {
                field: "home_position".to_string(),
                details: "must be finite".to_string(),
            });
        }
        Ok(())
    }

    /// Avatar-space bounding box of the collision shape at `scale`, as
    /// `(corner, dimensions)` with the avatar root at the rest hips.
    pub fn bounding_box(&self, scale: f32) -> (Vec3, Vec3) {
        let radius = self.body_radius * scale;
        let corner = Vec3::new(-radius, -self.rig.hips.y * scale, -radius);
        let dimensions = Vec3::new(2.0 * radius, self.rig.height * scale, 2.0 * radius);
        (corner, dimensions)
    }

    /// Eye height the user is expected to have at their configured height.
    pub fn user_eye_height(&self) -> f32 {
        self.rig.user_eye_height(self.user_height)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(AvatarConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_height() {
        let cfg = AvatarConfig {
            user_height: 0.0,
            ..AvatarConfig::default()
        };
        match cfg.validate() {
            Err(AvatarError::InvalidConfig { field, .. }) => assert_eq!(field, "user_height"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn rejects_nan_radius_and_out_of_range_scale() {
        let cfg = AvatarConfig {
            body_radius: f32::NAN,
            ..AvatarConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = AvatarConfig {
            avatar_scale: 5000.0,
            ..AvatarConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(AvatarError::InvalidConfig { .. })));
    }

    #[test]
    fn bounding_box_puts_feet_at_floor_below_hips() {
        let cfg = AvatarConfig::default();
        let (corner, dims) = cfg.bounding_box(2.0);
        assert!((corner.y + 0.93 * 2.0).abs() < 1e-5);
        assert!((dims.y - 1.755 * 2.0).abs() < 1e-5);
        assert!((dims.x - 1.0).abs() < 1e-5);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: AvatarConfig = serde_json::from_str(r#"{"user_height": 1.6, "follow": {"follow_time": 0.25}}"#).expect("parse");
        assert_eq!(cfg.user_height, 1.6);
        assert_eq!(cfg.follow.follow_time, 0.25);
        assert_eq!(cfg.follow.rotation_threshold_degrees, FollowConfig::default().rotation_threshold_degrees);
        assert_eq!(cfg.motion, MotionConfig::default());
    }
}
