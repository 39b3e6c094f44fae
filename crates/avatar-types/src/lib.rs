//! `avatar-types` – shared vocabulary for the avatar locomotion stack.
//!
//! Every other crate in the workspace speaks in these types: tracked
//! [`Action`]s and their [`SensorPose`]s coming from the input layer, logical
//! [`DriveKeys`], the [`CharacterState`] of the physics controller, the IK
//! targets handed to the animation rig, the [`Event`] envelope routed over the
//! event bus, and the single [`AvatarError`] type.

use chrono::{DateTime, Utc};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Tracked actions
// ────────────────────────────────────────────────────────────────────────────

/// A tracked controller action. Doubles as the joint name for IK targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Head,
    LeftHand,
    RightHand,
    LeftFoot,
    RightFoot,
    Hips,
    Spine2,
    LeftHandThumb1,
    LeftHandIndex1,
    LeftHandMiddle1,
    LeftHandRing1,
    LeftHandPinky1,
    RightHandThumb1,
    RightHandIndex1,
    RightHandMiddle1,
    RightHandRing1,
    RightHandPinky1,
}

impl Action {
    /// Every action the input layer may report.
    pub const ALL: [Action; 17] = [
        Action::Head,
        Action::LeftHand,
        Action::RightHand,
        Action::LeftFoot,
        Action::RightFoot,
        Action::Hips,
        Action::Spine2,
        Action::LeftHandThumb1,
        Action::LeftHandIndex1,
        Action::LeftHandMiddle1,
        Action::LeftHandRing1,
        Action::LeftHandPinky1,
        Action::RightHandThumb1,
        Action::RightHandIndex1,
        Action::RightHandMiddle1,
        Action::RightHandRing1,
        Action::RightHandPinky1,
    ];

    /// Joints the animation rig accepts IK targets for.
    pub const IK_JOINTS: [Action; 7] = [
        Action::Hips,
        Action::Head,
        Action::LeftHand,
        Action::RightHand,
        Action::LeftFoot,
        Action::RightFoot,
        Action::Spine2,
    ];

    /// `true` for the per-finger actions.
    pub fn is_finger(self) -> bool {
        !matches!(
            self,
            Action::Head
                | Action::LeftHand
                | Action::RightHand
                | Action::LeftFoot
                | Action::RightFoot
                | Action::Hips
                | Action::Spine2
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor poses
// ────────────────────────────────────────────────────────────────────────────

/// One tracked pose in whatever frame it was produced in (usually sensor
/// space).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorPose {
    /// Position (metres).
    pub translation: Vec3,
    /// Orientation.
    pub rotation: Quat,
    /// Linear velocity (m/s).
    pub velocity: Vec3,
    /// Angular velocity (rad/s, axis scaled by rate).
    pub angular_velocity: Vec3,
    /// Whether the tracker reported this pose as valid.
    pub valid: bool,
}

impl SensorPose {
    /// A valid, stationary pose.
    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            valid: true,
        }
    }

    /// The identity pose, flagged untracked.
    pub fn invalid() -> Self {
        Self {
            valid: false,
            ..Self::new(Vec3::ZERO, Quat::IDENTITY)
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3, angular_velocity: Vec3) -> Self {
        self.velocity = velocity;
        self.angular_velocity = angular_velocity;
        self
    }

    /// `true` when the pose is flagged valid and every component is finite
    /// with a usable rotation.
    pub fn is_valid(&self) -> bool {
        self.valid && self.is_finite()
    }

    /// `true` when every component is finite and the rotation has non-zero
    /// length.
    pub fn is_finite(&self) -> bool {
        self.translation.is_finite()
            && self.rotation.is_finite()
            && self.velocity.is_finite()
            && self.angular_velocity.is_finite()
            && self.rotation.length_squared() > 1e-6
    }
}

impl Default for SensorPose {
    fn default() -> Self {
        Self::invalid()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Drive input
// ────────────────────────────────────────────────────────────────────────────

/// Logical drive keys sampled from keyboard, gamepad or hand-controller
/// sticks. Axis values are in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveKeys {
    /// Strafe (right is positive).
    pub translate_x: f32,
    /// Vertical (up is positive). Only honoured while flying.
    pub translate_y: f32,
    /// Forward/back (forward is positive).
    pub translate_z: f32,
    /// Smooth-turn rate input (left is positive).
    pub yaw: f32,
    /// Snap-turn input; any non-zero value requests a snap.
    pub step_yaw: f32,
    /// Direct yaw delta (degrees) from mouse look.
    pub delta_yaw: f32,
    /// Sprint modifier.
    pub sprint: bool,
}

impl DriveKeys {
    /// `true` when any translation or rotation input is non-zero.
    pub fn has_drive_input(&self) -> bool {
        self.translate_x != 0.0
            || self.translate_y != 0.0
            || self.translate_z != 0.0
            || self.yaw != 0.0
            || self.step_yaw != 0.0
            || self.delta_yaw != 0.0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Character state
// ────────────────────────────────────────────────────────────────────────────

/// State of the physics character controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CharacterState {
    #[default]
    Ground,
    Takeoff,
    InAir,
    Hover,
    Seated,
}

impl std::fmt::Display for CharacterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CharacterState::Ground => write!(f, "ground"),
            CharacterState::Takeoff => write!(f, "takeoff"),
            CharacterState::InAir => write!(f, "in-air"),
            CharacterState::Hover => write!(f, "hover"),
            CharacterState::Seated => write!(f, "seated"),
        }
    }
}

/// Follow time meaning "jump to the desired pose on the next substep".
///
/// Any decrement of a time-remaining holding this value resolves it to zero.
pub const FOLLOW_TIME_IMMEDIATE_SNAP: f32 = f32::MAX;

// ────────────────────────────────────────────────────────────────────────────
// Animation rig output
// ────────────────────────────────────────────────────────────────────────────

/// How much the rig should trust an IK target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IkFlag {
    /// Driven by a real tracker (or a pin).
    Enabled,
    /// Produced by a heuristic.
    Estimated,
}

/// One named-joint IK target in avatar space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IkTarget {
    pub joint: Action,
    pub translation: Vec3,
    pub rotation: Quat,
    pub flag: IkFlag,
}

/// Everything the animation rig receives for one tick.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RigFrame {
    pub targets: Vec<IkTarget>,
    pub state: CharacterState,
}

impl RigFrame {
    /// The target for `joint`, if one was produced this tick.
    pub fn target(&self, joint: Action) -> Option<&IkTarget> {
        self.targets.iter().find(|t| t.joint == joint)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "avatar-runtime::avatar"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// IK targets and controller state for the animation rig.
    Rig(RigFrame),
    StateChanged {
        from: CharacterState,
        to: CharacterState,
    },
    SitStandChanged {
        sitting: bool,
    },
    Teleported {
        position: Vec3,
    },
    SafeLanding {
        from: Vec3,
        to: Vec3,
    },
    /// World-space target for an entity held in a hand.
    HoldTarget {
        entity: Uuid,
        position: Vec3,
        rotation: Quat,
    },
    Fault {
        component: String,
        message: String,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every crate in the workspace.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AvatarError {
    /// The collision shape could not be built from the given parameters.
    /// Fatal: the avatar cannot be simulated without it.
    #[error("Shape Creation Failed: {0}")]
    ShapeCreation(String),

    #[error("Invalid Configuration: {field}: {details}")]
    InvalidConfig { field: String, details: String },

    #[error("Physics Not Ready")]
    PhysicsNotReady,

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Config File Error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_pose_is_not_valid() {
        let mut pose = SensorPose::new(Vec3::new(0.0, 1.7, 0.0), Quat::IDENTITY);
        assert!(pose.is_valid());
        pose.translation.y = f32::NAN;
        assert!(!pose.is_valid());
    }

    #[test]
    fn zero_rotation_is_not_valid() {
        let pose = SensorPose::new(Vec3::ZERO, Quat::from_xyzw(0.0, 0.0, 0.0, 0.0));
        assert!(!pose.is_valid());
    }

    #[test]
    fn flagged_invalid_pose_is_not_valid_even_if_finite() {
        let pose = SensorPose::invalid();
        assert!(pose.is_finite());
        assert!(!pose.is_valid());
    }

    #[test]
    fn finger_actions_are_classified() {
        assert!(Action::LeftHandIndex1.is_finger());
        assert!(!Action::LeftHand.is_finger());
        assert_eq!(Action::ALL.iter().filter(|a| a.is_finger()).count(), 10);
    }

    #[test]
    fn drive_keys_default_has_no_input() {
        assert!(!DriveKeys::default().has_drive_input());
        let keys = DriveKeys {
            translate_z: 1.0,
            ..Default::default()
        };
        assert!(keys.has_drive_input());
    }

    #[test]
    fn rig_frame_target_lookup() {
        let frame = RigFrame {
            targets: vec![IkTarget {
                joint: Action::Hips,
                translation: Vec3::new(0.0, 0.9, 0.0),
                rotation: Quat::IDENTITY,
                flag: IkFlag::Estimated,
            }],
            state: CharacterState::Ground,
        };
        assert!(frame.target(Action::Hips).is_some());
        assert!(frame.target(Action::Head).is_none());
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::new(
            "avatar-runtime::avatar",
            EventPayload::StateChanged {
                from: CharacterState::Ground,
                to: CharacterState::Takeoff,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(event.source, back.source);
        assert!(matches!(
            back.payload,
            EventPayload::StateChanged {
                to: CharacterState::Takeoff,
                ..
            }
        ));
    }

    #[test]
    fn avatar_error_display() {
        let err = AvatarError::ShapeCreation("radius must be positive".to_string());
        assert!(err.to_string().contains("Shape Creation Failed"));

        let err2 = AvatarError::InvalidConfig {
            field: "user_height".to_string(),
            details: "must be finite".to_string(),
        };
        assert!(err2.to_string().contains("user_height"));
    }
}
