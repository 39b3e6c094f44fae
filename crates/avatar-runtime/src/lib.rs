//! `avatar-runtime` – the local avatar's per-tick loop.
//!
//! Ties the sensor, recentering and physics layers together and exposes the
//! thread-safe surfaces other systems talk to.
//!
//! # Modules
//!
//! - [`avatar`] – [`LocalAvatar`][avatar::LocalAvatar]: owns every layer and
//!   runs them in order once per tick, returning a
//!   [`TickReport`][avatar::TickReport].
//! - [`body`] – [`AvatarBody`][body::AvatarBody]: what local and remote
//!   avatars have in common, plus [`OtherAvatar`][body::OtherAvatar] and
//!   JSON [`AvatarSnapshot`][body::AvatarSnapshot]s.
//! - [`motion`] – [`MotionIntegrator`][motion::MotionIntegrator]: drive keys,
//!   turning, scripted motors and thrust into controller motors.
//! - [`reconcile`] – sensor/avatar/world frame bookkeeping and the hand-off
//!   to the [`CharacterController`][avatar_physics::CharacterController].
//! - [`commands`] – [`AvatarHandle`][commands::AvatarHandle]: a cloneable
//!   sender for mutators called from other threads.
//! - [`joints`] – pinned joint records.
//! - [`shared`] – hold actions and avatar-entity data shared with script and
//!   network threads.
//! - [`rig`] – [`AnimationRig`][rig::AnimationRig] sinks for per-tick IK
//!   targets.
//! - [`config`] – [`AvatarConfig`][config::AvatarConfig], the TOML-friendly
//!   aggregate of every layer's settings.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to export tick spans.

pub mod avatar;
pub mod body;
pub mod commands;
pub mod config;
pub mod joints;
pub mod motion;
pub mod reconcile;
pub mod rig;
pub mod shared;
pub mod telemetry;

pub use avatar::{LocalAvatar, TickReport};
pub use body::{AvatarBody, AvatarInstance, AvatarSnapshot, OtherAvatar};
pub use commands::{AvatarCommand, AvatarHandle, CommandQueue};
pub use config::{AvatarConfig, MAX_AVATAR_SCALE, MIN_AVATAR_SCALE, SCALE_STEP};
pub use joints::{PinnedJoint, PinnedJoints};
pub use motion::{ControlScheme, MotionConfig, MotionIntegrator, MotorFrame, ScriptedMotor, TurnMode};
pub use reconcile::{AvatarFrames, PhysicsReconciliation, Reconciled};
pub use rig::{AnimationRig, BusRig, RecordingRig};
pub use shared::{EntityDataStore, HoldAction, HoldActions};
pub use telemetry::{init_tracing, LogFormat, TracerProviderGuard};
