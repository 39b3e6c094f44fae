//! `avatar-perception` – turns tracked sensor poses into body estimates.
//!
//! # Modules
//!
//! - [`transform`] – [`Pose`][transform::Pose]: uniform-scale similarity
//!   transforms between sensor, avatar and world space, plus facing and
//!   soft-clamp helpers.
//! - [`sensor_frame`] – [`SensorFrameTracker`][sensor_frame::SensorFrameTracker]:
//!   latches one consistent snapshot of controller poses per tick through the
//!   [`InputSystem`][sensor_frame::InputSystem] trait, and
//!   [`HeadAverages`][sensor_frame::HeadAverages] for smoothed head facing.
//! - [`sit_stand`] – [`SitStandTracker`][sit_stand::SitStandTracker] and
//!   [`StandingHeightMode`][sit_stand::StandingHeightMode]: real-world
//!   posture detection from head height.
//! - [`estimator`] – [`BodyEstimator`][estimator::BodyEstimator]: hips pose
//!   from the head (HMD-relative) or from a center-of-gravity balance model.

pub mod estimator;
pub mod sensor_frame;
pub mod sit_stand;
pub mod transform;

pub use estimator::{BodyEstimator, EstimateSource, EstimatorConfig, EstimatorFrames, HipsEstimate, RigDefaults};
pub use sensor_frame::{HeadAverages, InputSystem, SensorFrame, SensorFrameTracker, SharedInput};
pub use sit_stand::{SitStandConfig, SitStandTracker, SitStandUpdate, StandingHeightMode};
pub use transform::Pose;
