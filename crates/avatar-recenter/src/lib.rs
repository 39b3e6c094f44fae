//! `avatar-recenter` – keeps the virtual body under the real one.
//!
//! # Modules
//!
//! - [`follow`] – [`FollowHelper`][follow::FollowHelper]: per-axis
//!   (rotation, horizontal, vertical) activation rules, substep time
//!   bookkeeping, the combined follow world pose handed to the character
//!   controller, and folding the controller's follow displacement back into
//!   sensor space.
//! - [`step_detector`] – [`StepDetector`][step_detector::StepDetector]: a
//!   rule engine that classifies head and hand motion as a real footstep.

pub mod follow;
pub mod step_detector;

pub use follow::{FollowAxis, FollowConfig, FollowHelper, FollowInputs, FollowRequests, Posture};
pub use step_detector::{StepDetector, StepRule, StepSample};
