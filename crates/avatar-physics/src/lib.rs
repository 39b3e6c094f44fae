//! `avatar-physics` – collision shape, walkability scan and the character
//! controller that drives the avatar's body inside a physics engine.
//!
//! # Modules
//!
//! - [`flags`] – [`CollisionGroup`][flags::CollisionGroup]: group and mask
//!   bits for the avatar's body and its queries.
//! - [`shape`] – [`CollisionShape`][shape::CollisionShape]: the avatar's
//!   six-point convex hull with a radius margin, built from a bounding box.
//! - [`engine`] – the [`PhysicsEngine`][engine::PhysicsEngine],
//!   [`CollisionWorld`][engine::CollisionWorld] and
//!   [`EntityQuery`][engine::EntityQuery] seams, plus the per-substep
//!   [`CharacterAction`][engine::CharacterAction] hook.
//! - [`ray_shotgun`] – [`RayShotgun`][ray_shotgun::RayShotgun]: a grid of
//!   short rays that decides whether the next step is walkable.
//! - [`controller`] – [`CharacterController`][controller::CharacterController]:
//!   the locomotion state machine, motor blending and follow displacement.
//! - [`sim`] – [`SimWorld`][sim::SimWorld]: a small fixed-substep engine over
//!   planes and boxes, used headless and in tests.

pub mod controller;
pub mod engine;
pub mod flags;
pub mod ray_shotgun;
pub mod shape;
pub mod sim;

pub use controller::{CharacterController, CharacterMotion, CharacterMotor, ControllerConfig, MAX_CHARACTER_MOTOR_TIMESCALE};
pub use engine::{BodyState, CharacterAction, CollisionWorld, Contact, EntityHit, EntityQuery, PhysicsEngine, RayHit};
pub use flags::CollisionGroup;
pub use ray_shotgun::{RayShotgun, RayShotgunResult};
pub use shape::CollisionShape;
pub use sim::{SimBox, SimGeometry, SimPlane, SimWorld};
