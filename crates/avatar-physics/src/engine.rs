//! Seams between the character controller and the physics engine that owns
//! the fixed-substep loop.
//!
//! The engine is an external collaborator: it stores the avatar's rigid body,
//! integrates it, and resolves contacts. The controller never holds a
//! reference to the engine; instead the engine hands it the body and a
//! read-only view of the world once per substep through
//! [`CharacterAction::update_action`].

use avatar_types::AvatarError;
use glam::{Quat, Vec3};

use crate::flags::CollisionGroup;
use crate::shape::CollisionShape;

// ────────────────────────────────────────────────────────────────────────────
// Queries
// ────────────────────────────────────────────────────────────────────────────

/// Result of a segment cast against world geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Fraction of the segment at the hit, in `[0, 1]`.
    pub fraction: f32,
    pub point: Vec3,
    /// Surface normal at the hit, pointing back toward the ray origin.
    pub normal: Vec3,
}

/// Read-only collision queries available during a substep.
pub trait CollisionWorld {
    /// Closest hit along `from → to` among objects whose group intersects
    /// `mask`.
    fn ray_test(&self, from: Vec3, to: Vec3, mask: CollisionGroup) -> Option<RayHit>;
}

/// Result of an [`EntityQuery`] ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityHit {
    pub distance: f32,
    pub point: Vec3,
    pub normal: Vec3,
}

/// Ray-intersection queries against world entities, used outside the
/// substep loop (safe landing, step height resolution).
pub trait EntityQuery: Send + Sync {
    fn find_ray_intersection(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<EntityHit>;
}

// ────────────────────────────────────────────────────────────────────────────
// Character body
// ────────────────────────────────────────────────────────────────────────────

/// A contact point recorded by the engine during the last substep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    pub point: Vec3,
    /// Points from the other object toward the character.
    pub normal: Vec3,
}

/// Rigid-body state of the character as the engine stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyState {
    /// Capsule center in world space.
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    /// Acceleration the engine applies every substep.
    pub gravity: Vec3,
    /// Contacts found while resolving the previous substep.
    pub contacts: Vec<Contact>,
}

impl BodyState {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            gravity: Vec3::ZERO,
            contacts: Vec::new(),
        }
    }
}

impl Default for BodyState {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Quat::IDENTITY)
    }
}

/// Per-substep hook run by the engine before it integrates the character.
pub trait CharacterAction {
    fn update_action(&mut self, body: &mut BodyState, world: &dyn CollisionWorld, dt: f32);
}

// ────────────────────────────────────────────────────────────────────────────
// PhysicsEngine
// ────────────────────────────────────────────────────────────────────────────

/// The physics engine as seen by the avatar core.
pub trait PhysicsEngine: CollisionWorld + Send {
    /// `false` until the world around the avatar has loaded.
    fn is_ready(&self) -> bool;

    /// Insert the character body, or replace its shape and filtering while
    /// keeping the current body state.
    fn set_character_shape(&mut self, shape: CollisionShape, group: CollisionGroup, mask: CollisionGroup);

    fn set_character_mask(&mut self, mask: CollisionGroup) -> Result<(), AvatarError>;

    fn remove_character(&mut self);

    fn character(&self) -> Option<&BodyState>;

    fn character_mut(&mut self) -> Option<&mut BodyState>;

    /// Advance by `dt`, running as many fixed substeps as fit. `action` runs
    /// once per substep. Returns the number of substeps taken.
    fn step_simulation(&mut self, dt: f32, action: &mut dyn CharacterAction) -> u32;
}
