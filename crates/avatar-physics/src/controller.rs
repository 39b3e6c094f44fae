//! Character controller for the locally driven avatar.
//!
//! [`CharacterController`] owns the avatar's collision shape and drives a
//! rigid body inside an external [`PhysicsEngine`]. Once per frame the caller
//! pushes motors, thrust and a follow target, then calls
//! [`pre_simulation`](CharacterController::pre_simulation), lets the engine
//! step (the controller runs as the engine's [`CharacterAction`] once per
//! substep), and finally reads the result back with
//! [`post_simulation`](CharacterController::post_simulation).
//!
//! # State machine
//!
//! ```text
//!  Ground ──jump──▶ Takeoff ──0.25 s──▶ InAir ──landing──▶ Ground
//!    ▲  │                                 │
//!    │  └──────fly toggle / no ground─────┼──▶ Hover ──touch down──▶ Ground
//!    │                                    └─double jump──▶ Hover
//!  Seated ◀──begin_sit / end_sit──▶ InAir
//! ```
//!
//! While collisionless the controller only alternates between `Ground` and
//! `Hover`.
//!
//! # Lazy updates
//!
//! Shape and collision-mask changes only raise pending flags. They are
//! applied at the start of the next
//! [`pre_simulation`](CharacterController::pre_simulation), never in the
//! middle of a substep.

use avatar_types::{AvatarError, CharacterState, FOLLOW_TIME_IMMEDIATE_SNAP};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{BodyState, CharacterAction, CollisionWorld, PhysicsEngine, RayHit};
use crate::flags::CollisionGroup;
use crate::ray_shotgun::{RayShotgun, RayShotgunResult};
use crate::shape::CollisionShape;

/// Timescales at or above this disable a motor component.
pub const MAX_CHARACTER_MOTOR_TIMESCALE: f32 = 60.0;
const MIN_CHARACTER_MOTOR_TIMESCALE: f32 = 0.002;
const MAX_TAU: f32 = 1.0;
const MIN_TARGET_SPEED: f32 = 0.001;
const MIN_FOLLOW_TIME_REMAINING: f32 = 0.005;
const SHAPE_EPSILON: f32 = 1.0e-5;
/// Shotgun penetration deeper than this counts as stuck.
const STUCK_PENETRATION: f32 = 0.02;
const STEP_PROBE_MARGIN: f32 = 0.05;
const MAX_STEP_UP_SPEED_FRACTION: f32 = 0.65;
const MIN_COLLISION_BRAKE_ATTENUATION: f32 = 0.25;

const PENDING_FLAG_ADD_TO_SIMULATION: u32 = 1 << 0;
const PENDING_FLAG_REMOVE_FROM_SIMULATION: u32 = 1 << 1;
const PENDING_FLAG_UPDATE_SHAPE: u32 = 1 << 2;
const PENDING_FLAG_JUMP: u32 = 1 << 3;
const PENDING_FLAG_UPDATE_COLLISION_MASK: u32 = 1 << 4;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Signed gravity along the up axis (m/s², negative pulls down).
    pub gravity: f32,
    /// Vertical speed of a default jump (m/s).
    pub jump_speed: f32,
    pub min_jump_height: f32,
    /// Longest floor ray; farther floors count as "no ground".
    pub fall_height: f32,
    pub min_hover_height: f32,
    pub max_walking_speed: f32,
    /// Seconds spent crouching in `Takeoff` before the jump impulse.
    pub takeoff_period: f32,
    /// A floor ray hit keeps counting as a hit for this long.
    pub ray_hit_grace_period: f32,
    /// Cosine of the steepest walkable slope.
    pub min_floor_normal_dot_up: f32,
    /// Fractions of the full half height.
    pub max_step_fraction: f32,
    pub min_step_fraction: f32,
    /// Consecutive penetrating substeps before a safe landing is requested.
    pub stuck_substeps: u32,
    pub collision_brake_timescale: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gravity: -5.0,
            jump_speed: 3.5,
            min_jump_height: 0.25,
            fall_height: 20.0,
            min_hover_height: 2.5,
            max_walking_speed: 2.65,
            takeoff_period: 0.25,
            ray_hit_grace_period: 0.5,
            min_floor_normal_dot_up: 0.5,
            max_step_fraction: 0.65,
            min_step_fraction: 0.005,
            stuck_substeps: 30,
            collision_brake_timescale: 0.25,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Motors and results
// ────────────────────────────────────────────────────────────────────────────

/// Velocity target expressed in the frame of `rotation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacterMotor {
    pub velocity: Vec3,
    pub rotation: Quat,
    pub horizontal_timescale: f32,
    pub vertical_timescale: f32,
}

impl CharacterMotor {
    pub fn new(velocity: Vec3, rotation: Quat, horizontal_timescale: f32, vertical_timescale: f32) -> Self {
        Self {
            velocity,
            rotation,
            horizontal_timescale,
            vertical_timescale,
        }
    }
}

/// Avatar-root transform and velocity harvested after a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacterMotion {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FollowTarget {
    /// Desired capsule center.
    position: Vec3,
    rotation: Quat,
}

// ────────────────────────────────────────────────────────────────────────────
// CharacterController
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CharacterController {
    config: ControllerConfig,
    shape: CollisionShape,
    pending_shape: Option<CollisionShape>,
    ray_shotgun: RayShotgun,
    state: CharacterState,
    pending_flags: u32,
    in_simulation: bool,

    up: Vec3,
    gravity: f32,
    jump_height: f32,

    motors: Vec<CharacterMotor>,
    target_velocity: Vec3,
    linear_acceleration: Vec3,
    avatar_transform: Option<(Vec3, Quat)>,
    last_motion: Option<CharacterMotion>,

    follow_target: Option<FollowTarget>,
    follow_time_remaining: f32,
    follow_linear_displacement: Vec3,
    follow_angular_displacement: Quat,
    follow_substeps: Vec<f32>,

    simulation_time: f32,
    takeoff_start_time: f32,
    ray_hit_time: Option<f32>,
    floor_distance: f32,
    has_support: bool,

    flying_allowed: bool,
    fly_requested: bool,
    collisionless_requested: bool,
    zone_allows_collisionless: bool,
    collide_with_other_avatars: bool,
    current_mask: CollisionGroup,

    stuck_substeps: u32,
    needs_safe_landing: bool,
    collision_brake: f32,
    last_shotgun: RayShotgunResult,
}

impl CharacterController {
    /// Build a controller around `shape`. The body is inserted into the
    /// engine on the first [`pre_simulation`](Self::pre_simulation) after the
    /// engine reports ready.
    pub fn new(config: ControllerConfig, shape: CollisionShape) -> Result<Self, AvatarError> {
        if !config.min_floor_normal_dot_up.is_finite() || config.min_floor_normal_dot_up <= 0.0 || config.min_floor_normal_dot_up >= 1.0 {
            return Err(AvatarError::InvalidConfig {
                field: "min_floor_normal_dot_up".to_string(),
                details: format!("must be in (0, 1), got {}", config.min_floor_normal_dot_up),
            });
        }
        let ray_shotgun = Self::build_shotgun(&config, &shape);
        let gravity = config.gravity;
        let jump_height = Self::jump_height_for(config.jump_speed, gravity).max(config.min_jump_height);
        Ok(Self {
            config,
            shape,
            pending_shape: None,
            ray_shotgun,
            state: CharacterState::Ground,
            pending_flags: PENDING_FLAG_ADD_TO_SIMULATION | PENDING_FLAG_UPDATE_COLLISION_MASK,
            in_simulation: false,
            up: Vec3::Y,
            gravity,
            jump_height,
            motors: Vec::new(),
            target_velocity: Vec3::ZERO,
            linear_acceleration: Vec3::ZERO,
            avatar_transform: None,
            last_motion: None,
            follow_target: None,
            follow_time_remaining: 0.0,
            follow_linear_displacement: Vec3::ZERO,
            follow_angular_displacement: Quat::IDENTITY,
            follow_substeps: Vec::new(),
            simulation_time: 0.0,
            takeoff_start_time: 0.0,
            ray_hit_time: None,
            floor_distance: f32::MAX,
            has_support: false,
            flying_allowed: true,
            fly_requested: false,
            collisionless_requested: false,
            zone_allows_collisionless: true,
            collide_with_other_avatars: true,
            current_mask: CollisionGroup::MASK_MY_AVATAR,
            stuck_substeps: 0,
            needs_safe_landing: false,
            collision_brake: 0.0,
            last_shotgun: RayShotgunResult::default(),
        })
    }

    /// Build from an avatar-space bounding box.
    pub fn from_bounding_box(config: ControllerConfig, corner: Vec3, dimensions: Vec3) -> Result<Self, AvatarError> {
        Self::new(config, CollisionShape::from_bounding_box(corner, dimensions)?)
    }

    fn build_shotgun(config: &ControllerConfig, shape: &CollisionShape) -> RayShotgun {
        RayShotgun::new(shape, config.max_step_fraction * shape.full_half_height(), config.min_floor_normal_dot_up)
    }

    fn jump_height_for(speed: f32, gravity: f32) -> f32 {
        let g = gravity.abs().max(f32::EPSILON);
        speed * speed / (2.0 * g)
    }

    // ── accessors ──────────────────────────────────────────────────────────

    pub fn state(&self) -> CharacterState {
        self.state
    }

    pub fn shape(&self) -> &CollisionShape {
        &self.shape
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn is_in_simulation(&self) -> bool {
        self.in_simulation
    }

    /// Floor distance below the capsule bottom from the last state update;
    /// `f32::MAX` when no floor was found.
    pub fn floor_distance(&self) -> f32 {
        self.floor_distance
    }

    pub fn has_support(&self) -> bool {
        self.has_support
    }

    pub fn target_velocity(&self) -> Vec3 {
        self.target_velocity
    }

    pub fn last_shotgun_result(&self) -> RayShotgunResult {
        self.last_shotgun
    }

    pub fn max_step_height(&self) -> f32 {
        self.config.max_step_fraction * self.shape.full_half_height()
    }

    pub fn min_step_height(&self) -> f32 {
        self.config.min_step_fraction * self.shape.full_half_height()
    }

    /// Speed multiplier in `[0.25, 1]` that the motion layer applies to the
    /// flying boost. Drops while the body keeps running into geometry.
    pub fn collision_brake_attenuation(&self) -> f32 {
        1.0 - (1.0 - MIN_COLLISION_BRAKE_ATTENUATION) * self.collision_brake
    }

    pub fn needs_safe_landing(&self) -> bool {
        self.needs_safe_landing
    }

    pub fn clear_safe_landing(&mut self) {
        self.needs_safe_landing = false;
        self.stuck_substeps = 0;
    }

    // ── configuration ──────────────────────────────────────────────────────

    /// Queue a new shape from an avatar-space bounding box. Identical
    /// dimensions only update the local offset.
    pub fn set_dimensions(&mut self, corner: Vec3, dimensions: Vec3) -> Result<(), AvatarError> {
        let shape = CollisionShape::from_bounding_box(corner, dimensions)?;
        if shape.same_dimensions(&self.shape, SHAPE_EPSILON) {
            self.shape = self.shape.clone().with_local_offset(shape.local_offset());
            self.pending_shape = None;
            return Ok(());
        }
        self.pending_shape = Some(shape);
        self.pending_flags |= PENDING_FLAG_UPDATE_SHAPE;
        Ok(())
    }

    /// Gravity vector; the up axis follows its opposite.
    pub fn set_gravity(&mut self, gravity: Vec3) {
        let magnitude = gravity.length();
        if magnitude > f32::EPSILON && gravity.is_finite() {
            self.up = -gravity / magnitude;
            self.gravity = -magnitude;
        } else {
            self.gravity = 0.0;
        }
    }

    pub fn set_jump_height(&mut self, height: f32) {
        if height.is_finite() {
            self.jump_height = height.max(self.config.min_jump_height);
        }
    }

    pub fn jump_height(&self) -> f32 {
        self.jump_height
    }

    pub fn set_flying_allowed(&mut self, allowed: bool) {
        self.flying_allowed = allowed;
    }

    /// Explicit fly toggle. On enters `Hover` at the next state update;
    /// off drops into `InAir`.
    pub fn set_flying(&mut self, flying: bool) {
        if self.fly_requested == flying {
            return;
        }
        self.fly_requested = flying;
        if !flying && self.state == CharacterState::Hover {
            self.set_state(CharacterState::InAir, "fly toggled off");
        }
    }

    pub fn is_fly_requested(&self) -> bool {
        self.fly_requested
    }

    pub fn set_collisionless(&mut self, collisionless: bool) {
        if self.collisionless_requested != collisionless {
            self.collisionless_requested = collisionless;
            self.pending_flags |= PENDING_FLAG_UPDATE_COLLISION_MASK;
        }
    }

    pub fn set_zone_allows_collisionless(&mut self, allowed: bool) {
        if self.zone_allows_collisionless != allowed {
            self.zone_allows_collisionless = allowed;
            self.pending_flags |= PENDING_FLAG_UPDATE_COLLISION_MASK;
        }
    }

    pub fn set_collide_with_other_avatars(&mut self, collide: bool) {
        if self.collide_with_other_avatars != collide {
            self.collide_with_other_avatars = collide;
            self.pending_flags |= PENDING_FLAG_UPDATE_COLLISION_MASK;
        }
    }

    /// Mask the controller wants, whether or not it has been applied yet.
    pub fn compute_collision_mask(&self) -> CollisionGroup {
        if self.collisionless_requested && self.zone_allows_collisionless {
            CollisionGroup::MASK_COLLISIONLESS
        } else if self.collide_with_other_avatars {
            CollisionGroup::MASK_MY_AVATAR
        } else {
            CollisionGroup::MASK_MY_AVATAR_NO_OTHERS
        }
    }

    /// Mask currently installed in the engine.
    pub fn collision_mask(&self) -> CollisionGroup {
        self.current_mask
    }

    pub fn is_collisionless(&self) -> bool {
        self.current_mask.is_empty()
    }

    pub fn has_pending_mask_update(&self) -> bool {
        self.pending_flags & PENDING_FLAG_UPDATE_COLLISION_MASK != 0
    }

    pub fn remove_from_simulation(&mut self) {
        self.pending_flags &= !PENDING_FLAG_ADD_TO_SIMULATION;
        self.pending_flags |= PENDING_FLAG_REMOVE_FROM_SIMULATION;
    }

    pub fn add_to_simulation(&mut self) {
        self.pending_flags &= !PENDING_FLAG_REMOVE_FROM_SIMULATION;
        self.pending_flags |= PENDING_FLAG_ADD_TO_SIMULATION;
    }

    // ── per-frame input ────────────────────────────────────────────────────

    /// Request a jump; honoured by the next state update if on the ground.
    pub fn jump(&mut self) {
        self.pending_flags |= PENDING_FLAG_JUMP;
    }

    pub fn begin_sit(&mut self, position: Vec3, rotation: Quat) {
        self.set_position_and_orientation(position, rotation);
        self.set_state(CharacterState::Seated, "begin sit");
    }

    pub fn end_sit(&mut self) {
        if self.state == CharacterState::Seated {
            self.set_state(CharacterState::InAir, "end sit");
        }
    }

    /// Avatar-root transform to push into the body before the next step.
    pub fn set_position_and_orientation(&mut self, position: Vec3, rotation: Quat) {
        self.avatar_transform = Some((position, rotation));
    }

    pub fn clear_motors(&mut self) {
        self.motors.clear();
    }

    pub fn add_motor(&mut self, motor: CharacterMotor) {
        self.motors.push(motor);
    }

    pub fn motors(&self) -> &[CharacterMotor] {
        &self.motors
    }

    /// One-frame thrust applied after the motors.
    pub fn set_linear_acceleration(&mut self, acceleration: Vec3) {
        self.linear_acceleration = acceleration;
    }

    /// Desired avatar-root pose the body should reach within
    /// `time_remaining` seconds, or instantly for
    /// [`FOLLOW_TIME_IMMEDIATE_SNAP`].
    pub fn set_follow_parameters(&mut self, position: Vec3, rotation: Quat, time_remaining: f32) {
        self.follow_target = Some(FollowTarget {
            position: position + rotation * self.shape.local_offset(),
            rotation,
        });
        self.follow_time_remaining = time_remaining;
    }

    pub fn follow_time_remaining(&self) -> f32 {
        self.follow_time_remaining
    }

    /// Avatar-root displacement applied by follow since the last reset.
    pub fn follow_linear_displacement(&self) -> Vec3 {
        self.follow_linear_displacement
    }

    pub fn follow_angular_displacement(&self) -> Quat {
        self.follow_angular_displacement
    }

    /// Substep lengths simulated since the last reset.
    pub fn follow_substeps(&self) -> &[f32] {
        &self.follow_substeps
    }

    pub fn reset_follow_displacement(&mut self) {
        self.follow_linear_displacement = Vec3::ZERO;
        self.follow_angular_displacement = Quat::IDENTITY;
        self.follow_substeps.clear();
    }

    // ── frame lifecycle ────────────────────────────────────────────────────

    /// Apply pending changes, push the avatar transform into the body and
    /// run the state machine.
    ///
    /// Returns `Ok(false)` when the engine is not ready yet; a shape rebuild
    /// failure is returned as [`AvatarError::ShapeCreation`].
    pub fn pre_simulation(&mut self, engine: &mut dyn PhysicsEngine) -> Result<bool, AvatarError> {
        if !engine.is_ready() {
            return Ok(false);
        }
        self.apply_pending_changes(engine)?;
        if !self.in_simulation {
            return Ok(false);
        }

        let offset = self.shape.local_offset();
        let gravity = self.state_gravity();
        let Some(body) = engine.character_mut() else {
            self.in_simulation = false;
            self.pending_flags |= PENDING_FLAG_ADD_TO_SIMULATION;
            return Ok(false);
        };
        if let Some((position, rotation)) = self.avatar_transform.take() {
            body.position = position + rotation * offset;
            body.rotation = rotation;
        }
        body.gravity = gravity;
        let position = body.position;
        let velocity = body.linear_velocity;

        let ray_length = self.shape.full_half_height() + self.config.fall_height;
        let floor_hit = engine.ray_test(position, position - self.up * ray_length, CollisionGroup::MASK_ENVIRONMENT);
        let impulse = self.update_state(floor_hit, ray_length, velocity);
        let gravity = self.state_gravity();
        if let Some(body) = engine.character_mut() {
            body.linear_velocity += impulse;
            body.gravity = gravity;
        }
        Ok(true)
    }

    /// Read the avatar-root transform and velocity back out of the engine.
    pub fn post_simulation(&mut self, engine: &dyn PhysicsEngine) -> Option<CharacterMotion> {
        if !self.in_simulation {
            return None;
        }
        let body = engine.character()?;
        let motion = CharacterMotion {
            position: body.position - body.rotation * self.shape.local_offset(),
            rotation: body.rotation,
            velocity: body.linear_velocity,
        };
        self.last_motion = Some(motion);
        self.linear_acceleration = Vec3::ZERO;
        Some(motion)
    }

    pub fn last_motion(&self) -> Option<CharacterMotion> {
        self.last_motion
    }

    /// Run the walkability scan for a shape centered at `position`.
    pub fn test_ray_shotgun(&self, world: &dyn CollisionWorld, position: Vec3, step: Vec3, result: &mut RayShotgunResult) -> bool {
        self.ray_shotgun.test(
            world,
            position,
            step,
            self.up,
            self.state == CharacterState::Hover,
            CollisionGroup::MASK_ENVIRONMENT,
            result,
        )
    }

    fn apply_pending_changes(&mut self, engine: &mut dyn PhysicsEngine) -> Result<(), AvatarError> {
        if self.pending_flags & PENDING_FLAG_REMOVE_FROM_SIMULATION != 0 {
            self.pending_flags &= !PENDING_FLAG_REMOVE_FROM_SIMULATION;
            if self.in_simulation {
                engine.remove_character();
                self.in_simulation = false;
            }
        }
        if self.pending_flags & PENDING_FLAG_UPDATE_SHAPE != 0 {
            self.pending_flags &= !PENDING_FLAG_UPDATE_SHAPE;
            if let Some(shape) = self.pending_shape.take() {
                info!(radius = shape.radius(), half_height = shape.half_height(), "rebuilding character shape");
                self.ray_shotgun = Self::build_shotgun(&self.config, &shape);
                self.shape = shape;
                if self.in_simulation {
                    engine.set_character_shape(self.shape.clone(), self.collision_group(), self.current_mask);
                }
            }
        }
        if self.pending_flags & PENDING_FLAG_ADD_TO_SIMULATION != 0 {
            self.pending_flags &= !PENDING_FLAG_ADD_TO_SIMULATION;
            let mask = self.compute_collision_mask();
            self.current_mask = mask;
            engine.set_character_shape(self.shape.clone(), self.collision_group(), mask);
            self.in_simulation = true;
            debug!("character added to simulation");
        }
        if self.pending_flags & PENDING_FLAG_UPDATE_COLLISION_MASK != 0 && self.in_simulation {
            self.pending_flags &= !PENDING_FLAG_UPDATE_COLLISION_MASK;
            let mask = self.compute_collision_mask();
            if mask != self.current_mask {
                engine.set_character_mask(mask)?;
                debug!(from = self.current_mask.0, to = mask.0, "collision mask updated");
                self.current_mask = mask;
            }
        }
        Ok(())
    }

    fn collision_group(&self) -> CollisionGroup {
        if self.current_mask.is_empty() {
            CollisionGroup::COLLISIONLESS
        } else {
            CollisionGroup::MY_AVATAR
        }
    }

    fn state_gravity(&self) -> Vec3 {
        let weightless = self.is_collisionless() || matches!(self.state, CharacterState::Hover | CharacterState::Seated);
        if weightless { Vec3::ZERO } else { self.up * self.gravity }
    }

    fn set_state(&mut self, state: CharacterState, reason: &str) {
        if state != self.state {
            debug!(from = %self.state, to = %state, reason, "character state change");
            self.state = state;
        }
    }

    /// Run one state-machine update. Returns a velocity impulse to add to the
    /// body (the jump).
    fn update_state(&mut self, hit: Option<RayHit>, ray_length: f32, velocity: Vec3) -> Vec3 {
        let jump_requested = self.pending_flags & PENDING_FLAG_JUMP != 0;
        self.pending_flags &= !PENDING_FLAG_JUMP;
        if self.state == CharacterState::Seated {
            return Vec3::ZERO;
        }

        let full_half_height = self.shape.full_half_height();
        let radius = self.shape.radius();
        let mut ray_has_hit = hit.is_some();
        match hit {
            Some(hit) => {
                self.floor_distance = hit.fraction * ray_length - full_half_height;
                self.ray_hit_time = Some(self.simulation_time);
            }
            None => {
                let recent = self
                    .ray_hit_time
                    .is_some_and(|t| self.simulation_time - t < self.config.ray_hit_grace_period);
                if recent {
                    ray_has_hit = true;
                } else {
                    self.floor_distance = f32::MAX;
                }
            }
        }

        let fly_to_ground_threshold = 0.1 * radius;
        let ground_to_fly_threshold = 0.8 * radius + self.shape.half_height();
        let vertical_speed = velocity.dot(self.up);
        let horizontal_speed = (velocity - self.up * vertical_speed).length();
        let flying_fast = horizontal_speed > 0.75 * self.config.max_walking_speed;
        let no_ground = !ray_has_hit && !self.has_support;
        let mut impulse = Vec3::ZERO;

        if self.is_collisionless() {
            if ray_has_hit && velocity.length() <= self.config.max_walking_speed {
                self.set_state(CharacterState::Ground, "collisionless above ground");
            } else {
                self.set_state(CharacterState::Hover, "collisionless in air");
            }
            return impulse;
        }

        match self.state {
            CharacterState::Ground => {
                if no_ground {
                    let next = if self.flying_allowed { CharacterState::Hover } else { CharacterState::InAir };
                    self.set_state(next, "no ground detected");
                } else if jump_requested {
                    self.takeoff_start_time = self.simulation_time;
                    self.set_state(CharacterState::Takeoff, "jump pressed");
                } else if self.fly_requested && self.flying_allowed {
                    self.set_state(CharacterState::Hover, "fly toggled on");
                } else if ray_has_hit && !self.has_support && self.floor_distance > ground_to_fly_threshold {
                    self.set_state(CharacterState::InAir, "falling");
                }
            }
            CharacterState::Takeoff => {
                if no_ground {
                    let next = if self.flying_allowed { CharacterState::Hover } else { CharacterState::InAir };
                    self.set_state(next, "no ground detected");
                } else if self.simulation_time - self.takeoff_start_time >= self.config.takeoff_period {
                    impulse = self.up * self.jump_speed();
                    self.set_state(CharacterState::InAir, "takeoff done");
                }
            }
            CharacterState::InAir => {
                let landing_speed = 0.5 * self.jump_speed();
                if vertical_speed <= landing_speed && (self.floor_distance < fly_to_ground_threshold || self.has_support) {
                    self.set_state(CharacterState::Ground, "hit ground");
                } else if self.flying_allowed && (jump_requested || self.fly_requested || no_ground) {
                    self.set_state(CharacterState::Hover, "double jump or no ground");
                }
            }
            CharacterState::Hover => {
                if !self.flying_allowed {
                    self.set_state(CharacterState::InAir, "flying not allowed");
                } else if self.fly_requested {
                    // explicit flying holds hover
                } else if (self.floor_distance < fly_to_ground_threshold || self.has_support) && !flying_fast {
                    self.set_state(CharacterState::Ground, "touching ground");
                } else if self.floor_distance < self.config.min_hover_height && !jump_requested && !flying_fast {
                    self.set_state(CharacterState::InAir, "near ground");
                }
            }
            CharacterState::Seated => {}
        }
        impulse
    }

    fn jump_speed(&self) -> f32 {
        (2.0 * self.gravity.abs() * self.jump_height).sqrt()
    }

    // ── substep helpers ────────────────────────────────────────────────────

    fn check_for_support(&self, body: &BodyState) -> bool {
        let half_height = self.shape.half_height();
        body.contacts.iter().any(|contact| {
            contact.normal.dot(self.up) > self.config.min_floor_normal_dot_up
                && (contact.point - body.position).dot(self.up) < -half_height
        })
    }

    /// Blend every motor into `velocity`, weighted by how strongly each one
    /// pulls this substep.
    fn compute_new_velocity(&mut self, dt: f32, velocity: &mut Vec3) {
        if velocity.length_squared() < MIN_TARGET_SPEED * MIN_TARGET_SPEED {
            *velocity = Vec3::ZERO;
        }
        self.target_velocity = Vec3::ZERO;
        let mut velocities = Vec::with_capacity(self.motors.len());
        let mut weights = Vec::with_capacity(self.motors.len());
        for index in 0..self.motors.len() {
            let motor = self.motors[index];
            let (blended, weight) = self.apply_motor(&motor, dt, *velocity);
            velocities.push(blended);
            weights.push(weight);
        }
        let total: f32 = weights.iter().sum();
        if total > 0.0 {
            *velocity = velocities.iter().zip(&weights).map(|(v, w)| *v * (*w / total)).sum();
            self.target_velocity /= total;
        }
        if velocity.length_squared() < MIN_TARGET_SPEED * MIN_TARGET_SPEED {
            *velocity = Vec3::ZERO;
        }
        // thrust goes on top
        self.target_velocity += dt * self.linear_acceleration;
        *velocity += dt * self.linear_acceleration;
    }

    fn apply_motor(&mut self, motor: &CharacterMotor, dt: f32, world_velocity: Vec3) -> (Vec3, f32) {
        let to_motor = motor.rotation.inverse();
        let mut velocity = to_motor * world_velocity;
        let uniform = self.is_collisionless()
            || self.state == CharacterState::Hover
            || motor.horizontal_timescale == motor.vertical_timescale;

        if uniform {
            let timescale = motor.horizontal_timescale.max(MIN_CHARACTER_MOTOR_TIMESCALE);
            let tau = (dt / timescale).min(MAX_TAU);
            velocity += tau * (motor.velocity - velocity);
            self.target_velocity += motor.rotation * (tau * motor.velocity);
            return (motor.rotation * velocity, tau);
        }

        let up = to_motor * self.up;
        let v_velocity = up * velocity.dot(up);
        let h_velocity = velocity - v_velocity;
        let v_motor = up * motor.velocity.dot(up);
        let h_motor = motor.velocity - v_motor;

        let mut max_tau = 0.0_f32;
        let mut h_result = h_velocity;
        let mut v_result = v_velocity;
        if motor.horizontal_timescale < MAX_CHARACTER_MOTOR_TIMESCALE {
            let tau = (dt / motor.horizontal_timescale.max(MIN_CHARACTER_MOTOR_TIMESCALE)).min(MAX_TAU);
            max_tau = tau;
            h_result += (h_motor - h_velocity) * tau;
        }
        if motor.vertical_timescale < MAX_CHARACTER_MOTOR_TIMESCALE {
            let tau = (dt / motor.vertical_timescale.max(MIN_CHARACTER_MOTOR_TIMESCALE)).min(MAX_TAU);
            max_tau = max_tau.max(tau);
            v_result += (v_motor - v_velocity) * tau;
        }
        self.target_velocity += motor.rotation * (max_tau * motor.velocity);
        (motor.rotation * (h_result + v_result), max_tau)
    }

    /// Scan ahead, track penetration, and lift the body over low steps.
    fn scan_and_step(&mut self, body: &mut BodyState, world: &dyn CollisionWorld, velocity: &mut Vec3, dt: f32) {
        let horizontal_target = self.target_velocity - self.up * self.target_velocity.dot(self.up);
        let horizontal_speed = horizontal_target.length();
        if horizontal_speed < MIN_TARGET_SPEED || self.is_collisionless() {
            self.last_shotgun = RayShotgunResult::default();
            self.stuck_substeps = 0;
            return;
        }
        let step = horizontal_target * dt;
        let step_length = step.length();
        let mut result = RayShotgunResult::default();
        let blocked = self.test_ray_shotgun(world, body.position, step, &mut result);
        self.last_shotgun = result;

        if blocked && result.hit_fraction * step_length < -STUCK_PENETRATION {
            self.stuck_substeps += 1;
        } else {
            self.stuck_substeps = 0;
        }
        if self.stuck_substeps >= self.config.stuck_substeps && !self.needs_safe_landing {
            warn!(substeps = self.stuck_substeps, "character stuck in geometry, requesting safe landing");
            self.needs_safe_landing = true;
        }

        if blocked && result.walkable && self.state == CharacterState::Ground {
            self.step_up(body, world, step, result.hit_fraction, horizontal_speed, velocity, dt);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_up(
        &mut self,
        body: &mut BodyState,
        world: &dyn CollisionWorld,
        step: Vec3,
        hit_fraction: f32,
        horizontal_speed: f32,
        velocity: &mut Vec3,
        dt: f32,
    ) {
        let direction = step.normalize_or_zero();
        let radius = self.shape.radius();
        let max_step = self.max_step_height();
        let horizontal_distance = radius + hit_fraction.max(0.0) * step.length() + STEP_PROBE_MARGIN;
        let foot = body.position - self.up * self.shape.full_half_height();
        let probe = foot + direction * horizontal_distance + self.up * max_step;
        let Some(hit) = world.ray_test(probe, probe - self.up * max_step, CollisionGroup::MASK_ENVIRONMENT) else {
            return;
        };
        if hit.normal.dot(self.up) < self.config.min_floor_normal_dot_up {
            return;
        }
        let step_height = max_step * (1.0 - hit.fraction);
        if step_height <= self.min_step_height() {
            return;
        }
        let time_to_step = horizontal_distance / horizontal_speed;
        let mut step_up_speed = (step_height / time_to_step).min(MAX_STEP_UP_SPEED_FRACTION * horizontal_speed);
        // cover gravity's pull during the step
        step_up_speed -= 0.5 * self.gravity * time_to_step;
        if velocity.dot(self.up) < step_up_speed {
            body.position += self.up * (dt * step_up_speed);
        }
    }

    fn update_collision_brake(&mut self, body: &BodyState, velocity: Vec3, dt: f32) {
        let pushing_into_contact = self.state == CharacterState::Hover
            && body.contacts.iter().any(|contact| velocity.dot(contact.normal) < 0.0);
        if pushing_into_contact {
            self.collision_brake = 1.0;
        } else {
            let decay = (-dt / self.config.collision_brake_timescale.max(f32::EPSILON)).exp();
            self.collision_brake *= decay;
        }
    }

    fn apply_follow(&mut self, body: &mut BodyState, dt: f32) {
        let Some(target) = self.follow_target else {
            return;
        };
        let start_position = body.position;
        let start_rotation = body.rotation;
        let (end_position, end_rotation) = if self.follow_time_remaining == FOLLOW_TIME_IMMEDIATE_SNAP {
            self.follow_time_remaining = 0.0;
            (target.position, target.rotation)
        } else {
            self.follow_time_remaining -= dt;
            if self.follow_time_remaining < MIN_FOLLOW_TIME_REMAINING {
                self.follow_time_remaining = self.follow_time_remaining.max(0.0);
                return;
            }
            let remaining = self.follow_time_remaining;
            let max_displacement = 0.5 * self.shape.radius();
            let linear = ((target.position - start_position) / remaining * dt).clamp_length_max(max_displacement);

            let current_facing = horizontal_facing(start_rotation);
            let desired_facing = horizontal_facing(target.rotation);
            let delta_angle = current_facing.dot(desired_facing).clamp(-1.0, 1.0).acos();
            let current_right = Vec3::new(-current_facing.z, 0.0, current_facing.x);
            let sign = if desired_facing.dot(current_right) < 0.0 { -1.0 } else { 1.0 };
            // a positive turn about +Y swings -Z toward -X, i.e. to the left
            let angular = Quat::from_axis_angle(Vec3::Y, -sign * delta_angle / remaining * dt);
            (start_position + linear, (angular * start_rotation).normalize())
        };

        let offset = self.shape.local_offset();
        let swing = end_rotation * -offset - start_rotation * -offset;
        self.follow_linear_displacement += (end_position - start_position) + swing;
        self.follow_angular_displacement = (end_rotation * start_rotation.inverse()).normalize() * self.follow_angular_displacement;
        body.position = end_position;
        body.rotation = end_rotation;
    }
}

impl CharacterAction for CharacterController {
    fn update_action(&mut self, body: &mut BodyState, world: &dyn CollisionWorld, dt: f32) {
        self.simulation_time += dt;
        self.follow_substeps.push(dt);
        self.has_support = self.check_for_support(body);

        let mut velocity = body.linear_velocity;
        self.compute_new_velocity(dt, &mut velocity);
        if matches!(self.state, CharacterState::Ground | CharacterState::Hover) {
            self.scan_and_step(body, world, &mut velocity, dt);
        }
        self.update_collision_brake(body, velocity, dt);
        self.apply_follow(body, dt);

        if self.state == CharacterState::Seated {
            velocity = Vec3::ZERO;
        }
        body.linear_velocity = velocity;
        body.angular_velocity = Vec3::ZERO;
    }
}

/// Horizontal unit forward (−Z) of `rotation`, Y-up.
fn horizontal_facing(rotation: Quat) -> Vec3 {
    let forward = rotation * Vec3::NEG_Z;
    let flat = Vec3::new(forward.x, 0.0, forward.z);
    if flat.length_squared() > 1.0e-8 {
        flat.normalize()
    } else {
        Vec3::NEG_Z
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
