//! Drive-key integration.
//!
//! [`MotionIntegrator`] turns the latched [`DriveKeys`] into the two things
//! the character controller consumes every tick: a yaw delta for the avatar
//! orientation and a set of [`CharacterMotor`]s (plus a one-frame thrust).
//!
//! Walking speeds come straight from the stick (geared in the analog scheme,
//! constant in the default scheme). Flying builds on the previous motor
//! speed with a growth curve, a minimum boost while pushing and a cap that
//! shrinks while the controller reports a collision brake.
//!
//! # Example
//!
//! ```rust
//! use avatar_runtime::motion::{MotionConfig, MotionInputs, MotionIntegrator};
//! use avatar_types::{CharacterState, DriveKeys};
//!
//! let mut motion = MotionIntegrator::new(MotionConfig { hmd_mode: false, ..MotionConfig::default() });
//! let inputs = MotionInputs {
//!     drive: DriveKeys { translate_z: 1.0, ..DriveKeys::default() },
//!     ..MotionInputs::new(CharacterState::Ground)
//! };
//! let out = motion.update(&inputs, 1.0 / 90.0);
//! assert!(out.motors[0].velocity.z < 0.0);
//! ```

use avatar_perception::transform::cancel_out_roll_and_pitch;
use avatar_physics::{CharacterMotor, MAX_CHARACTER_MOTOR_TIMESCALE};
use avatar_types::{CharacterState, DriveKeys};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const FLYING_MOTOR_TIMESCALE: f32 = 0.05;
/// Multiplied by the sensor-to-world scale.
pub const WALKING_MOTOR_TIMESCALE: f32 = 0.2;
/// Large enough that the controller ignores the motor on that axis.
pub const INVALID_MOTOR_TIMESCALE: f32 = 1.0e6;

const DEFAULT_YAW_SPEED: f32 = 100.0;
const ROTATION_RAMP_TIMESCALE: f32 = 0.5;
const ROTATION_DECAY_TIMESCALE: f32 = 0.05;
const MIN_ROTATION_RATE: f32 = 2.0;
const SPEED_GROWTH_TIMESCALE: f32 = 2.0;
const SPEED_INCREASE_FACTOR: f32 = 1.8;
const MIN_AVATAR_SPEED: f32 = 0.05;
const STICK_FULL_ON: f32 = 0.85;
const MAX_ROLL_ANGLE: f32 = 90.0;
const MIN_ROLL_CONTROL_SPEED: f32 = 2.0;
const PUSH_EPSILON: f32 = 1.0e-4;
const GEAR_SPEEDS: [f32; 5] = [0.2, 0.4, 0.6, 0.8, 1.0];

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// How stick deflection maps to speed while walking in HMD mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlScheme {
    /// Constant sprint speed in the stick direction.
    #[default]
    Default,
    /// Discrete gears; a fully deflected stick sprints.
    Analog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TurnMode {
    #[default]
    Smooth,
    /// Fixed-angle turns; held yaw input repeats them.
    Snap,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub hmd_mode: bool,
    pub control_scheme: ControlScheme,
    /// m/s at avatar scale 1.
    pub walk_speed: f32,
    pub sprint_speed: f32,
    pub max_flying_speed: f32,
    pub walk_speed_scalar: f32,
    /// Stick thresholds above which the 0.2, 0.4, 0.6, 0.8 and 1.0 gears
    /// engage.
    pub gears: [f32; 5],
    /// Smooth-turn rate at full yaw input (deg/s).
    pub yaw_speed: f32,
    pub turn_mode: TurnMode,
    pub snap_turn_degrees: f32,
    pub snap_turn_repeat: f32,
    /// Turn with head roll while flying.
    pub hmd_roll_control: bool,
    pub hmd_roll_dead_zone: f32,
    /// Turn rate at maximum roll (deg/s).
    pub hmd_roll_rate: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            hmd_mode: true,
            control_scheme: ControlScheme::Default,
            walk_speed: 2.6,
            sprint_speed: 3.4,
            max_flying_speed: 30.0,
            walk_speed_scalar: 1.0,
            gears: [0.2, 0.4, 0.6, 0.8, 0.9],
            yaw_speed: DEFAULT_YAW_SPEED,
            turn_mode: TurnMode::Smooth,
            snap_turn_degrees: 22.5,
            snap_turn_repeat: 0.5,
            hmd_roll_control: true,
            hmd_roll_dead_zone: 8.0,
            hmd_roll_rate: 114.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scripted motor
// ────────────────────────────────────────────────────────────────────────────

/// Frame a scripted motor velocity is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotorFrame {
    #[default]
    Camera,
    Avatar,
    World,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScriptedMotor {
    pub velocity: Vec3,
    pub timescale: f32,
    pub frame: MotorFrame,
}

impl ScriptedMotor {
    pub fn new(velocity: Vec3, timescale: f32, frame: MotorFrame) -> Self {
        Self { velocity, timescale, frame }
    }

    /// A motor at or above the controller's maximum timescale is inert.
    pub fn is_pushing(&self) -> bool {
        self.timescale < MAX_CHARACTER_MOTOR_TIMESCALE
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs and outputs
// ────────────────────────────────────────────────────────────────────────────

/// Per-tick context for [`MotionIntegrator::update`].
#[derive(Debug, Clone, Copy)]
pub struct MotionInputs {
    pub drive: DriveKeys,
    pub state: CharacterState,
    pub collisionless: bool,
    /// Avatar world orientation.
    pub orientation: Quat,
    /// World-space camera orientation (head, or the avatar in desktop mode).
    pub camera: Quat,
    /// World-space avatar velocity from the last step.
    pub velocity: Vec3,
    /// HMD rotation in sensor space, when tracked.
    pub hmd_rotation: Option<Quat>,
    /// Sensor-to-world scale.
    pub scale: f32,
    /// Controller's collision brake attenuation in `(0, 1]`.
    pub collision_brake: f32,
}

impl MotionInputs {
    pub fn new(state: CharacterState) -> Self {
        Self {
            drive: DriveKeys::default(),
            state,
            collisionless: false,
            orientation: Quat::IDENTITY,
            camera: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            hmd_rotation: None,
            scale: 1.0,
            collision_brake: 1.0,
        }
    }

    fn is_flying(&self) -> bool {
        self.state == CharacterState::Hover || self.collisionless
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionOutput {
    /// Rotation about up to apply to the avatar orientation this tick.
    pub yaw: Quat,
    pub motors: Vec<CharacterMotor>,
    /// One-frame linear acceleration.
    pub thrust: Vec3,
}

// ────────────────────────────────────────────────────────────────────────────
// MotionIntegrator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MotionIntegrator {
    config: MotionConfig,
    /// Smoothed smooth-turn rate (deg/s).
    body_yaw_delta: f32,
    snap_repeat_timer: f32,
    /// Local-frame action motor velocity.
    action_motor_velocity: Vec3,
    is_pushing: bool,
    is_being_pushed: bool,
    scripted_motor: Option<ScriptedMotor>,
    thrust: Vec3,
}

impl Default for MotionIntegrator {
    fn default() -> Self {
        Self::new(MotionConfig::default())
    }
}

impl MotionIntegrator {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            body_yaw_delta: 0.0,
            snap_repeat_timer: 0.0,
            action_motor_velocity: Vec3::ZERO,
            is_pushing: false,
            is_being_pushed: false,
            scripted_motor: None,
            thrust: Vec3::ZERO,
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn action_motor_velocity(&self) -> Vec3 {
        self.action_motor_velocity
    }

    /// `true` while the drive keys request movement.
    pub fn is_pushing(&self) -> bool {
        self.is_pushing
    }

    /// `true` while a scripted motor or thrust moves the avatar.
    pub fn is_being_pushed(&self) -> bool {
        self.is_being_pushed
    }

    pub fn body_yaw_rate(&self) -> f32 {
        self.body_yaw_delta
    }

    pub fn set_scripted_motor(&mut self, motor: Option<ScriptedMotor>) {
        self.scripted_motor = motor;
    }

    pub fn scripted_motor(&self) -> Option<ScriptedMotor> {
        self.scripted_motor
    }

    /// Accumulate thrust for the next tick only.
    pub fn add_thrust(&mut self, thrust: Vec3) {
        self.thrust += thrust;
    }

    /// Run one tick: orientation first, then the motors.
    pub fn update(&mut self, inputs: &MotionInputs, dt: f32) -> MotionOutput {
        let yaw_degrees = self.update_orientation(inputs, dt);
        self.update_action_motor(inputs, dt);
        let motors = self.motors(inputs);
        let thrust = std::mem::take(&mut self.thrust);
        MotionOutput {
            yaw: Quat::from_rotation_y(yaw_degrees.to_radians()),
            motors,
            thrust,
        }
    }

    // ── orientation ────────────────────────────────────────────────────────

    /// Total yaw (degrees, left positive) to apply this tick.
    pub fn update_orientation(&mut self, inputs: &MotionInputs, dt: f32) -> f32 {
        let drive = &inputs.drive;
        let mut total = 0.0;

        match self.config.turn_mode {
            TurnMode::Smooth => {
                let target_rate = drive.yaw * self.config.yaw_speed;
                if target_rate != 0.0 {
                    let blend = (dt / ROTATION_RAMP_TIMESCALE).min(1.0);
                    self.body_yaw_delta = (1.0 - blend) * self.body_yaw_delta + blend * target_rate;
                } else if self.body_yaw_delta != 0.0 {
                    let attenuation = (1.0 - dt / ROTATION_DECAY_TIMESCALE).max(0.0);
                    self.body_yaw_delta *= attenuation;
                    if self.body_yaw_delta.abs() < MIN_ROTATION_RATE {
                        self.body_yaw_delta = 0.0;
                    }
                }
                total += self.body_yaw_delta * dt;
            }
            TurnMode::Snap => {
                self.body_yaw_delta = 0.0;
                if drive.step_yaw != 0.0 {
                    total += drive.step_yaw.signum() * self.config.snap_turn_degrees;
                } else if drive.yaw != 0.0 {
                    if self.snap_repeat_timer <= 0.0 {
                        total += drive.yaw.signum() * self.config.snap_turn_degrees;
                        self.snap_repeat_timer = self.config.snap_turn_repeat;
                    }
                    self.snap_repeat_timer -= dt;
                } else {
                    self.snap_repeat_timer = 0.0;
                }
            }
        }

        total += drive.delta_yaw * self.config.yaw_speed / DEFAULT_YAW_SPEED;
        total += self.hmd_roll_yaw(inputs, dt);
        total
    }

    /// Yaw from head roll while hovering and moving fast enough.
    fn hmd_roll_yaw(&self, inputs: &MotionInputs, dt: f32) -> f32 {
        if !self.config.hmd_mode || !self.config.hmd_roll_control {
            return 0.0;
        }
        if inputs.state != CharacterState::Hover || !inputs.drive.has_drive_input() {
            return 0.0;
        }
        let Some(hmd) = inputs.hmd_rotation else {
            return 0.0;
        };
        let forward_speed = (inputs.orientation * Vec3::NEG_Z).dot(inputs.velocity);
        if forward_speed.abs() < MIN_ROLL_CONTROL_SPEED * inputs.scale {
            return 0.0;
        }
        let direction = forward_speed.signum();
        let roll = Vec3::Y.dot(hmd * Vec3::X).clamp(-1.0, 1.0).asin().to_degrees();
        let dead_zone = self.config.hmd_roll_dead_zone;
        if roll.abs() <= dead_zone {
            return 0.0;
        }
        let t = (roll.abs().clamp(dead_zone, MAX_ROLL_ANGLE) - dead_zone) / (MAX_ROLL_ANGLE - dead_zone);
        // right side down turns right
        roll.signum() * direction * self.config.hmd_roll_rate * dt * t
    }

    // ── speed ──────────────────────────────────────────────────────────────

    /// Quantise a stick value to one of the configured gears.
    pub fn geared_speed(&self, drive_key: f32) -> f32 {
        let magnitude = drive_key.abs();
        let gear = self.config.gears.iter().rposition(|threshold| magnitude > *threshold);
        let speed = gear.map_or(0.0, |index| GEAR_SPEEDS[index]);
        speed.copysign(drive_key)
    }

    fn walk_or_sprint(&self, sprint: bool) -> f32 {
        if sprint { self.config.sprint_speed } else { self.config.walk_speed }
    }

    /// Local-frame velocity requested by the sticks, before the flying
    /// curve. Forward is −Z.
    pub fn scaled_direction(&self, inputs: &MotionInputs) -> Vec3 {
        let drive = &inputs.drive;
        let (x, z) = (drive.translate_x, drive.translate_z);
        let forward = Vec3::NEG_Z;
        let right = Vec3::X;
        let scalar = self.config.walk_speed_scalar;

        let mut direction = if x == 0.0 && z == 0.0 {
            Vec3::ZERO
        } else if !self.config.hmd_mode {
            (z * forward + x * right).normalize_or_zero() * self.walk_or_sprint(drive.sprint) * scalar
        } else {
            match self.config.control_scheme {
                ControlScheme::Default => {
                    (z * forward + x * right).normalize_or_zero() * inputs.scale * self.config.sprint_speed * scalar
                }
                ControlScheme::Analog => {
                    let axis = |value: f32| {
                        inputs.scale * self.geared_speed(value) * scalar * self.walk_or_sprint(value.abs() >= STICK_FULL_ON || drive.sprint)
                    };
                    axis(z) * forward + axis(x) * right
                }
            }
        };

        if inputs.is_flying() {
            direction += drive.translate_y * Vec3::Y;
        }
        direction
    }

    // ── motors ─────────────────────────────────────────────────────────────

    /// Recompute the action motor velocity for this tick.
    pub fn update_action_motor(&mut self, inputs: &MotionInputs, dt: f32) {
        let thrust_pushing = self.thrust.length_squared() > PUSH_EPSILON;
        let scripted_pushing = self.scripted_motor.is_some_and(|m| m.is_pushing());
        self.is_being_pushed = thrust_pushing || scripted_pushing;

        let direction = self.scaled_direction(inputs);
        let length = direction.length();
        let was_pushing = self.is_pushing;
        self.is_pushing = length > PUSH_EPSILON;
        if was_pushing != self.is_pushing {
            debug!(pushing = self.is_pushing, "action motor input changed");
        }

        if !inputs.is_flying() {
            self.action_motor_velocity = direction;
            return;
        }

        if !self.is_pushing {
            self.action_motor_velocity = Vec3::ZERO;
            return;
        }

        let scale = inputs.scale;
        let scalar = self.config.walk_speed_scalar;
        let max_speed = scale * self.config.max_flying_speed * scalar * inputs.collision_brake.clamp(0.0, 1.0);
        let max_boost_speed = scale * 0.5 * self.config.walk_speed;

        let mut speed = self.action_motor_velocity.length();
        speed *= 1.0 + (dt / SPEED_GROWTH_TIMESCALE).clamp(0.0, 1.0) * SPEED_INCREASE_FACTOR * scalar;
        if speed < max_boost_speed {
            let boost = (max_boost_speed - speed) / max_boost_speed;
            speed += scale * MIN_AVATAR_SPEED * boost;
        }
        speed = speed.min(max_speed);
        self.action_motor_velocity = speed * (direction / length);
    }

    /// `(horizontal, vertical)` timescales for the action motor.
    pub fn motor_timescales(&self, inputs: &MotionInputs) -> (f32, f32) {
        if inputs.is_flying() {
            (FLYING_MOTOR_TIMESCALE, FLYING_MOTOR_TIMESCALE)
        } else {
            (WALKING_MOTOR_TIMESCALE * inputs.scale, INVALID_MOTOR_TIMESCALE)
        }
    }

    /// Action motor followed by the scripted motor, if any.
    pub fn motors(&self, inputs: &MotionInputs) -> Vec<CharacterMotor> {
        let mut motors = Vec::with_capacity(2);

        let rotation = if inputs.is_flying() {
            inputs.camera
        } else {
            cancel_out_roll_and_pitch(inputs.camera)
        };
        let (horizontal, vertical) = self.motor_timescales(inputs);
        if self.is_pushing || !self.is_being_pushed {
            motors.push(CharacterMotor::new(self.action_motor_velocity, rotation, horizontal, vertical));
        } else {
            // let the scripted motor or thrust move the avatar unopposed
            motors.push(CharacterMotor::new(
                self.action_motor_velocity,
                rotation,
                INVALID_MOTOR_TIMESCALE,
                INVALID_MOTOR_TIMESCALE,
            ));
        }

        if let Some(scripted) = self.scripted_motor {
            let rotation = match scripted.frame {
                MotorFrame::Camera => inputs.camera,
                MotorFrame::Avatar => inputs.orientation,
                MotorFrame::World => Quat::IDENTITY,
            };
            motors.push(CharacterMotor::new(scripted.velocity, rotation, scripted.timescale, scripted.timescale));
        }
        motors
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 90.0;

    fn desktop() -> MotionIntegrator {
        MotionIntegrator::new(MotionConfig {
            hmd_mode: false,
            ..MotionConfig::default()
        })
    }

    fn driving(state: CharacterState, drive: DriveKeys) -> MotionInputs {
        MotionInputs {
            drive,
            ..MotionInputs::new(state)
        }
    }

    fn forward(amount: f32) -> DriveKeys {
        DriveKeys {
            translate_z: amount,
            ..DriveKeys::default()
        }
    }

    // ---- gears and speeds -------------------------------------------------

    #[test]
    fn gears_quantise_stick_values() {
        let motion = MotionIntegrator::default();
        assert_eq!(motion.geared_speed(0.1), 0.0);
        assert_eq!(motion.geared_speed(0.3), 0.2);
        assert_eq!(motion.geared_speed(-0.5), -0.4);
        assert_eq!(motion.geared_speed(0.7), 0.6);
        assert_eq!(motion.geared_speed(0.85), 0.8);
        assert_eq!(motion.geared_speed(1.0), 1.0);
    }

    #[test]
    fn desktop_walks_at_walk_speed_and_sprints() {
        let mut motion = desktop();
        let out = motion.update(&driving(CharacterState::Ground, forward(0.3)), DT);
        assert!((out.motors[0].velocity - Vec3::new(0.0, 0.0, -2.6)).length() < 1e-5);

        let sprint = DriveKeys {
            sprint: true,
            ..forward(1.0)
        };
        let out = motion.update(&driving(CharacterState::Ground, sprint), DT);
        assert!((out.motors[0].velocity.length() - 3.4).abs() < 1e-5);
    }

    #[test]
    fn diagonal_input_is_normalised() {
        let mut motion = desktop();
        let drive = DriveKeys {
            translate_x: 1.0,
            translate_z: 1.0,
            ..DriveKeys::default()
        };
        let out = motion.update(&driving(CharacterState::Ground, drive), DT);
        assert!((out.motors[0].velocity.length() - 2.6).abs() < 1e-5);
        assert!(out.motors[0].velocity.x > 0.0);
    }

    #[test]
    fn analog_scheme_uses_gears_and_full_stick_sprints() {
        let mut motion = MotionIntegrator::new(MotionConfig {
            control_scheme: ControlScheme::Analog,
            ..MotionConfig::default()
        });
        let out = motion.update(&driving(CharacterState::Ground, forward(0.5)), DT);
        assert!((out.motors[0].velocity.z + 0.4 * 2.6).abs() < 1e-5);
        let out = motion.update(&driving(CharacterState::Ground, forward(1.0)), DT);
        assert!((out.motors[0].velocity.z + 3.4).abs() < 1e-5);
    }

    #[test]
    fn hmd_speed_scales_with_sensor_scale() {
        let mut motion = MotionIntegrator::default();
        let inputs = MotionInputs {
            scale: 2.0,
            ..driving(CharacterState::Ground, forward(1.0))
        };
        let out = motion.update(&inputs, DT);
        assert!((out.motors[0].velocity.length() - 6.8).abs() < 1e-4);
    }

    #[test]
    fn vertical_input_only_while_flying() {
        let motion = desktop();
        let up = DriveKeys {
            translate_y: 1.0,
            ..DriveKeys::default()
        };
        assert_eq!(motion.scaled_direction(&driving(CharacterState::Ground, up)), Vec3::ZERO);
        assert_eq!(motion.scaled_direction(&driving(CharacterState::Hover, up)), Vec3::Y);
    }

    // ---- flying curve -----------------------------------------------------

    #[test]
    fn flying_boosts_from_rest_and_grows() {
        let mut motion = desktop();
        let inputs = driving(CharacterState::Hover, forward(1.0));
        motion.update(&inputs, DT);
        let first = motion.action_motor_velocity().length();
        assert!((first - MIN_AVATAR_SPEED).abs() < 1e-5, "{first}");
        for _ in 0..90 {
            motion.update(&inputs, DT);
        }
        assert!(motion.action_motor_velocity().length() > first);
    }

    #[test]
    fn flying_speed_is_capped_and_braked() {
        let mut motion = desktop();
        let mut inputs = driving(CharacterState::Hover, forward(1.0));
        for _ in 0..2000 {
            motion.update(&inputs, 0.1);
        }
        assert!((motion.action_motor_velocity().length() - 30.0).abs() < 1e-3);

        inputs.collision_brake = 0.25;
        motion.update(&inputs, 0.1);
        assert!((motion.action_motor_velocity().length() - 7.5).abs() < 1e-3);
    }

    #[test]
    fn releasing_input_stops_flying_motor() {
        let mut motion = desktop();
        motion.update(&driving(CharacterState::Hover, forward(1.0)), DT);
        motion.update(&driving(CharacterState::Hover, DriveKeys::default()), DT);
        assert_eq!(motion.action_motor_velocity(), Vec3::ZERO);
        assert!(!motion.is_pushing());
    }

    // ---- motors -----------------------------------------------------------

    #[test]
    fn timescales_depend_on_state() {
        let motion = MotionIntegrator::default();
        let walking = MotionInputs {
            scale: 2.0,
            ..MotionInputs::new(CharacterState::Ground)
        };
        assert_eq!(motion.motor_timescales(&walking), (0.4, INVALID_MOTOR_TIMESCALE));
        let collisionless = MotionInputs {
            collisionless: true,
            ..MotionInputs::new(CharacterState::Ground)
        };
        assert_eq!(motion.motor_timescales(&collisionless), (FLYING_MOTOR_TIMESCALE, FLYING_MOTOR_TIMESCALE));
    }

    #[test]
    fn walking_motor_ignores_camera_pitch() {
        let motion = MotionIntegrator::default();
        let camera = Quat::from_rotation_y(0.5) * Quat::from_rotation_x(-0.7);
        let inputs = MotionInputs {
            camera,
            ..MotionInputs::new(CharacterState::Ground)
        };
        let rotation = motion.motors(&inputs)[0].rotation;
        assert!(rotation.abs_diff_eq(Quat::from_rotation_y(0.5), 1e-4));
    }

    #[test]
    fn scripted_motor_disables_idle_action_motor() {
        let mut motion = desktop();
        motion.set_scripted_motor(Some(ScriptedMotor::new(Vec3::X, 0.5, MotorFrame::World)));
        let out = motion.update(&driving(CharacterState::Ground, DriveKeys::default()), DT);
        assert_eq!(out.motors.len(), 2);
        assert_eq!(out.motors[0].horizontal_timescale, INVALID_MOTOR_TIMESCALE);
        assert_eq!(out.motors[1].rotation, Quat::IDENTITY);
        assert!(motion.is_being_pushed());

        let out = motion.update(&driving(CharacterState::Ground, forward(1.0)), DT);
        assert!(out.motors[0].horizontal_timescale < 1.0, "pushing keeps the action motor");
    }

    #[test]
    fn inert_scripted_motor_is_not_pushing() {
        let motor = ScriptedMotor::new(Vec3::X, MAX_CHARACTER_MOTOR_TIMESCALE, MotorFrame::Avatar);
        assert!(!motor.is_pushing());
    }

    #[test]
    fn thrust_lasts_one_tick() {
        let mut motion = MotionIntegrator::default();
        motion.add_thrust(Vec3::new(0.0, 2.0, 0.0));
        let inputs = MotionInputs::new(CharacterState::Ground);
        assert_eq!(motion.update(&inputs, DT).thrust, Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(motion.update(&inputs, DT).thrust, Vec3::ZERO);
    }

    // ---- turning ----------------------------------------------------------

    #[test]
    fn smooth_yaw_ramps_then_decays() {
        let mut motion = MotionIntegrator::default();
        let turning = driving(
            CharacterState::Ground,
            DriveKeys {
                yaw: 1.0,
                ..DriveKeys::default()
            },
        );
        let first = motion.update_orientation(&turning, 0.1);
        assert!((first - 2.0).abs() < 1e-4, "{first}");
        for _ in 0..30 {
            motion.update_orientation(&turning, 0.1);
        }
        assert!((motion.body_yaw_rate() - 100.0).abs() < 1.0);

        let idle = driving(CharacterState::Ground, DriveKeys::default());
        motion.update_orientation(&idle, 0.1);
        assert_eq!(motion.body_yaw_rate(), 0.0);
    }

    #[test]
    fn snap_turn_steps_once_per_request() {
        let mut motion = MotionIntegrator::new(MotionConfig {
            turn_mode: TurnMode::Snap,
            ..MotionConfig::default()
        });
        let step = driving(
            CharacterState::Ground,
            DriveKeys {
                step_yaw: -1.0,
                ..DriveKeys::default()
            },
        );
        assert_eq!(motion.update_orientation(&step, DT), -22.5);
    }

    #[test]
    fn held_yaw_repeats_snap_turns() {
        let mut motion = MotionIntegrator::new(MotionConfig {
            turn_mode: TurnMode::Snap,
            ..MotionConfig::default()
        });
        let held = driving(
            CharacterState::Ground,
            DriveKeys {
                yaw: 1.0,
                ..DriveKeys::default()
            },
        );
        let total: f32 = (0..10).map(|_| motion.update_orientation(&held, 0.1)).sum();
        assert_eq!(total, 45.0, "turns at t=0 and t=0.5");
    }

    #[test]
    fn smooth_mode_ignores_step_yaw() {
        let mut motion = MotionIntegrator::default();
        let step = driving(
            CharacterState::Ground,
            DriveKeys {
                step_yaw: 1.0,
                ..DriveKeys::default()
            },
        );
        assert_eq!(motion.update_orientation(&step, DT), 0.0);
    }

    #[test]
    fn head_roll_turns_while_flying_forward() {
        let mut motion = MotionIntegrator::default();
        let rolled_right = Quat::from_rotation_z(-45f32.to_radians());
        let inputs = MotionInputs {
            hmd_rotation: Some(rolled_right),
            velocity: Vec3::new(0.0, 0.0, -5.0),
            ..driving(CharacterState::Hover, forward(1.0))
        };
        let yaw = motion.update_orientation(&inputs, 1.0);
        let expected = -114.0 * (45.0 - 8.0) / (90.0 - 8.0);
        assert!((yaw - expected).abs() < 0.5, "{yaw}");

        let slow = MotionInputs {
            velocity: Vec3::new(0.0, 0.0, -1.0),
            ..inputs
        };
        assert_eq!(motion.update_orientation(&slow, 1.0), 0.0);

        let small_roll = MotionInputs {
            hmd_rotation: Some(Quat::from_rotation_z(5f32.to_radians())),
            ..inputs
        };
        assert_eq!(motion.update_orientation(&small_roll, 1.0), 0.0);
    }
}
