//! Physics hand-off and sensor-frame bookkeeping.
//!
//! [`AvatarFrames`] holds the avatar's world pose, the body pose in sensor
//! space and the sensor-to-world transform derived from both.
//! [`PhysicsReconciliation`] pushes motors and the follow target into the
//! [`CharacterController`] before the engine steps, then harvests the new
//! world pose and folds the follow displacement back into the body.
//!
//! The invariant kept here: `sensor_to_world * body_sensor` is the avatar's
//! world pose at sensor scale. Driving the avatar moves the sensor frame
//! along with it; a follow displacement moves the body inside a sensor
//! frame that stays put.

use avatar_perception::Pose;
use avatar_physics::{CharacterController, PhysicsEngine};
use avatar_recenter::FollowHelper;
use glam::{Quat, Vec3};
use tracing::{debug, warn};

use crate::motion::MotionOutput;

// ────────────────────────────────────────────────────────────────────────────
// Frames
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvatarFrames {
    /// Avatar root (hips) in world space.
    position: Vec3,
    orientation: Quat,
    /// Unit-scale body pose in sensor space.
    body_sensor: Pose,
    /// Sensor-to-world scale (avatar scale times the eye-height ratio).
    sensor_scale: f32,
    sensor_to_world: Pose,
}

impl AvatarFrames {
    pub fn new(position: Vec3, orientation: Quat, body_sensor: Pose, sensor_scale: f32) -> Self {
        let mut frames = Self {
            position,
            orientation: orientation.normalize(),
            body_sensor: body_sensor.unit_scale(),
            sensor_scale,
            sensor_to_world: Pose::IDENTITY,
        };
        frames.rebuild_sensor_to_world();
        frames
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn body_sensor(&self) -> Pose {
        self.body_sensor
    }

    pub fn sensor_scale(&self) -> f32 {
        self.sensor_scale
    }

    pub fn sensor_to_world(&self) -> Pose {
        self.sensor_to_world
    }

    /// Unit-scale avatar-root pose.
    pub fn avatar_to_world(&self) -> Pose {
        Pose::from_rotation_translation(self.orientation, self.position)
    }

    /// Maps sensor space into avatar space (world metres, avatar root at
    /// the origin).
    pub fn avatar_from_sensor(&self) -> Pose {
        self.avatar_to_world().inverse() * self.sensor_to_world
    }

    /// World pose of a sensor-space pose, scale dropped.
    pub fn world_from_sensor(&self, pose: &Pose) -> Pose {
        (self.sensor_to_world * *pose).unit_scale()
    }

    pub fn set_world_pose(&mut self, position: Vec3, orientation: Quat) {
        self.position = position;
        self.orientation = orientation.normalize();
        self.rebuild_sensor_to_world();
    }

    pub fn set_body_sensor(&mut self, body: Pose) {
        self.body_sensor = body.unit_scale();
        self.rebuild_sensor_to_world();
    }

    pub fn set_sensor_scale(&mut self, scale: f32) {
        self.sensor_scale = scale;
        self.rebuild_sensor_to_world();
    }

    /// Apply a yaw about up to the avatar orientation.
    pub fn rotate(&mut self, yaw: Quat) {
        self.set_world_pose(self.position, yaw * self.orientation);
    }

    fn rebuild_sensor_to_world(&mut self) {
        let body_to_world = Pose::new(self.sensor_scale, self.orientation, self.position);
        self.sensor_to_world = body_to_world * self.body_sensor.inverse();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reconciliation
// ────────────────────────────────────────────────────────────────────────────

/// What the last post-physics harvest did.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reconciled {
    /// A new pose was read back from the engine.
    pub stepped: bool,
    /// The controller reported interpenetration; the pre-step pose was kept.
    pub safe_landing_requested: bool,
    pub velocity: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct PhysicsReconciliation {
    pre_step: Option<(Vec3, Quat)>,
}

impl PhysicsReconciliation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the avatar transform, motors, thrust and the follow target.
    pub fn pre_physics(
        &mut self,
        controller: &mut CharacterController,
        frames: &AvatarFrames,
        follow: &FollowHelper,
        desired_body: &Pose,
        motion: &MotionOutput,
    ) {
        controller.set_position_and_orientation(frames.position, frames.orientation);
        self.pre_step = Some((frames.position, frames.orientation));

        controller.clear_motors();
        for motor in &motion.motors {
            controller.add_motor(*motor);
        }
        controller.set_linear_acceleration(motion.thrust);

        if follow.is_any_active() {
            let desired_world = frames.sensor_to_world * *desired_body;
            let current_world = frames.sensor_to_world * frames.body_sensor;
            let target = follow.follow_world_pose(&desired_world, &current_world);
            controller.set_follow_parameters(target.translation, target.rotation, follow.max_time_remaining());
        } else {
            controller.set_follow_parameters(frames.position, frames.orientation, 0.0);
        }
    }

    /// Read the stepped pose back and fold the follow displacement into the
    /// sensor-space body.
    pub fn post_physics(
        &mut self,
        controller: &mut CharacterController,
        engine: &dyn PhysicsEngine,
        frames: &mut AvatarFrames,
        follow: &mut FollowHelper,
    ) -> Reconciled {
        let Some(motion) = controller.post_simulation(engine) else {
            return Reconciled::default();
        };
        let sensor_to_world = frames.sensor_to_world;

        if controller.needs_safe_landing() {
            controller.clear_safe_landing();
            let (position, orientation) = self.pre_step.unwrap_or((frames.position, frames.orientation));
            warn!(?position, "holding pre-step pose until a safe landing is found");
            controller.set_position_and_orientation(position, orientation);
            let body = follow.post_physics_update(
                controller.follow_substeps(),
                &frames.body_sensor,
                Vec3::ZERO,
                Quat::IDENTITY,
                &sensor_to_world,
            );
            controller.reset_follow_displacement();
            frames.body_sensor = body.unit_scale();
            frames.set_world_pose(position, orientation);
            return Reconciled {
                stepped: true,
                safe_landing_requested: true,
                velocity: Vec3::ZERO,
            };
        }

        // The rejected step is undone by the next pre-physics push, so its
        // displacement is dropped and the follow axes keep their time.
        if !motion.position.is_finite() || !motion.rotation.is_finite() {
            warn!("engine returned a non-finite pose; keeping the previous one");
            controller.reset_follow_displacement();
            return Reconciled::default();
        }

        let body = follow.post_physics_update(
            controller.follow_substeps(),
            &frames.body_sensor,
            controller.follow_linear_displacement(),
            controller.follow_angular_displacement(),
            &sensor_to_world,
        );
        controller.reset_follow_displacement();
        frames.position = motion.position;
        frames.orientation = motion.rotation.normalize();
        frames.body_sensor = body.unit_scale();
        frames.rebuild_sensor_to_world();
        debug!(position = ?frames.position, "physics pose harvested");

        Reconciled {
            stepped: true,
            safe_landing_requested: false,
            velocity: motion.velocity,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_perception::RigDefaults;
    use avatar_physics::{CharacterMotor, ControllerConfig, SimWorld};
    use avatar_recenter::{FollowAxis, FollowConfig};

    const DT: f32 = 1.0 / 90.0;

    fn controller() -> CharacterController {
        CharacterController::from_bounding_box(
            ControllerConfig::default(),
            Vec3::new(-0.25, -0.93, -0.25),
            Vec3::new(0.5, 1.755, 0.5),
        )
        .expect("valid shape")
    }

    fn idle() -> MotionOutput {
        MotionOutput {
            yaw: Quat::IDENTITY,
            motors: Vec::new(),
            thrust: Vec3::ZERO,
        }
    }

    fn tick(
        reconcile: &mut PhysicsReconciliation,
        ctrl: &mut CharacterController,
        world: &mut SimWorld,
        frames: &mut AvatarFrames,
        follow: &mut FollowHelper,
        desired: &Pose,
        motion: &MotionOutput,
    ) -> Reconciled {
        reconcile.pre_physics(ctrl, frames, follow, desired, motion);
        ctrl.pre_simulation(world).expect("pre simulation");
        world.step_simulation(DT, ctrl);
        reconcile.post_physics(ctrl, &*world, frames, follow)
    }

    // ---- frames -----------------------------------------------------------

    #[test]
    fn body_maps_onto_avatar_pose() {
        let body = Pose::from_rotation_translation(Quat::from_rotation_y(0.4), Vec3::new(0.2, 0.9, 0.1));
        let frames = AvatarFrames::new(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_y(1.0), body, 2.0);
        let world = frames.world_from_sensor(&body);
        assert!((world.translation - frames.position()).length() < 1e-5);
        assert!(world.rotation.abs_diff_eq(frames.orientation(), 1e-5));
        let avatar = frames.avatar_from_sensor() * body;
        assert!(avatar.translation.length() < 1e-5);
    }

    #[test]
    fn yaw_turns_the_sensor_frame_with_the_avatar() {
        let body = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.0, 0.93, 0.0));
        let mut frames = AvatarFrames::new(Vec3::ZERO, Quat::IDENTITY, body, 1.0);
        frames.rotate(Quat::from_rotation_y(0.5));
        assert!(frames.sensor_to_world().rotation.abs_diff_eq(Quat::from_rotation_y(0.5), 1e-5));
        assert_eq!(frames.body_sensor(), body);
    }

    // ---- reconciliation ---------------------------------------------------

    #[test]
    fn pre_physics_pushes_motors() {
        let mut ctrl = controller();
        let frames = AvatarFrames::new(Vec3::new(0.0, 0.93, 0.0), Quat::IDENTITY, Pose::IDENTITY, 1.0);
        let follow = FollowHelper::new(FollowConfig::default(), RigDefaults::default());
        let motion = MotionOutput {
            motors: vec![CharacterMotor::new(Vec3::NEG_Z, Quat::IDENTITY, 0.2, 1.0e6)],
            ..idle()
        };
        PhysicsReconciliation::new().pre_physics(&mut ctrl, &frames, &follow, &Pose::IDENTITY, &motion);
        assert_eq!(ctrl.motors().len(), 1);
    }

    #[test]
    fn walking_carries_the_sensor_frame() {
        let mut ctrl = controller();
        let mut world = SimWorld::new().with_floor(0.0);
        let body = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.0, 0.93, 0.0));
        let mut frames = AvatarFrames::new(Vec3::new(0.0, 0.93, 0.0), Quat::IDENTITY, body, 1.0);
        let mut follow = FollowHelper::new(FollowConfig::default(), RigDefaults::default());
        let mut reconcile = PhysicsReconciliation::new();
        let walk = MotionOutput {
            motors: vec![CharacterMotor::new(Vec3::new(0.0, 0.0, -2.0), Quat::IDENTITY, 0.2, 1.0e6)],
            ..idle()
        };
        for _ in 0..90 {
            tick(&mut reconcile, &mut ctrl, &mut world, &mut frames, &mut follow, &body, &walk);
        }
        assert!(frames.position().z < -1.0, "{}", frames.position());
        assert_eq!(frames.body_sensor(), body);
        let drift = frames.sensor_to_world().translation - frames.position();
        assert!((drift - Vec3::new(0.0, -0.93, 0.0)).length() < 0.05, "{drift}");
    }

    #[test]
    fn follow_moves_body_but_not_sensor_frame() {
        let mut ctrl = controller();
        let mut world = SimWorld::new().with_floor(0.0);
        let body = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.0, 0.93, 0.0));
        let desired = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.3, 0.93, 0.0));
        let mut frames = AvatarFrames::new(Vec3::new(0.0, 0.93, 0.0), Quat::IDENTITY, body, 1.0);
        let mut follow = FollowHelper::new(FollowConfig::default(), RigDefaults::default());
        let mut reconcile = PhysicsReconciliation::new();
        let sensor_origin = frames.sensor_to_world().translation;

        follow.activate(FollowAxis::Horizontal, false);
        for _ in 0..60 {
            tick(&mut reconcile, &mut ctrl, &mut world, &mut frames, &mut follow, &desired, &idle());
        }
        assert!(!follow.is_any_active());
        assert!((frames.body_sensor().translation.x - 0.3).abs() < 0.01, "{:?}", frames.body_sensor());
        assert!((frames.position().x - 0.3).abs() < 0.01);
        let moved = frames.sensor_to_world().translation - sensor_origin;
        assert!(Vec3::new(moved.x, 0.0, moved.z).length() < 0.01, "{moved}");
    }

    #[test]
    fn inactive_follow_leaves_body_alone() {
        let mut ctrl = controller();
        let mut world = SimWorld::new().with_floor(0.0);
        let body = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.0, 0.93, 0.0));
        let desired = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.5, 0.93, 0.0));
        let mut frames = AvatarFrames::new(Vec3::new(0.0, 0.93, 0.0), Quat::IDENTITY, body, 1.0);
        let mut follow = FollowHelper::new(FollowConfig::default(), RigDefaults::default());
        let mut reconcile = PhysicsReconciliation::new();
        for _ in 0..20 {
            tick(&mut reconcile, &mut ctrl, &mut world, &mut frames, &mut follow, &desired, &idle());
        }
        assert_eq!(frames.body_sensor(), body);
        assert!(frames.position().x.abs() < 1e-3);
    }

    #[test]
    fn nothing_harvested_before_the_body_exists() {
        let mut ctrl = controller();
        let mut world = SimWorld::new();
        world.set_ready(false);
        let mut frames = AvatarFrames::new(Vec3::ZERO, Quat::IDENTITY, Pose::IDENTITY, 1.0);
        let mut follow = FollowHelper::new(FollowConfig::default(), RigDefaults::default());
        let outcome = PhysicsReconciliation::new().post_physics(&mut ctrl, &world, &mut frames, &mut follow);
        assert!(!outcome.stepped);
    }

    #[test]
    fn non_finite_engine_pose_keeps_follow_time() {
        let mut ctrl = controller();
        let mut world = SimWorld::new().with_floor(0.0);
        let body = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.0, 0.93, 0.0));
        let desired = Pose::from_rotation_translation(Quat::IDENTITY, Vec3::new(0.3, 0.93, 0.0));
        let mut frames = AvatarFrames::new(Vec3::new(0.0, 0.93, 0.0), Quat::IDENTITY, body, 1.0);
        let mut follow = FollowHelper::new(FollowConfig::default(), RigDefaults::default());
        let mut reconcile = PhysicsReconciliation::new();
        follow.activate(FollowAxis::Horizontal, false);
        let full = follow.time_remaining(FollowAxis::Horizontal);

        reconcile.pre_physics(&mut ctrl, &frames, &follow, &desired, &idle());
        ctrl.pre_simulation(&mut world).expect("pre simulation");
        world.step_simulation(DT, &mut ctrl);
        assert!(ctrl.follow_linear_displacement().x > 0.0);
        if let Some(character) = world.character_mut() {
            character.position = Vec3::NAN;
        }

        let outcome = reconcile.post_physics(&mut ctrl, &world, &mut frames, &mut follow);
        assert!(!outcome.stepped);
        assert_eq!(frames.body_sensor(), body);
        assert_eq!(frames.position(), Vec3::new(0.0, 0.93, 0.0));
        assert_eq!(follow.time_remaining(FollowAxis::Horizontal), full);
        assert!(ctrl.follow_substeps().is_empty());

        for _ in 0..60 {
            tick(&mut reconcile, &mut ctrl, &mut world, &mut frames, &mut follow, &desired, &idle());
        }
        assert!(!follow.is_any_active());
        assert!((frames.body_sensor().translation.x - 0.3).abs() < 0.01, "{:?}", frames.body_sensor());
        let world_body = frames.world_from_sensor(&frames.body_sensor());
        assert!((world_body.translation - frames.position()).length() < 1e-3);
    }
}
