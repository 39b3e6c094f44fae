//! The locally controlled avatar.
//!
//! [`LocalAvatar`] owns every per-avatar layer and runs them in a fixed
//! order once per tick:
//!
//! 1. drain queued [`AvatarCommand`]s
//! 2. latch sensor poses and drive keys
//! 3. filter the head, track standing height and sit/stand posture
//! 4. estimate the body (CG model when usable, HMD model otherwise)
//! 5. apply a pending teleport or safe landing
//! 6. recenter the body ([`FollowHelper`]) and integrate motion
//! 7. push into the engine, step, harvest the pose back
//! 8. emit IK targets to the [`AnimationRig`] and hold targets to the bus
//!
//! The avatar is single-threaded. Other threads reach it only through an
//! [`AvatarHandle`], the [`HoldActions`] list and the [`EntityDataStore`].

use std::sync::Arc;

use avatar_middleware::{EventBus, Topic};
use avatar_perception::estimator::cg_ready;
use avatar_perception::transform::cancel_out_roll_and_pitch;
use avatar_perception::{
    BodyEstimator, EstimateSource, EstimatorFrames, HeadAverages, HipsEstimate, InputSystem, Pose, SensorFrame,
    SensorFrameTracker, SitStandTracker, StandingHeightMode,
};
use avatar_physics::{CharacterController, EntityQuery, PhysicsEngine};
use avatar_recenter::{FollowAxis, FollowHelper, FollowInputs, Posture};
use avatar_types::{Action, AvatarError, CharacterState, Event, EventPayload, IkFlag, IkTarget, RigFrame};
use glam::{Quat, Vec3};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::commands::{AvatarCommand, AvatarHandle, CommandQueue};
use crate::config::{AvatarConfig, MAX_AVATAR_SCALE, MIN_AVATAR_SCALE, SCALE_STEP};
use crate::joints::PinnedJoints;
use crate::motion::{MotionInputs, MotionIntegrator};
use crate::reconcile::{AvatarFrames, PhysicsReconciliation};
use crate::rig::AnimationRig;
use crate::shared::{EntityDataStore, HoldActions};

const EVENT_SOURCE: &str = "avatar-runtime::avatar";

/// Tracked joints forwarded to the rig as-is.
const TRACKED_TARGETS: [Action; 5] = [
    Action::Head,
    Action::LeftHand,
    Action::RightHand,
    Action::LeftFoot,
    Action::RightFoot,
];

/// Where the upper spine sits between hips and head when estimated.
const SPINE2_BLEND: f32 = 0.5;

/// Summary of one [`LocalAvatar::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub frame: u64,
    /// The engine stepped and a new pose was harvested.
    pub stepped: bool,
    pub state: CharacterState,
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub sitting: bool,
    pub estimate_source: EstimateSource,
    pub follow_active: bool,
    /// A teleport is waiting for the engine to become ready.
    pub teleport_pending: bool,
}

pub struct LocalAvatar<W: PhysicsEngine + EntityQuery> {
    id: Uuid,
    config: AvatarConfig,
    input: Arc<dyn InputSystem>,
    world: W,
    rig: Box<dyn AnimationRig>,
    bus: EventBus,
    commands: CommandQueue,

    tracker: SensorFrameTracker,
    head_averages: HeadAverages,
    standing_mode: StandingHeightMode,
    sit_stand: SitStandTracker,
    sit_stand_locked: bool,
    estimator: BodyEstimator,
    follow: FollowHelper,
    motion: MotionIntegrator,
    controller: CharacterController,
    reconcile: PhysicsReconciliation,
    frames: AvatarFrames,

    pinned: PinnedJoints,
    holds: HoldActions,
    entity_data: EntityDataStore,

    avatar_scale: f32,
    user_height: f32,
    cg_model: bool,
    velocity: Vec3,
    last_state: CharacterState,
    pending_teleport: Option<(Vec3, Option<Quat>)>,
    safe_landing_pending: bool,
    frame_count: u64,
}

impl<W: PhysicsEngine + EntityQuery> std::fmt::Debug for LocalAvatar<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAvatar")
            .field("id", &self.id)
            .field("position", &self.frames.position())
            .field("state", &self.controller.state())
            .field("scale", &self.avatar_scale)
            .field("frame", &self.frame_count)
            .finish()
    }
}

impl<W: PhysicsEngine + EntityQuery> LocalAvatar<W> {
    /// Build an avatar standing at `config.home_position`.
    ///
    /// Fails with [`AvatarError::InvalidConfig`] for a bad configuration and
    /// [`AvatarError::ShapeCreation`] when no collision shape can be built.
    pub fn new(
        config: AvatarConfig,
        input: Arc<dyn InputSystem>,
        world: W,
        rig: Box<dyn AnimationRig>,
        bus: EventBus,
    ) -> Result<Self, AvatarError> {
        config.validate()?;
        let scale = config.avatar_scale;
        let (corner, dimensions) = config.bounding_box(scale);
        let mut controller = CharacterController::from_bounding_box(config.controller, corner, dimensions)?;
        controller.set_flying_allowed(config.flying_allowed);

        let user_eye = config.user_eye_height();
        let estimator = BodyEstimator::new(config.rig, config.estimator);
        let body = estimator.derive_from_hmd(&SensorFrame::default(), user_eye, false).body;
        let position = config.home_position + Vec3::Y * (config.rig.hips.y * scale);
        let sensor_scale = scale * config.rig.eye_height() / user_eye;
        let frames = AvatarFrames::new(position, Quat::IDENTITY, body, sensor_scale);

        let id = Uuid::new_v4();
        info!(%id, ?position, scale, "local avatar created");
        Ok(Self {
            id,
            input,
            world,
            rig,
            bus,
            commands: CommandQueue::new(),
            tracker: SensorFrameTracker::new(),
            head_averages: HeadAverages::new(),
            standing_mode: StandingHeightMode::new(user_eye),
            sit_stand: SitStandTracker::new(config.sit_stand, user_eye),
            sit_stand_locked: false,
            estimator,
            follow: FollowHelper::new(config.follow, config.rig),
            motion: MotionIntegrator::new(config.motion),
            last_state: controller.state(),
            controller,
            reconcile: PhysicsReconciliation::new(),
            frames,
            pinned: PinnedJoints::new(),
            holds: HoldActions::new(),
            entity_data: EntityDataStore::new(),
            avatar_scale: scale,
            user_height: config.user_height,
            cg_model: config.cg_model,
            velocity: Vec3::ZERO,
            pending_teleport: None,
            safe_landing_pending: false,
            frame_count: 0,
            config,
        })
    }

    // ── accessors ──────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AvatarConfig {
        &self.config
    }

    /// Sender for commands from other threads.
    pub fn handle(&self) -> AvatarHandle {
        self.commands.handle()
    }

    pub fn hold_actions(&self) -> HoldActions {
        self.holds.clone()
    }

    pub fn entity_data(&self) -> EntityDataStore {
        self.entity_data.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn position(&self) -> Vec3 {
        self.frames.position()
    }

    pub fn orientation(&self) -> Quat {
        self.frames.orientation()
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn state(&self) -> CharacterState {
        self.controller.state()
    }

    pub fn scale(&self) -> f32 {
        self.avatar_scale
    }

    pub fn user_height(&self) -> f32 {
        self.user_height
    }

    pub fn is_sitting(&self) -> bool {
        self.sit_stand.is_sitting()
    }

    pub fn sensor_to_world(&self) -> Pose {
        self.frames.sensor_to_world()
    }

    pub fn controller(&self) -> &CharacterController {
        &self.controller
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn user_eye_height(&self) -> f32 {
        self.config.rig.user_eye_height(self.user_height)
    }

    fn sensor_scale(&self) -> f32 {
        self.avatar_scale * self.config.rig.eye_height() / self.user_eye_height()
    }

    fn publish(&self, topic: Topic, payload: EventPayload) {
        // no subscribers is not an error
        let _ = self.bus.publish_to(topic, Event::new(EVENT_SOURCE, payload));
    }

    fn zero_engine_velocity(&mut self) {
        if let Some(body) = self.world.character_mut() {
            body.linear_velocity = Vec3::ZERO;
            body.angular_velocity = Vec3::ZERO;
        }
    }

    // ── tick ───────────────────────────────────────────────────────────────

    /// Advance the avatar by `dt` seconds.
    pub fn update(&mut self, dt: f32) -> Result<TickReport, AvatarError> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(AvatarError::InvalidConfig {
                field: "dt".to_string(),
                details: format!("tick length must be positive and finite, got {dt}"),
            });
        }
        self.frame_count += 1;
        let span = info_span!("avatar_tick", frame = self.frame_count, avatar = %self.id, dt);
        let _enter = span.enter();

        // A failing command must not drop the ones queued behind it.
        let mut first_error = None;
        for command in self.commands.drain() {
            if let Err(e) = self.apply_command(command) {
                warn!(error = %e, "avatar command failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.tracker.latch(self.input.as_ref());
        let frame = self.tracker.frame().clone();
        let head = frame.pose(Action::Head);
        let user_eye = self.user_eye_height();

        // posture
        self.head_averages.update(&head, dt, self.follow.config().rotation_filter_length);
        let standing_mode = self.standing_mode.update(&head);
        let posture = self.sit_stand.update(&head, standing_mode, dt);
        if posture.changed {
            self.publish(Topic::Locomotion, EventPayload::SitStandChanged { sitting: posture.sitting });
        }

        // body estimate
        let estimate = self.estimate_body(&frame, posture.sitting);
        if estimate.squat_detected {
            debug!("squat detected; resetting standing height mode");
            self.standing_mode.request_reset();
        }

        // teleport and landing
        if self.safe_landing_pending {
            self.run_safe_landing();
        }
        if let Some((position, orientation)) = self.pending_teleport {
            if self.world.is_ready() {
                self.pending_teleport = None;
                self.apply_teleport(&frame, position, orientation);
            } else {
                debug!(?position, "teleport waiting for physics");
            }
        }

        self.hold_pinned_hips();

        // recentering
        let has_drive_input = frame.drive.has_drive_input();
        let requests = self.follow.pre_physics_update(&FollowInputs {
            frame: &frame,
            head_averages: &self.head_averages,
            desired_body: estimate.body,
            current_body: self.frames.body_sensor(),
            posture: Posture {
                sitting: posture.sitting,
                changed: posture.changed,
                locked: self.sit_stand_locked,
                standing_mode,
            },
            rig_units_per_meter: self.config.rig.eye_height() / user_eye,
            scale: self.frames.sensor_scale(),
            has_drive_input,
        });
        if requests.reset_height_mode {
            self.standing_mode.request_reset();
        }
        if requests.reset_head_facing {
            self.head_averages.reset(&head);
        }

        // motion
        let camera = frame
            .tracked(Action::Head)
            .map(|h| self.frames.world_from_sensor(&Pose::from_rotation_translation(h.rotation, h.translation)).rotation)
            .unwrap_or(self.frames.orientation());
        let inputs = MotionInputs {
            drive: frame.drive,
            state: self.controller.state(),
            collisionless: self.controller.is_collisionless(),
            orientation: self.frames.orientation(),
            camera,
            velocity: self.velocity,
            hmd_rotation: frame.tracked(Action::Head).map(|h| h.rotation),
            scale: self.frames.sensor_scale(),
            collision_brake: self.controller.collision_brake_attenuation(),
        };
        let motion = self.motion.update(&inputs, dt);
        self.frames.rotate(motion.yaw);

        // physics
        self.reconcile
            .pre_physics(&mut self.controller, &self.frames, &self.follow, &estimate.body, &motion);
        let mut stepped = false;
        if self.controller.pre_simulation(&mut self.world)? {
            self.world.step_simulation(dt, &mut self.controller);
            let reconciled =
                self.reconcile
                    .post_physics(&mut self.controller, &self.world, &mut self.frames, &mut self.follow);
            stepped = reconciled.stepped;
            if reconciled.stepped {
                self.velocity = reconciled.velocity;
            }
            if reconciled.safe_landing_requested {
                self.safe_landing_pending = true;
            }
        }

        self.hold_pinned_hips();

        if posture.changed {
            self.follow.deactivate(FollowAxis::Vertical);
            let body = self.estimator.derive_from_hmd(&frame, user_eye, true).body;
            let snapped = Pose::from_rotation_translation(self.frames.body_sensor().rotation, body.translation);
            self.snap_body_to(snapped);
        }

        let state = self.controller.state();
        if state != self.last_state {
            self.publish(
                Topic::Locomotion,
                EventPayload::StateChanged {
                    from: self.last_state,
                    to: state,
                },
            );
            self.last_state = state;
        }

        let rig_frame = self.build_rig_frame(&frame, &estimate, state);
        self.rig.submit(rig_frame);
        self.publish_hold_targets(&frame);

        Ok(TickReport {
            frame: self.frame_count,
            stepped,
            state,
            position: self.frames.position(),
            orientation: self.frames.orientation(),
            velocity: self.velocity,
            sitting: posture.sitting,
            estimate_source: estimate.source,
            follow_active: self.follow.is_any_active(),
            teleport_pending: self.pending_teleport.is_some(),
        })
    }

    fn estimate_body(&self, frame: &SensorFrame, sitting: bool) -> HipsEstimate {
        let use_cg = self.cg_model
            && self.controller.state() != CharacterState::Hover
            && !self.follow.is_walking()
            && !sitting
            && cg_ready(frame);
        if use_cg {
            self.estimator.derive_from_cg(
                frame,
                &EstimatorFrames {
                    sensor_to_world: self.frames.sensor_to_world(),
                    avatar_to_world: self.frames.avatar_to_world(),
                    avatar_scale: self.avatar_scale,
                    user_eye_height: self.user_eye_height(),
                },
            )
        } else {
            self.estimator.derive_from_hmd(frame, self.user_eye_height(), false)
        }
    }

    /// Replace the body pose in sensor space and move the avatar so the
    /// sensor frame stays where it is.
    fn snap_body_to(&mut self, body: Pose) {
        let world = self.frames.world_from_sensor(&body);
        self.frames.set_body_sensor(body);
        self.frames.set_world_pose(world.translation, world.rotation);
        self.controller
            .set_position_and_orientation(self.frames.position(), self.frames.orientation());
    }

    fn hold_pinned_hips(&mut self) {
        let Some(pin) = self.pinned.get(Action::Hips) else {
            return;
        };
        let orientation = cancel_out_roll_and_pitch(pin.rotation);
        self.frames.set_world_pose(pin.position, orientation);
        self.controller.set_position_and_orientation(pin.position, orientation);
        self.velocity = Vec3::ZERO;
        self.zero_engine_velocity();
    }

    fn apply_teleport(&mut self, frame: &SensorFrame, position: Vec3, orientation: Option<Quat>) {
        let orientation = orientation
            .map(cancel_out_roll_and_pitch)
            .unwrap_or(self.frames.orientation());
        self.follow.deactivate_all();
        self.follow.set_walking(false);

        let body = self.estimator.derive_from_hmd(frame, self.user_eye_height(), false).body;
        self.frames.set_body_sensor(body);
        self.frames.set_world_pose(position, orientation);
        self.controller.set_position_and_orientation(position, orientation);
        self.velocity = Vec3::ZERO;
        self.zero_engine_velocity();
        self.head_averages.reset(&frame.pose(Action::Head));
        self.safe_landing_pending = true;

        info!(?position, "avatar teleported");
        self.publish(Topic::Locomotion, EventPayload::Teleported { position });
    }

    /// Drop the avatar onto the first walkable surface under the top of its
    /// capsule.
    fn run_safe_landing(&mut self) {
        self.safe_landing_pending = false;
        let up = self.controller.up();
        let orientation = self.frames.orientation();
        let offset = orientation * self.controller.shape().local_offset();
        let full_half_height = self.controller.shape().full_half_height();
        let from = self.frames.position();
        let origin = from + offset + up * full_half_height;
        let reach = 2.0 * full_half_height + self.config.safe_landing_search * self.avatar_scale;

        let Some(hit) = self.world.find_ray_intersection(origin, -up, reach) else {
            warn!(?from, "no surface found for safe landing; keeping position");
            return;
        };
        if hit.normal.dot(up) < self.controller.config().min_floor_normal_dot_up {
            warn!(?from, normal = ?hit.normal, "safe landing surface too steep; keeping position");
            return;
        }

        let to = hit.point + up * full_half_height - offset;
        self.frames.set_world_pose(to, orientation);
        self.controller.set_position_and_orientation(to, orientation);
        self.velocity = Vec3::ZERO;
        self.zero_engine_velocity();
        info!(?from, ?to, "safe landing");
        self.publish(Topic::SystemAlerts, EventPayload::SafeLanding { from, to });
    }

    // ── commands ───────────────────────────────────────────────────────────

    fn apply_command(&mut self, command: AvatarCommand) -> Result<(), AvatarError> {
        debug!(?command, "applying avatar command");
        match command {
            AvatarCommand::GoToLocation { position, orientation } => {
                if position.is_finite() {
                    self.pending_teleport = Some((position, orientation));
                } else {
                    warn!(?position, "ignoring teleport to a non-finite position");
                }
            }
            AvatarCommand::GoHome => {
                let home = self.config.home_position + Vec3::Y * (self.config.rig.hips.y * self.avatar_scale);
                self.pending_teleport = Some((home, None));
            }
            AvatarCommand::IncreaseSize => self.set_avatar_scale(self.avatar_scale * SCALE_STEP)?,
            AvatarCommand::DecreaseSize => self.set_avatar_scale(self.avatar_scale / SCALE_STEP)?,
            AvatarCommand::ResetSize => self.set_avatar_scale(1.0)?,
            AvatarCommand::PinJoint { joint, position, rotation } => {
                if self.pinned.pin(joint, position, rotation) {
                    self.hold_pinned_hips();
                }
            }
            AvatarCommand::UnpinJoint(joint) => {
                self.pinned.unpin(joint);
            }
            AvatarCommand::SetFlyingAllowed(allowed) => self.controller.set_flying_allowed(allowed),
            AvatarCommand::SetFlying(flying) => self.controller.set_flying(flying),
            AvatarCommand::Jump => self.controller.jump(),
            AvatarCommand::SetCollisionless(collisionless) => self.controller.set_collisionless(collisionless),
            AvatarCommand::SetZoneAllowsCollisionless(allowed) => self.controller.set_zone_allows_collisionless(allowed),
            AvatarCommand::SetCollideWithOtherAvatars(collide) => self.controller.set_collide_with_other_avatars(collide),
            AvatarCommand::BeginSit { position, rotation } => {
                self.controller.begin_sit(position, rotation);
                self.frames.set_world_pose(position, rotation);
            }
            AvatarCommand::EndSit => self.controller.end_sit(),
            AvatarCommand::SetScriptedMotor(motor) => self.motion.set_scripted_motor(motor),
            AvatarCommand::AddThrust(thrust) => self.motion.add_thrust(thrust),
            AvatarCommand::SetGravity(gravity) => self.controller.set_gravity(gravity),
            AvatarCommand::SetUserHeight(height) => {
                if !height.is_finite() || height <= 0.0 {
                    warn!(height, "ignoring non-positive user height");
                    return Ok(());
                }
                self.user_height = height;
                let user_eye = self.user_eye_height();
                self.sit_stand.set_user_height(user_eye);
                self.standing_mode = StandingHeightMode::new(user_eye);
                self.frames.set_sensor_scale(self.sensor_scale());
                info!(height, "user height changed");
            }
            AvatarCommand::SetCgModel(enabled) => self.cg_model = enabled,
            AvatarCommand::LockSitStand(locked) => {
                self.sit_stand_locked = locked;
                self.sit_stand.set_locked(locked);
            }
            AvatarCommand::SetRig(rig) => {
                let mut config = self.config.clone();
                config.rig = rig;
                let (corner, dimensions) = config.bounding_box(self.avatar_scale);
                self.controller.set_dimensions(corner, dimensions)?;
                self.estimator = BodyEstimator::new(rig, config.estimator);
                self.follow = FollowHelper::new(config.follow, rig);
                self.config = config;
                self.frames.set_sensor_scale(self.sensor_scale());
                info!(height = rig.height, "avatar rig replaced");
            }
            AvatarCommand::SetEntityData { entity, data } => self.entity_data.set(entity, data),
            AvatarCommand::RemoveEntityData(entity) => {
                self.entity_data.remove(entity);
            }
        }
        Ok(())
    }

    /// Clamp, rebuild the collision shape and rescale the sensor frame.
    fn set_avatar_scale(&mut self, scale: f32) -> Result<(), AvatarError> {
        let scale = scale.clamp(MIN_AVATAR_SCALE, MAX_AVATAR_SCALE);
        if !scale.is_finite() {
            warn!("ignoring non-finite avatar scale");
            return Ok(());
        }
        let (corner, dimensions) = self.config.bounding_box(scale);
        self.controller.set_dimensions(corner, dimensions)?;
        self.avatar_scale = scale;
        self.frames.set_sensor_scale(self.sensor_scale());
        info!(scale, "avatar scale changed");
        Ok(())
    }

    // ── outputs ────────────────────────────────────────────────────────────

    /// IK targets in avatar space (avatar root at the origin, world metres).
    fn build_rig_frame(&self, frame: &SensorFrame, estimate: &HipsEstimate, state: CharacterState) -> RigFrame {
        let avatar_from_sensor = self.frames.avatar_from_sensor();
        let mut targets = Vec::with_capacity(Action::IK_JOINTS.len());

        let hips = match self.pinned.get(Action::Hips) {
            Some(pin) => {
                let local = self.frames.avatar_to_world().inverse()
                    * Pose::from_rotation_translation(pin.rotation, pin.position);
                IkTarget {
                    joint: Action::Hips,
                    translation: local.translation,
                    rotation: local.rotation,
                    flag: IkFlag::Enabled,
                }
            }
            None => {
                let local = avatar_from_sensor * estimate.hips;
                IkTarget {
                    joint: Action::Hips,
                    translation: local.translation,
                    rotation: local.rotation.normalize(),
                    flag: match estimate.source {
                        EstimateSource::Measured => IkFlag::Enabled,
                        EstimateSource::Estimated => IkFlag::Estimated,
                    },
                }
            }
        };
        targets.push(hips);

        for joint in TRACKED_TARGETS {
            let Some(pose) = frame.tracked(joint) else {
                continue;
            };
            let local = avatar_from_sensor.transform_sensor_pose(&pose);
            targets.push(IkTarget {
                joint,
                translation: local.translation,
                rotation: local.rotation,
                flag: IkFlag::Enabled,
            });
        }

        if let Some(head) = targets.iter().find(|t| t.joint == Action::Head).copied() {
            targets.push(IkTarget {
                joint: Action::Spine2,
                translation: hips.translation.lerp(head.translation, SPINE2_BLEND),
                rotation: hips.rotation.slerp(head.rotation, SPINE2_BLEND).normalize(),
                flag: IkFlag::Estimated,
            });
        }

        RigFrame { targets, state }
    }

    fn publish_hold_targets(&self, frame: &SensorFrame) {
        let Some(holds) = self.holds.try_snapshot() else {
            warn!("hold action list busy; skipping hold targets this frame");
            return;
        };
        for hold in holds {
            let Some(hand) = frame.tracked(hold.hand) else {
                continue;
            };
            let hand_world = self
                .frames
                .world_from_sensor(&Pose::from_rotation_translation(hand.rotation, hand.translation));
            let (position, rotation) = hold.target(hand_world.translation, hand_world.rotation, self.avatar_scale);
            self.publish(
                Topic::Locomotion,
                EventPayload::HoldTarget {
                    entity: hold.entity,
                    position,
                    rotation,
                },
            );
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
