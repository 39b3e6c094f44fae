//! Latest-pose buffer between the input thread and the simulation tick.
//!
//! The input layer writes raw poses into a [`SharedInput`] from its own
//! polling thread. Once per tick the simulation thread calls
//! [`SensorFrameTracker::latch`], which copies the buffer with a
//! non-blocking try-lock. When the writer currently holds the lock the tick
//! keeps the previous frame instead of waiting.
//!
//! Poses that are flagged invalid or contain non-finite values never reach
//! the estimator: they are replaced by the last good value for that action
//! (or the identity pose) and marked untracked.
//!
//! # Example
//!
//! ```rust
//! use avatar_perception::sensor_frame::{SensorFrameTracker, SharedInput};
//! use avatar_types::{Action, SensorPose};
//! use glam::{Quat, Vec3};
//!
//! let input = SharedInput::new();
//! input.submit_pose(Action::Head, SensorPose::new(Vec3::new(0.0, 1.7, 0.0), Quat::IDENTITY));
//!
//! let mut tracker = SensorFrameTracker::new();
//! assert!(tracker.latch(&input));
//! assert!(tracker.frame().is_tracked(Action::Head));
//! assert!(!tracker.frame().is_tracked(Action::Hips));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use avatar_types::{Action, DriveKeys, SensorPose};
use glam::{Quat, Vec2};
use tracing::{debug, warn};

use crate::transform::{Pose, facing_dir_2d};

// ────────────────────────────────────────────────────────────────────────────
// Input boundary
// ────────────────────────────────────────────────────────────────────────────

/// Producer of tracked poses and drive keys.
///
/// Implementations are shared with an input-polling thread, so every read
/// from the simulation side must be non-blocking.
pub trait InputSystem: Send + Sync {
    /// Copy of the most recent raw poses, or `None` when the buffer is busy.
    fn try_poses(&self) -> Option<HashMap<Action, SensorPose>>;

    /// Most recent drive keys, or `None` when the buffer is busy.
    fn try_drive_keys(&self) -> Option<DriveKeys>;
}

#[derive(Default)]
struct InputBuffers {
    poses: Mutex<HashMap<Action, SensorPose>>,
    drive: Mutex<DriveKeys>,
}

/// Mutex-guarded pose/drive buffer. Clones share the same buffers.
#[derive(Clone, Default)]
pub struct SharedInput {
    inner: Arc<InputBuffers>,
}

impl SharedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest raw pose for `action`. Called from the input thread.
    pub fn submit_pose(&self, action: Action, pose: SensorPose) {
        let mut poses = self.inner.poses.lock().unwrap_or_else(PoisonError::into_inner);
        poses.insert(action, pose);
    }

    /// Forget `action` entirely (tracker switched off).
    pub fn clear_pose(&self, action: Action) {
        let mut poses = self.inner.poses.lock().unwrap_or_else(PoisonError::into_inner);
        poses.remove(&action);
    }

    pub fn set_drive_keys(&self, keys: DriveKeys) {
        let mut drive = self.inner.drive.lock().unwrap_or_else(PoisonError::into_inner);
        *drive = keys;
    }

    /// Hold the pose lock until the returned guard drops. Lets callers
    /// simulate a writer that is mid-update.
    pub fn hold_pose_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Action, SensorPose>> {
        self.inner.poses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InputSystem for SharedInput {
    fn try_poses(&self) -> Option<HashMap<Action, SensorPose>> {
        match self.inner.poses.try_lock() {
            Ok(guard) => Some(guard.clone()),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(e)) => {
                warn!("sensor pose buffer poisoned; skipping frame");
                drop(e);
                None
            }
        }
    }

    fn try_drive_keys(&self) -> Option<DriveKeys> {
        match self.inner.drive.try_lock() {
            Ok(guard) => Some(*guard),
            Err(_) => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Latched frame
// ────────────────────────────────────────────────────────────────────────────

/// Sanitised poses for one tick. Every action has an entry; untracked ones
/// carry `valid == false` and finite values.
#[derive(Debug, Clone, Default)]
pub struct SensorFrame {
    poses: HashMap<Action, SensorPose>,
    pub drive: DriveKeys,
}

impl SensorFrame {
    /// Pose for `action`; the untracked identity pose when absent.
    pub fn pose(&self, action: Action) -> SensorPose {
        self.poses.get(&action).copied().unwrap_or_default()
    }

    pub fn is_tracked(&self, action: Action) -> bool {
        self.poses.get(&action).is_some_and(|p| p.valid)
    }

    /// Pose for `action` only if it is tracked this frame.
    pub fn tracked(&self, action: Action) -> Option<SensorPose> {
        self.poses.get(&action).copied().filter(|p| p.valid)
    }

    /// Every pose re-expressed through `transform`.
    pub fn transformed(&self, transform: &Pose) -> SensorFrame {
        SensorFrame {
            poses: self
                .poses
                .iter()
                .map(|(action, pose)| (*action, transform.transform_sensor_pose(pose)))
                .collect(),
            drive: self.drive,
        }
    }

    /// Build a frame directly from already-sanitised poses.
    pub fn from_poses(poses: impl IntoIterator<Item = (Action, SensorPose)>) -> Self {
        Self {
            poses: poses.into_iter().collect(),
            drive: DriveKeys::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tracker
// ────────────────────────────────────────────────────────────────────────────

/// Holds the latest sanitised pose per tracked action.
#[derive(Debug, Default)]
pub struct SensorFrameTracker {
    frame: SensorFrame,
    last_good: HashMap<Action, SensorPose>,
    skipped_frames: u64,
    rejected_poses: u64,
}

impl SensorFrameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the input buffers into a fresh frame.
    ///
    /// Returns `false` (and keeps the previous frame) when the pose buffer
    /// is held by the writer.
    pub fn latch(&mut self, input: &dyn InputSystem) -> bool {
        let Some(raw) = input.try_poses() else {
            self.skipped_frames += 1;
            debug!(skipped = self.skipped_frames, "sensor buffer busy; reusing previous frame");
            return false;
        };

        let mut poses = HashMap::with_capacity(Action::ALL.len());
        for action in Action::ALL {
            let incoming = raw.get(&action).copied();
            let sanitised = match incoming {
                Some(pose) if pose.is_valid() => {
                    self.last_good.insert(action, pose);
                    pose
                }
                Some(pose) => {
                    if !pose.is_finite() {
                        self.rejected_poses += 1;
                        if self.frame.is_tracked(action) {
                            warn!(?action, "rejecting non-finite sensor pose");
                        }
                    }
                    self.untracked(action)
                }
                None => self.untracked(action),
            };
            poses.insert(action, sanitised);
        }
        self.frame.poses = poses;

        if let Some(keys) = input.try_drive_keys() {
            self.frame.drive = keys;
        }
        true
    }

    pub fn frame(&self) -> &SensorFrame {
        &self.frame
    }

    pub fn pose(&self, action: Action) -> SensorPose {
        self.frame.pose(action)
    }

    /// Ticks that reused the previous frame because the buffer was busy.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    /// Poses discarded for containing NaN or infinite values.
    pub fn rejected_poses(&self) -> u64 {
        self.rejected_poses
    }

    fn untracked(&self, action: Action) -> SensorPose {
        let base = self.last_good.get(&action).copied().unwrap_or_default();
        SensorPose {
            valid: false,
            velocity: glam::Vec3::ZERO,
            angular_velocity: glam::Vec3::ZERO,
            ..base
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Head averages
// ────────────────────────────────────────────────────────────────────────────

/// Low-pass filtered head facing and orientation in sensor space.
#[derive(Debug, Clone, Copy)]
pub struct HeadAverages {
    facing: Vec2,
    facing_average: Vec2,
    rotation_average: Quat,
}

impl HeadAverages {
    pub fn new() -> Self {
        Self {
            facing: Vec2::new(0.0, -1.0),
            facing_average: Vec2::new(0.0, -1.0),
            rotation_average: Quat::IDENTITY,
        }
    }

    /// Blend in this tick's head pose. `timescale` is the filter length in
    /// seconds; untracked heads leave the averages untouched.
    pub fn update(&mut self, head: &SensorPose, dt: f32, timescale: f32) {
        if !head.is_valid() {
            return;
        }
        let tau = if timescale > 0.0 { (dt / timescale).clamp(0.0, 1.0) } else { 1.0 };
        self.facing = facing_dir_2d(head.rotation);
        self.facing_average = self.facing_average.lerp(self.facing, tau).normalize_or(self.facing);

        let mut target = head.rotation;
        if self.rotation_average.dot(target) < 0.0 {
            target = -target;
        }
        self.rotation_average = self.rotation_average.slerp(target, tau).normalize();
    }

    /// Snap both averages to the given head pose.
    pub fn reset(&mut self, head: &SensorPose) {
        if head.is_valid() {
            self.facing = facing_dir_2d(head.rotation);
            self.facing_average = self.facing;
            self.rotation_average = head.rotation;
        }
    }

    /// Facing of the latest tracked head pose.
    pub fn facing(&self) -> Vec2 {
        self.facing
    }

    pub fn facing_average(&self) -> Vec2 {
        self.facing_average
    }

    pub fn rotation_average(&self) -> Quat {
        self.rotation_average
    }
}

impl Default for HeadAverages {
    fn default() -> Self {
        Self::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn head_at(y: f32) -> SensorPose {
        SensorPose::new(Vec3::new(0.0, y, 0.0), Quat::IDENTITY)
    }

    #[test]
    fn latch_copies_valid_poses() {
        let input = SharedInput::new();
        input.submit_pose(Action::Head, head_at(1.6));
        let mut tracker = SensorFrameTracker::new();
        assert!(tracker.latch(&input));
        let head = tracker.pose(Action::Head);
        assert!(head.valid);
        assert!((head.translation.y - 1.6).abs() < 1e-6);
    }

    #[test]
    fn nan_pose_is_replaced_by_last_good() {
        let input = SharedInput::new();
        input.submit_pose(Action::Head, head_at(1.6));
        let mut tracker = SensorFrameTracker::new();
        tracker.latch(&input);

        let mut bad = head_at(1.7);
        bad.translation.x = f32::NAN;
        input.submit_pose(Action::Head, bad);
        tracker.latch(&input);

        let head = tracker.pose(Action::Head);
        assert!(!head.valid, "NaN pose must be untracked");
        assert!(head.is_finite(), "NaN must never propagate");
        assert!((head.translation.y - 1.6).abs() < 1e-6, "last good value substituted");
        assert_eq!(tracker.rejected_poses(), 1);
    }

    #[test]
    fn never_seen_action_defaults_to_identity() {
        let input = SharedInput::new();
        let mut tracker = SensorFrameTracker::new();
        tracker.latch(&input);
        let hips = tracker.pose(Action::Hips);
        assert!(!hips.valid);
        assert_eq!(hips.translation, Vec3::ZERO);
        assert_eq!(hips.rotation, Quat::IDENTITY);
    }

    #[test]
    fn flagged_invalid_pose_is_untracked_without_counting_rejection() {
        let input = SharedInput::new();
        input.submit_pose(Action::LeftHand, SensorPose::invalid());
        let mut tracker = SensorFrameTracker::new();
        tracker.latch(&input);
        assert!(!tracker.frame().is_tracked(Action::LeftHand));
        assert_eq!(tracker.rejected_poses(), 0);
    }

    #[test]
    fn contended_buffer_skips_frame() {
        let input = SharedInput::new();
        input.submit_pose(Action::Head, head_at(1.5));
        let mut tracker = SensorFrameTracker::new();
        tracker.latch(&input);

        let guard = input.hold_pose_lock();
        assert!(!tracker.latch(&input), "latch must not block on a held lock");
        drop(guard);

        assert_eq!(tracker.skipped_frames(), 1);
        assert!(tracker.frame().is_tracked(Action::Head), "previous frame kept");
    }

    #[test]
    fn writer_on_other_thread_is_visible() {
        let input = SharedInput::new();
        let writer = input.clone();
        std::thread::spawn(move || {
            writer.submit_pose(Action::RightHand, SensorPose::new(Vec3::X, Quat::IDENTITY));
        })
        .join()
        .unwrap();
        let mut tracker = SensorFrameTracker::new();
        tracker.latch(&input);
        assert!(tracker.frame().is_tracked(Action::RightHand));
    }

    #[test]
    fn drive_keys_are_latched() {
        let input = SharedInput::new();
        input.set_drive_keys(DriveKeys {
            translate_z: 1.0,
            ..Default::default()
        });
        let mut tracker = SensorFrameTracker::new();
        tracker.latch(&input);
        assert_eq!(tracker.frame().drive.translate_z, 1.0);
    }

    #[test]
    fn transformed_frame_moves_every_pose() {
        let frame = SensorFrame::from_poses([(Action::Head, head_at(1.0))]);
        let shifted = frame.transformed(&Pose::new(1.0, Quat::IDENTITY, Vec3::new(0.0, 2.0, 0.0)));
        assert!((shifted.pose(Action::Head).translation.y - 3.0).abs() < 1e-6);
    }

    #[test]
    fn facing_average_converges_toward_head() {
        let mut avg = HeadAverages::new();
        let turned = SensorPose::new(Vec3::ZERO, Quat::from_rotation_y(std::f32::consts::FRAC_PI_2));
        for _ in 0..2000 {
            avg.update(&turned, 0.011, 4.0);
        }
        assert!(avg.facing_average().abs_diff_eq(Vec2::new(-1.0, 0.0), 1e-2), "{}", avg.facing_average());
        assert!(avg.rotation_average().dot(turned.rotation).abs() > 0.999);
    }

    #[test]
    fn facing_average_ignores_untracked_head() {
        let mut avg = HeadAverages::new();
        avg.update(&SensorPose::invalid(), 1.0, 4.0);
        assert!(avg.facing_average().abs_diff_eq(Vec2::new(0.0, -1.0), 1e-6));
    }
}
