//! Real-world sit/stand detection from head height.
//!
//! Two pieces cooperate:
//!
//! - [`StandingHeightMode`] keeps a histogram of recent head heights and
//!   reports its mode. The mode only ratchets upward unless a reset is
//!   requested (after a sit/stand change, a squat, or a spine stretch).
//! - [`SitStandTracker`] compares the current head height to a "tipping
//!   point" and flips between sitting and standing after the height has
//!   stayed past a threshold for long enough.

use std::collections::{HashMap, VecDeque};

use avatar_types::SensorPose;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const CENTIMETERS_PER_METER: f32 = 100.0;
const MODE_READINGS: usize = 50;
const MODE_CORRECTION: f32 = 0.02;
const AVERAGE_HEIGHT_RATE: f32 = 0.01;

// ────────────────────────────────────────────────────────────────────────────
// Standing height mode
// ────────────────────────────────────────────────────────────────────────────

/// Mode of recent head heights, quantised to whole centimetres.
#[derive(Debug, Clone)]
pub struct StandingHeightMode {
    readings: VecDeque<i32>,
    current: f32,
    reset_requested: bool,
}

impl StandingHeightMode {
    /// Start from a known standing head height (metres).
    pub fn new(initial: f32) -> Self {
        Self {
            readings: VecDeque::with_capacity(MODE_READINGS),
            current: initial,
            reset_requested: false,
        }
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    /// Allow the mode to drop to the next head reading.
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// Add a head reading and return the updated mode.
    pub fn update(&mut self, head: &SensorPose) -> f32 {
        if !head.is_valid() {
            return self.current;
        }
        let height = head.translation.y;
        if self.readings.len() == MODE_READINGS {
            self.readings.pop_front();
        }
        self.readings.push_back((height * CENTIMETERS_PER_METER).floor() as i32);

        let mut frequency: HashMap<i32, u32> = HashMap::new();
        let mut greatest = 0;
        let mut mode = 0;
        for &reading in &self.readings {
            let count = frequency.entry(reading).or_insert(0);
            *count += 1;
            if *count > greatest || (*count == greatest && reading > mode) {
                greatest = *count;
                mode = reading;
            }
        }

        let candidate = mode as f32 / CENTIMETERS_PER_METER;
        if candidate > self.current {
            self.current = candidate;
        } else if self.reset_requested {
            self.reset_requested = false;
            self.current = ((height - MODE_CORRECTION) * CENTIMETERS_PER_METER).floor() / CENTIMETERS_PER_METER;
            self.readings.clear();
            debug!(mode = self.current, "standing height mode reset");
        }
        self.current
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sit/stand tracker
// ────────────────────────────────────────────────────────────────────────────

/// Thresholds for [`SitStandTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SitStandConfig {
    /// Standing up requires the head above this multiple of the tipping point.
    pub standing_height_multiple: f32,
    /// Sitting down requires the head below this multiple of the tipping point.
    pub sitting_height_multiple: f32,
    /// Seconds the head must stay low before a sit is recognised.
    pub sitting_timeout: f32,
    /// Seconds the head must stay high before a stand is recognised.
    pub standing_timeout: f32,
    /// Average sitting heights above this (metres) are treated as standing.
    pub sitting_upper_bound: f32,
}

impl Default for SitStandConfig {
    fn default() -> Self {
        Self {
            standing_height_multiple: 1.2,
            sitting_height_multiple: 0.833,
            sitting_timeout: 4.0,
            standing_timeout: 0.3333,
            sitting_upper_bound: 1.52,
        }
    }
}

/// Outcome of one [`SitStandTracker::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SitStandUpdate {
    pub sitting: bool,
    /// A state was (re)asserted this tick. The vertical follow axis and the
    /// height mode both react to it.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct SitStandTracker {
    config: SitStandConfig,
    sitting: bool,
    tipping_point: f32,
    average_height: f32,
    timer: f32,
    user_height: f32,
    locked: bool,
}

impl SitStandTracker {
    /// `user_height` is the calibrated standing head height in sensor space.
    pub fn new(config: SitStandConfig, user_height: f32) -> Self {
        Self {
            config,
            sitting: false,
            tipping_point: user_height,
            average_height: user_height,
            timer: 0.0,
            user_height,
            locked: false,
        }
    }

    pub fn is_sitting(&self) -> bool {
        self.sitting
    }

    pub fn tipping_point(&self) -> f32 {
        self.tipping_point
    }

    pub fn average_height(&self) -> f32 {
        self.average_height
    }

    /// Freeze the current state; updates become no-ops.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Force a state, e.g. from a user preference.
    pub fn set_sitting(&mut self, sitting: bool) -> SitStandUpdate {
        self.assert_state(sitting)
    }

    pub fn set_user_height(&mut self, user_height: f32) {
        self.user_height = user_height;
    }

    /// Advance the tracker with this tick's head pose (sensor space).
    pub fn update(&mut self, head: &SensorPose, standing_mode: f32, dt: f32) -> SitStandUpdate {
        let unchanged = SitStandUpdate {
            sitting: self.sitting,
            changed: false,
        };
        if self.locked {
            return unchanged;
        }
        if !head.is_valid() {
            self.average_height = self.user_height;
            self.tipping_point = self.user_height;
            if self.sitting {
                return self.assert_state(false);
            }
            return unchanged;
        }

        let height = head.translation.y;
        self.average_height += (height - self.average_height) * AVERAGE_HEIGHT_RATE;
        let cfg = self.config;

        if self.sitting {
            if height > cfg.standing_height_multiple * self.tipping_point {
                self.timer += dt;
                if self.timer > cfg.standing_timeout {
                    self.average_height = height;
                    self.tipping_point = height;
                    return self.assert_state(false);
                }
            } else if height < cfg.sitting_height_multiple * self.tipping_point {
                // a real sit from a mislabelled sitting state
                self.timer += dt;
                if self.timer > cfg.sitting_timeout {
                    self.average_height = height;
                    self.tipping_point = height;
                    return self.assert_state(true);
                }
            } else if self.average_height > cfg.sitting_upper_bound {
                return self.assert_state(false);
            } else {
                self.tipping_point = self.average_height;
                self.timer = 0.0;
            }
        } else if height < cfg.sitting_height_multiple * self.tipping_point {
            self.timer += dt;
            if self.timer > cfg.sitting_timeout {
                self.average_height = height;
                self.tipping_point = height;
                return self.assert_state(true);
            }
        } else {
            self.tipping_point = standing_mode;
            self.timer = 0.0;
        }
        unchanged
    }

    fn assert_state(&mut self, sitting: bool) -> SitStandUpdate {
        if sitting != self.sitting {
            info!(sitting, tipping_point = self.tipping_point, "real-world posture changed");
        }
        self.sitting = sitting;
        self.timer = 0.0;
        SitStandUpdate { sitting, changed: true }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn head(y: f32) -> SensorPose {
        SensorPose::new(Vec3::new(0.0, y, 0.0), Quat::IDENTITY)
    }

    // ------------------------------------------------------------------ height mode

    #[test]
    fn mode_rises_with_taller_readings() {
        let mut mode = StandingHeightMode::new(1.5);
        for _ in 0..10 {
            mode.update(&head(1.655));
        }
        assert!((mode.current() - 1.65).abs() < 1e-4, "{}", mode.current());
    }

    #[test]
    fn mode_does_not_drop_without_reset() {
        let mut mode = StandingHeightMode::new(1.6);
        for _ in 0..60 {
            mode.update(&head(1.2));
        }
        assert!((mode.current() - 1.6).abs() < 1e-6);
    }

    #[test]
    fn mode_reset_drops_below_current_head() {
        let mut mode = StandingHeightMode::new(1.6);
        mode.request_reset();
        mode.update(&head(1.2));
        assert!(mode.current() < 1.2 && mode.current() > 1.16, "{}", mode.current());
        assert!(!mode.reset_requested());
    }

    #[test]
    fn mode_ignores_untracked_head() {
        let mut mode = StandingHeightMode::new(1.6);
        mode.update(&SensorPose::invalid());
        assert!((mode.current() - 1.6).abs() < 1e-6);
    }

    // ------------------------------------------------------------------ sit/stand

    #[test]
    fn sustained_low_head_sits_and_resets_tipping_point() {
        let mut tracker = SitStandTracker::new(SitStandConfig::default(), 1.7);
        let dt = 0.1;
        let mut fired = None;
        for i in 0..60 {
            let update = tracker.update(&head(1.1), 1.7, dt);
            if update.changed {
                fired = Some(i);
                break;
            }
        }
        let tick = fired.expect("sit transition must fire");
        assert!(tick as f32 * dt > 3.9, "must wait out the sitting timeout");
        assert!(tracker.is_sitting());
        assert!((tracker.tipping_point() - 1.1).abs() < 1e-6);
    }

    #[test]
    fn brief_dip_does_not_sit() {
        let mut tracker = SitStandTracker::new(SitStandConfig::default(), 1.7);
        for _ in 0..20 {
            tracker.update(&head(1.1), 1.7, 0.1);
        }
        tracker.update(&head(1.7), 1.7, 0.1);
        for _ in 0..20 {
            tracker.update(&head(1.1), 1.7, 0.1);
        }
        assert!(!tracker.is_sitting());
    }

    #[test]
    fn standing_up_from_sitting_is_quick() {
        let mut tracker = SitStandTracker::new(SitStandConfig::default(), 1.7);
        tracker.set_sitting(true);
        // tipping point follows the sitting average, around 1.7 here; drop it.
        for _ in 0..50 {
            tracker.update(&head(1.2), 1.7, 0.1);
        }
        let mut stood = false;
        for _ in 0..5 {
            if tracker.update(&head(1.7), 1.7, 0.1).changed {
                stood = true;
                break;
            }
        }
        assert!(stood);
        assert!(!tracker.is_sitting());
    }

    #[test]
    fn untracked_head_resets_to_standing() {
        let mut tracker = SitStandTracker::new(SitStandConfig::default(), 1.7);
        tracker.set_sitting(true);
        let update = tracker.update(&SensorPose::invalid(), 1.7, 0.1);
        assert!(update.changed);
        assert!(!update.sitting);
        assert!((tracker.tipping_point() - 1.7).abs() < 1e-6);
    }

    #[test]
    fn locked_tracker_ignores_input() {
        let mut tracker = SitStandTracker::new(SitStandConfig::default(), 1.7);
        tracker.set_locked(true);
        for _ in 0..100 {
            tracker.update(&head(1.0), 1.7, 0.1);
        }
        assert!(!tracker.is_sitting());
    }
}
