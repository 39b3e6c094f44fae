//! Forward walkability scan ("ray shotgun").
//!
//! Two grids of ray origins are laid over the front of the character shape:
//! a torso grid above the division line (one max-step above the feet) and a
//! foot grid below it. Each origin is found once, at construction, by tracing
//! from outside the shape back onto its real surface.
//!
//! A scan rotates both grids to face the travel direction and casts every
//! origin forward. A torso ray that hits a surface steeper than the floor
//! threshold makes the path unwalkable outright. Otherwise the nearest foot
//! hit decides how far the step can go. Fractions are expressed along the
//! step itself, so the back slop can push them to zero or below when the
//! shape already overlaps something.

use glam::{Mat3, Quat, Vec3};

use crate::engine::CollisionWorld;
use crate::flags::CollisionGroup;
use crate::shape::CollisionShape;

const NUM_ROWS: usize = 5;
const NUM_COLUMNS: usize = 5;
/// Keeps grid origins off the very edge of the shape.
const GRID_SLOP: f32 = 0.02;
const BACK_SLOP: f32 = 0.04;
const FORWARD_SLOP_MARGIN: f32 = 0.10;
const STEEPEST_STEP_MARGIN: f32 = 0.04;
const MIN_STEP_LENGTH: f32 = 1.0e-5;

/// Outcome of one [`RayShotgun::test`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayShotgunResult {
    /// Soonest blocking point as a fraction of the step; `1.0` means clear.
    pub hit_fraction: f32,
    pub walkable: bool,
}

impl Default for RayShotgunResult {
    fn default() -> Self {
        Self {
            hit_fraction: 1.0,
            walkable: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RayShotgun {
    top_points: Vec<Vec3>,
    bottom_points: Vec<Vec3>,
    radius: f32,
    max_step_height: f32,
    min_floor_normal_dot_up: f32,
}

impl RayShotgun {
    /// Lay out both grids on `shape`.
    ///
    /// `max_step_height` is measured from the bottom of the shape;
    /// `min_floor_normal_dot_up` is the cosine of the steepest walkable
    /// slope.
    pub fn new(shape: &CollisionShape, max_step_height: f32, min_floor_normal_dot_up: f32) -> Self {
        let radius = shape.radius();
        let full_half_height = shape.full_half_height();
        let reach = 2.0 * radius;
        let division_line = -full_half_height + max_step_height;
        let step_x = 2.0 * (radius - GRID_SLOP) / (NUM_COLUMNS - 1) as f32;

        let trace_row = |y: f32, row: usize, out: &mut Vec<Vec3>| {
            // odd rows are staggered by half a column
            let (count, offset) = if row % 2 == 1 { (NUM_COLUMNS - 1, 0.5) } else { (NUM_COLUMNS, 0.0) };
            for j in 0..count {
                let x = -(radius - GRID_SLOP) + (j as f32 + offset) * step_x;
                let end = Vec3::new(x, y, 0.0);
                let start = end - Vec3::Z * reach;
                if let Some(fraction) = shape.ray_test(start, end) {
                    out.push(start + (end - start) * fraction);
                }
            }
        };

        let mut top_points = Vec::with_capacity(NUM_ROWS * NUM_COLUMNS);
        let top_height = full_half_height - division_line;
        let top_step_y = (top_height - GRID_SLOP) / (NUM_ROWS - 1) as f32;
        for i in 0..NUM_ROWS {
            trace_row(division_line + i as f32 * top_step_y, i, &mut top_points);
        }

        let mut bottom_points = Vec::with_capacity(NUM_ROWS * NUM_COLUMNS);
        let steepest_step_height = (radius + STEEPEST_STEP_MARGIN) * (1.0 - min_floor_normal_dot_up);
        let bottom_step_y = (max_step_height - GRID_SLOP - steepest_step_height) / (NUM_ROWS - 1) as f32;
        for i in 0..NUM_ROWS {
            trace_row(division_line - GRID_SLOP - i as f32 * bottom_step_y, i, &mut bottom_points);
        }

        Self {
            top_points,
            bottom_points,
            radius,
            max_step_height,
            min_floor_normal_dot_up,
        }
    }

    /// Torso ray origins in shape-local space, facing −Z.
    pub fn top_points(&self) -> &[Vec3] {
        &self.top_points
    }

    /// Foot ray origins in shape-local space, facing −Z.
    pub fn bottom_points(&self) -> &[Vec3] {
        &self.bottom_points
    }

    /// Scan ahead of a shape centered at `position` moving by `step`.
    ///
    /// Writes into `result` and returns `true` when something blocks the
    /// step (`hit_fraction < 1`). A step shorter than a few microns is not
    /// scanned. While `hovering`, feet are checked for steep surfaces just
    /// like the torso.
    #[allow(clippy::too_many_arguments)]
    pub fn test(
        &self,
        world: &dyn CollisionWorld,
        position: Vec3,
        step: Vec3,
        up: Vec3,
        hovering: bool,
        mask: CollisionGroup,
        result: &mut RayShotgunResult,
    ) -> bool {
        *result = RayShotgunResult::default();
        let up = up.normalize_or(Vec3::Y);
        let horizontal = step - up * step.dot(up);
        let step_length = horizontal.length();
        if step_length < MIN_STEP_LENGTH {
            return false;
        }
        let direction = horizontal / step_length;
        let rotation = facing_rotation(direction, up);

        let cos = self.min_floor_normal_dot_up;
        let sin = (1.0 - cos * cos).max(0.0).sqrt().max(1.0e-3);
        let forward_slop = ((self.max_step_height + self.radius / cos - self.radius) * (cos / sin) - (self.radius + step_length)
            + FORWARD_SLOP_MARGIN)
            .max(0.0);

        // torso: any steep hit makes the whole step unwalkable
        let full_length = BACK_SLOP + step_length + forward_slop;
        let full_ray = direction * full_length;
        let mut closest_top = 1.0_f32;
        for point in &self.top_points {
            let start = position + rotation * *point - direction * BACK_SLOP;
            if let Some(hit) = world.ray_test(start, start + full_ray, mask) {
                if hit.normal.dot(up) < cos {
                    result.walkable = false;
                    let fraction = (hit.fraction * full_length - BACK_SLOP) / step_length;
                    result.hit_fraction = result.hit_fraction.min(fraction.min(1.0));
                } else {
                    closest_top = closest_top.min(hit.fraction);
                }
            }
        }
        if hovering {
            for point in &self.bottom_points {
                let start = position + rotation * *point - direction * BACK_SLOP;
                if let Some(hit) = world.ray_test(start, start + full_ray, mask) {
                    if hit.normal.dot(up) < cos {
                        result.walkable = false;
                        let fraction = (hit.fraction * full_length - BACK_SLOP) / step_length;
                        result.hit_fraction = result.hit_fraction.min(fraction.min(1.0));
                    }
                }
            }
        }
        if !result.walkable {
            return result.hit_fraction < 1.0;
        }

        // walkable so far: the feet decide how far the step goes
        let foot_length = BACK_SLOP + step_length;
        let foot_ray = direction * foot_length;
        let mut closest_foot = 1.0_f32;
        for point in &self.bottom_points {
            let start = position + rotation * *point - direction * BACK_SLOP;
            if let Some(hit) = world.ray_test(start, start + foot_ray, mask) {
                closest_foot = closest_foot.min(hit.fraction);
            }
        }
        result.hit_fraction = if closest_foot < 1.0 {
            (closest_foot * foot_length - BACK_SLOP) / step_length
        } else if closest_top < 1.0 {
            ((closest_top * full_length - BACK_SLOP) / step_length).min(1.0)
        } else {
            1.0
        };
        result.hit_fraction < 1.0
    }
}

/// Rotation taking local −Z onto `direction` and +Y onto `up`.
fn facing_rotation(direction: Vec3, up: Vec3) -> Quat {
    let back = -direction;
    let right = up.cross(back).normalize_or(Vec3::X);
    Quat::from_mat3(&Mat3::from_cols(right, up, back)).normalize()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimWorld;

    const MIN_FLOOR_NORMAL_DOT_UP: f32 = 0.5;

    fn shape() -> CollisionShape {
        CollisionShape::capsule(0.25, 0.6275).expect("valid capsule")
    }

    fn shotgun(shape: &CollisionShape) -> RayShotgun {
        RayShotgun::new(shape, 0.65 * shape.full_half_height(), MIN_FLOOR_NORMAL_DOT_UP)
    }

    #[test]
    fn grid_origins_lie_on_the_front_surface() {
        let shape = shape();
        let gun = shotgun(&shape);
        assert!(gun.top_points().len() >= 10, "{}", gun.top_points().len());
        assert!(gun.bottom_points().len() >= 10, "{}", gun.bottom_points().len());
        for p in gun.top_points().iter().chain(gun.bottom_points()) {
            assert!(shape.signed_distance(*p).abs() < 1e-3, "{p} is off the surface");
            assert!(p.z < 0.0, "{p} is not on the front");
        }
        let division = -shape.full_half_height() + 0.65 * shape.full_half_height();
        assert!(gun.top_points().iter().all(|p| p.y >= division - 1e-5));
        assert!(gun.bottom_points().iter().all(|p| p.y < division));
    }

    #[test]
    fn facing_rotation_matches_yaw() {
        let dir = Vec3::new(1.0, 0.0, -1.0).normalize();
        let rot = facing_rotation(dir, Vec3::Y);
        let yaw = Quat::from_rotation_y((-dir.x).atan2(-dir.z));
        assert!(rot.dot(yaw).abs() > 0.9999);
        assert!((rot * Vec3::NEG_Z).abs_diff_eq(dir, 1e-5));
    }

    #[test]
    fn flat_floor_is_walkable_and_clear() {
        let shape = shape();
        let gun = shotgun(&shape);
        let world = SimWorld::new().with_floor(0.0);
        let position = Vec3::new(0.0, shape.full_half_height(), 0.0);
        let mut result = RayShotgunResult {
            hit_fraction: 0.3,
            walkable: false,
        };
        let hit = gun.test(&world, position, Vec3::new(0.0, 0.0, -0.05), Vec3::Y, false, CollisionGroup::MASK_ENVIRONMENT, &mut result);
        assert!(!hit);
        assert!(result.walkable);
        assert_eq!(result.hit_fraction, 1.0);
    }

    #[test]
    fn wall_within_step_is_not_walkable() {
        let shape = shape();
        let gun = shotgun(&shape);
        let wall_z = -0.4;
        let world = SimWorld::new()
            .with_floor(0.0)
            .with_plane(Vec3::Z, Vec3::new(0.0, 0.0, wall_z));
        let position = Vec3::new(0.0, shape.full_half_height(), 0.0);
        let step = 0.3;
        let mut result = RayShotgunResult::default();
        let hit = gun.test(&world, position, Vec3::new(0.0, 0.0, -step), Vec3::Y, false, CollisionGroup::MASK_ENVIRONMENT, &mut result);
        assert!(hit);
        assert!(!result.walkable);
        let front = gun.top_points().iter().map(|p| p.z).fold(f32::MAX, f32::min);
        let expected = (front - wall_z) / step;
        assert!((result.hit_fraction - expected).abs() < 1e-3, "got {} expected {}", result.hit_fraction, expected);
    }

    #[test]
    fn low_ledge_blocks_feet_but_stays_walkable() {
        let shape = shape();
        let gun = shotgun(&shape);
        let world = SimWorld::new()
            .with_floor(0.0)
            .with_box(Vec3::new(-2.0, 0.0, -3.0), Vec3::new(2.0, 0.25, -0.29));
        let position = Vec3::new(0.0, shape.full_half_height(), 0.0);
        let mut result = RayShotgunResult::default();
        let hit = gun.test(&world, position, Vec3::new(0.0, 0.0, -0.1), Vec3::Y, false, CollisionGroup::MASK_ENVIRONMENT, &mut result);
        assert!(hit);
        assert!(result.walkable, "a step below the division line can be climbed");
        assert!(result.hit_fraction < 1.0);
    }

    #[test]
    fn hovering_treats_a_ledge_as_a_wall() {
        let shape = shape();
        let gun = shotgun(&shape);
        let world = SimWorld::new().with_box(Vec3::new(-2.0, 0.0, -3.0), Vec3::new(2.0, 0.25, -0.29));
        let position = Vec3::new(0.0, shape.full_half_height(), 0.0);
        let mut result = RayShotgunResult::default();
        let hit = gun.test(&world, position, Vec3::new(0.0, 0.0, -0.1), Vec3::Y, true, CollisionGroup::MASK_ENVIRONMENT, &mut result);
        assert!(hit);
        assert!(!result.walkable);
    }

    #[test]
    fn tiny_step_is_not_scanned() {
        let shape = shape();
        let gun = shotgun(&shape);
        let world = SimWorld::new().with_plane(Vec3::Z, Vec3::new(0.0, 0.0, -0.3));
        let mut result = RayShotgunResult::default();
        assert!(!gun.test(&world, Vec3::ZERO, Vec3::new(0.0, 0.0, -1e-7), Vec3::Y, false, CollisionGroup::MASK_ENVIRONMENT, &mut result));
        assert_eq!(result, RayShotgunResult::default());
    }
}
