//! In-process physics world for headless runs and tests.
//!
//! [`SimWorld`] implements [`PhysicsEngine`] and [`EntityQuery`] over a
//! handful of infinite planes and axis-aligned boxes. The character is
//! treated as a capsule around its hull axis; contacts are resolved by
//! pushing it out along the deepest contact normal and removing the velocity
//! component into that normal. That is enough for the controller's state
//! machine, the ray shotgun and end-to-end reconciliation tests without a
//! real solver.
//!
//! # Example
//!
//! ```rust
//! use avatar_physics::engine::CollisionWorld;
//! use avatar_physics::flags::CollisionGroup;
//! use avatar_physics::sim::SimWorld;
//! use glam::Vec3;
//!
//! let world = SimWorld::new().with_floor(0.0);
//! let hit = world
//!     .ray_test(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, -2.0, 0.0), CollisionGroup::MASK_ENVIRONMENT)
//!     .expect("floor must be hit");
//! assert!((hit.fraction - 0.5).abs() < 1e-6);
//! assert_eq!(hit.normal, Vec3::Y);
//! ```

use avatar_types::AvatarError;
use glam::{Quat, Vec3};
use tracing::{debug, trace};

use crate::engine::{BodyState, CharacterAction, CollisionWorld, Contact, EntityHit, EntityQuery, PhysicsEngine, RayHit};
use crate::flags::CollisionGroup;
use crate::shape::CollisionShape;

/// Fixed substep length (90 Hz).
pub const DEFAULT_SUBSTEP: f32 = 1.0 / 90.0;
/// Substeps beyond this per call are dropped.
pub const DEFAULT_MAX_SUBSTEPS: u32 = 6;
/// Surfaces closer than this count as touching.
const CONTACT_SLOP: f32 = 0.005;
const RESOLUTION_ITERATIONS: usize = 4;
const CLOSEST_POINT_ITERATIONS: usize = 8;

// ────────────────────────────────────────────────────────────────────────────
// Geometry
// ────────────────────────────────────────────────────────────────────────────

/// Half-space `normal · x <= offset` (solid below the surface).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimPlane {
    pub normal: Vec3,
    pub offset: f32,
    pub group: CollisionGroup,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimBox {
    pub min: Vec3,
    pub max: Vec3,
    pub group: CollisionGroup,
}

/// Contact between the character capsule and one piece of geometry.
#[derive(Debug, Clone, Copy)]
struct Penetration {
    depth: f32,
    normal: Vec3,
    point: Vec3,
}

/// Static geometry of a [`SimWorld`]; also the [`CollisionWorld`] view the
/// character action sees during a substep.
#[derive(Debug, Clone, Default)]
pub struct SimGeometry {
    planes: Vec<SimPlane>,
    boxes: Vec<SimBox>,
}

impl SimGeometry {
    pub fn planes(&self) -> &[SimPlane] {
        &self.planes
    }

    pub fn boxes(&self) -> &[SimBox] {
        &self.boxes
    }

    fn ray_plane(plane: &SimPlane, from: Vec3, to: Vec3) -> Option<RayHit> {
        let delta = to - from;
        let denom = plane.normal.dot(delta);
        if denom >= 0.0 {
            return None;
        }
        let height = plane.normal.dot(from) - plane.offset;
        if height < 0.0 {
            return None;
        }
        let fraction = height / -denom;
        if fraction > 1.0 {
            return None;
        }
        Some(RayHit {
            fraction,
            point: from + delta * fraction,
            normal: plane.normal,
        })
    }

    fn ray_box(aabb: &SimBox, from: Vec3, to: Vec3) -> Option<RayHit> {
        let delta = to - from;
        let mut t_min = 0.0_f32;
        let mut t_max = 1.0_f32;
        let mut normal = Vec3::ZERO;
        for axis in 0..3 {
            if delta[axis].abs() < 1.0e-9 {
                if from[axis] < aabb.min[axis] || from[axis] > aabb.max[axis] {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / delta[axis];
            let t1 = (aabb.min[axis] - from[axis]) * inv;
            let t2 = (aabb.max[axis] - from[axis]) * inv;
            let (near, far) = if t1 < t2 { (t1, t2) } else { (t2, t1) };
            if near > t_min {
                t_min = near;
                let mut axis_normal = Vec3::ZERO;
                axis_normal[axis] = -delta[axis].signum();
                normal = axis_normal;
            }
            t_max = t_max.min(far);
            if t_min > t_max {
                return None;
            }
        }
        // a ray starting inside the box reports nothing
        if normal == Vec3::ZERO {
            return None;
        }
        Some(RayHit {
            fraction: t_min,
            point: from + delta * t_min,
            normal,
        })
    }

    fn capsule_plane(plane: &SimPlane, a: Vec3, b: Vec3, radius: f32) -> Option<Penetration> {
        let da = plane.normal.dot(a) - plane.offset;
        let db = plane.normal.dot(b) - plane.offset;
        let (end, distance) = if da < db { (a, da) } else { (b, db) };
        let gap = distance - radius;
        (gap < CONTACT_SLOP).then(|| Penetration {
            depth: -gap,
            normal: plane.normal,
            point: end - plane.normal * radius,
        })
    }

    fn capsule_box(aabb: &SimBox, a: Vec3, b: Vec3, radius: f32) -> Option<Penetration> {
        // alternate projections between the segment and the box
        let mut on_segment = (a + b) * 0.5;
        for _ in 0..CLOSEST_POINT_ITERATIONS {
            let on_box = on_segment.clamp(aabb.min, aabb.max);
            on_segment = closest_on_segment(a, b, on_box);
        }
        let on_box = on_segment.clamp(aabb.min, aabb.max);
        let delta = on_segment - on_box;
        let distance = delta.length();
        if distance > 1.0e-6 {
            let gap = distance - radius;
            return (gap < CONTACT_SLOP).then(|| Penetration {
                depth: -gap,
                normal: delta / distance,
                point: on_box,
            });
        }
        // the axis itself is inside: leave through the nearest face
        let mut best = (f32::MAX, Vec3::ZERO);
        for axis in 0..3 {
            let to_min = on_segment[axis] - aabb.min[axis];
            let to_max = aabb.max[axis] - on_segment[axis];
            if to_min < best.0 {
                let mut n = Vec3::ZERO;
                n[axis] = -1.0;
                best = (to_min, n);
            }
            if to_max < best.0 {
                let mut n = Vec3::ZERO;
                n[axis] = 1.0;
                best = (to_max, n);
            }
        }
        Some(Penetration {
            depth: best.0 + radius,
            normal: best.1,
            point: on_segment,
        })
    }

    fn capsule_contacts(&self, a: Vec3, b: Vec3, radius: f32, mask: CollisionGroup) -> Vec<Penetration> {
        let planes = self
            .planes
            .iter()
            .filter(|p| mask.intersects(p.group))
            .filter_map(|p| Self::capsule_plane(p, a, b, radius));
        let boxes = self
            .boxes
            .iter()
            .filter(|bx| mask.intersects(bx.group))
            .filter_map(|bx| Self::capsule_box(bx, a, b, radius));
        planes.chain(boxes).collect()
    }
}

impl CollisionWorld for SimGeometry {
    fn ray_test(&self, from: Vec3, to: Vec3, mask: CollisionGroup) -> Option<RayHit> {
        let planes = self
            .planes
            .iter()
            .filter(|p| mask.intersects(p.group))
            .filter_map(|p| Self::ray_plane(p, from, to));
        let boxes = self
            .boxes
            .iter()
            .filter(|bx| mask.intersects(bx.group))
            .filter_map(|bx| Self::ray_box(bx, from, to));
        planes.chain(boxes).min_by(|x, y| x.fraction.total_cmp(&y.fraction))
    }
}

fn closest_on_segment(a: Vec3, b: Vec3, point: Vec3) -> Vec3 {
    let ab = b - a;
    let length_squared = ab.length_squared();
    if length_squared < 1.0e-12 {
        return a;
    }
    let t = ((point - a).dot(ab) / length_squared).clamp(0.0, 1.0);
    a + ab * t
}

// ────────────────────────────────────────────────────────────────────────────
// SimWorld
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimCharacter {
    shape: CollisionShape,
    group: CollisionGroup,
    mask: CollisionGroup,
    body: BodyState,
}

/// Builder-style physics world with a single character body.
#[derive(Debug, Clone)]
pub struct SimWorld {
    geometry: SimGeometry,
    character: Option<SimCharacter>,
    ready: bool,
    substep: f32,
    max_substeps: u32,
    accumulator: f32,
    elapsed: f32,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWorld {
    /// An empty world that reports itself ready.
    pub fn new() -> Self {
        Self {
            geometry: SimGeometry::default(),
            character: None,
            ready: true,
            substep: DEFAULT_SUBSTEP,
            max_substeps: DEFAULT_MAX_SUBSTEPS,
            accumulator: 0.0,
            elapsed: 0.0,
        }
    }

    /// Horizontal static floor at `height`.
    pub fn with_floor(self, height: f32) -> Self {
        self.with_plane(Vec3::Y, Vec3::new(0.0, height, 0.0))
    }

    /// Static half-space through `point`, solid on the side opposite
    /// `normal`.
    pub fn with_plane(mut self, normal: Vec3, point: Vec3) -> Self {
        let normal = normal.normalize_or(Vec3::Y);
        self.geometry.planes.push(SimPlane {
            normal,
            offset: normal.dot(point),
            group: CollisionGroup::STATIC,
        });
        self
    }

    /// Static axis-aligned box.
    pub fn with_box(self, min: Vec3, max: Vec3) -> Self {
        self.with_grouped_box(min, max, CollisionGroup::STATIC)
    }

    pub fn with_grouped_box(mut self, min: Vec3, max: Vec3, group: CollisionGroup) -> Self {
        self.geometry.boxes.push(SimBox {
            min: min.min(max),
            max: min.max(max),
            group,
        });
        self
    }

    pub fn with_substep(mut self, substep: f32, max_substeps: u32) -> Self {
        self.substep = substep;
        self.max_substeps = max_substeps;
        self
    }

    /// Mark the world loaded (or not). Controllers wait for this before
    /// inserting their body.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn substep(&self) -> f32 {
        self.substep
    }

    /// Simulated seconds so far.
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    pub fn geometry(&self) -> &SimGeometry {
        &self.geometry
    }

    pub fn character_mask(&self) -> Option<CollisionGroup> {
        self.character.as_ref().map(|c| c.mask)
    }

    pub fn character_group(&self) -> Option<CollisionGroup> {
        self.character.as_ref().map(|c| c.group)
    }

    pub fn character_shape(&self) -> Option<&CollisionShape> {
        self.character.as_ref().map(|c| &c.shape)
    }

    fn integrate(character: &mut SimCharacter, geometry: &SimGeometry, dt: f32) {
        let body = &mut character.body;
        body.linear_velocity += body.gravity * dt;
        body.position += body.linear_velocity * dt;
        if body.angular_velocity.length_squared() > 0.0 {
            body.rotation = (Quat::from_scaled_axis(body.angular_velocity * dt) * body.rotation).normalize();
        }
        body.contacts.clear();
        if character.mask.is_empty() {
            return;
        }

        let (bottom, top) = character.shape.segment();
        let radius = character.shape.margin();
        for iteration in 0..RESOLUTION_ITERATIONS {
            let a = body.position + body.rotation * bottom;
            let b = body.position + body.rotation * top;
            let contacts = geometry.capsule_contacts(a, b, radius, character.mask);
            if iteration == 0 {
                body.contacts = contacts
                    .iter()
                    .map(|c| Contact {
                        point: c.point,
                        normal: c.normal,
                    })
                    .collect();
            }
            let Some(deepest) = contacts.iter().max_by(|x, y| x.depth.total_cmp(&y.depth)) else {
                break;
            };
            if deepest.depth <= 0.0 {
                break;
            }
            body.position += deepest.normal * deepest.depth;
            let into = body.linear_velocity.dot(deepest.normal);
            if into < 0.0 {
                body.linear_velocity -= deepest.normal * into;
            }
        }
    }
}

impl CollisionWorld for SimWorld {
    fn ray_test(&self, from: Vec3, to: Vec3, mask: CollisionGroup) -> Option<RayHit> {
        self.geometry.ray_test(from, to, mask)
    }
}

impl EntityQuery for SimWorld {
    fn find_ray_intersection(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<EntityHit> {
        let direction = direction.normalize_or_zero();
        if direction == Vec3::ZERO || max_distance <= 0.0 {
            return None;
        }
        let hit = self
            .geometry
            .ray_test(origin, origin + direction * max_distance, CollisionGroup::MASK_ENVIRONMENT)?;
        Some(EntityHit {
            distance: hit.fraction * max_distance,
            point: hit.point,
            normal: hit.normal,
        })
    }
}

impl PhysicsEngine for SimWorld {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn set_character_shape(&mut self, shape: CollisionShape, group: CollisionGroup, mask: CollisionGroup) {
        match self.character.as_mut() {
            Some(character) => {
                character.shape = shape;
                character.group = group;
                character.mask = mask;
            }
            None => {
                debug!(radius = shape.radius(), half_height = shape.half_height(), "character added to sim world");
                self.character = Some(SimCharacter {
                    shape,
                    group,
                    mask,
                    body: BodyState::default(),
                });
            }
        }
    }

    fn set_character_mask(&mut self, mask: CollisionGroup) -> Result<(), AvatarError> {
        let character = self.character.as_mut().ok_or(AvatarError::PhysicsNotReady)?;
        character.mask = mask;
        character.group = if mask.is_empty() {
            CollisionGroup::COLLISIONLESS
        } else {
            CollisionGroup::MY_AVATAR
        };
        Ok(())
    }

    fn remove_character(&mut self) {
        if self.character.take().is_some() {
            debug!("character removed from sim world");
        }
    }

    fn character(&self) -> Option<&BodyState> {
        self.character.as_ref().map(|c| &c.body)
    }

    fn character_mut(&mut self) -> Option<&mut BodyState> {
        self.character.as_mut().map(|c| &mut c.body)
    }

    fn step_simulation(&mut self, dt: f32, action: &mut dyn CharacterAction) -> u32 {
        if !dt.is_finite() || dt <= 0.0 {
            return 0;
        }
        self.accumulator += dt;
        let mut steps = 0;
        while self.accumulator >= self.substep && steps < self.max_substeps {
            self.accumulator -= self.substep;
            self.elapsed += self.substep;
            steps += 1;
            let substep = self.substep;
            let geometry = &self.geometry;
            if let Some(character) = self.character.as_mut() {
                action.update_action(&mut character.body, geometry, substep);
                Self::integrate(character, geometry, substep);
            }
        }
        if steps == self.max_substeps && self.accumulator >= self.substep {
            trace!(dropped = self.accumulator, "sim world dropping substep backlog");
            self.accumulator = 0.0;
        }
        steps
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
