//! Convex-hull approximation of the avatar capsule.
//!
//! The hull is a bipyramid of six points: one apex at each end of the capsule
//! axis and a small four-point ring three quarters of the way up. Inflated by
//! a margin equal to the capsule radius it behaves like a capsule with a
//! slightly wider chest, which keeps contact normals stable on step edges.
//!
//! All queries here work in the shape's local frame (capsule center at the
//! origin, +Y up, −Z forward).
//!
//! # Example
//!
//! ```rust
//! use avatar_physics::shape::CollisionShape;
//! use glam::Vec3;
//!
//! let shape = CollisionShape::capsule(0.25, 0.6).expect("valid capsule");
//! // a point just above the head is outside by roughly the gap
//! let d = shape.signed_distance(Vec3::new(0.0, 0.6 + 0.25 + 0.1, 0.0));
//! assert!((d - 0.1).abs() < 1e-4);
//! ```

use avatar_types::AvatarError;
use glam::Vec3;

/// Number of points in the hull.
pub const HULL_POINT_COUNT: usize = 6;

/// Half heights below this are raised to it when deriving from a bounding box.
const MIN_HALF_HEIGHT: f32 = 0.1;
const RING_HEIGHT_FRACTION: f32 = 0.75;
const RING_RADIUS_FRACTION: f32 = 0.1;
const TRACE_EPSILON: f32 = 1.0e-4;
const MAX_TRACE_ITERATIONS: usize = 128;

// ────────────────────────────────────────────────────────────────────────────
// CollisionShape
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CollisionShape {
    radius: f32,
    half_height: f32,
    /// Capsule center relative to the avatar root.
    local_offset: Vec3,
    points: [Vec3; HULL_POINT_COUNT],
}

impl CollisionShape {
    /// Build a hull for a capsule of the given radius and half height (the
    /// distance from the center to either hemisphere center).
    ///
    /// Non-finite or non-positive parameters yield
    /// [`AvatarError::ShapeCreation`].
    pub fn capsule(radius: f32, half_height: f32) -> Result<Self, AvatarError> {
        if !radius.is_finite() || radius <= 0.0 {
            return Err(AvatarError::ShapeCreation(format!("radius must be positive and finite, got {radius}")));
        }
        if !half_height.is_finite() || half_height <= 0.0 {
            return Err(AvatarError::ShapeCreation(format!("half height must be positive and finite, got {half_height}")));
        }
        let ring_y = RING_HEIGHT_FRACTION * half_height;
        let ring_r = RING_RADIUS_FRACTION * radius;
        let points = [
            Vec3::new(0.0, half_height, 0.0),
            Vec3::new(0.0, -half_height, 0.0),
            Vec3::new(0.0, ring_y, -ring_r),
            Vec3::new(0.0, ring_y, ring_r),
            Vec3::new(-ring_r, ring_y, 0.0),
            Vec3::new(ring_r, ring_y, 0.0),
        ];
        Ok(Self {
            radius,
            half_height,
            local_offset: Vec3::ZERO,
            points,
        })
    }

    /// Derive the capsule from an avatar-space bounding box (`corner` is the
    /// minimum corner, `dimensions` the box size).
    pub fn from_bounding_box(corner: Vec3, dimensions: Vec3) -> Result<Self, AvatarError> {
        if !corner.is_finite() || !dimensions.is_finite() || dimensions.min_element() <= 0.0 {
            return Err(AvatarError::ShapeCreation(format!(
                "bounding box must be finite with positive size, got corner {corner} size {dimensions}"
            )));
        }
        let radius = 0.5 * (0.5 * (dimensions.x * dimensions.x + dimensions.z * dimensions.z)).sqrt();
        let half_height = (0.5 * dimensions.y - radius).max(MIN_HALF_HEIGHT);
        let mut shape = Self::capsule(radius, half_height)?;
        shape.local_offset = corner + 0.5 * dimensions;
        Ok(shape)
    }

    pub fn with_local_offset(mut self, offset: Vec3) -> Self {
        self.local_offset = offset;
        self
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn half_height(&self) -> f32 {
        self.half_height
    }

    /// Center to the very bottom of the capsule.
    pub fn full_half_height(&self) -> f32 {
        self.radius + self.half_height
    }

    /// Hull inflation; equal to the radius.
    pub fn margin(&self) -> f32 {
        self.radius
    }

    pub fn local_offset(&self) -> Vec3 {
        self.local_offset
    }

    pub fn points(&self) -> &[Vec3; HULL_POINT_COUNT] {
        &self.points
    }

    /// The capsule axis, bottom apex first.
    pub fn segment(&self) -> (Vec3, Vec3) {
        (self.points[1], self.points[0])
    }

    /// `true` when both shapes have the same dimensions within `epsilon`.
    pub fn same_dimensions(&self, other: &Self, epsilon: f32) -> bool {
        (self.radius - other.radius).abs() < epsilon && (self.half_height - other.half_height).abs() < epsilon
    }

    /// Signed distance from `point` to the inflated hull surface.
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        let faces = self.faces();
        let mut max_plane = f32::MIN;
        for (a, _, _, normal) in &faces {
            max_plane = max_plane.max(normal.dot(point - *a));
        }
        if max_plane <= 0.0 {
            return max_plane - self.margin();
        }
        let mut closest = f32::MAX;
        for (a, b, c, _) in &faces {
            let q = closest_point_on_triangle(point, *a, *b, *c);
            closest = closest.min(point.distance(q));
        }
        closest - self.margin()
    }

    /// Trace a segment against the shape by sphere tracing. Returns the hit
    /// fraction along `from → to`, or `0.0` when `from` starts inside.
    pub fn ray_test(&self, from: Vec3, to: Vec3) -> Option<f32> {
        let delta = to - from;
        let length = delta.length();
        if length < TRACE_EPSILON {
            return None;
        }
        let direction = delta / length;
        let mut travelled = 0.0;
        for _ in 0..MAX_TRACE_ITERATIONS {
            let distance = self.signed_distance(from + direction * travelled);
            if distance < TRACE_EPSILON {
                return Some((travelled / length).clamp(0.0, 1.0));
            }
            travelled += distance;
            if travelled > length {
                return None;
            }
        }
        None
    }

    /// Triangles of the bipyramid with outward unit normals.
    fn faces(&self) -> [(Vec3, Vec3, Vec3, Vec3); 8] {
        let top = self.points[0];
        let bottom = self.points[1];
        // front, right, back, left
        let ring = [self.points[2], self.points[5], self.points[3], self.points[4]];
        let centroid = self.points.iter().copied().sum::<Vec3>() / HULL_POINT_COUNT as f32;

        let oriented = |a: Vec3, b: Vec3, c: Vec3| {
            let mut normal = (b - a).cross(c - a).normalize_or_zero();
            if normal.dot(a - centroid) < 0.0 {
                normal = -normal;
            }
            (a, b, c, normal)
        };
        let mut faces = [(Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, Vec3::ZERO); 8];
        for k in 0..4 {
            let next = (k + 1) % 4;
            faces[k] = oriented(top, ring[k], ring[next]);
            faces[k + 4] = oriented(bottom, ring[next], ring[k]);
        }
        faces
    }
}

/// Closest point to `p` on triangle `abc` (Voronoi-region walk).
fn closest_point_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    a + ab * (vb * denom) + ac * (vc * denom)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_parameters_fail_fast() {
        assert!(matches!(CollisionShape::capsule(0.0, 0.5), Err(AvatarError::ShapeCreation(_))));
        assert!(matches!(CollisionShape::capsule(0.2, -1.0), Err(AvatarError::ShapeCreation(_))));
        assert!(matches!(CollisionShape::capsule(f32::NAN, 0.5), Err(AvatarError::ShapeCreation(_))));
        assert!(matches!(
            CollisionShape::from_bounding_box(Vec3::ZERO, Vec3::new(0.5, 0.0, 0.5)),
            Err(AvatarError::ShapeCreation(_))
        ));
    }

    #[test]
    fn bounding_box_derivation() {
        let shape = CollisionShape::from_bounding_box(Vec3::new(-0.25, -0.93, -0.25), Vec3::new(0.5, 1.755, 0.5))
            .expect("valid box");
        assert!((shape.radius() - 0.25).abs() < 1e-6);
        assert!((shape.half_height() - 0.6275).abs() < 1e-5);
        assert!((shape.local_offset().y - (-0.0525)).abs() < 1e-5);
        assert!((shape.full_half_height() - 0.8775).abs() < 1e-5);
    }

    #[test]
    fn short_box_clamps_half_height() {
        let shape = CollisionShape::from_bounding_box(Vec3::ZERO, Vec3::new(1.0, 0.5, 1.0)).expect("valid box");
        assert!((shape.half_height() - MIN_HALF_HEIGHT).abs() < 1e-6);
    }

    #[test]
    fn signed_distance_inside_and_outside() {
        let shape = CollisionShape::capsule(0.25, 0.6).expect("valid");
        assert!(shape.signed_distance(Vec3::ZERO) < -0.2);
        let below = shape.signed_distance(Vec3::new(0.0, -0.6 - 0.25 - 0.05, 0.0));
        assert!((below - 0.05).abs() < 1e-4, "{below}");
        // the chest ring widens the shape slightly
        let chest = shape.signed_distance(Vec3::new(0.0, 0.45, -0.4));
        assert!((chest - (0.4 - 0.025 - 0.25)).abs() < 1e-3, "{chest}");
    }

    #[test]
    fn ray_hits_front_surface() {
        let shape = CollisionShape::capsule(0.25, 0.6).expect("valid");
        let from = Vec3::new(0.0, 0.0, -1.0);
        let fraction = shape.ray_test(from, Vec3::ZERO).expect("must hit");
        let z = from.z * (1.0 - fraction);
        assert!(z <= -0.25 + 1e-3 && z >= -0.25 * 1.1 - 1e-3, "surface at {z}");
    }

    #[test]
    fn ray_misses_beside_shape() {
        let shape = CollisionShape::capsule(0.25, 0.6).expect("valid");
        assert!(shape.ray_test(Vec3::new(0.5, 0.0, -1.0), Vec3::new(0.5, 0.0, 1.0)).is_none());
    }

    #[test]
    fn ray_starting_inside_reports_zero() {
        let shape = CollisionShape::capsule(0.25, 0.6).expect("valid");
        assert_eq!(shape.ray_test(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0)), Some(0.0));
    }
}
