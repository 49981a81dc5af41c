//! Shared geometric helpers: the cylindrical sphere parameterization used by
//! the directional trees, axis-aligned boxes for splatting, and the small
//! vector utilities the proxies need.

use glam::{Vec2, Vec3};

pub const FOUR_PI: f32 = 4.0 * std::f32::consts::PI;
pub const RCP_FOUR_PI: f32 = 1.0 / FOUR_PI;

/// Maps a unit direction to `[0,1)^2` via the equal-area cylindrical
/// parameterization `u = (z + 1)/2`, `v = atan2(y, x)/2pi`.
pub fn dir_to_cylindrical(direction: Vec3) -> Vec2 {
    let cos_theta = direction.z;
    let mut phi = direction.y.atan2(direction.x);
    if phi < 0.0 {
        phi += std::f32::consts::TAU;
    }
    Vec2::new(
        (cos_theta + 1.0) * 0.5,
        phi / std::f32::consts::TAU,
    )
}

/// Inverse of [`dir_to_cylindrical`]. Expects coordinates in `[0,1)`.
pub fn cylindrical_to_dir(p: Vec2) -> Vec3 {
    debug_assert!((0.0..1.0).contains(&p.x) && (0.0..1.0).contains(&p.y));
    let phi = std::f32::consts::TAU * p.y;
    let cos_theta = 2.0 * p.x - 1.0;
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    Vec3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, cos_theta)
}

/// Uniform direction on the unit sphere from a `[0,1)^2` sample.
pub fn sample_sphere_uniform(s: Vec2) -> Vec3 {
    cylindrical_to_dir(s)
}

/// Mirror of `v` around the (unit) normal `n`.
pub fn reflect(v: Vec3, n: Vec3) -> Vec3 {
    2.0 * v.dot(n) * n - v
}

/// Refracts `v` (pointing away from the surface) through the normal `n` with
/// relative index of refraction `eta`. Returns `None` on total internal
/// reflection.
pub fn refract(v: Vec3, n: Vec3, eta: f32) -> Option<Vec3> {
    let cos_i = v.dot(n);
    let sin2_t = (1.0 - cos_i * cos_i) / (eta * eta);
    if sin2_t > 1.0 {
        return None;
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    Some(-v / eta + (cos_i / eta - cos_t) * n)
}

/// Channel mean of an RGB value.
pub fn average(v: Vec3) -> f32 {
    (v.x + v.y + v.z) * (1.0 / 3.0)
}

/// Rec. 709 luminance.
pub fn luminance(v: Vec3) -> f32 {
    v.dot(Vec3::new(0.2126, 0.7152, 0.0722))
}

/// 2D axis-aligned box over the directional unit square.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb2 {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb2 {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// The `[0,1)^2` square every directional tree is defined over.
    pub fn unit() -> Self {
        Self::new(Vec2::ZERO, Vec2::ONE)
    }

    pub fn extent(&self) -> Vec2 {
        self.max - self.min
    }

    pub fn area(&self) -> f32 {
        let e = self.extent();
        e.x * e.y
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y
    }

    pub fn intersect(a: Self, b: Self) -> Self {
        Self::new(a.min.max(b.min), a.max.min(b.max))
    }
}

/// 3D axis-aligned box in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb3 {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create empty AABB (inverted bounds for union operations)
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn volume(&self) -> f32 {
        let e = self.extent();
        e.x * e.y * e.z
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Expand AABB to include a point
    pub fn expand_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn intersect(a: Self, b: Self) -> Self {
        Self::new(a.min.max(b.min), a.max.min(b.max))
    }

    /// Clamp a point into the box.
    pub fn clip(&self, point: Vec3) -> Vec3 {
        point.clamp(self.min, self.max)
    }
}
