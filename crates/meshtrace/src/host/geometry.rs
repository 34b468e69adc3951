use std::ops;

use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Pod, Zeroable)]
pub struct Vec3(pub f32, pub f32, pub f32);

impl Vec3 {
    pub fn dot(a: Vec3, b: Vec3) -> f32 {
        a.0 * b.0 + a.1 * b.1 + a.2 * b.2
    }

    pub fn cross(u: Vec3, v: Vec3) -> Vec3 {
        Vec3(u.1 * v.2 - u.2 * v.1,
            u.2 * v.0 - u.0 * v.2,
            u.0 * v.1 - u.1 * v.0)
    }
}

impl ops::Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Self) -> Self::Output {
        Vec3(self.0 - rhs.0, self.1 - rhs.1, self.2 - rhs.2)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

/// Distance along `ray` to triangle `(p0, p1, p2)`, if it crosses it. The
/// distance is in units of the direction's length and may be negative.
pub fn ray_triangle_intersect(
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    ray: Ray,
) -> Option<f32> {
    // Moller-Trumbore algorithm
    let e1 = p1 - p0;
    let e2 = p2 - p0;

    let p = Vec3::cross(ray.direction, e2);
    let denom = Vec3::dot(p, e1);

    if denom == 0.0 {
        return None;
    }

    let t_vec = ray.origin - p0;
    let u = Vec3::dot(p, t_vec) / denom;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = Vec3::cross(t_vec, e1);
    let v = Vec3::dot(q, ray.direction) / denom;

    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    Some(Vec3::dot(q, e2) / denom)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: [Vec3; 3] = [Vec3(0.0, 0.0, 0.0), Vec3(1.0, 0.0, 0.0), Vec3(0.0, 1.0, 0.0)];

    fn hit(origin: Vec3, direction: Vec3) -> Option<f32> {
        ray_triangle_intersect(UNIT[0], UNIT[1], UNIT[2], Ray { origin, direction })
    }

    #[test]
    fn hits_through_centroid() {
        let t = hit(Vec3(0.25, 0.25, 2.0), Vec3(0.0, 0.0, -1.0)).unwrap();
        assert!((t - 2.0).abs() < 1e-6);
    }

    #[test]
    fn hits_from_behind() {
        let t = hit(Vec3(0.25, 0.25, -3.0), Vec3(0.0, 0.0, 1.0)).unwrap();
        assert!((t - 3.0).abs() < 1e-6);
    }

    #[test]
    fn misses_outside_edges() {
        assert!(hit(Vec3(0.9, 0.9, 1.0), Vec3(0.0, 0.0, -1.0)).is_none());
        assert!(hit(Vec3(-0.1, 0.5, 1.0), Vec3(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn parallel_ray_misses() {
        assert!(hit(Vec3(0.25, 0.25, 1.0), Vec3(1.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn negative_distance_behind_origin() {
        let t = hit(Vec3(0.25, 0.25, 1.0), Vec3(0.0, 0.0, 1.0)).unwrap();
        assert!(t < 0.0);
    }
}
