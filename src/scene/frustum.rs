//! View frustum and bounding boxes for chunk culling

use glam::{Mat4, Vec3, Vec4};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box; the identity for `union`
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points
            .into_iter()
            .fold(Self::EMPTY, |acc, p| Self::new(acc.min.min(p), acc.max.max(p)))
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Bounds of this box after an affine transform (Arvo's method)
    pub fn transformed(&self, transform: &Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        let translation = transform.w_axis.truncate();
        let mut min = translation;
        let mut max = translation;
        let columns = [
            transform.x_axis.truncate(),
            transform.y_axis.truncate(),
            transform.z_axis.truncate(),
        ];
        for (axis, column) in columns.iter().enumerate() {
            let a = *column * self.min[axis];
            let b = *column * self.max[axis];
            min += a.min(b);
            max += a.max(b);
        }
        Aabb::new(min, max)
    }
}

/// Plane in the form `dot(normal, p) + d = 0`, normal pointing inside the frustum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = row.truncate();
        let length = normal.length();
        if length > f32::EPSILON {
            Self {
                normal: normal / length,
                d: row.w / length,
            }
        } else {
            Self { normal, d: row.w }
        }
    }

    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// Six clip planes extracted from a view-projection matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    /// Left, right, bottom, top, near, far
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract planes from a view-projection matrix with a [0, 1] depth range
    pub fn from_view_projection(view_proj: &Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        Self {
            planes: [
                Plane::from_row(r3 + r0),
                Plane::from_row(r3 - r0),
                Plane::from_row(r3 + r1),
                Plane::from_row(r3 - r1),
                Plane::from_row(r2),
                Plane::from_row(r3 - r2),
            ],
        }
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.signed_distance(point) >= 0.0)
    }

    /// Conservative box test: false only when the box is entirely behind one plane.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        if aabb.is_empty() {
            return false;
        }
        self.planes.iter().all(|plane| {
            // Corner furthest along the plane normal
            let positive = Vec3::new(
                if plane.normal.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if plane.normal.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if plane.normal.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );
            plane.signed_distance(positive) >= 0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frustum() -> Frustum {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn test_box_at_origin_is_visible() {
        let frustum = test_frustum();
        assert!(frustum.intersects_aabb(&Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE)));
        assert!(frustum.contains_point(Vec3::ZERO));
    }

    #[test]
    fn test_box_behind_camera_is_culled() {
        let frustum = test_frustum();
        let behind = Aabb::from_center_half_extents(Vec3::new(0.0, 0.0, 20.0), Vec3::ONE);
        assert!(!frustum.intersects_aabb(&behind));
    }

    #[test]
    fn test_box_beyond_far_plane_is_culled() {
        let frustum = test_frustum();
        let far = Aabb::from_center_half_extents(Vec3::new(0.0, 0.0, -200.0), Vec3::ONE);
        assert!(!frustum.intersects_aabb(&far));
    }

    #[test]
    fn test_box_straddling_side_plane_is_visible() {
        let frustum = test_frustum();
        // Half-width of the view at distance 10 is tan(30deg) * 10 ~= 5.77
        let straddling = Aabb::from_center_half_extents(Vec3::new(6.0, 0.0, 0.0), Vec3::ONE);
        assert!(frustum.intersects_aabb(&straddling));
        let outside = Aabb::from_center_half_extents(Vec3::new(9.0, 0.0, 0.0), Vec3::ONE);
        assert!(!frustum.intersects_aabb(&outside));
    }

    #[test]
    fn test_transformed_aabb_contains_transformed_corners() {
        let aabb = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5));
        let transform = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 1.0),
            glam::Quat::from_rotation_y(0.7),
            Vec3::new(5.0, 0.0, -3.0),
        );
        let bounds = aabb.transformed(&transform);
        for x in [-0.5, 0.5] {
            for y in [-0.5, 0.5] {
                for z in [-0.5, 0.5] {
                    let p = transform.transform_point3(Vec3::new(x, y, z));
                    assert!(p.cmpge(bounds.min - 1e-4).all() && p.cmple(bounds.max + 1e-4).all());
                }
            }
        }
    }
}
