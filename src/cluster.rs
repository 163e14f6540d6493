// src/cluster.rs
//! # Cluster builder
//!
//! Splits a mesh's face list into contiguous runs of [`BATCH_SIZE`] triangles
//! and computes a bounding cone per run. A viewer inside the cone sees every
//! triangle of the cluster from behind, so the whole cluster can be skipped
//! before any triangle reaches the GPU filter.
//!
//! Clusters whose faces cannot share one cone (opposing normals, only
//! degenerate triangles, or an apex that ends up implausibly far away) are
//! flagged invalid and always rendered.

use glam::Vec3;

use crate::BATCH_SIZE;

/// Squared cross-product length below which a triangle counts as degenerate.
const DEGENERATE_AREA_EPSILON: f32 = 1.0e-12;

/// Directional terms below this are treated as planes parallel to the axis.
const PARALLEL_EPSILON: f32 = 1.0e-6;

/// Maximum apex distance from the box center, in box diagonals.
const APEX_DISTANCE_LIMIT: f32 = 16.0;

/// Culling bounds of one run of up to [`BATCH_SIZE`] faces.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cluster {
    /// First face of the run, relative to the mesh.
    pub first_face: u32,
    pub face_count: u32,
    pub aabb_min: Vec3,
    pub aabb_max: Vec3,
    /// Unit axis pointing away from the front faces.
    pub cone_axis: Vec3,
    /// Cone apex ("cone center"), object space.
    pub cone_center: Vec3,
    pub cone_angle_cosine: f32,
    pub valid: bool,
}

impl Cluster {
    fn invalid(first_face: u32, face_count: u32, aabb_min: Vec3, aabb_max: Vec3) -> Self {
        Self {
            first_face,
            face_count,
            aabb_min,
            aabb_max,
            cone_axis: Vec3::ZERO,
            cone_center: (aabb_min + aabb_max) * 0.5,
            cone_angle_cosine: 1.0,
            valid: false,
        }
    }

    /// One past the last face of the run.
    #[inline]
    pub fn end_face(&self) -> u32 {
        self.first_face + self.face_count
    }

    /// True when every face of the cluster is back-facing for an eye at
    /// `eye_object` (object space). Invalid clusters are never culled.
    #[inline]
    pub fn is_backfacing(&self, eye_object: Vec3) -> bool {
        if !self.valid {
            return false;
        }
        let to_eye = (eye_object - self.cone_center).normalize_or_zero();
        to_eye.dot(self.cone_axis) > self.cone_angle_cosine
    }
}

/// `ceil(face_count / BATCH_SIZE)`.
#[inline]
pub fn cluster_count(face_count: u32) -> u32 {
    face_count.div_ceil(BATCH_SIZE)
}

/// Build the clusters of one mesh.
///
/// `indices` holds three mesh-relative vertex indices per face, CCW front
/// faces. Every index must address `positions`.
pub fn build_clusters(positions: &[[f32; 3]], indices: &[u32]) -> Vec<Cluster> {
    debug_assert!(indices.len() % 3 == 0, "index count {} is not a multiple of 3", indices.len());

    let face_count = (indices.len() / 3) as u32;
    let mut clusters = Vec::with_capacity(cluster_count(face_count) as usize);

    let mut first_face = 0;
    while first_face < face_count {
        let count = BATCH_SIZE.min(face_count - first_face);
        let start = first_face as usize * 3;
        let end = start + count as usize * 3;
        clusters.push(build_cluster(positions, &indices[start..end], first_face));
        first_face += count;
    }

    clusters
}

fn build_cluster(positions: &[[f32; 3]], indices: &[u32], first_face: u32) -> Cluster {
    let face_count = (indices.len() / 3) as u32;
    let vertex = |i: u32| Vec3::from_array(positions[i as usize]);

    let mut aabb_min = Vec3::splat(f32::MAX);
    let mut aabb_max = Vec3::splat(f32::MIN);
    for &i in indices {
        let p = vertex(i);
        aabb_min = aabb_min.min(p);
        aabb_max = aabb_max.max(p);
    }

    // Face normals, `None` for degenerate faces.
    let faces: Vec<(Vec3, Option<Vec3>)> = indices
        .chunks_exact(3)
        .map(|tri| {
            let (v0, v1, v2) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
            let n = (v1 - v0).cross(v2 - v0);
            let area = n.length_squared();
            (v0, (area > DEGENERATE_AREA_EPSILON).then(|| n / area.sqrt()))
        })
        .collect();

    let axis_sum: Vec3 = faces.iter().filter_map(|(_, n)| n.map(|n| -n)).sum();
    let Some(axis) = axis_sum.try_normalize() else {
        return Cluster::invalid(first_face, face_count, aabb_min, aabb_max);
    };

    let center = (aabb_min + aabb_max) * 0.5;
    let mut min_directional = 1.0f32;
    let mut max_t = f32::NEG_INFINITY;

    for &(v0, normal) in &faces {
        let Some(n) = normal else { continue };

        let directional = axis.dot(-n);
        if directional < 0.0 {
            return Cluster::invalid(first_face, face_count, aabb_min, aabb_max);
        }
        min_directional = min_directional.min(directional);

        // Ray center + t * axis against the face plane.
        if directional > PARALLEL_EPSILON {
            let t = n.dot(center - v0) / directional;
            max_t = max_t.max(t);
        }
    }

    let apex = center + axis * if max_t.is_finite() { max_t } else { 0.0 };
    let diagonal = (aabb_max - aabb_min).length();
    if !apex_is_plausible(center, apex, diagonal) {
        return Cluster::invalid(first_face, face_count, aabb_min, aabb_max);
    }

    Cluster {
        first_face,
        face_count,
        aabb_min,
        aabb_max,
        cone_axis: axis,
        cone_center: apex,
        cone_angle_cosine: (1.0 - min_directional * min_directional).clamp(0.0, 1.0).sqrt(),
        valid: true,
    }
}

#[inline]
fn apex_is_plausible(center: Vec3, apex: Vec3, diagonal: f32) -> bool {
    (apex - center).length() <= APEX_DISTANCE_LIMIT * diagonal
}
