// src/geometry.rs
//! Procedural test geometry: height-field chunks made of a grid of quads.

use std::f32::consts::PI;

use rand::Rng;

/// Smallest face count produced by [`random_chunks`].
pub const MIN_CHUNK_FACES: u32 = 32;

/// Positions plus mesh-relative triangle indices, CCW front faces.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

impl MeshData {
    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    #[inline]
    pub fn face_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// Grid of `face_count / 2` quads in the XY plane, one unit apart, with a
/// sinusoidal height of `amplitude` along Z. Front faces point toward +Z.
///
/// Quads are laid out in columns of `floor(sqrt(quads))`; the last column may
/// be partial and stays flat.
pub fn height_field(face_count: u32, amplitude: f32) -> MeshData {
    let quads = face_count / 2;
    if quads == 0 {
        return MeshData::default();
    }

    let rows = ((quads as f32).sqrt() as u32).max(1);
    let full_columns = quads / rows;
    let partial = quads % rows;
    let stride = rows + 1;

    let mut mesh = MeshData {
        positions: Vec::with_capacity(((full_columns + 2) * stride) as usize),
        indices: Vec::with_capacity(quads as usize * 6),
    };

    let height = |i: u32, j: u32| {
        amplitude
            * (i as f32 * PI / rows as f32 * 3.0).sin()
            * (j as f32 * PI / rows as f32 * 4.0).cos()
    };

    for i in 0..=full_columns {
        for j in 0..=rows {
            mesh.positions.push([i as f32, j as f32, height(i, j)]);
        }
    }
    if partial > 0 {
        let x = (full_columns + 1) as f32;
        for j in 0..=partial {
            mesh.positions.push([x, j as f32, 0.0]);
        }
    }

    let mut quad = |a: u32, b: u32, c: u32, d: u32| {
        // a = (i, j), b = (i, j + 1), c = (i + 1, j), d = (i + 1, j + 1)
        mesh.indices.extend_from_slice(&[a, c, b, b, c, d]);
    };

    for i in 0..full_columns {
        for j in 0..rows {
            let a = i * stride + j;
            let c = a + stride;
            quad(a, a + 1, c, c + 1);
        }
    }
    let partial_base = (full_columns + 1) * stride;
    for j in 0..partial {
        let a = full_columns * stride + j;
        let c = partial_base + j;
        quad(a, a + 1, c, c + 1);
    }

    mesh
}

/// `count` height fields whose face counts are drawn uniformly from
/// `mean ± variance`, never below [`MIN_CHUNK_FACES`].
pub fn random_chunks<R: Rng + ?Sized>(rng: &mut R, count: u32, mean: u32, variance: u32) -> Vec<MeshData> {
    let low = mean.saturating_sub(variance);
    let high = mean.saturating_add(variance);
    (0..count)
        .map(|_| {
            let faces = rng.gen_range(low..=high).max(MIN_CHUNK_FACES);
            height_field(faces, 4.0)
        })
        .collect()
}
