// SPDX-License-Identifier: GPL-3.0-only

//! Depth frame to triangle mesh conversion

use crate::calibration::{IntrinsicParameters, PixelCorrection};
use crate::constants::{DepthPixel, INVALID_DEPTH, Size};
use crate::geometry::ProjectiveTransform;

/// Marks a pixel without a vertex in the index map
const NO_VERTEX: u32 = u32::MAX;

/// Triangle mesh of one depth frame
///
/// Vertices are in undistorted depth image space `(x, y, depth)` with
/// corrected depth; every three indices form one counter-clockwise triangle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshBuffer {
    pub vertices: Vec<[f32; 3]>,
    /// Normalized color image coordinates, one per vertex
    pub tex_coords: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    /// Time stamp of the source depth frame
    pub time_stamp: f64,
    /// Increases with every mesh a projector produces
    pub version: u64,
}

impl MeshBuffer {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Corner of a 2x2 pixel quad: 0 = (x, y), 1 = (x+1, y), 2 = (x, y+1), 3 = (x+1, y+1)
type Corner = usize;

/// Triangles emitted for each 4-bit corner validity pattern
///
/// Bit `c` of the pattern is set when corner `c` is valid.
const QUAD_TRIANGLES: [&[[Corner; 3]]; 16] = [
    &[],
    &[],
    &[],
    &[],
    &[],
    &[],
    &[],
    &[[0, 1, 2]],
    &[],
    &[],
    &[],
    &[[0, 1, 3]],
    &[],
    &[[0, 3, 2]],
    &[[1, 3, 2]],
    &[[0, 1, 2], [2, 1, 3]],
];

/// Triangles a quad with validity `pattern` produces before the depth test
pub fn quad_triangle_count(pattern: usize) -> usize {
    QUAD_TRIANGLES[pattern & 0xF].len()
}

/// Per-pixel data prepared once per calibration and frame size
#[derive(Debug, Clone)]
pub struct PixelTables {
    pub size: Size,
    pub corrections: Vec<PixelCorrection>,
    /// Undistorted pixel centers
    pub positions: Vec<[f32; 2]>,
}

impl PixelTables {
    pub fn new(
        size: Size,
        intrinsics: &IntrinsicParameters,
        corrections: Vec<PixelCorrection>,
    ) -> Self {
        let mut positions = Vec::with_capacity(size.volume());
        for y in 0..size.height {
            for x in 0..size.width {
                let p = intrinsics.undistort_depth_pixel_center(x, y);
                positions.push([p[0] as f32, p[1] as f32]);
            }
        }
        Self {
            size,
            corrections,
            positions,
        }
    }
}

/// Temporal and spatial low-pass filtering of raw depth
#[derive(Debug, Clone)]
pub struct DepthFilterState {
    pub temporal: bool,
    pub spatial: bool,
    pub alpha: f32,
    size: Size,
    filtered: Vec<f32>,
    seeded: Vec<bool>,
}

impl DepthFilterState {
    pub fn new(alpha: f32) -> Self {
        Self {
            temporal: false,
            spatial: false,
            alpha,
            size: Size::default(),
            filtered: Vec::new(),
            seeded: Vec::new(),
        }
    }

    /// Forget the temporal history
    pub fn reset(&mut self) {
        self.filtered.clear();
        self.seeded.clear();
    }

    /// Filtered depth per pixel; `None` for invalid samples
    pub fn filter(&mut self, size: Size, raw: &[DepthPixel]) -> Vec<Option<f32>> {
        let mut depths: Vec<Option<f32>> = raw
            .iter()
            .map(|&d| (d < INVALID_DEPTH).then_some(d as f32))
            .collect();

        if self.temporal {
            if self.size != size || self.filtered.len() != raw.len() {
                self.size = size;
                self.filtered = vec![0.0; raw.len()];
                self.seeded = vec![false; raw.len()];
            }
            let alpha = self.alpha;
            for ((d, f), seeded) in depths
                .iter_mut()
                .zip(self.filtered.iter_mut())
                .zip(self.seeded.iter_mut())
            {
                if let Some(value) = d {
                    if *seeded {
                        *f = alpha * *value + (1.0 - alpha) * *f;
                    } else {
                        *f = *value;
                        *seeded = true;
                    }
                    *value = *f;
                }
            }
        }

        if self.spatial {
            depths = gaussian_3x3(size, &depths);
        }
        depths
    }
}

/// 3x3 binomial blur with clamp-to-edge; invalid neighbours are skipped
fn gaussian_3x3(size: Size, depths: &[Option<f32>]) -> Vec<Option<f32>> {
    const WEIGHTS: [f32; 3] = [1.0, 2.0, 1.0];
    let (w, h) = (size.width as i64, size.height as i64);
    let mut out = Vec::with_capacity(depths.len());
    for y in 0..h {
        for x in 0..w {
            if depths[(y * w + x) as usize].is_none() {
                out.push(None);
                continue;
            }
            let mut sum = 0.0;
            let mut weight = 0.0;
            for (dy, wy) in (-1..=1).zip(WEIGHTS) {
                for (dx, wx) in (-1..=1).zip(WEIGHTS) {
                    let sx = (x + dx).clamp(0, w - 1);
                    let sy = (y + dy).clamp(0, h - 1);
                    if let Some(d) = depths[(sy * w + sx) as usize] {
                        sum += wx * wy * d;
                        weight += wx * wy;
                    }
                }
            }
            out.push(Some(sum / weight));
        }
    }
    out
}

/// Build the mesh of one filtered depth frame
///
/// A triangle is kept only if the spread of its corrected corner depths is
/// at most `triangle_depth_range`.
pub fn build_mesh(
    tables: &PixelTables,
    depths: &[Option<f32>],
    color_projection: &ProjectiveTransform,
    triangle_depth_range: f32,
) -> MeshBuffer {
    let size = tables.size;
    let width = size.width as usize;
    let mut mesh = MeshBuffer::default();
    let mut vertex_index = vec![NO_VERTEX; depths.len()];
    let mut corrected = vec![0.0f32; depths.len()];

    for (i, depth) in depths.iter().enumerate() {
        let Some(raw) = depth else {
            continue;
        };
        let d = tables.corrections[i].apply(*raw);
        let [x, y] = tables.positions[i];
        corrected[i] = d;
        vertex_index[i] = mesh.vertices.len() as u32;
        mesh.vertices.push([x, y, d]);
        let h = color_projection.transform_homogeneous([x as f64, y as f64, d as f64, 1.0]);
        mesh.tex_coords.push(if h[3].abs() > f64::EPSILON {
            [(h[0] / h[3]) as f32, (h[1] / h[3]) as f32]
        } else {
            [0.0, 0.0]
        });
    }

    if size.width < 2 || size.height < 2 {
        return mesh;
    }
    for y in 0..size.height as usize - 1 {
        for x in 0..width - 1 {
            let base = y * width + x;
            let corners = [base, base + 1, base + width, base + width + 1];
            let pattern = corners
                .iter()
                .enumerate()
                .filter(|&(_, &p)| vertex_index[p] != NO_VERTEX)
                .fold(0usize, |bits, (c, _)| bits | (1 << c));
            for triangle in QUAD_TRIANGLES[pattern] {
                let pixels = triangle.map(|c| corners[c]);
                let zs = pixels.map(|p| corrected[p]);
                let span = zs.iter().cloned().fold(f32::MIN, f32::max)
                    - zs.iter().cloned().fold(f32::MAX, f32::min);
                if span <= triangle_depth_range {
                    mesh.indices.extend(pixels.map(|p| vertex_index[p]));
                }
            }
        }
    }
    mesh
}
