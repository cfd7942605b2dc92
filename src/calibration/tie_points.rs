// SPDX-License-Identifier: GPL-3.0-only

//! Color camera calibration from 3D/2D tie points
//!
//! Each pair relates a camera-space point `P` to a color image pixel `p`.
//! The 3x4 homography `H` with `p ~ H * P` spans the right kernel of
//!
//! ```text
//! (X, Y, Z, 1, 0, 0, 0, 0, -uX, -uY, -uZ, -u)
//! (0, 0, 0, 0, X, Y, Z, 1, -vX, -vY, -vZ, -v)
//! ```
//!
//! stacked over all pairs, with `(u, v)` normalized by the image size. The
//! kernel is taken as the eigenvector of the smallest eigenvalue of the 12x12
//! normal matrix. Points are centered and scaled before the system is built
//! and the solution is mapped back afterwards.

use super::intrinsics::IntrinsicParameters;
use crate::codecs::{IntrinsicFile, IntrinsicLayout, calibration_file_name};
use crate::constants::{Size, file_names};
use crate::errors::{Kinect3dError, Result};
use crate::geometry::{Matrix, Point2, Point3, ProjectiveTransform};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fewest pairs that can determine the homography
pub const MIN_TIE_POINTS: usize = 5;

/// Eigenvalues below this fraction of the largest count as zero
const NULL_EIGENVALUE_RATIO: f64 = 1e-10;

/// A 3D camera-space point and the color pixel it appears at
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TiePointPair {
    pub camera_point: Point3,
    pub color_point: Point2,
}

/// Result of a tie-point solve
#[derive(Debug, Clone, PartialEq)]
pub struct TiePointSolution {
    /// Camera space to normalized color image space, scaled so `H[2][3] == 1`
    pub homography: [[f64; 4]; 3],
    /// Reprojection RMS in pixels
    pub rms: f64,
    /// Largest reprojection error in pixels
    pub max: f64,
}

impl TiePointSolution {
    /// Color projection as persisted: the homography lifted to 4x4 and
    /// composed with the depth projection
    pub fn color_projection(&self, depth_projection: &ProjectiveTransform) -> ProjectiveTransform {
        let h = &self.homography;
        let lifted = ProjectiveTransform::from_rows([h[0], h[1], [0.0, 0.0, 1.0, 0.0], h[2]]);
        lifted.compose(depth_projection)
    }

    /// Project a camera-space point into color pixels
    pub fn project(&self, p: Point3, image_size: Size) -> Option<Point2> {
        project(&self.homography, p, image_size)
    }
}

/// Accumulates tie points and solves for the color homography
#[derive(Debug, Clone, Default)]
pub struct TiePointSolver {
    pairs: Vec<TiePointPair>,
}

impl TiePointSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: Vec<TiePointPair>) -> Self {
        Self { pairs }
    }

    /// Load pairs from a JSON array
    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Kinect3dError::NotFound(path.display().to_string())
            } else {
                e.into()
            }
        })?;
        let pairs: Vec<TiePointPair> = serde_json::from_str(&text)?;
        if pairs.is_empty() {
            return Err(Kinect3dError::NotFound(format!(
                "no tie points in {}",
                path.display()
            )));
        }
        Ok(Self { pairs })
    }

    pub fn add_pair(&mut self, camera_point: Point3, color_pixel: Point2) {
        self.pairs.push(TiePointPair {
            camera_point,
            color_point: color_pixel,
        });
    }

    pub fn pairs(&self) -> &[TiePointPair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Solve for the homography from camera space to a `image_size` color image
    pub fn solve(&self, image_size: Size) -> Result<TiePointSolution> {
        if self.pairs.len() < MIN_TIE_POINTS {
            return Err(Kinect3dError::NotFound(format!(
                "need at least {} tie points, have {}",
                MIN_TIE_POINTS,
                self.pairs.len()
            )));
        }
        if image_size.width == 0 || image_size.height == 0 {
            return Err(Kinect3dError::invalid_argument("color image size is empty"));
        }
        let (w, h) = (image_size.width as f64, image_size.height as f64);

        let world: Vec<Point3> = self.pairs.iter().map(|p| p.camera_point).collect();
        let image: Vec<Point2> = self
            .pairs
            .iter()
            .map(|p| [p.color_point[0] / w, p.color_point[1] / h])
            .collect();

        let world_norm = Normalization::fit(&world)
            .ok_or_else(|| degenerate("all camera points coincide"))?;
        let image_norm = Normalization::fit(&image)
            .ok_or_else(|| degenerate("all color points coincide"))?;

        let mut a = Matrix::zeros(12, 12);
        for (pw, pi) in world.iter().zip(image.iter()) {
            let q = world_norm.apply(pw);
            let s = image_norm.apply(pi);
            let (x, y, z) = (q[0], q[1], q[2]);
            let (u, v) = (s[0], s[1]);
            let rows = [
                [x, y, z, 1.0, 0.0, 0.0, 0.0, 0.0, -u * x, -u * y, -u * z, -u],
                [0.0, 0.0, 0.0, 0.0, x, y, z, 1.0, -v * x, -v * y, -v * z, -v],
            ];
            for row in &rows {
                for i in 0..12 {
                    for j in 0..12 {
                        a[(i, j)] += row[i] * row[j];
                    }
                }
            }
        }

        let (vectors, values) = a.jacobi_iteration()?;
        let mut order: Vec<usize> = (0..12).collect();
        order.sort_by(|&i, &j| values[i].abs().total_cmp(&values[j].abs()));
        let largest = values[order[11]].abs();
        let null_count = order
            .iter()
            .take_while(|&&k| values[k].abs() <= largest * NULL_EIGENVALUE_RATIO)
            .count();
        debug!(
            smallest = values[order[0]],
            second = values[order[1]],
            null_count,
            "Tie-point system eigenvalues"
        );
        if null_count > 2 {
            return Err(degenerate("tie points leave the homography underdetermined"));
        }

        let denormalize = |k: usize| -> [[f64; 4]; 3] {
            let column = vectors.column(k);
            let mut hn = [[0.0; 4]; 3];
            for (i, row) in hn.iter_mut().enumerate() {
                row.copy_from_slice(&column[i * 4..i * 4 + 4]);
            }
            image_norm.undo(&world_norm.lift(&hn))
        };

        let homography = if null_count == 2 {
            // Pick the kernel element closest to having H[2][3] == 1
            let h1 = denormalize(order[0]);
            let h2 = denormalize(order[1]);
            let (c1, c2) = (h1[2][3], h2[2][3]);
            let mut combined = [[0.0; 4]; 3];
            for i in 0..3 {
                for j in 0..4 {
                    combined[i][j] = c1 * h1[i][j] + c2 * h2[i][j];
                }
            }
            combined
        } else {
            denormalize(order[0])
        };

        let norm = homography
            .iter()
            .flatten()
            .fold(0.0f64, |acc, x| acc.max(x.abs()));
        let scale = homography[2][3];
        if norm == 0.0 || scale.abs() <= norm * 1e-12 {
            return Err(degenerate("homography cannot be normalized"));
        }
        let mut normalized = homography;
        for value in normalized.iter_mut().flatten() {
            *value /= scale;
        }

        let mut sum_sq = 0.0;
        let mut max = 0.0f64;
        for pair in &self.pairs {
            let error = match project(&normalized, pair.camera_point, image_size) {
                Some(p) => {
                    let dx = p[0] - pair.color_point[0];
                    let dy = p[1] - pair.color_point[1];
                    (dx * dx + dy * dy).sqrt()
                }
                None => f64::INFINITY,
            };
            sum_sq += error * error;
            max = max.max(error);
        }
        let rms = (sum_sq / self.pairs.len() as f64).sqrt();
        info!(pairs = self.pairs.len(), rms, max, "Solved color homography");

        Ok(TiePointSolution {
            homography: normalized,
            rms,
            max,
        })
    }

    /// Solve and write `IntrinsicParameters-<serial>.dat` into `dir`
    ///
    /// Everything but the color projection is taken from `base`. The legacy
    /// layout is written when it can hold `base`'s lens distortion, the full
    /// layout otherwise.
    pub fn write_intrinsics(
        &self,
        dir: &Path,
        serial: &str,
        image_size: Size,
        base: &IntrinsicParameters,
    ) -> Result<(PathBuf, TiePointSolution)> {
        let solution = self.solve(image_size)?;
        let ips = IntrinsicParameters::new(
            base.depth_lens_distortion,
            base.depth_projection,
            base.color_lens_distortion,
            solution.color_projection(&base.depth_projection),
        );
        let layout = if ips.depth_lens_distortion.fits_legacy_layout()
            && ips.color_lens_distortion.is_identity()
        {
            IntrinsicLayout::Legacy
        } else {
            IntrinsicLayout::Full
        };
        let path = calibration_file_name(
            dir,
            file_names::INTRINSIC_PREFIX,
            serial,
            file_names::INTRINSIC_SUFFIX,
        );
        IntrinsicFile::save(&path, &ips, layout)?;
        info!(path = %path.display(), ?layout, "Wrote intrinsic parameters");
        Ok((path, solution))
    }
}

fn degenerate(msg: &str) -> Kinect3dError {
    Kinect3dError::NotFound(format!("degenerate tie-point system: {}", msg))
}

fn project(h: &[[f64; 4]; 3], p: Point3, image_size: Size) -> Option<Point2> {
    let dot = |row: &[f64; 4]| row[0] * p[0] + row[1] * p[1] + row[2] * p[2] + row[3];
    let w = dot(&h[2]);
    if w.abs() < f64::MIN_POSITIVE {
        return None;
    }
    Some([
        dot(&h[0]) / w * image_size.width as f64,
        dot(&h[1]) / w * image_size.height as f64,
    ])
}

/// Similarity moving points to zero centroid and mean distance sqrt(N)
struct Normalization<const N: usize> {
    centroid: [f64; N],
    scale: f64,
}

impl<const N: usize> Normalization<N> {
    fn fit(points: &[[f64; N]]) -> Option<Self> {
        let count = points.len() as f64;
        let mut centroid = [0.0; N];
        for p in points {
            for (c, v) in centroid.iter_mut().zip(p.iter()) {
                *c += v / count;
            }
        }
        let mean_distance = points
            .iter()
            .map(|p| {
                p.iter()
                    .zip(centroid.iter())
                    .map(|(v, c)| (v - c) * (v - c))
                    .sum::<f64>()
                    .sqrt()
            })
            .sum::<f64>()
            / count;
        (mean_distance > 0.0).then(|| Self {
            centroid,
            scale: (N as f64).sqrt() / mean_distance,
        })
    }

    fn apply(&self, p: &[f64; N]) -> [f64; N] {
        let mut out = [0.0; N];
        for i in 0..N {
            out[i] = (p[i] - self.centroid[i]) * self.scale;
        }
        out
    }
}

impl Normalization<3> {
    /// `Hn * T3`: a homography acting on unnormalized camera points
    fn lift(&self, hn: &[[f64; 4]; 3]) -> [[f64; 4]; 3] {
        let s = self.scale;
        let c = self.centroid;
        let mut out = [[0.0; 4]; 3];
        for (o, row) in out.iter_mut().zip(hn.iter()) {
            for j in 0..3 {
                o[j] = row[j] * s;
            }
            o[3] = row[3] - s * (row[0] * c[0] + row[1] * c[1] + row[2] * c[2]);
        }
        out
    }
}

impl Normalization<2> {
    /// `T2^-1 * H`: map normalized image output back to image coordinates
    fn undo(&self, h: &[[f64; 4]; 3]) -> [[f64; 4]; 3] {
        let inv = 1.0 / self.scale;
        let c = self.centroid;
        let mut out = [[0.0; 4]; 3];
        for j in 0..4 {
            out[0][j] = inv * h[0][j] + c[0] * h[2][j];
            out[1][j] = inv * h[1][j] + c[1] * h[2][j];
            out[2][j] = h[2][j];
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const IMAGE: Size = Size::new(640, 480);

    fn ground_truth() -> [[f64; 4]; 3] {
        [
            [0.9e-3, 0.02e-3, 0.5e-3, 0.05],
            [-0.01e-3, 1.1e-3, 0.45e-3, -0.02],
            [0.001e-3, -0.002e-3, 1.0e-3, 1.0],
        ]
    }

    fn synthetic_pairs(h: &[[f64; 4]; 3]) -> Vec<TiePointPair> {
        let mut pairs = Vec::new();
        for i in 0..4 {
            for j in 0..3 {
                let p = [
                    -300.0 + 200.0 * i as f64,
                    -200.0 + 180.0 * j as f64,
                    800.0 + 150.0 * ((i + 2 * j) % 4) as f64,
                ];
                let pixel = project(h, p, IMAGE).unwrap();
                pairs.push(TiePointPair {
                    camera_point: p,
                    color_point: pixel,
                });
            }
        }
        pairs
    }

    #[test]
    fn test_recovers_known_homography() {
        let truth = ground_truth();
        let solver = TiePointSolver::from_pairs(synthetic_pairs(&truth));
        let solution = solver.solve(IMAGE).unwrap();
        for i in 0..3 {
            for j in 0..4 {
                assert_abs_diff_eq!(solution.homography[i][j], truth[i][j], epsilon = 1e-8);
            }
        }
        assert!(solution.rms <= 1e-6, "rms {}", solution.rms);
    }

    #[test]
    fn test_five_pair_minimum() {
        let mut solver = TiePointSolver::new();
        solver.add_pair([0.0, 0.0, 1000.0], [320.0, 240.0]);
        solver.add_pair([100.0, 0.0, 1000.0], [384.0, 240.0]);
        solver.add_pair([0.0, 100.0, 1000.0], [320.0, 304.0]);
        solver.add_pair([100.0, 100.0, 1000.0], [384.0, 304.0]);
        let err = solver.solve(IMAGE).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::NotFound);

        solver.add_pair([0.0, 0.0, 2000.0], [320.0, 240.0]);
        let solution = solver.solve(IMAGE).unwrap();
        assert!(solution.rms <= 1e-6, "rms {}", solution.rms);
    }

    #[test]
    fn test_coincident_points_are_degenerate() {
        let mut solver = TiePointSolver::new();
        for _ in 0..6 {
            solver.add_pair([1.0, 2.0, 3.0], [10.0, 20.0]);
        }
        let err = solver.solve(IMAGE).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::NotFound);
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let mut solver = TiePointSolver::new();
        for i in 0..6 {
            let t = i as f64;
            solver.add_pair([t, 2.0 * t, 1000.0 + t], [100.0 + t, 50.0 + 3.0 * t]);
        }
        assert!(solver.solve(IMAGE).is_err());
    }

    #[test]
    fn test_color_projection_layout() {
        let solution = TiePointSolution {
            homography: ground_truth(),
            rms: 0.0,
            max: 0.0,
        };
        let projection = solution.color_projection(&ProjectiveTransform::identity());
        let rows = projection.rows();
        assert_eq!(rows[2], [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(rows[3], ground_truth()[2]);
        assert_eq!(rows[0], ground_truth()[0]);
    }
}
