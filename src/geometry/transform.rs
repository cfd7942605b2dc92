// SPDX-License-Identifier: GPL-3.0-only

//! 3D projective and 2D affine transformations

use super::Matrix;
use serde::{Deserialize, Serialize};
use std::ops::Mul;

pub type Point2 = [f64; 2];
pub type Point3 = [f64; 3];

/// Projective transformation of 3D space stored as a row-major 4x4 matrix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectiveTransform {
    rows: [[f64; 4]; 4],
}

impl Default for ProjectiveTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl ProjectiveTransform {
    pub const fn identity() -> Self {
        Self {
            rows: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    pub const fn from_rows(rows: [[f64; 4]; 4]) -> Self {
        Self { rows }
    }

    /// Build from 16 row-major values
    pub fn from_row_major(values: &[f64; 16]) -> Self {
        let mut rows = [[0.0; 4]; 4];
        for (i, row) in rows.iter_mut().enumerate() {
            row.copy_from_slice(&values[i * 4..i * 4 + 4]);
        }
        Self { rows }
    }

    pub fn to_row_major(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for (i, row) in self.rows.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(row);
        }
        out
    }

    pub fn rows(&self) -> &[[f64; 4]; 4] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [[f64; 4]; 4] {
        &mut self.rows
    }

    /// Apply to a homogeneous point without dividing
    pub fn transform_homogeneous(&self, p: [f64; 4]) -> [f64; 4] {
        let mut out = [0.0; 4];
        for (o, row) in out.iter_mut().zip(self.rows.iter()) {
            *o = row[0] * p[0] + row[1] * p[1] + row[2] * p[2] + row[3] * p[3];
        }
        out
    }

    /// Apply to an affine point, dividing by the resulting weight
    pub fn transform(&self, p: Point3) -> Point3 {
        let h = self.transform_homogeneous([p[0], p[1], p[2], 1.0]);
        [h[0] / h[3], h[1] / h[3], h[2] / h[3]]
    }

    /// Inverse transformation, or `None` if the matrix is singular
    pub fn inverse(&self) -> Option<ProjectiveTransform> {
        let m = Matrix::from_row_major(4, 4, &self.to_row_major()).ok()?;
        let inv = m.inverse().ok()?;
        let mut values = [0.0; 16];
        values.copy_from_slice(inv.as_slice());
        Some(Self::from_row_major(&values))
    }

    /// Apply the inverse transformation to an affine point
    pub fn inverse_transform(&self, p: Point3) -> Option<Point3> {
        self.inverse().map(|inv| inv.transform(p))
    }

    /// `self * other`: apply `other` first, then `self`
    pub fn compose(&self, other: &ProjectiveTransform) -> ProjectiveTransform {
        let mut rows = [[0.0; 4]; 4];
        for (i, row) in rows.iter_mut().enumerate() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = (0..4).map(|k| self.rows[i][k] * other.rows[k][j]).sum();
            }
        }
        Self { rows }
    }

    /// Replace `self` with `other * self`
    pub fn left_multiply(&mut self, other: &ProjectiveTransform) {
        *self = other.compose(self);
    }

    /// Replace `self` with `self * other`
    pub fn right_multiply(&mut self, other: &ProjectiveTransform) {
        *self = self.compose(other);
    }

    /// Uniform scaling of 3D space
    pub fn scaling(factor: f64) -> Self {
        let mut t = Self::identity();
        for i in 0..3 {
            t.rows[i][i] = factor;
        }
        t
    }

    pub fn translation(offset: Point3) -> Self {
        let mut t = Self::identity();
        for i in 0..3 {
            t.rows[i][3] = offset[i];
        }
        t
    }
}

impl Mul for ProjectiveTransform {
    type Output = ProjectiveTransform;

    fn mul(self, rhs: ProjectiveTransform) -> ProjectiveTransform {
        self.compose(&rhs)
    }
}

/// Affine transformation of the plane, `p' = M * (x, y, 1)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine2 {
    m: [[f64; 3]; 2],
}

impl Default for Affine2 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine2 {
    pub const fn identity() -> Self {
        Self {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        }
    }

    pub const fn from_rows(m: [[f64; 3]; 2]) -> Self {
        Self { m }
    }

    pub fn rows(&self) -> &[[f64; 3]; 2] {
        &self.m
    }

    pub fn transform(&self, p: Point2) -> Point2 {
        [
            self.m[0][0] * p[0] + self.m[0][1] * p[1] + self.m[0][2],
            self.m[1][0] * p[0] + self.m[1][1] * p[1] + self.m[1][2],
        ]
    }

    /// Fit the affine map sending `from[i]` to `to[i]` for three non-collinear points
    pub fn from_correspondences(from: [Point2; 3], to: [Point2; 3]) -> Option<Affine2> {
        let a = Matrix::from_row_major(
            3,
            3,
            &[
                from[0][0], from[0][1], 1.0, from[1][0], from[1][1], 1.0, from[2][0], from[2][1],
                1.0,
            ],
        )
        .ok()?;
        let b = Matrix::from_row_major(
            3,
            2,
            &[to[0][0], to[0][1], to[1][0], to[1][1], to[2][0], to[2][1]],
        )
        .ok()?;
        let x = a.solve(&b).ok()?;
        Some(Self {
            m: [
                [x[(0, 0)], x[(1, 0)], x[(2, 0)]],
                [x[(0, 1)], x[(1, 1)], x[(2, 1)]],
            ],
        })
    }

    pub fn inverse(&self) -> Option<Affine2> {
        let [[a, b, c], [d, e, f]] = self.m;
        let det = a * e - b * d;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let ia = e / det;
        let ib = -b / det;
        let id = -d / det;
        let ie = a / det;
        Some(Self {
            m: [
                [ia, ib, -(ia * c + ib * f)],
                [id, ie, -(id * c + ie * f)],
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample() -> ProjectiveTransform {
        ProjectiveTransform::from_rows([
            [2.0, 0.1, 0.0, 5.0],
            [0.0, 1.5, 0.2, -3.0],
            [0.1, 0.0, 1.0, 7.0],
            [0.0, 0.0, 0.001, 1.0],
        ])
    }

    #[test]
    fn test_inverse_transform_roundtrip() {
        let t = sample();
        let p = [12.0, -4.0, 800.0];
        let q = t.transform(p);
        let back = t.inverse_transform(q).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(back[i], p[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_compose_order() {
        let scale = ProjectiveTransform::scaling(2.0);
        let shift = ProjectiveTransform::translation([1.0, 0.0, 0.0]);
        // Scale first, then shift
        let t = shift * scale;
        assert_eq!(t.transform([1.0, 1.0, 1.0]), [3.0, 2.0, 2.0]);

        let mut u = scale;
        u.left_multiply(&shift);
        assert_eq!(u, t);
    }

    #[test]
    fn test_row_major_roundtrip() {
        let t = sample();
        assert_eq!(ProjectiveTransform::from_row_major(&t.to_row_major()), t);
    }

    #[test]
    fn test_affine_fit_and_inverse() {
        let a = Affine2::from_rows([[3.0, 0.5, 10.0], [0.0, 2.0, -4.0]]);
        let from = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let to = from.map(|p| a.transform(p));
        let fitted = Affine2::from_correspondences(from, to).unwrap();
        let inv = fitted.inverse().unwrap();
        let p = [7.0, -2.5];
        let back = inv.transform(fitted.transform(p));
        assert_abs_diff_eq!(back[0], p[0], epsilon = 1e-12);
        assert_abs_diff_eq!(back[1], p[1], epsilon = 1e-12);
    }
}
