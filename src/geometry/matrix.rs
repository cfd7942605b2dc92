// SPDX-License-Identifier: GPL-3.0-only

//! Small dense matrices
//!
//! Only what calibration needs: products, transposition, Jacobi
//! eigendecomposition of symmetric matrices and a full-pivot linear solver.

use crate::errors::{Kinect3dError, Result};
use std::ops::{Index, IndexMut, Mul};

/// Maximum number of Jacobi sweeps before giving up on convergence
const MAX_JACOBI_SWEEPS: usize = 100;

/// Row-major dense matrix of `f64`
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut m = Self::zeros(size, size);
        for i in 0..size {
            m[(i, i)] = 1.0;
        }
        m
    }

    /// Load a matrix from row-major values
    pub fn from_row_major(rows: usize, cols: usize, values: &[f64]) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(Kinect3dError::invalid_argument(format!(
                "{} values cannot fill a {}x{} matrix",
                values.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            rows,
            cols,
            data: values.to_vec(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Copy of column `j`
    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.rows).map(|i| self[(i, j)]).collect()
    }

    pub fn transpose(&self) -> Matrix {
        let mut t = Matrix::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                t[(j, i)] = self[(i, j)];
            }
        }
        t
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Eigendecomposition of a symmetric matrix by cyclic Jacobi rotations
    ///
    /// Returns `(eigenvectors, eigenvalues)`; eigenvector `k` is column `k`
    /// of the returned matrix and belongs to `eigenvalues[k]`. Only the upper
    /// triangle of `self` is trusted to be symmetric with the lower one.
    pub fn jacobi_iteration(&self) -> Result<(Matrix, Vec<f64>)> {
        if !self.is_square() {
            return Err(Kinect3dError::invalid_argument(
                "Jacobi iteration needs a square matrix",
            ));
        }
        let n = self.rows;
        let mut a = self.clone();
        let mut v = Matrix::identity(n);

        let scale = a.data.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
        if scale == 0.0 {
            return Ok((v, vec![0.0; n]));
        }

        for _sweep in 0..MAX_JACOBI_SWEEPS {
            let off: f64 = (0..n)
                .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
                .map(|(p, q)| a[(p, q)] * a[(p, q)])
                .sum();
            if off.sqrt() <= f64::EPSILON * scale * 1e-3 {
                break;
            }

            for p in 0..n {
                for q in (p + 1)..n {
                    let apq = a[(p, q)];
                    if apq == 0.0 {
                        continue;
                    }
                    let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
                    let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                    let t = if theta == 0.0 { 1.0 } else { t };
                    let c = 1.0 / (t * t + 1.0).sqrt();
                    let s = t * c;

                    for k in 0..n {
                        let akp = a[(k, p)];
                        let akq = a[(k, q)];
                        a[(k, p)] = c * akp - s * akq;
                        a[(k, q)] = s * akp + c * akq;
                    }
                    for k in 0..n {
                        let apk = a[(p, k)];
                        let aqk = a[(q, k)];
                        a[(p, k)] = c * apk - s * aqk;
                        a[(q, k)] = s * apk + c * aqk;
                    }
                    for k in 0..n {
                        let vkp = v[(k, p)];
                        let vkq = v[(k, q)];
                        v[(k, p)] = c * vkp - s * vkq;
                        v[(k, q)] = s * vkp + c * vkq;
                    }
                }
            }
        }

        let eigenvalues = (0..n).map(|i| a[(i, i)]).collect();
        Ok((v, eigenvalues))
    }

    /// Solve `self * X = rhs` by Gaussian elimination with full pivoting
    pub fn solve(&self, rhs: &Matrix) -> Result<Matrix> {
        if !self.is_square() || rhs.rows != self.rows {
            return Err(Kinect3dError::invalid_argument(format!(
                "cannot solve {}x{} system with {}x{} right-hand side",
                self.rows, self.cols, rhs.rows, rhs.cols
            )));
        }
        let n = self.rows;
        let m = rhs.cols;
        let mut a = self.clone();
        let mut b = rhs.clone();
        // Column permutation introduced by full pivoting
        let mut col_perm: Vec<usize> = (0..n).collect();

        let scale = a.data.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
        let tolerance = scale * f64::EPSILON * n as f64;

        for step in 0..n {
            let mut pivot = (step, step);
            let mut best = 0.0;
            for i in step..n {
                for j in step..n {
                    let value = a[(i, j)].abs();
                    if value > best {
                        best = value;
                        pivot = (i, j);
                    }
                }
            }
            if best <= tolerance {
                return Err(Kinect3dError::invalid_argument("matrix is singular"));
            }

            if pivot.0 != step {
                a.swap_rows(step, pivot.0);
                b.swap_rows(step, pivot.0);
            }
            if pivot.1 != step {
                a.swap_cols(step, pivot.1);
                col_perm.swap(step, pivot.1);
            }

            for i in (step + 1)..n {
                let factor = a[(i, step)] / a[(step, step)];
                if factor == 0.0 {
                    continue;
                }
                for j in step..n {
                    let value = a[(step, j)];
                    a[(i, j)] -= factor * value;
                }
                for j in 0..m {
                    let value = b[(step, j)];
                    b[(i, j)] -= factor * value;
                }
            }
        }

        let mut x = Matrix::zeros(n, m);
        for j in 0..m {
            for i in (0..n).rev() {
                let mut sum = b[(i, j)];
                for k in (i + 1)..n {
                    sum -= a[(i, k)] * x[(k, j)];
                }
                x[(i, j)] = sum / a[(i, i)];
            }
        }

        // Undo the column permutation on the solution rows
        let mut result = Matrix::zeros(n, m);
        for (i, &original) in col_perm.iter().enumerate() {
            for j in 0..m {
                result[(original, j)] = x[(i, j)];
            }
        }
        Ok(result)
    }

    pub fn inverse(&self) -> Result<Matrix> {
        self.solve(&Matrix::identity(self.rows))
    }

    fn swap_rows(&mut self, r1: usize, r2: usize) {
        for j in 0..self.cols {
            self.data.swap(r1 * self.cols + j, r2 * self.cols + j);
        }
    }

    fn swap_cols(&mut self, c1: usize, c2: usize) {
        for i in 0..self.rows {
            self.data.swap(i * self.cols + c1, i * self.cols + c2);
        }
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.data[i * self.cols + j]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.data[i * self.cols + j]
    }
}

impl Mul for &Matrix {
    type Output = Matrix;

    fn mul(self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.cols, rhs.rows, "matrix dimensions do not agree");
        let mut out = Matrix::zeros(self.rows, rhs.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self[(i, k)];
                if a == 0.0 {
                    continue;
                }
                for j in 0..rhs.cols {
                    out[(i, j)] += a * rhs[(k, j)];
                }
            }
        }
        out
    }
}
