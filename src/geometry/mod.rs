// SPDX-License-Identifier: GPL-3.0-only

//! Geometry and linear algebra primitives

mod matrix;
mod transform;

pub use matrix::Matrix;
pub use transform::{Affine2, Point2, Point3, ProjectiveTransform};
