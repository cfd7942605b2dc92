// SPDX-License-Identifier: GPL-3.0-only

//! Per-device calibration model
//!
//! - [`LensDistortion`]: radial and tangential lens distortion in tangent space
//! - [`DepthCorrection`]: B-spline of per-pixel depth scale and offset
//! - [`IntrinsicParameters`]: projections and lens models of both sub-cameras
//! - [`TiePointSolver`]: color projection from 3D/2D correspondences

mod depth_correction;
mod intrinsics;
mod lens_distortion;
mod tie_points;

pub use depth_correction::{DepthCorrection, PixelCorrection};
pub use intrinsics::{ExtrinsicParameters, IntrinsicParameters, read_projection, write_projection};
pub use lens_distortion::{LensDistortion, PixelTangent};
pub use tie_points::{MIN_TIE_POINTS, TiePointPair, TiePointSolution, TiePointSolver};
