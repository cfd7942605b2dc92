// SPDX-License-Identifier: GPL-3.0-only

//! Intrinsic and extrinsic camera parameters

use super::lens_distortion::{LensDistortion, PixelTangent};
use crate::codecs::wire::{WireReader, WireWriter};
use crate::errors::Result;
use crate::geometry::{Affine2, Point2, Point3, ProjectiveTransform};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Camera-space depth at which image-to-tangent relations are sampled
const REFERENCE_DEPTH: f64 = 1000.0;

/// Projection and lens-distortion model of a depth and a color sub-camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntrinsicParameters {
    pub depth_lens_distortion: LensDistortion,
    /// Maps (undistorted depth x, y, raw depth, 1) into 3D camera space
    pub depth_projection: ProjectiveTransform,
    pub color_lens_distortion: LensDistortion,
    /// Maps depth image space into (u*w, v*w, _, w) normalized color image
    /// space, i.e. a camera-to-color homography composed with `depth_projection`
    pub color_projection: ProjectiveTransform,
    #[serde(skip)]
    depth_mapping: PixelTangent,
    #[serde(skip)]
    color_mapping: PixelTangent,
}

impl Default for IntrinsicParameters {
    fn default() -> Self {
        Self::new(
            LensDistortion::default(),
            ProjectiveTransform::identity(),
            LensDistortion::default(),
            ProjectiveTransform::identity(),
        )
    }
}

impl IntrinsicParameters {
    pub fn new(
        depth_lens_distortion: LensDistortion,
        depth_projection: ProjectiveTransform,
        color_lens_distortion: LensDistortion,
        color_projection: ProjectiveTransform,
    ) -> Self {
        let mut ips = Self {
            depth_lens_distortion,
            depth_projection,
            color_lens_distortion,
            color_projection,
            depth_mapping: PixelTangent::default(),
            color_mapping: PixelTangent::default(),
        };
        ips.update_transforms();
        ips
    }

    /// Replace the depth projection and refresh derived transforms
    pub fn set_depth_projection(&mut self, projection: ProjectiveTransform) {
        self.depth_projection = projection;
        self.update_transforms();
    }

    /// Replace the color projection and refresh derived transforms
    pub fn set_color_projection(&mut self, projection: ProjectiveTransform) {
        self.color_projection = projection;
        self.update_transforms();
    }

    /// Recompute the image/tangent mappings after a projection changed
    ///
    /// The depth mapping relates a depth pixel to the direction `(X/Z, Y/Z)`
    /// of its camera-space ray; the color mapping relates such a direction to
    /// normalized color image coordinates. Both are sampled at a fixed
    /// reference depth. Projections whose rays do not have that shape keep
    /// the identity mapping.
    pub fn update_transforms(&mut self) {
        self.depth_mapping = depth_mapping(&self.depth_projection).unwrap_or_default();
        self.color_mapping =
            color_mapping(&self.color_projection, &self.depth_projection).unwrap_or_default();
    }

    pub fn depth_mapping(&self) -> &PixelTangent {
        &self.depth_mapping
    }

    pub fn color_mapping(&self) -> &PixelTangent {
        &self.color_mapping
    }

    pub fn distort_depth_pixel(&self, undistorted: Point2) -> Point2 {
        if self.depth_lens_distortion.is_identity() {
            return undistorted;
        }
        self.depth_lens_distortion
            .distort_pixel(undistorted, &self.depth_mapping)
    }

    pub fn undistort_depth_pixel(&self, distorted: Point2) -> Point2 {
        if self.depth_lens_distortion.is_identity() {
            return distorted;
        }
        self.depth_lens_distortion
            .undistort_pixel(distorted, &self.depth_mapping)
    }

    /// Undistorted position of the center of depth pixel `(x, y)`
    pub fn undistort_depth_pixel_center(&self, x: u32, y: u32) -> Point2 {
        self.undistort_depth_pixel([x as f64 + 0.5, y as f64 + 0.5])
    }

    pub fn undistort_color_pixel(&self, distorted: Point2) -> Point2 {
        if self.color_lens_distortion.is_identity() {
            return distorted;
        }
        self.color_lens_distortion
            .undistort_pixel(distorted, &self.color_mapping)
    }

    pub fn distort_color_pixel(&self, undistorted: Point2) -> Point2 {
        if self.color_lens_distortion.is_identity() {
            return undistorted;
        }
        self.color_lens_distortion
            .distort_pixel(undistorted, &self.color_mapping)
    }
}

fn depth_mapping(projection: &ProjectiveTransform) -> Option<PixelTangent> {
    let ray = |x: f64, y: f64| -> Option<Point2> {
        let p = projection.transform([x, y, REFERENCE_DEPTH]);
        (p[2].abs() > f64::EPSILON && p.iter().all(|v| v.is_finite()))
            .then(|| [p[0] / p[2], p[1] / p[2]])
    };
    let pixels = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let tangents = [ray(0.0, 0.0)?, ray(1.0, 0.0)?, ray(0.0, 1.0)?];
    let i2t = Affine2::from_correspondences(pixels, tangents)?;
    PixelTangent::from_image_to_tangent(&i2t)
}

fn color_mapping(
    projection: &ProjectiveTransform,
    depth_projection: &ProjectiveTransform,
) -> Option<PixelTangent> {
    let camera_to_image = projection.compose(&depth_projection.inverse()?);
    let image = |tx: f64, ty: f64| -> Option<Point2> {
        let h = camera_to_image.transform_homogeneous([
            tx * REFERENCE_DEPTH,
            ty * REFERENCE_DEPTH,
            REFERENCE_DEPTH,
            1.0,
        ]);
        (h[3].abs() > f64::EPSILON).then(|| [h[0] / h[3], h[1] / h[3]])
    };
    let tangents = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let images = [image(0.0, 0.0)?, image(1.0, 0.0)?, image(0.0, 1.0)?];
    let t2i = Affine2::from_correspondences(tangents, images)?;
    PixelTangent::from_image_to_tangent(&t2i.inverse()?)
}

/// Placement of a camera in world space
///
/// Stored as a projective transform; rigid placements are a special case.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtrinsicParameters {
    pub transform: ProjectiveTransform,
}

impl ExtrinsicParameters {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn new(transform: ProjectiveTransform) -> Self {
        Self { transform }
    }

    pub fn transform_point(&self, p: Point3) -> Point3 {
        self.transform.transform(p)
    }

    pub fn read_from<R: Read>(reader: &mut WireReader<R>) -> Result<Self> {
        Ok(Self::new(read_projection(reader)?))
    }

    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        write_projection(&self.transform, writer)
    }
}

/// Read a 4x4 projective matrix as 16 row-major `f64`
pub fn read_projection<R: Read>(reader: &mut WireReader<R>) -> Result<ProjectiveTransform> {
    let values: [f64; 16] = reader.read_f64_array()?;
    Ok(ProjectiveTransform::from_row_major(&values))
}

pub fn write_projection<W: Write>(
    projection: &ProjectiveTransform,
    writer: &mut WireWriter<W>,
) -> Result<()> {
    writer.write_f64_slice(&projection.to_row_major())
}
