// SPDX-License-Identifier: GPL-3.0-only

//! Per-pixel depth correction as a bivariate uniform B-spline
//!
//! Each control point carries a `scale` and an `offset`; a corrected depth
//! value is `raw * scale + offset`. Pixel `(x, y)` of a `W x H` frame lives at
//! `((x + 0.5) * Sx / W, (y + 0.5) * Sy / H)` in spline space, where `Sx`, `Sy`
//! are the segment counts.

use crate::codecs::wire::{WireReader, WireWriter};
use crate::constants::{Size, depth_correction::MAX_DEGREE, formats};
use crate::errors::{Kinect3dError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Scale and offset applied to one raw depth value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelCorrection {
    pub scale: f32,
    pub offset: f32,
}

impl Default for PixelCorrection {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
        }
    }
}

impl PixelCorrection {
    pub fn apply(&self, raw: f32) -> f32 {
        raw * self.scale + self.offset
    }

    /// Invert [`apply`](Self::apply)
    pub fn invert(&self, corrected: f32) -> f32 {
        (corrected - self.offset) / self.scale
    }
}

/// Bivariate B-spline of per-pixel depth corrections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthCorrection {
    degree: u32,
    num_segments: Size,
    control_points: Vec<PixelCorrection>,
}

impl Default for DepthCorrection {
    fn default() -> Self {
        Self::identity()
    }
}

impl DepthCorrection {
    /// Degree-0 correction over a single segment: leaves depth untouched
    pub fn identity() -> Self {
        Self {
            degree: 0,
            num_segments: Size::new(1, 1),
            control_points: vec![PixelCorrection::default()],
        }
    }

    /// Create a correction with all control points set to the identity
    pub fn new(degree: u32, num_segments: Size) -> Result<Self> {
        Self::validate(degree, num_segments)?;
        let count = Self::control_point_count(degree, num_segments);
        Ok(Self {
            degree,
            num_segments,
            control_points: vec![PixelCorrection::default(); count],
        })
    }

    /// Create a correction from explicit control points, row-major
    pub fn from_control_points(
        degree: u32,
        num_segments: Size,
        control_points: Vec<PixelCorrection>,
    ) -> Result<Self> {
        Self::validate(degree, num_segments)?;
        let expected = Self::control_point_count(degree, num_segments);
        if control_points.len() != expected {
            return Err(Kinect3dError::invalid_argument(format!(
                "depth correction needs {} control points, got {}",
                expected,
                control_points.len()
            )));
        }
        Ok(Self {
            degree,
            num_segments,
            control_points,
        })
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    pub fn num_segments(&self) -> Size {
        self.num_segments
    }

    pub fn control_points(&self) -> &[PixelCorrection] {
        &self.control_points
    }

    /// A degree of zero marks the identity correction
    pub fn is_valid(&self) -> bool {
        self.degree > 0
    }

    /// Evaluate the correction at one pixel
    pub fn pixel_correction(&self, x: u32, y: u32, frame_size: Size) -> PixelCorrection {
        if !self.is_valid() {
            return PixelCorrection::default();
        }
        let deg = self.degree as i64;
        let (dx, dy) = self.spline_coords(x, y, frame_size);
        let stride = self.num_segments.width as usize + self.degree as usize;
        let rows = self.num_segments.height as usize + self.degree as usize;

        let mut scale = 0.0f64;
        let mut offset = 0.0f64;
        for i in 0..rows {
            let wy = basis(i as i64 - deg, deg, dy);
            if wy == 0.0 {
                continue;
            }
            for j in 0..stride {
                let w = wy * basis(j as i64 - deg, deg, dx);
                if w == 0.0 {
                    continue;
                }
                let cp = &self.control_points[i * stride + j];
                scale += w * cp.scale as f64;
                offset += w * cp.offset as f64;
            }
        }
        PixelCorrection {
            scale: scale as f32,
            offset: offset as f32,
        }
    }

    /// Evaluate the correction for every pixel of a frame, row-major
    ///
    /// Only the `degree + 1` basis functions that are nonzero over a pixel's
    /// knot span are evaluated, per axis, ahead of the pixel loop.
    pub fn pixel_correction_table(&self, frame_size: Size) -> Vec<PixelCorrection> {
        if !self.is_valid() {
            return vec![PixelCorrection::default(); frame_size.volume()];
        }
        let deg = self.degree as i64;
        let stride = self.num_segments.width as usize + self.degree as usize;

        let columns: Vec<(usize, Vec<f64>)> = (0..frame_size.width)
            .map(|x| {
                let dx = (x as f64 + 0.5) * self.num_segments.width as f64 / frame_size.width as f64;
                local_basis(dx, deg)
            })
            .collect();

        let mut table = Vec::with_capacity(frame_size.volume());
        for y in 0..frame_size.height {
            let dy = (y as f64 + 0.5) * self.num_segments.height as f64 / frame_size.height as f64;
            let (i0, wy) = local_basis(dy, deg);
            for (j0, wx) in &columns {
                let mut scale = 0.0f64;
                let mut offset = 0.0f64;
                for (bi, w_row) in wy.iter().enumerate() {
                    let row = (i0 + bi) * stride;
                    for (bj, w_col) in wx.iter().enumerate() {
                        let w = w_row * w_col;
                        let cp = &self.control_points[row + j0 + bj];
                        scale += w * cp.scale as f64;
                        offset += w * cp.offset as f64;
                    }
                }
                table.push(PixelCorrection {
                    scale: scale as f32,
                    offset: offset as f32,
                });
            }
        }
        table
    }

    /// Read a correction: `u32 degree, u32 segX, u32 segY, control points`
    pub fn read_from<R: Read>(reader: &mut WireReader<R>) -> Result<Self> {
        let degree = reader.read_u32()?;
        let seg_x = reader.read_u32()?;
        let seg_y = reader.read_u32()?;
        let num_segments = Size::new(seg_x, seg_y);
        if degree > MAX_DEGREE
            || seg_x > formats::MAX_FRAME_DIMENSION
            || seg_y > formats::MAX_FRAME_DIMENSION
        {
            return Err(Kinect3dError::protocol(format!(
                "implausible depth correction: degree {} over {} segments",
                degree, num_segments
            )));
        }
        Self::validate(degree, num_segments)?;
        let count = Self::control_point_count(degree, num_segments);
        // The count is untrusted until the points have actually been read
        let mut control_points = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let scale = reader.read_f32()?;
            let offset = reader.read_f32()?;
            control_points.push(PixelCorrection { scale, offset });
        }
        Ok(Self {
            degree,
            num_segments,
            control_points,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        writer.write_u32(self.degree)?;
        writer.write_u32(self.num_segments.width)?;
        writer.write_u32(self.num_segments.height)?;
        for cp in &self.control_points {
            writer.write_f32(cp.scale)?;
            writer.write_f32(cp.offset)?;
        }
        Ok(())
    }

    fn spline_coords(&self, x: u32, y: u32, frame_size: Size) -> (f64, f64) {
        (
            (x as f64 + 0.5) * self.num_segments.width as f64 / frame_size.width as f64,
            (y as f64 + 0.5) * self.num_segments.height as f64 / frame_size.height as f64,
        )
    }

    fn control_point_count(degree: u32, num_segments: Size) -> usize {
        (num_segments.width as usize + degree as usize)
            * (num_segments.height as usize + degree as usize)
    }

    fn validate(degree: u32, num_segments: Size) -> Result<()> {
        if degree > MAX_DEGREE {
            return Err(Kinect3dError::invalid_argument(format!(
                "depth correction degree {} exceeds {}",
                degree, MAX_DEGREE
            )));
        }
        if num_segments.width == 0 || num_segments.height == 0 {
            return Err(Kinect3dError::invalid_argument(
                "depth correction needs at least one segment per axis",
            ));
        }
        if num_segments.width > formats::MAX_FRAME_DIMENSION
            || num_segments.height > formats::MAX_FRAME_DIMENSION
        {
            return Err(Kinect3dError::invalid_argument(format!(
                "depth correction with {} segments exceeds the frame size limit",
                num_segments
            )));
        }
        Ok(())
    }
}

/// Uniform B-spline basis function of degree `n` with support `[i, i + n + 1)`
fn basis(i: i64, n: i64, x: f64) -> f64 {
    let lo = i as f64;
    if x < lo || x >= lo + n as f64 + 1.0 {
        return 0.0;
    }
    if n == 0 {
        return 1.0;
    }
    ((x - lo) * basis(i, n - 1, x) + (lo + n as f64 + 1.0 - x) * basis(i + 1, n - 1, x))
        / n as f64
}

/// Index of the first control point affecting `t` and the `n + 1` weights
fn local_basis(t: f64, n: i64) -> (usize, Vec<f64>) {
    let span = t.floor() as i64;
    let weights = (0..=n).map(|k| basis(span - n + k, n, t)).collect();
    // Control point index k corresponds to basis index k - n
    (span.max(0) as usize, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Cursor;

    fn wavy(degree: u32) -> DepthCorrection {
        let segments = Size::new(4, 3);
        let count = ((4 + degree) * (3 + degree)) as usize;
        let points = (0..count)
            .map(|i| PixelCorrection {
                scale: 1.0 + 0.01 * (i as f32 * 0.7).sin(),
                offset: 3.0 * (i as f32 * 0.3).cos(),
            })
            .collect();
        DepthCorrection::from_control_points(degree, segments, points).unwrap()
    }

    #[test]
    fn test_degree_zero_is_identity() {
        let dc = DepthCorrection::identity();
        assert!(!dc.is_valid());
        let size = Size::new(8, 6);
        for y in 0..size.height {
            for x in 0..size.width {
                let pc = dc.pixel_correction(x, y, size);
                assert_eq!(pc.apply(1234.0), 1234.0);
            }
        }
        assert!(
            dc.pixel_correction_table(size)
                .iter()
                .all(|pc| pc.apply(700.0) == 700.0)
        );
    }

    #[test]
    fn test_constant_control_points_reproduce_constant() {
        // Partition of unity: equal control points give the same value everywhere
        let dc = DepthCorrection::new(3, Size::new(5, 4)).unwrap();
        let size = Size::new(40, 30);
        for pc in dc.pixel_correction_table(size) {
            assert_abs_diff_eq!(pc.scale, 1.0, epsilon = 1e-5);
            assert_abs_diff_eq!(pc.offset, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_table_matches_single_queries() {
        let size = Size::new(32, 24);
        for degree in [1, 2, 3] {
            let dc = wavy(degree);
            let table = dc.pixel_correction_table(size);
            for y in (0..size.height).step_by(5) {
                for x in (0..size.width).step_by(3) {
                    let single = dc.pixel_correction(x, y, size);
                    let cached = table[size.index(x, y)];
                    assert_abs_diff_eq!(single.scale, cached.scale, epsilon = 1e-5);
                    assert_abs_diff_eq!(single.offset, cached.offset, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_degree_limit() {
        assert!(DepthCorrection::new(21, Size::new(1, 1)).is_err());
        assert!(DepthCorrection::new(20, Size::new(1, 1)).is_ok());
    }

    #[test]
    fn test_file_roundtrip_is_byte_identical() {
        let dc = wavy(2);
        let mut writer = WireWriter::new(Vec::new());
        dc.write_to(&mut writer).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 12 + 6 * 5 * 8);

        let read = DepthCorrection::read_from(&mut WireReader::new(Cursor::new(&bytes))).unwrap();
        assert_eq!(read, dc);

        let mut again = WireWriter::new(Vec::new());
        read.write_to(&mut again).unwrap();
        assert_eq!(again.into_inner(), bytes);
    }

    #[test]
    fn test_corrupt_header_is_protocol_error() {
        let header = |degree: u32, seg_x: u32, seg_y: u32| {
            let mut writer = WireWriter::new(Vec::new());
            writer.write_u32(degree).unwrap();
            writer.write_u32(seg_x).unwrap();
            writer.write_u32(seg_y).unwrap();
            writer.into_inner()
        };
        for bytes in [
            header(3, u32::MAX, u32::MAX),
            header(u32::MAX, 2, 2),
            // Plausible header, but the control points are missing
            header(3, 1 << 14, 1 << 14),
        ] {
            let err = DepthCorrection::read_from(&mut WireReader::new(Cursor::new(&bytes)))
                .unwrap_err();
            assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
        }
        assert!(DepthCorrection::new(1, Size::new(u32::MAX, 1)).is_err());
    }

    #[test]
    fn test_invert_pixel_correction() {
        let pc = PixelCorrection {
            scale: 1.05,
            offset: -12.0,
        };
        assert_abs_diff_eq!(pc.invert(pc.apply(800.0)), 800.0, epsilon = 1e-3);
    }
}
