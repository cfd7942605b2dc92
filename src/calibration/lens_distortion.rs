// SPDX-License-Identifier: GPL-3.0-only

//! Radial and tangential lens distortion
//!
//! The model works in tangent space, relative to a distortion center:
//!
//! ```text
//! x' = x * R(r²) + 2ρ₀xy + ρ₁(r² + 2x²)
//! y' = y * R(r²) + ρ₀(r² + 2y²) + 2ρ₁xy
//! R(r²) = (1 + κ₀r² + κ₁r⁴ + κ₂r⁶) / (1 + κ₃r² + κ₄r⁴ + κ₅r⁶)
//! ```
//!
//! `distort` evaluates the formula, `undistort` inverts it with Newton's method.

use crate::codecs::wire::{WireReader, WireWriter};
use crate::errors::Result;
use crate::geometry::{Affine2, Point2};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Newton iteration limit for `undistort`
const MAX_UNDISTORT_ITERATIONS: usize = 16;

/// Newton step size at which `undistort` stops
const UNDISTORT_TOLERANCE: f64 = 1e-9;

/// Lens distortion correction parameters of one camera
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LensDistortion {
    /// Distortion center in tangent space
    pub center: Point2,
    /// Radial coefficients; `κ₃..κ₅` form the rational denominator
    pub kappa: [f64; 6],
    /// Tangential coefficients
    pub rho: [f64; 2],
}

impl LensDistortion {
    /// True when every coefficient is zero; callers skip correction entirely
    pub fn is_identity(&self) -> bool {
        self.kappa.iter().all(|&k| k == 0.0) && self.rho.iter().all(|&r| r == 0.0)
    }

    /// True when only `κ0..κ2` and `ρ` are set around a zero center
    pub fn fits_legacy_layout(&self) -> bool {
        self.center == [0.0, 0.0] && self.kappa[3..].iter().all(|&k| k == 0.0)
    }

    /// Apply the forward distortion formula to a tangent-space point
    pub fn distort(&self, p: Point2) -> Point2 {
        let u = p[0] - self.center[0];
        let v = p[1] - self.center[1];
        let (fu, fv) = self.offsets(u, v);
        [fu + self.center[0], fv + self.center[1]]
    }

    /// Scale factor of the radial term at a tangent-space point
    pub fn radial_scale(&self, p: Point2) -> f64 {
        let u = p[0] - self.center[0];
        let v = p[1] - self.center[1];
        self.radial(u * u + v * v).0
    }

    /// Invert [`distort`](Self::distort) by Newton iteration
    pub fn undistort(&self, distorted: Point2) -> Point2 {
        if self.is_identity() {
            return distorted;
        }
        let target_u = distorted[0] - self.center[0];
        let target_v = distorted[1] - self.center[1];

        let mut u = target_u;
        let mut v = target_v;
        for _ in 0..MAX_UNDISTORT_ITERATIONS {
            let (fu, fv) = self.offsets(u, v);
            let ru = fu - target_u;
            let rv = fv - target_v;

            let [[j00, j01], [j10, j11]] = self.jacobian(u, v);
            let det = j00 * j11 - j01 * j10;
            if det == 0.0 || !det.is_finite() {
                break;
            }
            let du = (j11 * ru - j01 * rv) / det;
            let dv = (j00 * rv - j10 * ru) / det;
            u -= du;
            v -= dv;
            if (du * du + dv * dv).sqrt() < UNDISTORT_TOLERANCE {
                break;
            }
        }
        [u + self.center[0], v + self.center[1]]
    }

    /// Distort a point given in image space
    pub fn distort_pixel(&self, pixel: Point2, mapping: &PixelTangent) -> Point2 {
        mapping.to_pixel(self.distort(mapping.to_tangent(pixel)))
    }

    /// Undistort a point given in image space
    pub fn undistort_pixel(&self, pixel: Point2, mapping: &PixelTangent) -> Point2 {
        mapping.to_pixel(self.undistort(mapping.to_tangent(pixel)))
    }

    /// Undistort the center of pixel `(x, y)`
    pub fn undistort_pixel_center(&self, x: u32, y: u32, mapping: &PixelTangent) -> Point2 {
        self.undistort_pixel([x as f64 + 0.5, y as f64 + 0.5], mapping)
    }

    /// Read parameters from a stream
    ///
    /// The legacy layout (`new_format == false`) stores only three radial
    /// coefficients; the rational denominator then reads as zero.
    pub fn read_from<R: Read>(reader: &mut WireReader<R>, new_format: bool) -> Result<Self> {
        let mut result = LensDistortion::default();
        result.center[0] = reader.read_f64()?;
        result.center[1] = reader.read_f64()?;
        let radial_count = if new_format { 6 } else { 3 };
        for k in result.kappa.iter_mut().take(radial_count) {
            *k = reader.read_f64()?;
        }
        for r in result.rho.iter_mut() {
            *r = reader.read_f64()?;
        }
        Ok(result)
    }

    /// Write parameters in the 10-value layout
    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        writer.write_f64_slice(&self.center)?;
        writer.write_f64_slice(&self.kappa)?;
        writer.write_f64_slice(&self.rho)
    }

    /// Write parameters in the 7-value legacy layout, dropping `κ₃..κ₅`
    pub fn write_legacy_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        writer.write_f64_slice(&self.center)?;
        writer.write_f64_slice(&self.kappa[..3])?;
        writer.write_f64_slice(&self.rho)
    }

    fn radial(&self, r2: f64) -> (f64, f64) {
        let k = &self.kappa;
        let num = 1.0 + r2 * (k[0] + r2 * (k[1] + r2 * k[2]));
        let den = 1.0 + r2 * (k[3] + r2 * (k[4] + r2 * k[5]));
        let dnum = k[0] + r2 * (2.0 * k[1] + r2 * 3.0 * k[2]);
        let dden = k[3] + r2 * (2.0 * k[4] + r2 * 3.0 * k[5]);
        let r = num / den;
        let dr = (dnum * den - num * dden) / (den * den);
        (r, dr)
    }

    fn offsets(&self, u: f64, v: f64) -> (f64, f64) {
        let r2 = u * u + v * v;
        let (radial, _) = self.radial(r2);
        let [p0, p1] = self.rho;
        (
            u * radial + 2.0 * p0 * u * v + p1 * (r2 + 2.0 * u * u),
            v * radial + p0 * (r2 + 2.0 * v * v) + 2.0 * p1 * u * v,
        )
    }

    fn jacobian(&self, u: f64, v: f64) -> [[f64; 2]; 2] {
        let r2 = u * u + v * v;
        let (r, dr) = self.radial(r2);
        let [p0, p1] = self.rho;
        let cross = 2.0 * u * v * dr + 2.0 * p0 * u + 2.0 * p1 * v;
        [
            [r + 2.0 * u * u * dr + 2.0 * p0 * v + 6.0 * p1 * u, cross],
            [cross, r + 2.0 * v * v * dr + 6.0 * p0 * v + 2.0 * p1 * u],
        ]
    }
}

/// Affine relation between image space and tangent space
///
/// Pixel `(px, py)` maps to tangent space as
/// `ty = (py - cy) / fy`, `tx = (px - sk*ty - cx) / fx`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelTangent {
    pub fx: f64,
    pub sk: f64,
    pub cx: f64,
    pub fy: f64,
    pub cy: f64,
}

impl Default for PixelTangent {
    fn default() -> Self {
        Self {
            fx: 1.0,
            sk: 0.0,
            cx: 0.0,
            fy: 1.0,
            cy: 0.0,
        }
    }
}

impl PixelTangent {
    /// Extract the mapping from an image-to-tangent affine transform
    ///
    /// Returns `None` when the transform does not have the upper-triangular
    /// shape of a camera matrix or is singular.
    pub fn from_image_to_tangent(i2t: &Affine2) -> Option<Self> {
        let t2i = i2t.inverse()?;
        let [[fx, sk, cx], [zero, fy, cy]] = *t2i.rows();
        if zero.abs() > 1e-9 * fy.abs().max(1.0) || fx == 0.0 || fy == 0.0 {
            return None;
        }
        Some(Self { fx, sk, cx, fy, cy })
    }

    pub fn to_tangent(&self, pixel: Point2) -> Point2 {
        let ty = (pixel[1] - self.cy) / self.fy;
        let tx = (pixel[0] - self.sk * ty - self.cx) / self.fx;
        [tx, ty]
    }

    pub fn to_pixel(&self, tangent: Point2) -> Point2 {
        [
            tangent[0] * self.fx + tangent[1] * self.sk + self.cx,
            tangent[1] * self.fy + self.cy,
        ]
    }

    pub fn image_to_tangent(&self) -> Affine2 {
        let ify = 1.0 / self.fy;
        let ifx = 1.0 / self.fx;
        Affine2::from_rows([
            [ifx, -self.sk * ify * ifx, (self.sk * self.cy * ify - self.cx) * ifx],
            [0.0, ify, -self.cy * ify],
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Cursor;

    fn kinect_like() -> LensDistortion {
        LensDistortion {
            center: [0.002, -0.001],
            kappa: [0.12, -0.25, 0.08, 0.01, -0.002, 0.0005],
            rho: [0.0012, -0.0008],
        }
    }

    fn mapping() -> PixelTangent {
        PixelTangent {
            fx: 580.0,
            sk: 0.3,
            cx: 319.5,
            fy: 578.0,
            cy: 239.5,
        }
    }

    #[test]
    fn test_identity_passthrough() {
        let ld = LensDistortion::default();
        assert!(ld.is_identity());
        assert_eq!(ld.undistort([0.3, -0.2]), [0.3, -0.2]);
        assert_eq!(ld.distort([0.3, -0.2]), [0.3, -0.2]);
    }

    #[test]
    fn test_pixel_roundtrip_across_image() {
        let ld = kinect_like();
        let map = mapping();
        for &(x, y) in &[(0.5, 0.5), (639.5, 0.5), (320.0, 240.0), (10.0, 470.0), (600.0, 400.0)] {
            let u = ld.undistort_pixel([x, y], &map);
            let d = ld.distort_pixel(u, &map);
            assert_abs_diff_eq!(d[0], x, epsilon = 1e-6);
            assert_abs_diff_eq!(d[1], y, epsilon = 1e-6);

            let d = ld.distort_pixel([x, y], &map);
            let u = ld.undistort_pixel(d, &map);
            assert_abs_diff_eq!(u[0], x, epsilon = 1e-6);
            assert_abs_diff_eq!(u[1], y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_legacy_format_zeroes_denominator() {
        let ld = kinect_like();
        let mut writer = WireWriter::new(Vec::new());
        ld.write_legacy_to(&mut writer).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 7 * 8);

        let mut reader = WireReader::new(Cursor::new(bytes));
        let read = LensDistortion::read_from(&mut reader, false).unwrap();
        assert_eq!(read.kappa[..3], ld.kappa[..3]);
        assert_eq!(read.kappa[3..], [0.0; 3]);
        assert_eq!(read.rho, ld.rho);
    }

    #[test]
    fn test_pixel_tangent_affine_roundtrip() {
        let map = mapping();
        let back = PixelTangent::from_image_to_tangent(&map.image_to_tangent()).unwrap();
        assert_abs_diff_eq!(back.fx, map.fx, epsilon = 1e-9);
        assert_abs_diff_eq!(back.sk, map.sk, epsilon = 1e-9);
        assert_abs_diff_eq!(back.cy, map.cy, epsilon = 1e-9);
    }
}
