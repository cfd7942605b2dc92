// SPDX-License-Identifier: GPL-3.0-only

//! Shared constants and small value types used across the toolkit

use serde::{Deserialize, Serialize};

/// Raw depth sample type
pub type DepthPixel = u16;

/// Depth value marking a missing or removed sample
pub const INVALID_DEPTH: DepthPixel = 0x07FF;

/// Kind of image produced by a frame source
///
/// The numeric value doubles as the `kind` part of a multiplexed frame id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Color image stream
    Color = 0,
    /// Depth image stream
    Depth = 1,
}

impl FrameKind {
    /// Get all frame kinds in wire order
    pub const ALL: [FrameKind; 2] = [FrameKind::Color, FrameKind::Depth];

    /// Get display name for the frame kind
    pub fn display_name(&self) -> &'static str {
        match self {
            FrameKind::Color => "color",
            FrameKind::Depth => "depth",
        }
    }

    /// Index of this kind inside a per-stream frame pair
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Decode the kind bit of a multiplexed frame id
    pub fn from_frame_id(frame_id: u32) -> Self {
        if frame_id & 1 == 0 {
            FrameKind::Color
        } else {
            FrameKind::Depth
        }
    }
}

/// Color space of a source's color stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    #[default]
    Rgb,
    YCbCr,
}

impl ColorSpace {
    pub const ALL: [ColorSpace; 2] = [ColorSpace::Rgb, ColorSpace::YCbCr];

    pub fn display_name(&self) -> &'static str {
        match self {
            ColorSpace::Rgb => "RGB",
            ColorSpace::YCbCr => "Y'CbCr",
        }
    }
}

/// Width and height of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels
    pub fn volume(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Row-major index of a pixel
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Range of raw depth values a source can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthRange {
    pub min: DepthPixel,
    pub max: DepthPixel,
}

impl DepthRange {
    /// Create a depth range, rejecting empty or inverted ranges
    pub fn new(min: DepthPixel, max: DepthPixel) -> crate::errors::Result<Self> {
        if min >= max {
            return Err(crate::errors::Kinect3dError::invalid_argument(format!(
                "depth range min {} must be below max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, depth: DepthPixel) -> bool {
        depth >= self.min && depth <= self.max
    }
}

impl Default for DepthRange {
    fn default() -> Self {
        Self {
            min: 0,
            max: INVALID_DEPTH - 1,
        }
    }
}

/// Depth correction limits
pub mod depth_correction {
    /// Highest supported B-spline degree
    pub const MAX_DEGREE: u32 = 20;
}

/// Multiplexed stream protocol constants
pub mod protocol {
    /// Endianness marker written by both peers during the handshake
    pub const ENDIAN_MARKER: u32 = 0x1234_5678;

    /// Endianness marker as seen from a peer with the opposite byte order
    pub const SWAPPED_ENDIAN_MARKER: u32 = 0x7856_3412;

    /// Protocol version spoken by the client
    pub const CLIENT_VERSION: u32 = 1;

    /// Message sent by the client before closing the connection
    pub const GOODBYE: u32 = 0;
}

/// Stream file format versions written by this crate
pub mod formats {
    /// Depth stream header version (B-spline correction, lossy flag, 10-coefficient lens)
    pub const DEPTH_STREAM_VERSION: u32 = 6;

    /// Color stream header version (lens distortion present)
    pub const COLOR_STREAM_VERSION: u32 = 2;

    /// Magic number introducing the full intrinsic parameter file layout ("K3D1")
    pub const INTRINSIC_FILE_MAGIC: u32 = 0x4B33_4431;

    /// Size in bytes of the legacy intrinsic parameter file
    pub const LEGACY_INTRINSIC_FILE_SIZE: u64 = (5 + 16 + 16) * 8;

    /// Largest frame or background width and height accepted from a file or stream
    pub const MAX_FRAME_DIMENSION: u32 = 1 << 14;

    /// Size in bytes of an intrinsic parameter file holding only the two projections
    pub const PROJECTION_INTRINSIC_FILE_SIZE: u64 = (16 + 16) * 8;
}

/// Calibration file naming
pub mod file_names {
    pub const INTRINSIC_PREFIX: &str = "IntrinsicParameters-";
    pub const INTRINSIC_SUFFIX: &str = ".dat";
    pub const BACKGROUND_PREFIX: &str = "Background-";
    pub const BACKGROUND_SUFFIX: &str = ".background";
    pub const DEPTH_CORRECTION_PREFIX: &str = "DepthCorrection-";
    pub const DEPTH_CORRECTION_SUFFIX: &str = ".dat";
    pub const BACKUP_SUFFIX: &str = ".backup";
}

/// Stream thread timing
pub mod timing {
    /// Interval at which streaming threads log frame counts
    pub const FRAME_LOG_INTERVAL: u64 = 30;

    /// Longest a closing session waits for its receive thread
    pub const RECEIVER_CLOSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
}

/// Background removal defaults
pub mod background {
    /// Depth units subtracted from a captured depth background
    pub const DEFAULT_FUZZ: u16 = 2;
}

/// Projector defaults
pub mod projector {
    /// Largest depth span a triangle may cover
    pub const DEFAULT_TRIANGLE_DEPTH_RANGE: f32 = 5.0;

    /// Default temporal low-pass weight of a new sample
    pub const DEFAULT_TEMPORAL_ALPHA: f32 = 1.0 / 16.0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_from_id() {
        assert_eq!(FrameKind::from_frame_id(0), FrameKind::Color);
        assert_eq!(FrameKind::from_frame_id(3), FrameKind::Depth);
        assert_eq!(FrameKind::Depth.index(), 1);
    }

    #[test]
    fn test_depth_range_validation() {
        assert!(DepthRange::new(10, 10).is_err());
        assert!(DepthRange::new(20, 10).is_err());
        let range = DepthRange::new(10, 20).unwrap();
        assert!(range.contains(15));
        assert!(!range.contains(21));
        assert_eq!(DepthRange::default().max, INVALID_DEPTH - 1);
    }
}
