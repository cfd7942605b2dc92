// SPDX-License-Identifier: GPL-3.0-only

//! Versioned depth and color stream headers
//!
//! Depth stream layout:
//!
//! ```text
//! u32 version
//! v >= 4: DepthCorrection
//! v 2..3: u8 flag [u32 w, u32 h, 2*w*h f32]   (legacy per-pixel data, skipped)
//! v >= 3: u8 lossy
//! v >= 5: depth LensDistortion (7 f64 for v5, 10 f64 from v6)
//! 16 f64 depth projection
//! 16 f64 extrinsic parameters
//! u32 width, u32 height                        (frame codec header)
//! ```
//!
//! Color streams carry `u32 version`, a color lens distortion from version 2,
//! the color projection, extrinsics and the frame codec header.

use super::wire::{WireReader, WireWriter};
use crate::calibration::{
    DepthCorrection, ExtrinsicParameters, LensDistortion, read_projection, write_projection,
};
use crate::constants::{Size, formats};
use crate::errors::{Kinect3dError, Result};
use crate::geometry::ProjectiveTransform;
use std::io::{Read, Write};
use tracing::debug;

/// Frame codec header: the size of every frame that follows
pub fn read_codec_header<R: Read>(reader: &mut WireReader<R>) -> Result<Size> {
    let width = reader.read_u32()?;
    let height = reader.read_u32()?;
    if width == 0
        || height == 0
        || width > formats::MAX_FRAME_DIMENSION
        || height > formats::MAX_FRAME_DIMENSION
    {
        return Err(Kinect3dError::protocol(format!(
            "implausible frame size {}x{}",
            width, height
        )));
    }
    Ok(Size::new(width, height))
}

pub fn write_codec_header<W: Write>(size: Size, writer: &mut WireWriter<W>) -> Result<()> {
    writer.write_u32(size.width)?;
    writer.write_u32(size.height)
}

/// Depth-side calibration block shared by depth files and multiplexed streams
#[derive(Debug, Clone, PartialEq)]
pub struct DepthCalibrationBlock {
    pub depth_correction: Option<DepthCorrection>,
    pub lossy: bool,
    pub lens_distortion: LensDistortion,
}

impl DepthCalibrationBlock {
    /// Read the version-gated fields that precede the projections
    pub fn read_from<R: Read>(version: u32, reader: &mut WireReader<R>) -> Result<Self> {
        let depth_correction = if version >= 4 {
            let dc = DepthCorrection::read_from(reader)?;
            dc.is_valid().then_some(dc)
        } else {
            if version >= 2 && reader.read_u8()? != 0 {
                skip_legacy_correction(reader)?;
            }
            None
        };

        let lossy = version >= 3 && reader.read_u8()? != 0;
        Ok(Self {
            depth_correction,
            lossy,
            lens_distortion: LensDistortion::default(),
        })
    }

    pub fn read_lens_distortion<R: Read>(
        &mut self,
        version: u32,
        reader: &mut WireReader<R>,
    ) -> Result<()> {
        if version >= 5 {
            self.lens_distortion = LensDistortion::read_from(reader, version >= 6)?;
        }
        Ok(())
    }

    /// Write the fields preceding the lens distortion at the current version
    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        match &self.depth_correction {
            Some(dc) => dc.write_to(writer)?,
            None => DepthCorrection::identity().write_to(writer)?,
        }
        writer.write_u8(u8::from(self.lossy))
    }
}

fn skip_legacy_correction<R: Read>(reader: &mut WireReader<R>) -> Result<()> {
    let width = reader.read_u32()?;
    let height = reader.read_u32()?;
    if width > formats::MAX_FRAME_DIMENSION || height > formats::MAX_FRAME_DIMENSION {
        return Err(Kinect3dError::protocol(format!(
            "implausible legacy depth correction size {}x{}",
            width, height
        )));
    }
    debug!(width, height, "Skipping legacy per-pixel depth correction");
    reader.skip(width as u64 * height as u64 * 2 * 4)
}

/// Header of a depth stream file
#[derive(Debug, Clone, PartialEq)]
pub struct DepthStreamHeader {
    pub version: u32,
    pub calibration: DepthCalibrationBlock,
    pub depth_projection: ProjectiveTransform,
    pub extrinsics: ExtrinsicParameters,
    pub frame_size: Size,
}

impl DepthStreamHeader {
    pub fn new(
        depth_correction: Option<DepthCorrection>,
        lossy: bool,
        lens_distortion: LensDistortion,
        depth_projection: ProjectiveTransform,
        extrinsics: ExtrinsicParameters,
        frame_size: Size,
    ) -> Self {
        Self {
            version: formats::DEPTH_STREAM_VERSION,
            calibration: DepthCalibrationBlock {
                depth_correction,
                lossy,
                lens_distortion,
            },
            depth_projection,
            extrinsics,
            frame_size,
        }
    }

    pub fn read_from<R: Read>(reader: &mut WireReader<R>) -> Result<Self> {
        let version = reader.read_u32()?;
        if version == 0 || version > formats::DEPTH_STREAM_VERSION {
            return Err(Kinect3dError::protocol(format!(
                "unsupported depth stream version {}",
                version
            )));
        }
        let mut calibration = DepthCalibrationBlock::read_from(version, reader)?;
        calibration.read_lens_distortion(version, reader)?;
        let depth_projection = read_projection(reader)?;
        let extrinsics = ExtrinsicParameters::read_from(reader)?;
        let frame_size = read_codec_header(reader)?;
        Ok(Self {
            version,
            calibration,
            depth_projection,
            extrinsics,
            frame_size,
        })
    }

    /// Write at the current format version
    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        writer.write_u32(formats::DEPTH_STREAM_VERSION)?;
        self.calibration.write_to(writer)?;
        self.calibration.lens_distortion.write_to(writer)?;
        write_projection(&self.depth_projection, writer)?;
        self.extrinsics.write_to(writer)?;
        write_codec_header(self.frame_size, writer)
    }
}

/// Header of a color stream file
#[derive(Debug, Clone, PartialEq)]
pub struct ColorStreamHeader {
    pub version: u32,
    pub lens_distortion: LensDistortion,
    pub color_projection: ProjectiveTransform,
    pub extrinsics: ExtrinsicParameters,
    pub frame_size: Size,
}

impl ColorStreamHeader {
    pub fn new(
        lens_distortion: LensDistortion,
        color_projection: ProjectiveTransform,
        extrinsics: ExtrinsicParameters,
        frame_size: Size,
    ) -> Self {
        Self {
            version: formats::COLOR_STREAM_VERSION,
            lens_distortion,
            color_projection,
            extrinsics,
            frame_size,
        }
    }

    pub fn read_from<R: Read>(reader: &mut WireReader<R>) -> Result<Self> {
        let version = reader.read_u32()?;
        if version == 0 || version > formats::COLOR_STREAM_VERSION {
            return Err(Kinect3dError::protocol(format!(
                "unsupported color stream version {}",
                version
            )));
        }
        let lens_distortion = if version >= 2 {
            LensDistortion::read_from(reader, true)?
        } else {
            LensDistortion::default()
        };
        let color_projection = read_projection(reader)?;
        let extrinsics = ExtrinsicParameters::read_from(reader)?;
        let frame_size = read_codec_header(reader)?;
        Ok(Self {
            version,
            lens_distortion,
            color_projection,
            extrinsics,
            frame_size,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        writer.write_u32(formats::COLOR_STREAM_VERSION)?;
        self.lens_distortion.write_to(writer)?;
        write_projection(&self.color_projection, writer)?;
        self.extrinsics.write_to(writer)?;
        write_codec_header(self.frame_size, writer)
    }
}

/// Per-stream header sent by a multiplexing server
///
/// ```text
/// u32 color_version, u32 depth_version
/// depth calibration block (as in depth files)
/// color_version >= 2: color LensDistortion (10 f64)
/// depth_version >= 5: depth LensDistortion
/// 16 f64 color projection, 16 f64 depth projection, 16 f64 extrinsics
/// color codec header, depth codec header
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SubStreamHeader {
    pub color_version: u32,
    pub depth_version: u32,
    pub depth: DepthCalibrationBlock,
    pub color_lens_distortion: LensDistortion,
    pub color_projection: ProjectiveTransform,
    pub depth_projection: ProjectiveTransform,
    pub extrinsics: ExtrinsicParameters,
    pub color_size: Size,
    pub depth_size: Size,
}

impl SubStreamHeader {
    pub fn read_from<R: Read>(reader: &mut WireReader<R>) -> Result<Self> {
        let color_version = reader.read_u32()?;
        let depth_version = reader.read_u32()?;
        if color_version > formats::COLOR_STREAM_VERSION
            || depth_version > formats::DEPTH_STREAM_VERSION
        {
            return Err(Kinect3dError::protocol(format!(
                "unsupported sub-stream versions color {} depth {}",
                color_version, depth_version
            )));
        }
        let mut depth = DepthCalibrationBlock::read_from(depth_version, reader)?;
        let color_lens_distortion = if color_version >= 2 {
            LensDistortion::read_from(reader, true)?
        } else {
            LensDistortion::default()
        };
        depth.read_lens_distortion(depth_version, reader)?;
        let color_projection = read_projection(reader)?;
        let depth_projection = read_projection(reader)?;
        let extrinsics = ExtrinsicParameters::read_from(reader)?;
        let color_size = read_codec_header(reader)?;
        let depth_size = read_codec_header(reader)?;
        Ok(Self {
            color_version,
            depth_version,
            depth,
            color_lens_distortion,
            color_projection,
            depth_projection,
            extrinsics,
            color_size,
            depth_size,
        })
    }

    /// Write at the current versions
    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        writer.write_u32(formats::COLOR_STREAM_VERSION)?;
        writer.write_u32(formats::DEPTH_STREAM_VERSION)?;
        self.depth.write_to(writer)?;
        self.color_lens_distortion.write_to(writer)?;
        self.depth.lens_distortion.write_to(writer)?;
        write_projection(&self.color_projection, writer)?;
        write_projection(&self.depth_projection, writer)?;
        self.extrinsics.write_to(writer)?;
        write_codec_header(self.color_size, writer)?;
        write_codec_header(self.depth_size, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::PixelCorrection;
    use std::io::Cursor;

    fn sample_depth_header() -> DepthStreamHeader {
        let dc = DepthCorrection::from_control_points(
            1,
            Size::new(2, 2),
            vec![
                PixelCorrection {
                    scale: 1.01,
                    offset: -2.0
                };
                9
            ],
        )
        .unwrap();
        DepthStreamHeader::new(
            Some(dc),
            false,
            LensDistortion {
                center: [0.01, 0.02],
                kappa: [0.1, 0.2, 0.3, 0.01, 0.02, 0.03],
                rho: [0.001, 0.002],
            },
            ProjectiveTransform::scaling(0.5),
            ExtrinsicParameters::new(ProjectiveTransform::translation([1.0, 2.0, 3.0])),
            Size::new(640, 480),
        )
    }

    #[test]
    fn test_depth_header_roundtrip_is_byte_identical() {
        let header = sample_depth_header();
        let mut writer = WireWriter::new(Vec::new());
        header.write_to(&mut writer).unwrap();
        let bytes = writer.into_inner();

        let read = DepthStreamHeader::read_from(&mut WireReader::new(Cursor::new(&bytes))).unwrap();
        assert_eq!(read, header);

        let mut again = WireWriter::new(Vec::new());
        read.write_to(&mut again).unwrap();
        assert_eq!(again.into_inner(), bytes);
    }

    #[test]
    fn test_color_header_roundtrip_is_byte_identical() {
        let header = ColorStreamHeader::new(
            LensDistortion::default(),
            ProjectiveTransform::scaling(2.0),
            ExtrinsicParameters::identity(),
            Size::new(320, 240),
        );
        let mut writer = WireWriter::new(Vec::new());
        header.write_to(&mut writer).unwrap();
        let bytes = writer.into_inner();

        let read = ColorStreamHeader::read_from(&mut WireReader::new(Cursor::new(&bytes))).unwrap();
        let mut again = WireWriter::new(Vec::new());
        read.write_to(&mut again).unwrap();
        assert_eq!(again.into_inner(), bytes);
    }

    #[test]
    fn test_version_three_skips_legacy_correction() {
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(3).unwrap();
        // Legacy per-pixel correction present: 2x1 pixels
        writer.write_u8(1).unwrap();
        writer.write_u32(2).unwrap();
        writer.write_u32(1).unwrap();
        for _ in 0..4 {
            writer.write_f32(9.0).unwrap();
        }
        writer.write_u8(1).unwrap(); // lossy
        writer
            .write_f64_slice(&ProjectiveTransform::identity().to_row_major())
            .unwrap();
        writer
            .write_f64_slice(&ProjectiveTransform::identity().to_row_major())
            .unwrap();
        writer.write_u32(2).unwrap();
        writer.write_u32(1).unwrap();

        let bytes = writer.into_inner();
        let header = DepthStreamHeader::read_from(&mut WireReader::new(Cursor::new(bytes))).unwrap();
        assert_eq!(header.version, 3);
        assert!(header.calibration.depth_correction.is_none());
        assert!(header.calibration.lossy);
        assert!(header.calibration.lens_distortion.is_identity());
        assert_eq!(header.frame_size, Size::new(2, 1));
    }

    #[test]
    fn test_version_five_reads_legacy_lens_layout() {
        let lens = LensDistortion {
            center: [0.0, 0.0],
            kappa: [0.1, 0.2, 0.3, 0.0, 0.0, 0.0],
            rho: [0.01, 0.02],
        };
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(5).unwrap();
        DepthCorrection::identity().write_to(&mut writer).unwrap();
        writer.write_u8(0).unwrap();
        lens.write_legacy_to(&mut writer).unwrap();
        writer
            .write_f64_slice(&ProjectiveTransform::identity().to_row_major())
            .unwrap();
        writer
            .write_f64_slice(&ProjectiveTransform::identity().to_row_major())
            .unwrap();
        writer.write_u32(4).unwrap();
        writer.write_u32(4).unwrap();

        let bytes = writer.into_inner();
        let header = DepthStreamHeader::read_from(&mut WireReader::new(Cursor::new(bytes))).unwrap();
        assert_eq!(header.calibration.lens_distortion, lens);
        // Degree-0 correction is dropped
        assert!(header.calibration.depth_correction.is_none());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(99).unwrap();
        let bytes = writer.into_inner();
        let err = DepthStreamHeader::read_from(&mut WireReader::new(Cursor::new(bytes))).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
    }

    #[test]
    fn test_oversized_legacy_correction_rejected() {
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(2).unwrap();
        writer.write_u8(1).unwrap();
        writer.write_u32(u32::MAX).unwrap();
        writer.write_u32(u32::MAX).unwrap();
        let bytes = writer.into_inner();
        let err = DepthStreamHeader::read_from(&mut WireReader::new(Cursor::new(bytes))).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
    }
}
