// SPDX-License-Identifier: GPL-3.0-only

//! Calibration and background files

use super::headers::read_codec_header;
use super::wire::{WireReader, WireWriter};
use crate::calibration::{
    DepthCorrection, IntrinsicParameters, LensDistortion, read_projection, write_projection,
};
use crate::constants::{DepthPixel, Size, file_names, formats};
use crate::errors::{Kinect3dError, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-pixel depth background
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundFile {
    pub size: Size,
    pub depths: Vec<DepthPixel>,
}

impl BackgroundFile {
    pub fn read_from<R: Read>(reader: &mut WireReader<R>) -> Result<Self> {
        let size = read_codec_header(reader)?;
        let bytes = reader.read_bytes(size.volume() * 2)?;
        let depths = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { size, depths })
    }

    pub fn write_to<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<()> {
        if self.depths.len() != self.size.volume() {
            return Err(Kinect3dError::invalid_argument(
                "background size does not match its sample count",
            ));
        }
        writer.write_u32(self.size.width)?;
        writer.write_u32(self.size.height)?;
        let bytes: Vec<u8> = self.depths.iter().flat_map(|d| d.to_le_bytes()).collect();
        writer.write_bytes(&bytes)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = open_existing(path)?;
        Self::read_from(&mut WireReader::new(BufReader::new(file)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = WireWriter::new(BufWriter::new(File::create(path)?));
        self.write_to(&mut writer)?;
        writer.flush()
    }
}

/// Layout an intrinsic parameter file was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicLayout {
    /// Depth and color projections only, no lens distortion
    Projections,
    /// Three radial and two tangential depth coefficients, then both projections
    Legacy,
    /// Magic number, full lens distortion of both cameras, then both projections
    Full,
}

/// Intrinsic parameter file codec
pub struct IntrinsicFile;

impl IntrinsicFile {
    /// Read a file of either layout, chosen by its length
    pub fn load(path: &Path) -> Result<(IntrinsicParameters, IntrinsicLayout)> {
        let file = open_existing(path)?;
        let len = file.metadata()?.len();
        let mut reader = WireReader::new(BufReader::new(file));
        if len == formats::PROJECTION_INTRINSIC_FILE_SIZE {
            Ok((
                Self::read_projections(&mut reader)?,
                IntrinsicLayout::Projections,
            ))
        } else if len == formats::LEGACY_INTRINSIC_FILE_SIZE {
            Ok((Self::read_legacy(&mut reader)?, IntrinsicLayout::Legacy))
        } else {
            Ok((Self::read_full(&mut reader)?, IntrinsicLayout::Full))
        }
    }

    pub fn read_projections<R: Read>(reader: &mut WireReader<R>) -> Result<IntrinsicParameters> {
        let depth_projection = read_projection(reader)?;
        let color_projection = read_projection(reader)?;
        Ok(IntrinsicParameters::new(
            LensDistortion::default(),
            depth_projection,
            LensDistortion::default(),
            color_projection,
        ))
    }

    pub fn read_legacy<R: Read>(reader: &mut WireReader<R>) -> Result<IntrinsicParameters> {
        let mut depth_lens = LensDistortion::default();
        for k in depth_lens.kappa.iter_mut().take(3) {
            *k = reader.read_f64()?;
        }
        for r in depth_lens.rho.iter_mut() {
            *r = reader.read_f64()?;
        }
        let depth_projection = read_projection(reader)?;
        let color_projection = read_projection(reader)?;
        Ok(IntrinsicParameters::new(
            depth_lens,
            depth_projection,
            LensDistortion::default(),
            color_projection,
        ))
    }

    pub fn read_full<R: Read>(reader: &mut WireReader<R>) -> Result<IntrinsicParameters> {
        let magic = reader.read_u32()?;
        if magic != formats::INTRINSIC_FILE_MAGIC {
            return Err(Kinect3dError::protocol(format!(
                "bad intrinsic parameter file magic {:#010x}",
                magic
            )));
        }
        let depth_lens = LensDistortion::read_from(reader, true)?;
        let color_lens = LensDistortion::read_from(reader, true)?;
        let depth_projection = read_projection(reader)?;
        let color_projection = read_projection(reader)?;
        Ok(IntrinsicParameters::new(
            depth_lens,
            depth_projection,
            color_lens,
            color_projection,
        ))
    }

    pub fn write_legacy<W: Write>(ips: &IntrinsicParameters, writer: &mut WireWriter<W>) -> Result<()> {
        let lens = &ips.depth_lens_distortion;
        writer.write_f64_slice(&lens.kappa[..3])?;
        writer.write_f64_slice(&lens.rho)?;
        write_projection(&ips.depth_projection, writer)?;
        write_projection(&ips.color_projection, writer)
    }

    pub fn write_full<W: Write>(ips: &IntrinsicParameters, writer: &mut WireWriter<W>) -> Result<()> {
        writer.write_u32(formats::INTRINSIC_FILE_MAGIC)?;
        ips.depth_lens_distortion.write_to(writer)?;
        ips.color_lens_distortion.write_to(writer)?;
        write_projection(&ips.depth_projection, writer)?;
        write_projection(&ips.color_projection, writer)
    }

    /// Replace `path` atomically, keeping the previous file as `<path>.backup`
    pub fn save(path: &Path, ips: &IntrinsicParameters, layout: IntrinsicLayout) -> Result<()> {
        let mut bytes = WireWriter::new(Vec::new());
        match layout {
            IntrinsicLayout::Projections => {
                write_projection(&ips.depth_projection, &mut bytes)?;
                write_projection(&ips.color_projection, &mut bytes)?
            }
            IntrinsicLayout::Legacy => Self::write_legacy(ips, &mut bytes)?,
            IntrinsicLayout::Full => Self::write_full(ips, &mut bytes)?,
        }
        write_atomically(path, &bytes.into_inner())
    }
}

/// Depth correction file codec
pub struct DepthCorrectionFile;

impl DepthCorrectionFile {
    pub fn load(path: &Path) -> Result<DepthCorrection> {
        let file = open_existing(path)?;
        DepthCorrection::read_from(&mut WireReader::new(BufReader::new(file)))
    }

    pub fn save(path: &Path, correction: &DepthCorrection) -> Result<()> {
        let mut bytes = WireWriter::new(Vec::new());
        correction.write_to(&mut bytes)?;
        write_atomically(path, &bytes.into_inner())
    }
}

/// Write through a temporary sibling and rename it over `path`
///
/// An existing file is first copied to `<path>.backup`.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if path.exists() {
        let backup = append_suffix(path, file_names::BACKUP_SUFFIX);
        info!(path = %path.display(), backup = %backup.display(), "Backing up existing calibration file");
        fs::copy(path, &backup)?;
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let temp = append_suffix(path, ".tmp");
    {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp, path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "Calibration file written");
    Ok(())
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn open_existing(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Kinect3dError::NotFound(path.display().to_string())
        } else {
            e.into()
        }
    })
}

/// `<dir>/<prefix><serial><suffix>`
pub fn calibration_file_name(dir: &Path, prefix: &str, serial: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}{}{}", prefix, serial, suffix))
}

/// Extract the serial number between a fixed prefix and suffix
///
/// The prefix may be preceded by arbitrary text, so `fooBackground-123.background`
/// yields `123` for prefix `Background-`.
pub fn serial_from_file_name<'a>(name: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let start = name.rfind(prefix)? + prefix.len();
    let rest = name.get(start..)?;
    let serial = rest.strip_suffix(suffix)?;
    (!serial.is_empty()).then_some(serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ProjectiveTransform;
    use std::io::Cursor;

    #[test]
    fn test_background_roundtrip_is_byte_identical() {
        let bg = BackgroundFile {
            size: Size::new(3, 2),
            depths: vec![1000, 998, 2047, 0, 5, 600],
        };
        let mut writer = WireWriter::new(Vec::new());
        bg.write_to(&mut writer).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 8 + 12);

        let read = BackgroundFile::read_from(&mut WireReader::new(Cursor::new(&bytes))).unwrap();
        assert_eq!(read, bg);
        let mut again = WireWriter::new(Vec::new());
        read.write_to(&mut again).unwrap();
        assert_eq!(again.into_inner(), bytes);
    }

    #[test]
    fn test_corrupt_background_size_is_protocol_error() {
        for (width, height) in [(u32::MAX, u32::MAX), (0, 4), (640, 480)] {
            let mut writer = WireWriter::new(Vec::new());
            writer.write_u32(width).unwrap();
            writer.write_u32(height).unwrap();
            writer.write_bytes(&[0; 32]).unwrap();
            let bytes = writer.into_inner();
            let err = BackgroundFile::read_from(&mut WireReader::new(Cursor::new(&bytes)))
                .unwrap_err();
            assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
        }
    }

    #[test]
    fn test_projection_only_intrinsics_are_256_bytes() {
        let mut writer = WireWriter::new(Vec::new());
        write_projection(&ProjectiveTransform::scaling(2.0), &mut writer).unwrap();
        write_projection(&ProjectiveTransform::translation([1.0, 0.0, 0.0]), &mut writer).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len() as u64, formats::PROJECTION_INTRINSIC_FILE_SIZE);

        let read =
            IntrinsicFile::read_projections(&mut WireReader::new(Cursor::new(&bytes))).unwrap();
        assert!(read.depth_lens_distortion.is_identity());
        assert_eq!(read.depth_projection, ProjectiveTransform::scaling(2.0));
        assert_eq!(
            read.color_projection,
            ProjectiveTransform::translation([1.0, 0.0, 0.0])
        );
    }

    #[test]
    fn test_legacy_intrinsics_are_296_bytes() {
        let mut ips = IntrinsicParameters::default();
        ips.depth_lens_distortion.kappa[0] = 0.1;
        ips.set_color_projection(ProjectiveTransform::scaling(3.0));
        let mut writer = WireWriter::new(Vec::new());
        IntrinsicFile::write_legacy(&ips, &mut writer).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len() as u64, formats::LEGACY_INTRINSIC_FILE_SIZE);

        let read = IntrinsicFile::read_legacy(&mut WireReader::new(Cursor::new(&bytes))).unwrap();
        assert_eq!(read.depth_lens_distortion.kappa[0], 0.1);
        assert_eq!(read.color_projection, ips.color_projection);
    }

    #[test]
    fn test_serial_extraction() {
        assert_eq!(
            serial_from_file_name(
                "captureBackground-A00362A05362045A.background",
                file_names::BACKGROUND_PREFIX,
                file_names::BACKGROUND_SUFFIX
            ),
            Some("A00362A05362045A")
        );
        assert_eq!(
            serial_from_file_name("IntrinsicParameters-.dat", "IntrinsicParameters-", ".dat"),
            None
        );
        assert_eq!(serial_from_file_name("other.dat", "IntrinsicParameters-", ".dat"), None);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = BackgroundFile::load(Path::new("/nonexistent/Background-1.background")).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::NotFound);
    }
}
