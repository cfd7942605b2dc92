// SPDX-License-Identifier: GPL-3.0-only

//! Frame body codecs
//!
//! Every frame body is `f64 time_stamp; u32 payload_len; payload`:
//!
//! - lossless depth: raw deflate of row-delta coded little-endian `u16`
//! - lossy depth: raw deflate of a Y/Cb/Cr plane triple carrying 11-bit depth
//! - color: PNG-encoded RGB8

use super::wire::{WireReader, WireWriter};
use crate::constants::{DepthPixel, FrameKind, INVALID_DEPTH, Size};
use crate::errors::{Kinect3dError, Result};
use crate::frame::{FrameBuffer, OwnedFrameBuffer};
use image::ImageEncoder;
use std::io::{Read, Write};

/// Upper bound on a single compressed payload
const MAX_PAYLOAD_LEN: u32 = 64 << 20;

/// Neutral chroma value of the lossy depth carrier
const CR_NEUTRAL: u8 = 0x80;

/// Per-stream frame decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReader {
    Depth { size: Size },
    LossyDepth { size: Size },
    Color { size: Size },
}

impl FrameReader {
    pub fn for_depth(size: Size, lossy: bool) -> Self {
        if lossy {
            FrameReader::LossyDepth { size }
        } else {
            FrameReader::Depth { size }
        }
    }

    pub fn for_color(size: Size) -> Self {
        FrameReader::Color { size }
    }

    pub fn size(&self) -> Size {
        match *self {
            FrameReader::Depth { size }
            | FrameReader::LossyDepth { size }
            | FrameReader::Color { size } => size,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            FrameReader::Color { .. } => FrameKind::Color,
            _ => FrameKind::Depth,
        }
    }

    /// Decode the next frame; `None` at a clean end of stream
    pub fn read_next<R: Read>(&mut self, reader: &mut WireReader<R>) -> Result<Option<FrameBuffer>> {
        let Some(time_stamp) = reader.read_f64_or_eof()? else {
            return Ok(None);
        };
        let len = reader.read_u32()?;
        if len > MAX_PAYLOAD_LEN {
            return Err(Kinect3dError::protocol(format!(
                "frame payload of {} bytes exceeds limit",
                len
            )));
        }
        let payload = reader.read_bytes(len as usize)?;
        let size = self.size();

        let mut frame = match self {
            FrameReader::Depth { .. } => decode_depth(size, &payload)?,
            FrameReader::LossyDepth { .. } => decode_lossy_depth(size, &payload)?,
            FrameReader::Color { .. } => decode_color(size, &payload)?,
        };
        frame.set_time_stamp(time_stamp);
        Ok(Some(frame.into_shared()))
    }
}

/// Per-stream frame encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWriter {
    Depth { size: Size },
    LossyDepth { size: Size },
    Color { size: Size },
}

impl FrameWriter {
    pub fn for_depth(size: Size, lossy: bool) -> Self {
        if lossy {
            FrameWriter::LossyDepth { size }
        } else {
            FrameWriter::Depth { size }
        }
    }

    pub fn for_color(size: Size) -> Self {
        FrameWriter::Color { size }
    }

    pub fn size(&self) -> Size {
        match *self {
            FrameWriter::Depth { size }
            | FrameWriter::LossyDepth { size }
            | FrameWriter::Color { size } => size,
        }
    }

    pub fn write_frame<W: Write>(&mut self, frame: &FrameBuffer, writer: &mut WireWriter<W>) -> Result<()> {
        if frame.size() != self.size() {
            return Err(Kinect3dError::invalid_argument(format!(
                "frame of size {} written to a {} stream",
                frame.size(),
                self.size()
            )));
        }
        let payload = match self {
            FrameWriter::Depth { .. } => encode_depth(depth_samples(frame)?)?,
            FrameWriter::LossyDepth { .. } => encode_lossy_depth(depth_samples(frame)?)?,
            FrameWriter::Color { size } => encode_color(*size, frame)?,
        };
        writer.write_f64(frame.time_stamp())?;
        writer.write_u32(payload.len() as u32)?;
        writer.write_bytes(&payload)
    }
}

fn depth_samples(frame: &FrameBuffer) -> Result<&[DepthPixel]> {
    frame
        .as_depth()
        .ok_or_else(|| Kinect3dError::invalid_argument("depth stream needs a depth frame"))
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = libflate::deflate::Encoder::new(Vec::new());
    encoder.write_all(bytes)?;
    Ok(encoder.finish().into_result()?)
}

fn inflate(payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let decoder = libflate::deflate::Decoder::new(payload);
    let mut out = Vec::with_capacity(expected_len);
    // One extra byte is enough to detect an overlong payload
    decoder
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Kinect3dError::protocol(format!("corrupt frame payload: {}", e)))?;
    if out.len() != expected_len {
        return Err(Kinect3dError::protocol(format!(
            "frame payload inflated to {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

fn encode_depth(samples: &[DepthPixel]) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    let mut previous: DepthPixel = 0;
    for &d in samples {
        bytes.extend_from_slice(&d.wrapping_sub(previous).to_le_bytes());
        previous = d;
    }
    deflate(&bytes)
}

fn decode_depth(size: Size, payload: &[u8]) -> Result<OwnedFrameBuffer> {
    let bytes = inflate(payload, size.volume() * 2)?;
    let mut previous: DepthPixel = 0;
    let samples = bytes
        .chunks_exact(2)
        .map(|c| {
            previous = previous.wrapping_add(u16::from_le_bytes([c[0], c[1]]));
            previous
        })
        .collect();
    OwnedFrameBuffer::from_depth(size, samples)
        .ok_or_else(|| Kinect3dError::protocol("depth frame size mismatch"))
}

/// Map an 11-bit depth value onto a (Y, Cb, Cr) triple
fn depth_to_ycbcr(d: DepthPixel) -> [u8; 3] {
    let d = d.min(INVALID_DEPTH);
    [(d >> 3) as u8, (((d & 0x7) << 5) | 0x10) as u8, CR_NEUTRAL]
}

/// Recover the 11-bit depth value; tolerates Cb noise below 16
fn ycbcr_to_depth(y: u8, cb: u8) -> DepthPixel {
    ((y as u16) << 3) | ((cb as u16) >> 5)
}

fn encode_lossy_depth(samples: &[DepthPixel]) -> Result<Vec<u8>> {
    let n = samples.len();
    let mut planes = vec![0u8; n * 3];
    for (i, &d) in samples.iter().enumerate() {
        let [y, cb, cr] = depth_to_ycbcr(d);
        planes[i] = y;
        planes[n + i] = cb;
        planes[2 * n + i] = cr;
    }
    deflate(&planes)
}

fn decode_lossy_depth(size: Size, payload: &[u8]) -> Result<OwnedFrameBuffer> {
    let n = size.volume();
    let planes = inflate(payload, n * 3)?;
    let samples = (0..n).map(|i| ycbcr_to_depth(planes[i], planes[n + i])).collect();
    OwnedFrameBuffer::from_depth(size, samples)
        .ok_or_else(|| Kinect3dError::protocol("depth frame size mismatch"))
}

fn encode_color(size: Size, frame: &FrameBuffer) -> Result<Vec<u8>> {
    if frame.as_color().is_none() {
        return Err(Kinect3dError::invalid_argument("color stream needs a color frame"));
    }
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out).write_image(
        frame.as_bytes(),
        size.width,
        size.height,
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

fn decode_color(size: Size, payload: &[u8]) -> Result<OwnedFrameBuffer> {
    let image = image::load_from_memory_with_format(payload, image::ImageFormat::Png)?.into_rgb8();
    if image.width() != size.width || image.height() != size.height {
        return Err(Kinect3dError::protocol(format!(
            "color frame is {}x{}, stream declares {}",
            image.width(),
            image.height(),
            size
        )));
    }
    OwnedFrameBuffer::from_rgb_bytes(size, image.as_raw())
        .ok_or_else(|| Kinect3dError::protocol("color frame size mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorPixel;
    use std::io::Cursor;

    fn depth_frame(size: Size, t: f64) -> FrameBuffer {
        let samples = (0..size.volume())
            .map(|i| if i % 7 == 0 { INVALID_DEPTH } else { (i * 13 % 2000) as u16 })
            .collect();
        let mut owned = OwnedFrameBuffer::from_depth(size, samples).unwrap();
        owned.set_time_stamp(t);
        owned.into_shared()
    }

    #[test]
    fn test_overlong_payload_is_rejected() {
        let bomb = deflate(&vec![0u8; 8 << 20]).unwrap();
        assert!(bomb.len() < 64 << 10);
        let err = inflate(&bomb, 32).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
        assert_eq!(inflate(&deflate(&[5; 32]).unwrap(), 32).unwrap(), vec![5; 32]);
    }

    #[test]
    fn test_depth_frames_are_lossless() {
        let size = Size::new(16, 9);
        for lossy in [false, true] {
            let frame = depth_frame(size, 0.5);
            let mut writer = WireWriter::new(Vec::new());
            let mut encoder = FrameWriter::for_depth(size, lossy);
            encoder.write_frame(&frame, &mut writer).unwrap();
            encoder.write_frame(&frame.with_time_stamp(0.6), &mut writer).unwrap();

            let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
            let mut decoder = FrameReader::for_depth(size, lossy);
            let first = decoder.read_next(&mut reader).unwrap().unwrap();
            assert_eq!(first.as_depth(), frame.as_depth());
            assert_eq!(first.time_stamp(), 0.5);
            let second = decoder.read_next(&mut reader).unwrap().unwrap();
            assert_eq!(second.time_stamp(), 0.6);
            assert!(decoder.read_next(&mut reader).unwrap().is_none());
        }
    }

    #[test]
    fn test_lossy_mapping_tolerates_chroma_noise() {
        for d in [0u16, 1, 7, 8, 1023, 2046, INVALID_DEPTH] {
            let [y, cb, _] = depth_to_ycbcr(d);
            assert_eq!(ycbcr_to_depth(y, cb), d);
            assert_eq!(ycbcr_to_depth(y, cb.saturating_add(15)), d);
            assert_eq!(ycbcr_to_depth(y, cb.saturating_sub(16)), d);
        }
    }

    #[test]
    fn test_color_frame_roundtrip() {
        let size = Size::new(5, 3);
        let pixels = (0..15u8).map(|i| ColorPixel::new(i, 255 - i, i * 3)).collect();
        let mut owned = OwnedFrameBuffer::from_color(size, pixels).unwrap();
        owned.set_time_stamp(2.0);
        let frame = owned.into_shared();

        let mut writer = WireWriter::new(Vec::new());
        FrameWriter::for_color(size).write_frame(&frame, &mut writer).unwrap();
        let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
        let read = FrameReader::for_color(size).read_next(&mut reader).unwrap().unwrap();
        assert_eq!(read.as_color(), frame.as_color());
        assert_eq!(read.time_stamp(), 2.0);
    }

    #[test]
    fn test_truncated_frame_is_protocol_error() {
        let size = Size::new(4, 4);
        let mut writer = WireWriter::new(Vec::new());
        FrameWriter::for_depth(size, false)
            .write_frame(&depth_frame(size, 0.0), &mut writer)
            .unwrap();
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 3);
        let mut reader = WireReader::new(Cursor::new(bytes));
        let err = FrameReader::for_depth(size, false).read_next(&mut reader).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
    }

    #[test]
    fn test_wrong_size_rejected() {
        let frame = depth_frame(Size::new(2, 2), 0.0);
        let mut writer = WireWriter::new(Vec::new());
        assert!(
            FrameWriter::for_depth(Size::new(3, 3), false)
                .write_frame(&frame, &mut writer)
                .is_err()
        );
    }
}
