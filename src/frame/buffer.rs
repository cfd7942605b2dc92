// SPDX-License-Identifier: GPL-3.0-only

//! Reference-counted frame buffers
//!
//! A frame is built in an [`OwnedFrameBuffer`], which is the only place pixel
//! data can be written. Converting it into a [`FrameBuffer`] publishes it:
//! from then on the payload is shared through an atomically counted
//! allocation and can no longer be mutated.

use crate::constants::{DepthPixel, FrameKind, Size};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

/// One color sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct ColorPixel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorPixel {
    pub const BLACK: ColorPixel = ColorPixel { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn channels(&self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

/// Shared pixel payload of a published frame
#[derive(Debug, Clone)]
enum SharedPixels {
    Depth(Arc<[DepthPixel]>),
    Color(Arc<[ColorPixel]>),
}

/// Immutable, cheaply cloned handle to a frame
///
/// A default-constructed handle is *cleared*: it carries no payload at all,
/// which is distinct from a valid frame of size zero.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    size: Size,
    time_stamp: f64,
    pixels: Option<SharedPixels>,
}

impl FrameBuffer {
    /// The cleared handle
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.pixels.is_some()
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Seconds since the producing source's time base
    pub fn time_stamp(&self) -> f64 {
        self.time_stamp
    }

    pub fn kind(&self) -> Option<FrameKind> {
        match self.pixels {
            Some(SharedPixels::Depth(_)) => Some(FrameKind::Depth),
            Some(SharedPixels::Color(_)) => Some(FrameKind::Color),
            None => None,
        }
    }

    pub fn as_depth(&self) -> Option<&[DepthPixel]> {
        match &self.pixels {
            Some(SharedPixels::Depth(data)) => Some(data),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<&[ColorPixel]> {
        match &self.pixels {
            Some(SharedPixels::Color(data)) => Some(data),
            _ => None,
        }
    }

    /// Raw payload bytes in native layout
    pub fn as_bytes(&self) -> &[u8] {
        match &self.pixels {
            Some(SharedPixels::Depth(data)) => bytemuck::cast_slice(data),
            Some(SharedPixels::Color(data)) => bytemuck::cast_slice(data),
            None => &[],
        }
    }

    /// Number of live handles sharing this payload
    pub fn ref_count(&self) -> usize {
        match &self.pixels {
            Some(SharedPixels::Depth(data)) => Arc::strong_count(data),
            Some(SharedPixels::Color(data)) => Arc::strong_count(data),
            None => 0,
        }
    }

    /// Same payload with a different timestamp
    pub fn with_time_stamp(&self, time_stamp: f64) -> Self {
        Self {
            size: self.size,
            time_stamp,
            pixels: self.pixels.clone(),
        }
    }

    /// True when both handles share one payload
    pub fn same_payload(&self, other: &FrameBuffer) -> bool {
        match (&self.pixels, &other.pixels) {
            (Some(SharedPixels::Depth(a)), Some(SharedPixels::Depth(b))) => Arc::ptr_eq(a, b),
            (Some(SharedPixels::Color(a)), Some(SharedPixels::Color(b))) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug)]
enum OwnedPixels {
    Depth(Vec<DepthPixel>),
    Color(Vec<ColorPixel>),
}

/// Writable frame that has not been published yet
#[derive(Debug)]
pub struct OwnedFrameBuffer {
    size: Size,
    time_stamp: f64,
    pixels: OwnedPixels,
}

impl OwnedFrameBuffer {
    /// Depth frame filled with `fill`
    pub fn depth(size: Size, fill: DepthPixel) -> Self {
        Self {
            size,
            time_stamp: 0.0,
            pixels: OwnedPixels::Depth(vec![fill; size.volume()]),
        }
    }

    /// Color frame filled with black
    pub fn color(size: Size) -> Self {
        Self {
            size,
            time_stamp: 0.0,
            pixels: OwnedPixels::Color(vec![ColorPixel::BLACK; size.volume()]),
        }
    }

    /// Wrap existing depth samples; the vector length must match the size
    pub fn from_depth(size: Size, data: Vec<DepthPixel>) -> Option<Self> {
        (data.len() == size.volume()).then_some(Self {
            size,
            time_stamp: 0.0,
            pixels: OwnedPixels::Depth(data),
        })
    }

    pub fn from_color(size: Size, data: Vec<ColorPixel>) -> Option<Self> {
        (data.len() == size.volume()).then_some(Self {
            size,
            time_stamp: 0.0,
            pixels: OwnedPixels::Color(data),
        })
    }

    /// Wrap tightly packed RGB8 bytes
    pub fn from_rgb_bytes(size: Size, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != size.volume() * 3 {
            return None;
        }
        let data = bytes
            .chunks_exact(3)
            .map(|c| ColorPixel::new(c[0], c[1], c[2]))
            .collect();
        Self::from_color(size, data)
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn set_time_stamp(&mut self, time_stamp: f64) {
        self.time_stamp = time_stamp;
    }

    pub fn depth_mut(&mut self) -> Option<&mut [DepthPixel]> {
        match &mut self.pixels {
            OwnedPixels::Depth(data) => Some(data),
            OwnedPixels::Color(_) => None,
        }
    }

    pub fn color_mut(&mut self) -> Option<&mut [ColorPixel]> {
        match &mut self.pixels {
            OwnedPixels::Color(data) => Some(data),
            OwnedPixels::Depth(_) => None,
        }
    }

    /// Publish the frame
    pub fn into_shared(self) -> FrameBuffer {
        let pixels = match self.pixels {
            OwnedPixels::Depth(data) => SharedPixels::Depth(data.into()),
            OwnedPixels::Color(data) => SharedPixels::Color(data.into()),
        };
        FrameBuffer {
            size: self.size,
            time_stamp: self.time_stamp,
            pixels: Some(pixels),
        }
    }
}

impl From<OwnedFrameBuffer> for FrameBuffer {
    fn from(owned: OwnedFrameBuffer) -> Self {
        owned.into_shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_and_drop_keep_payload() {
        let mut owned = OwnedFrameBuffer::depth(Size::new(4, 2), 100);
        owned.depth_mut().unwrap()[3] = 7;
        owned.set_time_stamp(1.25);
        let frame = owned.into_shared();
        assert_eq!(frame.ref_count(), 1);

        let copy = frame.clone();
        assert_eq!(frame.ref_count(), 2);
        assert!(copy.same_payload(&frame));
        drop(copy);

        assert_eq!(frame.ref_count(), 1);
        assert_eq!(frame.as_depth().unwrap()[3], 7);
        assert_eq!(frame.time_stamp(), 1.25);
    }

    #[test]
    fn test_zero_size_is_not_cleared() {
        let empty = OwnedFrameBuffer::depth(Size::new(0, 0), 0).into_shared();
        assert!(empty.is_valid());
        assert_eq!(empty.as_depth().unwrap().len(), 0);

        let cleared = FrameBuffer::invalid();
        assert!(!cleared.is_valid());
        assert_eq!(cleared.ref_count(), 0);
        assert!(cleared.as_bytes().is_empty());
    }

    #[test]
    fn test_typed_views() {
        let owned = OwnedFrameBuffer::from_rgb_bytes(Size::new(2, 1), &[1, 2, 3, 4, 5, 6]).unwrap();
        let frame: FrameBuffer = owned.into();
        assert_eq!(frame.kind(), Some(FrameKind::Color));
        assert!(frame.as_depth().is_none());
        assert_eq!(frame.as_color().unwrap()[1], ColorPixel::new(4, 5, 6));
        assert_eq!(frame.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        assert!(OwnedFrameBuffer::from_depth(Size::new(3, 3), vec![0; 8]).is_none());
    }
}
