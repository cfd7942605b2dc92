// SPDX-License-Identifier: MPL-2.0

//! Synthetic stream builders shared by the integration tests

#![allow(dead_code)]

use kinect3d::calibration::{ExtrinsicParameters, LensDistortion};
use kinect3d::codecs::{ColorStreamHeader, DepthStreamHeader, FrameWriter, WireWriter};
use kinect3d::geometry::ProjectiveTransform;
use kinect3d::{DepthPixel, OwnedFrameBuffer, Size};
use std::time::{Duration, Instant};

pub fn depth_header(size: Size) -> DepthStreamHeader {
    DepthStreamHeader::new(
        None,
        false,
        LensDistortion::default(),
        ProjectiveTransform::identity(),
        ExtrinsicParameters::identity(),
        size,
    )
}

pub fn color_header(size: Size) -> ColorStreamHeader {
    ColorStreamHeader::new(
        LensDistortion::default(),
        ProjectiveTransform::identity(),
        ExtrinsicParameters::identity(),
        size,
    )
}

/// Depth stream file bytes, frames `interval` seconds apart
pub fn depth_stream(size: Size, frames: &[Vec<DepthPixel>], interval: f64) -> Vec<u8> {
    let mut writer = WireWriter::new(Vec::new());
    depth_header(size).write_to(&mut writer).unwrap();
    let mut frame_writer = FrameWriter::for_depth(size, false);
    for (i, depths) in frames.iter().enumerate() {
        let mut frame = OwnedFrameBuffer::from_depth(size, depths.clone()).unwrap();
        frame.set_time_stamp(i as f64 * interval);
        frame_writer
            .write_frame(&frame.into_shared(), &mut writer)
            .unwrap();
    }
    writer.into_inner()
}

/// Color stream file bytes with `count` black frames
pub fn color_stream(size: Size, count: usize, interval: f64) -> Vec<u8> {
    let mut writer = WireWriter::new(Vec::new());
    color_header(size).write_to(&mut writer).unwrap();
    let mut frame_writer = FrameWriter::for_color(size);
    for i in 0..count {
        let mut frame = OwnedFrameBuffer::color(size);
        frame.set_time_stamp(i as f64 * interval);
        frame_writer
            .write_frame(&frame.into_shared(), &mut writer)
            .unwrap();
    }
    writer.into_inner()
}

/// Poll `condition` for up to five seconds
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}
