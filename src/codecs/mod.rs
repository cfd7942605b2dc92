// SPDX-License-Identifier: GPL-3.0-only

//! Binary on-disk and on-wire formats
//!
//! All integers and floats are little-endian unless a multiplexed peer
//! announced the opposite byte order.

pub mod files;
pub mod frames;
pub mod headers;
pub mod wire;

pub use files::{
    BackgroundFile, DepthCorrectionFile, IntrinsicFile, IntrinsicLayout, calibration_file_name,
    serial_from_file_name, write_atomically,
};
pub use frames::{FrameReader, FrameWriter};
pub use headers::{ColorStreamHeader, DepthCalibrationBlock, DepthStreamHeader, SubStreamHeader};
pub use wire::{ByteOrder, WireReader, WireWriter};
