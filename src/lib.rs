// SPDX-License-Identifier: MPL-2.0

//! kinect3d - 3D video capture and calibration for consumer depth cameras
//!
//! This library ingests synchronized depth and color streams, corrects them
//! with per-device calibration data and turns depth frames into textured
//! surface meshes.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Frame sources (attached devices, recorded files, remote servers)
//! - [`calibration`]: Lens distortion, depth correction, intrinsics and tie-point fitting
//! - [`codecs`]: Binary stream, frame and calibration file formats
//! - [`frame`]: Shared frame buffers and the triple buffer hand-off
//! - [`geometry`]: Small dense matrices and projective transforms
//! - [`projector`]: Depth frame to mesh conversion
//! - [`config`]: JSON configuration
//!
//! # Example
//!
//! ```ignore
//! use kinect3d::backends::{FrameSource, file::FileFrameSource};
//! use kinect3d::projector::Projector;
//!
//! let mut source = FileFrameSource::open("scan.depth".as_ref(), "scan.color".as_ref())?;
//! let projector = std::sync::Arc::new(Projector::for_source(&source));
//! ```

pub mod backends;
pub mod calibration;
pub mod codecs;
pub mod config;
pub mod constants;
pub mod errors;
pub mod frame;
pub mod geometry;
pub mod projector;

// Re-export commonly used types
pub use backends::{FrameCallback, FrameSource};
pub use config::Config;
pub use constants::{DepthPixel, FrameKind, INVALID_DEPTH, Size};
pub use errors::{ErrorKind, Kinect3dError, Result};
pub use frame::{FrameBuffer, OwnedFrameBuffer};
pub use projector::{MeshBuffer, Projector};
