// SPDX-License-Identifier: GPL-3.0-only

//! Depth frame to surface mesh projection
//!
//! A [`Projector`] turns every depth frame it is given into a triangle mesh
//! on its own processing thread:
//!
//! ```text
//! set_depth_frame ──► pending slot ──► [filter] ──► correct ──► triangulate
//!                                                                   │
//! set_color_frame ──► color triple buffer         mesh triple buffer ◄┘
//!                              │                         │
//!                              └──── update_frames ──────┘
//! ```
//!
//! The render side calls [`Projector::update_frames`] once per rendered
//! frame and then reads [`Projector::current_mesh`] and
//! [`Projector::current_color_frame`].

mod mesh;

pub use mesh::{MeshBuffer, quad_triangle_count};

use crate::backends::frame_loop::{LoopAction, StopSignal, StreamLoopController};
use crate::calibration::{
    DepthCorrection, ExtrinsicParameters, IntrinsicParameters, PixelCorrection,
};
use crate::constants::{INVALID_DEPTH, Size, projector};
use crate::errors::{Kinect3dError, Result};
use crate::frame::{FrameBuffer, TripleReader, TripleWriter, triple_buffer};
use crate::geometry::{Point3, ProjectiveTransform};
use mesh::{DepthFilterState, PixelTables, build_mesh};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Called on the processing thread with every new mesh
pub type MeshCallback = Box<dyn FnMut(&Arc<MeshBuffer>) + Send>;

/// Calibration state shared by the processing thread and the caller
struct Calibration {
    intrinsics: IntrinsicParameters,
    extrinsics: ExtrinsicParameters,
    depth_correction: Option<DepthCorrection>,
    triangle_depth_range: f32,
    /// Maps undistorted depth image space into world space
    world_transform: ProjectiveTransform,
    /// Rebuilt lazily for the size of the next frame
    tables: Option<Arc<PixelTables>>,
    /// Size of the most recent depth frame
    frame_size: Option<Size>,
}

impl Calibration {
    fn update_world_transform(&mut self) {
        self.world_transform = self
            .extrinsics
            .transform
            .compose(&self.intrinsics.depth_projection);
    }

    fn tables(&mut self, size: Size) -> Arc<PixelTables> {
        if let Some(tables) = &self.tables
            && tables.size == size
        {
            return Arc::clone(tables);
        }
        let corrections = match &self.depth_correction {
            Some(correction) => correction.pixel_correction_table(size),
            None => vec![PixelCorrection::default(); size.volume()],
        };
        debug!(%size, "Rebuilding projector pixel tables");
        self.frame_size = Some(size);
        let tables = Arc::new(PixelTables::new(size, &self.intrinsics, corrections));
        self.tables = Some(Arc::clone(&tables));
        tables
    }

    fn pixel_correction(&self, x: f64, y: f64) -> PixelCorrection {
        let (Some(correction), Some(size)) = (&self.depth_correction, self.frame_size) else {
            return PixelCorrection::default();
        };
        if size.width == 0 || size.height == 0 {
            return PixelCorrection::default();
        }
        let px = (x.floor().max(0.0) as u32).min(size.width - 1);
        let py = (y.floor().max(0.0) as u32).min(size.height - 1);
        correction.pixel_correction(px, py, size)
    }
}

#[derive(Default)]
struct Pending {
    frame: Option<FrameBuffer>,
    shutdown: bool,
}

struct Shared {
    calibration: Mutex<Calibration>,
    filter: Mutex<DepthFilterState>,
    pending: Mutex<Pending>,
    pending_ready: Condvar,
    mesh_writer: Mutex<TripleWriter<Option<Arc<MeshBuffer>>>>,
    mesh_reader: Mutex<TripleReader<Option<Arc<MeshBuffer>>>>,
    color_writer: Mutex<TripleWriter<FrameBuffer>>,
    color_reader: Mutex<TripleReader<FrameBuffer>>,
    version: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn process(&self, frame: &FrameBuffer) -> Result<MeshBuffer> {
        let depths = frame.as_depth().ok_or_else(|| {
            Kinect3dError::invalid_argument("projector needs a depth frame")
        })?;
        let size = frame.size();
        let (tables, color_projection, range) = {
            let mut calibration = lock(&self.calibration);
            let tables = calibration.tables(size);
            (
                tables,
                calibration.intrinsics.color_projection,
                calibration.triangle_depth_range,
            )
        };
        let filtered = lock(&self.filter).filter(size, depths);
        let mut mesh = build_mesh(&tables, &filtered, &color_projection, range);
        mesh.time_stamp = frame.time_stamp();
        mesh.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(mesh)
    }

    fn publish(&self, mesh: Arc<MeshBuffer>) {
        lock(&self.mesh_writer).post_new_value(Some(mesh));
    }
}

/// Converts depth frames into meshes on a background thread
pub struct Projector {
    shared: Arc<Shared>,
    processor: Mutex<Option<StreamLoopController>>,
}

impl Projector {
    pub fn new(intrinsics: IntrinsicParameters, extrinsics: ExtrinsicParameters) -> Self {
        let (mesh_writer, mesh_reader) = triple_buffer(None);
        let (color_writer, color_reader) = triple_buffer(FrameBuffer::invalid());
        let mut calibration = Calibration {
            intrinsics,
            extrinsics,
            depth_correction: None,
            triangle_depth_range: projector::DEFAULT_TRIANGLE_DEPTH_RANGE,
            world_transform: ProjectiveTransform::identity(),
            tables: None,
            frame_size: None,
        };
        calibration.update_world_transform();
        Self {
            shared: Arc::new(Shared {
                calibration: Mutex::new(calibration),
                filter: Mutex::new(DepthFilterState::new(projector::DEFAULT_TEMPORAL_ALPHA)),
                pending: Mutex::new(Pending::default()),
                pending_ready: Condvar::new(),
                mesh_writer: Mutex::new(mesh_writer),
                mesh_reader: Mutex::new(mesh_reader),
                color_writer: Mutex::new(color_writer),
                color_reader: Mutex::new(color_reader),
                version: AtomicU64::new(0),
            }),
            processor: Mutex::new(None),
        }
    }

    /// Build a projector from a frame source's calibration
    pub fn for_source(source: &dyn crate::backends::FrameSource) -> Self {
        let projector = Self::new(source.intrinsic_parameters(), source.extrinsic_parameters());
        projector.set_depth_correction(source.depth_correction_parameters());
        projector
    }

    pub fn set_intrinsics(&self, intrinsics: IntrinsicParameters) {
        let mut calibration = lock(&self.shared.calibration);
        calibration.intrinsics = intrinsics;
        calibration.tables = None;
        calibration.update_world_transform();
    }

    pub fn set_extrinsics(&self, extrinsics: ExtrinsicParameters) {
        let mut calibration = lock(&self.shared.calibration);
        calibration.extrinsics = extrinsics;
        calibration.update_world_transform();
    }

    /// Replace the per-pixel depth correction; `None` disables it
    pub fn set_depth_correction(&self, correction: Option<DepthCorrection>) {
        let mut calibration = lock(&self.shared.calibration);
        calibration.depth_correction = correction.filter(|c| c.is_valid());
        calibration.tables = None;
    }

    pub fn triangle_depth_range(&self) -> f32 {
        lock(&self.shared.calibration).triangle_depth_range
    }

    pub fn set_triangle_depth_range(&self, range: f32) -> Result<()> {
        if range.is_nan() || range <= 0.0 {
            return Err(Kinect3dError::invalid_argument(format!(
                "triangle depth range {} must be positive",
                range
            )));
        }
        lock(&self.shared.calibration).triangle_depth_range = range;
        Ok(())
    }

    /// Enable temporal and spatial low-pass filtering of incoming depth
    pub fn set_filter_depth_frames(&self, temporal: bool, spatial: bool) {
        let mut filter = lock(&self.shared.filter);
        if filter.temporal && !temporal {
            filter.reset();
        }
        filter.temporal = temporal;
        filter.spatial = spatial;
    }

    pub fn set_temporal_alpha(&self, alpha: f32) -> Result<()> {
        if alpha.is_nan() || alpha <= 0.0 || alpha > 1.0 {
            return Err(Kinect3dError::invalid_argument(format!(
                "temporal filter weight {} must be in (0, 1]",
                alpha
            )));
        }
        lock(&self.shared.filter).alpha = alpha;
        Ok(())
    }

    /// Convert one depth frame synchronously
    pub fn process_depth_frame(&self, frame: &FrameBuffer) -> Result<MeshBuffer> {
        self.shared.process(frame)
    }

    /// Hand a depth frame to the processing thread
    ///
    /// A frame that was not picked up yet is replaced.
    pub fn set_depth_frame(&self, frame: &FrameBuffer) {
        lock(&self.shared.pending).frame = Some(frame.clone());
        self.shared.pending_ready.notify_one();
    }

    pub fn set_color_frame(&self, frame: &FrameBuffer) {
        lock(&self.shared.color_writer).post_new_value(frame.clone());
    }

    /// Latch the most recent mesh and color frame; true if either changed
    pub fn update_frames(&self) -> bool {
        let mesh = lock(&self.shared.mesh_reader).lock_new_value();
        let color = lock(&self.shared.color_reader).lock_new_value();
        mesh || color
    }

    /// Mesh latched by the last `update_frames`
    pub fn current_mesh(&self) -> Option<Arc<MeshBuffer>> {
        lock(&self.shared.mesh_reader).locked_value().clone()
    }

    /// Color frame latched by the last `update_frames`
    pub fn current_color_frame(&self) -> FrameBuffer {
        lock(&self.shared.color_reader).locked_value().clone()
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.processor).is_some()
    }

    /// Start the processing thread
    pub fn start_streaming(&self, callback: Option<MeshCallback>) -> Result<()> {
        let mut processor = lock(&self.processor);
        if processor.is_some() {
            return Err(Kinect3dError::Busy);
        }
        *lock(&self.shared.pending) = Pending::default();

        let shared = Arc::clone(&self.shared);
        let mut callback = callback;
        let loop_fn = move |_: &StopSignal| -> Result<LoopAction> {
            let frame = {
                let mut pending = lock(&shared.pending);
                loop {
                    if pending.shutdown {
                        return Ok(LoopAction::Stop);
                    }
                    if let Some(frame) = pending.frame.take() {
                        break frame;
                    }
                    pending = shared
                        .pending_ready
                        .wait(pending)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };
            let mesh = match shared.process(&frame) {
                Ok(mesh) => Arc::new(mesh),
                Err(e) => {
                    warn!(error = %e, "Skipping frame the projector cannot process");
                    return Ok(LoopAction::Continue);
                }
            };
            shared.publish(Arc::clone(&mesh));
            if let Some(callback) = callback.as_mut() {
                callback(&mesh);
            }
            Ok(LoopAction::Continue)
        };
        *processor = Some(StreamLoopController::start("projector", loop_fn));
        info!("Projector started");
        Ok(())
    }

    /// Stop the processing thread; no mesh callback runs after this returns
    pub fn stop_streaming(&self) {
        let Some(mut controller) = lock(&self.processor).take() else {
            return;
        };
        controller.request_stop();
        lock(&self.shared.pending).shutdown = true;
        self.shared.pending_ready.notify_all();
        controller.join();
        info!("Projector stopped");
    }

    /// Depth image point `(x, y, raw depth)` that sees a world-space point
    ///
    /// Returns `None` when the world transform is singular.
    pub fn project_point(&self, world: Point3) -> Option<Point3> {
        let calibration = lock(&self.shared.calibration);
        let [ux, uy, corrected] = calibration.world_transform.inverse_transform(world)?;
        let [x, y] = calibration.intrinsics.distort_depth_pixel([ux, uy]);
        let raw = calibration
            .pixel_correction(x, y)
            .invert(corrected as f32);
        Some([x, y, raw as f64])
    }

    /// World-space point seen at distorted depth pixel position `(x, y)`
    pub fn unproject_pixel(&self, x: f64, y: f64, raw: f32) -> Point3 {
        let calibration = lock(&self.shared.calibration);
        let corrected = calibration.pixel_correction(x, y).apply(raw);
        let [ux, uy] = calibration.intrinsics.undistort_depth_pixel([x, y]);
        calibration
            .world_transform
            .transform([ux, uy, corrected as f64])
    }
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(IntrinsicParameters::default(), ExtrinsicParameters::identity())
    }
}

impl Drop for Projector {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

/// Count of valid depth pixels, matching the vertex count of a mesh
pub fn valid_pixel_count(frame: &FrameBuffer) -> usize {
    frame
        .as_depth()
        .map(|d| d.iter().filter(|&&v| v < INVALID_DEPTH).count())
        .unwrap_or(0)
}
