// SPDX-License-Identifier: GPL-3.0-only

//! Replay of recorded depth and color stream files
//!
//! One thread per stream decodes frames and, in real-time mode, sleeps until
//! each frame's time stamp is due. Depth frames can pass through a
//! per-pixel background filter built from the stream itself.

use super::frame_loop::{LoopAction, StopSignal, StreamLoopController};
use super::{FrameCallback, FrameSource};
use crate::calibration::{DepthCorrection, ExtrinsicParameters, IntrinsicParameters};
use crate::codecs::files::open_existing;
use crate::codecs::{
    BackgroundFile, ColorStreamHeader, DepthStreamHeader, FrameReader, WireReader,
};
use crate::constants::{DepthPixel, FrameKind, INVALID_DEPTH, Size, background, timing};
use crate::errors::{Kinect3dError, Result};
use crate::frame::{FrameBuffer, OwnedFrameBuffer};
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

type BoxedReader = Box<dyn Read + Send>;

/// Callback run once when a capture or a whole replay finishes
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

struct StreamInput {
    reader: WireReader<BoxedReader>,
    frames: FrameReader,
}

struct BackgroundCapture {
    remaining: usize,
    minimum: Vec<DepthPixel>,
    replace: bool,
    on_complete: Option<CompletionCallback>,
}

/// Depth-side filtering applied before frames reach the callback
struct DepthFilter {
    size: Size,
    background: Option<Vec<DepthPixel>>,
    remove_background: bool,
    fuzz: DepthPixel,
    max_depth: Option<DepthPixel>,
    capture: Option<BackgroundCapture>,
}

impl DepthFilter {
    fn new(size: Size) -> Self {
        Self {
            size,
            background: None,
            remove_background: false,
            fuzz: background::DEFAULT_FUZZ,
            max_depth: None,
            capture: None,
        }
    }

    fn is_active(&self) -> bool {
        self.capture.is_some()
            || self.max_depth.is_some()
            || (self.remove_background && self.background.is_some())
    }

    fn apply(&mut self, depths: &mut [DepthPixel]) {
        if let Some(capture) = self.capture.as_mut() {
            for (m, &d) in capture.minimum.iter_mut().zip(depths.iter()) {
                *m = (*m).min(d);
            }
            capture.remaining -= 1;
            if capture.remaining == 0 {
                self.finish_capture();
            }
        }

        if let Some(max_depth) = self.max_depth {
            for d in depths.iter_mut().filter(|d| **d > max_depth) {
                *d = INVALID_DEPTH;
            }
        }

        if self.remove_background
            && let Some(bg) = &self.background
        {
            for (d, &b) in depths.iter_mut().zip(bg) {
                if *d >= b {
                    *d = INVALID_DEPTH;
                }
            }
        }
    }

    fn finish_capture(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        let fuzz = self.fuzz;
        let mut captured: Vec<DepthPixel> = capture
            .minimum
            .into_iter()
            .map(|m| if m >= INVALID_DEPTH { m } else { m.saturating_sub(fuzz) })
            .collect();
        if !capture.replace
            && let Some(existing) = &self.background
        {
            for (c, &e) in captured.iter_mut().zip(existing) {
                *c = (*c).min(e);
            }
        }
        self.background = Some(captured);
        self.remove_background = true;
        info!(size = %self.size, "Depth background captured");
        if let Some(on_complete) = capture.on_complete {
            on_complete();
        }
    }
}

/// Shared real-time pacing anchor of both streams
#[derive(Default)]
struct Pacing {
    anchor: Mutex<Option<Instant>>,
}

impl Pacing {
    /// Instant at which a frame with `time_stamp` is due
    fn due(&self, time_stamp: f64) -> Instant {
        let mut anchor = self.anchor.lock().unwrap_or_else(|e| e.into_inner());
        let offset = Duration::try_from_secs_f64(time_stamp.max(0.0)).unwrap_or(Duration::ZERO);
        let start = *anchor.get_or_insert_with(|| {
            let now = Instant::now();
            now.checked_sub(offset).unwrap_or(now)
        });
        start + offset
    }

    fn reset(&self, anchor: Option<Instant>) {
        *self.anchor.lock().unwrap_or_else(|e| e.into_inner()) = anchor;
    }
}

/// End-of-stream bookkeeping shared by both stream threads
#[derive(Default)]
struct Completion {
    streams_ended: AtomicUsize,
    on_end_of_stream: Mutex<Option<CompletionCallback>>,
}

impl Completion {
    fn stream_ended(&self) {
        if self.streams_ended.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            info!("Replay reached end of both streams");
            let callback = self
                .on_end_of_stream
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.streams_ended.load(Ordering::SeqCst) >= 2
    }
}

/// Frame source replaying a depth file and a color file
pub struct FileFrameSource {
    depth_header: DepthStreamHeader,
    color_header: ColorStreamHeader,
    depth_input: Arc<Mutex<StreamInput>>,
    color_input: Arc<Mutex<StreamInput>>,
    filter: Arc<Mutex<DepthFilter>>,
    pacing: Arc<Pacing>,
    completion: Arc<Completion>,
    time_base: Option<Instant>,
    realtime: bool,
    streams: Vec<StreamLoopController>,
}

impl std::fmt::Debug for FileFrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFrameSource")
            .field("depth_header", &self.depth_header)
            .field("color_header", &self.color_header)
            .field("realtime", &self.realtime)
            .finish_non_exhaustive()
    }
}

impl FileFrameSource {
    /// Open a pair of stream files and read their headers
    pub fn open(depth_path: &Path, color_path: &Path) -> Result<Self> {
        info!(depth = %depth_path.display(), color = %color_path.display(), "Opening stream files");
        let depth = BufReader::new(open_existing(depth_path)?);
        let color = BufReader::new(open_existing(color_path)?);
        Self::from_readers(depth, color)
    }

    /// Read both stream headers and position the readers at the first frame
    pub fn from_readers<D, C>(depth: D, color: C) -> Result<Self>
    where
        D: Read + Send + 'static,
        C: Read + Send + 'static,
    {
        let mut depth_reader = WireReader::new(Box::new(depth) as BoxedReader);
        let mut color_reader = WireReader::new(Box::new(color) as BoxedReader);
        let depth_header = DepthStreamHeader::read_from(&mut depth_reader)?;
        let color_header = ColorStreamHeader::read_from(&mut color_reader)?;
        debug!(
            depth_version = depth_header.version,
            color_version = color_header.version,
            depth_size = %depth_header.frame_size,
            color_size = %color_header.frame_size,
            lossy = depth_header.calibration.lossy,
            "Read stream headers"
        );

        let depth_frames =
            FrameReader::for_depth(depth_header.frame_size, depth_header.calibration.lossy);
        let color_frames = FrameReader::for_color(color_header.frame_size);
        Ok(Self {
            filter: Arc::new(Mutex::new(DepthFilter::new(depth_header.frame_size))),
            depth_input: Arc::new(Mutex::new(StreamInput {
                reader: depth_reader,
                frames: depth_frames,
            })),
            color_input: Arc::new(Mutex::new(StreamInput {
                reader: color_reader,
                frames: color_frames,
            })),
            depth_header,
            color_header,
            pacing: Arc::new(Pacing::default()),
            completion: Arc::new(Completion::default()),
            time_base: None,
            realtime: true,
            streams: Vec::new(),
        })
    }

    pub fn depth_header(&self) -> &DepthStreamHeader {
        &self.depth_header
    }

    pub fn color_header(&self) -> &ColorStreamHeader {
        &self.color_header
    }

    /// Deliver frames at their recorded pace (default) or as fast as possible
    pub fn set_realtime(&mut self, realtime: bool) {
        self.realtime = realtime;
    }

    /// Depth values above `max_depth` become invalid; `None` disables the clip
    pub fn set_max_depth(&self, max_depth: Option<DepthPixel>) {
        self.lock_filter().max_depth = max_depth;
    }

    /// Depth units subtracted from a captured background
    pub fn set_background_removal_fuzz(&self, fuzz: DepthPixel) {
        self.lock_filter().fuzz = fuzz;
    }

    /// Build a background from the per-pixel minimum of the next `frames`
    /// depth frames
    ///
    /// With `replace` unset the result is merged into an existing background.
    /// Background removal is switched on once the capture completes.
    pub fn capture_background(
        &self,
        frames: usize,
        replace: bool,
        on_complete: Option<CompletionCallback>,
    ) -> Result<()> {
        if frames == 0 {
            return Err(Kinect3dError::invalid_argument(
                "background capture needs at least one frame",
            ));
        }
        let mut filter = self.lock_filter();
        info!(frames, replace, "Capturing depth background");
        filter.capture = Some(BackgroundCapture {
            remaining: frames,
            minimum: vec![INVALID_DEPTH; filter.size.volume()],
            replace,
            on_complete,
        });
        Ok(())
    }

    pub fn is_capturing_background(&self) -> bool {
        self.lock_filter().capture.is_some()
    }

    pub fn set_remove_background(&self, remove: bool) {
        self.lock_filter().remove_background = remove;
    }

    pub fn background(&self) -> Option<Vec<DepthPixel>> {
        self.lock_filter().background.clone()
    }

    pub fn load_background(&self, path: &Path) -> Result<()> {
        let file = BackgroundFile::load(path)?;
        let mut filter = self.lock_filter();
        if file.size != filter.size {
            return Err(Kinect3dError::invalid_argument(format!(
                "background of size {} does not fit {} depth frames",
                file.size, filter.size
            )));
        }
        info!(path = %path.display(), "Loaded depth background");
        filter.background = Some(file.depths);
        filter.remove_background = true;
        Ok(())
    }

    pub fn save_background(&self, path: &Path) -> Result<()> {
        let filter = self.lock_filter();
        let depths = filter
            .background
            .clone()
            .ok_or_else(|| Kinect3dError::NotFound("no depth background captured".into()))?;
        BackgroundFile {
            size: filter.size,
            depths,
        }
        .save(path)?;
        info!(path = %path.display(), "Saved depth background");
        Ok(())
    }

    /// Called once both streams reached their end
    pub fn set_end_of_stream_callback(&self, callback: CompletionCallback) {
        *self
            .completion
            .on_end_of_stream
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    pub fn is_streaming(&self) -> bool {
        self.streams.iter().any(|s| s.is_running())
    }

    pub fn is_faulted(&self) -> bool {
        self.streams.iter().any(|s| s.is_faulted())
    }

    fn lock_filter(&self) -> MutexGuard<'_, DepthFilter> {
        self.filter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_stream(
        &self,
        kind: FrameKind,
        input: Arc<Mutex<StreamInput>>,
        mut callback: FrameCallback,
    ) -> StreamLoopController {
        let filter = Arc::clone(&self.filter);
        let pacing = self.realtime.then(|| Arc::clone(&self.pacing));
        let completion = Arc::clone(&self.completion);
        let reached_end = Arc::new(AtomicBool::new(false));
        let reached_end_loop = Arc::clone(&reached_end);
        let mut delivered: u64 = 0;
        let name = format!("replay-{}", kind.display_name().to_lowercase());

        let loop_fn = move |stop: &StopSignal| -> Result<LoopAction> {
            let frame = {
                let mut input = input.lock().unwrap_or_else(|e| e.into_inner());
                let StreamInput { reader, frames } = &mut *input;
                frames.read_next(reader)?
            };
            let Some(frame) = frame else {
                reached_end_loop.store(true, Ordering::SeqCst);
                return Ok(LoopAction::Stop);
            };

            if let Some(pacing) = &pacing
                && stop.sleep_until(pacing.due(frame.time_stamp()))
            {
                return Ok(LoopAction::Stop);
            }

            let frame = match kind {
                FrameKind::Depth => filter_depth(&filter, frame),
                FrameKind::Color => frame,
            };
            callback(&frame);
            delivered += 1;
            if delivered % timing::FRAME_LOG_INTERVAL == 0 {
                debug!(kind = ?kind, frames = delivered, "Replayed frames");
            }
            Ok(LoopAction::Continue)
        };
        let on_exit = move || {
            if reached_end.load(Ordering::SeqCst) {
                completion.stream_ended();
            }
        };
        StreamLoopController::start_with_exit(&name, loop_fn, on_exit)
    }
}

fn filter_depth(filter: &Mutex<DepthFilter>, frame: FrameBuffer) -> FrameBuffer {
    let mut filter = filter.lock().unwrap_or_else(|e| e.into_inner());
    if !filter.is_active() || frame.size() != filter.size {
        return frame;
    }
    let Some(depths) = frame.as_depth() else {
        return frame;
    };
    let mut depths = depths.to_vec();
    filter.apply(&mut depths);
    match OwnedFrameBuffer::from_depth(frame.size(), depths) {
        Some(mut owned) => {
            owned.set_time_stamp(frame.time_stamp());
            owned.into_shared()
        }
        None => frame,
    }
}

impl FrameSource for FileFrameSource {
    fn intrinsic_parameters(&self) -> IntrinsicParameters {
        IntrinsicParameters::new(
            self.depth_header.calibration.lens_distortion,
            self.depth_header.depth_projection,
            self.color_header.lens_distortion,
            self.color_header.color_projection,
        )
    }

    fn extrinsic_parameters(&self) -> ExtrinsicParameters {
        self.depth_header.extrinsics
    }

    fn depth_correction_parameters(&self) -> Option<DepthCorrection> {
        self.depth_header.calibration.depth_correction.clone()
    }

    fn actual_frame_size(&self, kind: FrameKind) -> Size {
        match kind {
            FrameKind::Color => self.color_header.frame_size,
            FrameKind::Depth => self.depth_header.frame_size,
        }
    }

    fn start_streaming(&mut self, color: FrameCallback, depth: FrameCallback) -> Result<()> {
        if !self.streams.is_empty() {
            return Err(Kinect3dError::Busy);
        }
        self.pacing.reset(self.time_base);
        let color_input = Arc::clone(&self.color_input);
        let depth_input = Arc::clone(&self.depth_input);
        self.streams = vec![
            self.spawn_stream(FrameKind::Color, color_input, color),
            self.spawn_stream(FrameKind::Depth, depth_input, depth),
        ];
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        for stream in &self.streams {
            stream.request_stop();
        }
        for mut stream in self.streams.drain(..) {
            stream.join();
        }
        Ok(())
    }

    /// Frames are due at `time_base + time_stamp`; without a time base the
    /// first frame of a session is due immediately
    fn set_time_base(&mut self, time_base: Instant) {
        self.time_base = Some(time_base);
    }
}

impl Drop for FileFrameSource {
    fn drop(&mut self) {
        let _ = self.stop_streaming();
    }
}
