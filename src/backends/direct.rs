// SPDX-License-Identifier: GPL-3.0-only

//! Directly attached depth cameras
//!
//! Device SDKs sit behind the [`DeviceBackend`] trait and deliver raw
//! packets. [`DirectFrameSource`] owns one backend, runs the streaming
//! thread, decodes packets into frames and optionally removes a captured
//! color background.
//!
//! SDKs that need a single process-wide context share one [`DeviceContext`],
//! created on first use and released when the last source holding it drops.

use super::frame_loop::{LoopAction, StreamLoopController};
use super::{FrameCallback, FrameSource};
use crate::calibration::{DepthCorrection, ExtrinsicParameters, IntrinsicParameters};
use crate::constants::{ColorSpace, DepthPixel, DepthRange, FrameKind, INVALID_DEPTH, Size, timing};
use crate::errors::{Kinect3dError, Result};
use crate::frame::{ColorPixel, OwnedFrameBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Pixel layout of a raw device packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    /// Little-endian `u16` per depth sample
    Depth16,
    /// 11-bit depth samples packed MSB first
    Depth11Packed,
    /// Tightly packed RGB8
    Rgb8,
}

/// One frame's worth of data as delivered by a device SDK
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub format: PacketFormat,
    pub size: Size,
    pub data: Vec<u8>,
    /// Capture instant on the monotonic clock
    pub captured: Instant,
}

impl RawPacket {
    pub fn kind(&self) -> FrameKind {
        match self.format {
            PacketFormat::Rgb8 => FrameKind::Color,
            PacketFormat::Depth16 | PacketFormat::Depth11Packed => FrameKind::Depth,
        }
    }

    /// Decode into an unpublished frame
    pub fn decode(&self) -> Result<OwnedFrameBuffer> {
        let volume = self.size.volume();
        let mismatch = || {
            Kinect3dError::Device(format!(
                "{:?} packet of {} bytes does not match {} frame",
                self.format,
                self.data.len(),
                self.size
            ))
        };
        let frame = match self.format {
            PacketFormat::Depth16 => {
                if self.data.len() != volume * 2 {
                    return Err(mismatch());
                }
                let depths = self
                    .data
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]).min(INVALID_DEPTH))
                    .collect();
                OwnedFrameBuffer::from_depth(self.size, depths)
            }
            PacketFormat::Depth11Packed => {
                if self.data.len() != (volume * 11).div_ceil(8) {
                    return Err(mismatch());
                }
                OwnedFrameBuffer::from_depth(self.size, unpack_11bit(&self.data, volume))
            }
            PacketFormat::Rgb8 => OwnedFrameBuffer::from_rgb_bytes(self.size, &self.data),
        };
        frame.ok_or_else(mismatch)
    }
}

fn unpack_11bit(data: &[u8], count: usize) -> Vec<DepthPixel> {
    let mut out = Vec::with_capacity(count);
    let mut accumulator: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        accumulator = (accumulator << 8) | u32::from(byte);
        bits += 8;
        if bits >= 11 {
            bits -= 11;
            out.push(((accumulator >> bits) & 0x7FF) as DepthPixel);
            if out.len() == count {
                break;
            }
        }
    }
    out
}

/// Device SDK binding
pub trait DeviceBackend: Send {
    fn serial_number(&self) -> &str;

    /// Acquire device resources and start the sensor streams
    fn open(&mut self) -> Result<()>;

    /// Release device resources
    fn close(&mut self);

    /// Next packet of either stream; `Ok(None)` once the device stream ended
    ///
    /// Must return within a frame interval so a stop request is noticed.
    fn next_packet(&mut self) -> Result<Option<RawPacket>>;

    fn intrinsic_parameters(&self) -> IntrinsicParameters;

    fn extrinsic_parameters(&self) -> ExtrinsicParameters {
        ExtrinsicParameters::identity()
    }

    fn depth_correction(&self) -> Option<DepthCorrection> {
        None
    }

    fn frame_size(&self, kind: FrameKind) -> Size;

    fn depth_range(&self) -> DepthRange {
        DepthRange::default()
    }
}

static DEVICE_CONTEXT: OnceLock<Mutex<Weak<DeviceContext>>> = OnceLock::new();
static CONTEXT_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Process-wide device SDK context
#[derive(Debug)]
pub struct DeviceContext {
    generation: u64,
}

impl DeviceContext {
    /// Shared context, created if no live source holds one
    pub fn acquire() -> Arc<DeviceContext> {
        let slot = DEVICE_CONTEXT.get_or_init(|| Mutex::new(Weak::new()));
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(context) = guard.upgrade() {
            return context;
        }
        let generation = CONTEXT_GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Creating device context");
        let context = Arc::new(DeviceContext { generation });
        *guard = Arc::downgrade(&context);
        context
    }

    /// Incremented every time a fresh context is created
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        info!(generation = self.generation, "Releasing device context");
    }
}

/// How to pick a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Index(usize),
    Serial(String),
}

/// Devices available to open
#[derive(Default)]
pub struct DeviceRegistry {
    backends: Vec<Box<dyn DeviceBackend>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Box<dyn DeviceBackend>) {
        debug!(serial = backend.serial_number(), "Registered device backend");
        self.backends.push(backend);
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn serial_numbers(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|b| b.serial_number().to_string())
            .collect()
    }

    /// Take the selected device out of the registry and wrap it in a source
    pub fn open(&mut self, selector: &DeviceSelector) -> Result<DirectFrameSource> {
        let position = match selector {
            DeviceSelector::Index(index) => (*index < self.backends.len()).then_some(*index),
            DeviceSelector::Serial(serial) => self
                .backends
                .iter()
                .position(|b| b.serial_number() == serial),
        };
        let position = position.ok_or_else(|| {
            Kinect3dError::NotFound(match selector {
                DeviceSelector::Index(index) => format!(
                    "device index {} ({} devices present)",
                    index,
                    self.backends.len()
                ),
                DeviceSelector::Serial(serial) => format!("device with serial number {}", serial),
            })
        })?;
        Ok(DirectFrameSource::new(self.backends.remove(position)))
    }
}

/// Per-pixel color envelope used to blank out a static scene
#[derive(Debug, Default)]
struct ColorBackground {
    size: Size,
    min: Vec<ColorPixel>,
    max: Vec<ColorPixel>,
    frames_to_capture: usize,
    remove: bool,
}

impl ColorBackground {
    fn start_capture(&mut self, frames: usize) {
        self.min.clear();
        self.max.clear();
        self.frames_to_capture = frames;
    }

    fn is_capturing(&self) -> bool {
        self.frames_to_capture > 0
    }

    fn accumulate(&mut self, size: Size, pixels: &[ColorPixel]) {
        if self.min.len() != pixels.len() || self.size != size {
            self.size = size;
            self.min = pixels.to_vec();
            self.max = pixels.to_vec();
        } else {
            for ((lo, hi), p) in self.min.iter_mut().zip(self.max.iter_mut()).zip(pixels) {
                *lo = ColorPixel::new(lo.r.min(p.r), lo.g.min(p.g), lo.b.min(p.b));
                *hi = ColorPixel::new(hi.r.max(p.r), hi.g.max(p.g), hi.b.max(p.b));
            }
        }
        self.frames_to_capture -= 1;
        if self.frames_to_capture == 0 {
            info!(size = %size, "Color background captured");
        }
    }

    fn apply(&self, size: Size, pixels: &mut [ColorPixel]) {
        if !self.remove || self.size != size || self.min.len() != pixels.len() {
            return;
        }
        for ((p, lo), hi) in pixels.iter_mut().zip(&self.min).zip(&self.max) {
            let inside = (lo.r..=hi.r).contains(&p.r)
                && (lo.g..=hi.g).contains(&p.g)
                && (lo.b..=hi.b).contains(&p.b);
            if inside {
                *p = ColorPixel::BLACK;
            }
        }
    }
}

/// Frame source over a directly attached device
pub struct DirectFrameSource {
    backend: Arc<Mutex<Box<dyn DeviceBackend>>>,
    serial: String,
    background: Arc<Mutex<ColorBackground>>,
    time_base: Instant,
    streaming: Option<StreamLoopController>,
    _context: Arc<DeviceContext>,
}

impl DirectFrameSource {
    pub fn new(backend: Box<dyn DeviceBackend>) -> Self {
        let serial = backend.serial_number().to_string();
        Self {
            backend: Arc::new(Mutex::new(backend)),
            serial,
            background: Arc::new(Mutex::new(ColorBackground::default())),
            time_base: Instant::now(),
            streaming: None,
            _context: DeviceContext::acquire(),
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.serial
    }

    /// Accumulate the next `frames` color frames into the background envelope
    pub fn capture_background(&self, frames: usize) {
        info!(serial = %self.serial, frames, "Capturing color background");
        self.lock_background().start_capture(frames);
    }

    pub fn is_capturing_background(&self) -> bool {
        self.lock_background().is_capturing()
    }

    /// Blank color pixels that fall inside the captured envelope
    pub fn set_remove_background(&self, remove: bool) {
        self.lock_background().remove = remove;
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.as_ref().is_some_and(|s| s.is_running())
    }

    /// True once the streaming thread ended on a device error
    pub fn is_faulted(&self) -> bool {
        self.streaming.as_ref().is_some_and(|s| s.is_faulted())
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, ColorBackground> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_backend<T>(&self, f: impl FnOnce(&dyn DeviceBackend) -> T) -> T {
        let backend = self.backend.lock().unwrap_or_else(|e| e.into_inner());
        f(&**backend)
    }
}

impl FrameSource for DirectFrameSource {
    fn intrinsic_parameters(&self) -> IntrinsicParameters {
        self.with_backend(|b| b.intrinsic_parameters())
    }

    fn extrinsic_parameters(&self) -> ExtrinsicParameters {
        self.with_backend(|b| b.extrinsic_parameters())
    }

    fn depth_correction_parameters(&self) -> Option<DepthCorrection> {
        self.with_backend(|b| b.depth_correction())
    }

    fn actual_frame_size(&self, kind: FrameKind) -> Size {
        self.with_backend(|b| b.frame_size(kind))
    }

    fn depth_range(&self) -> DepthRange {
        self.with_backend(|b| b.depth_range())
    }

    fn color_space(&self) -> ColorSpace {
        ColorSpace::Rgb
    }

    fn start_streaming(
        &mut self,
        mut color: FrameCallback,
        mut depth: FrameCallback,
    ) -> Result<()> {
        if self.streaming.is_some() {
            return Err(Kinect3dError::Busy);
        }
        self.backend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .open()?;

        let backend = Arc::clone(&self.backend);
        let background = Arc::clone(&self.background);
        let time_base = self.time_base;
        let serial = self.serial.clone();
        let mut frame_count: u64 = 0;

        self.streaming = Some(StreamLoopController::start(
            &format!("device-{}", self.serial),
            move |_| {
                let packet = {
                    let mut backend = backend.lock().unwrap_or_else(|e| e.into_inner());
                    backend.next_packet()?
                };
                let Some(packet) = packet else {
                    info!(serial = %serial, "Device stream ended");
                    return Ok(LoopAction::Stop);
                };

                let mut frame = packet.decode()?;
                frame.set_time_stamp(
                    packet
                        .captured
                        .saturating_duration_since(time_base)
                        .as_secs_f64(),
                );
                match packet.kind() {
                    FrameKind::Color => {
                        let size = frame.size();
                        if let Some(pixels) = frame.color_mut() {
                            let mut bg = background.lock().unwrap_or_else(|e| e.into_inner());
                            if bg.is_capturing() {
                                bg.accumulate(size, pixels);
                            }
                            bg.apply(size, pixels);
                        }
                        color(&frame.into_shared());
                    }
                    FrameKind::Depth => {
                        depth(&frame.into_shared());
                        frame_count += 1;
                        if frame_count % timing::FRAME_LOG_INTERVAL == 0 {
                            debug!(serial = %serial, frames = frame_count, "Depth frames delivered");
                        }
                    }
                }
                Ok(LoopAction::Continue)
            },
        ));
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        let Some(mut streaming) = self.streaming.take() else {
            return Ok(());
        };
        streaming.stop();
        if streaming.is_faulted() {
            warn!(serial = %self.serial, "Device stream ended with an error");
        }
        self.backend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .close();
        Ok(())
    }

    fn set_time_base(&mut self, time_base: Instant) {
        self.time_base = time_base;
    }
}

impl Drop for DirectFrameSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop_streaming() {
            warn!(serial = %self.serial, error = %e, "Failed to stop device stream");
        }
    }
}

/// Scripted device for tests and dry runs
///
/// Produces `frames` alternating depth and color packets of a fixed scene.
pub struct MockDeviceBackend {
    serial: String,
    depth_size: Size,
    color_size: Size,
    depth_value: DepthPixel,
    color_value: ColorPixel,
    frames: usize,
    produced: usize,
    open: bool,
    intrinsics: IntrinsicParameters,
}

impl MockDeviceBackend {
    pub fn new(serial: &str, size: Size, frames: usize) -> Self {
        Self {
            serial: serial.to_string(),
            depth_size: size,
            color_size: size,
            depth_value: 1000,
            color_value: ColorPixel::new(40, 80, 120),
            frames,
            produced: 0,
            open: false,
            intrinsics: IntrinsicParameters::default(),
        }
    }

    pub fn with_color(mut self, color: ColorPixel) -> Self {
        self.color_value = color;
        self
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl DeviceBackend for MockDeviceBackend {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(Kinect3dError::Device("device already open".into()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        if !self.open {
            return Err(Kinect3dError::Device("device not open".into()));
        }
        if self.produced >= self.frames * 2 {
            return Ok(None);
        }
        let index = self.produced;
        self.produced += 1;
        std::thread::sleep(std::time::Duration::from_millis(1));
        let packet = if index % 2 == 0 {
            RawPacket {
                format: PacketFormat::Depth16,
                size: self.depth_size,
                data: std::iter::repeat_n(self.depth_value.to_le_bytes(), self.depth_size.volume())
                    .flatten()
                    .collect(),
                captured: Instant::now(),
            }
        } else {
            RawPacket {
                format: PacketFormat::Rgb8,
                size: self.color_size,
                data: std::iter::repeat_n(self.color_value.channels(), self.color_size.volume())
                    .flatten()
                    .collect(),
                captured: Instant::now(),
            }
        };
        Ok(Some(packet))
    }

    fn intrinsic_parameters(&self) -> IntrinsicParameters {
        self.intrinsics
    }

    fn frame_size(&self, kind: FrameKind) -> Size {
        match kind {
            FrameKind::Color => self.color_size,
            FrameKind::Depth => self.depth_size,
        }
    }
}
