// SPDX-License-Identifier: GPL-3.0-only

//! Client side of the multiplexed stream protocol
//!
//! A server sends `N` depth+color sub-streams interleaved over one pipe.
//! Frames are tagged with a metaframe index and a frame id
//! `stream_index * 2 + kind`. The receiving thread collects one color and
//! one depth frame per sub-stream and, when the next metaframe starts,
//! delivers the completed metaframe to every streaming sub-stream in order.
//! A metaframe with missing frames is discarded.
//!
//! The session is shared by the [`MultiplexedSource`] handle and every
//! [`MultiplexedStream`] taken from it; it closes when the last of them
//! drops.

use super::frame_loop::{LoopAction, StreamLoopController};
use super::{FrameCallback, FrameSource};
use crate::calibration::{DepthCorrection, ExtrinsicParameters, IntrinsicParameters};
use crate::codecs::{ByteOrder, FrameReader, SubStreamHeader, WireReader, WireWriter};
use crate::constants::{ColorSpace, FrameKind, Size, protocol, timing};
use crate::errors::{Kinect3dError, Result};
use crate::frame::FrameBuffer;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

/// Hook that unblocks a pending read on the pipe, e.g. a socket shutdown
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StreamSlot {
    color: Option<FrameCallback>,
    depth: Option<FrameCallback>,
}

impl StreamSlot {
    fn is_streaming(&self) -> bool {
        self.color.is_some() || self.depth.is_some()
    }
}

/// State shared with the receiving thread
struct Shared {
    headers: Vec<SubStreamHeader>,
    slots: Vec<Mutex<StreamSlot>>,
    finished: AtomicBool,
    metaframes_delivered: AtomicU64,
}

impl Shared {
    fn slot(&self, index: usize) -> MutexGuard<'_, StreamSlot> {
        self.slots[index].lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, frames: &[FrameBuffer]) {
        for (index, pair) in frames.chunks_exact(2).enumerate() {
            let mut slot = self.slot(index);
            if let Some(color) = slot.color.as_mut() {
                color(&pair[0]);
            }
            if let Some(depth) = slot.depth.as_mut() {
                depth(&pair[1]);
            }
        }
        self.metaframes_delivered.fetch_add(1, Ordering::SeqCst);
    }
}

/// Metaframe reassembly state of the receiving thread
struct Demultiplexer {
    input: WireReader<BoxedReader>,
    readers: Vec<FrameReader>,
    frames: Vec<FrameBuffer>,
    received: Vec<bool>,
    current_index: u32,
    time_stamp_offset: f64,
}

impl Demultiplexer {
    fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }

    fn start_metaframe(&mut self, index: u32) {
        self.current_index = index;
        self.received.fill(false);
    }

    /// Receive one frame; `Ok(false)` at a clean end of stream
    fn receive(&mut self, shared: &Shared) -> Result<bool> {
        let Some(metaframe_index) = self.input.read_u32_or_eof()? else {
            if self.is_complete() {
                shared.dispatch(&self.frames);
            }
            return Ok(false);
        };
        let frame_id = self.input.read_u32()?;

        if metaframe_index != self.current_index {
            if self.is_complete() {
                shared.dispatch(&self.frames);
            } else if self.received.iter().any(|&r| r) {
                debug!(
                    metaframe = self.current_index,
                    "Discarding incomplete metaframe"
                );
            }
            self.start_metaframe(metaframe_index);
        }

        let slot = frame_id as usize;
        if slot >= self.readers.len() {
            return Err(Kinect3dError::protocol(format!(
                "frame id {} out of range for {} streams",
                frame_id,
                self.readers.len() / 2
            )));
        }
        if self.received[slot] {
            return Err(Kinect3dError::protocol(format!(
                "duplicate frame id {} in metaframe {}",
                frame_id, metaframe_index
            )));
        }
        let frame = self.readers[slot].read_next(&mut self.input)?.ok_or_else(|| {
            Kinect3dError::protocol(format!(
                "stream ended inside {} frame {}",
                FrameKind::from_frame_id(frame_id).display_name(),
                frame_id
            ))
        })?;
        self.frames[slot] = frame.with_time_stamp(frame.time_stamp() - self.time_stamp_offset);
        self.received[slot] = true;
        Ok(true)
    }
}

/// Resources released when the last handle drops
struct Session {
    shared: Arc<Shared>,
    receiver: Mutex<Option<StreamLoopController>>,
    writer: Mutex<WireWriter<BoxedWriter>>,
    shutdown: Mutex<Option<ShutdownHook>>,
    server_version: u32,
    time_stamp_offset: f64,
    byte_order: ByteOrder,
}

impl Drop for Session {
    fn drop(&mut self) {
        {
            let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let goodbye = writer
                .write_u32(protocol::GOODBYE)
                .and_then(|_| writer.flush());
            if let Err(e) = goodbye {
                debug!(error = %e, "Could not send goodbye to server");
            }
        }
        if let Some(hook) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            hook();
        }
        if let Some(mut receiver) = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            // Every stream handle is gone, so a detached thread has no
            // callbacks left to invoke
            receiver.stop_within(timing::RECEIVER_CLOSE_TIMEOUT);
        }
        info!("Closed multiplexed session");
    }
}

/// Client connection to a multiplexing server
#[derive(Clone)]
pub struct MultiplexedSource {
    session: Arc<Session>,
}

impl MultiplexedSource {
    /// Connect over TCP to `address` (`host:port`)
    pub fn connect<A: ToSocketAddrs + std::fmt::Debug>(address: A) -> Result<Self> {
        info!(address = ?address, "Connecting to multiplexing server");
        let stream = TcpStream::connect(&address)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        Self::from_pipe(
            BufReader::new(reader),
            BufWriter::new(stream),
            Some(Box::new(move || {
                let _ = closer.shutdown(Shutdown::Both);
            })),
        )
    }

    /// Run the protocol over any ordered byte pipe
    ///
    /// Performs the handshake, reads all sub-stream headers and starts the
    /// receiving thread. `shutdown` is called on close, before the thread
    /// is joined, to unblock a pending read. Without a hook, or when the
    /// read stays blocked, closing waits at most
    /// [`RECEIVER_CLOSE_TIMEOUT`](timing::RECEIVER_CLOSE_TIMEOUT) and then
    /// leaves the thread to end with the pipe.
    pub fn from_pipe<R, W>(reader: R, writer: W, shutdown: Option<ShutdownHook>) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut writer = WireWriter::new(Box::new(writer) as BoxedWriter);
        writer.write_u32(protocol::ENDIAN_MARKER)?;
        writer.write_u32(protocol::CLIENT_VERSION)?;
        writer.flush()?;

        let mut input = WireReader::new(Box::new(reader) as BoxedReader);
        let marker = input.read_u32()?;
        match marker {
            protocol::ENDIAN_MARKER => {}
            protocol::SWAPPED_ENDIAN_MARKER => input.set_order(ByteOrder::Big),
            other => {
                return Err(Kinect3dError::protocol(format!(
                    "server has unrecognized endianness marker {:#010x}",
                    other
                )));
            }
        }
        let server_version = input.read_u32()?;
        let time_stamp_offset = input.read_f64()?;
        let num_streams = input.read_u32()? as usize;
        if num_streams == 0 || num_streams > 64 {
            return Err(Kinect3dError::protocol(format!(
                "server announced {} sub-streams",
                num_streams
            )));
        }

        let mut headers = Vec::with_capacity(num_streams);
        let mut readers = Vec::with_capacity(num_streams * 2);
        for index in 0..num_streams {
            let header = SubStreamHeader::read_from(&mut input)?;
            debug!(
                stream = index,
                color_size = %header.color_size,
                depth_size = %header.depth_size,
                lossy = header.depth.lossy,
                "Read sub-stream header"
            );
            readers.push(FrameReader::for_color(header.color_size));
            readers.push(FrameReader::for_depth(header.depth_size, header.depth.lossy));
            headers.push(header);
        }
        info!(
            server_version,
            streams = num_streams,
            byte_order = ?input.order(),
            "Connected to multiplexing server"
        );

        let byte_order = input.order();
        let shared = Arc::new(Shared {
            slots: (0..num_streams).map(|_| Mutex::default()).collect(),
            headers,
            finished: AtomicBool::new(false),
            metaframes_delivered: AtomicU64::new(0),
        });
        let mut demux = Demultiplexer {
            input,
            readers,
            frames: vec![FrameBuffer::invalid(); num_streams * 2],
            received: vec![false; num_streams * 2],
            current_index: 0,
            time_stamp_offset,
        };

        let thread_shared = Arc::clone(&shared);
        let exit_shared = Arc::clone(&shared);
        let receiver = StreamLoopController::start_with_exit(
            "multiplexed-receive",
            move |_| {
                if !demux.receive(&thread_shared)? {
                    info!("Multiplexing server closed the stream");
                    return Ok(LoopAction::Stop);
                }
                Ok(LoopAction::Continue)
            },
            move || {
                exit_shared.finished.store(true, Ordering::SeqCst);
                let delivered = exit_shared.metaframes_delivered.load(Ordering::SeqCst);
                debug!(metaframes = delivered, "Receive thread done");
            },
        );

        Ok(Self {
            session: Arc::new(Session {
                shared,
                receiver: Mutex::new(Some(receiver)),
                writer: Mutex::new(writer),
                shutdown: Mutex::new(shutdown),
                server_version,
                time_stamp_offset,
                byte_order,
            }),
        })
    }

    pub fn num_streams(&self) -> usize {
        self.session.shared.headers.len()
    }

    pub fn server_version(&self) -> u32 {
        self.session.server_version
    }

    /// Offset subtracted from every received time stamp
    pub fn time_stamp_offset(&self) -> f64 {
        self.session.time_stamp_offset
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.session.byte_order
    }

    /// Handle for sub-stream `index`
    pub fn stream(&self, index: usize) -> Result<MultiplexedStream> {
        if index >= self.num_streams() {
            return Err(Kinect3dError::NotFound(format!(
                "sub-stream {} of {}",
                index,
                self.num_streams()
            )));
        }
        Ok(MultiplexedStream {
            session: Arc::clone(&self.session),
            index,
        })
    }

    /// Number of metaframes delivered so far
    pub fn metaframes_delivered(&self) -> u64 {
        self.session
            .shared
            .metaframes_delivered
            .load(Ordering::SeqCst)
    }

    /// True once the receiving thread has exited
    pub fn is_finished(&self) -> bool {
        self.session.shared.finished.load(Ordering::SeqCst)
    }

    /// True once the receiving thread ended on an error
    pub fn is_faulted(&self) -> bool {
        self.session
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| r.is_faulted())
    }
}

/// One sub-stream of a multiplexed session
pub struct MultiplexedStream {
    session: Arc<Session>,
    index: usize,
}

impl std::fmt::Debug for MultiplexedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedStream")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl MultiplexedStream {
    pub fn index(&self) -> usize {
        self.index
    }

    fn header(&self) -> &SubStreamHeader {
        &self.session.shared.headers[self.index]
    }
}

impl FrameSource for MultiplexedStream {
    fn intrinsic_parameters(&self) -> IntrinsicParameters {
        let header = self.header();
        IntrinsicParameters::new(
            header.depth.lens_distortion,
            header.depth_projection,
            header.color_lens_distortion,
            header.color_projection,
        )
    }

    fn extrinsic_parameters(&self) -> ExtrinsicParameters {
        self.header().extrinsics
    }

    fn depth_correction_parameters(&self) -> Option<DepthCorrection> {
        self.header().depth.depth_correction.clone()
    }

    fn actual_frame_size(&self, kind: FrameKind) -> Size {
        match kind {
            FrameKind::Color => self.header().color_size,
            FrameKind::Depth => self.header().depth_size,
        }
    }

    fn color_space(&self) -> ColorSpace {
        if self.header().color_version >= 2 {
            ColorSpace::YCbCr
        } else {
            ColorSpace::Rgb
        }
    }

    fn start_streaming(&mut self, color: FrameCallback, depth: FrameCallback) -> Result<()> {
        let mut slot = self.session.shared.slot(self.index);
        if slot.is_streaming() {
            return Err(Kinect3dError::Busy);
        }
        slot.color = Some(color);
        slot.depth = Some(depth);
        debug!(stream = self.index, "Sub-stream streaming");
        Ok(())
    }

    /// Waits for a metaframe being delivered to this stream to finish
    fn stop_streaming(&mut self) -> Result<()> {
        let mut slot = self.session.shared.slot(self.index);
        *slot = StreamSlot::default();
        debug!(stream = self.index, "Sub-stream stopped");
        Ok(())
    }

    /// Has no effect: time stamps stay on the server's clock, shifted by
    /// [`MultiplexedSource::time_stamp_offset`]. The server's clock has no
    /// known relation to a local `Instant`, so there is nothing to rebase.
    fn set_time_base(&mut self, _time_base: Instant) {
        debug!(
            stream = self.index,
            "Ignoring local time base, multiplexed streams keep the server's clock"
        );
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        let _ = self.stop_streaming();
    }
}
