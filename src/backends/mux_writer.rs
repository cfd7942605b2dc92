// SPDX-License-Identifier: GPL-3.0-only

//! Server side of the multiplexed stream protocol
//!
//! Used to record byte logs for replay and to serve captured streams:
//!
//! ```text
//! <- u32 endian marker, u32 client version
//! -> u32 endian marker, u32 server version, f64 time base offset, u32 N
//! -> N sub-stream headers
//! -> (u32 metaframe index, u32 frame id, frame body)*
//! <- u32 0 (goodbye)
//! ```

use crate::codecs::{ByteOrder, FrameWriter, SubStreamHeader, WireReader, WireWriter};
use crate::constants::{FrameKind, protocol};
use crate::errors::{Kinect3dError, Result};
use crate::frame::FrameBuffer;
use std::io::{Read, Write};
use tracing::debug;

/// Protocol version spoken by this server
pub const SERVER_VERSION: u32 = 1;

struct StreamWriters {
    color: FrameWriter,
    depth: FrameWriter,
}

/// Writes the server half of a multiplexed session
pub struct MultiplexedWriter<W: Write> {
    writer: WireWriter<W>,
    streams: Vec<StreamWriters>,
    metaframe_index: u32,
}

/// Read a client's hello; returns its protocol version
pub fn read_client_hello<R: Read>(reader: &mut WireReader<R>) -> Result<u32> {
    let marker = reader.read_u32()?;
    match marker {
        protocol::ENDIAN_MARKER => {}
        protocol::SWAPPED_ENDIAN_MARKER => reader.set_order(match reader.order() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }),
        other => {
            return Err(Kinect3dError::protocol(format!(
                "unrecognized client endianness marker {:#010x}",
                other
            )));
        }
    }
    reader.read_u32()
}

impl<W: Write> MultiplexedWriter<W> {
    /// Send the handshake reply and all sub-stream headers
    ///
    /// `order` selects the byte order of everything the server sends.
    pub fn new(
        writer: W,
        order: ByteOrder,
        time_base_offset: f64,
        headers: &[SubStreamHeader],
    ) -> Result<Self> {
        let mut writer = WireWriter::with_order(writer, order);
        writer.write_u32(protocol::ENDIAN_MARKER)?;
        writer.write_u32(SERVER_VERSION)?;
        writer.write_f64(time_base_offset)?;
        writer.write_u32(headers.len() as u32)?;
        let mut streams = Vec::with_capacity(headers.len());
        for header in headers {
            header.write_to(&mut writer)?;
            streams.push(StreamWriters {
                color: FrameWriter::for_color(header.color_size),
                depth: FrameWriter::for_depth(header.depth_size, header.depth.lossy),
            });
        }
        writer.flush()?;
        debug!(streams = headers.len(), ?order, "Sent multiplexed stream headers");
        Ok(Self {
            writer,
            streams,
            metaframe_index: 0,
        })
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    /// Index the next `write_metaframe` call will use
    pub fn metaframe_index(&self) -> u32 {
        self.metaframe_index
    }

    /// Write one frame tagged with an explicit metaframe index
    pub fn write_frame(
        &mut self,
        metaframe_index: u32,
        stream: usize,
        kind: FrameKind,
        frame: &FrameBuffer,
    ) -> Result<()> {
        let writers = self.streams.get_mut(stream).ok_or_else(|| {
            Kinect3dError::invalid_argument(format!("no sub-stream {}", stream))
        })?;
        self.writer.write_u32(metaframe_index)?;
        self.writer
            .write_u32((stream as u32) * 2 + kind.index() as u32)?;
        match kind {
            FrameKind::Color => writers.color.write_frame(frame, &mut self.writer),
            FrameKind::Depth => writers.depth.write_frame(frame, &mut self.writer),
        }
    }

    /// Write a complete metaframe: color then depth of every stream in order
    pub fn write_metaframe(&mut self, color: &[FrameBuffer], depth: &[FrameBuffer]) -> Result<()> {
        if color.len() != self.streams.len() || depth.len() != self.streams.len() {
            return Err(Kinect3dError::invalid_argument(format!(
                "metaframe needs {} color and depth frames",
                self.streams.len()
            )));
        }
        let index = self.metaframe_index;
        for (stream, (c, d)) in color.iter().zip(depth).enumerate() {
            self.write_frame(index, stream, FrameKind::Color, c)?;
            self.write_frame(index, stream, FrameKind::Depth, d)?;
        }
        self.metaframe_index = self.metaframe_index.wrapping_add(1);
        self.writer.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}
