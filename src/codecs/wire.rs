// SPDX-License-Identifier: GPL-3.0-only

//! Endianness-aware primitive readers and writers
//!
//! Files are always little-endian. A multiplexed stream may come from a peer
//! with the opposite byte order, detected during the handshake, in which case
//! the reader decodes big-endian values instead.

use crate::errors::{Kinect3dError, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Initial buffer size for length-prefixed reads
const READ_CHUNK: usize = 64 << 10;

/// Byte order of a binary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Primitive reader over any byte source
pub struct WireReader<R> {
    inner: R,
    order: ByteOrder,
}

impl<R: Read> WireReader<R> {
    /// Little-endian reader, as used for every on-disk format
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            order: ByteOrder::Little,
        }
    }

    pub fn with_order(inner: R, order: ByteOrder) -> Self {
        Self { inner, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.inner
            .read_u8()
            .map_err(|e| Kinect3dError::from_read(e, "u8"))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        match self.order {
            ByteOrder::Little => self.inner.read_u32::<LittleEndian>(),
            ByteOrder::Big => self.inner.read_u32::<BigEndian>(),
        }
        .map_err(|e| Kinect3dError::from_read(e, "u32"))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        match self.order {
            ByteOrder::Little => self.inner.read_f32::<LittleEndian>(),
            ByteOrder::Big => self.inner.read_f32::<BigEndian>(),
        }
        .map_err(|e| Kinect3dError::from_read(e, "f32"))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        match self.order {
            ByteOrder::Little => self.inner.read_f64::<LittleEndian>(),
            ByteOrder::Big => self.inner.read_f64::<BigEndian>(),
        }
        .map_err(|e| Kinect3dError::from_read(e, "f64"))
    }

    pub fn read_f64_array<const N: usize>(&mut self) -> Result<[f64; N]> {
        let mut out = [0.0; N];
        for value in out.iter_mut() {
            *value = self.read_f64()?;
        }
        Ok(out)
    }

    /// Read a `u32`, returning `None` on a clean end of stream
    ///
    /// A stream that ends partway through the value is a protocol error.
    pub fn read_u32_or_eof(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        if !self.fill_or_eof(&mut buf)? {
            return Ok(None);
        }
        Ok(Some(match self.order {
            ByteOrder::Little => u32::from_le_bytes(buf),
            ByteOrder::Big => u32::from_be_bytes(buf),
        }))
    }

    /// Read an `f64`, returning `None` on a clean end of stream
    pub fn read_f64_or_eof(&mut self) -> Result<Option<f64>> {
        let mut buf = [0u8; 8];
        if !self.fill_or_eof(&mut buf)? {
            return Ok(None);
        }
        Ok(Some(match self.order {
            ByteOrder::Little => f64::from_le_bytes(buf),
            ByteOrder::Big => f64::from_be_bytes(buf),
        }))
    }

    /// Read exactly `len` raw bytes
    ///
    /// The buffer grows with the data actually read, so a corrupt length
    /// fails on the truncated input instead of allocating up front.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
        (&mut self.inner)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| Kinect3dError::from_read(e, "payload"))?;
        if buf.len() != len {
            return Err(Kinect3dError::protocol(format!(
                "truncated payload: {} of {} bytes",
                buf.len(),
                len
            )));
        }
        Ok(buf)
    }

    /// Discard exactly `len` bytes
    pub fn skip(&mut self, len: u64) -> Result<()> {
        let copied = std::io::copy(&mut (&mut self.inner).take(len), &mut std::io::sink())?;
        if copied != len {
            return Err(Kinect3dError::protocol("truncated skipped block"));
        }
        Ok(())
    }

    fn fill_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(Kinect3dError::protocol("stream ended inside a value")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// Primitive writer over any byte sink
pub struct WireWriter<W> {
    inner: W,
    order: ByteOrder,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            order: ByteOrder::Little,
        }
    }

    pub fn with_order(inner: W, order: ByteOrder) -> Self {
        Self { inner, order }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        Ok(self.inner.write_u8(value)?)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        match self.order {
            ByteOrder::Little => self.inner.write_u32::<LittleEndian>(value)?,
            ByteOrder::Big => self.inner.write_u32::<BigEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        match self.order {
            ByteOrder::Little => self.inner.write_f32::<LittleEndian>(value)?,
            ByteOrder::Big => self.inner.write_f32::<BigEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        match self.order {
            ByteOrder::Little => self.inner.write_f64::<LittleEndian>(value)?,
            ByteOrder::Big => self.inner.write_f64::<BigEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_f64_slice(&mut self, values: &[f64]) -> Result<()> {
        for &value in values {
            self.write_f64(value)?;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        Ok(self.inner.write_all(bytes)?)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.inner.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_swapped_order() {
        let mut writer = WireWriter::with_order(Vec::new(), ByteOrder::Big);
        writer.write_u32(0x1234_5678).unwrap();
        writer.write_f64(1.5).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(&bytes[..4], &[0x12, 0x34, 0x56, 0x78]);

        let mut reader = WireReader::new(Cursor::new(bytes));
        reader.set_order(ByteOrder::Big);
        assert_eq!(reader.read_u32().unwrap(), 0x1234_5678);
        assert_eq!(reader.read_f64().unwrap(), 1.5);
    }

    #[test]
    fn test_eof_detection() {
        let mut reader = WireReader::new(Cursor::new(vec![1u8, 0, 0, 0, 9]));
        assert_eq!(reader.read_u32_or_eof().unwrap(), Some(1));
        // One trailing byte is a truncated value, not a clean end
        assert!(reader.read_u32_or_eof().is_err());

        let mut empty = WireReader::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(empty.read_f64_or_eof().unwrap(), None);
    }

    #[test]
    fn test_truncated_read_is_protocol_error() {
        let mut reader = WireReader::new(Cursor::new(vec![1u8, 2]));
        let err = reader.read_u32().unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
    }

    #[test]
    fn test_oversized_length_fails_on_short_input() {
        let mut reader = WireReader::new(Cursor::new(vec![7u8; 16]));
        let err = reader.read_bytes(usize::MAX / 2).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Protocol);
    }
}
