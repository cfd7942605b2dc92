// SPDX-License-Identifier: MPL-2.0

//! Error types for capture, calibration and stream codecs

/// Result type alias using [`Kinect3dError`]
pub type Result<T> = std::result::Result<T, Kinect3dError>;

/// Coarse classification of a [`Kinect3dError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Protocol,
    Device,
    Busy,
    InvalidArgument,
    Unsupported,
    NotFound,
}

/// Main error type
#[derive(thiserror::Error, Debug)]
pub enum Kinect3dError {
    /// Underlying read/write failure (disk, pipe, socket)
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    /// Malformed or unexpected data on a stream or in a file
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Backend-specific device failure
    #[error("device error: {0}")]
    Device(String),
    /// A streaming session is already active
    #[error("a streaming session is already active")]
    Busy,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl Kinect3dError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Kinect3dError::Io { .. } => ErrorKind::Io,
            Kinect3dError::Protocol(_) => ErrorKind::Protocol,
            Kinect3dError::Device(_) => ErrorKind::Device,
            Kinect3dError::Busy => ErrorKind::Busy,
            Kinect3dError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Kinect3dError::Unsupported(_) => ErrorKind::Unsupported,
            Kinect3dError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Map a read failure, treating a short read as a truncated stream
    pub fn from_read(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Kinect3dError::Protocol(format!("truncated {}", what))
        } else {
            Kinect3dError::Io { source: err }
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Kinect3dError::Protocol(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Kinect3dError::InvalidArgument(msg.into())
    }
}

impl From<image::ImageError> for Kinect3dError {
    fn from(err: image::ImageError) -> Self {
        Kinect3dError::Protocol(format!("color frame codec: {}", err))
    }
}

impl From<serde_json::Error> for Kinect3dError {
    fn from(err: serde_json::Error) -> Self {
        Kinect3dError::InvalidArgument(format!("configuration: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_read_is_protocol() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(
            Kinect3dError::from_read(eof, "frame header").kind(),
            ErrorKind::Protocol
        );

        let other = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(
            Kinect3dError::from_read(other, "frame header").kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_display() {
        let err = Kinect3dError::NotFound("serial 1234".into());
        assert_eq!(err.to_string(), "not found: serial 1234");
        assert_eq!(Kinect3dError::Busy.kind(), ErrorKind::Busy);
    }
}
