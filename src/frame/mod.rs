// SPDX-License-Identifier: GPL-3.0-only

//! Frame buffers and lock-free hand-off between threads

mod buffer;
mod triple_buffer;

pub use buffer::{ColorPixel, FrameBuffer, OwnedFrameBuffer};
pub use triple_buffer::{TripleReader, TripleWriter, triple_buffer};
