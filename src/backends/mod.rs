// SPDX-License-Identifier: GPL-3.0-only

//! Frame sources
//!
//! A frame source produces depth and color [`FrameBuffer`]s from an internal
//! thread and hands them to callbacks installed by `start_streaming`:
//!
//! ```text
//! ┌───────────────┐  ┌────────────────┐  ┌──────────────────┐
//! │ DirectFrame-  │  │ FileFrameSource│  │ MultiplexedStream│
//! │ Source        │  │ (depth + color │  │ (N streams over  │
//! │ (device)      │  │  files)        │  │  one pipe)       │
//! └───────┬───────┘  └───────┬────────┘  └────────┬─────────┘
//!         └──────────────────┼────────────────────┘
//!                            ▼
//!                  FrameSource trait  ──►  color / depth callbacks
//! ```
//!
//! # Modules
//!
//! - [`direct`]: directly attached devices behind a [`direct::DeviceBackend`]
//! - [`file`]: replay of recorded depth and color files
//! - [`multiplexed`]: client side of the multiplexed stream protocol
//! - [`mux_writer`]: server side of the same protocol
//! - [`frame_loop`]: thread lifecycle shared by all sources

pub mod direct;
pub mod file;
pub mod frame_loop;
pub mod multiplexed;
pub mod mux_writer;

use crate::calibration::{DepthCorrection, ExtrinsicParameters, IntrinsicParameters};
use crate::constants::{ColorSpace, DepthRange, FrameKind, Size};
use crate::errors::Result;
use crate::frame::FrameBuffer;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Callback receiving each frame of one kind
///
/// Invoked from the source's streaming thread. It must not call back into
/// `start_streaming` or `stop_streaming` of the same source.
pub type FrameCallback = Box<dyn FnMut(&FrameBuffer) + Send>;

/// Common interface of all frame sources
pub trait FrameSource: Send {
    fn intrinsic_parameters(&self) -> IntrinsicParameters;

    fn extrinsic_parameters(&self) -> ExtrinsicParameters;

    /// Per-pixel depth correction, if the source carries one
    fn depth_correction_parameters(&self) -> Option<DepthCorrection>;

    fn actual_frame_size(&self, kind: FrameKind) -> Size;

    fn depth_range(&self) -> DepthRange {
        DepthRange::default()
    }

    fn color_space(&self) -> ColorSpace {
        ColorSpace::Rgb
    }

    /// Install callbacks and start producing frames
    ///
    /// Fails with `Busy` if a session is already active.
    fn start_streaming(&mut self, color: FrameCallback, depth: FrameCallback) -> Result<()>;

    /// End the session; no callback runs after this returns
    fn stop_streaming(&mut self) -> Result<()>;

    /// Reference instant for frame time stamps
    ///
    /// Sources timed by a remote clock ignore it.
    fn set_time_base(&mut self, time_base: Instant);
}

/// Observer list for consumers that need several callbacks per frame kind
///
/// Dispatch snapshots the list and releases the lock before invoking, so
/// observers may be added or removed from inside a callback.
pub struct CallbackList<T> {
    observers: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
    next_id: Mutex<u64>,
}

impl<T> Default for CallbackList<T> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }
}

impl<T> CallbackList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; the returned id removes it again
    pub fn add<F>(&self, observer: F) -> u64
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(observer)));
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(i, _)| *i != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, value: &T) {
        let snapshot: Vec<_> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            observer(value);
        }
    }
}

impl CallbackList<FrameBuffer> {
    /// A frame callback fanning out to every observer of `list`
    pub fn fan_out(list: Arc<Self>) -> FrameCallback {
        Box::new(move |frame| list.dispatch(frame))
    }
}

/// A frame delivered through a [`FrameChannel`]
#[derive(Debug, Clone)]
pub enum SourceFrame {
    Color(FrameBuffer),
    Depth(FrameBuffer),
}

impl SourceFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            SourceFrame::Color(_) => FrameKind::Color,
            SourceFrame::Depth(_) => FrameKind::Depth,
        }
    }

    pub fn frame(&self) -> &FrameBuffer {
        match self {
            SourceFrame::Color(frame) | SourceFrame::Depth(frame) => frame,
        }
    }
}

/// Pull-style adapter over the callback interface
pub struct FrameChannel;

impl FrameChannel {
    /// Callbacks posting into a bounded queue, plus its receiving end
    ///
    /// Frames arriving while the queue is full are dropped.
    pub fn bounded(capacity: usize) -> (FrameCallback, FrameCallback, Receiver<SourceFrame>) {
        let (sender, receiver) = sync_channel(capacity);
        let color_sender = sender.clone();
        let color: FrameCallback =
            Box::new(move |frame| post(&color_sender, SourceFrame::Color(frame.clone())));
        let depth: FrameCallback =
            Box::new(move |frame| post(&sender, SourceFrame::Depth(frame.clone())));
        (color, depth, receiver)
    }
}

fn post(sender: &SyncSender<SourceFrame>, frame: SourceFrame) {
    match sender.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) => {
            debug!(kind = ?frame.kind(), time_stamp = frame.frame().time_stamp(), "Frame queue full, dropping frame");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OwnedFrameBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn depth_frame(t: f64) -> FrameBuffer {
        let mut frame = OwnedFrameBuffer::depth(Size::new(2, 2), 1000);
        frame.set_time_stamp(t);
        frame.into_shared()
    }

    #[test]
    fn test_callback_list_dispatch_and_remove() {
        let list = Arc::new(CallbackList::<FrameBuffer>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = Arc::clone(&hits);
        let h2 = Arc::clone(&hits);
        let first = list.add(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        list.add(move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        });

        let mut callback = CallbackList::fan_out(Arc::clone(&list));
        callback(&depth_frame(0.0));
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(list.remove(first));
        assert!(!list.remove(first));
        callback(&depth_frame(0.1));
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_callback_may_modify_list_during_dispatch() {
        let list = Arc::new(CallbackList::<u32>::new());
        let inner = Arc::clone(&list);
        list.add(move |_| {
            inner.add(|_| {});
        });
        list.dispatch(&1);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_frame_channel_drops_when_full() {
        let (mut color, mut depth, receiver) = FrameChannel::bounded(2);
        depth(&depth_frame(0.0));
        color(&FrameBuffer::invalid());
        depth(&depth_frame(0.2));

        let first = receiver.recv().unwrap();
        assert_eq!(first.kind(), FrameKind::Depth);
        assert_eq!(receiver.recv().unwrap().kind(), FrameKind::Color);
        assert!(receiver.try_recv().is_err());
    }
}
