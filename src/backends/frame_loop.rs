// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for streaming loops
//!
//! Every frame source runs its producer threads through
//! [`StreamLoopController`]. A loop iteration returns a [`LoopAction`]; an
//! error ends the loop, is logged once, and marks the controller faulted.

use crate::errors::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Action returned by the loop callback to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Continue running the loop
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// Stop flag that sleeping loops can wait on
///
/// `sleep_until` returns early as soon as a stop is requested, so paced
/// loops shut down without waiting out their frame interval.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        self.wake.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `deadline` or a stop request; true if stopped
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = match self.wake.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }
}

/// Controller for a streaming loop running in a separate thread
///
/// # Example
///
/// ```ignore
/// let controller = StreamLoopController::start("depth-replay", move |stop| {
///     match reader.read_next(&mut input)? {
///         Some(frame) => {
///             callback(&frame);
///             Ok(LoopAction::Continue)
///         }
///         None => Ok(LoopAction::Stop),
///     }
/// });
///
/// // Later, stop the loop
/// controller.stop();
/// ```
pub struct StreamLoopController {
    /// Thread handle for joining
    thread_handle: Option<JoinHandle<()>>,
    /// Signal to stop the loop
    stop_signal: Arc<StopSignal>,
    /// Set when the loop ended on an error
    faulted: Arc<AtomicBool>,
    /// Name for logging
    name: String,
}

impl StreamLoopController {
    /// Start a new loop in a separate thread
    ///
    /// The closure is called repeatedly until it returns `LoopAction::Stop`,
    /// returns an error, or the controller's `stop()` method is called. It
    /// receives the stop signal so it can sleep interruptibly.
    pub fn start<F>(name: &str, loop_fn: F) -> Self
    where
        F: FnMut(&StopSignal) -> Result<LoopAction> + Send + 'static,
    {
        Self::start_with_exit(name, loop_fn, || {})
    }

    /// Start a loop that runs `on_exit` on its own thread once it ends,
    /// whatever the reason
    pub fn start_with_exit<F, E>(name: &str, mut loop_fn: F, on_exit: E) -> Self
    where
        F: FnMut(&StopSignal) -> Result<LoopAction> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let stop_signal = StopSignal::new();
        let stop_signal_clone = Arc::clone(&stop_signal);
        let faulted = Arc::new(AtomicBool::new(false));
        let faulted_clone = Arc::clone(&faulted);
        let name_clone = name.to_string();

        info!(name = %name, "Starting streaming loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Streaming loop thread started");

                loop {
                    if stop_signal_clone.is_requested() {
                        debug!(name = %name_clone, "Stop signal received");
                        break;
                    }

                    match loop_fn(&stop_signal_clone) {
                        Ok(LoopAction::Continue) => {}
                        Ok(LoopAction::Stop) => {
                            debug!(name = %name_clone, "Loop requested stop");
                            break;
                        }
                        Err(e) => {
                            error!(name = %name_clone, error = %e, "Terminating streaming loop");
                            faulted_clone.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }

                on_exit();
                info!(name = %name_clone, "Streaming loop thread exiting");
            });

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(name = %name, error = %e, "Failed to spawn streaming thread");
                faulted.store(true, Ordering::SeqCst);
                None
            }
        };

        Self {
            thread_handle,
            stop_signal,
            faulted,
            name: name.to_string(),
        }
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// True once the loop ended on an error
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Get a clone of the stop signal for external use
    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop_signal)
    }

    /// Signal the loop to stop (non-blocking)
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting streaming loop stop");
        self.stop_signal.request();
    }

    /// Stop the loop and wait for the thread to finish
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Stop the loop, waiting at most `timeout` for the thread to finish
    ///
    /// A thread still running after `timeout`, e.g. blocked in a read, is
    /// detached and ends on its own. Returns whether the thread was joined.
    pub fn stop_within(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        let deadline = Instant::now() + timeout;
        while self.thread_handle.as_ref().is_some_and(|h| !h.is_finished()) {
            if Instant::now() >= deadline {
                warn!(name = %self.name, ?timeout, "Streaming loop did not stop in time, detaching");
                self.thread_handle = None;
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.join();
        true
    }

    /// Wait for the thread to finish without sending stop signal
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            debug!(name = %self.name, "Waiting for streaming loop thread to finish");
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Streaming loop thread panicked: {:?}", e);
            } else {
                debug!(name = %self.name, "Streaming loop thread finished");
            }
        }
    }
}

impl Drop for StreamLoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "StreamLoopController dropped, stopping loop");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Kinect3dError;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_basic_loop() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut controller = StreamLoopController::start("test-loop", move |_| {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(if count >= 10 {
                LoopAction::Stop
            } else {
                LoopAction::Continue
            })
        });

        controller.join();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert!(!controller.is_faulted());
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let mut controller = StreamLoopController::start("test-sleep", |stop| {
            stop.sleep(Duration::from_secs(30));
            Ok(LoopAction::Continue)
        });

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        controller.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_within_detaches_blocked_loop() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let mut controller = StreamLoopController::start("test-blocked", move |_| {
            Ok(match rx.recv() {
                Ok(()) => LoopAction::Continue,
                Err(_) => LoopAction::Stop,
            })
        });

        let started = Instant::now();
        assert!(!controller.stop_within(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!controller.is_running());
        drop(tx);

        let mut quick = StreamLoopController::start("test-quick", |stop| {
            stop.sleep(Duration::from_secs(30));
            Ok(LoopAction::Continue)
        });
        assert!(quick.stop_within(Duration::from_secs(5)));
    }

    #[test]
    fn test_error_marks_faulted() {
        let exited = Arc::new(AtomicBool::new(false));
        let exited_clone = Arc::clone(&exited);
        let mut controller = StreamLoopController::start_with_exit(
            "test-fault",
            |_| Err(Kinect3dError::protocol("truncated frame")),
            move || exited_clone.store(true, Ordering::SeqCst),
        );

        controller.join();
        assert!(controller.is_faulted());
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_is_running() {
        let controller = StreamLoopController::start("test-running", |stop| {
            stop.sleep(Duration::from_millis(100));
            Ok(LoopAction::Continue)
        });

        assert!(controller.is_running());

        // Drop will stop it
        drop(controller);
    }
}
