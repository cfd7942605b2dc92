// SPDX-License-Identifier: MPL-2.0

//! Integration tests for replaying recorded stream files

mod common;

use kinect3d::backends::FrameSource;
use kinect3d::backends::file::FileFrameSource;
use kinect3d::codecs::BackgroundFile;
use kinect3d::{DepthPixel, ErrorKind, FrameBuffer, FrameKind, INVALID_DEPTH, Size};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SIZE: Size = Size::new(12, 8);
const WALL: DepthPixel = 1000;
const OBJECT: DepthPixel = 500;
const CAPTURE_FRAMES: usize = 30;

/// Wall with one-unit noise; from frame 30 on a column at depth 500 sweeps across
fn scene(frames: usize) -> Vec<Vec<DepthPixel>> {
    (0..frames)
        .map(|k| {
            let mut depths = Vec::with_capacity(SIZE.volume());
            for y in 0..SIZE.height {
                for x in 0..SIZE.width {
                    let object = k >= CAPTURE_FRAMES
                        && x as usize == (k - CAPTURE_FRAMES) % SIZE.width as usize;
                    depths.push(if object {
                        OBJECT
                    } else {
                        WALL + ((x + y + k as u32) % 2) as DepthPixel
                    });
                }
            }
            depths
        })
        .collect()
}

fn open(frames: &[Vec<DepthPixel>], color_frames: usize) -> FileFrameSource {
    let mut source = FileFrameSource::from_readers(
        Cursor::new(common::depth_stream(SIZE, frames, 0.01)),
        Cursor::new(common::color_stream(SIZE, color_frames, 0.01)),
    )
    .unwrap();
    source.set_realtime(false);
    source
}

#[test]
fn test_background_capture_removes_wall() {
    let frames = scene(CAPTURE_FRAMES + 10);
    let mut source = open(&frames, 0);
    let completed = Arc::new(AtomicUsize::new(0));
    let completed_cb = Arc::clone(&completed);
    source
        .capture_background(
            CAPTURE_FRAMES,
            true,
            Some(Box::new(move || {
                completed_cb.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    assert!(source.is_capturing_background());

    let seen: Arc<Mutex<Vec<FrameBuffer>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    source
        .start_streaming(
            Box::new(|_| {}),
            Box::new(move |frame| sink.lock().unwrap().push(frame.clone())),
        )
        .unwrap();
    assert!(common::wait_until(|| source.is_finished()));
    source.stop_streaming().unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(!source.is_capturing_background());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), frames.len());
    for (k, frame) in seen.iter().enumerate().skip(CAPTURE_FRAMES) {
        let column = (k - CAPTURE_FRAMES) % SIZE.width as usize;
        let depths = frame.as_depth().unwrap();
        for y in 0..SIZE.height {
            for x in 0..SIZE.width {
                let d = depths[SIZE.index(x, y)];
                if x as usize == column {
                    assert_eq!(d, OBJECT, "object pixel ({}, {}) in frame {}", x, y, k);
                } else {
                    assert_eq!(d, INVALID_DEPTH, "wall pixel ({}, {}) in frame {}", x, y, k);
                }
            }
        }
    }

    // The stored background is the per-pixel minimum minus the fuzz
    let background = source.background().unwrap();
    assert!(background.iter().all(|&b| b == WALL - 2));
}

#[test]
fn test_background_file_round_trip() {
    let frames = scene(CAPTURE_FRAMES);
    let mut source = open(&frames, 0);
    source
        .capture_background(CAPTURE_FRAMES, true, None)
        .unwrap();
    source
        .start_streaming(Box::new(|_| {}), Box::new(|_| {}))
        .unwrap();
    assert!(common::wait_until(|| source.is_finished()));
    source.stop_streaming().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Background-0000.background");
    source.save_background(&path).unwrap();
    let file = BackgroundFile::load(&path).unwrap();
    assert_eq!(file.size, SIZE);
    assert_eq!(Some(file.depths.clone()), source.background());

    let other = open(&frames, 0);
    other.load_background(&path).unwrap();
    assert_eq!(other.background(), source.background());

    let small = BackgroundFile {
        size: Size::new(2, 2),
        depths: vec![0; 4],
    };
    let small_path = dir.path().join("small.background");
    small.save(&small_path).unwrap();
    assert_eq!(
        other.load_background(&small_path).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_no_callback_after_stop_streaming() {
    let frames = scene(40);
    let mut source = open(&frames, 40);
    let stopped = Arc::new(AtomicBool::new(false));
    let late_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let callback = |stopped: Arc<AtomicBool>, late: Arc<AtomicUsize>, calls: Arc<AtomicUsize>| {
        Box::new(move |_: &FrameBuffer| {
            if stopped.load(Ordering::SeqCst) {
                late.fetch_add(1, Ordering::SeqCst);
            }
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
        })
    };
    source
        .start_streaming(
            callback(
                Arc::clone(&stopped),
                Arc::clone(&late_calls),
                Arc::clone(&calls),
            ),
            callback(
                Arc::clone(&stopped),
                Arc::clone(&late_calls),
                Arc::clone(&calls),
            ),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    source.stop_streaming().unwrap();
    stopped.store(true, Ordering::SeqCst);

    let calls_at_stop = calls.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), calls_at_stop);
    assert!(!source.is_finished());
    assert!(!source.is_streaming());
}

#[test]
fn test_fewer_frames_than_requested_ends_cleanly() {
    let frames = scene(3);
    let mut source = open(&frames, 1);
    let ended = Arc::new(AtomicBool::new(false));
    let ended_cb = Arc::clone(&ended);
    source.set_end_of_stream_callback(Box::new(move || ended_cb.store(true, Ordering::SeqCst)));
    source.capture_background(10, true, None).unwrap();
    source
        .start_streaming(Box::new(|_| {}), Box::new(|_| {}))
        .unwrap();
    assert!(common::wait_until(|| ended.load(Ordering::SeqCst)));
    source.stop_streaming().unwrap();
    assert!(source.is_capturing_background());
    assert_eq!(source.actual_frame_size(FrameKind::Color), SIZE);
}
