// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for stream inspection, replay and calibration
//!
//! This module provides command-line functionality for:
//! - Inspecting recorded streams and intrinsic files
//! - Replaying recorded streams through the projector
//! - Capturing depth backgrounds
//! - Receiving multiplexed streams
//! - Fitting color projections to tie points

use kinect3d::backends::file::FileFrameSource;
use kinect3d::backends::multiplexed::MultiplexedSource;
use kinect3d::backends::FrameSource;
use kinect3d::calibration::{IntrinsicParameters, LensDistortion, TiePointSolver};
use kinect3d::codecs::IntrinsicFile;
use kinect3d::geometry::ProjectiveTransform;
use kinect3d::projector::Projector;
use kinect3d::{Config, FrameKind, Kinect3dError, Result, Size};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

/// Set on Ctrl+C; commands poll it while streaming
fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        warn!(error = %e, "Could not install Ctrl+C handler");
    }
    flag
}

fn print_matrix(name: &str, transform: &ProjectiveTransform) {
    println!("  {}:", name);
    for row in transform.rows() {
        println!(
            "    [{:>14.6} {:>14.6} {:>14.6} {:>14.6}]",
            row[0], row[1], row[2], row[3]
        );
    }
}

fn print_lens(name: &str, lens: &LensDistortion) {
    if lens.is_identity() {
        println!("  {}: none", name);
    } else {
        println!(
            "  {}: center ({:.3}, {:.3}) kappa {:?} rho {:?}",
            name, lens.center[0], lens.center[1], lens.kappa, lens.rho
        );
    }
}

/// Print the headers of a recorded stream pair
pub fn print_info(depth: &Path, color: &Path) -> Result<()> {
    let source = FileFrameSource::open(depth, color)?;
    let depth_header = source.depth_header();
    let color_header = source.color_header();

    println!("Depth stream {}", depth.display());
    println!("  version: {}", depth_header.version);
    println!("  frame size: {}", depth_header.frame_size);
    println!("  lossy: {}", depth_header.calibration.lossy);
    match &depth_header.calibration.depth_correction {
        Some(dc) => println!(
            "  depth correction: degree {} over {} segments",
            dc.degree(),
            dc.num_segments()
        ),
        None => println!("  depth correction: none"),
    }
    print_lens("lens distortion", &depth_header.calibration.lens_distortion);
    print_matrix("depth projection", &depth_header.depth_projection);
    print_matrix("extrinsics", &depth_header.extrinsics.transform);
    println!();

    println!("Color stream {}", color.display());
    println!("  version: {}", color_header.version);
    println!("  frame size: {}", color_header.frame_size);
    print_lens("lens distortion", &color_header.lens_distortion);
    print_matrix("color projection", &color_header.color_projection);
    Ok(())
}

/// Stream a recorded pair through the projector and log mesh statistics
pub fn replay(config: &Config, depth: &Path, color: &Path, frames: Option<u64>) -> Result<()> {
    let mut source = FileFrameSource::open(depth, color)?;
    source.set_realtime(config.file_source.realtime);

    let projector = Arc::new(Projector::for_source(&source));
    config.projector.apply(&projector)?;

    let meshes = Arc::new(AtomicU64::new(0));
    let triangles = Arc::new(AtomicU64::new(0));
    let meshes_cb = Arc::clone(&meshes);
    let triangles_cb = Arc::clone(&triangles);
    projector.start_streaming(Some(Box::new(move |mesh| {
        let count = meshes_cb.fetch_add(1, Ordering::SeqCst) + 1;
        triangles_cb.fetch_add(mesh.triangle_count() as u64, Ordering::SeqCst);
        info!(
            mesh = count,
            time_stamp = mesh.time_stamp,
            vertices = mesh.vertices.len(),
            triangles = mesh.triangle_count(),
            "Projected depth frame"
        );
    })))?;

    let color_projector = Arc::clone(&projector);
    let depth_projector = Arc::clone(&projector);
    source.start_streaming(
        Box::new(move |frame| color_projector.set_color_frame(frame)),
        Box::new(move |frame| depth_projector.set_depth_frame(frame)),
    )?;

    let interrupted = interrupt_flag();
    while !source.is_finished()
        && !source.is_faulted()
        && !interrupted.load(Ordering::SeqCst)
        && frames.is_none_or(|limit| meshes.load(Ordering::SeqCst) < limit)
    {
        std::thread::sleep(POLL_INTERVAL);
    }
    let faulted = source.is_faulted();
    source.stop_streaming()?;
    // Let the projector drain the last pending frame
    std::thread::sleep(POLL_INTERVAL);
    projector.stop_streaming();

    let meshes = meshes.load(Ordering::SeqCst);
    println!(
        "Projected {} meshes, {} triangles on average",
        meshes,
        triangles.load(Ordering::SeqCst) / meshes.max(1)
    );
    if faulted {
        return Err(Kinect3dError::protocol("stream ended on a read error"));
    }
    Ok(())
}

/// Capture a depth background from a recorded stream and save it
pub fn capture_background(depth: &Path, color: &Path, frames: usize, output: &Path) -> Result<()> {
    let mut source = FileFrameSource::open(depth, color)?;
    source.set_realtime(false);

    let (done_tx, done_rx) = mpsc::channel();
    source.capture_background(
        frames,
        true,
        Some(Box::new(move || {
            let _ = done_tx.send(());
        })),
    )?;
    source.start_streaming(Box::new(|_| {}), Box::new(|_| {}))?;

    let mut captured = false;
    while !source.is_finished() && !source.is_faulted() {
        if done_rx.recv_timeout(POLL_INTERVAL).is_ok() {
            captured = true;
            break;
        }
    }
    // Completion may race with the end of the stream
    captured |= done_rx.try_recv().is_ok();
    source.stop_streaming()?;

    if !captured {
        return Err(Kinect3dError::invalid_argument(format!(
            "stream ended before {} depth frames were captured",
            frames
        )));
    }
    source.save_background(output)?;
    println!("Saved background to {}", output.display());
    Ok(())
}

/// Receive a multiplexed session and log delivered metaframes
pub fn connect(address: &str, metaframes: Option<u64>) -> Result<()> {
    let source = MultiplexedSource::connect(address)?;
    println!(
        "Connected to {} (server version {}, {} streams)",
        address,
        source.server_version(),
        source.num_streams()
    );

    let mut streams = Vec::with_capacity(source.num_streams());
    for index in 0..source.num_streams() {
        let mut stream = source.stream(index)?;
        println!(
            "  stream {}: color {} depth {}",
            index,
            stream.actual_frame_size(FrameKind::Color),
            stream.actual_frame_size(FrameKind::Depth)
        );
        stream.start_streaming(
            Box::new(|_| {}),
            Box::new(move |frame| {
                tracing::debug!(stream = index, time_stamp = frame.time_stamp(), "Depth frame");
            }),
        )?;
        streams.push(stream);
    }

    let interrupted = interrupt_flag();
    let mut reported = 0;
    while !source.is_finished() && !interrupted.load(Ordering::SeqCst) {
        let delivered = source.metaframes_delivered();
        if delivered != reported {
            info!(metaframes = delivered, "Received metaframes");
            reported = delivered;
        }
        if metaframes.is_some_and(|limit| delivered >= limit) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    for stream in &mut streams {
        stream.stop_streaming()?;
    }
    println!("Received {} metaframes", source.metaframes_delivered());
    if source.is_faulted() {
        return Err(Kinect3dError::protocol("session ended on a stream error"));
    }
    Ok(())
}

/// Fit a color projection to tie points and write the device's intrinsic file
pub fn calibrate(
    config: &Config,
    tie_points: &Path,
    serial: &str,
    depth_intrinsics: Option<&Path>,
    color_size: Size,
    output_dir: Option<&Path>,
) -> Result<()> {
    let solver = TiePointSolver::load_json(tie_points)?;
    let depth = match depth_intrinsics {
        Some(path) => IntrinsicFile::load(path)?.0,
        None => IntrinsicParameters::default(),
    };
    let dir = output_dir.unwrap_or(&config.calibration.config_dir);
    std::fs::create_dir_all(dir)?;

    let (path, solution) = solver.write_intrinsics(dir, serial, color_size, &depth)?;
    println!(
        "Fitted {} tie points: RMS {:.4} px, max {:.4} px",
        solver.len(),
        solution.rms,
        solution.max
    );
    println!("Wrote {}", path.display());
    Ok(())
}

/// Dump an intrinsic parameter file
pub fn show_intrinsics(file: &Path) -> Result<()> {
    let (ips, layout) = IntrinsicFile::load(file)?;
    println!("Intrinsic parameters {} ({:?} layout)", file.display(), layout);
    print_lens("depth lens distortion", &ips.depth_lens_distortion);
    print_matrix("depth projection", &ips.depth_projection);
    print_lens("color lens distortion", &ips.color_lens_distortion);
    print_matrix("color projection", &ips.color_projection);
    Ok(())
}
