// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use kinect3d::{ErrorKind, Size};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser)]
#[command(name = "kinect3d")]
#[command(about = "3D video capture and calibration for consumer depth cameras")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the headers of a recorded depth and color stream pair
    Info { depth: PathBuf, color: PathBuf },

    /// Replay a recorded stream pair through the projector
    Replay {
        depth: PathBuf,
        color: PathBuf,

        /// Stop after this many meshes
        #[arg(short, long)]
        frames: Option<u64>,
    },

    /// Capture a depth background from a recorded stream
    CaptureBackground {
        depth: PathBuf,
        color: PathBuf,

        /// Number of depth frames to take the per-pixel minimum over
        #[arg(short, long, default_value = "30")]
        frames: usize,

        /// Background file to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Receive streams from a multiplexing server
    Connect {
        /// Server address as host:port
        address: String,

        /// Stop after this many metaframes
        #[arg(short, long)]
        metaframes: Option<u64>,
    },

    /// Fit the color projection to tie points and write an intrinsic file
    Calibrate {
        /// JSON array of tie point pairs
        tie_points: PathBuf,

        /// Serial number of the calibrated device
        #[arg(short, long)]
        serial: String,

        /// Intrinsic file providing the depth projection and lens distortion
        #[arg(long)]
        depth_projection: Option<PathBuf>,

        /// Color image size as WIDTHxHEIGHT
        #[arg(long, default_value = "640x480", value_parser = parse_size)]
        color_size: Size,

        /// Output directory (default: the configured calibration directory)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Dump an intrinsic parameter file
    ShowIntrinsics { file: PathBuf },
}

fn parse_size(text: &str) -> Result<Size, String> {
    let (width, height) = text
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {}", text))?;
    let width = width.parse().map_err(|e| format!("width: {}", e))?;
    let height = height.parse().map_err(|e| format!("height: {}", e))?;
    Ok(Size::new(width, height))
}

fn main() -> ExitCode {
    // Set RUST_LOG to control the log level, e.g. RUST_LOG=kinect3d=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let result = cli::load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Info { depth, color } => cli::print_info(&depth, &color),
        Commands::Replay {
            depth,
            color,
            frames,
        } => cli::replay(&config, &depth, &color, frames),
        Commands::CaptureBackground {
            depth,
            color,
            frames,
            output,
        } => cli::capture_background(&depth, &color, frames, &output),
        Commands::Connect {
            address,
            metaframes,
        } => cli::connect(&address, metaframes),
        Commands::Calibrate {
            tie_points,
            serial,
            depth_projection,
            color_size,
            output_dir,
        } => cli::calibrate(
            &config,
            &tie_points,
            &serial,
            depth_projection.as_deref(),
            color_size,
            output_dir.as_deref(),
        ),
        Commands::ShowIntrinsics { file } => cli::show_intrinsics(&file),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.kind() == ErrorKind::InvalidArgument {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
