use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use helpers::*;

use board_detection::board_detection::BoardPattern;
use calibration::calibration::{calibrate, save_params, CalibrationOptions};
use frame_selection::frame_selection::{select_frames, SelectionMode, SelectorOptions};

pub mod helpers;

#[derive(Parser)]
#[command(
    version,
    about,
    long_about = "Find camera calibration matrix from chessboard frames picked out of a video"
)]
struct Args {
    /// Path to a video showing the calibration chessboard
    #[arg(short, long)]
    video_path: PathBuf,
    /// Inner corners in the input pattern, columns then rows
    #[arg(short, long, num_args(2..3), default_values_t = vec![8, 6])]
    corners: Vec<u8>,
    /// Physical size of one chessboard cell, e.g. in millimeters
    #[arg(long, default_value_t = 25.0)]
    cell_size: f32,
    /// Keep every frame with a complete detection instead of waiting for the space key
    #[arg(long, default_value_t = false)]
    select_all: bool,
    /// Key poll interval while a frame is displayed, in milliseconds
    #[arg(long, default_value_t = 10)]
    wait_ms: i32,
    /// Write the calibrated parameters to this file (opencv yaml)
    #[arg(long)]
    params_out: Option<PathBuf>,
    /// Write the first selected frame, undistorted, to this image file
    #[arg(long)]
    undistort_sample: Option<PathBuf>,
    #[command(subcommand)]
    initial: Option<CameraIntrinsic>,
}

#[derive(Subcommand)]
pub enum CameraIntrinsic {
    /// Load initial camera parameters from a file
    File {
        ///path to a file containing necesarry parameters
        path: String,
    },
    /// Manually specify initial parameters, any optional values will be set to 0
    Manual {
        /// Focal length in pixel units
        focal_len_x: f64,
        /// Usually the same as `focal_len_x`
        focal_len_y: f64,
        /// Axis skew
        #[arg(default_value_t = 0.0)]
        skew: f64,
        /// Principal offset x coordinate
        #[arg(default_value_t = 0.0)]
        offset_x: f64,
        /// Principal offset y coordinate
        #[arg(default_value_t = 0.0)]
        offset_y: f64,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let pattern = BoardPattern::new(
        args.corners[0].into(),
        args.corners[1].into(),
        args.cell_size,
    );
    let mode = if args.select_all {
        SelectionMode::Auto
    } else {
        SelectionMode::Manual
    };
    let options = SelectorOptions::default()
        .set_mode(mode)
        .set_wait_ms(args.wait_ms);

    let video_path = args
        .video_path
        .to_str()
        .context("video path is not valid UTF-8")?;
    let frames = select_frames(video_path, &pattern, &options)?;
    if frames.is_empty() {
        println!("No frames selected for calibration.");
        return Ok(());
    }
    println!("Selected {} frames", frames.len());

    let calib_options = match args.initial {
        Some(initial) => initial_guess(initial)?,
        None => CalibrationOptions::default(),
    };
    let result = calibrate(&frames, &pattern, calib_options).context("camera calibration failed")?;

    println!("RMS reprojection error: {:.6}", result.rms_error);
    println!("Camera matrix:\n{}", result.format_camera_matrix()?);
    println!("Distortion coefficients:\n{}", result.format_dist_coeffs()?);

    if let Some(path) = &args.params_out {
        let path = path.to_str().context("parameter path is not valid UTF-8")?;
        save_params(path, &result)?;
        log::info!("wrote calibrated parameters to {path}");
    }
    if let Some(path) = &args.undistort_sample {
        write_undistorted_sample(path, &frames[0], &result)?;
        log::info!("wrote undistorted sample to {}", path.display());
    }

    Ok(())
}
