use std::path::Path;

use anyhow::Context;
use board_detection::board_detection::Cmat;
use calibration::calibration::{load_params, undistort_frame, CalibrationOptions, CalibrationResult};
use opencv::{
    core::{Mat, Vector, CV_64F},
    imgcodecs,
    prelude::*,
};
use rgb::alt::BGR8;

use crate::CameraIntrinsic;

/// Calibration options seeded with user supplied intrinsics.
pub fn initial_guess(intrinsic: CameraIntrinsic) -> anyhow::Result<CalibrationOptions> {
    let options = match intrinsic {
        CameraIntrinsic::File { path } => {
            let (camera_matrix, dist_coeffs) =
                load_params(&path).context("failed to load initial camera parameters")?;
            CalibrationOptions::default()
                .set_initial_camera_matrix(camera_matrix)
                .set_initial_dist_coeffs(dist_coeffs)
        }
        CameraIntrinsic::Manual {
            focal_len_x,
            focal_len_y,
            skew,
            offset_x,
            offset_y,
        } => CalibrationOptions::default().set_initial_camera_matrix(camera_matrix_from(
            focal_len_x,
            focal_len_y,
            skew,
            offset_x,
            offset_y,
        )?),
    };
    Ok(options)
}

pub fn camera_matrix_from(
    focal_len_x: f64,
    focal_len_y: f64,
    skew: f64,
    offset_x: f64,
    offset_y: f64,
) -> anyhow::Result<Mat> {
    let mut camera_matrix = Mat::zeros(3, 3, CV_64F)?.to_mat()?;
    *camera_matrix.at_2d_mut::<f64>(0, 0)? = focal_len_x;
    *camera_matrix.at_2d_mut::<f64>(0, 1)? = skew;
    *camera_matrix.at_2d_mut::<f64>(0, 2)? = offset_x;
    *camera_matrix.at_2d_mut::<f64>(1, 1)? = focal_len_y;
    *camera_matrix.at_2d_mut::<f64>(1, 2)? = offset_y;
    *camera_matrix.at_2d_mut::<f64>(2, 2)? = 1.0;
    Ok(camera_matrix)
}

pub fn write_undistorted_sample(
    path: &Path,
    frame: &Cmat<BGR8>,
    result: &CalibrationResult,
) -> anyhow::Result<()> {
    let corrected = undistort_frame(frame, result)?;
    let path = path.to_str().context("sample path is not valid UTF-8")?;
    imgcodecs::imwrite(path, corrected.mat(), &Vector::new())?
        .then_some(())
        .context("image writer rejected the output path")?;
    Ok(())
}
