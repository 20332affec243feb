use board_detection::board_detection::{
    find_corners, refine_corners, to_gray, BoardPattern, Cmat, MatError,
};
use opencv::{
    calib3d,
    core::{self, FileStorage, Mat, Point2f, Point3f, Size, TermCriteria, TermCriteria_Type, Vector},
    prelude::*,
};
use rgb::alt::BGR8;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    /// None of the input frames contained a complete chessboard corner set
    #[error("there is no set of complete chessboard points")]
    NoCompleteDetections,
    #[error(transparent)]
    Opencv(#[from] opencv::Error),
    #[error(transparent)]
    Mat(#[from] MatError),
}

/// Optional seeds for the solver. Supplying an initial camera matrix turns on
/// `CALIB_USE_INTRINSIC_GUESS`.
#[derive(Default)]
pub struct CalibrationOptions {
    pub initial_camera_matrix: Option<Mat>,
    pub initial_dist_coeffs: Option<Mat>,
    pub flags: i32,
}

impl CalibrationOptions {
    pub fn set_initial_camera_matrix(mut self, camera_matrix: Mat) -> CalibrationOptions {
        self.initial_camera_matrix = Some(camera_matrix);
        self
    }

    pub fn set_initial_dist_coeffs(mut self, dist_coeffs: Mat) -> CalibrationOptions {
        self.initial_dist_coeffs = Some(dist_coeffs);
        self
    }

    pub fn set_flags(mut self, flags: i32) -> CalibrationOptions {
        self.flags = flags;
        self
    }
}

/// Everything `calibrate_camera` recovers, plus how many frames survived
/// detection.
pub struct CalibrationResult {
    /// 3x3 intrinsic matrix, f64
    pub camera_matrix: Mat,
    pub dist_coeffs: Mat,
    pub rvecs: Vector<Mat>,
    pub tvecs: Vector<Mat>,
    /// RMS reprojection error reported by the solver
    pub rms_error: f64,
    pub used_frames: usize,
}

impl CalibrationResult {
    pub fn format_camera_matrix(&self) -> Result<String, CalibrationError> {
        format_mat(&self.camera_matrix)
    }

    pub fn format_dist_coeffs(&self) -> Result<String, CalibrationError> {
        format_mat(&self.dist_coeffs)
    }
}

/// Recovers camera intrinsics from frames showing the calibration board.
///
/// Every frame is re-detected and refined to sub pixel accuracy; frames
/// without a complete corner set are dropped. Fails before invoking the
/// solver when no frame survives.
pub fn calibrate(
    frames: &[Cmat<BGR8>],
    pattern: &BoardPattern,
    options: CalibrationOptions,
) -> Result<CalibrationResult, CalibrationError> {
    let mut img_points: Vector<Vector<Point2f>> = Vector::new();
    let mut image_size = Size::default();

    for frame in frames {
        let gray = to_gray(frame.mat())?;
        match find_corners(&gray, pattern)? {
            Some(mut corners) => {
                refine_corners(&gray, &mut corners)?;
                image_size = gray.size()?;
                img_points.push(corners);
            }
            None => log::debug!("dropping frame without a complete corner set"),
        }
    }

    if img_points.is_empty() {
        return Err(CalibrationError::NoCompleteDetections);
    }

    let grid = pattern.object_grid();
    let mut obj_points: Vector<Vector<Point3f>> = Vector::with_capacity(img_points.len());
    for _ in 0..img_points.len() {
        obj_points.push(grid.clone());
    }

    solve(&obj_points, &img_points, image_size, options)
}

/// Runs `calibrate_camera` on assembled 2D/3D correspondences.
pub fn solve(
    obj_points: &Vector<Vector<Point3f>>,
    img_points: &Vector<Vector<Point2f>>,
    image_size: Size,
    options: CalibrationOptions,
) -> Result<CalibrationResult, CalibrationError> {
    let used_frames = img_points.len();
    let mut flags = options.flags;

    let mut camera_matrix = match options.initial_camera_matrix {
        Some(camera_matrix) => {
            flags |= calib3d::CALIB_USE_INTRINSIC_GUESS;
            camera_matrix
        }
        None => Mat::default(),
    };
    let mut dist_coeffs = options.initial_dist_coeffs.unwrap_or_default();
    let mut rvecs: Vector<Mat> = Vector::new();
    let mut tvecs: Vector<Mat> = Vector::new();

    let rms_error = calib3d::calibrate_camera(
        obj_points,
        img_points,
        image_size,
        &mut camera_matrix,
        &mut dist_coeffs,
        &mut rvecs,
        &mut tvecs,
        flags,
        // Listed as the default TermCriteria for this method in the OpenCV docs.
        TermCriteria::new(
            TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
            30,
            f64::EPSILON,
        )?,
    )?;

    Ok(CalibrationResult {
        camera_matrix,
        dist_coeffs,
        rvecs,
        tvecs,
        rms_error,
        used_frames,
    })
}

/// Removes lens distortion from `frame` using calibrated parameters. The
/// corrected view keeps the frame resolution; cropping is left to the caller.
pub fn undistort_frame(
    frame: &Cmat<BGR8>,
    result: &CalibrationResult,
) -> Result<Cmat<BGR8>, CalibrationError> {
    let size = frame.size()?;
    let optimal = calib3d::get_optimal_new_camera_matrix(
        &result.camera_matrix,
        &result.dist_coeffs,
        size,
        0.0,
        size,
        None,
        false,
    )?;

    let mut corrected = Mat::default();
    calib3d::undistort(
        frame.mat(),
        &mut corrected,
        &result.camera_matrix,
        &result.dist_coeffs,
        &optimal,
    )?;
    Ok(Cmat::from_mat(corrected)?)
}

pub fn save_params(path: &str, result: &CalibrationResult) -> Result<(), CalibrationError> {
    let mut fs = FileStorage::new(path, core::FileStorage_WRITE, "")?;

    fs.write_mat("camera_matrix", &result.camera_matrix)?;
    fs.write_mat("dist_coeffs", &result.dist_coeffs)?;

    fs.release()?;
    Ok(())
}

pub fn load_params(path: &str) -> Result<(Mat, Mat), CalibrationError> {
    let mut fs = FileStorage::new(path, core::FileStorage_READ, "")?;

    let camera_matrix = fs.get("camera_matrix")?.mat()?;
    let dist_coeffs = fs.get("dist_coeffs")?.mat()?;

    fs.release()?;
    Ok((camera_matrix, dist_coeffs))
}

fn format_mat(mat: &Mat) -> Result<String, CalibrationError> {
    let mut out = String::new();
    for row in 0..mat.rows() {
        if row > 0 {
            out.push('\n');
        }
        for col in 0..mat.cols() {
            if col > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{:>12.6}", mat.at_2d::<f64>(row, col)?));
        }
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use opencv::{
        core::{Point2f, Rect, Scalar, CV_64F, CV_8UC3, DECOMP_LU, NORM_INF},
        imgproc,
        types::VectorOfPoint2f,
    };

    use super::*;

    fn camera_matrix(fx: f64, fy: f64, cx: f64, cy: f64) -> Mat {
        let mut k = Mat::zeros(3, 3, CV_64F).unwrap().to_mat().unwrap();
        *k.at_2d_mut::<f64>(0, 0).unwrap() = fx;
        *k.at_2d_mut::<f64>(1, 1).unwrap() = fy;
        *k.at_2d_mut::<f64>(0, 2).unwrap() = cx;
        *k.at_2d_mut::<f64>(1, 2).unwrap() = cy;
        *k.at_2d_mut::<f64>(2, 2).unwrap() = 1.0;
        k
    }

    fn zero_dist() -> Mat {
        Mat::zeros(1, 5, CV_64F).unwrap().to_mat().unwrap()
    }

    fn blank_frame(width: i32, height: i32) -> Cmat<BGR8> {
        let mat =
            Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(128.0)).unwrap();
        Cmat::from_mat(mat).unwrap()
    }

    /// White-bordered chessboard with (cols + 1) x (rows + 1) cells, so the
    /// pattern has exactly `pattern.cols` x `pattern.rows` inner corners.
    fn render_board(pattern: &BoardPattern, cell_px: i32, margin: i32) -> Mat {
        let width = (pattern.cols + 1) * cell_px + 2 * margin;
        let height = (pattern.rows + 1) * cell_px + 2 * margin;
        let mut board =
            Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(255.0)).unwrap();

        for square_row in 0..(pattern.rows + 1) {
            for square_col in 0..(pattern.cols + 1) {
                if (square_row + square_col) % 2 == 0 {
                    let rect = Rect::new(
                        margin + square_col * cell_px,
                        margin + square_row * cell_px,
                        cell_px,
                        cell_px,
                    );
                    imgproc::rectangle(
                        &mut board,
                        rect,
                        Scalar::all(0.0),
                        imgproc::FILLED,
                        imgproc::LINE_8,
                        0,
                    )
                    .unwrap();
                }
            }
        }
        board
    }

    fn warp_view(board: &Mat, quad: [(f32, f32); 4], canvas: Size) -> Cmat<BGR8> {
        let size = board.size().unwrap();
        let mut src = VectorOfPoint2f::new();
        src.push(Point2f::new(0.0, 0.0));
        src.push(Point2f::new(size.width as f32, 0.0));
        src.push(Point2f::new(size.width as f32, size.height as f32));
        src.push(Point2f::new(0.0, size.height as f32));

        let mut dst = VectorOfPoint2f::new();
        for (x, y) in quad {
            dst.push(Point2f::new(x, y));
        }

        let homography = imgproc::get_perspective_transform(&src, &dst, DECOMP_LU).unwrap();
        let mut view = Mat::default();
        imgproc::warp_perspective(
            board,
            &mut view,
            &homography,
            canvas,
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            Scalar::all(255.0),
        )
        .unwrap();
        Cmat::from_mat(view).unwrap()
    }

    #[test]
    fn empty_input_fails_before_the_solver() {
        let pattern = BoardPattern::new(8, 6, 25.0);
        let res = calibrate(&[], &pattern, CalibrationOptions::default());
        assert!(matches!(res, Err(CalibrationError::NoCompleteDetections)));
    }

    #[test]
    fn frames_without_a_board_fail_before_the_solver() {
        let pattern = BoardPattern::new(8, 6, 25.0);
        let frames = vec![blank_frame(320, 240), blank_frame(320, 240)];
        let res = calibrate(&frames, &pattern, CalibrationOptions::default());
        assert!(matches!(res, Err(CalibrationError::NoCompleteDetections)));
    }

    #[test]
    fn solver_recovers_the_synthesizing_camera() {
        let pattern = BoardPattern::new(8, 6, 25.0);
        let truth = camera_matrix(800.0, 800.0, 320.0, 240.0);
        let grid = pattern.object_grid();

        let poses: [([f64; 3], [f64; 3]); 4] = [
            ([0.0, 0.0, 0.0], [-80.0, -60.0, 400.0]),
            ([0.2, 0.0, 0.0], [-60.0, -70.0, 420.0]),
            ([0.0, -0.25, 0.0], [-90.0, -50.0, 380.0]),
            ([0.15, 0.2, 0.1], [-70.0, -60.0, 450.0]),
        ];

        let mut obj_points: Vector<Vector<Point3f>> = Vector::new();
        let mut img_points: Vector<Vector<Point2f>> = Vector::new();
        for (rvec, tvec) in poses {
            let mut projected = VectorOfPoint2f::new();
            calib3d::project_points_def(
                &grid,
                &Vector::from_slice(&rvec),
                &Vector::from_slice(&tvec),
                &truth,
                &zero_dist(),
                &mut projected,
            )
            .unwrap();
            obj_points.push(grid.clone());
            img_points.push(projected);
        }

        let result = solve(
            &obj_points,
            &img_points,
            Size::new(640, 480),
            CalibrationOptions::default(),
        )
        .unwrap();

        assert_eq!(result.used_frames, 4);
        assert_eq!(result.rvecs.len(), 4);
        assert_eq!(result.tvecs.len(), 4);
        assert!(result.rms_error < 1e-3);

        let fx = *result.camera_matrix.at_2d::<f64>(0, 0).unwrap();
        let fy = *result.camera_matrix.at_2d::<f64>(1, 1).unwrap();
        assert!((fx - 800.0).abs() < 1.0, "fx = {fx}");
        assert!((fy - 800.0).abs() < 1.0, "fy = {fy}");
    }

    #[test]
    fn rendered_views_calibrate_end_to_end() {
        let pattern = BoardPattern::new(4, 3, 30.0);
        let board = render_board(&pattern, 60, 60);
        let canvas = Size::new(640, 480);

        let frames = vec![
            warp_view(&board, [(80.0, 60.0), (560.0, 70.0), (550.0, 420.0), (90.0, 410.0)], canvas),
            warp_view(&board, [(120.0, 40.0), (600.0, 90.0), (580.0, 430.0), (100.0, 380.0)], canvas),
            warp_view(&board, [(60.0, 100.0), (520.0, 50.0), (590.0, 400.0), (110.0, 440.0)], canvas),
        ];

        let result = calibrate(&frames, &pattern, CalibrationOptions::default()).unwrap();

        assert_eq!(result.used_frames, 3);
        let fx = *result.camera_matrix.at_2d::<f64>(0, 0).unwrap();
        let fy = *result.camera_matrix.at_2d::<f64>(1, 1).unwrap();
        assert!(fx.is_finite() && fx > 0.0, "fx = {fx}");
        assert!(fy.is_finite() && fy > 0.0, "fy = {fy}");
    }

    #[test]
    fn undistorting_without_distortion_changes_nothing() {
        let result = CalibrationResult {
            camera_matrix: camera_matrix(100.0, 100.0, 50.0, 50.0),
            dist_coeffs: zero_dist(),
            rvecs: Vector::new(),
            tvecs: Vector::new(),
            rms_error: 0.0,
            used_frames: 1,
        };

        let mut mat =
            Mat::new_rows_cols_with_default(100, 100, CV_8UC3, Scalar::all(200.0)).unwrap();
        imgproc::rectangle(
            &mut mat,
            Rect::new(20, 30, 40, 25),
            Scalar::new(10.0, 60.0, 250.0, 0.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let frame = Cmat::<BGR8>::copy_of(&mat).unwrap();

        let corrected = undistort_frame(&frame, &result).unwrap();
        assert_eq!(corrected.size().unwrap(), frame.size().unwrap());

        let diff = core::norm2(frame.mat(), corrected.mat(), NORM_INF, &Mat::default()).unwrap();
        assert!(diff <= 1.0, "max channel difference {diff}");
    }

    #[test]
    fn params_survive_a_save_load_round_trip() {
        let mut dist_coeffs = zero_dist();
        *dist_coeffs.at_2d_mut::<f64>(0, 0).unwrap() = 0.1;
        *dist_coeffs.at_2d_mut::<f64>(0, 1).unwrap() = -0.05;
        let result = CalibrationResult {
            camera_matrix: camera_matrix(812.5, 808.25, 331.0, 239.5),
            dist_coeffs,
            rvecs: Vector::new(),
            tvecs: Vector::new(),
            rms_error: 0.0,
            used_frames: 0,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yml");
        let path = path.to_str().unwrap();

        save_params(path, &result).unwrap();
        let (camera_matrix, dist_coeffs) = load_params(path).unwrap();

        for row in 0..3 {
            for col in 0..3 {
                assert_eq!(
                    camera_matrix.at_2d::<f64>(row, col).unwrap(),
                    result.camera_matrix.at_2d::<f64>(row, col).unwrap()
                );
            }
        }
        assert_eq!(*dist_coeffs.at_2d::<f64>(0, 0).unwrap(), 0.1);
        assert_eq!(*dist_coeffs.at_2d::<f64>(0, 1).unwrap(), -0.05);
    }

    #[test]
    fn camera_matrix_formats_row_per_line() {
        let result = CalibrationResult {
            camera_matrix: camera_matrix(800.0, 799.5, 320.0, 240.0),
            dist_coeffs: zero_dist(),
            rvecs: Vector::new(),
            tvecs: Vector::new(),
            rms_error: 0.0,
            used_frames: 0,
        };

        let report = result.format_camera_matrix().unwrap();
        assert_eq!(report.lines().count(), 3);
        assert!(report.contains("800.000000"));
        assert!(report.contains("799.500000"));

        assert_eq!(result.format_dist_coeffs().unwrap().lines().count(), 1);
    }
}
