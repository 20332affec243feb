use std::marker::PhantomData;

use opencv::{
    calib3d::{self, CALIB_CB_ADAPTIVE_THRESH},
    core::{
        DataType, Mat, Point2f, Point3f, Size, TermCriteria, TermCriteria_Type, ToInputArray,
        Vector, _InputArray,
    },
    imgproc,
    prelude::*,
};
use thiserror::Error;

const REFINE_WINDOW: i32 = 11;
const REFINE_MAX_ITER: i32 = 30;
const REFINE_EPSILON: f64 = 0.001;

#[derive(Debug, Error)]
pub enum MatError {
    /// The wrapped mat holds elements of a different opencv type than requested
    #[error("expected mat elements of opencv type {expected}, found {actual}")]
    TypeMismatch { expected: i32, actual: i32 },
    #[error(transparent)]
    Opencv(#[from] opencv::Error),
}

/// [Mat] wrapper whose element type is tracked in the type system.
///
/// Construction checks the runtime type of the mat against `T`, so every
/// `Cmat<T>` in circulation is known to hold `T` elements.
pub struct Cmat<T> {
    mat: Mat,
    _marker: PhantomData<T>,
}

impl<T: DataType> Cmat<T> {
    pub fn from_mat(mat: Mat) -> Result<Self, MatError> {
        if mat.typ() != T::opencv_type() {
            return Err(MatError::TypeMismatch {
                expected: T::opencv_type(),
                actual: mat.typ(),
            });
        }
        Ok(Cmat {
            mat,
            _marker: PhantomData,
        })
    }

    /// Deep copy of `mat`, leaving the source untouched.
    pub fn copy_of(mat: &Mat) -> Result<Self, MatError> {
        Self::from_mat(mat.try_clone()?)
    }

    pub fn mat(&self) -> &Mat {
        &self.mat
    }

    pub fn into_mat(self) -> Mat {
        self.mat
    }

    pub fn at_2d(&self, row: i32, col: i32) -> Result<&T, MatError> {
        self.mat.at_2d::<T>(row, col).map_err(MatError::from)
    }

    pub fn size(&self) -> Result<Size, MatError> {
        self.mat.size().map_err(MatError::from)
    }
}

impl<T: DataType> ToInputArray for Cmat<T> {
    fn input_array(&self) -> opencv::Result<_InputArray> {
        self.mat.input_array()
    }
}

/// Inner corner layout of the calibration chessboard and the physical size of
/// one cell, in whatever unit the caller works in (typically millimeters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardPattern {
    pub cols: i32,
    pub rows: i32,
    pub cell_size: f32,
}

impl BoardPattern {
    pub fn new(cols: i32, rows: i32, cell_size: f32) -> Self {
        BoardPattern {
            cols,
            rows,
            cell_size,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.cols, self.rows)
    }

    pub fn corner_count(&self) -> usize {
        (self.cols * self.rows) as usize
    }

    /// Reference coordinates of every inner corner, row major over rows then
    /// columns, scaled by the cell size. The board plane is z = 0.
    pub fn object_grid(&self) -> Vector<Point3f> {
        let mut grid = Vector::with_capacity(self.corner_count());
        for r in 0..self.rows {
            for c in 0..self.cols {
                grid.push(Point3f::new(
                    c as f32 * self.cell_size,
                    r as f32 * self.cell_size,
                    0.0,
                ));
            }
        }
        grid
    }
}

/// Single channel copy of a BGR frame.
pub fn to_gray(frame: &impl ToInputArray) -> Result<Mat, opencv::Error> {
    let mut gray = Mat::default();
    imgproc::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
    Ok(gray)
}

/// Looks for the full inner corner set of `pattern` in a grayscale image.
///
/// Returns `None` when the board is not completely visible; the corner order
/// is the row major scan order of the pattern.
pub fn find_corners(
    gray: &impl ToInputArray,
    pattern: &BoardPattern,
) -> Result<Option<Vector<Point2f>>, opencv::Error> {
    let mut corners = Vector::new();
    let complete =
        calib3d::find_chessboard_corners(gray, pattern.size(), &mut corners, CALIB_CB_ADAPTIVE_THRESH)?;
    Ok(complete.then_some(corners))
}

/// Refines detected corners to sub pixel accuracy, stopping after
/// [REFINE_MAX_ITER] iterations or once corners move less than
/// [REFINE_EPSILON].
pub fn refine_corners(
    gray: &impl ToInputArray,
    corners: &mut Vector<Point2f>,
) -> Result<(), opencv::Error> {
    let criteria = TermCriteria::new(
        TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
        REFINE_MAX_ITER,
        REFINE_EPSILON,
    )?;
    imgproc::corner_sub_pix(
        gray,
        corners,
        Size::new(REFINE_WINDOW, REFINE_WINDOW),
        Size::new(-1, -1),
        criteria,
    )
}

/// Overlays a completed detection on `vis`. A failed detection draws nothing.
pub fn draw_detection(
    vis: &mut Mat,
    pattern: &BoardPattern,
    detection: Option<&Vector<Point2f>>,
) -> Result<(), opencv::Error> {
    match detection {
        Some(corners) => calib3d::draw_chessboard_corners(vis, pattern.size(), corners, true),
        None => Ok(()),
    }
}
