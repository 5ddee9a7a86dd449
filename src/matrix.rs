//! Dense-matrix views of image regions.
//!
//! The solver's linear algebra runs on [`nalgebra`] matrices; this module is
//! the seam between image space and matrix space. The orientation is fixed
//! so that matrix element (row, col) corresponds to pixel (x = col,
//! y = row), and regions flatten column-major, i.e. x advances in the outer
//! loop.

use crate::{
    error::{Error, Result},
    geometry::Rect,
    image::Image,
};
use nalgebra::{DMatrix, DVector};

fn check_region(image: &Image<f64>, region: Rect) -> Result<()> {
    if !image.bbox().contains_rect(&region) || region.is_empty() {
        return Err(Error::RegionOutOfBounds {
            region,
            width: image.width(),
            height: image.height(),
        });
    }
    Ok(())
}

/// Views an image rectangle as a dense matrix with (row, col) = (y, x).
///
/// # Errors
/// * [`Error::RegionOutOfBounds`] when the rectangle does not fit inside the
///   image.
pub fn region_matrix(image: &Image<f64>, region: Rect) -> Result<DMatrix<f64>> {
    check_region(image, region)?;
    Ok(DMatrix::from_fn(
        region.height as usize,
        region.width as usize,
        |row, col| image.pixel(region.x + col as u32, region.y + row as u32),
    ))
}

/// Views the element-wise inverse of a variance rectangle as a dense matrix.
///
/// # Errors
/// * [`Error::RegionOutOfBounds`] when the rectangle does not fit inside the
///   image.
/// * [`Error::NonPositiveVariance`] when any variance in the rectangle is at
///   or below zero.
pub fn inverse_variance_matrix(variance: &Image<f64>, region: Rect) -> Result<DMatrix<f64>> {
    check_region(variance, region)?;

    let min = region
        .pixels_column_major()
        .map(|(x, y)| variance.pixel(x, y))
        .fold(f64::INFINITY, f64::min);
    if min <= 0.0 {
        return Err(Error::NonPositiveVariance { min });
    }

    Ok(DMatrix::from_fn(
        region.height as usize,
        region.width as usize,
        |row, col| 1.0 / variance.pixel(region.x + col as u32, region.y + row as u32),
    ))
}

/// Flattens an image rectangle column-major into a vector.
///
/// # Errors
/// * [`Error::RegionOutOfBounds`] when the rectangle does not fit inside the
///   image.
pub fn flatten_region(image: &Image<f64>, region: Rect) -> Result<DVector<f64>> {
    check_region(image, region)?;
    Ok(DVector::from_iterator(
        region.area(),
        region.pixels_column_major().map(|(x, y)| image.pixel(x, y)),
    ))
}
