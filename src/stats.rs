//! Scalar statistics over images and pixel collections.

use crate::{geometry::Rect, image::Image};

/// The median pixel value of an image.
///
/// NaN pixels are ignored; an image of only NaN pixels yields NaN. For an
/// even pixel count the two middle values are averaged.
#[must_use]
pub fn median(image: &Image<f64>) -> f64 {
    let mut values: Vec<f64> = image.data().iter().copied().filter(|v| !v.is_nan()).collect();
    if values.is_empty() {
        return f64::NAN;
    }

    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// The minimum pixel value of an image. NaN pixels are ignored.
#[must_use]
pub fn minimum(image: &Image<f64>) -> f64 {
    image
        .data()
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::INFINITY, f64::min)
}

/// The mean and sample standard deviation of a collection of values.
///
/// Fewer than two values yield a standard deviation of zero.
#[must_use]
pub fn mean_and_std(values: impl IntoIterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() {
        return (f64::NAN, 0.0);
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }

    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// The square core of `region` with the given pixel radius around its
/// center, clipped to the region itself.
#[must_use]
pub fn core_region(region: Rect, radius: u32) -> Rect {
    let (cx, cy) = region.center();
    let x = cx.saturating_sub(radius);
    let y = cy.saturating_sub(radius);
    let core = Rect::new(x, y, 2 * radius + 1, 2 * radius + 1);
    core.clip(&region).unwrap_or(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_even_count() {
        let image = Image::from_vec(2, 2, vec![4.0, 1.0, 3.0, 2.0]);
        assert_eq!(median(&image), 2.5);
    }

    #[test]
    fn median_ignores_nan() {
        let image = Image::from_vec(2, 2, vec![f64::NAN, 1.0, 3.0, 2.0]);
        assert_eq!(median(&image), 2.0);
    }

    #[test]
    fn mean_and_std_of_constants() {
        let (mean, std) = mean_and_std([5.0, 5.0, 5.0, 5.0]);
        assert_eq!(mean, 5.0);
        assert_eq!(std, 0.0);
    }

    #[test]
    fn core_region_clips() {
        let region = Rect::new(2, 2, 10, 10);
        let core = core_region(region, 3);
        assert_eq!(core, Rect::new(4, 4, 7, 7));

        let tight = core_region(Rect::new(0, 0, 3, 3), 5);
        assert_eq!(tight, Rect::new(0, 0, 3, 3));
    }
}
