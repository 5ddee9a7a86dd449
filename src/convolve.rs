//! Direct convolution of images with small kernels.
//!
//! The kernel is applied as stored, without reflection: the output pixel at
//! (x, y) is the kernel-weighted sum of input pixels around (x, y), with the
//! kernel's center pixel aligned on (x, y). Output pixels whose kernel
//! support extends past the image edge are left at zero; the valid output
//! region is the image's bounding box shrunk by the kernel half-width, as
//! reported by [`Kernel::shrink_box`].

use crate::{image::Image, kernel::Kernel};

/// Convolves an image with a kernel, returning an image of the same shape.
///
/// Pixels outside the valid region are zero.
#[must_use]
pub fn convolve(src: &Image<f64>, kernel: &Kernel) -> Image<f64> {
    convolve_impl(src, kernel, false)
}

/// Convolves an image with the element-wise square of a kernel.
///
/// This is the propagation a convolution applies to a variance plane: if the
/// image pixels are independent with variance `v`, the convolved pixels have
/// variance `sum(k^2 * v)`.
#[must_use]
pub fn convolve_with_squared_kernel(src: &Image<f64>, kernel: &Kernel) -> Image<f64> {
    convolve_impl(src, kernel, true)
}

fn convolve_impl(src: &Image<f64>, kernel: &Kernel, square: bool) -> Image<f64> {
    let mut out = Image::new(src.width(), src.height(), 0.0);
    let Ok(valid) = kernel.shrink_box(src.bbox()) else {
        // The kernel is larger than the image; no pixel has full support.
        return out;
    };

    let (cx, cy) = (kernel.center_x(), kernel.center_y());
    for y in valid.y..valid.bottom() {
        for x in valid.x..valid.right() {
            let mut acc = 0.0;
            for j in 0..kernel.height() {
                for i in 0..kernel.width() {
                    let value = kernel.value(i, j);
                    let weight = if square { value * value } else { value };
                    acc += weight * src.pixel(x + i - cx, y + j - cy);
                }
            }
            out.set_pixel(x, y, acc);
        }
    }
    out
}
