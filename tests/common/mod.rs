use diffim::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cell::RefCell;

/// A template with enough structure to make every basis column independent:
/// a smooth ramp, two Gaussian blobs, and a little seeded noise.
pub fn blobby_template(width: u32, height: u32, seed: u64) -> Image<f64> {
    let rng = RefCell::new(StdRng::seed_from_u64(seed));
    let blob = |x: f64, y: f64, cx: f64, cy: f64, sigma: f64, peak: f64| {
        peak * (-((x - cx).powi(2) + (y - cy).powi(2)) / (2.0 * sigma * sigma)).exp()
    };

    Image::from_fn(width, height, |x, y| {
        let (x, y) = (f64::from(x), f64::from(y));
        10.0 + 0.1 * x + 0.05 * y
            + blob(x, y, f64::from(width) * 0.3, f64::from(height) * 0.4, 2.0, 40.0)
            + blob(x, y, f64::from(width) * 0.7, f64::from(height) * 0.6, 3.5, 25.0)
            + rng.borrow_mut().gen_range(0.0..0.1)
    })
}

/// Science image constructed exactly as `template ⊗ kernel + background`,
/// where the kernel is the given combination of the basis.
pub fn make_science(
    template: &Image<f64>,
    basis: &KernelBasis,
    coefficients: &[f64],
    background: f64,
) -> Image<f64> {
    let kernel = basis.linear_combination(coefficients).unwrap();
    let convolved = diffim::convolve(template, &kernel);
    convolved.map_pixels_with_coords(|_, _, value| value + background)
}

/// A delta-plus-Gaussian basis, the smallest interesting two-member basis.
pub fn delta_gaussian_basis(size: u32, sigma: f64) -> KernelBasis {
    KernelBasis::new(vec![
        Kernel::delta(size, size).unwrap(),
        Kernel::gaussian(size, size, sigma, sigma).unwrap(),
    ])
    .unwrap()
}

/// A configuration with the background fit disabled, for kernel-only tests.
pub fn no_background_config() -> SolverConfig {
    SolverConfig {
        fit_for_background: false,
        ..SolverConfig::default()
    }
}
