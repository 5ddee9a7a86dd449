//! Convolution kernels and the bases the solver fits over.
//!
//! The kernel being solved for is never represented directly: it is a linear
//! combination of small, fixed basis kernels. Two families are provided, the
//! delta-function basis (one kernel per pixel, maximally flexible) and the
//! Alard–Lupton basis (Gaussians modulated by polynomials, compact and
//! smooth).

use crate::{
    error::{Error, Result},
    geometry::Rect,
    image::Image,
};

/// A small fixed 2-D convolution kernel with odd dimensions and a defined
/// center pixel.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    width: u32,
    height: u32,
    /// Row-major kernel values.
    data: Vec<f64>,
}

impl Kernel {
    /// Creates a kernel from a row-major buffer of values.
    ///
    /// # Errors
    /// * [`Error::EvenKernelSize`] when either dimension is even or zero.
    /// * [`Error::SizeMismatch`] when the buffer length is not
    ///   `width * height`.
    pub fn new(width: u32, height: u32, data: Vec<f64>) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 == 0 || height % 2 == 0 {
            return Err(Error::EvenKernelSize { width, height });
        }
        if data.len() != width as usize * height as usize {
            return Err(Error::SizeMismatch {
                expected: width as usize * height as usize,
                received: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A delta-function kernel: a single unit spike at the center pixel.
    ///
    /// # Errors
    /// * [`Error::EvenKernelSize`] when either dimension is even or zero.
    pub fn delta(width: u32, height: u32) -> Result<Self> {
        let mut kernel = Self::new(width, height, vec![0.0; width as usize * height as usize])?;
        let index = kernel.index(kernel.center_x(), kernel.center_y());
        kernel.data[index] = 1.0;
        Ok(kernel)
    }

    /// An elliptical Gaussian kernel, normalized to unit sum.
    ///
    /// # Errors
    /// * [`Error::EvenKernelSize`] when either dimension is even or zero.
    /// * [`Error::InvalidConfig`] when a sigma is not strictly positive.
    pub fn gaussian(width: u32, height: u32, sigma_x: f64, sigma_y: f64) -> Result<Self> {
        if sigma_x <= 0.0 || sigma_y <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "gaussian sigmas must be positive, received ({sigma_x}, {sigma_y})",
            )));
        }

        let mut kernel = Self::gaussian_polynomial(width, height, sigma_x, sigma_y, 0, 0)?;
        let sum = kernel.sum();
        for value in &mut kernel.data {
            *value /= sum;
        }
        Ok(kernel)
    }

    /// An unnormalized Gaussian modulated by the monomial `u^i * v^j`, where
    /// (u, v) are pixel offsets from the kernel center.
    fn gaussian_polynomial(
        width: u32,
        height: u32,
        sigma_x: f64,
        sigma_y: f64,
        i: u32,
        j: u32,
    ) -> Result<Self> {
        let template = Self::new(width, height, vec![0.0; width as usize * height as usize])?;
        let (cx, cy) = (template.center_x(), template.center_y());

        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let u = f64::from(x) - f64::from(cx);
                let v = f64::from(y) - f64::from(cy);
                let gauss = (-0.5 * (u / sigma_x).powi(2) - 0.5 * (v / sigma_y).powi(2)).exp();
                data.push(gauss * u.powi(i as i32) * v.powi(j as i32));
            }
        }
        Self::new(width, height, data)
    }

    /// The width of the kernel, in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// The height of the kernel, in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The width and height of the kernel.
    #[must_use]
    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The x coordinate of the center pixel.
    #[must_use]
    pub const fn center_x(&self) -> u32 {
        self.width / 2
    }

    /// The y coordinate of the center pixel.
    #[must_use]
    pub const fn center_y(&self) -> u32 {
        self.height / 2
    }

    /// The number of pixels between the center and the left or right edge.
    #[must_use]
    pub const fn half_width(&self) -> u32 {
        self.width / 2
    }

    /// The number of pixels between the center and the top or bottom edge.
    #[must_use]
    pub const fn half_height(&self) -> u32 {
        self.height / 2
    }

    const fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// The kernel value at the given kernel-local coordinates.
    ///
    /// # Panics
    /// * The coordinates are out of bounds.
    #[must_use]
    pub fn value(&self, x: u32, y: u32) -> f64 {
        self.data[self.index(x, y)]
    }

    /// The raw row-major kernel values.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// The sum of all kernel values.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Shrinks a bounding box by the kernel's half-width on the left and
    /// right and its half-height on the top and bottom: the region where
    /// convolution by this kernel produces valid output.
    ///
    /// # Errors
    /// * [`Error::RegionOutOfBounds`] when nothing would remain.
    pub fn shrink_box(&self, bbox: Rect) -> Result<Rect> {
        bbox.shrink(self.half_width(), self.half_height())
            .ok_or(Error::RegionOutOfBounds {
                region: bbox,
                width: self.width,
                height: self.height,
            })
    }

    /// Renders the kernel as an image.
    #[must_use]
    pub fn to_image(&self) -> Image<f64> {
        Image::from_vec(self.width, self.height, self.data.clone())
    }
}

/// An ordered sequence of basis kernels sharing dimensions and center.
///
/// The order is meaningful: the first member determines the good region of a
/// convolution and may be designated as spatially constant in the spatial
/// model.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelBasis {
    kernels: Vec<Kernel>,
}

impl KernelBasis {
    /// Creates a basis from a list of kernels.
    ///
    /// # Errors
    /// * [`Error::EmptyBasis`] when the list is empty.
    /// * [`Error::MismatchedBasis`] when the kernels do not all share the
    ///   same dimensions.
    pub fn new(kernels: Vec<Kernel>) -> Result<Self> {
        let first = kernels.first().ok_or(Error::EmptyBasis)?;
        if kernels.iter().any(|k| k.dimensions() != first.dimensions()) {
            return Err(Error::MismatchedBasis);
        }
        Ok(Self { kernels })
    }

    /// The delta-function basis: one kernel per pixel, each a unit spike.
    /// Kernels are ordered column-major over the kernel grid.
    ///
    /// # Errors
    /// * [`Error::EvenKernelSize`] when either dimension is even or zero.
    pub fn delta_function(width: u32, height: u32) -> Result<Self> {
        let mut kernels = Vec::with_capacity(width as usize * height as usize);
        for x in 0..width {
            for y in 0..height {
                let mut kernel =
                    Kernel::new(width, height, vec![0.0; width as usize * height as usize])?;
                let index = kernel.index(x, y);
                kernel.data[index] = 1.0;
                kernels.push(kernel);
            }
        }
        Self::new(kernels)
    }

    /// The Alard–Lupton basis: for each Gaussian width `sigmas[k]`, the
    /// Gaussian modulated by every monomial of total degree at most
    /// `degrees[k]`.
    ///
    /// The first kernel is normalized to unit sum; every later kernel has a
    /// multiple of the first subtracted so that its sum vanishes, keeping the
    /// kernel sum of any fitted combination pinned to the first coefficient.
    ///
    /// # Errors
    /// * [`Error::InvalidConfig`] when the parameter lists are empty or of
    ///   different lengths, or a sigma is not positive.
    /// * [`Error::EvenKernelSize`] when either dimension is even or zero.
    pub fn alard_lupton(
        width: u32,
        height: u32,
        sigmas: &[f64],
        degrees: &[u32],
    ) -> Result<Self> {
        if sigmas.is_empty() || sigmas.len() != degrees.len() {
            return Err(Error::InvalidConfig(format!(
                "alard-lupton needs matching sigma and degree lists, received {} and {}",
                sigmas.len(),
                degrees.len(),
            )));
        }
        if sigmas.iter().any(|&s| s <= 0.0) {
            return Err(Error::InvalidConfig(
                "alard-lupton sigmas must be positive".to_string(),
            ));
        }

        let mut kernels = Vec::new();
        for (&sigma, &degree) in sigmas.iter().zip(degrees) {
            for d in 0..=degree {
                for j in 0..=d {
                    kernels.push(Kernel::gaussian_polynomial(
                        width,
                        height,
                        sigma,
                        sigma,
                        d - j,
                        j,
                    )?);
                }
            }
        }

        Self::renormalize(kernels)
    }

    /// Normalizes the first kernel to unit sum and projects the sum out of
    /// every later kernel, rescaling each to unit peak to keep the basis
    /// well conditioned.
    fn renormalize(mut kernels: Vec<Kernel>) -> Result<Self> {
        let first_sum = kernels.first().ok_or(Error::EmptyBasis)?.sum();
        if first_sum == 0.0 {
            return Err(Error::InvalidConfig(
                "the first basis kernel must have a nonzero sum".to_string(),
            ));
        }
        for value in &mut kernels[0].data {
            *value /= first_sum;
        }

        let first = kernels[0].clone();
        for kernel in kernels.iter_mut().skip(1) {
            let sum = kernel.sum();
            for (value, &base) in kernel.data.iter_mut().zip(first.data()) {
                *value -= sum * base;
            }

            let peak = kernel.data.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            if peak > 0.0 {
                for value in &mut kernel.data {
                    *value /= peak;
                }
            }
        }

        Self::new(kernels)
    }

    /// The number of kernels in the basis.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether the basis is empty. Construction forbids this; the method
    /// exists for symmetry with [`len`][Self::len].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// The shared dimensions of the basis kernels.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.kernels[0].dimensions()
    }

    /// The first kernel, which defines the good region.
    #[must_use]
    pub fn first(&self) -> &Kernel {
        &self.kernels[0]
    }

    /// The kernel at the given index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Kernel> {
        self.kernels.get(index)
    }

    /// Iterates over the basis kernels in order.
    pub fn iter(&self) -> impl Iterator<Item = &Kernel> {
        self.kernels.iter()
    }

    /// The linear combination `sum(coefficients[i] * kernel[i])`.
    ///
    /// # Errors
    /// * [`Error::SizeMismatch`] when the coefficient count differs from the
    ///   basis size.
    pub fn linear_combination(&self, coefficients: &[f64]) -> Result<Kernel> {
        if coefficients.len() != self.kernels.len() {
            return Err(Error::SizeMismatch {
                expected: self.kernels.len(),
                received: coefficients.len(),
            });
        }

        let (width, height) = self.dimensions();
        let mut data = vec![0.0; width as usize * height as usize];
        for (&coefficient, kernel) in coefficients.iter().zip(&self.kernels) {
            for (out, &value) in data.iter_mut().zip(kernel.data()) {
                *out += coefficient * value;
            }
        }
        Kernel::new(width, height, data)
    }
}
