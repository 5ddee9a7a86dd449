//! Building the per-stamp least-squares system.
//!
//! A stamp is a small co-registered (template, science, variance) triple.
//! [`BasisConvolver`] turns the template into one convolved column per basis
//! kernel; [`StampBuilder`] assembles those columns into the design matrix C,
//! weights them by inverse variance, and forms the normal equations
//! M = CᵀVC, b = CᵀVY held by a [`StaticSolution`].

use crate::{
    config::{ConditionNumberKind, SolverConfig},
    convolve::convolve,
    error::{Error, Result},
    geometry::Rect,
    image::Image,
    kernel::{Kernel, KernelBasis},
    mask::{Mask, MaskPlane},
    matrix, regularize,
    solver::{self, LinearSolver, SolvedBy},
};
use log::debug;
use nalgebra::{DMatrix, DVector};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SOLUTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_solution_id() -> u64 {
    NEXT_SOLUTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Convolves a template with every member of a kernel basis.
pub struct BasisConvolver<'a> {
    template: &'a Image<f64>,
    basis: &'a KernelBasis,
}

impl<'a> BasisConvolver<'a> {
    /// Creates a convolver over the given template and basis.
    #[must_use]
    pub const fn new(template: &'a Image<f64>, basis: &'a KernelBasis) -> Self {
        Self { template, basis }
    }

    /// The region of the template where convolution by the basis produces
    /// valid output. The first kernel determines it; construction of
    /// [`KernelBasis`] guarantees all members share its dimensions.
    ///
    /// # Errors
    /// * [`Error::RegionOutOfBounds`] when the template is smaller than the
    ///   kernel.
    pub fn good_region(&self) -> Result<Rect> {
        self.basis.first().shrink_box(self.template.bbox())
    }

    /// Assembles the design matrix over the given pixels: one column per
    /// basis kernel holding the convolved template at those pixels, plus an
    /// all-ones column when a background is being fit.
    #[must_use]
    pub fn design_matrix(&self, pixels: &[(u32, u32)], fit_for_background: bool) -> DMatrix<f64> {
        let n_kernel = self.basis.len();
        let n_cols = n_kernel + usize::from(fit_for_background);
        let mut c = DMatrix::zeros(pixels.len(), n_cols);

        for (col, kernel) in self.basis.iter().enumerate() {
            let convolved = convolve(self.template, kernel);
            for (row, &(x, y)) in pixels.iter().enumerate() {
                c[(row, col)] = convolved.pixel(x, y);
            }
        }
        if fit_for_background {
            for row in 0..pixels.len() {
                c[(row, n_kernel)] = 1.0;
            }
        }
        c
    }
}

/// Builds [`StaticSolution`]s from stamps.
///
/// The builder borrows the basis and configuration; each `build_*` call
/// produces an independent solution owning its matrices.
pub struct StampBuilder<'a> {
    basis: &'a KernelBasis,
    config: &'a SolverConfig,
    h: Option<&'a DMatrix<f64>>,
}

impl<'a> StampBuilder<'a> {
    /// Creates a builder over the given basis and configuration.
    #[must_use]
    pub const fn new(basis: &'a KernelBasis, config: &'a SolverConfig) -> Self {
        Self {
            basis,
            config,
            h: None,
        }
    }

    /// Attaches a regularization matrix. Solutions built afterwards select
    /// a strength λ at solve time and solve (M + λH)·a = b.
    #[must_use]
    pub const fn with_regularization(mut self, h: &'a DMatrix<f64>) -> Self {
        self.h = Some(h);
        self
    }

    /// Builds the least-squares system over the entire good region.
    ///
    /// # Errors
    /// * [`Error::ShapeMismatch`] when the images disagree in shape.
    /// * [`Error::NonPositiveVariance`] when any used variance is ≤ 0.
    /// * [`Error::RegionOutOfBounds`] when the stamp is smaller than the
    ///   kernel.
    pub fn build(
        &self,
        template: &Image<f64>,
        science: &Image<f64>,
        variance: &Image<f64>,
    ) -> Result<StaticSolution> {
        self.check_shapes(template, science, variance)?;
        let convolver = BasisConvolver::new(template, self.basis);
        let good = convolver.good_region()?;

        // The matrix view is column-major with (row, col) = (y, x), so its
        // storage order matches the column-major pixel walk used everywhere
        // else.
        let ivar_matrix = matrix::inverse_variance_matrix(variance, good)?;
        let ivar = DVector::from_column_slice(ivar_matrix.as_slice());
        let y = matrix::flatten_region(science, good)?;

        let pixels: Vec<_> = good.pixels_column_major().collect();
        let c = convolver.design_matrix(&pixels, self.config.fit_for_background);
        Ok(self.assemble(c, ivar, y))
    }

    /// Builds the system excluding every pixel whose mask intersects the
    /// fit-exclusion planes ({BAD, SAT, NO_DATA, EDGE}), after growing the
    /// flagged footprint by the kernel half-width so that no excluded pixel
    /// leaks into the fit through the convolution.
    ///
    /// # Errors
    /// * As [`build`][Self::build], plus [`Error::NoUsablePixels`] when the
    ///   grown footprint covers the whole good region.
    pub fn build_with_mask(
        &self,
        template: &Image<f64>,
        science: &Image<f64>,
        variance: &Image<f64>,
        mask: &Mask,
    ) -> Result<StaticSolution> {
        self.check_shapes(template, science, variance)?;
        if mask.dimensions() != template.dimensions() {
            return Err(Error::ShapeMismatch {
                expected: template.dimensions(),
                received: mask.dimensions(),
            });
        }

        let good = BasisConvolver::new(template, self.basis).good_region()?;
        let bitmask = MaskPlane::bitmask(&MaskPlane::FIT_EXCLUSION);
        let radius = self.basis.first().half_width().max(self.basis.first().half_height());
        let excluded = mask.footprint(bitmask).grow(radius);
        debug!(
            "mask excludes {} pixels after growing by {radius}",
            excluded.len(),
        );

        let pixels: Vec<_> = good
            .pixels_column_major()
            .filter(|&(x, y)| !excluded.contains(x, y))
            .collect();
        self.build_from_pixels(template, science, variance, pixels)
    }

    /// Builds the system excluding a single rectangle, retaining the four
    /// rectangles surrounding it (above, below, left, right), clipped to
    /// the good region and concatenated in that order.
    ///
    /// # Errors
    /// * As [`build`][Self::build], plus [`Error::NoUsablePixels`] when the
    ///   rectangle covers the whole good region.
    pub fn build_single(
        &self,
        template: &Image<f64>,
        science: &Image<f64>,
        variance: &Image<f64>,
        mask_box: Rect,
    ) -> Result<StaticSolution> {
        self.check_shapes(template, science, variance)?;
        let good = BasisConvolver::new(template, self.basis).good_region()?;

        let pixels = match mask_box.clip(&good) {
            None => good.pixels_column_major().collect(),
            Some(hole) => {
                let surrounding = [
                    // Above and below the hole, full width of the good region.
                    Rect::new(good.x, good.y, good.width, hole.y - good.y),
                    Rect::new(good.x, hole.bottom(), good.width, good.bottom() - hole.bottom()),
                    // Beside the hole, matching its height.
                    Rect::new(good.x, hole.y, hole.x - good.x, hole.height),
                    Rect::new(hole.right(), hole.y, good.right() - hole.right(), hole.height),
                ];
                surrounding
                    .iter()
                    .filter(|rect| !rect.is_empty())
                    .flat_map(Rect::pixels_column_major)
                    .collect()
            }
        };
        self.build_from_pixels(template, science, variance, pixels)
    }

    fn check_shapes(
        &self,
        template: &Image<f64>,
        science: &Image<f64>,
        variance: &Image<f64>,
    ) -> Result<()> {
        for image in [science, variance] {
            if image.dimensions() != template.dimensions() {
                return Err(Error::ShapeMismatch {
                    expected: template.dimensions(),
                    received: image.dimensions(),
                });
            }
        }
        if let Some(h) = self.h {
            let expected = self.basis.len() + usize::from(self.config.fit_for_background);
            if h.nrows() != expected || h.ncols() != expected {
                return Err(Error::SizeMismatch {
                    expected: expected * expected,
                    received: h.nrows() * h.ncols(),
                });
            }
        }
        Ok(())
    }

    fn build_from_pixels(
        &self,
        template: &Image<f64>,
        science: &Image<f64>,
        variance: &Image<f64>,
        pixels: Vec<(u32, u32)>,
    ) -> Result<StaticSolution> {
        if pixels.is_empty() {
            return Err(Error::NoUsablePixels);
        }

        let min_variance = pixels
            .iter()
            .map(|&(x, y)| variance.pixel(x, y))
            .fold(f64::INFINITY, f64::min);
        if min_variance <= 0.0 {
            return Err(Error::NonPositiveVariance { min: min_variance });
        }

        let c = BasisConvolver::new(template, self.basis)
            .design_matrix(&pixels, self.config.fit_for_background);
        let ivar = DVector::from_iterator(
            pixels.len(),
            pixels.iter().map(|&(x, y)| 1.0 / variance.pixel(x, y)),
        );
        let y = DVector::from_iterator(
            pixels.len(),
            pixels.iter().map(|&(x, y)| science.pixel(x, y)),
        );
        Ok(self.assemble(c, ivar, y))
    }

    /// Forms M = CᵀVC and b = CᵀVY, with V applied as a row scaling to
    /// avoid materializing the P×P diagonal.
    fn assemble(&self, c: DMatrix<f64>, ivar: DVector<f64>, y: DVector<f64>) -> StaticSolution {
        let mut cw = c.clone();
        for j in 0..cw.ncols() {
            for i in 0..cw.nrows() {
                cw[(i, j)] *= ivar[i];
            }
        }
        let ct = c.transpose();
        let m = &ct * &cw;
        let b = &ct * y.component_mul(&ivar);

        StaticSolution {
            id: next_solution_id(),
            c,
            ivar,
            y,
            m,
            b,
            a: None,
            solved_by: SolvedBy::None,
            fit_for_background: self.config.fit_for_background,
            basis: self.basis.clone(),
            h: self.h.cloned(),
            lambda: None,
        }
    }
}

/// A single stamp's least-squares system and, once solved, its kernel.
///
/// The solution owns every matrix it references; dropping it releases them.
#[derive(Clone, Debug)]
pub struct StaticSolution {
    id: u64,
    c: DMatrix<f64>,
    ivar: DVector<f64>,
    y: DVector<f64>,
    m: DMatrix<f64>,
    b: DVector<f64>,
    a: Option<DVector<f64>>,
    solved_by: SolvedBy,
    fit_for_background: bool,
    basis: KernelBasis,
    h: Option<DMatrix<f64>>,
    lambda: Option<f64>,
}

impl StaticSolution {
    /// The process-unique id of this solution.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Solves the normal equations, selecting a regularization strength
    /// first when a regularization matrix is attached.
    ///
    /// # Errors
    /// * [`Error::EigenDecompositionFailed`] /
    ///   [`Error::NonFiniteCoefficients`] from the linear solver; the
    ///   solution is left unsolved in that case.
    pub fn solve(&mut self, config: &SolverConfig) -> Result<()> {
        let solver = LinearSolver::new(config.eigen_tolerance);

        let system = if let Some(h) = &self.h {
            let lambda = regularize::select_lambda(&self.m, &self.b, &self.c, h, config, &solver)?;
            debug!("selected regularization strength {lambda:.6e}");
            self.lambda = Some(lambda);
            &self.m + h * lambda
        } else {
            self.m.clone()
        };

        match solver.solve(&system, &self.b) {
            Ok((a, solved_by)) => {
                self.a = Some(a);
                self.solved_by = solved_by;
                Ok(())
            }
            Err(err) => {
                self.a = None;
                self.solved_by = SolvedBy::None;
                Err(err)
            }
        }
    }

    /// How this system was solved, or [`SolvedBy::None`] before a
    /// successful solve.
    #[must_use]
    pub const fn solved_by(&self) -> SolvedBy {
        self.solved_by
    }

    /// The design matrix C.
    #[must_use]
    pub const fn design_matrix(&self) -> &DMatrix<f64> {
        &self.c
    }

    /// The inverse-variance weights, the diagonal of V.
    #[must_use]
    pub const fn weights(&self) -> &DVector<f64> {
        &self.ivar
    }

    /// The target vector Y of science pixels.
    #[must_use]
    pub const fn target(&self) -> &DVector<f64> {
        &self.y
    }

    /// The normal-equation matrix, optionally with the selected λH added.
    ///
    /// Before a solve has selected λ, `include_regularization` has no
    /// effect.
    #[must_use]
    pub fn m(&self, include_regularization: bool) -> DMatrix<f64> {
        match (&self.h, self.lambda) {
            (Some(h), Some(lambda)) if include_regularization => &self.m + h * lambda,
            _ => self.m.clone(),
        }
    }

    /// The normal-equation right-hand side b.
    #[must_use]
    pub const fn b(&self) -> &DVector<f64> {
        &self.b
    }

    /// The regularization strength selected at solve time, if any.
    #[must_use]
    pub const fn lambda(&self) -> Option<f64> {
        self.lambda
    }

    /// The solved coefficient vector, kernel coefficients first and the
    /// background last when one was fit.
    ///
    /// # Errors
    /// * [`Error::NotSolved`] before a successful solve.
    pub fn coefficients(&self) -> Result<&DVector<f64>> {
        self.a.as_ref().ok_or(Error::NotSolved)
    }

    /// The fitted kernel as an owned snapshot.
    ///
    /// # Errors
    /// * [`Error::NotSolved`] before a successful solve.
    pub fn kernel(&self) -> Result<Kernel> {
        let a = self.coefficients()?;
        self.basis
            .linear_combination(&a.as_slice()[..self.basis.len()])
    }

    /// The fitted differential background, zero when none was fit.
    ///
    /// # Errors
    /// * [`Error::NotSolved`] before a successful solve.
    pub fn background(&self) -> Result<f64> {
        let a = self.coefficients()?;
        Ok(if self.fit_for_background {
            a[self.basis.len()]
        } else {
            0.0
        })
    }

    /// The sum of the fitted kernel, the photometric scaling between
    /// template and science.
    ///
    /// # Errors
    /// * [`Error::NotSolved`] before a successful solve.
    pub fn ksum(&self) -> Result<f64> {
        Ok(self.kernel()?.sum())
    }

    /// Renders the fitted kernel as an image.
    ///
    /// # Errors
    /// * [`Error::NotSolved`] before a successful solve.
    pub fn kernel_image(&self) -> Result<Image<f64>> {
        Ok(self.kernel()?.to_image())
    }

    /// The condition number of the unregularized normal equations.
    ///
    /// # Errors
    /// * [`Error::EigenDecompositionFailed`] when the decomposition does
    ///   not converge.
    pub fn condition_number(&self, kind: ConditionNumberKind) -> Result<f64> {
        solver::condition_number(&self.m, kind)
    }

    /// Whether this solution fits a differential background.
    #[must_use]
    pub const fn fits_background(&self) -> bool {
        self.fit_for_background
    }

    /// The basis the kernel is expressed in.
    #[must_use]
    pub const fn basis(&self) -> &KernelBasis {
        &self.basis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_config() -> SolverConfig {
        SolverConfig {
            fit_for_background: false,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn design_matrix_shape() {
        let template = Image::new(10, 10, 1.0);
        let basis = KernelBasis::delta_function(3, 3).unwrap();
        let convolver = BasisConvolver::new(&template, &basis);

        let good = convolver.good_region().unwrap();
        let pixels: Vec<_> = good.pixels_column_major().collect();
        let c = convolver.design_matrix(&pixels, true);
        assert_eq!(c.shape(), (64, 10));
        // Background column is all ones.
        assert!((0..64).all(|row| c[(row, 9)] == 1.0));
    }

    #[test]
    fn zero_variance_is_rejected() {
        let template = Image::new(10, 10, 1.0);
        let science = Image::new(10, 10, 1.0);
        let variance = Image::new(10, 10, 0.0);
        let basis = KernelBasis::new(vec![Kernel::delta(3, 3).unwrap()]).unwrap();
        let config = flat_config();

        let err = StampBuilder::new(&basis, &config)
            .build(&template, &science, &variance)
            .unwrap_err();
        assert!(matches!(err, Error::NonPositiveVariance { .. }));
    }

    #[test]
    fn build_is_idempotent() {
        let template = Image::from_fn(12, 12, |x, y| f64::from(x + 2 * y) + 0.5);
        let science = Image::from_fn(12, 12, |x, y| f64::from(2 * x + y) + 1.5);
        let variance = Image::new(12, 12, 2.0);
        let basis = KernelBasis::delta_function(3, 3).unwrap();
        let config = flat_config();
        let builder = StampBuilder::new(&basis, &config);

        let first = builder.build(&template, &science, &variance).unwrap();
        let second = builder.build(&template, &science, &variance).unwrap();
        assert_eq!(first.m(false), second.m(false));
        assert_eq!(first.b(), second.b());
        assert_eq!(first.design_matrix(), second.design_matrix());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn products_require_a_solve() {
        let template = Image::new(8, 8, 1.0);
        let science = Image::new(8, 8, 1.0);
        let variance = Image::new(8, 8, 1.0);
        let basis = KernelBasis::new(vec![Kernel::delta(3, 3).unwrap()]).unwrap();
        let config = flat_config();

        let solution = StampBuilder::new(&basis, &config)
            .build(&template, &science, &variance)
            .unwrap();
        assert!(matches!(solution.kernel(), Err(Error::NotSolved)));
        assert!(matches!(solution.background(), Err(Error::NotSolved)));
        assert!(matches!(solution.ksum(), Err(Error::NotSolved)));
    }

    #[test]
    fn single_mask_box_excludes_the_hole() {
        let template = Image::new(16, 16, 1.0);
        let science = Image::new(16, 16, 1.0);
        let variance = Image::new(16, 16, 1.0);
        let basis = KernelBasis::new(vec![Kernel::delta(3, 3).unwrap()]).unwrap();
        let config = flat_config();

        let hole = Rect::new(6, 6, 4, 4);
        let solution = StampBuilder::new(&basis, &config)
            .build_single(&template, &science, &variance, hole)
            .unwrap();

        let good = Rect::of_size(16, 16).shrink(1, 1).unwrap();
        assert_eq!(
            solution.design_matrix().nrows(),
            good.area() - hole.area(),
        );
    }
}
