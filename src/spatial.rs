//! Spatially varying kernel fits.
//!
//! A single stamp constrains the kernel at one point on the image. To model
//! a kernel that varies across the focal plane, every basis coefficient is
//! itself expanded over spatial basis functions φⱼ(x, y), and the per-stamp
//! normal equations (Q, w) are accumulated into one block-structured system
//! over (spatial × kernel) unknowns. Solving it yields a kernel and a
//! differential background that can be evaluated anywhere on the image.

use crate::{
    config::SolverConfig,
    error::{Error, Result},
    kernel::{Kernel, KernelBasis},
    solver::{LinearSolver, SolvedBy},
};
use log::info;
use nalgebra::{DMatrix, DVector};

/// A basis of spatial functions over image coordinates.
///
/// Implementations report how many parameters they carry and evaluate every
/// basis function (the gradient of the value with respect to each unit
/// parameter) at a position.
pub trait SpatialFunction {
    /// The number of parameters, i.e. spatial basis functions.
    fn parameter_count(&self) -> usize;

    /// The value of every basis function at (x, y).
    fn basis_values(&self, x: f64, y: f64) -> DVector<f64>;
}

/// A 2-D polynomial of bounded total degree: 1, x, y, x², xy, y², …
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PolynomialFunction2 {
    order: u32,
}

impl PolynomialFunction2 {
    /// Creates a polynomial basis of the given total degree.
    #[must_use]
    pub const fn new(order: u32) -> Self {
        Self { order }
    }

    /// The total degree of the polynomial.
    #[must_use]
    pub const fn order(&self) -> u32 {
        self.order
    }
}

impl SpatialFunction for PolynomialFunction2 {
    fn parameter_count(&self) -> usize {
        ((self.order + 1) * (self.order + 2) / 2) as usize
    }

    fn basis_values(&self, x: f64, y: f64) -> DVector<f64> {
        let mut values = Vec::with_capacity(self.parameter_count());
        for degree in 0..=self.order {
            for j in 0..=degree {
                values.push(x.powi((degree - j) as i32) * y.powi(j as i32));
            }
        }
        DVector::from_vec(values)
    }
}

/// The block-structured normal equations of a spatially varying kernel fit.
///
/// Constraints are accumulated with [`add_constraint`][Self::add_constraint]
/// and the system is consumed by [`solve`][Self::solve]. Accumulation fills
/// only the upper triangle; floating-point accumulation is order dependent,
/// so callers wanting bit-reproducible fits must feed constraints in a
/// stable order.
pub struct SpatialSystem {
    basis: KernelBasis,
    kernel_function: Box<dyn SpatialFunction>,
    background_function: Option<Box<dyn SpatialFunction>>,
    constant_first_term: bool,
    m: DMatrix<f64>,
    b: DVector<f64>,
    constraints: usize,
}

impl SpatialSystem {
    /// Creates an empty spatial system.
    ///
    /// `background_function` both enables the differential-background fit
    /// and describes its spatial variation. With `constant_first_term` the
    /// first basis kernel's coefficient does not vary spatially, the usual
    /// convention for Alard–Lupton bases whose first member carries the
    /// kernel sum.
    #[must_use]
    pub fn new(
        basis: KernelBasis,
        kernel_function: Box<dyn SpatialFunction>,
        background_function: Option<Box<dyn SpatialFunction>>,
        constant_first_term: bool,
    ) -> Self {
        let n_bases = basis.len();
        let nkt = kernel_function.parameter_count();
        let nbt = background_function
            .as_ref()
            .map_or(0, |f| f.parameter_count());
        let nt = if constant_first_term {
            (n_bases - 1) * nkt + 1 + nbt
        } else {
            n_bases * nkt + nbt
        };

        Self {
            basis,
            kernel_function,
            background_function,
            constant_first_term,
            m: DMatrix::zeros(nt, nt),
            b: DVector::zeros(nt),
            constraints: 0,
        }
    }

    /// The total number of unknowns.
    #[must_use]
    pub fn unknowns(&self) -> usize {
        self.b.len()
    }

    /// The number of constraints accumulated so far.
    #[must_use]
    pub const fn constraints(&self) -> usize {
        self.constraints
    }

    fn fits_background(&self) -> bool {
        self.background_function.is_some()
    }

    /// The first unknown of basis `m`'s coefficient block.
    fn kernel_block_start(&self, m: usize) -> usize {
        let nkt = self.kernel_function.parameter_count();
        if self.constant_first_term {
            1 + (m - 1) * nkt
        } else {
            m * nkt
        }
    }

    /// The first unknown of the background block.
    fn background_block_start(&self) -> usize {
        let nbt = self
            .background_function
            .as_ref()
            .map_or(0, |f| f.parameter_count());
        self.b.len() - nbt
    }

    /// Accumulates one stamp's normal equations (Q, w), evaluated at the
    /// stamp center (x, y), into the spatial system.
    ///
    /// Q must be square of size `n_bases` plus one when a background is
    /// being fit, with the background row and column last; w matches.
    ///
    /// # Errors
    /// * [`Error::SizeMismatch`] when Q or w has the wrong size.
    pub fn add_constraint(
        &mut self,
        x: f64,
        y: f64,
        q: &DMatrix<f64>,
        w: &DVector<f64>,
    ) -> Result<()> {
        let n_bases = self.basis.len();
        let ne = n_bases + usize::from(self.fits_background());
        if q.nrows() != ne || q.ncols() != ne {
            return Err(Error::SizeMismatch {
                expected: ne * ne,
                received: q.nrows() * q.ncols(),
            });
        }
        if w.len() != ne {
            return Err(Error::SizeMismatch {
                expected: ne,
                received: w.len(),
            });
        }

        let pk = self.kernel_function.basis_values(x, y);
        let pb = self
            .background_function
            .as_ref()
            .map(|f| f.basis_values(x, y));
        let nkt = pk.len();
        let mb = self.background_block_start();

        let first_varying = usize::from(self.constant_first_term);
        if self.constant_first_term {
            self.m[(0, 0)] += q[(0, 0)];
            self.b[0] += w[0];

            for m2 in 1..n_bases {
                let s2 = self.kernel_block_start(m2);
                for i in 0..nkt {
                    self.m[(0, s2 + i)] += q[(0, m2)] * pk[i];
                }
            }
            if let Some(pb) = &pb {
                for i in 0..pb.len() {
                    self.m[(0, mb + i)] += q[(0, n_bases)] * pb[i];
                }
            }
        }

        for m1 in first_varying..n_bases {
            let s1 = self.kernel_block_start(m1);

            // Diagonal block, upper triangle only.
            for i in 0..nkt {
                for j in i..nkt {
                    self.m[(s1 + i, s1 + j)] += q[(m1, m1)] * pk[i] * pk[j];
                }
            }
            // Off-diagonal kernel blocks lie entirely above the diagonal.
            for m2 in m1 + 1..n_bases {
                let s2 = self.kernel_block_start(m2);
                for i in 0..nkt {
                    for j in 0..nkt {
                        self.m[(s1 + i, s2 + j)] += q[(m1, m2)] * pk[i] * pk[j];
                    }
                }
            }
            if let Some(pb) = &pb {
                for i in 0..nkt {
                    for j in 0..pb.len() {
                        self.m[(s1 + i, mb + j)] += q[(m1, n_bases)] * pk[i] * pb[j];
                    }
                }
            }
            for i in 0..nkt {
                self.b[s1 + i] += w[m1] * pk[i];
            }
        }

        if let Some(pb) = &pb {
            for i in 0..pb.len() {
                for j in i..pb.len() {
                    self.m[(mb + i, mb + j)] += q[(n_bases, n_bases)] * pb[i] * pb[j];
                }
            }
            for i in 0..pb.len() {
                self.b[mb + i] += w[n_bases] * pb[i];
            }
        }

        self.constraints += 1;
        Ok(())
    }

    /// Symmetrizes and solves the accumulated system, consuming it.
    ///
    /// # Errors
    /// * [`Error::NonFiniteCoefficients`] when the solved coefficients
    ///   contain NaN; the error carries the system's condition number.
    /// * [`Error::EigenDecompositionFailed`] when the fallback solver does
    ///   not converge.
    pub fn solve(mut self, config: &SolverConfig) -> Result<SpatialSolution> {
        let nt = self.b.len();
        // Accumulation fills the upper triangle; mirror it down.
        for i in 0..nt {
            for j in 0..i {
                self.m[(i, j)] = self.m[(j, i)];
            }
        }

        info!(
            "solving spatial system of {nt} unknowns from {} constraints",
            self.constraints,
        );
        let solver = LinearSolver::new(config.eigen_tolerance);
        let (a, solved_by) = solver.solve(&self.m, &self.b)?;

        let n_bases = self.basis.len();
        let nkt = self.kernel_function.parameter_count();
        let mb = self.background_block_start();

        let mut coefficients = Vec::with_capacity(n_bases);
        for m in 0..n_bases {
            if self.constant_first_term && m == 0 {
                let mut padded = DVector::zeros(nkt);
                padded[0] = a[0];
                coefficients.push(padded);
            } else {
                let start = self.kernel_block_start(m);
                coefficients.push(DVector::from_iterator(
                    nkt,
                    (0..nkt).map(|i| a[start + i]),
                ));
            }
        }
        let background_coefficients =
            DVector::from_iterator(self.b.len() - mb, (mb..self.b.len()).map(|i| a[i]));

        Ok(SpatialSolution {
            kernel: SpatialKernel {
                basis: self.basis,
                coefficients,
                function: self.kernel_function,
            },
            background: SpatialBackground {
                coefficients: background_coefficients,
                function: self.background_function,
            },
            solved_by,
        })
    }
}

/// The product of a spatial solve: a spatially varying kernel and
/// background.
pub struct SpatialSolution {
    kernel: SpatialKernel,
    background: SpatialBackground,
    solved_by: SolvedBy,
}

impl SpatialSolution {
    /// The spatially varying kernel.
    #[must_use]
    pub const fn kernel(&self) -> &SpatialKernel {
        &self.kernel
    }

    /// The spatially varying background.
    #[must_use]
    pub const fn background(&self) -> &SpatialBackground {
        &self.background
    }

    /// How the spatial system was solved.
    #[must_use]
    pub const fn solved_by(&self) -> SolvedBy {
        self.solved_by
    }

    /// The kernel sum at the nominal position (0, 0).
    ///
    /// # Errors
    /// * [`Error::SizeMismatch`] if the coefficient layout is inconsistent,
    ///   which construction prevents.
    pub fn ksum(&self) -> Result<f64> {
        Ok(self.kernel.kernel_at(0.0, 0.0)?.sum())
    }
}

/// A kernel whose basis coefficients vary over the image as polynomials (or
/// any other [`SpatialFunction`]).
pub struct SpatialKernel {
    basis: KernelBasis,
    /// One coefficient vector per basis kernel, each of the spatial
    /// function's parameter count.
    coefficients: Vec<DVector<f64>>,
    function: Box<dyn SpatialFunction>,
}

impl SpatialKernel {
    /// The basis the kernel is expressed in.
    #[must_use]
    pub const fn basis(&self) -> &KernelBasis {
        &self.basis
    }

    /// The spatial coefficients of basis kernel `index`.
    #[must_use]
    pub fn coefficients(&self, index: usize) -> Option<&DVector<f64>> {
        self.coefficients.get(index)
    }

    /// The scalar coefficient of every basis kernel at (x, y).
    #[must_use]
    pub fn coefficients_at(&self, x: f64, y: f64) -> Vec<f64> {
        let phi = self.function.basis_values(x, y);
        self.coefficients
            .iter()
            .map(|coeffs| coeffs.dot(&phi))
            .collect()
    }

    /// The kernel evaluated at (x, y).
    ///
    /// # Errors
    /// * [`Error::SizeMismatch`] if the coefficient layout is inconsistent,
    ///   which construction prevents.
    pub fn kernel_at(&self, x: f64, y: f64) -> Result<Kernel> {
        self.basis.linear_combination(&self.coefficients_at(x, y))
    }
}

/// A differential background varying over the image.
pub struct SpatialBackground {
    coefficients: DVector<f64>,
    function: Option<Box<dyn SpatialFunction>>,
}

impl SpatialBackground {
    /// The spatial coefficients, empty when no background was fit.
    #[must_use]
    pub const fn coefficients(&self) -> &DVector<f64> {
        &self.coefficients
    }

    /// The background value at (x, y), zero when no background was fit.
    #[must_use]
    pub fn value_at(&self, x: f64, y: f64) -> f64 {
        match &self.function {
            Some(function) => self.coefficients.dot(&function.basis_values(x, y)),
            None => 0.0,
        }
    }
}
