//! Solver configuration.
//!
//! Every tunable of the solver lives in [`SolverConfig`], a plain record
//! validated up front so that the numerical code never has to interpret a
//! loosely-typed option bag mid-solve.

use crate::{
    error::{Error, Result},
    kernel::KernelBasis,
};
use std::fmt;
use std::str::FromStr;

/// How the condition number of a normal-equation matrix is measured.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ConditionNumberKind {
    /// Ratio of the largest to the smallest absolute eigenvalue.
    #[default]
    Eigenvalue,
    /// Ratio of the largest to the smallest singular value.
    Svd,
}

impl fmt::Display for ConditionNumberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eigenvalue => write!(f, "eigenvalue"),
            Self::Svd => write!(f, "svd"),
        }
    }
}

impl FromStr for ConditionNumberKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eigenvalue" => Ok(Self::Eigenvalue),
            "svd" => Ok(Self::Svd),
            _ => Err(Error::InvalidConfig(format!(
                "unknown condition number kind: {s}",
            ))),
        }
    }
}

/// How the regularization strength λ is chosen.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LambdaType {
    /// Use [`SolverConfig::lambda_value`] directly.
    #[default]
    Absolute,
    /// Scale the ratio of the traces of M and H by
    /// [`SolverConfig::lambda_scaling`].
    Relative,
    /// Scan a grid of λ values and keep the minimizer of the biased risk
    /// estimator, truncating the pseudo-inverse of M at the configured
    /// maximum condition number.
    MinimizeBiasedRisk,
    /// Like [`LambdaType::MinimizeBiasedRisk`] with no truncation.
    MinimizeUnbiasedRisk,
}

impl fmt::Display for LambdaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute => write!(f, "absolute"),
            Self::Relative => write!(f, "relative"),
            Self::MinimizeBiasedRisk => write!(f, "minimizeBiasedRisk"),
            Self::MinimizeUnbiasedRisk => write!(f, "minimizeUnbiasedRisk"),
        }
    }
}

impl FromStr for LambdaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "absolute" => Ok(Self::Absolute),
            "relative" => Ok(Self::Relative),
            "minimizeBiasedRisk" => Ok(Self::MinimizeBiasedRisk),
            "minimizeUnbiasedRisk" => Ok(Self::MinimizeUnbiasedRisk),
            _ => Err(Error::InvalidConfig(format!("unknown lambda type: {s}"))),
        }
    }
}

/// The spacing of the λ grid scanned by the risk minimizers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LambdaStepType {
    /// λ runs linearly from `lambda_lin_min` to `lambda_lin_max`.
    Linear,
    /// λ runs over powers of ten from `lambda_log_min` to `lambda_log_max`.
    #[default]
    Log,
}

impl fmt::Display for LambdaStepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Log => write!(f, "log"),
        }
    }
}

impl FromStr for LambdaStepType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "log" => Ok(Self::Log),
            _ => Err(Error::InvalidConfig(format!(
                "unknown lambda step type: {s}",
            ))),
        }
    }
}

/// Which family of basis kernels the solver fits over.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum KernelBasisSet {
    /// Gaussians modulated by polynomials.
    #[default]
    AlardLupton,
    /// One unit spike per kernel pixel.
    DeltaFunction,
}

impl fmt::Display for KernelBasisSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlardLupton => write!(f, "alard-lupton"),
            Self::DeltaFunction => write!(f, "delta-function"),
        }
    }
}

impl FromStr for KernelBasisSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alard-lupton" => Ok(Self::AlardLupton),
            "delta-function" => Ok(Self::DeltaFunction),
            _ => Err(Error::InvalidConfig(format!(
                "unknown kernel basis set: {s}",
            ))),
        }
    }
}

/// The configuration record consumed by the stamp builder, the solvers, and
/// the candidate orchestration.
///
/// Construct one with [`SolverConfig::default`], adjust fields or chain the
/// `with_*` helpers, then call [`validate`][SolverConfig::validate] before
/// handing it to the solver.
/// [`KernelCandidate::new`][crate::candidate::KernelCandidate::new]
/// validates its configuration at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverConfig {
    /// Include a differential-background column in the fit.
    pub fit_for_background: bool,
    /// Replace the per-pixel variance with its median over the stamp.
    pub constant_variance_weighting: bool,
    /// After the first solve, rebuild once with the variance of the
    /// difference image.
    pub iterate_single_kernel: bool,
    /// Reject stamps whose normal equations are too ill-conditioned.
    pub check_condition_number: bool,
    /// The condition number above which a stamp is rejected.
    pub max_condition_number: f64,
    /// How condition numbers are measured.
    pub condition_number_kind: ConditionNumberKind,
    /// Pixel radius of the stamp core used by the residual statistics when
    /// [`use_core_stats`][Self::use_core_stats] is set.
    pub candidate_core_radius: u32,
    /// Compute residual statistics over the stamp core only.
    pub use_core_stats: bool,
    /// Gate candidate status on the residual statistics.
    pub single_kernel_clipping: bool,
    /// Largest acceptable absolute mean of the normalized residuals.
    pub candidate_residual_mean_max: f64,
    /// Largest acceptable standard deviation of the normalized residuals.
    pub candidate_residual_std_max: f64,
    /// Penalize kernel roughness with a regularization matrix.
    pub use_regularization: bool,
    /// How the regularization strength is chosen.
    pub lambda_type: LambdaType,
    /// The absolute regularization strength for [`LambdaType::Absolute`].
    pub lambda_value: f64,
    /// The trace-ratio scaling for [`LambdaType::Relative`].
    pub lambda_scaling: f64,
    /// The spacing of the λ grid for the risk minimizers.
    pub lambda_step_type: LambdaStepType,
    /// Linear λ grid lower bound.
    pub lambda_lin_min: f64,
    /// Linear λ grid upper bound.
    pub lambda_lin_max: f64,
    /// Linear λ grid step.
    pub lambda_lin_step: f64,
    /// Log λ grid lower exponent (base ten).
    pub lambda_log_min: f64,
    /// Log λ grid upper exponent (base ten).
    pub lambda_log_max: f64,
    /// Log λ grid exponent step.
    pub lambda_log_step: f64,
    /// Feed PCA-basis solutions rather than originals to the spatial fit.
    pub use_pca_for_spatial_kernel: bool,
    /// Which family of basis kernels to generate.
    pub kernel_basis_set: KernelBasisSet,
    /// Kernel width and height, which must be odd.
    pub kernel_size: u32,
    /// Gaussian widths of the Alard–Lupton components.
    pub alard_sig_gauss: Vec<f64>,
    /// Polynomial degrees of the Alard–Lupton components.
    pub alard_deg_gauss: Vec<u32>,
    /// Eigenvalues with absolute value at or below this are treated as zero
    /// by the pseudo-inverse fallback solver. The default of zero inverts
    /// every eigenvalue that is not exactly zero.
    pub eigen_tolerance: f64,
    /// Total polynomial degree of the spatial kernel variation.
    pub spatial_kernel_order: u32,
    /// Total polynomial degree of the spatial background variation.
    pub spatial_background_order: u32,
    /// Hold the first basis kernel spatially constant.
    pub constant_first_term: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            fit_for_background: true,
            constant_variance_weighting: false,
            iterate_single_kernel: false,
            check_condition_number: false,
            max_condition_number: 5.0e7,
            condition_number_kind: ConditionNumberKind::default(),
            candidate_core_radius: 3,
            use_core_stats: false,
            single_kernel_clipping: true,
            candidate_residual_mean_max: 0.25,
            candidate_residual_std_max: 1.50,
            use_regularization: false,
            lambda_type: LambdaType::default(),
            lambda_value: 0.2,
            lambda_scaling: 1.0e-4,
            lambda_step_type: LambdaStepType::default(),
            lambda_lin_min: 0.1,
            lambda_lin_max: 100.0,
            lambda_lin_step: 0.1,
            lambda_log_min: -1.0,
            lambda_log_max: 2.0,
            lambda_log_step: 0.1,
            use_pca_for_spatial_kernel: false,
            kernel_basis_set: KernelBasisSet::default(),
            kernel_size: 19,
            alard_sig_gauss: vec![0.7, 1.5, 3.0],
            alard_deg_gauss: vec![4, 3, 2],
            eigen_tolerance: 0.0,
            spatial_kernel_order: 2,
            spatial_background_order: 1,
            constant_first_term: true,
        }
    }
}

impl SolverConfig {
    /// Sets whether a differential background is fit.
    #[must_use]
    pub const fn with_fit_for_background(mut self, fit: bool) -> Self {
        self.fit_for_background = fit;
        self
    }

    /// Sets the kernel size, which must be odd.
    #[must_use]
    pub const fn with_kernel_size(mut self, size: u32) -> Self {
        self.kernel_size = size;
        self
    }

    /// Sets the basis family.
    #[must_use]
    pub const fn with_kernel_basis_set(mut self, set: KernelBasisSet) -> Self {
        self.kernel_basis_set = set;
        self
    }

    /// Enables regularization with the given λ selection.
    #[must_use]
    pub const fn with_regularization(mut self, lambda_type: LambdaType) -> Self {
        self.use_regularization = true;
        self.lambda_type = lambda_type;
        self
    }

    /// Enables the condition-number gate with the given threshold.
    #[must_use]
    pub const fn with_condition_number_gate(mut self, max: f64) -> Self {
        self.check_condition_number = true;
        self.max_condition_number = max;
        self
    }

    /// Checks the configuration for values the solver cannot work with.
    ///
    /// # Errors
    /// * [`Error::InvalidConfig`] describing the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(Error::InvalidConfig(format!(
                "kernel size must be odd, received {}",
                self.kernel_size,
            )));
        }
        if self.max_condition_number <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "max condition number must be positive, received {}",
                self.max_condition_number,
            )));
        }
        if self.eigen_tolerance < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "eigen tolerance must be non-negative, received {}",
                self.eigen_tolerance,
            )));
        }
        if self.alard_sig_gauss.is_empty()
            || self.alard_sig_gauss.len() != self.alard_deg_gauss.len()
        {
            return Err(Error::InvalidConfig(format!(
                "alard-lupton needs matching sigma and degree lists, received {} and {}",
                self.alard_sig_gauss.len(),
                self.alard_deg_gauss.len(),
            )));
        }
        if self.alard_sig_gauss.iter().any(|&s| s <= 0.0) {
            return Err(Error::InvalidConfig(
                "alard-lupton sigmas must be positive".to_string(),
            ));
        }
        if self.lambda_lin_step <= 0.0 || self.lambda_lin_max < self.lambda_lin_min {
            return Err(Error::InvalidConfig(format!(
                "linear lambda grid is empty: {}..={} step {}",
                self.lambda_lin_min, self.lambda_lin_max, self.lambda_lin_step,
            )));
        }
        if self.lambda_log_step <= 0.0 || self.lambda_log_max < self.lambda_log_min {
            return Err(Error::InvalidConfig(format!(
                "log lambda grid is empty: {}..={} step {}",
                self.lambda_log_min, self.lambda_log_max, self.lambda_log_step,
            )));
        }
        Ok(())
    }

    /// Generates the kernel basis this configuration describes.
    ///
    /// # Errors
    /// * [`Error::InvalidConfig`] when the basis parameters are unusable.
    pub fn basis(&self) -> Result<KernelBasis> {
        self.validate()?;
        match self.kernel_basis_set {
            KernelBasisSet::AlardLupton => KernelBasis::alard_lupton(
                self.kernel_size,
                self.kernel_size,
                &self.alard_sig_gauss,
                &self.alard_deg_gauss,
            ),
            KernelBasisSet::DeltaFunction => {
                KernelBasis::delta_function(self.kernel_size, self.kernel_size)
            }
        }
    }
}
