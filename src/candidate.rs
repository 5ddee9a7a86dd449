//! One stamp's lifecycle through the solver.
//!
//! A [`KernelCandidate`] owns a stamp's images and up to two solutions: the
//! `original`, fit in the full basis, and the `pca`, fit in a compressed
//! basis on a later pass. Building a candidate composes its variance, forms
//! and solves the least-squares system, optionally iterates once with the
//! difference-image variance, and scores the residuals.

use crate::{
    builder::{StampBuilder, StaticSolution},
    config::SolverConfig,
    convolve::{convolve, convolve_with_squared_kernel},
    error::{Error, Result},
    image::Image,
    kernel::{Kernel, KernelBasis},
    stats,
};
use log::{debug, warn};
use nalgebra::DMatrix;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CANDIDATE_ID: AtomicU64 = AtomicU64::new(1);

/// Which of a candidate's solution slots to read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolutionSwitch {
    /// The first solution built, in the full basis.
    Original,
    /// The solution built in the PCA-compressed basis.
    Pca,
    /// The most recent solution: the PCA one when present, otherwise the
    /// original.
    Recent,
}

/// The quality state of a candidate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CandidateStatus {
    /// Not yet built, or not yet judged.
    #[default]
    Unknown,
    /// Built, solved, and within the residual thresholds.
    Good,
    /// Rejected: ill-conditioned, or residuals out of bounds.
    Bad,
}

/// Statistics of the normalized difference-image residuals.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ResidualStats {
    /// Mean of diff/√variance over the measured region.
    pub mean: f64,
    /// Sample standard deviation of diff/√variance.
    pub std: f64,
    /// Mean squared normalized residual.
    pub chi2: f64,
}

/// A stamp at a single sky position, with its solutions and status.
pub struct KernelCandidate {
    id: u64,
    x: f64,
    y: f64,
    template: Image<f64>,
    science: Image<f64>,
    template_variance: Image<f64>,
    science_variance: Image<f64>,
    variance: Option<Image<f64>>,
    config: SolverConfig,
    original: Option<StaticSolution>,
    pca: Option<StaticSolution>,
    status: CandidateStatus,
    is_initialized: bool,
    use_regularization: bool,
    residuals: Option<ResidualStats>,
}

impl KernelCandidate {
    /// Creates a candidate from a stamp centered at (x, y) in the parent
    /// image's coordinates.
    ///
    /// # Errors
    /// * [`Error::ShapeMismatch`] when the four images disagree in shape.
    /// * [`Error::InvalidConfig`] when the configuration fails validation.
    pub fn new(
        x: f64,
        y: f64,
        template: Image<f64>,
        science: Image<f64>,
        template_variance: Image<f64>,
        science_variance: Image<f64>,
        config: SolverConfig,
    ) -> Result<Self> {
        config.validate()?;
        for image in [&science, &template_variance, &science_variance] {
            if image.dimensions() != template.dimensions() {
                return Err(Error::ShapeMismatch {
                    expected: template.dimensions(),
                    received: image.dimensions(),
                });
            }
        }

        Ok(Self {
            id: NEXT_CANDIDATE_ID.fetch_add(1, Ordering::Relaxed),
            x,
            y,
            template,
            science,
            template_variance,
            science_variance,
            variance: None,
            config,
            original: None,
            pca: None,
            status: CandidateStatus::default(),
            is_initialized: false,
            use_regularization: false,
            residuals: None,
        })
    }

    /// The process-unique id of this candidate.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The x coordinate of the stamp center in the parent image.
    #[must_use]
    pub const fn x(&self) -> f64 {
        self.x
    }

    /// The y coordinate of the stamp center in the parent image.
    #[must_use]
    pub const fn y(&self) -> f64 {
        self.y
    }

    /// The quality state of the candidate.
    #[must_use]
    pub const fn status(&self) -> CandidateStatus {
        self.status
    }

    /// Overrides the quality state. The corpus-level rejection loop uses
    /// this to mark candidates against spatial-fit residuals.
    pub fn set_status(&mut self, status: CandidateStatus) {
        self.status = status;
    }

    /// Whether a build has completed on this candidate.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    /// Whether the last build was regularized.
    #[must_use]
    pub const fn uses_regularization(&self) -> bool {
        self.use_regularization
    }

    /// The residual statistics of the most recent build, if any.
    #[must_use]
    pub const fn residuals(&self) -> Option<&ResidualStats> {
        self.residuals.as_ref()
    }

    /// The variance image used by the most recent build, if any.
    #[must_use]
    pub const fn variance(&self) -> Option<&Image<f64>> {
        self.variance.as_ref()
    }

    /// Builds and solves a solution in the given basis.
    ///
    /// The first build fills the `original` slot; later builds fill `pca`.
    /// Passing a regularization matrix makes the build regularized. The
    /// condition-number gate never fails the call: an ill-conditioned stamp
    /// sets the status to [`CandidateStatus::Bad`] and returns.
    ///
    /// # Errors
    /// * Build and solve errors from the stamp builder and linear solver.
    pub fn build(&mut self, basis: &KernelBasis, h: Option<&DMatrix<f64>>) -> Result<()> {
        self.use_regularization = h.is_some();

        let composed = self.science_variance.add(&self.template_variance)?;
        let variance = if self.config.constant_variance_weighting {
            let median = stats::median(&composed);
            let value = if median > 0.0 { median } else { 1.0 };
            debug!("candidate {}: constant variance weighting at {value}", self.id);
            Image::new(composed.width(), composed.height(), value)
        } else {
            composed
        };
        self.variance = Some(variance);

        let into_pca = self.original.is_some();
        self.build_solution(basis, h, into_pca)?;

        if self.config.check_condition_number {
            let condition = self
                .built_slot(into_pca)?
                .condition_number(self.config.condition_number_kind)?;
            if condition > self.config.max_condition_number {
                warn!(
                    "rejecting candidate {}: condition number {condition:.6e} exceeds {:.6e}",
                    self.id, self.config.max_condition_number,
                );
                self.status = CandidateStatus::Bad;
                return Ok(());
            }
        }

        self.solve_slot(into_pca)?;

        if self.config.iterate_single_kernel && !self.config.constant_variance_weighting {
            let kernel = self.built_slot(into_pca)?.kernel()?;
            let reweighted = convolve_with_squared_kernel(&self.template_variance, &kernel)
                .add(&self.science_variance)?;
            debug!("candidate {}: rebuilding with difference-image variance", self.id);
            self.variance = Some(reweighted);
            self.build_solution(basis, h, into_pca)?;
            self.solve_slot(into_pca)?;
        }

        let residuals = self.residual_stats(self.built_slot(into_pca)?)?;
        let clipped = self.config.single_kernel_clipping
            && (residuals.mean.abs() > self.config.candidate_residual_mean_max
                || residuals.std > self.config.candidate_residual_std_max);
        if clipped {
            warn!(
                "rejecting candidate {}: residual mean {:.3} std {:.3} out of bounds",
                self.id, residuals.mean, residuals.std,
            );
            self.status = CandidateStatus::Bad;
        } else {
            self.status = CandidateStatus::Good;
        }
        self.residuals = Some(residuals);
        self.is_initialized = true;
        Ok(())
    }

    fn build_solution(
        &mut self,
        basis: &KernelBasis,
        h: Option<&DMatrix<f64>>,
        into_pca: bool,
    ) -> Result<()> {
        let solution = {
            let variance = self
                .variance
                .as_ref()
                .ok_or(Error::InternalInvariant("variance composed before build"))?;
            let builder = StampBuilder::new(basis, &self.config);
            let builder = match h {
                Some(h) => builder.with_regularization(h),
                None => builder,
            };
            builder.build(&self.template, &self.science, variance)?
        };

        if into_pca {
            self.pca = Some(solution);
        } else {
            self.original = Some(solution);
        }
        Ok(())
    }

    fn solve_slot(&mut self, pca: bool) -> Result<()> {
        let config = self.config.clone();
        let slot = if pca {
            self.pca.as_mut()
        } else {
            self.original.as_mut()
        };
        slot.ok_or(Error::InternalInvariant("solving an unbuilt slot"))?
            .solve(&config)
    }

    fn built_slot(&self, pca: bool) -> Result<&StaticSolution> {
        if pca {
            self.pca.as_ref().ok_or(Error::MissingSolution("pca"))
        } else {
            self.original
                .as_ref()
                .ok_or(Error::MissingSolution("original"))
        }
    }

    /// The solution in the requested slot.
    ///
    /// # Errors
    /// * [`Error::MissingSolution`] when the slot has not been built.
    pub fn solution(&self, switch: SolutionSwitch) -> Result<&StaticSolution> {
        match switch {
            SolutionSwitch::Original => self.built_slot(false),
            SolutionSwitch::Pca => self.built_slot(true),
            SolutionSwitch::Recent => self
                .pca
                .as_ref()
                .or(self.original.as_ref())
                .ok_or(Error::MissingSolution("recent")),
        }
    }

    /// The fitted kernel in the requested slot.
    ///
    /// # Errors
    /// * [`Error::MissingSolution`] / [`Error::NotSolved`].
    pub fn kernel(&self, switch: SolutionSwitch) -> Result<Kernel> {
        self.solution(switch)?.kernel()
    }

    /// The fitted background in the requested slot.
    ///
    /// # Errors
    /// * [`Error::MissingSolution`] / [`Error::NotSolved`].
    pub fn background(&self, switch: SolutionSwitch) -> Result<f64> {
        self.solution(switch)?.background()
    }

    /// The fitted kernel sum in the requested slot.
    ///
    /// # Errors
    /// * [`Error::MissingSolution`] / [`Error::NotSolved`].
    pub fn ksum(&self, switch: SolutionSwitch) -> Result<f64> {
        self.solution(switch)?.ksum()
    }

    /// The fitted kernel rendered as an image.
    ///
    /// # Errors
    /// * [`Error::MissingSolution`] / [`Error::NotSolved`].
    pub fn kernel_image(&self, switch: SolutionSwitch) -> Result<Image<f64>> {
        self.solution(switch)?.kernel_image()
    }

    /// The difference image `science − template ⊗ kernel − background`.
    ///
    /// Pixels outside the kernel's good region carry no convolved template
    /// and are meaningful only inside that region.
    ///
    /// # Errors
    /// * [`Error::MissingSolution`] / [`Error::NotSolved`].
    pub fn difference_image(&self, switch: SolutionSwitch) -> Result<Image<f64>> {
        let solution = self.solution(switch)?;
        let kernel = solution.kernel()?;
        let background = solution.background()?;

        let convolved = convolve(&self.template, &kernel);
        let diff = self.science.sub(&convolved)?;
        Ok(diff.map_pixels_with_coords(|_, _, value| value - background))
    }

    fn residual_stats(&self, solution: &StaticSolution) -> Result<ResidualStats> {
        let kernel = solution.kernel()?;
        let background = solution.background()?;
        let variance = self
            .variance
            .as_ref()
            .ok_or(Error::InternalInvariant("variance composed before stats"))?;

        let convolved = convolve(&self.template, &kernel);
        let good = kernel.shrink_box(self.template.bbox())?;
        let region = if self.config.use_core_stats {
            stats::core_region(good, self.config.candidate_core_radius)
        } else {
            good
        };

        let normalized: Vec<f64> = region
            .pixels_column_major()
            .map(|(x, y)| {
                let diff = self.science.pixel(x, y) - convolved.pixel(x, y) - background;
                diff / variance.pixel(x, y).sqrt()
            })
            .collect();

        let (mean, std) = stats::mean_and_std(normalized.iter().copied());
        let chi2 = normalized.iter().map(|r| r * r).sum::<f64>() / normalized.len() as f64;
        Ok(ResidualStats { mean, std, chi2 })
    }
}
