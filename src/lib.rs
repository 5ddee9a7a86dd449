//! diffim: an image-difference kernel solver.
//!
//! Given a co-registered template and science image with a per-pixel
//! variance map, this crate determines the convolution kernel that, applied
//! to the template, best matches the science image — optionally jointly
//! fitting a differential background, penalizing kernel roughness, and
//! interpolating per-stamp kernels across an image with spatial polynomials.

#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod candidate;
pub mod config;
pub mod convolve;
pub mod error;
pub mod geometry;
pub mod image;
pub mod kernel;
pub mod mask;
pub mod matrix;
pub mod regularize;
pub mod solver;
pub mod spatial;
pub mod stats;

pub use builder::{BasisConvolver, StampBuilder, StaticSolution};
pub use candidate::{CandidateStatus, KernelCandidate, ResidualStats, SolutionSwitch};
pub use config::{
    ConditionNumberKind, KernelBasisSet, LambdaStepType, LambdaType, SolverConfig,
};
pub use convolve::{convolve, convolve_with_squared_kernel};
pub use error::{Error, ErrorKind, Result};
pub use geometry::Rect;
pub use image::Image;
pub use kernel::{Kernel, KernelBasis};
pub use mask::{Footprint, Mask, MaskPlane};
pub use regularize::regularization_matrix;
pub use solver::{LinearSolver, SolvedBy};
pub use spatial::{
    PolynomialFunction2, SpatialBackground, SpatialFunction, SpatialKernel, SpatialSolution,
    SpatialSystem,
};

pub mod prelude {
    pub use super::{
        CandidateStatus, ConditionNumberKind, Image, Kernel, KernelBasis, KernelBasisSet,
        KernelCandidate, LambdaStepType, LambdaType, LinearSolver, Mask, MaskPlane,
        PolynomialFunction2, Rect, SolutionSwitch, SolvedBy, SolverConfig, SpatialSystem,
        StampBuilder, StaticSolution,
    };
}
