//! Common error types.

use crate::geometry::Rect;
use std::fmt;

/// A shortcut type equivalent to `Result<T, diffim::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// A coarse classification of errors, useful when a caller only cares about
/// how to react rather than about the exact failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller handed the solver something unusable: non-positive
    /// variance, mismatched shapes, a bad configuration value.
    InvalidInput,
    /// A solution product was requested before a successful solve.
    NotSolved,
    /// The solver could not produce finite coefficients.
    Numerical,
    /// A requested solution slot does not exist.
    Runtime,
    /// An internal invariant was violated.
    Logic,
}

/// Represents an error that occurs within the crate.
#[derive(Debug)]
pub enum Error {
    /// The variance image contains a value at or below zero inside the
    /// region being weighted. Inverse-variance weighting is undefined there.
    NonPositiveVariance {
        /// The smallest variance found in the region.
        min: f64,
    },

    /// Two images that must share dimensions do not.
    ShapeMismatch {
        expected: (u32, u32),
        received: (u32, u32),
    },

    /// A vector or matrix has the wrong number of elements for the operation.
    SizeMismatch { expected: usize, received: usize },

    /// A requested rectangle does not fit inside the image it addresses.
    RegionOutOfBounds {
        region: Rect,
        width: u32,
        height: u32,
    },

    /// A kernel basis with no members was supplied.
    EmptyBasis,

    /// Masking left no pixels to fit over.
    NoUsablePixels,

    /// The kernels of a basis do not all share the same dimensions, and
    /// therefore do not share center offsets.
    MismatchedBasis,

    /// Kernels must have odd width and height so that they have a uniquely
    /// defined center pixel.
    EvenKernelSize { width: u32, height: u32 },

    /// A configuration value failed validation, or an enumerated option was
    /// given an unknown textual value.
    InvalidConfig(String),

    /// An unknown mask plane name was looked up.
    UnknownMaskPlane(String),

    /// A kernel, background, or kernel sum was requested from a solution
    /// that has not been solved yet.
    NotSolved,

    /// The symmetric eigendecomposition used as the fallback solver did not
    /// converge.
    EigenDecompositionFailed,

    /// The solver produced at least one NaN coefficient.
    NonFiniteCoefficients {
        /// The eigenvalue condition number of the system that produced the
        /// non-finite coefficients, as a diagnostic.
        condition_number: f64,
    },

    /// The risk estimator used to pick a regularization strength could not
    /// produce a single finite risk value over the whole grid.
    RiskEstimationFailed(String),

    /// A requested solution slot (original or pca) has not been built.
    MissingSolution(&'static str),

    /// An internal invariant was violated. This is a bug in the crate.
    InternalInvariant(&'static str),
}

impl Error {
    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NonPositiveVariance { .. }
            | Self::ShapeMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::RegionOutOfBounds { .. }
            | Self::EmptyBasis
            | Self::NoUsablePixels
            | Self::MismatchedBasis
            | Self::EvenKernelSize { .. }
            | Self::InvalidConfig(_)
            | Self::UnknownMaskPlane(_) => ErrorKind::InvalidInput,
            Self::NotSolved => ErrorKind::NotSolved,
            Self::EigenDecompositionFailed
            | Self::NonFiniteCoefficients { .. }
            | Self::RiskEstimationFailed(_) => ErrorKind::Numerical,
            Self::MissingSolution(_) => ErrorKind::Runtime,
            Self::InternalInvariant(_) => ErrorKind::Logic,
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NonPositiveVariance { min } => {
                write!(f, "variance must be strictly positive, minimum is {min}")
            }
            Self::ShapeMismatch { expected, received } => write!(
                f,
                "expected an image of dimensions {}x{}, received {}x{}",
                expected.0, expected.1, received.0, received.1,
            ),
            Self::SizeMismatch { expected, received } => {
                write!(f, "expected {expected} elements, received {received}")
            }
            Self::RegionOutOfBounds {
                region,
                width,
                height,
            } => write!(
                f,
                "region {}x{}+{}+{} does not fit inside a {width}x{height} image",
                region.width, region.height, region.x, region.y,
            ),
            Self::EmptyBasis => write!(f, "the kernel basis has no members"),
            Self::NoUsablePixels => write!(f, "masking left no pixels to fit over"),
            Self::MismatchedBasis => {
                write!(f, "all kernels of a basis must share dimensions and center")
            }
            Self::EvenKernelSize { width, height } => {
                write!(f, "kernel dimensions must be odd, received {width}x{height}")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::UnknownMaskPlane(name) => write!(f, "unknown mask plane: {name}"),
            Self::NotSolved => write!(f, "the solution has not been solved yet"),
            Self::EigenDecompositionFailed => {
                write!(f, "the symmetric eigendecomposition did not converge")
            }
            Self::NonFiniteCoefficients { condition_number } => write!(
                f,
                "solved coefficients are not finite (condition number {condition_number:.6e})",
            ),
            Self::RiskEstimationFailed(msg) => write!(f, "risk estimation failed: {msg}"),
            Self::MissingSolution(slot) => {
                write!(f, "the {slot} solution has not been built")
            }
            Self::InternalInvariant(msg) => write!(f, "internal invariant violated: {msg}"),
        }
    }
}
