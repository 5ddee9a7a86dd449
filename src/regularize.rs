//! Tikhonov regularization of the kernel fit.
//!
//! Delta-function bases have one free parameter per kernel pixel and happily
//! fit noise; penalizing the kernel's second derivative with a matrix H and
//! a strength λ restores smoothness. This module selects λ — either directly,
//! by trace ratio, or by scanning a grid for the minimizer of a risk
//! estimator — and constructs central-difference regularization matrices.

use crate::{
    config::{LambdaStepType, LambdaType, SolverConfig},
    error::{Error, Result},
    solver::LinearSolver,
};
use log::{debug, trace, warn};
use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Iteration cap for the eigendecomposition used by the risk estimator.
const EIGEN_MAX_ITERATIONS: usize = 1024;

/// Selects the regularization strength λ for the system (M, b) with design
/// matrix C and penalty H, according to the configured policy.
///
/// # Errors
/// * [`Error::EigenDecompositionFailed`] when the risk estimator cannot
///   decompose M.
/// * [`Error::RiskEstimationFailed`] when no grid point yields a finite
///   risk.
pub fn select_lambda(
    m: &DMatrix<f64>,
    b: &DVector<f64>,
    c: &DMatrix<f64>,
    h: &DMatrix<f64>,
    config: &SolverConfig,
    solver: &LinearSolver,
) -> Result<f64> {
    match config.lambda_type {
        LambdaType::Absolute => Ok(config.lambda_value),
        LambdaType::Relative => {
            let h_trace = h.trace();
            if h_trace == 0.0 {
                return Err(Error::RiskEstimationFailed(
                    "the regularization matrix has zero trace".to_string(),
                ));
            }
            Ok(m.trace() / h_trace * config.lambda_scaling)
        }
        LambdaType::MinimizeBiasedRisk => {
            minimize_risk(m, b, c, h, config, solver, config.max_condition_number)
        }
        LambdaType::MinimizeUnbiasedRisk => {
            minimize_risk(m, b, c, h, config, solver, f64::INFINITY)
        }
    }
}

/// The λ grid described by the configuration.
#[must_use]
pub fn lambda_grid(config: &SolverConfig) -> Vec<f64> {
    match config.lambda_step_type {
        LambdaStepType::Linear => {
            let steps =
                ((config.lambda_lin_max - config.lambda_lin_min) / config.lambda_lin_step) as usize;
            (0..=steps)
                .map(|i| config.lambda_lin_min + i as f64 * config.lambda_lin_step)
                .collect()
        }
        LambdaStepType::Log => {
            let steps =
                ((config.lambda_log_max - config.lambda_log_min) / config.lambda_log_step) as usize;
            (0..=steps)
                .map(|i| 10.0_f64.powf(config.lambda_log_min + i as f64 * config.lambda_log_step))
                .collect()
        }
    }
}

fn minimize_risk(
    m: &DMatrix<f64>,
    b: &DVector<f64>,
    c: &DMatrix<f64>,
    h: &DMatrix<f64>,
    config: &SolverConfig,
    solver: &LinearSolver,
    max_condition: f64,
) -> Result<f64> {
    let grid = lambda_grid(config);
    let risks = estimate_risk(m, b, c, h, &grid, max_condition, solver)?;

    let mut best: Option<(f64, f64)> = None;
    for (&lambda, &risk) in grid.iter().zip(&risks) {
        trace!("risk({lambda:.6e}) = {risk:.6e}");
        if !risk.is_finite() {
            continue;
        }
        if best.is_none() || risk < best.unwrap().1 {
            best = Some((lambda, risk));
        }
    }

    let (lambda, risk) = best.ok_or_else(|| {
        Error::RiskEstimationFailed(format!(
            "no finite risk over {} grid points",
            grid.len(),
        ))
    })?;
    debug!("risk minimized at lambda {lambda:.6e} (risk {risk:.6e})");
    Ok(lambda)
}

/// Evaluates the biased risk estimator over a λ grid:
/// risk(λ) = aᵀVVᵀa + 2·(tr(VVᵀ·(M+λH)⁻¹) − aᵀM⁺b), where V holds the right
/// singular vectors of C and M⁺ is the pseudo-inverse of M with eigenvalues
/// beyond the condition cutoff truncated to zero.
///
/// Grid points where the damped system cannot be solved or inverted yield
/// `f64::INFINITY` rather than failing the whole scan. The estimator is not
/// convex in λ; callers should treat the grid minimum as exactly that.
///
/// # Errors
/// * [`Error::EigenDecompositionFailed`] when M cannot be decomposed.
/// * [`Error::InternalInvariant`] when the SVD does not return singular
///   vectors.
pub fn estimate_risk(
    m: &DMatrix<f64>,
    b: &DVector<f64>,
    c: &DMatrix<f64>,
    h: &DMatrix<f64>,
    lambdas: &[f64],
    max_condition: f64,
    solver: &LinearSolver,
) -> Result<Vec<f64>> {
    let svd = c.clone().svd(false, true);
    let v_t = svd.v_t.ok_or(Error::InternalInvariant(
        "SVD computed without right singular vectors",
    ))?;
    let vvt = v_t.transpose() * &v_t;

    // Truncated pseudo-inverse of M.
    let eigen = SymmetricEigen::try_new(m.clone(), f64::EPSILON, EIGEN_MAX_ITERATIONS)
        .ok_or(Error::EigenDecompositionFailed)?;
    let e_max = eigen.eigenvalues.amax();
    let inverted = eigen.eigenvalues.map(|e| {
        if e == 0.0 || e_max / e.abs() > max_condition {
            0.0
        } else {
            1.0 / e
        }
    });
    let r = &eigen.eigenvectors;
    let m_pinv = r * DMatrix::from_diagonal(&inverted) * r.transpose();
    let pinv_b = &m_pinv * b;

    let mut risks = Vec::with_capacity(lambdas.len());
    for &lambda in lambdas {
        let damped = m + h * lambda;

        let Ok((a, _)) = solver.solve(&damped, b) else {
            warn!("damped system is unsolvable at lambda {lambda:.6e}");
            risks.push(f64::INFINITY);
            continue;
        };
        let Some(damped_inverse) = damped.try_inverse() else {
            warn!("damped system is not invertible at lambda {lambda:.6e}");
            risks.push(f64::INFINITY);
            continue;
        };

        let term1 = a.dot(&(&vvt * &a));
        let term2a = (&vvt * damped_inverse).trace();
        let term2b = a.dot(&pinv_b);
        risks.push(term1 + 2.0 * (term2a - term2b));
    }
    Ok(risks)
}

/// Builds a central-difference regularization matrix H = DᵀD penalizing the
/// discrete Laplacian of the kernel over its pixel grid, for a basis with
/// one parameter per kernel pixel in column-major order (the delta-function
/// basis). When a background is being fit its row and column are zero.
#[must_use]
pub fn regularization_matrix(
    kernel_width: u32,
    kernel_height: u32,
    fit_for_background: bool,
) -> DMatrix<f64> {
    let (w, h) = (kernel_width as usize, kernel_height as usize);
    let n = w * h;
    // Parameters are ordered column-major over the kernel grid.
    let index = |x: usize, y: usize| x * h + y;

    let mut d = DMatrix::zeros(n, n);
    for x in 0..w {
        for y in 0..h {
            let row = index(x, y);
            d[(row, row)] = -4.0;
            for (nx, ny) in [
                (x.wrapping_sub(1), y),
                (x + 1, y),
                (x, y.wrapping_sub(1)),
                (x, y + 1),
            ] {
                if nx < w && ny < h {
                    d[(row, index(nx, ny))] = 1.0;
                }
            }
        }
    }

    let core = d.transpose() * &d;
    let size = n + usize::from(fit_for_background);
    let mut full = DMatrix::zeros(size, size);
    full.view_mut((0, 0), (n, n)).copy_from(&core);
    full
}
