use approx::{assert_abs_diff_eq, assert_relative_eq};
use diffim::prelude::*;
use diffim::{regularization_matrix, Error, ErrorKind};

mod common;
use common::{blobby_template, delta_gaussian_basis, make_science, no_background_config};

fn structured_candidate(config: SolverConfig, seed: u64) -> (KernelCandidate, KernelBasis) {
    let basis = delta_gaussian_basis(5, 1.0);
    let template = blobby_template(40, 40, seed);
    let science = make_science(&template, &basis, &[0.7, 0.3], 1.5);
    let template_variance = Image::new(40, 40, 0.4);
    let science_variance = Image::new(40, 40, 0.6);

    let candidate = KernelCandidate::new(
        20.0,
        20.0,
        template,
        science,
        template_variance,
        science_variance,
        config,
    )
    .unwrap();
    (candidate, basis)
}

#[test]
fn build_composes_variance_and_solves() {
    let (mut candidate, basis) = structured_candidate(SolverConfig::default(), 61);
    candidate.build(&basis, None).unwrap();

    assert!(candidate.is_initialized());
    assert_eq!(candidate.status(), CandidateStatus::Good);
    assert!(!candidate.uses_regularization());

    // Variance is the sum of the two planes.
    let variance = candidate.variance().unwrap();
    assert_abs_diff_eq!(variance.pixel(10, 10), 1.0, epsilon = 1e-12);

    let kernel = candidate.kernel(SolutionSwitch::Recent).unwrap();
    assert_relative_eq!(kernel.sum(), 1.0, epsilon = 1e-6);
    assert_relative_eq!(
        candidate.background(SolutionSwitch::Recent).unwrap(),
        1.5,
        epsilon = 1e-6,
    );
}

#[test]
fn difference_image_vanishes_in_the_good_region() {
    let (mut candidate, basis) = structured_candidate(SolverConfig::default(), 67);
    candidate.build(&basis, None).unwrap();

    let diff = candidate.difference_image(SolutionSwitch::Recent).unwrap();
    let good = Rect::of_size(40, 40).shrink(2, 2).unwrap();
    for (x, y) in good.pixels_column_major() {
        assert_abs_diff_eq!(diff.pixel(x, y), 0.0, epsilon = 1e-6);
    }

    let residuals = candidate.residuals().unwrap();
    assert_abs_diff_eq!(residuals.mean, 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(residuals.chi2, 0.0, epsilon = 1e-9);
}

#[test]
fn condition_number_gate_marks_bad_without_failing() {
    // Two identical delta kernels give a singular system with an infinite
    // condition number.
    let basis = KernelBasis::new(vec![
        Kernel::delta(5, 5).unwrap(),
        Kernel::delta(5, 5).unwrap(),
    ])
    .unwrap();
    let template = blobby_template(32, 32, 71);
    let science = template.clone();
    let variance = Image::new(32, 32, 1.0);

    let config = SolverConfig {
        fit_for_background: false,
        ..SolverConfig::default()
    }
    .with_condition_number_gate(1.0e12);

    let mut candidate = KernelCandidate::new(
        16.0,
        16.0,
        template,
        science,
        variance.clone(),
        variance,
        config,
    )
    .unwrap();

    candidate.build(&basis, None).unwrap();
    assert_eq!(candidate.status(), CandidateStatus::Bad);
    assert!(!candidate.is_initialized());
    // The gate rejected before solving.
    let err = candidate.kernel(SolutionSwitch::Recent).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSolved);
}

#[test]
fn constant_variance_weighting_uses_the_median() {
    let mut config = no_background_config();
    config.constant_variance_weighting = true;
    let (mut candidate, basis) = structured_candidate(config, 73);
    candidate.build(&basis, None).unwrap();

    let variance = candidate.variance().unwrap();
    let first = variance.pixel(0, 0);
    assert_abs_diff_eq!(first, 1.0, epsilon = 1e-12);
    assert!(variance.data().iter().all(|&v| v == first));
}

#[test]
fn single_kernel_iteration_reweights_and_stays_good() {
    let mut config = SolverConfig::default();
    config.iterate_single_kernel = true;
    let (mut candidate, basis) = structured_candidate(config, 79);
    candidate.build(&basis, None).unwrap();

    assert_eq!(candidate.status(), CandidateStatus::Good);
    // The reweighted variance is no longer the plain plane sum.
    let variance = candidate.variance().unwrap();
    assert!((variance.pixel(20, 20) - 1.0).abs() > 1e-6);

    let kernel = candidate.kernel(SolutionSwitch::Recent).unwrap();
    assert_relative_eq!(kernel.sum(), 1.0, epsilon = 1e-6);
}

#[test]
fn second_build_lands_in_the_pca_slot() {
    let (mut candidate, basis) = structured_candidate(SolverConfig::default(), 83);

    candidate.build(&basis, None).unwrap();
    assert!(matches!(
        candidate.solution(SolutionSwitch::Pca),
        Err(Error::MissingSolution("pca")),
    ));

    candidate.build(&basis, None).unwrap();
    let original = candidate.solution(SolutionSwitch::Original).unwrap().id();
    let pca = candidate.solution(SolutionSwitch::Pca).unwrap().id();
    let recent = candidate.solution(SolutionSwitch::Recent).unwrap().id();
    assert_ne!(original, pca);
    assert_eq!(recent, pca);
}

#[test]
fn regularized_build_records_lambda() {
    let config = SolverConfig {
        fit_for_background: false,
        kernel_basis_set: KernelBasisSet::DeltaFunction,
        kernel_size: 5,
        use_regularization: true,
        lambda_type: LambdaType::Absolute,
        lambda_value: 0.5,
        ..SolverConfig::default()
    };
    let basis = config.basis().unwrap();
    let h = regularization_matrix(5, 5, false);

    let template = blobby_template(36, 36, 89);
    let truth = KernelBasis::new(vec![Kernel::gaussian(5, 5, 1.0, 1.0).unwrap()]).unwrap();
    let science = make_science(&template, &truth, &[1.0], 0.0);
    let variance = Image::new(36, 36, 0.5);

    let mut candidate = KernelCandidate::new(
        18.0,
        18.0,
        template,
        science,
        variance.clone(),
        variance,
        config,
    )
    .unwrap();

    candidate.build(&basis, Some(&h)).unwrap();
    assert!(candidate.uses_regularization());
    let solution = candidate.solution(SolutionSwitch::Recent).unwrap();
    assert_eq!(solution.lambda(), Some(0.5));
}
