use approx::assert_relative_eq;
use diffim::prelude::*;
use nalgebra::{DMatrix, DVector};

mod common;
use common::{blobby_template, delta_gaussian_basis, make_science, no_background_config};

#[test]
fn linear_variation_is_recovered_exactly() {
    // Local solutions vary linearly with position; a degree-1 spatial
    // polynomial must reproduce them to machine precision.
    let basis = KernelBasis::new(vec![Kernel::delta(3, 3).unwrap()]).unwrap();
    let truth = |x: f64, y: f64| 1.0 + 0.02 * x - 0.01 * y;

    let mut system = SpatialSystem::new(
        basis,
        Box::new(PolynomialFunction2::new(1)),
        None,
        false,
    );
    for i in 0..5u32 {
        for j in 0..5u32 {
            let (x, y) = (f64::from(i) * 25.0, f64::from(j) * 25.0);
            let q = DMatrix::from_vec(1, 1, vec![2.0]);
            let w = DVector::from_vec(vec![2.0 * truth(x, y)]);
            system.add_constraint(x, y, &q, &w).unwrap();
        }
    }

    let solution = system.solve(&SolverConfig::default()).unwrap();
    let coefficients = solution.kernel().coefficients(0).unwrap();
    assert_relative_eq!(coefficients[0], 1.0, epsilon = 1e-8);
    assert_relative_eq!(coefficients[1], 0.02, epsilon = 1e-8);
    assert_relative_eq!(coefficients[2], -0.01, epsilon = 1e-8);

    for (x, y) in [(0.0, 0.0), (50.0, 100.0), (33.0, 71.0)] {
        let kernel = solution.kernel().kernel_at(x, y).unwrap();
        assert_relative_eq!(kernel.sum(), truth(x, y), epsilon = 1e-8);
    }
}

#[test]
fn stamp_pipeline_recovers_spatially_varying_blend() {
    // Full pipeline: build stamps whose kernel blend varies linearly across
    // a 5x5 grid, aggregate their normal equations, and check the spatial
    // kernel against the truth at every stamp center.
    let basis = delta_gaussian_basis(5, 1.0);
    let config = no_background_config();
    let variance = Image::new(32, 32, 1.0);
    let blend = |x: f64, y: f64| 0.5 + 0.001 * x + 0.0005 * y;

    let mut system = SpatialSystem::new(
        basis.clone(),
        Box::new(PolynomialFunction2::new(1)),
        None,
        false,
    );

    let mut centers = Vec::new();
    for i in 0..5u32 {
        for j in 0..5u32 {
            let (x, y) = (f64::from(i) * 60.0 + 16.0, f64::from(j) * 60.0 + 16.0);
            let template = blobby_template(32, 32, 100 + u64::from(i * 5 + j));
            let alpha = blend(x, y);
            let science = make_science(&template, &basis, &[alpha, 1.0 - alpha], 0.0);

            let mut local = StampBuilder::new(&basis, &config)
                .build(&template, &science, &variance)
                .unwrap();
            local.solve(&config).unwrap();

            system
                .add_constraint(x, y, &local.m(false), local.b())
                .unwrap();
            centers.push((x, y));
        }
    }

    let solution = system.solve(&SolverConfig::default()).unwrap();
    for (x, y) in centers {
        let coefficients = solution.kernel().coefficients_at(x, y);
        let alpha = blend(x, y);
        assert_relative_eq!(coefficients[0], alpha, epsilon = 1e-6);
        assert_relative_eq!(coefficients[1], 1.0 - alpha, epsilon = 1e-6);
    }
}

#[test]
fn constant_first_term_holds_the_first_basis_fixed() {
    let basis = delta_gaussian_basis(5, 1.2);
    let config = no_background_config();
    let variance = Image::new(32, 32, 1.0);

    let mut system = SpatialSystem::new(
        basis.clone(),
        Box::new(PolynomialFunction2::new(1)),
        None,
        true,
    );
    // (2 - 1) * 3 + 1 spatial unknowns.
    assert_eq!(system.unknowns(), 4);

    let second = |x: f64, _y: f64| 0.2 + 0.002 * x;
    for i in 0..4u32 {
        for j in 0..4u32 {
            let (x, y) = (f64::from(i) * 40.0 + 16.0, f64::from(j) * 40.0 + 16.0);
            let template = blobby_template(32, 32, 200 + u64::from(i * 4 + j));
            let science = make_science(&template, &basis, &[0.8, second(x, y)], 0.0);

            let mut local = StampBuilder::new(&basis, &config)
                .build(&template, &science, &variance)
                .unwrap();
            local.solve(&config).unwrap();

            system
                .add_constraint(x, y, &local.m(false), local.b())
                .unwrap();
        }
    }

    let solution = system.solve(&SolverConfig::default()).unwrap();
    let first = solution.kernel().coefficients(0).unwrap();
    assert_relative_eq!(first[0], 0.8, epsilon = 1e-6);
    // The padded spatial terms of the constant first basis stay zero.
    assert_eq!(first[1], 0.0);
    assert_eq!(first[2], 0.0);

    for (x, y) in [(16.0, 16.0), (136.0, 56.0), (96.0, 136.0)] {
        let coefficients = solution.kernel().coefficients_at(x, y);
        assert_relative_eq!(coefficients[1], second(x, y), epsilon = 1e-6);
    }
}

#[test]
fn background_block_is_aggregated() {
    let basis = delta_gaussian_basis(5, 1.0);
    let config = SolverConfig::default();
    let variance = Image::new(32, 32, 1.0);
    let background = |x: f64, _y: f64| 3.0 + 0.01 * x;

    let mut system = SpatialSystem::new(
        basis.clone(),
        Box::new(PolynomialFunction2::new(1)),
        Some(Box::new(PolynomialFunction2::new(1))),
        false,
    );

    let mut centers = Vec::new();
    for i in 0..4u32 {
        for j in 0..4u32 {
            let (x, y) = (f64::from(i) * 50.0 + 16.0, f64::from(j) * 50.0 + 16.0);
            let template = blobby_template(32, 32, 300 + u64::from(i * 4 + j));
            let science = make_science(&template, &basis, &[0.6, 0.4], background(x, y));

            let mut local = StampBuilder::new(&basis, &config)
                .build(&template, &science, &variance)
                .unwrap();
            local.solve(&config).unwrap();

            system
                .add_constraint(x, y, &local.m(false), local.b())
                .unwrap();
            centers.push((x, y));
        }
    }

    let solution = system.solve(&SolverConfig::default()).unwrap();
    for (x, y) in centers {
        assert_relative_eq!(
            solution.background().value_at(x, y),
            background(x, y),
            epsilon = 1e-6,
        );
        let coefficients = solution.kernel().coefficients_at(x, y);
        assert_relative_eq!(coefficients[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(coefficients[1], 0.4, epsilon = 1e-6);
    }
}
