use criterion::{black_box, criterion_group, criterion_main, Criterion};
use diffim::prelude::*;

fn blobby_template(width: u32, height: u32) -> Image<f64> {
    Image::from_fn(width, height, |x, y| {
        let (x, y) = (f64::from(x), f64::from(y));
        10.0 + 0.1 * x
            + 40.0 * (-((x - 20.0).powi(2) + (y - 25.0).powi(2)) / 8.0).exp()
            + 25.0 * (-((x - 45.0).powi(2) + (y - 40.0).powi(2)) / 24.0).exp()
    })
}

fn bench_build_and_solve(c: &mut Criterion) {
    let config = SolverConfig {
        kernel_size: 9,
        alard_sig_gauss: vec![0.7, 1.5, 3.0],
        alard_deg_gauss: vec![2, 2, 1],
        ..SolverConfig::default()
    };
    let basis = config.basis().unwrap();

    let template = blobby_template(64, 64);
    let kernel = Kernel::gaussian(9, 9, 1.2, 1.2).unwrap();
    let science = diffim::convolve(&template, &kernel);
    let variance = Image::new(64, 64, 1.0);

    c.bench_function("build 64x64 alard-lupton", |b| {
        b.iter(|| {
            StampBuilder::new(&basis, &config)
                .build(black_box(&template), black_box(&science), black_box(&variance))
                .unwrap()
        })
    });

    c.bench_function("build and solve 64x64 alard-lupton", |b| {
        b.iter(|| {
            let mut solution = StampBuilder::new(&basis, &config)
                .build(black_box(&template), black_box(&science), black_box(&variance))
                .unwrap();
            solution.solve(&config).unwrap();
            solution.ksum().unwrap()
        })
    });
}

criterion_group!(benches, bench_build_and_solve);
criterion_main!(benches);
