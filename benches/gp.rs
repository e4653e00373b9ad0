use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::{Array1, Axis};
use semisep::{factorize, solve, terms::Term, GaussianProcess};

fn criterion_semisep(c: &mut Criterion) {
    let kernel = Term::sho(1.0, 2.0, 3.0) + Term::real(0.5, 1.0);

    let mut group = c.benchmark_group("semisep");
    group.sample_size(20);
    for &n in &[1024usize, 4096] {
        let t = Array1::linspace(0., n as f64 / 16., n);
        let diag = Array1::from_elem(n, 0.25);
        let (cs, u, v) = kernel.matrices(&t);

        group.bench_function(format!("factorize {n}"), |b| {
            b.iter(|| {
                std::hint::black_box(
                    factorize(&t, &cs, &u, &v, &diag).expect("factorization error"),
                )
            });
        });

        let factor = factorize(&t, &cs, &u, &v, &diag).expect("factorization error");
        let z = t.mapv(f64::sin).insert_axis(Axis(1));
        group.bench_function(format!("solve {n}"), |b| {
            b.iter(|| std::hint::black_box(solve(&t, &cs, &u, &factor, &z).expect("solve error")));
        });

        let y = t.mapv(f64::sin);
        let mut gp = GaussianProcess::new(kernel.clone());
        gp.compute(&t, &diag).expect("GP compute error");
        group.bench_function(format!("log_likelihood {n}"), |b| {
            b.iter(|| std::hint::black_box(gp.log_likelihood(&y).expect("likelihood error")));
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_semisep);
criterion_main!(benches);
