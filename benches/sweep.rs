//! Reverse sweep and adjoint solve benchmarks.

use adode::ode::{ode_adjoint, OdeOptions, OdeRhs};
use adode::{gradient, Scalar, Tape, Var};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

#[derive(Clone)]
struct LotkaVolterra;

impl OdeRhs for LotkaVolterra {
    fn eval<S: Scalar>(&self, _t: S, y: &[S], p: &[S]) -> Vec<S> {
        vec![
            p[0] * y[0] - p[1] * y[0] * y[1],
            p[3] * y[0] * y[1] - p[2] * y[1],
        ]
    }
}

fn chain(xs: &[Var]) -> Var {
    let mut acc = xs[0];
    for x in &xs[1..] {
        acc = (acc * *x).sin() + acc.tanh() * 0.5;
    }
    acc
}

fn bench_long_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    for &n in &[100usize, 1_000, 10_000] {
        let x: Vec<f64> = (0..n).map(|i| 1.0 + i as f64 * 1e-3).collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &x, |b, x| {
            b.iter(|| black_box(gradient(chain, black_box(x))))
        });
    }
    group.finish();
}

fn bench_adjoint_solve(c: &mut Criterion) {
    let ts: Vec<f64> = (1..=10).map(|i| i as f64).collect();
    let options = OdeOptions::default();
    c.bench_function("ode_adjoint/lotka_volterra", |b| {
        b.iter(|| {
            Tape::start_recording();
            let y0 = [Var::new(1.0), Var::new(1.0)];
            let params: Vec<Var> = [1.5, 1.0, 3.0, 1.0].iter().map(|&p| Var::new(p)).collect();
            let ts: Vec<Var> = ts.iter().map(|&t| Var::constant(t)).collect();
            let sol = ode_adjoint(&LotkaVolterra, &y0, Var::constant(0.0), &ts, &params, &options)
                .and_then(|sol| Var::sum(&sol.states[9]).backward().map(|_| sol));
            let grad: Vec<f64> = params.iter().map(Var::adjoint_or_zero).collect();
            Tape::rewind_to_init();
            black_box((sol.is_ok(), grad))
        })
    });
}

criterion_group!(benches, bench_long_sweep, bench_adjoint_solve);
criterion_main!(benches);
