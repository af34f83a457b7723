use adode::ode::{ode_adjoint, ode_solve, OdeOptions, OdeRhs};
use adode::{ode_rhs, Tape, Var};
use approx::assert_relative_eq;

#[ode_rhs(Logistic)]
fn logistic(_t: f64, y: &[f64], p: &[f64]) -> Vec<f64> {
    let r = p[0];
    vec![r * y[0] * (1.0 - y[0] / p[1])]
}

#[ode_rhs(Forced)]
fn forced(t: f64, y: &[f64], _p: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; 2];
    out[0] = y[1];
    out[1] = -y[0] + 0.5 * t.cos() - 2 as f64 * 0.05 * y[1];
    out
}

#[test]
fn plain_function_is_kept() {
    assert_eq!(logistic(0.0, &[5.0], &[1.0, 10.0]), vec![2.5]);
}

#[test]
fn generated_rhs_agrees_with_the_function() {
    let f64_out: Vec<f64> = Forced.eval::<f64>(0.3, &[1.0, -0.5], &[]);
    assert_eq!(f64_out, forced(0.3, &[1.0, -0.5], &[]));

    Tape::start_recording();
    let y = [Var::new(1.0), Var::new(-0.5)];
    let var_out = Forced.eval::<Var>(Var::constant(0.3), &y, &[]);
    assert_eq!(var_out[1].value(), f64_out[1]);
    var_out[1].backward().unwrap();
    assert_eq!(y[0].adjoint().unwrap(), -1.0);
    assert_relative_eq!(y[1].adjoint().unwrap(), -0.1);
    Tape::rewind_to_init();
}

#[test]
fn generated_rhs_drives_the_adjoint_solve() {
    Tape::start_recording();
    let (r, k, y0) = (0.8, 10.0, 1.0);
    let rv = Var::new(r);
    let y0v = Var::new(y0);
    let opts = OdeOptions::default()
        .with_forward_tolerances(1e-10, 1e-12)
        .with_backward_tolerances(1e-10, 1e-12)
        .with_quadrature_tolerances(1e-10, 1e-12);
    let sol = ode_adjoint(
        &Logistic,
        &[y0v],
        Var::constant(0.0),
        &[Var::constant(2.0)],
        &[rv, Var::constant(k)],
        &opts,
    )
    .unwrap();
    sol.states[0][0].backward().unwrap();

    // y(t) = k / (1 + (k/y0 - 1) e^{-rt})
    let t = 2.0;
    let e = f64::exp(-r * t);
    let denom = 1.0 + (k / y0 - 1.0) * e;
    let y = k / denom;
    assert_relative_eq!(sol.states[0][0].value(), y, max_relative = 1e-9);
    let dy_dy0 = k * (k / (y0 * y0)) * e / (denom * denom);
    let dy_dr = k * (k / y0 - 1.0) * t * e / (denom * denom);
    assert_relative_eq!(y0v.adjoint().unwrap(), dy_dy0, max_relative = 1e-6);
    assert_relative_eq!(rv.adjoint().unwrap(), dy_dr, max_relative = 1e-6);
    Tape::rewind_to_init();

    let numeric = ode_solve(&Logistic, &[y0], 0.0, &[t], &[r, k], &opts).unwrap();
    assert_relative_eq!(numeric.states[0][0], y, max_relative = 1e-9);
}
