//! One-step integrators with adaptive step-size control.
//!
//! [`Integrator`] drives either method towards a target time, in either
//! direction, and reports every accepted step through a callback.

use std::ops::ControlFlow;

use nalgebra::{DMatrix, DVector};

use crate::errors::{ADError, Pass, Result};

use super::options::StepperKind;
use super::system::OdeSystem;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Per-component error weights.
#[derive(Debug, Clone)]
pub(crate) struct Tolerances {
    pub rtol: DVector<f64>,
    pub atol: DVector<f64>,
}

impl Tolerances {
    pub fn new(rtol: Vec<f64>, atol: Vec<f64>) -> Self {
        Tolerances {
            rtol: DVector::from_vec(rtol),
            atol: DVector::from_vec(atol),
        }
    }

    /// Weighted RMS norm of `err` scaled by the larger of `y` and `y_new`.
    fn norm(&self, err: &DVector<f64>, y: &DVector<f64>, y_new: &DVector<f64>) -> f64 {
        let n = err.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = (0..n)
            .map(|i| {
                let sc = self.atol[i] + self.rtol[i] * y[i].abs().max(y_new[i].abs());
                (err[i] / sc).powi(2)
            })
            .sum();
        (sum / n as f64).sqrt()
    }
}

/// Step statistics of one integrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverStats {
    pub accepted: usize,
    pub rejected: usize,
    pub rhs_evals: usize,
    pub jacobian_evals: usize,
}

impl SolverStats {
    pub fn merge(&mut self, other: SolverStats) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.rhs_evals += other.rhs_evals;
        self.jacobian_evals += other.jacobian_evals;
    }
}

/// An accepted point: time, state, derivative and the step size proposed
/// for the next step (0 before the first step).
#[derive(Debug, Clone)]
pub(crate) struct Point {
    pub t: f64,
    pub y: DVector<f64>,
    pub f: DVector<f64>,
    pub h: f64,
}

/// Result of one attempted step.
struct Trial {
    y: DVector<f64>,
    f: DVector<f64>,
    err: DVector<f64>,
}

// Dormand–Prince 5(4) tableau.
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

fn dopri5<S: OdeSystem>(
    sys: &S,
    stats: &mut SolverStats,
    t: f64,
    y: &DVector<f64>,
    k1: &DVector<f64>,
    h: f64,
) -> Result<Trial> {
    let k2 = sys.rhs(t + C2 * h, &(y + k1 * (h * A21)))?;
    let k3 = sys.rhs(t + C3 * h, &(y + (k1 * A31 + &k2 * A32) * h))?;
    let k4 = sys.rhs(t + C4 * h, &(y + (k1 * A41 + &k2 * A42 + &k3 * A43) * h))?;
    let k5 = sys.rhs(
        t + C5 * h,
        &(y + (k1 * A51 + &k2 * A52 + &k3 * A53 + &k4 * A54) * h),
    )?;
    let k6 = sys.rhs(
        t + h,
        &(y + (k1 * A61 + &k2 * A62 + &k3 * A63 + &k4 * A64 + &k5 * A65) * h),
    )?;
    let y_new = y + (k1 * B1 + &k3 * B3 + &k4 * B4 + &k5 * B5 + &k6 * B6) * h;
    let k7 = sys.rhs(t + h, &y_new)?;
    stats.rhs_evals += 6;
    let err = (k1 * E1 + &k3 * E3 + &k4 * E4 + &k5 * E5 + &k6 * E6 + &k7 * E7) * h;
    Ok(Trial {
        y: y_new,
        f: k7,
        err,
    })
}

/// Rosenbrock 2(3) in the formulation of Shampine and Reichelt (ode23s).
/// Returns `None` when the iteration matrix is singular.
fn rosenbrock23<S: OdeSystem>(
    sys: &S,
    stats: &mut SolverStats,
    t: f64,
    y: &DVector<f64>,
    f0: &DVector<f64>,
    h: f64,
) -> Result<Option<Trial>> {
    let d = 1.0 / (2.0 + std::f64::consts::SQRT_2);
    let e32 = 6.0 + std::f64::consts::SQRT_2;
    let n = y.len();

    let jac = sys.jacobian(t, y)?;
    stats.jacobian_evals += 1;
    let dt = f64::EPSILON.sqrt() * t.abs().max(h.abs()).max(1.0);
    let ft = sys.rhs(t + dt, y)?;
    let time_deriv = (ft - f0) / dt;

    let w: DMatrix<f64> = DMatrix::identity(n, n) - jac * (h * d);
    let lu = w.lu();
    let k1 = match lu.solve(&(f0 + &time_deriv * (h * d))) {
        Some(k) => k,
        None => return Ok(None),
    };
    let f1 = sys.rhs(t + 0.5 * h, &(y + &k1 * (0.5 * h)))?;
    let k2 = match lu.solve(&(&f1 - &k1)) {
        Some(k) => k + &k1,
        None => return Ok(None),
    };
    let y_new = y + &k2 * h;
    let f2 = sys.rhs(t + h, &y_new)?;
    let rhs3 = &f2 - (&k2 - &f1) * e32 - (&k1 - f0) * 2.0 + &time_deriv * (h * d);
    let k3 = match lu.solve(&rhs3) {
        Some(k) => k,
        None => return Ok(None),
    };
    stats.rhs_evals += 3;
    let err = (k1 - &k2 * 2.0 + k3) * (h / 6.0);
    Ok(Some(Trial {
        y: y_new,
        f: f2,
        err,
    }))
}

/// Adaptive integrator over an [`OdeSystem`].
pub(crate) struct Integrator<'s, S> {
    sys: &'s S,
    kind: StepperKind,
    tol: Tolerances,
    t: f64,
    y: DVector<f64>,
    f: DVector<f64>,
    /// Magnitude of the next step; 0 until the first step is chosen.
    h: f64,
    pass: Pass,
    function: &'static str,
    pub stats: SolverStats,
}

impl<'s, S: OdeSystem> Integrator<'s, S> {
    pub fn new(
        sys: &'s S,
        kind: StepperKind,
        tol: Tolerances,
        t0: f64,
        y0: DVector<f64>,
        pass: Pass,
        function: &'static str,
    ) -> Result<Self> {
        let f = sys.rhs(t0, &y0)?;
        let mut it = Self::restart(
            sys,
            kind,
            tol,
            Point {
                t: t0,
                y: y0,
                f,
                h: 0.0,
            },
            pass,
            function,
        );
        it.stats.rhs_evals = 1;
        Ok(it)
    }

    /// Resumes from a stored point without re-evaluating the right-hand side.
    pub fn restart(
        sys: &'s S,
        kind: StepperKind,
        tol: Tolerances,
        p: Point,
        pass: Pass,
        function: &'static str,
    ) -> Self {
        Integrator {
            sys,
            kind,
            tol,
            t: p.t,
            y: p.y,
            f: p.f,
            h: p.h,
            pass,
            function,
            stats: SolverStats::default(),
        }
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn point(&self) -> Point {
        Point {
            t: self.t,
            y: self.y.clone(),
            f: self.f.clone(),
            h: self.h,
        }
    }

    fn error_exponent(&self) -> f64 {
        match self.kind {
            StepperKind::NonStiff => 1.0 / 5.0,
            StepperKind::Stiff => 1.0 / 3.0,
        }
    }

    /// Starting step after Hairer, Nørsett and Wanner, Solving ODEs I, II.4.
    fn initial_step(&mut self, target: f64) -> Result<f64> {
        let span = (target - self.t).abs();
        let dir = (target - self.t).signum();
        let zero = DVector::zeros(self.y.len());
        let d0 = self.tol.norm(&self.y, &zero, &self.y);
        let d1 = self.tol.norm(&self.f, &zero, &self.y);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        }
        .min(span);
        let y1 = &self.y + &self.f * (dir * h0);
        let f1 = self.sys.rhs(self.t + dir * h0, &y1)?;
        self.stats.rhs_evals += 1;
        let d2 = self.tol.norm(&(f1 - &self.f), &zero, &self.y) / h0;
        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(self.error_exponent())
        };
        Ok((100.0 * h0).min(h1).min(span))
    }

    /// Integrates to `target`, calling `on_accept` after every accepted step.
    ///
    /// Returns the number of attempted steps. Reaching `target` exactly is
    /// guaranteed on success; the callback may stop the integration early
    /// with [`ControlFlow::Break`]. At most `max_steps` steps are attempted.
    pub fn advance_to<C>(&mut self, target: f64, max_steps: usize, mut on_accept: C) -> Result<usize>
    where
        C: FnMut(&Point) -> ControlFlow<()>,
    {
        let mut steps = 0;
        while self.t != target {
            if steps >= max_steps {
                return Err(ADError::TooMuchWork {
                    function: self.function,
                    time: target,
                    pass: self.pass,
                });
            }
            if self.h == 0.0 {
                self.h = self.initial_step(target)?;
            }
            let dir = (target - self.t).signum();
            let mut h = self.h * dir;
            let clamped = (self.t + h - target) * dir >= 0.0;
            if clamped {
                h = target - self.t;
            }
            if h.abs() < 16.0 * f64::EPSILON * self.t.abs() {
                return Err(ADError::StepSizeTooSmall {
                    function: self.function,
                    time: self.t,
                    pass: self.pass,
                });
            }

            steps += 1;
            let trial = match self.kind {
                StepperKind::NonStiff => Some(dopri5(
                    self.sys,
                    &mut self.stats,
                    self.t,
                    &self.y,
                    &self.f,
                    h,
                )?),
                StepperKind::Stiff => rosenbrock23(
                    self.sys,
                    &mut self.stats,
                    self.t,
                    &self.y,
                    &self.f,
                    h,
                )?,
            };
            let err = match &trial {
                Some(trial) => self.tol.norm(&trial.err, &self.y, &trial.y),
                None => f64::INFINITY,
            };

            match trial {
                Some(trial) if err <= 1.0 => {
                    let factor = if err == 0.0 {
                        MAX_FACTOR
                    } else {
                        (SAFETY * err.powf(-self.error_exponent())).clamp(MIN_FACTOR, MAX_FACTOR)
                    };
                    self.t = if clamped { target } else { self.t + h };
                    self.y = trial.y;
                    self.f = trial.f;
                    let next = h.abs() * factor;
                    self.h = if clamped { self.h.max(next) } else { next };
                    self.stats.accepted += 1;
                    if on_accept(&self.point()).is_break() {
                        return Ok(steps);
                    }
                }
                _ => {
                    let factor = if err.is_finite() {
                        (SAFETY * err.powf(-self.error_exponent())).clamp(MIN_FACTOR, 1.0)
                    } else {
                        MIN_FACTOR
                    };
                    self.h = h.abs() * factor;
                    self.stats.rejected += 1;
                }
            }
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Decay;

    impl OdeSystem for Decay {
        fn dim(&self) -> usize {
            1
        }
        fn rhs(&self, _t: f64, y: &DVector<f64>) -> Result<DVector<f64>> {
            Ok(-y)
        }
        fn jacobian(&self, _t: f64, _y: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_element(1, 1, -1.0))
        }
    }

    /// Robertson-like stiff linear pair: fast mode -1000, slow mode -1.
    struct StiffPair;

    impl OdeSystem for StiffPair {
        fn dim(&self) -> usize {
            2
        }
        fn rhs(&self, _t: f64, y: &DVector<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![-1000.0 * y[0] + 999.0 * y[1], -y[1]]))
        }
        fn jacobian(&self, _t: f64, _y: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(2, 2, &[-1000.0, 999.0, 0.0, -1.0]))
        }
    }

    fn tol(n: usize, rtol: f64, atol: f64) -> Tolerances {
        Tolerances::new(vec![rtol; n], vec![atol; n])
    }

    fn integrate<S: OdeSystem>(sys: &S, kind: StepperKind, y0: Vec<f64>, t1: f64) -> Integrator<'_, S> {
        let mut it = Integrator::new(
            sys,
            kind,
            tol(y0.len(), 1e-8, 1e-10),
            0.0,
            DVector::from_vec(y0),
            Pass::Forward,
            "test",
        )
        .unwrap();
        it.advance_to(t1, 100_000, |_| ControlFlow::Continue(()))
            .unwrap();
        it
    }

    #[test]
    fn dopri_solves_decay() {
        let it = integrate(&Decay, StepperKind::NonStiff, vec![2.0], 1.0);
        assert_eq!(it.t(), 1.0);
        assert_relative_eq!(it.y()[0], 2.0 * (-1.0_f64).exp(), max_relative = 1e-7);
    }

    #[test]
    fn rosenbrock_solves_stiff_pair() {
        let it = integrate(&StiffPair, StepperKind::Stiff, vec![1.0, 1.0], 2.0);
        let slow = (-2.0_f64).exp();
        assert_relative_eq!(it.y()[1], slow, max_relative = 1e-4);
        assert_relative_eq!(it.y()[0], slow, max_relative = 1e-3);
        assert!(it.stats.jacobian_evals > 0);
    }

    #[test]
    fn integrates_backwards_in_time() {
        let mut it = Integrator::new(
            &Decay,
            StepperKind::NonStiff,
            tol(1, 1e-9, 1e-12),
            1.0,
            DVector::from_element(1, 1.0),
            Pass::Backward,
            "test",
        )
        .unwrap();
        it.advance_to(0.0, 10_000, |_| ControlFlow::Continue(()))
            .unwrap();
        assert_eq!(it.t(), 0.0);
        assert_relative_eq!(it.y()[0], 1.0_f64.exp(), max_relative = 1e-7);
    }

    #[test]
    fn step_budget_reports_target() {
        let mut it = Integrator::new(
            &Decay,
            StepperKind::NonStiff,
            tol(1, 1e-10, 1e-12),
            0.0,
            DVector::from_element(1, 1.0),
            Pass::Forward,
            "f",
        )
        .unwrap();
        let err = it
            .advance_to(5.0, 1, |_| ControlFlow::Continue(()))
            .unwrap_err();
        assert_eq!(
            err,
            ADError::TooMuchWork {
                function: "f",
                time: 5.0,
                pass: Pass::Forward
            }
        );
    }

    #[test]
    fn callback_can_stop_early() {
        let mut it = Integrator::new(
            &Decay,
            StepperKind::NonStiff,
            tol(1, 1e-8, 1e-10),
            0.0,
            DVector::from_element(1, 1.0),
            Pass::Forward,
            "f",
        )
        .unwrap();
        let mut seen = 0;
        it.advance_to(10.0, 1000, |_| {
            seen += 1;
            if seen == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!(seen, 2);
        assert!(it.t() < 10.0);
    }

    #[test]
    fn restart_replays_identically() {
        let mut a = Integrator::new(
            &Decay,
            StepperKind::NonStiff,
            tol(1, 1e-6, 1e-8),
            0.0,
            DVector::from_element(1, 1.0),
            Pass::Forward,
            "f",
        )
        .unwrap();
        let mut points = Vec::new();
        a.advance_to(3.0, 1000, |p| {
            points.push(p.clone());
            ControlFlow::Continue(())
        })
        .unwrap();
        assert!(points.len() > 3);

        let mut b = Integrator::restart(
            &Decay,
            StepperKind::NonStiff,
            tol(1, 1e-6, 1e-8),
            points[1].clone(),
            Pass::Forward,
            "f",
        );
        let mut replayed = Vec::new();
        b.advance_to(3.0, 1000, |p| {
            replayed.push(p.t);
            ControlFlow::Continue(())
        })
        .unwrap();
        let expected: Vec<f64> = points[2..].iter().map(|p| p.t).collect();
        assert_eq!(replayed, expected);
    }
}
