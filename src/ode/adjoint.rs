//! The adjoint ODE node.
//!
//! [`AdjointOde`] is recorded as a single external node followed by its
//! output leaves. Its backward rule harvests the output adjoints, integrates
//! the adjoint system from the last output time back to t0 and only then
//! adds the resulting gradients into the inputs.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use nalgebra::DVector;

use crate::errors::{ADError, Pass, Result};
use crate::node::ExternalRule;
use crate::var::Var;

use super::checkpoint::Trajectory;
use super::options::OdeOptions;
use super::stepper::{Integrator, SolverStats, Tolerances};
use super::system::{BackwardSystem, ForwardSystem, OdeRhs};

/// Lifecycle of an adjoint integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Constructed,
    ForwardIntegrating,
    ForwardDone,
    /// Integrating backward from output time `i`.
    BackwardSegment(usize),
    Finalized,
    Failed,
}

/// Snapshot of an adjoint integrator's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjointReport {
    pub phase: Phase,
    /// Statistics of the last backward pass, all segments merged.
    pub backward_stats: SolverStats,
    /// Checkpoints kept by the forward pass, t0 included.
    pub checkpoints: usize,
    /// Trajectory windows recomputed by all backward passes so far.
    pub replays: usize,
}

impl Default for AdjointReport {
    fn default() -> Self {
        AdjointReport {
            phase: Phase::Constructed,
            backward_stats: SolverStats::default(),
            checkpoints: 0,
            replays: 0,
        }
    }
}

/// Shared view of an integrator that lives on the tape.
///
/// The integrator keeps updating it while sweeps run through its node.
#[derive(Debug, Clone, Default)]
pub struct AdjointStatus(Rc<Cell<AdjointReport>>);

impl AdjointStatus {
    pub fn report(&self) -> AdjointReport {
        self.0.get()
    }

    pub fn phase(&self) -> Phase {
        self.0.get().phase
    }

    fn update(&self, f: impl FnOnce(&mut AdjointReport)) {
        let mut report = self.0.get();
        f(&mut report);
        self.0.set(report);
    }
}

/// A differentiable input: its value and its handle.
#[derive(Debug, Clone)]
pub(crate) struct Inputs {
    pub y0: Vec<Var>,
    pub t0: Var,
    pub ts: Vec<Var>,
    pub params: Vec<Var>,
}

impl Inputs {
    pub fn y0_values(&self) -> Vec<f64> {
        self.y0.iter().map(Var::value).collect()
    }

    pub fn ts_values(&self) -> Vec<f64> {
        self.ts.iter().map(Var::value).collect()
    }

    pub fn param_values(&self) -> Vec<f64> {
        self.params.iter().map(Var::value).collect()
    }

    pub fn any_differentiable(&self) -> bool {
        self.t0.is_differentiable()
            || self.y0.iter().any(Var::is_differentiable)
            || self.ts.iter().any(Var::is_differentiable)
            || self.params.iter().any(Var::is_differentiable)
    }

    /// Whether the adjoint system has to be integrated at all; times alone
    /// only need the right-hand side at the output times.
    fn needs_backward_solve(&self) -> bool {
        self.t0.is_differentiable()
            || self.y0.iter().any(Var::is_differentiable)
            || self.params.iter().any(Var::is_differentiable)
    }
}

/// Gradient accumulators, written into the inputs on finalize.
#[derive(Debug, Clone, Default)]
struct Gradients {
    t0: f64,
    y0: Vec<f64>,
    ts: Vec<f64>,
    params: Vec<f64>,
}

pub(crate) struct AdjointOde<F> {
    rhs: F,
    function: &'static str,
    inputs: Inputs,
    y0: Vec<f64>,
    t0: f64,
    ts: Vec<f64>,
    params: Vec<f64>,
    /// Indices of the parameters that need gradients.
    diff_params: Vec<usize>,
    options: OdeOptions,
    states: Vec<DVector<f64>>,
    outputs: Vec<Var>,
    trajectory: Option<Trajectory>,
    grads: Gradients,
    status: AdjointStatus,
    forward_stats: SolverStats,
}

impl<F> fmt::Debug for AdjointOde<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdjointOde")
            .field("function", &self.function)
            .field("phase", &self.status.phase())
            .field("states", &self.y0.len())
            .field("times", &self.ts.len())
            .field("params", &self.params.len())
            .field("diff_params", &self.diff_params)
            .field("forward_stats", &self.forward_stats)
            .field("backward_stats", &self.status.report().backward_stats)
            .finish()
    }
}

impl<F: OdeRhs> AdjointOde<F> {
    pub fn new(rhs: F, function: &'static str, inputs: Inputs, options: OdeOptions) -> Self {
        let diff_params = inputs
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_differentiable())
            .map(|(k, _)| k)
            .collect();
        AdjointOde {
            rhs,
            function,
            y0: inputs.y0_values(),
            t0: inputs.t0.value(),
            ts: inputs.ts_values(),
            params: inputs.param_values(),
            inputs,
            diff_params,
            options,
            states: Vec::new(),
            outputs: Vec::new(),
            trajectory: None,
            grads: Gradients::default(),
            status: AdjointStatus::default(),
            forward_stats: SolverStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.status.phase()
    }

    fn set_phase(&self, phase: Phase) {
        self.status.update(|r| r.phase = phase);
    }

    pub fn status(&self) -> AdjointStatus {
        self.status.clone()
    }

    fn n(&self) -> usize {
        self.y0.len()
    }

    fn system(&self) -> ForwardSystem<'_, F> {
        ForwardSystem {
            rhs: &self.rhs,
            params: &self.params,
            n: self.n(),
            function: self.function,
        }
    }

    /// Runs the forward solve. Returns the states and attempted steps per
    /// output time; checkpoints are kept when `record` is set.
    pub fn solve_forward(&mut self, record: bool) -> Result<(Vec<DVector<f64>>, Vec<usize>)> {
        self.set_phase(Phase::ForwardIntegrating);
        let result = super::forward::integrate(
            &self.system(),
            &self.y0,
            self.t0,
            &self.ts,
            &self.options,
            record,
        );
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                self.set_phase(Phase::Failed);
                return Err(e);
            }
        };
        self.states = run.states.clone();
        self.trajectory = run.trajectory;
        self.forward_stats = run.stats;
        let checkpoints = self.trajectory.as_ref().map_or(0, Trajectory::num_checkpoints);
        self.status.update(|r| {
            r.phase = Phase::ForwardDone;
            r.checkpoints = checkpoints;
        });
        Ok((run.states, run.steps))
    }

    pub fn forward_stats(&self) -> SolverStats {
        self.forward_stats
    }

    /// Hands over the output leaves booked after this node.
    pub fn set_outputs(&mut self, outputs: Vec<Var>) {
        self.outputs = outputs;
    }

    fn backward_tolerances(&self) -> Tolerances {
        let n = self.n();
        let np = self.diff_params.len();
        let mut rtol = vec![self.options.relative_tolerance_backward; n];
        rtol.extend(std::iter::repeat(self.options.relative_tolerance_quadrature).take(np));
        let mut atol = self.options.absolute_tolerance_backward.expand(n);
        atol.extend(std::iter::repeat(self.options.absolute_tolerance_quadrature).take(np));
        Tolerances::new(rtol, atol)
    }

    /// Integrates the adjoint system through every segment, leaving the
    /// gradients in the accumulators.
    fn run_backward(&mut self) -> Result<()> {
        let n = self.n();
        let np = self.diff_params.len();
        self.grads = Gradients {
            t0: 0.0,
            y0: vec![0.0; n],
            ts: vec![0.0; self.ts.len()],
            params: vec![0.0; np],
        };
        let need_solve = self.inputs.needs_backward_solve();
        let tol = self.backward_tolerances();
        let sys = ForwardSystem {
            rhs: &self.rhs,
            params: &self.params,
            n,
            function: self.function,
        };
        let mut lambda = DVector::<f64>::zeros(n);
        let mut quad = DVector::<f64>::zeros(np);
        let mut stats = SolverStats::default();

        for i in (0..self.ts.len()).rev() {
            self.set_phase(Phase::BackwardSegment(i));
            let step = DVector::from_iterator(
                n,
                self.outputs[i * n..(i + 1) * n]
                    .iter()
                    .map(Var::adjoint_or_zero),
            );
            lambda += &step;

            if self.inputs.ts[i].is_differentiable() {
                let f = DVector::from_vec(sys.eval(self.ts[i], self.states[i].as_slice())?);
                self.grads.ts[i] += step.dot(&f);
            }

            let t_prev = if i > 0 { self.ts[i - 1] } else { self.t0 };
            if !need_solve || t_prev == self.ts[i] {
                continue;
            }
            let Some(trajectory) = self.trajectory.as_ref() else {
                continue;
            };
            let back = BackwardSystem {
                forward: &sys,
                trajectory,
                diff_params: &self.diff_params,
            };
            let mut z = DVector::zeros(n + np);
            z.rows_mut(0, n).copy_from(&lambda);
            z.rows_mut(n, np).copy_from(&quad);
            let mut it = Integrator::new(
                &back,
                self.options.solver_backward,
                tol.clone(),
                self.ts[i],
                z,
                Pass::Backward,
                self.function,
            )?;
            it.advance_to(t_prev, self.options.max_num_steps, |_| {
                std::ops::ControlFlow::Continue(())
            })?;
            stats.merge(it.stats);
            let z = it.y();
            lambda.copy_from(&z.rows(0, n));
            quad.copy_from(&z.rows(n, np));
        }

        if self.inputs.t0.is_differentiable() {
            let f = DVector::from_vec(sys.eval(self.t0, &self.y0)?);
            self.grads.t0 -= lambda.dot(&f);
        }
        self.grads.y0 = lambda.iter().copied().collect();
        self.grads.params = quad.iter().copied().collect();
        let replays = self.trajectory.as_ref().map_or(0, Trajectory::replays);
        self.status.update(|r| {
            r.backward_stats = stats;
            r.replays = replays;
        });
        Ok(())
    }

    /// Adds the accumulated gradients into the inputs' adjoints.
    fn finalize(&mut self) {
        self.inputs.t0.add_adjoint(self.grads.t0);
        for (y, g) in self.inputs.y0.iter().zip(&self.grads.y0) {
            y.add_adjoint(*g);
        }
        for (t, g) in self.inputs.ts.iter().zip(&self.grads.ts) {
            t.add_adjoint(*g);
        }
        for (&k, g) in self.diff_params.iter().zip(&self.grads.params) {
            self.inputs.params[k].add_adjoint(*g);
        }
        self.set_phase(Phase::Finalized);
    }
}

impl<F: OdeRhs> ExternalRule for AdjointOde<F> {
    fn chain(&mut self, _adjoint: f64) -> Result<()> {
        match self.phase() {
            Phase::Failed => {
                return Err(ADError::IntegratorFailed {
                    function: self.function,
                })
            }
            Phase::ForwardDone | Phase::Finalized => {}
            // A chain cannot start before the forward pass completed or while
            // a previous chain is still running.
            _ => {
                return Err(ADError::IntegratorFailed {
                    function: self.function,
                })
            }
        }
        match self.run_backward() {
            Ok(()) => {
                self.finalize();
                Ok(())
            }
            Err(e) => {
                self.set_phase(Phase::Failed);
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "ode_adjoint"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::Scalar;
    use crate::tape::Tape;
    use approx::assert_relative_eq;

    #[derive(Clone)]
    struct Decay;

    impl OdeRhs for Decay {
        fn eval<S: Scalar>(&self, _t: S, y: &[S], p: &[S]) -> Vec<S> {
            vec![-(p[0] * y[0])]
        }
    }

    fn inputs(y0: f64, k: f64, ts: &[f64]) -> Inputs {
        Inputs {
            y0: vec![Var::new(y0)],
            t0: Var::constant(0.0),
            ts: ts.iter().map(|&t| Var::constant(t)).collect(),
            params: vec![Var::new(k)],
        }
    }

    fn tight() -> OdeOptions {
        OdeOptions::default()
            .with_forward_tolerances(1e-10, 1e-12)
            .with_backward_tolerances(1e-10, 1e-12)
            .with_quadrature_tolerances(1e-10, 1e-12)
    }

    #[test]
    fn phases_follow_the_solve() {
        Tape::start_recording();
        let inputs = inputs(1.0, 0.5, &[1.0]);
        let (y0, k) = (inputs.y0[0], inputs.params[0]);
        let mut ode = AdjointOde::new(Decay, "ode_adjoint", inputs, tight());
        assert_eq!(ode.phase(), Phase::Constructed);
        assert_eq!(
            ode.chain(0.0),
            Err(ADError::IntegratorFailed {
                function: "ode_adjoint"
            })
        );

        let (states, _) = ode.solve_forward(true).unwrap();
        assert_eq!(ode.phase(), Phase::ForwardDone);
        assert_relative_eq!(states[0][0], f64::exp(-0.5), max_relative = 1e-9);

        let out = Var::new(states[0][0]);
        out.set_adjoint(1.0).unwrap();
        ode.set_outputs(vec![out]);
        let status = ode.status();
        ode.chain(0.0).unwrap();
        assert_eq!(status.phase(), Phase::Finalized);
        let report = status.report();
        assert_eq!(report.checkpoints, 1);
        assert!(report.backward_stats.accepted > 0);
        assert_relative_eq!(y0.adjoint().unwrap(), f64::exp(-0.5), max_relative = 1e-7);
        assert_relative_eq!(k.adjoint().unwrap(), -f64::exp(-0.5), max_relative = 1e-6);

        // A second chain restarts the accumulators and adds again.
        ode.chain(0.0).unwrap();
        assert_relative_eq!(y0.adjoint().unwrap(), 2.0 * f64::exp(-0.5), max_relative = 1e-7);
        Tape::rewind_to_init();
    }

    #[test]
    fn failed_backward_pass_poisons_the_integrator() {
        Tape::start_recording();
        let inputs = inputs(1.0, 1.0, &[10.0]);
        let y0 = inputs.y0[0];
        let mut ode = AdjointOde::new(Decay, "ode_adjoint", inputs, OdeOptions::default());
        let (states, _) = ode.solve_forward(true).unwrap();
        let out = Var::new(states[0][0]);
        out.set_adjoint(1.0).unwrap();
        ode.set_outputs(vec![out]);
        ode.options = ode
            .options
            .clone()
            .with_backward_tolerances(1e-14, 1e-16)
            .with_max_num_steps(2);

        let err = ode.chain(0.0).unwrap_err();
        assert_eq!(
            err,
            ADError::TooMuchWork {
                function: "ode_adjoint",
                time: 0.0,
                pass: Pass::Backward
            }
        );
        assert_eq!(ode.phase(), Phase::Failed);
        assert_eq!(y0.adjoint().unwrap(), 0.0);
        assert_eq!(
            ode.chain(0.0),
            Err(ADError::IntegratorFailed {
                function: "ode_adjoint"
            })
        );
        Tape::rewind_to_init();
    }
}
