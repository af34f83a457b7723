//! Forward solve through the requested output times.

use std::ops::ControlFlow;

use nalgebra::DVector;

use crate::errors::{Pass, Result};

use super::checkpoint::{Recorder, Trajectory};
use super::options::OdeOptions;
use super::stepper::{Integrator, SolverStats, Tolerances};
use super::system::{ForwardSystem, OdeRhs};

/// States at the output times, plus the data the backward pass needs.
#[derive(Debug)]
pub(crate) struct ForwardRun {
    pub states: Vec<DVector<f64>>,
    /// Attempted steps per interval.
    pub steps: Vec<usize>,
    pub stats: SolverStats,
    /// Present when the run was asked to record checkpoints.
    pub trajectory: Option<Trajectory>,
}

pub(crate) fn forward_tolerances(options: &OdeOptions, n: usize) -> Tolerances {
    Tolerances::new(
        vec![options.relative_tolerance_forward; n],
        options.absolute_tolerance_forward.expand(n),
    )
}

/// Integrates from `(t0, y0)` through every entry of `ts`.
///
/// Intervals of zero length take no step. With `record` set, checkpoints are
/// stored every `num_steps_between_checkpoints` accepted steps.
pub(crate) fn integrate<F: OdeRhs>(
    sys: &ForwardSystem<'_, F>,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    options: &OdeOptions,
    record: bool,
) -> Result<ForwardRun> {
    let tol = forward_tolerances(options, sys.n);
    let mut it = Integrator::new(
        sys,
        options.solver_forward,
        tol.clone(),
        t0,
        DVector::from_column_slice(y0),
        Pass::Forward,
        sys.function,
    )?;
    let mut recorder = record.then(|| Recorder::new(it.point(), options.num_steps_between_checkpoints));

    let mut states = Vec::with_capacity(ts.len());
    let mut steps = Vec::with_capacity(ts.len());
    for &t in ts {
        let n = it.advance_to(t, options.max_num_steps, |p| {
            if let Some(rec) = recorder.as_mut() {
                rec.accept(p);
            }
            ControlFlow::Continue(())
        })?;
        steps.push(n);
        states.push(it.y().clone());
    }

    let trajectory = recorder.map(|rec| {
        rec.finish(
            ts.to_vec(),
            options.solver_forward,
            tol,
            options.max_num_steps,
            options.interpolation,
        )
    });
    Ok(ForwardRun {
        states,
        steps,
        stats: it.stats,
        trajectory,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ADError;
    use crate::scalar::Scalar;
    use approx::assert_relative_eq;

    struct Decay;

    impl OdeRhs for Decay {
        fn eval<S: Scalar>(&self, _t: S, y: &[S], p: &[S]) -> Vec<S> {
            vec![-(p[0] * y[0])]
        }
    }

    fn system(params: &[f64]) -> ForwardSystem<'_, Decay> {
        ForwardSystem {
            rhs: &Decay,
            params,
            n: 1,
            function: "ode_adjoint",
        }
    }

    #[test]
    fn snapshots_at_each_time() {
        let params = [0.5];
        let sys = system(&params);
        let run = integrate(
            &sys,
            &[3.0],
            0.0,
            &[1.0, 2.0, 4.0],
            &OdeOptions::default().with_forward_tolerances(1e-10, 1e-12),
            false,
        )
        .unwrap();
        for (y, t) in run.states.iter().zip([1.0, 2.0, 4.0]) {
            assert_relative_eq!(y[0], 3.0 * f64::exp(-0.5 * t), max_relative = 1e-8);
        }
        assert!(run.trajectory.is_none());
        assert_eq!(run.stats.accepted + run.stats.rejected, run.steps.iter().sum::<usize>());
    }

    #[test]
    fn zero_length_intervals_take_no_steps() {
        let params = [1.0];
        let sys = system(&params);
        let run = integrate(&sys, &[1.0], 1.0, &[1.0, 1.0, 2.0, 2.0], &OdeOptions::default(), true).unwrap();
        assert_eq!(run.steps[0], 0);
        assert_eq!(run.steps[1], 0);
        assert!(run.steps[2] > 0);
        assert_eq!(run.steps[3], 0);
        assert_eq!(run.states[0][0], 1.0);
        assert_eq!(run.states[2], run.states[3]);
    }

    #[test]
    fn exhaustion_names_the_stalled_time() {
        let params = [1.0];
        let sys = system(&params);
        let err = integrate(
            &sys,
            &[1.0],
            0.0,
            &[1.0],
            &OdeOptions::default().with_max_num_steps(1),
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ADError::TooMuchWork {
                function: "ode_adjoint",
                time: 1.0,
                pass: Pass::Forward
            }
        );
        assert_eq!(
            err.to_string(),
            "ode_adjoint: Failed to integrate to next output time (1) in less than max_num_steps steps"
        );
    }
}
