//! Adjoint-sensitivity ODE solves.
//!
//! [`ode_adjoint`] integrates `dy/dt = f(t, y, params)` forward and records
//! the result as one opaque node on the current tape. When a reverse sweep
//! reaches that node, the adjoint system is integrated backward from the
//! last output time and the gradients with respect to the initial state,
//! the initial time, the output times and the parameters are added in one go.
//!
//! ```
//! use adode::ode::{ode_adjoint, OdeOptions, OdeRhs};
//! use adode::{Scalar, Tape, Var};
//!
//! #[derive(Clone)]
//! struct Decay;
//!
//! impl OdeRhs for Decay {
//!     fn eval<S: Scalar>(&self, _t: S, y: &[S], _p: &[S]) -> Vec<S> {
//!         vec![-y[0]]
//!     }
//! }
//!
//! Tape::start_recording();
//! let y0 = Var::new(2.0);
//! let sol = ode_adjoint(&Decay, &[y0], Var::constant(0.0), &[Var::constant(1.0)], &[], &OdeOptions::default()).unwrap();
//! sol.states[0][0].backward().unwrap();
//! assert!((y0.adjoint().unwrap() - (-1.0f64).exp()).abs() < 1e-5);
//! ```

mod adjoint;
mod check;
mod checkpoint;
mod forward;
pub mod options;
mod stepper;
mod system;

pub use adjoint::{AdjointReport, AdjointStatus, Phase};
pub use options::{AbsTol, Interpolation, OdeOptions, StepperKind};
pub use stepper::SolverStats;
pub use system::{OdeRhs, OdeSystem};

use crate::errors::Result;
use crate::tape::Tape;
use crate::var::Var;

use adjoint::{AdjointOde, Inputs};
use system::ForwardSystem;

/// States at the requested output times.
#[derive(Debug, Clone)]
pub struct OdeSolution<T = Var> {
    /// One state vector per output time.
    pub states: Vec<Vec<T>>,
    /// Steps attempted to reach each output time from the previous one.
    pub steps: Vec<usize>,
    /// Forward solver statistics.
    pub stats: SolverStats,
    /// Progress of the recorded integrator; `None` when nothing was recorded.
    pub adjoint: Option<AdjointStatus>,
}

/// Solves the initial value problem and records it for reverse-mode AD.
///
/// Any of `y0`, `t0`, `ts` and `params` may be differentiable. If none is, or
/// the tape is not recording, the returned states are constants and the tape
/// is left untouched. Otherwise one external node is recorded, followed by
/// `ts.len() * y0.len()` output leaves; sweeping through them triggers the
/// adjoint solve.
///
/// Inputs are validated before anything is recorded. The right-hand side is
/// cloned into the tape.
pub fn ode_adjoint<F>(
    rhs: &F,
    y0: &[Var],
    t0: Var,
    ts: &[Var],
    params: &[Var],
    options: &OdeOptions,
) -> Result<OdeSolution>
where
    F: OdeRhs + Clone + 'static,
{
    const FUNCTION: &str = "ode_adjoint";
    let inputs = Inputs {
        y0: y0.to_vec(),
        t0,
        ts: ts.to_vec(),
        params: params.to_vec(),
    };
    check::check_problem(
        FUNCTION,
        &inputs.y0_values(),
        t0.value(),
        &inputs.ts_values(),
        &inputs.param_values(),
    )?;
    options.validate(FUNCTION, y0.len())?;

    let n = y0.len();
    let record = inputs.any_differentiable() && Tape::is_active();
    let mut ode = AdjointOde::new(rhs.clone(), FUNCTION, inputs, options.clone());
    let (states, steps) = ode.solve_forward(record)?;
    let stats = ode.forward_stats();
    let status = ode.status();

    let flat: Vec<f64> = states.iter().flat_map(|y| y.iter().copied()).collect();
    let outputs = if record {
        Tape::record_external_outputs(&flat, |handles| {
            ode.set_outputs(handles);
            ode
        })
    } else {
        None
    };
    let adjoint = outputs.is_some().then_some(status);
    let outputs = outputs.unwrap_or_else(|| flat.iter().map(|&v| Var::constant(v)).collect());

    Ok(OdeSolution {
        states: outputs.chunks(n).map(<[Var]>::to_vec).collect(),
        steps,
        stats,
        adjoint,
    })
}

/// Solves the initial value problem numerically, without touching the tape.
pub fn ode_solve<F: OdeRhs>(
    rhs: &F,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    params: &[f64],
    options: &OdeOptions,
) -> Result<OdeSolution<f64>> {
    const FUNCTION: &str = "ode_solve";
    check::check_problem(FUNCTION, y0, t0, ts, params)?;
    options.validate(FUNCTION, y0.len())?;
    let sys = ForwardSystem {
        rhs,
        params,
        n: y0.len(),
        function: FUNCTION,
    };
    let run = forward::integrate(&sys, y0, t0, ts, options, false)?;
    Ok(OdeSolution {
        states: run.states.iter().map(|y| y.iter().copied().collect()).collect(),
        steps: run.steps,
        stats: run.stats,
        adjoint: None,
    })
}
