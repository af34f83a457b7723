//! Solver configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::{ADError, Result};

/// Absolute tolerance, shared by every state component or given per component.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AbsTol {
    Scalar(f64),
    PerState(Vec<f64>),
}

impl AbsTol {
    /// Expands to one tolerance per component.
    pub fn expand(&self, n: usize) -> Vec<f64> {
        match self {
            AbsTol::Scalar(v) => vec![*v; n],
            AbsTol::PerState(v) => v.clone(),
        }
    }

    fn check(&self, function: &'static str, name: &'static str, n: usize) -> Result<()> {
        match self {
            AbsTol::Scalar(v) => check_tolerance(function, name, *v),
            AbsTol::PerState(v) => {
                if v.len() != n {
                    return Err(ADError::SizeMismatch {
                        function,
                        name,
                        got: v.len(),
                        expected_name: "initial state",
                        expected: n,
                    });
                }
                v.iter().try_for_each(|&x| check_tolerance(function, name, x))
            }
        }
    }
}

impl From<f64> for AbsTol {
    fn from(v: f64) -> Self {
        AbsTol::Scalar(v)
    }
}

impl From<Vec<f64>> for AbsTol {
    fn from(v: Vec<f64>) -> Self {
        AbsTol::PerState(v)
    }
}

/// How the forward state is reconstructed between recomputed steps during
/// the backward solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Interpolation {
    /// Cubic Hermite through the step end points and their derivatives.
    #[default]
    Hermite,
    /// Cubic Lagrange polynomial through the four nearest accepted points.
    Polynomial,
}

/// Integration method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StepperKind {
    /// Explicit Dormand–Prince 5(4).
    #[default]
    NonStiff,
    /// Linearly implicit Rosenbrock 2(3) using an AD Jacobian.
    Stiff,
}

/// Options for [`ode_adjoint`](crate::ode::ode_adjoint) and
/// [`ode_solve`](crate::ode::ode_solve).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OdeOptions {
    pub relative_tolerance_forward: f64,
    pub absolute_tolerance_forward: AbsTol,
    pub relative_tolerance_backward: f64,
    pub absolute_tolerance_backward: AbsTol,
    pub relative_tolerance_quadrature: f64,
    pub absolute_tolerance_quadrature: f64,
    /// Ceiling on attempted steps between two consecutive requested times.
    pub max_num_steps: usize,
    /// Accepted forward steps between two stored checkpoints.
    pub num_steps_between_checkpoints: usize,
    pub interpolation: Interpolation,
    pub solver_forward: StepperKind,
    pub solver_backward: StepperKind,
}

impl Default for OdeOptions {
    fn default() -> Self {
        Self {
            relative_tolerance_forward: 1e-6,
            absolute_tolerance_forward: AbsTol::Scalar(1e-6),
            relative_tolerance_backward: 1e-6,
            absolute_tolerance_backward: AbsTol::Scalar(1e-6),
            relative_tolerance_quadrature: 1e-6,
            absolute_tolerance_quadrature: 1e-6,
            max_num_steps: 100_000,
            num_steps_between_checkpoints: 150,
            interpolation: Interpolation::Hermite,
            solver_forward: StepperKind::NonStiff,
            solver_backward: StepperKind::NonStiff,
        }
    }
}

impl OdeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets relative and absolute forward tolerances.
    pub fn with_forward_tolerances(mut self, rtol: f64, atol: impl Into<AbsTol>) -> Self {
        self.relative_tolerance_forward = rtol;
        self.absolute_tolerance_forward = atol.into();
        self
    }

    /// Sets relative and absolute backward tolerances.
    pub fn with_backward_tolerances(mut self, rtol: f64, atol: impl Into<AbsTol>) -> Self {
        self.relative_tolerance_backward = rtol;
        self.absolute_tolerance_backward = atol.into();
        self
    }

    pub fn with_quadrature_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.relative_tolerance_quadrature = rtol;
        self.absolute_tolerance_quadrature = atol;
        self
    }

    pub fn with_max_num_steps(mut self, max_num_steps: usize) -> Self {
        self.max_num_steps = max_num_steps;
        self
    }

    pub fn with_checkpoint_interval(mut self, steps: usize) -> Self {
        self.num_steps_between_checkpoints = steps;
        self
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Uses `kind` for both the forward and the backward pass.
    pub fn with_solver(mut self, kind: StepperKind) -> Self {
        self.solver_forward = kind;
        self.solver_backward = kind;
        self
    }

    pub fn with_solver_forward(mut self, kind: StepperKind) -> Self {
        self.solver_forward = kind;
        self
    }

    pub fn with_solver_backward(mut self, kind: StepperKind) -> Self {
        self.solver_backward = kind;
        self
    }

    /// Checks every option for a system with `n` states.
    pub fn validate(&self, function: &'static str, n: usize) -> Result<()> {
        check_tolerance(
            function,
            "relative_tolerance_forward",
            self.relative_tolerance_forward,
        )?;
        self.absolute_tolerance_forward
            .check(function, "absolute_tolerance_forward", n)?;
        check_tolerance(
            function,
            "relative_tolerance_backward",
            self.relative_tolerance_backward,
        )?;
        self.absolute_tolerance_backward
            .check(function, "absolute_tolerance_backward", n)?;
        check_tolerance(
            function,
            "relative_tolerance_quadrature",
            self.relative_tolerance_quadrature,
        )?;
        check_tolerance(
            function,
            "absolute_tolerance_quadrature",
            self.absolute_tolerance_quadrature,
        )?;
        if self.max_num_steps == 0 {
            return Err(ADError::InvalidOption {
                function,
                name: "max_num_steps",
                value: 0.0,
                requirement: "must be positive",
            });
        }
        if self.num_steps_between_checkpoints == 0 {
            return Err(ADError::InvalidOption {
                function,
                name: "num_steps_between_checkpoints",
                value: 0.0,
                requirement: "must be positive",
            });
        }
        Ok(())
    }
}

fn check_tolerance(function: &'static str, name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ADError::InvalidOption {
            function,
            name,
            value,
            requirement: "must be positive and finite",
        })
    }
}
