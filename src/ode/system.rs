//! Right-hand sides and the systems the steppers integrate.

use nalgebra::{DMatrix, DVector};

use crate::errors::{ADError, Result};
use crate::functor;
use crate::region::NestedRegion;
use crate::scalar::Scalar;
use crate::var::Var;

use super::checkpoint::Trajectory;

/// Right-hand side `dy/dt = f(t, y, params)`.
///
/// Implementations must be generic over the scalar so the same definition
/// runs numerically and on the tape. Data that is never differentiated is
/// captured in the implementing type.
pub trait OdeRhs {
    fn eval<S: Scalar>(&self, t: S, y: &[S], params: &[S]) -> Vec<S>;
}

/// A first-order system as seen by a stepper.
pub trait OdeSystem {
    fn dim(&self) -> usize;

    fn rhs(&self, t: f64, y: &DVector<f64>) -> Result<DVector<f64>>;

    /// `∂rhs/∂y`, needed by the stiff stepper only.
    fn jacobian(&self, t: f64, y: &DVector<f64>) -> Result<DMatrix<f64>>;
}

fn check_len(function: &'static str, got: usize, n: usize) -> Result<()> {
    if got == n {
        Ok(())
    } else {
        Err(ADError::SizeMismatch {
            function,
            name: "dy_dt",
            got,
            expected_name: "states",
            expected: n,
        })
    }
}

/// The user's right-hand side with numeric parameters.
pub(crate) struct ForwardSystem<'a, F> {
    pub rhs: &'a F,
    pub params: &'a [f64],
    pub n: usize,
    pub function: &'static str,
}

impl<F: OdeRhs> ForwardSystem<'_, F> {
    /// Evaluates the right-hand side at plain values.
    pub fn eval(&self, t: f64, y: &[f64]) -> Result<Vec<f64>> {
        let dy = self.rhs.eval(t, y, self.params);
        check_len(self.function, dy.len(), self.n)?;
        Ok(dy)
    }
}

impl<F: OdeRhs> OdeSystem for ForwardSystem<'_, F> {
    fn dim(&self) -> usize {
        self.n
    }

    fn rhs(&self, t: f64, y: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(DVector::from_vec(self.eval(t, y.as_slice())?))
    }

    fn jacobian(&self, t: f64, y: &DVector<f64>) -> Result<DMatrix<f64>> {
        let params: Vec<Var> = self.params.iter().map(|&p| Var::constant(p)).collect();
        let (dy, jac) = functor::jacobian(
            |ys| self.rhs.eval(Var::constant(t), ys, &params),
            y.as_slice(),
        )?;
        check_len(self.function, dy.len(), self.n)?;
        Ok(jac)
    }
}

/// Augmented adjoint system on `z = [λ; q]`:
///
/// ```text
/// λ' = -(∂f/∂y)ᵀ λ
/// q' = -(∂f/∂p)ᵀ λ
/// ```
///
/// where `p` ranges over the differentiable parameters only. The forward
/// state is reconstructed from the checkpointed trajectory.
pub(crate) struct BackwardSystem<'a, F> {
    pub forward: &'a ForwardSystem<'a, F>,
    pub trajectory: &'a Trajectory,
    /// Indices into the parameter vector that need gradients.
    pub diff_params: &'a [usize],
}

impl<F: OdeRhs> BackwardSystem<'_, F> {
    fn n(&self) -> usize {
        self.forward.n
    }

    /// Records `f(t, y(t), p)` in `region` with fresh leaves for `y` and the
    /// differentiable parameters.
    fn record(&self, t: f64) -> Result<(Vec<Var>, Vec<Var>, Vec<Var>)> {
        let y = self.trajectory.state_at(self.forward, t)?;
        let ys: Vec<Var> = y.iter().map(|&v| Var::new(v)).collect();
        let mut ps: Vec<Var> = self.forward.params.iter().map(|&p| Var::constant(p)).collect();
        for &k in self.diff_params {
            ps[k] = Var::new(self.forward.params[k]);
        }
        let out = self.forward.rhs.eval(Var::constant(t), &ys, &ps);
        check_len(self.forward.function, out.len(), self.n())?;
        Ok((ys, ps, out))
    }
}

impl<F: OdeRhs> OdeSystem for BackwardSystem<'_, F> {
    fn dim(&self) -> usize {
        self.n() + self.diff_params.len()
    }

    fn rhs(&self, t: f64, z: &DVector<f64>) -> Result<DVector<f64>> {
        let n = self.n();
        let region = NestedRegion::open();
        let (ys, ps, out) = self.record(t)?;
        for (o, &lambda) in out.iter().zip(z.iter()) {
            o.add_adjoint(-lambda);
        }
        region.grad()?;
        let mut dz = DVector::zeros(self.dim());
        for (j, y) in ys.iter().enumerate() {
            dz[j] = y.adjoint_or_zero();
        }
        for (k, &idx) in self.diff_params.iter().enumerate() {
            dz[n + k] = ps[idx].adjoint_or_zero();
        }
        region.close()?;
        Ok(dz)
    }

    fn jacobian(&self, t: f64, _z: &DVector<f64>) -> Result<DMatrix<f64>> {
        let n = self.n();
        let region = NestedRegion::open();
        let (ys, ps, out) = self.record(t)?;
        let mut jac = DMatrix::zeros(self.dim(), self.dim());
        for (i, o) in out.iter().enumerate() {
            if !o.is_differentiable() {
                continue;
            }
            region.zero_adjoints();
            o.set_adjoint(1.0)?;
            region.grad()?;
            for (j, y) in ys.iter().enumerate() {
                jac[(j, i)] = -y.adjoint_or_zero();
            }
            for (k, &idx) in self.diff_params.iter().enumerate() {
                jac[(n + k, i)] = -ps[idx].adjoint_or_zero();
            }
        }
        region.close()?;
        Ok(jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Pendulum;

    impl OdeRhs for Pendulum {
        fn eval<S: Scalar>(&self, _t: S, y: &[S], p: &[S]) -> Vec<S> {
            vec![y[1], -(p[0] * y[0].sin())]
        }
    }

    #[test]
    fn forward_system_evaluates_and_differentiates() {
        let params = [9.81];
        let sys = ForwardSystem {
            rhs: &Pendulum,
            params: &params,
            n: 2,
            function: "test",
        };
        let y = DVector::from_vec(vec![0.3, -0.1]);
        let dy = sys.rhs(0.0, &y).unwrap();
        assert_relative_eq!(dy[1], -9.81 * 0.3_f64.sin());
        let jac = sys.jacobian(0.0, &y).unwrap();
        assert_eq!(jac[(0, 0)], 0.0);
        assert_eq!(jac[(0, 1)], 1.0);
        assert_relative_eq!(jac[(1, 0)], -9.81 * 0.3_f64.cos());
    }

    struct WrongSize;

    impl OdeRhs for WrongSize {
        fn eval<S: Scalar>(&self, _t: S, y: &[S], _p: &[S]) -> Vec<S> {
            y[..1].to_vec()
        }
    }

    #[test]
    fn output_size_is_checked() {
        let sys = ForwardSystem {
            rhs: &WrongSize,
            params: &[],
            n: 2,
            function: "ode_adjoint",
        };
        let err = sys.rhs(0.0, &DVector::zeros(2)).unwrap_err();
        assert_eq!(
            err,
            ADError::SizeMismatch {
                function: "ode_adjoint",
                name: "dy_dt",
                got: 1,
                expected_name: "states",
                expected: 2,
            }
        );
    }
}
