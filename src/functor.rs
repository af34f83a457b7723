//! Gradient and Jacobian evaluation in nested regions.
//!
//! Both functors record on a scratch region of the current thread's tape, so
//! they can be called from inside a reverse sweep (an external rule) or while
//! an outer computation is being recorded, without touching it.

use nalgebra::DMatrix;

use crate::errors::Result;
use crate::region::NestedRegion;
use crate::var::Var;

/// Value and gradient of a scalar function at `x`.
pub fn gradient<F>(f: F, x: &[f64]) -> Result<(f64, Vec<f64>)>
where
    F: FnOnce(&[Var]) -> Var,
{
    let region = NestedRegion::open();
    let xs: Vec<Var> = x.iter().map(|&v| Var::new(v)).collect();
    let out = f(&xs);
    let mut grad = vec![0.0; x.len()];
    if out.is_differentiable() {
        out.backward()?;
        for (g, x) in grad.iter_mut().zip(&xs) {
            *g = x.adjoint_or_zero();
        }
    }
    let val = out.value();
    region.close()?;
    Ok((val, grad))
}

/// Values and Jacobian of a vector function at `x`.
///
/// Row `i` of the Jacobian holds the gradient of output `i`; one reverse
/// sweep is run per output with the region's adjoints zeroed in between.
pub fn jacobian<F>(f: F, x: &[f64]) -> Result<(Vec<f64>, DMatrix<f64>)>
where
    F: FnOnce(&[Var]) -> Vec<Var>,
{
    let region = NestedRegion::open();
    let xs: Vec<Var> = x.iter().map(|&v| Var::new(v)).collect();
    let ys = f(&xs);
    let mut jac = DMatrix::zeros(ys.len(), xs.len());
    for (i, y) in ys.iter().enumerate() {
        if !y.is_differentiable() {
            continue;
        }
        region.zero_adjoints();
        y.backward()?;
        for (j, x) in xs.iter().enumerate() {
            jac[(i, j)] = x.adjoint_or_zero();
        }
    }
    let vals = ys.iter().map(|y| y.value()).collect();
    region.close()?;
    Ok((vals, jac))
}
