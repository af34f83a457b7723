//! Numeric abstraction shared by `f64` and [`Var`].
//!
//! Right-hand sides written against [`Scalar`] run unchanged in the numeric
//! forward solve (`S = f64`) and on the tape (`S = Var`).

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use crate::var::Var;

pub trait Scalar:
    Copy
    + Debug
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
{
    /// Lifts a constant. Never recorded.
    fn from_f64(v: f64) -> Self;
    fn value(&self) -> f64;

    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;
    fn pow(self, p: Self) -> Self;
    fn powf(self, p: f64) -> Self;
    fn powi(self, n: i32) -> Self;
    fn max(self, o: Self) -> Self;
    fn min(self, o: Self) -> Self;

    #[inline]
    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    #[inline]
    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl Scalar for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn value(&self) -> f64 {
        *self
    }
    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }
    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }
    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    #[inline]
    fn sin(self) -> Self {
        f64::sin(self)
    }
    #[inline]
    fn cos(self) -> Self {
        f64::cos(self)
    }
    #[inline]
    fn tanh(self) -> Self {
        f64::tanh(self)
    }
    #[inline]
    fn abs(self) -> Self {
        f64::abs(self)
    }
    #[inline]
    fn pow(self, p: Self) -> Self {
        f64::powf(self, p)
    }
    #[inline]
    fn powf(self, p: f64) -> Self {
        f64::powf(self, p)
    }
    #[inline]
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
    #[inline]
    fn max(self, o: Self) -> Self {
        f64::max(self, o)
    }
    #[inline]
    fn min(self, o: Self) -> Self {
        f64::min(self, o)
    }
}

impl Scalar for Var {
    #[inline]
    fn from_f64(v: f64) -> Self {
        Var::constant(v)
    }
    #[inline]
    fn value(&self) -> f64 {
        Var::value(self)
    }
    #[inline]
    fn exp(self) -> Self {
        Var::exp(self)
    }
    #[inline]
    fn ln(self) -> Self {
        Var::ln(self)
    }
    #[inline]
    fn sqrt(self) -> Self {
        Var::sqrt(self)
    }
    #[inline]
    fn sin(self) -> Self {
        Var::sin(self)
    }
    #[inline]
    fn cos(self) -> Self {
        Var::cos(self)
    }
    #[inline]
    fn tanh(self) -> Self {
        Var::tanh(self)
    }
    #[inline]
    fn abs(self) -> Self {
        Var::abs(self)
    }
    #[inline]
    fn pow(self, p: Self) -> Self {
        Var::pow(self, p)
    }
    #[inline]
    fn powf(self, p: f64) -> Self {
        Var::powf(self, p)
    }
    #[inline]
    fn powi(self, n: i32) -> Self {
        Var::powi(self, n)
    }
    #[inline]
    fn max(self, o: Self) -> Self {
        Var::max(self, o)
    }
    #[inline]
    fn min(self, o: Self) -> Self {
        Var::min(self, o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::Tape;
    use approx::assert_relative_eq;

    fn logistic<S: Scalar>(x: S, k: S) -> S {
        S::one() / (S::one() + (-(k * x)).exp())
    }

    #[test]
    fn generic_code_agrees_across_scalars() {
        Tape::start_recording();
        let x = Var::new(0.4);
        let k = Var::new(2.5);
        let v = logistic(x, k);
        assert_relative_eq!(v.value(), logistic(0.4, 2.5));

        v.backward().unwrap();
        let s = logistic(0.4, 2.5);
        assert_relative_eq!(x.adjoint().unwrap(), 2.5 * s * (1.0 - s), epsilon = 1e-12);
        assert_relative_eq!(k.adjoint().unwrap(), 0.4 * s * (1.0 - s), epsilon = 1e-12);
        Tape::rewind_to_init();
    }

    #[test]
    fn from_f64_is_never_recorded() {
        Tape::start_recording();
        let c = <Var as Scalar>::from_f64(3.0);
        assert!(!c.is_differentiable());
        assert_eq!(Tape::current_len(), 0);
        Tape::rewind_to_init();
    }
}
