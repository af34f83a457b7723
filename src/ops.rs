//! Elementary operations on [`Var`].
//!
//! Every operation is eager: it evaluates the value, computes the local
//! partials and records a single node.

use std::ops::*;

use crate::node::Backward;
use crate::var::Var;

/// A binary operation definition.
pub trait BinOp {
    /// Evaluates the operator on the input values.
    fn eval(l: f64, r: f64) -> f64;
    /// Computes the derivative with respect to the left operand.
    fn d_left(l: f64, r: f64) -> f64;
    /// Computes the derivative with respect to the right operand.
    fn d_right(l: f64, r: f64) -> f64;
}

/// A unary operation definition.
pub trait UnOp {
    /// Evaluates the operator on the input value.
    fn eval(x: f64) -> f64;
    /// Computes the derivative given the input `x` and the output `v`.
    fn deriv(x: f64, v: f64) -> f64;
}

macro_rules! bin_op {
    ($name:ident, $doc:expr, $eval:expr, $dl:expr, $dr:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug)]
        pub struct $name;
        impl BinOp for $name {
            #[inline]
            fn eval(l: f64, r: f64) -> f64 {
                let f: fn(f64, f64) -> f64 = $eval;
                f(l, r)
            }
            #[inline]
            fn d_left(l: f64, r: f64) -> f64 {
                let f: fn(f64, f64) -> f64 = $dl;
                f(l, r)
            }
            #[inline]
            fn d_right(l: f64, r: f64) -> f64 {
                let f: fn(f64, f64) -> f64 = $dr;
                f(l, r)
            }
        }
    };
}

macro_rules! un_op {
    ($name:ident, $doc:expr, $eval:expr, $d:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug)]
        pub struct $name;
        impl UnOp for $name {
            #[inline]
            fn eval(x: f64) -> f64 {
                let f: fn(f64) -> f64 = $eval;
                f(x)
            }
            #[inline]
            fn deriv(x: f64, v: f64) -> f64 {
                let f: fn(f64, f64) -> f64 = $d;
                f(x, v)
            }
        }
    };
}

bin_op!(AddOp, "Binary addition.", |l, r| l + r, |_, _| 1.0, |_, _| 1.0);
bin_op!(SubOp, "Binary subtraction.", |l, r| l - r, |_, _| 1.0, |_, _| -1.0);
bin_op!(MulOp, "Binary multiplication.", |l, r| l * r, |_, r| r, |l, _| l);
bin_op!(
    DivOp,
    "Binary division.",
    |l, r| l / r,
    |_, r| 1.0 / r,
    |l, r| -l / (r * r)
);
bin_op!(
    PowOp,
    "Binary power.",
    f64::powf,
    |l: f64, r: f64| r * l.powf(r - 1.0),
    |l: f64, r: f64| if l > 0.0 { l.powf(r) * l.ln() } else { 0.0 }
);
bin_op!(
    MaxOp,
    "Binary maximum; the gradient flows to the larger operand.",
    f64::max,
    |l, r| if l >= r { 1.0 } else { 0.0 },
    |l, r| if r > l { 1.0 } else { 0.0 }
);
bin_op!(
    MinOp,
    "Binary minimum; the gradient flows to the smaller operand.",
    f64::min,
    |l, r| if l <= r { 1.0 } else { 0.0 },
    |l, r| if r < l { 1.0 } else { 0.0 }
);

un_op!(NegOp, "Unary negation.", |x: f64| -x, |_, _| -1.0);
un_op!(ExpOp, "Unary exponential.", f64::exp, |_x, v| v);
un_op!(LogOp, "Unary natural logarithm.", f64::ln, |x, _| 1.0 / x);
un_op!(SqrtOp, "Unary square root.", f64::sqrt, |_x, v| 0.5 / v);
un_op!(SinOp, "Unary sine.", f64::sin, |x: f64, _v| x.cos());
un_op!(CosOp, "Unary cosine.", f64::cos, |x: f64, _v| -x.sin());
un_op!(TanhOp, "Unary hyperbolic tangent.", f64::tanh, |_x, v: f64| 1.0 - v * v);
un_op!(
    AbsOp,
    "Unary absolute value.",
    f64::abs,
    |x, _v| if x >= 0.0 { 1.0 } else { -1.0 }
);

impl Var {
    /// Applies a unary operator, recording one node.
    #[inline]
    pub fn apply_unary<O: UnOp>(self) -> Var {
        let val = O::eval(self.value());
        match self.node() {
            Some(a) => Var::record(
                val,
                Backward::Unary {
                    a,
                    da: O::deriv(self.value(), val),
                },
            ),
            None => Var::constant(val),
        }
    }

    /// Applies a binary operator, recording one node.
    #[inline]
    pub fn apply_binary<O: BinOp>(self, r: Var) -> Var {
        let (lv, rv) = (self.value(), r.value());
        let val = O::eval(lv, rv);
        match (self.node(), r.node()) {
            (Some(a), Some(b)) => Var::record(
                val,
                Backward::Binary {
                    a,
                    da: O::d_left(lv, rv),
                    b,
                    db: O::d_right(lv, rv),
                },
            ),
            (Some(a), None) => Var::record(
                val,
                Backward::Unary {
                    a,
                    da: O::d_left(lv, rv),
                },
            ),
            (None, Some(b)) => Var::record(
                val,
                Backward::Unary {
                    a: b,
                    da: O::d_right(lv, rv),
                },
            ),
            (None, None) => Var::constant(val),
        }
    }

    pub fn exp(self) -> Var {
        self.apply_unary::<ExpOp>()
    }

    pub fn ln(self) -> Var {
        self.apply_unary::<LogOp>()
    }

    pub fn sqrt(self) -> Var {
        self.apply_unary::<SqrtOp>()
    }

    pub fn sin(self) -> Var {
        self.apply_unary::<SinOp>()
    }

    pub fn cos(self) -> Var {
        self.apply_unary::<CosOp>()
    }

    pub fn tanh(self) -> Var {
        self.apply_unary::<TanhOp>()
    }

    pub fn abs(self) -> Var {
        self.apply_unary::<AbsOp>()
    }

    /// Power with a differentiable exponent.
    pub fn pow(self, p: Var) -> Var {
        self.apply_binary::<PowOp>(p)
    }

    /// Power with a constant exponent.
    pub fn powf(self, p: f64) -> Var {
        self.apply_binary::<PowOp>(Var::constant(p))
    }

    /// Integer power.
    pub fn powi(self, n: i32) -> Var {
        let x = self.value();
        let val = x.powi(n);
        let d = if n == 0 { 0.0 } else { n as f64 * x.powi(n - 1) };
        match self.node() {
            Some(a) => Var::record(val, Backward::Unary { a, da: d }),
            None => Var::constant(val),
        }
    }

    pub fn max(self, r: Var) -> Var {
        self.apply_binary::<MaxOp>(r)
    }

    pub fn min(self, r: Var) -> Var {
        self.apply_binary::<MinOp>(r)
    }
}

macro_rules! impl_bin_ops {
    ($Trait:ident, $method:ident, $Op:ty, $AssignTrait:ident, $assign:ident) => {
        impl $Trait<Var> for Var {
            type Output = Var;
            #[inline]
            fn $method(self, rhs: Var) -> Var {
                self.apply_binary::<$Op>(rhs)
            }
        }
        impl $Trait<f64> for Var {
            type Output = Var;
            #[inline]
            fn $method(self, rhs: f64) -> Var {
                self.apply_binary::<$Op>(Var::constant(rhs))
            }
        }
        impl $Trait<Var> for f64 {
            type Output = Var;
            #[inline]
            fn $method(self, rhs: Var) -> Var {
                Var::constant(self).apply_binary::<$Op>(rhs)
            }
        }
        impl $AssignTrait<Var> for Var {
            #[inline]
            fn $assign(&mut self, rhs: Var) {
                *self = self.apply_binary::<$Op>(rhs);
            }
        }
        impl $AssignTrait<f64> for Var {
            #[inline]
            fn $assign(&mut self, rhs: f64) {
                *self = self.apply_binary::<$Op>(Var::constant(rhs));
            }
        }
    };
}

impl_bin_ops!(Add, add, AddOp, AddAssign, add_assign);
impl_bin_ops!(Sub, sub, SubOp, SubAssign, sub_assign);
impl_bin_ops!(Mul, mul, MulOp, MulAssign, mul_assign);
impl_bin_ops!(Div, div, DivOp, DivAssign, div_assign);

impl Neg for Var {
    type Output = Var;
    #[inline]
    fn neg(self) -> Var {
        self.apply_unary::<NegOp>()
    }
}
