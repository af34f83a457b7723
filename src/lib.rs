//! Tape-based reverse-mode automatic differentiation with adjoint ODE
//! sensitivities.
//!
//! Operations on [`Var`] are recorded on a thread-local [`Tape`]; a reverse
//! sweep propagates adjoints from an output back to every input. Scratch
//! computations (Jacobians inside a backward rule, for instance) run in
//! [`NestedRegion`]s that are discarded without touching the enclosing
//! recording. [`ode::ode_adjoint`] records a whole ODE solve as a single
//! node whose backward rule integrates the adjoint system.

extern crate self as adode;

pub mod arena;
pub mod errors;
pub mod functor;
pub mod node;
pub mod ode;
pub mod ops;
pub mod prelude;
pub mod region;
pub mod scalar;
pub mod sweep;
pub mod tape;
pub mod var;

pub use adode_macros::ode_rhs;
pub use errors::{ADError, Pass, Result};
pub use functor::{gradient, jacobian};
pub use region::NestedRegion;
pub use scalar::Scalar;
pub use tape::Tape;
pub use var::Var;
