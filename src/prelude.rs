//! Common imports.

pub use crate::errors::{ADError, Result};
pub use crate::functor::{gradient, jacobian};
pub use crate::node::{Backward, ExternalRule, TapeNode};
pub use crate::ode::{ode_adjoint, ode_solve, OdeOptions, OdeRhs, OdeSolution};
pub use crate::region::NestedRegion;
pub use crate::scalar::Scalar;
pub use crate::tape::{RegionMarker, Tape};
pub use crate::var::Var;
pub use crate::ode_rhs;
