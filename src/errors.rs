//! Error types for the automatic differentiation crate.

use std::fmt;
use thiserror::Error;

/// Which integration pass raised a solver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// The forward solve producing the state at the output times.
    Forward,
    /// The backward (adjoint) solve run by the reverse sweep.
    Backward,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Forward => write!(f, "to next output time"),
            Pass::Backward => write!(f, "backward to output time"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
/// Error variants for tape, region and integrator operations.
pub enum ADError {
    #[error("Node not indexed in tape")]
    /// Attempted to access a node that is not recorded on the tape.
    NodeNotIndexedInTapeErr,

    #[error("Node lies below the start of the active region (region starts at {start})")]
    /// A sweep was requested for a node created before the innermost region opened.
    NodeOutsideRegion {
        /// Book index at which the active region starts.
        start: usize,
    },

    #[error("Region mismatch: tried to close region at depth {got}, innermost open region is at depth {expected}")]
    /// Regions were closed out of stack order.
    RegionMismatch {
        /// Depth of the innermost open region.
        expected: usize,
        /// Depth of the region that was asked to close.
        got: usize,
    },

    #[error("No nested region is open")]
    /// A region operation was requested with no region open.
    NoOpenRegion,

    #[error("{function}: {name}[{index}] is {value}, but must be finite")]
    /// An input that must be finite was NaN or infinite.
    NonFinite {
        /// Calling function.
        function: &'static str,
        /// Argument name.
        name: &'static str,
        /// Offending position.
        index: usize,
        /// Offending value.
        value: f64,
    },

    #[error("{function}: {name} has size 0, but must have a non-zero size")]
    /// A sequence argument was empty.
    EmptyInput {
        /// Calling function.
        function: &'static str,
        /// Argument name.
        name: &'static str,
    },

    #[error("{function}: {name} is not a valid sorted vector. {name}[{index}] = {value}, but should be greater than or equal to the previous element, {previous}")]
    /// Output times were not sorted.
    Unsorted {
        /// Calling function.
        function: &'static str,
        /// Argument name.
        name: &'static str,
        /// Position of the first out-of-order element.
        index: usize,
        /// The out-of-order element.
        value: f64,
        /// The element before it.
        previous: f64,
    },

    #[error("{function}: initial time is {t0}, but must be less than or equal to the first output time {first}")]
    /// The first output time lies before the initial time.
    TimeBeforeStart {
        /// Calling function.
        function: &'static str,
        /// Initial time.
        t0: f64,
        /// First requested output time.
        first: f64,
    },

    #[error("{function}: size of {name} ({got}) and size of {expected_name} ({expected}) must match in size")]
    /// Two sizes that must agree differ.
    SizeMismatch {
        /// Calling function.
        function: &'static str,
        /// Name of the checked quantity.
        name: &'static str,
        /// Its size.
        got: usize,
        /// Name of the reference quantity.
        expected_name: &'static str,
        /// The reference size.
        expected: usize,
    },

    #[error("{function}: {name} is {value}, but {requirement}")]
    /// A configuration value is out of range.
    InvalidOption {
        /// Calling function.
        function: &'static str,
        /// Option name.
        name: &'static str,
        /// Offending value.
        value: f64,
        /// What the value must satisfy.
        requirement: &'static str,
    },

    #[error("{function}: Failed to integrate {pass} ({time}) in less than max_num_steps steps")]
    /// The step budget between two requested times was exhausted.
    TooMuchWork {
        /// Calling function.
        function: &'static str,
        /// The requested time the solver was integrating towards.
        time: f64,
        /// Forward or backward pass.
        pass: Pass,
    },

    #[error("{function}: step size became too small at t = {time} while integrating {pass}")]
    /// The adaptive step size underflowed.
    StepSizeTooSmall {
        /// Calling function.
        function: &'static str,
        /// Time at which the step size collapsed.
        time: f64,
        /// Forward or backward pass.
        pass: Pass,
    },

    #[error("{function}: a previous backward pass of this integrator failed")]
    /// A failed integrator was asked to propagate again.
    IntegratorFailed {
        /// Calling function.
        function: &'static str,
    },
}

/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, ADError>;
