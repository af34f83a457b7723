//! Argument checks shared by the ODE entry points.

use crate::errors::{ADError, Result};

pub(crate) fn check_finite(function: &'static str, name: &'static str, xs: &[f64]) -> Result<()> {
    match xs.iter().position(|x| !x.is_finite()) {
        Some(index) => Err(ADError::NonFinite {
            function,
            name,
            index,
            value: xs[index],
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_nonempty<T>(function: &'static str, name: &'static str, xs: &[T]) -> Result<()> {
    if xs.is_empty() {
        Err(ADError::EmptyInput { function, name })
    } else {
        Ok(())
    }
}

/// Requires `xs` to be non-decreasing.
pub(crate) fn check_sorted(function: &'static str, name: &'static str, xs: &[f64]) -> Result<()> {
    match xs.windows(2).position(|w| w[1] < w[0]) {
        Some(i) => Err(ADError::Unsorted {
            function,
            name,
            index: i + 1,
            value: xs[i + 1],
            previous: xs[i],
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_starts_after(function: &'static str, t0: f64, ts: &[f64]) -> Result<()> {
    match ts.first() {
        Some(&first) if first < t0 => Err(ADError::TimeBeforeStart { function, t0, first }),
        _ => Ok(()),
    }
}

/// Validates the inputs of a solve in a fixed order: finiteness of every
/// argument, non-empty times and state, sorted times, first time not before
/// the initial time.
pub(crate) fn check_problem(
    function: &'static str,
    y0: &[f64],
    t0: f64,
    ts: &[f64],
    params: &[f64],
) -> Result<()> {
    check_finite(function, "initial state", y0)?;
    check_finite(function, "initial time", &[t0])?;
    check_finite(function, "times", ts)?;
    check_finite(function, "parameters", params)?;
    check_nonempty(function, "times", ts)?;
    check_nonempty(function, "initial state", y0)?;
    check_sorted(function, "times", ts)?;
    check_starts_after(function, t0, ts)
}
