//! Checkpointed forward trajectory.
//!
//! The forward pass stores a [`Point`] every `interval` accepted steps. The
//! backward pass asks for the forward state at arbitrary times, walking from
//! the end towards t0; the window between two checkpoints is recomputed from
//! the earlier one with the forward stepper and cached, so each window is
//! replayed at most once per backward pass. Replay reproduces the forward
//! steps exactly because the integrator is deterministic and is driven
//! through the same output times.

use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;

use nalgebra::DVector;

use crate::errors::{Pass, Result};

use super::options::{Interpolation, StepperKind};
use super::stepper::{Integrator, Point, Tolerances};
use super::system::{ForwardSystem, OdeRhs};

/// Accepted points of one window, first point being its checkpoint.
#[derive(Debug, Clone)]
struct Window {
    index: usize,
    points: Vec<Point>,
}

/// Records checkpoints while the forward pass runs.
#[derive(Debug)]
pub(crate) struct Recorder {
    interval: usize,
    since_last: usize,
    checkpoints: Vec<Point>,
    tail: Vec<Point>,
}

impl Recorder {
    pub fn new(start: Point, interval: usize) -> Self {
        Recorder {
            interval,
            since_last: 0,
            checkpoints: vec![start.clone()],
            tail: vec![start],
        }
    }

    pub fn accept(&mut self, p: &Point) {
        self.since_last += 1;
        self.tail.push(p.clone());
        if self.since_last == self.interval {
            self.since_last = 0;
            self.checkpoints.push(p.clone());
            self.tail = vec![p.clone()];
        }
    }

    pub fn finish(
        self,
        ts: Vec<f64>,
        kind: StepperKind,
        tol: Tolerances,
        max_steps: usize,
        interpolation: Interpolation,
    ) -> Trajectory {
        let index = self.checkpoints.len() - 1;
        Trajectory {
            checkpoints: self.checkpoints,
            ts,
            kind,
            tol,
            max_steps,
            interpolation,
            cache: RefCell::new(Window {
                index,
                points: self.tail,
            }),
            replays: Cell::new(0),
        }
    }
}

/// Forward solution reconstructible at any time in `[t0, ts.last()]`.
#[derive(Debug)]
pub(crate) struct Trajectory {
    checkpoints: Vec<Point>,
    ts: Vec<f64>,
    kind: StepperKind,
    tol: Tolerances,
    max_steps: usize,
    interpolation: Interpolation,
    cache: RefCell<Window>,
    replays: Cell<usize>,
}

impl Trajectory {
    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Number of windows recomputed so far.
    pub fn replays(&self) -> usize {
        self.replays.get()
    }

    fn window_of(&self, t: f64) -> usize {
        self.checkpoints
            .partition_point(|c| c.t <= t)
            .saturating_sub(1)
    }

    fn replay<F: OdeRhs>(&self, sys: &ForwardSystem<'_, F>, index: usize) -> Result<Window> {
        let start = self.checkpoints[index].clone();
        let end = self.checkpoints.get(index + 1).map(|c| c.t);
        let mut it = Integrator::restart(
            sys,
            self.kind,
            self.tol.clone(),
            start.clone(),
            Pass::Backward,
            sys.function,
        );
        let mut points = vec![start];
        let targets: Vec<f64> = self.ts.iter().copied().filter(|&t| t > it.t()).collect();
        for target in targets {
            let mut done = false;
            it.advance_to(target, self.max_steps, |p| {
                points.push(p.clone());
                if end.is_some_and(|e| p.t >= e) {
                    done = true;
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })?;
            if done {
                break;
            }
        }
        self.replays.set(self.replays.get() + 1);
        Ok(Window { index, points })
    }

    /// Forward state at `t`.
    pub fn state_at<F: OdeRhs>(&self, sys: &ForwardSystem<'_, F>, t: f64) -> Result<DVector<f64>> {
        let index = self.window_of(t);
        if self.cache.borrow().index != index {
            let window = self.replay(sys, index)?;
            *self.cache.borrow_mut() = window;
        }
        let cache = self.cache.borrow();
        Ok(interpolate(&cache.points, t, self.interpolation))
    }
}

/// Interpolates through time-sorted accepted points.
fn interpolate(points: &[Point], t: f64, how: Interpolation) -> DVector<f64> {
    if points.len() == 1 {
        return points[0].y.clone();
    }
    let j = points
        .partition_point(|p| p.t < t)
        .clamp(1, points.len() - 1);
    match how {
        Interpolation::Hermite => hermite(&points[j - 1], &points[j], t),
        Interpolation::Polynomial => {
            let len = points.len().min(4);
            let first = (j.saturating_sub(2)).min(points.len() - len);
            lagrange(&points[first..first + len], t)
        }
    }
}

fn hermite(a: &Point, b: &Point, t: f64) -> DVector<f64> {
    let h = b.t - a.t;
    if h == 0.0 {
        return b.y.clone();
    }
    let s = (t - a.t) / h;
    let s2 = s * s;
    let s3 = s2 * s;
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;
    &a.y * h00 + &a.f * (h10 * h) + &b.y * h01 + &b.f * (h11 * h)
}

fn lagrange(points: &[Point], t: f64) -> DVector<f64> {
    let mut y = DVector::zeros(points[0].y.len());
    for (i, pi) in points.iter().enumerate() {
        let w: f64 = points
            .iter()
            .enumerate()
            .filter(|&(k, pk)| k != i && pk.t != pi.t)
            .map(|(_, pk)| (t - pk.t) / (pi.t - pk.t))
            .product();
        y += &pi.y * w;
    }
    y
}
