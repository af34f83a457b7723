//! The differentiable scalar handle.

use core::fmt;
use std::cmp::Ordering;
use std::ptr::NonNull;

use crate::errors::{ADError, Result};
use crate::node::{Backward, Partial, TapeNode};
use crate::sweep;
use crate::tape::Tape;

/// A scalar value, tracked on the current thread's tape when it carries a node.
///
/// `Var` is a plain pointer-sized handle: copying it never copies the node.
/// A `Var` without a node is a constant and receives no adjoint. Handles are
/// neither `Send` nor `Sync`; a node belongs to exactly one thread's tape.
#[derive(Clone, Copy, Default)]
pub struct Var {
    val: f64,
    node: Option<NonNull<TapeNode>>,
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Var({}, Node: {:?})", self.val, self.node)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Var({})", self.val)
    }
}

impl Var {
    /// Creates a new scalar, recording it as a leaf if recording is active.
    pub fn new(v: f64) -> Self {
        let node = Tape::with(|t| t.record(TapeNode::leaf(v)));
        Var { val: v, node }
    }

    /// Creates a constant that is never recorded.
    #[inline]
    pub const fn constant(v: f64) -> Self {
        Var { val: v, node: None }
    }

    #[inline]
    pub(crate) fn from_node(val: f64, node: NonNull<TapeNode>) -> Self {
        Var {
            val,
            node: Some(node),
        }
    }

    #[inline]
    pub(crate) fn node(&self) -> Option<NonNull<TapeNode>> {
        self.node
    }

    /// Records a node with the given rule, or returns a constant if recording
    /// is off.
    #[inline]
    pub(crate) fn record(val: f64, rule: Backward) -> Self {
        let node = Tape::with(|t| t.record(TapeNode::with_rule(val, rule)));
        Var { val, node }
    }

    /// Records a node whose operands are given as `(operand, partial)` pairs.
    /// Constant operands are dropped; if none remain the result is constant.
    pub(crate) fn record_many(val: f64, operands: impl IntoIterator<Item = (Var, f64)>) -> Self {
        let partials: Vec<Partial> = operands
            .into_iter()
            .filter_map(|(v, d)| v.node.map(|node| Partial { node, deriv: d }))
            .collect();
        match partials.as_slice() {
            [] => Var::constant(val),
            [p] => Var::record(val, Backward::Unary { a: p.node, da: p.deriv }),
            [p, q] => Var::record(
                val,
                Backward::Binary {
                    a: p.node,
                    da: p.deriv,
                    b: q.node,
                    db: q.deriv,
                },
            ),
            _ => {
                let node = Tape::with(|t| {
                    if !t.active {
                        return None;
                    }
                    let ops = t.alloc_partials(&partials);
                    t.record(TapeNode::with_rule(val, Backward::Many(ops)))
                });
                Var { val, node }
            }
        }
    }

    #[inline]
    /// Returns the stored scalar value.
    pub fn value(&self) -> f64 {
        self.val
    }

    /// Whether this value is recorded on a tape.
    #[inline]
    pub fn is_differentiable(&self) -> bool {
        self.node.is_some()
    }

    #[inline]
    /// Returns the adjoint for this value if it is on the tape.
    pub fn adjoint(&self) -> Result<f64> {
        self.node
            .map(|p| unsafe { p.as_ref().adj })
            .ok_or(ADError::NodeNotIndexedInTapeErr)
    }

    /// Returns the adjoint, or 0 for constants.
    #[inline]
    pub fn adjoint_or_zero(&self) -> f64 {
        self.node.map_or(0.0, |p| unsafe { p.as_ref().adj })
    }

    /// Overwrites the adjoint; used to seed a sweep.
    pub fn set_adjoint(&self, adj: f64) -> Result<()> {
        let p = self.node.ok_or(ADError::NodeNotIndexedInTapeErr)?;
        unsafe { (*p.as_ptr()).adj = adj };
        Ok(())
    }

    /// Accumulates into the adjoint. A no-op for constants.
    #[inline]
    pub fn add_adjoint(&self, adj: f64) {
        if let Some(p) = self.node {
            unsafe { (*p.as_ptr()).adj += adj };
        }
    }

    /// Seeds this node with 1 and sweeps from it down to the start of the
    /// innermost open region (the start of the tape if none is open).
    pub fn backward(&self) -> Result<()> {
        let root = self.node.ok_or(ADError::NodeNotIndexedInTapeErr)?;
        let (start, end) = Tape::with(|t| {
            let start = t.region_start();
            match t.index_of(root, start) {
                Some(end) => Ok((start, end)),
                None if start > 0 => Err(ADError::NodeOutsideRegion { start }),
                None => Err(ADError::NodeNotIndexedInTapeErr),
            }
        })?;
        unsafe { (*root.as_ptr()).adj = 1.0 };
        sweep::run(start, end)
    }

    /// Attaches this value to the current tape if it is not already recorded.
    pub fn put_on_tape(&mut self) {
        if self.node.is_some() {
            return;
        }
        self.node = Tape::with(|t| Some(t.new_leaf(self.val)));
    }

    /// Sum of all entries, recorded as a single node.
    pub fn sum(xs: &[Var]) -> Var {
        let val = xs.iter().map(|x| x.val).sum();
        Var::record_many(val, xs.iter().map(|&x| (x, 1.0)))
    }

    /// Inner product of two equally long slices, recorded as a single node.
    ///
    /// # Panics
    ///
    /// If the slices differ in length.
    pub fn dot(xs: &[Var], ys: &[Var]) -> Var {
        assert_eq!(xs.len(), ys.len(), "dot: length mismatch");
        let val = xs.iter().zip(ys).map(|(x, y)| x.val * y.val).sum();
        let operands = xs
            .iter()
            .zip(ys)
            .flat_map(|(&x, &y)| [(x, y.val), (y, x.val)]);
        Var::record_many(val, operands)
    }
}

impl From<f64> for Var {
    /// Converts a `f64` into a constant.
    fn from(v: f64) -> Self {
        Var::constant(v)
    }
}

impl From<Var> for f64 {
    fn from(v: Var) -> Self {
        v.val
    }
}

impl PartialEq for Var {
    fn eq(&self, o: &Self) -> bool {
        self.val == o.val
    }
}

impl PartialOrd for Var {
    fn partial_cmp(&self, o: &Self) -> Option<Ordering> {
        self.val.partial_cmp(&o.val)
    }
}

impl PartialEq<f64> for Var {
    fn eq(&self, rhs: &f64) -> bool {
        self.val == *rhs
    }
}

impl PartialOrd<f64> for Var {
    fn partial_cmp(&self, rhs: &f64) -> Option<Ordering> {
        self.val.partial_cmp(rhs)
    }
}
