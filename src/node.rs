//! Tape node definitions for the reverse-mode tape.

use std::{fmt, ptr::NonNull};

use crate::errors::Result;

/// Backward behaviour of a node whose derivative is not a closed-form
/// multiply-add, e.g. an ODE solve that runs its own adjoint integration.
///
/// `chain` is invoked by the reverse sweep once all downstream contributions
/// have been accumulated. It may open nested regions to run scratch AD
/// computations but must close them before returning, and it must only
/// *add* into upstream adjoints.
pub trait ExternalRule {
    /// Propagates this node's contribution into its upstream adjoints.
    fn chain(&mut self, adjoint: f64) -> Result<()>;

    /// Short name used by [`fmt::Debug`] on the owning node.
    fn name(&self) -> &'static str {
        "external"
    }
}

/// An operand reference together with the local partial derivative.
#[derive(Clone, Copy, Debug)]
pub struct Partial {
    /// Upstream node receiving the contribution.
    pub node: NonNull<TapeNode>,
    /// d(this node) / d(upstream node).
    pub deriv: f64,
}

/// The backward rule recorded with a node.
#[derive(Clone, Copy)]
pub enum Backward {
    /// Independent variable or non-chaining output; nothing to propagate.
    Leaf,
    /// One operand with its partial.
    Unary { a: NonNull<TapeNode>, da: f64 },
    /// Two operands with their partials.
    Binary {
        a: NonNull<TapeNode>,
        da: f64,
        b: NonNull<TapeNode>,
        db: f64,
    },
    /// Container ops: any number of operands, slice lives in the arena.
    Many(NonNull<[Partial]>),
    /// Opaque external function, object lives in the arena.
    External(NonNull<dyn ExternalRule>),
}

/// A node recorded on the tape: value, accumulated adjoint, backward rule.
pub struct TapeNode {
    /// Value computed in the forward pass.
    pub val: f64,
    /// The accumulated adjoint for this node.
    pub adj: f64,
    /// How the adjoint is pushed upstream.
    pub rule: Backward,
}

impl fmt::Debug for TapeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = match self.rule {
            Backward::Leaf => "leaf".to_string(),
            Backward::Unary { a, da } => format!("unary({:?} * {})", a, da),
            Backward::Binary { a, da, b, db } => {
                format!("binary({:?} * {}, {:?} * {})", a, da, b, db)
            }
            Backward::Many(ops) => format!("many({})", ops.len()),
            Backward::External(rule) => unsafe { rule.as_ref().name().to_string() },
        };
        write!(
            f,
            "TapeNode {{ addr: {:?}, val: {}, adj: {}, rule: {} }}",
            self as *const Self as *const (),
            self.val,
            self.adj,
            rule
        )
    }
}

impl TapeNode {
    /// Constructs a leaf with zero adjoint.
    pub fn leaf(val: f64) -> Self {
        Self {
            val,
            adj: 0.0,
            rule: Backward::Leaf,
        }
    }

    /// Constructs a node with the given rule and zero adjoint.
    pub fn with_rule(val: f64, rule: Backward) -> Self {
        Self { val, adj: 0.0, rule }
    }

    /// Propagates the node's adjoint into its operands.
    ///
    /// # Safety
    ///
    /// `this` and every node referenced by its rule must be alive, and no
    /// reference to any of them may be held across the call.
    #[inline(always)]
    pub unsafe fn backward(this: NonNull<TapeNode>) -> Result<()> {
        let (adj, rule) = {
            let node = this.as_ptr();
            ((*node).adj, (*node).rule)
        };
        match rule {
            Backward::Leaf => {}
            Backward::Unary { a, da } => {
                if adj != 0.0 {
                    (*a.as_ptr()).adj += adj * da;
                }
            }
            Backward::Binary { a, da, b, db } => {
                if adj != 0.0 {
                    (*a.as_ptr()).adj += adj * da;
                    (*b.as_ptr()).adj += adj * db;
                }
            }
            Backward::Many(ops) => {
                if adj != 0.0 {
                    for p in ops.as_ref() {
                        (*p.node.as_ptr()).adj += adj * p.deriv;
                    }
                }
            }
            Backward::External(rule) => (*rule.as_ptr()).chain(adj)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_rule_accumulates() {
        let mut a = TapeNode::leaf(2.0);
        let mut b = TapeNode::leaf(3.0);
        a.adj = 0.5;
        let pa = NonNull::from(&mut a);
        let pb = NonNull::from(&mut b);
        let mut out = TapeNode::with_rule(
            6.0,
            Backward::Binary {
                a: pa,
                da: 3.0,
                b: pb,
                db: 2.0,
            },
        );
        out.adj = 2.0;
        unsafe { TapeNode::backward(NonNull::from(&mut out)).unwrap() };
        assert_eq!(a.adj, 6.5);
        assert_eq!(b.adj, 4.0);
    }

    #[test]
    fn zero_adjoint_skips_closed_form_rules() {
        let mut a = TapeNode::leaf(1.0);
        let mut out = TapeNode::with_rule(
            1.0,
            Backward::Unary {
                a: NonNull::from(&mut a),
                da: f64::NAN,
            },
        );
        unsafe { TapeNode::backward(NonNull::from(&mut out)).unwrap() };
        assert_eq!(a.adj, 0.0);
    }

    #[test]
    fn debug_names_the_rule() {
        let node = TapeNode::leaf(1.5);
        let text = format!("{:?}", node);
        assert!(text.contains("val: 1.5"));
        assert!(text.contains("rule: leaf"));
    }
}
