//! Reverse sweep over a range of the current thread's tape.

use crate::errors::{ADError, Result};
use crate::node::TapeNode;
use crate::tape::Tape;

/// Calls `backward()` on every node from `to` down to `from`, inclusive.
///
/// The caller seeds the terminal adjoint(s) first. The tape is not borrowed
/// while a node propagates, so external rules may open nested regions; nodes
/// they append lie past `to` and are never visited here. The first error
/// aborts the sweep.
pub fn run(from: usize, to: usize) -> Result<()> {
    for i in (from..=to).rev() {
        let ptr = Tape::with(|t| t.node_ptr(i)).ok_or(ADError::NodeNotIndexedInTapeErr)?;
        unsafe { TapeNode::backward(ptr)? };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ExternalRule;
    use crate::var::Var;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Logged {
        id: usize,
        upstream: Option<Var>,
        log: Rc<RefCell<Vec<usize>>>,
    }

    impl ExternalRule for Logged {
        fn chain(&mut self, adjoint: f64) -> Result<()> {
            self.log.borrow_mut().push(self.id);
            if let Some(up) = self.upstream {
                up.add_adjoint(adjoint);
            }
            Ok(())
        }
    }

    #[test]
    fn dependents_propagate_before_dependencies() {
        Tape::start_recording();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = Tape::record_external(
            1.0,
            Logged {
                id: 0,
                upstream: None,
                log: log.clone(),
            },
        );
        let b = Tape::record_external(
            1.0,
            Logged {
                id: 1,
                upstream: Some(a),
                log: log.clone(),
            },
        );
        let c = b * 2.0;
        let d = Tape::record_external(
            c.value(),
            Logged {
                id: 2,
                upstream: Some(c),
                log: log.clone(),
            },
        );
        d.backward().unwrap();
        assert_eq!(*log.borrow(), vec![2, 1, 0]);
        assert_eq!(a.adjoint().unwrap(), 2.0);
        Tape::rewind_to_init();
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        Tape::start_recording();
        let _x = Var::new(1.0);
        assert_eq!(run(0, 3), Err(ADError::NodeNotIndexedInTapeErr));
        Tape::rewind_to_init();
    }
}
