//! Scoped sub-tapes.

use std::marker::PhantomData;

use crate::errors::Result;
use crate::sweep;
use crate::tape::{RegionMarker, Tape, TAPE};

/// RAII guard over a nested region of the current thread's tape.
///
/// Everything recorded while the guard is alive is discarded when it closes,
/// explicitly through [`NestedRegion::close`] or on drop (unwinding
/// included). Recording is switched on while the region is open and the
/// previous flag is restored afterwards.
///
/// Guards must close in reverse order of opening.
#[must_use = "a region closes as soon as its guard is dropped"]
pub struct NestedRegion {
    marker: RegionMarker,
    closed: bool,
    _not_send: PhantomData<*const ()>,
}

impl NestedRegion {
    pub fn open() -> Self {
        let marker = Tape::with(|t| t.open_region());
        NestedRegion {
            marker,
            closed: false,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn marker(&self) -> RegionMarker {
        self.marker
    }

    /// Number of nodes recorded in this region, nested regions included.
    pub fn len(&self) -> usize {
        Tape::with(|t| t.len().saturating_sub(self.marker.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zeroes every adjoint in this region; the enclosing tape is untouched.
    pub fn zero_adjoints(&self) {
        Tape::with(|t| t.zero_adjoints_in_region(self.marker));
    }

    /// Sweeps the whole region using the adjoints the caller seeded.
    pub fn grad(&self) -> Result<()> {
        let len = Tape::with(|t| t.len());
        if len > self.marker.start {
            sweep::run(self.marker.start, len - 1)?;
        }
        Ok(())
    }

    /// Closes the region, discarding its nodes.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        Tape::with(|t| t.close_region(self.marker))
    }
}

impl Drop for NestedRegion {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // The tape may be mid-borrow or already torn down while unwinding.
        let _ = TAPE.try_with(|tc| {
            if let Ok(mut t) = tc.try_borrow_mut() {
                let _ = t.close_region(self.marker);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ADError;
    use crate::var::Var;

    #[test]
    fn nodes_are_discarded_on_close() {
        Tape::start_recording();
        let x = Var::new(2.0);
        let y = x * 3.0;
        let before = Tape::current_len();
        {
            let region = NestedRegion::open();
            let z = Var::new(1.0) * Var::new(4.0);
            assert_eq!(region.len(), 3);
            z.backward().unwrap();
            region.close().unwrap();
        }
        assert_eq!(Tape::current_len(), before);
        y.backward().unwrap();
        assert_eq!(x.adjoint().unwrap(), 3.0);
        Tape::rewind_to_init();
    }

    #[test]
    fn drop_closes_and_restores_recording() {
        Tape::stop_recording();
        Tape::rewind_to_init();
        {
            let region = NestedRegion::open();
            assert!(Tape::is_active());
            let _ = Var::new(1.0);
            assert_eq!(region.len(), 1);
        }
        assert!(!Tape::is_active());
        assert_eq!(Tape::current_len(), 0);
    }

    #[test]
    fn out_of_order_close_is_rejected() {
        Tape::start_recording();
        let outer = NestedRegion::open();
        let inner = NestedRegion::open();
        let outer_marker = outer.marker();
        assert_eq!(
            Tape::with(|t| t.close_region(outer_marker)),
            Err(ADError::RegionMismatch {
                expected: 2,
                got: 1
            })
        );
        inner.close().unwrap();
        outer.close().unwrap();
        Tape::rewind_to_init();
    }

    #[test]
    fn region_grad_leaves_outer_adjoints_alone() {
        Tape::start_recording();
        let a = Var::new(1.0);
        a.set_adjoint(7.0).unwrap();
        let region = NestedRegion::open();
        let u = Var::new(2.0);
        let v = Var::new(5.0);
        let w = u * v;
        w.set_adjoint(1.0).unwrap();
        region.grad().unwrap();
        assert_eq!(u.adjoint().unwrap(), 5.0);
        region.zero_adjoints();
        assert_eq!(u.adjoint().unwrap(), 0.0);
        region.close().unwrap();
        assert_eq!(a.adjoint().unwrap(), 7.0);
        Tape::rewind_to_init();
    }
}
