//! The append-only computation tape.
//!
//! Nodes live in a bump [`Arena`]; the tape keeps a book of node pointers in
//! creation order, which is a valid topological order of the dependency
//! graph. Regions are stack-scoped sub-ranges of the book that can be swept,
//! zeroed and discarded without touching the enclosing computation.
//!
//! Each thread owns one tape (see [`TAPE`]). The associated functions without
//! a receiver operate on the current thread's tape.

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::errors::{ADError, Result};
use crate::node::{Backward, ExternalRule, Partial, TapeNode};
use crate::var::Var;

/// Start marker of a nested region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionMarker {
    /// Book length when the region was opened.
    pub start: usize,
    /// 1 for the outermost nested region.
    pub depth: usize,
}

#[derive(Clone, Copy, Debug)]
struct Region {
    marker: RegionMarker,
    was_active: bool,
}

pub struct Tape {
    arena: Arena,
    book: Vec<NonNull<TapeNode>>,
    regions: Vec<Region>,
    pub active: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Tape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Tape {{ nodes: {}, regions: {:?}, active: {}, bytes: {} }}",
            self.book.len(),
            self.regions.iter().map(|r| r.marker).collect::<Vec<_>>(),
            self.active,
            self.arena.allocated_bytes()
        )?;
        for (i, &ptr) in self.book.iter().enumerate() {
            let node = unsafe { ptr.as_ref() };
            writeln!(f, "{}: {:?}", i, node)?;
        }
        Ok(())
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape {
            arena: Arena::new(),
            book: Vec::new(),
            regions: Vec::new(),
            active: false,
        }
    }

    /// Creates a tape pre-sized for `nodes` nodes.
    pub fn with_capacity(nodes: usize) -> Self {
        Tape {
            arena: Arena::with_capacity(nodes * std::mem::size_of::<TapeNode>()),
            book: Vec::with_capacity(nodes),
            regions: Vec::new(),
            active: false,
        }
    }

    #[inline(always)]
    fn push(&mut self, n: TapeNode) -> NonNull<TapeNode> {
        let ptr = self.arena.alloc(n);
        self.book.push(ptr);
        ptr
    }

    /// Number of recorded nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.book.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.book.is_empty()
    }

    /// The underlying arena.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Records a fresh leaf.
    #[inline]
    pub fn new_leaf(&mut self, val: f64) -> NonNull<TapeNode> {
        self.push(TapeNode::leaf(val))
    }

    /// Records `n` if recording is active.
    #[inline]
    pub fn record(&mut self, n: TapeNode) -> Option<NonNull<TapeNode>> {
        self.active.then(|| self.push(n))
    }

    /// Allocates a node in the arena without entering it in the book.
    pub(crate) fn alloc_node(&mut self, n: TapeNode) -> NonNull<TapeNode> {
        self.arena.alloc(n)
    }

    /// Enters a node obtained from [`Tape::alloc_node`] into the book.
    pub(crate) fn record_ptr(&mut self, p: NonNull<TapeNode>) {
        self.book.push(p);
    }

    /// Copies operand partials into the arena.
    pub(crate) fn alloc_partials(&mut self, partials: &[Partial]) -> NonNull<[Partial]> {
        self.arena.alloc_slice_copy(partials)
    }

    /// Moves an external rule into the arena and returns a node carrying it,
    /// not yet entered in the book.
    pub(crate) fn alloc_external<R: ExternalRule + 'static>(
        &mut self,
        val: f64,
        rule: R,
    ) -> NonNull<TapeNode> {
        let rule: NonNull<dyn ExternalRule> = self.arena.alloc(rule);
        self.arena
            .alloc(TapeNode::with_rule(val, Backward::External(rule)))
    }

    /// Pointer of the node at book index `i`.
    #[inline]
    pub fn node_ptr(&self, i: usize) -> Option<NonNull<TapeNode>> {
        self.book.get(i).copied()
    }

    /// Book index of `p`, searching backwards down to `start`.
    pub fn index_of(&self, p: NonNull<TapeNode>, start: usize) -> Option<usize> {
        self.book
            .get(start..)?
            .iter()
            .rposition(|&q| q == p)
            .map(|i| i + start)
    }

    pub fn node(&self, p: NonNull<TapeNode>) -> Option<&TapeNode> {
        self.index_of(p, 0).map(|i| unsafe { self.book[i].as_ref() })
    }

    /// Book index at which the innermost open region starts (0 if none).
    #[inline]
    pub fn region_start(&self) -> usize {
        self.regions.last().map_or(0, |r| r.marker.start)
    }

    /// Number of open nested regions.
    #[inline]
    pub fn region_depth(&self) -> usize {
        self.regions.len()
    }

    /// Opens a nested region. Recording is switched on until it closes.
    pub fn open_region(&mut self) -> RegionMarker {
        let marker = RegionMarker {
            start: self.book.len(),
            depth: self.regions.len() + 1,
        };
        self.regions.push(Region {
            marker,
            was_active: self.active,
        });
        self.arena.push_level();
        self.active = true;
        marker
    }

    /// Closes the innermost region, discarding every node recorded in it and
    /// dropping the arena objects it owned.
    pub fn close_region(&mut self, marker: RegionMarker) -> Result<()> {
        let top = self.regions.last().ok_or(ADError::NoOpenRegion)?;
        if top.marker != marker {
            return Err(ADError::RegionMismatch {
                expected: top.marker.depth,
                got: marker.depth,
            });
        }
        let was_active = top.was_active;
        self.regions.pop();
        self.book.truncate(marker.start);
        self.arena.pop_level();
        self.active = was_active;
        Ok(())
    }

    /// Zeroes the adjoints of every node recorded since `marker`.
    pub fn zero_adjoints_in_region(&mut self, marker: RegionMarker) {
        for &ptr in self.book.iter().skip(marker.start) {
            unsafe { (*ptr.as_ptr()).adj = 0.0 };
        }
    }

    /// Zeroes every adjoint on the tape.
    pub fn zero_adjoints(&mut self) {
        for &ptr in &self.book {
            unsafe { (*ptr.as_ptr()).adj = 0.0 };
        }
    }

    /// Drops every node, region and arena object.
    pub fn clear(&mut self) {
        self.regions.clear();
        self.book.clear();
        self.arena.reset();
    }
}

impl Tape {
    /// Runs `f` with the current thread's tape.
    ///
    /// The borrow lasts for the call only; never call back into the tape from
    /// inside `f`.
    #[inline]
    pub fn with<R>(f: impl FnOnce(&mut Tape) -> R) -> R {
        TAPE.with(|tc| f(&mut tc.borrow_mut()))
    }

    #[inline(always)]
    pub fn reset_adjoints() {
        Tape::with(|t| t.zero_adjoints());
    }

    pub fn debug_print() {
        Tape::with(|t| print!("{:?}", t));
    }

    /// Clears the thread's tape and starts recording.
    pub fn start_recording() {
        Tape::with(|t| {
            t.clear();
            t.active = true;
        });
    }

    pub fn stop_recording() {
        Tape::with(|t| t.active = false);
    }

    #[inline]
    pub fn is_active() -> bool {
        Tape::with(|t| t.active)
    }

    /// Number of nodes on the thread's tape.
    pub fn current_len() -> usize {
        Tape::with(|t| t.len())
    }

    /// Clears the thread's tape without changing the recording flag.
    pub fn rewind_to_init() {
        Tape::with(|t| t.clear());
    }

    /// Sweeps the innermost region (or the whole tape) using whatever seeds
    /// the caller has set.
    pub fn grad() -> Result<()> {
        let (start, len) = Tape::with(|t| (t.region_start(), t.len()));
        if len > start {
            crate::sweep::run(start, len - 1)?;
        }
        Ok(())
    }

    /// Records an opaque external node on the thread's tape.
    ///
    /// Returns a constant when recording is off.
    pub fn record_external<R: ExternalRule + 'static>(val: f64, rule: R) -> Var {
        Tape::with(|t| {
            if !t.active {
                return Var::constant(val);
            }
            let node = t.alloc_external(val, rule);
            t.record_ptr(node);
            Var::from_node(val, node)
        })
    }

    /// Records an external node that owns a set of output leaves.
    ///
    /// The leaves are booked directly after the external node, so every
    /// consumer of an output is swept before the node's rule runs. `make_rule`
    /// receives the output handles; it must not touch the tape.
    ///
    /// Returns `None` when recording is off.
    pub(crate) fn record_external_outputs<R, M>(outputs: &[f64], make_rule: M) -> Option<Vec<Var>>
    where
        R: ExternalRule + 'static,
        M: FnOnce(Vec<Var>) -> R,
    {
        Tape::with(|t| {
            if !t.active {
                return None;
            }
            let handles: Vec<Var> = outputs
                .iter()
                .map(|&v| Var::from_node(v, t.alloc_node(TapeNode::leaf(v))))
                .collect();
            let node = t.alloc_external(0.0, make_rule(handles.clone()));
            t.record_ptr(node);
            for h in &handles {
                if let Some(p) = h.node() {
                    t.record_ptr(p);
                }
            }
            Some(handles)
        })
    }
}

thread_local! {
    pub static TAPE: RefCell<Tape> = RefCell::new(Tape::new());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_respects_active_flag() {
        let mut tape = Tape::new();
        assert!(tape.record(TapeNode::leaf(1.0)).is_none());
        tape.active = true;
        let p = tape.record(TapeNode::leaf(2.0)).unwrap();
        assert_eq!(tape.len(), 1);
        assert_eq!(tape.node(p).unwrap().val, 2.0);
        assert_eq!(tape.index_of(p, 0), Some(0));
        assert_eq!(tape.index_of(p, 1), None);
    }

    #[test]
    fn regions_truncate_and_restore() {
        let mut tape = Tape::new();
        tape.new_leaf(1.0);
        let outer = tape.open_region();
        assert!(tape.active);
        tape.new_leaf(2.0);
        let inner = tape.open_region();
        tape.new_leaf(3.0);
        tape.new_leaf(4.0);
        assert_eq!(tape.region_start(), 2);
        assert_eq!(tape.arena().depth(), 3);

        assert_eq!(
            tape.close_region(outer),
            Err(ADError::RegionMismatch {
                expected: 2,
                got: 1
            })
        );
        tape.close_region(inner).unwrap();
        assert_eq!(tape.len(), 2);
        tape.close_region(outer).unwrap();
        assert_eq!(tape.len(), 1);
        assert!(!tape.active);
        assert_eq!(tape.close_region(outer), Err(ADError::NoOpenRegion));
    }

    #[test]
    fn zeroing_is_limited_to_region() {
        let mut tape = Tape::new();
        let a = tape.new_leaf(1.0);
        unsafe { (*a.as_ptr()).adj = 5.0 };
        let marker = tape.open_region();
        let b = tape.new_leaf(2.0);
        unsafe { (*b.as_ptr()).adj = 7.0 };
        tape.zero_adjoints_in_region(marker);
        assert_eq!(tape.node(a).unwrap().adj, 5.0);
        assert_eq!(tape.node(b).unwrap().adj, 0.0);
        tape.close_region(marker).unwrap();
    }

    #[test]
    fn closed_region_nodes_are_not_found() {
        let mut tape = Tape::new();
        let a = tape.new_leaf(1.0);
        let marker = tape.open_region();
        let b = tape.new_leaf(2.0);
        assert_eq!(tape.index_of(b, tape.region_start()), Some(1));
        tape.close_region(marker).unwrap();
        assert!(tape.node(b).is_none());
        assert_eq!(tape.node_ptr(1), None);
        assert_eq!(tape.node(a).unwrap().val, 1.0);
    }

    #[test]
    fn debug_lists_nodes() {
        let mut tape = Tape::new();
        tape.new_leaf(1.25);
        let text = format!("{:?}", tape);
        assert!(text.contains("nodes: 1"));
        assert!(text.contains("val: 1.25"));
    }
}
