//! Bump arena backing all node storage.
//!
//! The arena is a stack of levels. Level 0 holds the root computation; every
//! nested region pushes a level of its own so that closing the region can
//! release exactly the memory it used. Memory is never handed back to the
//! operating system on a pop: the level's [`Bump`] is reset and parked for the
//! next region.
//!
//! Bump allocation never runs `Drop`. Objects that own heap memory register a
//! destructor (object pointer + function pointer) on their level and are
//! destroyed in reverse registration order when the level is released.

use bumpalo::Bump;
use std::alloc::Layout;
use std::mem;
use std::ptr::{self, NonNull};

/// Type-erased destructor registered for an arena-allocated object.
#[derive(Clone, Copy)]
struct Destructor {
    obj: NonNull<u8>,
    drop_fn: unsafe fn(NonNull<u8>),
}

unsafe fn drop_erased<T>(obj: NonNull<u8>) {
    ptr::drop_in_place(obj.cast::<T>().as_ptr());
}

struct Level {
    bump: Bump,
    destructors: Vec<Destructor>,
}

impl Level {
    fn new(bump: Bump) -> Self {
        Self {
            bump,
            destructors: Vec::new(),
        }
    }

    /// Runs the registered destructors newest first, then rewinds the bump.
    fn release(&mut self) {
        while let Some(d) = self.destructors.pop() {
            unsafe { (d.drop_fn)(d.obj) };
        }
        self.bump.reset();
    }
}

/// Stack of bump levels with per-level destructor registries.
pub struct Arena {
    levels: Vec<Level>,
    spare: Vec<Bump>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// Creates an arena with a single (root) level.
    pub fn new() -> Self {
        Self {
            levels: vec![Level::new(Bump::new())],
            spare: Vec::new(),
        }
    }

    /// Creates an arena whose root level pre-allocates `bytes`.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            levels: vec![Level::new(Bump::with_capacity(bytes))],
            spare: Vec::new(),
        }
    }

    #[inline(always)]
    fn top(&mut self) -> &mut Level {
        let last = self.levels.len() - 1;
        &mut self.levels[last]
    }

    /// Allocates raw memory on the innermost level.
    ///
    /// Running out of memory aborts the process.
    #[inline]
    pub fn alloc_layout(&mut self, layout: Layout) -> NonNull<u8> {
        self.top().bump.alloc_layout(layout)
    }

    /// Moves `value` into the innermost level, registering its destructor if
    /// the type needs one.
    #[inline]
    pub fn alloc<T>(&mut self, value: T) -> NonNull<T> {
        let level = self.top();
        let ptr = NonNull::from(level.bump.alloc(value));
        if mem::needs_drop::<T>() {
            level.destructors.push(Destructor {
                obj: ptr.cast(),
                drop_fn: drop_erased::<T>,
            });
        }
        ptr
    }

    /// Copies a slice of plain values into the innermost level.
    #[inline]
    pub fn alloc_slice_copy<T: Copy>(&mut self, values: &[T]) -> NonNull<[T]> {
        NonNull::from(self.top().bump.alloc_slice_copy(values))
    }

    /// Registers a destructor for an object living in the innermost level.
    ///
    /// # Safety
    ///
    /// `obj` must point to a live object allocated from the innermost level
    /// and `drop_fn` must be valid to call exactly once on it.
    pub unsafe fn register_destructor(&mut self, obj: NonNull<u8>, drop_fn: unsafe fn(NonNull<u8>)) {
        self.top().destructors.push(Destructor { obj, drop_fn });
    }

    /// Opens a fresh level, reusing a parked bump when one is available.
    pub fn push_level(&mut self) {
        let bump = self.spare.pop().unwrap_or_else(Bump::new);
        self.levels.push(Level::new(bump));
    }

    /// Releases the innermost level. The root level cannot be popped.
    pub fn pop_level(&mut self) -> bool {
        if self.levels.len() == 1 {
            return false;
        }
        if let Some(mut level) = self.levels.pop() {
            level.release();
            self.spare.push(level.bump);
        }
        true
    }

    /// Releases every level, leaving an empty root level.
    pub fn reset(&mut self) {
        while self.pop_level() {}
        self.levels[0].release();
    }

    /// Number of live levels, the root included.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Bytes currently reserved by the live levels.
    pub fn allocated_bytes(&self) -> usize {
        self.levels.iter().map(|l| l.bump.allocated_bytes()).sum()
    }

    /// Number of destructors pending across the live levels.
    pub fn pending_destructors(&self) -> usize {
        self.levels.iter().map(|l| l.destructors.len()).sum()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.reset();
    }
}
