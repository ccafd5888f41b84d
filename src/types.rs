use crate::sync::UnsafeCell;
use derive_more::{Deref, DerefMut};
use indexmap::IndexSet as _IndexSet;
use rustc_hash::FxBuildHasher;
use std::collections::HashSet as _HashSet;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Sync`.
///
/// Used internally by the work-stealing deque to enable interior mutability
/// across threads while correctness is ensured by the deque protocol (only
/// the owner handle touches the retired-buffer list, and slot accesses are
/// ordered by the top/bottom indices).
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// Insertion-ordered set with a fast hasher; holds the module reference
/// chain during inlining, pushed and popped in stack order.
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
