//! Loom-compatible synchronization shim.
//!
//! The work-stealing deque is the one lock-free component of the crate, so it
//! is written against this shim: under `--features loom` it compiles against
//! `loom`'s model-checked atomics and cells, otherwise against the real ones
//! with a thin `UnsafeCell` wrapper mirroring loom's `with`/`with_mut` API.

#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::cell::UnsafeCell;
    pub(crate) use loom::sync::atomic::{AtomicI64, AtomicPtr, Ordering, fence};
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::sync::atomic::{AtomicI64, AtomicPtr, Ordering, fence};

    /// Mirror of `loom::cell::UnsafeCell` over the real `core` cell.
    #[derive(Debug)]
    #[repr(transparent)]
    pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        pub(crate) fn new(val: T) -> Self {
            Self(core::cell::UnsafeCell::new(val))
        }

        #[inline]
        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.0.get())
        }

        #[inline]
        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0.get())
        }
    }
}

pub(crate) use imp::*;
