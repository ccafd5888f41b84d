//! Lock-free Chase-Lev work-stealing deque.
//!
//! Follows "Dynamic Circular Work-Stealing Deque" (Chase, Lev 2005) with the
//! relaxed orderings of "Correct and Efficient Work-Stealing for Weak Memory
//! Models" (Lê et al. 2013). The owner pushes and pops at the bottom (LIFO);
//! thieves steal from the top (FIFO). The ring buffer grows on demand; old
//! buffers are retired, not freed, until the deque itself drops, so a stealer
//! holding a stale buffer pointer always reads valid memory.
//!
//! Every returned item is handed to exactly one caller: a contender that
//! loses the `top` CAS forgets its bitwise copy of the slot instead of
//! dropping it.

use crate::sync::{AtomicI64, AtomicPtr, Ordering, fence};
use crate::types::SyncUnsafeCell;
use core::mem::MaybeUninit;
use std::marker::PhantomData;
use std::sync::Arc;

/// Hard cap on the ring buffer; exceeding it surfaces as a scheduler error.
pub(crate) const MAX_CAPACITY: i64 = 1 << 30;

/// Result of a `pop` or `steal` attempt.
#[derive(Debug)]
pub(crate) enum StealResult<T> {
    /// Retrieved one item.
    Success(T),
    /// Deque observed empty.
    Empty,
    /// Lost a race with another thief or the owner; retrying may succeed.
    Retry,
}

struct Buffer<T> {
    cap: i64,
    mask: i64,
    slots: Box<[SyncUnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Buffer<T> {
    fn alloc(cap: i64) -> *mut Buffer<T> {
        debug_assert!(cap.count_ones() == 1, "Buffer::alloc: capacity not a power of two");
        let slots = (0..cap)
            .map(|_| SyncUnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Box::into_raw(Box::new(Self {
            cap,
            mask: cap - 1,
            slots,
        }))
    }

    /// # Safety
    ///
    /// Caller must have exclusive logical access to the slot at `index`
    /// (owner-only, below the published `bottom`).
    #[inline]
    unsafe fn write(&self, index: i64, value: T) {
        let slot = &self.slots[(index & self.mask) as usize];
        slot.with_mut(|ptr| {
            // SAFETY: Exclusive access guaranteed by the caller; the previous
            // content is either uninitialized or already moved out.
            unsafe { (*ptr).write(value) };
        });
    }

    /// # Safety
    ///
    /// The slot at `index` must hold an initialized value and no concurrent
    /// write to it may be in progress. The returned value is a bitwise copy;
    /// the caller must `mem::forget` it if ownership is not won.
    #[inline]
    unsafe fn read(&self, index: i64) -> T {
        let slot = &self.slots[(index & self.mask) as usize];
        // SAFETY: Initialization and absence of concurrent writers are
        // guaranteed by the caller via the top/bottom protocol.
        slot.with(|ptr| unsafe { (*ptr).assume_init_read() })
    }
}

struct Inner<T> {
    /// Stealers advance `top` with a CAS.
    top: AtomicI64,
    /// Only the owner writes `bottom`.
    bottom: AtomicI64,
    /// Current ring buffer; replaced by the owner on growth.
    buffer: AtomicPtr<Buffer<T>>,
    /// Buffers replaced by growth, freed when the deque drops. Touched only
    /// by the owner handle and by `Drop`.
    retired: SyncUnsafeCell<Vec<*mut Buffer<T>>>,
}

// SAFETY: The raw buffer pointers are managed exclusively through the
// top/bottom protocol; items are `Send` and cross threads only via
// `pop`/`steal`, which hand each item to exactly one caller.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let top = self.top.load(Ordering::Relaxed);
        let bottom = self.bottom.load(Ordering::Relaxed);
        let buf = self.buffer.load(Ordering::Relaxed);
        for i in top..bottom {
            // SAFETY: Both handles are gone, so the remaining items in
            // [top, bottom) are exclusively ours and initialized.
            drop(unsafe { (*buf).read(i) });
        }
        // SAFETY: Exclusive access in Drop; every pointer in `retired` plus
        // the current buffer came from `Buffer::alloc` and is freed once.
        unsafe {
            self.retired.with_mut(|ptr| {
                for &old in (*ptr).iter() {
                    drop(Box::from_raw(old));
                }
                (*ptr).clear();
            });
            drop(Box::from_raw(buf));
        }
    }
}

/// Owner handle: push and pop at the bottom. One per worker thread.
pub(crate) struct WsOwner<T> {
    inner: Arc<Inner<T>>,
    /// Keeps the handle `!Sync`; `push`/`pop` assume a single caller.
    _not_sync: PhantomData<*mut ()>,
}

/// Thief handle: steal from the top. Clonable, shared across workers.
pub(crate) struct WsStealer<T> {
    inner: Arc<Inner<T>>,
}

// SAFETY: The owner handle may migrate between threads as long as it is used
// from one thread at a time; the `PhantomData<*mut ()>` marker keeps it
// `!Sync`, so only the marker's spurious `!Send` is overridden here.
unsafe impl<T: Send> Send for WsOwner<T> {}
unsafe impl<T: Send> Send for WsStealer<T> {}
unsafe impl<T: Send> Sync for WsStealer<T> {}

impl<T> Clone for WsStealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Create a deque with the given initial capacity (rounded up to a power of
/// two).
pub(crate) fn ws_deque<T: Send>(capacity: usize) -> (WsOwner<T>, WsStealer<T>) {
    let cap = capacity.next_power_of_two().max(2) as i64;
    assert!(cap <= MAX_CAPACITY, "ws_deque: initial capacity too large");
    let inner = Arc::new(Inner {
        top: AtomicI64::new(0),
        bottom: AtomicI64::new(0),
        buffer: AtomicPtr::new(Buffer::alloc(cap)),
        retired: SyncUnsafeCell::new(Vec::new()),
    });
    (
        WsOwner {
            inner: inner.clone(),
            _not_sync: PhantomData,
        },
        WsStealer { inner },
    )
}

impl<T: Send> WsOwner<T> {
    /// Push an item at the bottom. Fails only when the buffer cannot grow
    /// past [`MAX_CAPACITY`].
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed);
        let top = inner.top.load(Ordering::Acquire);
        let mut buf = inner.buffer.load(Ordering::Relaxed);

        // SAFETY: Only the owner replaces `buffer`, so the pointer loaded
        // above stays valid for the whole call.
        if bottom - top >= unsafe { (*buf).cap } {
            let Some(grown) = self.grow(buf, top, bottom) else {
                return Err(value);
            };
            buf = grown;
        }
        // SAFETY: Slot `bottom` is above the published bottom index, hence
        // invisible to stealers and exclusively ours.
        unsafe { (*buf).write(bottom, value) };
        // Publish: pairs with the acquire loads in `steal`.
        inner.bottom.store(bottom + 1, Ordering::Release);
        Ok(())
    }

    /// Pop an item from the bottom (LIFO).
    pub(crate) fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed) - 1;
        let buf = inner.buffer.load(Ordering::Relaxed);
        inner.bottom.store(bottom, Ordering::Relaxed);
        // Order the speculative bottom decrement before reading `top`.
        fence(Ordering::SeqCst);
        let top = inner.top.load(Ordering::Relaxed);

        if top > bottom {
            // Deque was empty; restore bottom.
            inner.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }
        // SAFETY: [top, bottom] is non-empty and slot `bottom` was published
        // by a prior push of this owner.
        let value = unsafe { (*buf).read(bottom) };
        if top == bottom {
            // Last element: race the stealers for it via `top`.
            let won = inner
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            inner.bottom.store(bottom + 1, Ordering::Relaxed);
            if won {
                Some(value)
            } else {
                // A thief owns the item; our bitwise copy must not drop.
                core::mem::forget(value);
                None
            }
        } else {
            Some(value)
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed);
        let top = inner.top.load(Ordering::Acquire);
        bottom <= top
    }

    fn grow(&self, old: *mut Buffer<T>, top: i64, bottom: i64) -> Option<*mut Buffer<T>> {
        // SAFETY: Owner-only; `old` is the current buffer.
        let old_cap = unsafe { (*old).cap };
        if old_cap >= MAX_CAPACITY {
            return None;
        }
        let new = Buffer::alloc(old_cap * 2);
        for i in top..bottom {
            // SAFETY: Slots [top, bottom) are initialized; the copies in the
            // old buffer are abandoned (never dropped) when it is retired.
            unsafe {
                let value = (*old).read(i);
                (*new).write(i, value);
            }
        }
        // Publish the new buffer before the next bottom increment; stealers
        // load it with acquire.
        self.inner.buffer.store(new, Ordering::Release);
        // SAFETY: The retired list is owner-only until Drop.
        self.inner.retired.with_mut(|ptr| unsafe { (*ptr).push(old) });
        Some(new)
    }
}

impl<T: Send> WsStealer<T> {
    /// Steal an item from the top (FIFO). Any thread may call this.
    pub(crate) fn steal(&self) -> StealResult<T> {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Acquire);
        // Order the `top` load before the `bottom` load.
        fence(Ordering::SeqCst);
        let bottom = inner.bottom.load(Ordering::Acquire);
        if top >= bottom {
            return StealResult::Empty;
        }
        let buf = inner.buffer.load(Ordering::Acquire);
        // SAFETY: Slot `top` was published by the owner; the value is only
        // kept if we win the CAS below, otherwise it is forgotten.
        let value = unsafe { (*buf).read(top) };
        match inner
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => StealResult::Success(value),
            Err(_) => {
                // Another thief or the owner claimed the item.
                core::mem::forget(value);
                StealResult::Retry
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Acquire);
        let bottom = inner.bottom.load(Ordering::Acquire);
        bottom <= top
    }
}


#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn push_pop_lifo() {
        let (owner, _stealer) = ws_deque::<u32>(8);
        assert!(owner.is_empty());
        for i in 0..10 {
            owner.push(i).unwrap();
        }
        for i in (0..10).rev() {
            assert_eq!(owner.pop(), Some(i));
        }
        assert_eq!(owner.pop(), None);
        assert!(owner.is_empty());
    }

    #[test]
    fn steal_fifo() {
        let (owner, stealer) = ws_deque::<u32>(8);
        for i in 0..5 {
            owner.push(i).unwrap();
        }
        for i in 0..5 {
            match stealer.steal() {
                StealResult::Success(v) => assert_eq!(v, i),
                other => panic!("expected success, got {other:?}"),
            }
        }
        assert!(matches!(stealer.steal(), StealResult::Empty));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let (owner, stealer) = ws_deque::<usize>(2);
        for i in 0..1000 {
            owner.push(i).unwrap();
        }
        match stealer.steal() {
            StealResult::Success(v) => assert_eq!(v, 0),
            other => panic!("expected success, got {other:?}"),
        }
        for i in (1..1000).rev() {
            assert_eq!(owner.pop(), Some(i));
        }
        assert_eq!(owner.pop(), None);
    }

    #[test]
    fn mixed_pop_steal() {
        let (owner, stealer) = ws_deque::<u32>(8);
        for i in 1..=5 {
            owner.push(i).unwrap();
        }
        assert!(matches!(stealer.steal(), StealResult::Success(1)));
        assert_eq!(owner.pop(), Some(5));
        assert!(matches!(stealer.steal(), StealResult::Success(2)));
        assert_eq!(owner.pop(), Some(4));
        assert_eq!(owner.pop(), Some(3));
        assert_eq!(owner.pop(), None);
    }

    #[test]
    fn drops_remaining_items() {
        use std::sync::Arc;
        let probe = Arc::new(());
        {
            let (owner, _stealer) = ws_deque::<Arc<()>>(4);
            for _ in 0..3 {
                owner.push(probe.clone()).unwrap();
            }
        }
        assert_eq!(Arc::strong_count(&probe), 1);
    }

    #[test]
    fn concurrent_stealers_each_item_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        const N: usize = 10_000;
        let (owner, stealer) = ws_deque::<usize>(64);
        let taken = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..3)
            .map(|_| {
                let stealer = stealer.clone();
                let taken = taken.clone();
                std::thread::spawn(move || {
                    let mut got = 0usize;
                    loop {
                        match stealer.steal() {
                            StealResult::Success(_) => got += 1,
                            StealResult::Retry => continue,
                            StealResult::Empty => {
                                if taken.load(Ordering::Acquire) >= N {
                                    break;
                                }
                                std::thread::yield_now();
                            }
                        }
                    }
                    got
                })
            })
            .collect();

        let mut popped = 0usize;
        let mut pushed = 0usize;
        while pushed < N {
            owner.push(pushed).unwrap();
            pushed += 1;
            if pushed % 7 == 0 {
                if owner.pop().is_some() {
                    popped += 1;
                    taken.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        // Drain what the thieves left behind.
        while owner.pop().is_some() {
            popped += 1;
            taken.fetch_add(1, Ordering::AcqRel);
        }
        taken.store(N, Ordering::Release);

        let stolen: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(popped + stolen, N);
    }
}
