use crate::builder::{FlowBuilder, Task};
use crate::executor::WorkerLocal;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

/// Segments shorter than this are handed to the sequential sort directly.
const SEQUENTIAL_CUTOFF: usize = 1024;

struct SendPtr<T>(*mut T);

// SAFETY: The pointer is only ever used to materialize disjoint segments of
// one slice, each touched by a single worker at a time (the worklist hands a
// segment to exactly one driver).
unsafe impl<T: Send> Send for SendPtr<T> {}
unsafe impl<T: Send> Sync for SendPtr<T> {}

struct Segment {
    start: usize,
    len: usize,
    /// Remaining partition depth before falling back to sequential sort.
    depth: u32,
}

/// Lomuto partition around a median-of-three pivot. Returns the final pivot
/// position; both sub-segments are strictly shorter than the input.
fn partition<T>(seg: &mut [T], cmp: &(impl Fn(&T, &T) -> CmpOrdering + Sync)) -> usize {
    let len = seg.len();
    let mid = len / 2;
    if cmp(&seg[mid], &seg[0]) == CmpOrdering::Less {
        seg.swap(mid, 0);
    }
    if cmp(&seg[len - 1], &seg[0]) == CmpOrdering::Less {
        seg.swap(len - 1, 0);
    }
    if cmp(&seg[len - 1], &seg[mid]) == CmpOrdering::Less {
        seg.swap(len - 1, mid);
    }
    // seg[0] <= median <= seg[len-1]; park the median pivot at len-2.
    seg.swap(mid, len - 2);
    let mut store = 1;
    for probe in 1..len - 2 {
        if cmp(&seg[probe], &seg[len - 2]) == CmpOrdering::Less {
            seg.swap(store, probe);
            store += 1;
        }
    }
    seg.swap(store, len - 2);
    store
}

fn parallel_sort<T, C>(worker: &WorkerLocal, data: &mut [T], cmp: &C)
where
    T: Send,
    C: Fn(&T, &T) -> CmpOrdering + Sync,
{
    let len = data.len();
    if len <= SEQUENTIAL_CUTOFF {
        data.sort_unstable_by(|a, b| cmp(a, b));
        return;
    }
    let base = SendPtr(data.as_mut_ptr());
    let base = &base;
    let depth = 2 * usize::BITS.saturating_sub(len.leading_zeros());
    let worklist = Mutex::new(vec![Segment {
        start: 0,
        len,
        depth,
    }]);
    // Segments claimed from the worklist but not yet split or finished.
    let pending = AtomicUsize::new(1);
    let worklist = &worklist;
    let pending = &pending;

    let drivers = worker.num_workers();
    let jobs: Vec<Box<dyn FnOnce(&WorkerLocal) + Send + '_>> = (0..drivers)
        .map(|_| {
            Box::new(move |_: &WorkerLocal| {
                loop {
                    let segment = worklist
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .pop();
                    let Some(segment) = segment else {
                        if pending.load(Ordering::Acquire) == 0 {
                            return;
                        }
                        // Another driver is still splitting; its children
                        // will land on the worklist.
                        std::thread::yield_now();
                        continue;
                    };
                    // SAFETY: Worklist segments are disjoint sub-ranges of
                    // the original slice and each is owned by one driver
                    // until re-split or sorted.
                    let seg: &mut [T] = unsafe {
                        std::slice::from_raw_parts_mut(base.0.add(segment.start), segment.len)
                    };
                    if segment.len <= SEQUENTIAL_CUTOFF || segment.depth == 0 {
                        seg.sort_unstable_by(|a, b| cmp(a, b));
                        pending.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                    let split = partition(seg, cmp);
                    pending.fetch_add(1, Ordering::AcqRel);
                    let mut list = worklist.lock().unwrap_or_else(|e| e.into_inner());
                    list.push(Segment {
                        start: segment.start,
                        len: split,
                        depth: segment.depth - 1,
                    });
                    list.push(Segment {
                        start: segment.start + split + 1,
                        len: segment.len - split - 1,
                        depth: segment.depth - 1,
                    });
                }
            }) as Box<dyn FnOnce(&WorkerLocal) + Send + '_>
        })
        .collect();
    worker.corun_scoped(jobs);
}

impl FlowBuilder {
    /// Add a task sorting `data` in parallel with an introspective
    /// quicksort: median-of-three pivots, sequential pattern-defeating sort
    /// below a cutoff and when the partition depth budget runs out.
    pub fn sort<T, C>(&self, data: Arc<Mutex<Vec<T>>>, cmp: C) -> Task
    where
        T: Send + 'static,
        C: Fn(&T, &T) -> CmpOrdering + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let mut guard = data.lock().unwrap_or_else(|e| e.into_inner());
            parallel_sort(rt.worker(), &mut guard, &cmp);
        });
        task.name("sort");
        task
    }
}
