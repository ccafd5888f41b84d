use crate::algorithm::{Partitioner, run_chunks};
use crate::builder::{FlowBuilder, Task};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn find_task<T, P>(
    builder: &FlowBuilder,
    data: Arc<Vec<T>>,
    result: Arc<AtomicUsize>,
    partitioner: Partitioner,
    predicate: P,
) -> Task
where
    T: Send + Sync + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    builder.emplace_runtime(move |rt| {
        // `data.len()` plays the role of the end iterator: not found.
        result.store(data.len(), Ordering::Release);
        run_chunks(rt.worker(), data.len(), partitioner, |chunk| {
            // A chunk entirely behind the best hit so far cannot improve it.
            if chunk.start >= result.load(Ordering::Acquire) {
                return;
            }
            for i in chunk {
                if i >= result.load(Ordering::Acquire) {
                    return;
                }
                if predicate(&data[i]) {
                    result.fetch_min(i, Ordering::AcqRel);
                    return;
                }
            }
        });
    })
}

impl FlowBuilder {
    /// Add a task storing into `result` the smallest index of an element
    /// satisfying `predicate`, or `data.len()` if none does. Chunks stop
    /// early once they can no longer beat the best hit found so far.
    pub fn find_if<T, P>(
        &self,
        data: Arc<Vec<T>>,
        result: Arc<AtomicUsize>,
        partitioner: Partitioner,
        predicate: P,
    ) -> Task
    where
        T: Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let task = find_task(self, data, result, partitioner, predicate);
        task.name("find_if");
        task
    }

    /// Add a task storing into `result` the smallest index of an element
    /// not satisfying `predicate`, or `data.len()` if all do.
    pub fn find_if_not<T, P>(
        &self,
        data: Arc<Vec<T>>,
        result: Arc<AtomicUsize>,
        partitioner: Partitioner,
        predicate: P,
    ) -> Task
    where
        T: Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let task = find_task(self, data, result, partitioner, move |item| {
            !predicate(item)
        });
        task.name("find_if_not");
        task
    }
}
