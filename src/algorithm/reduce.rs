use crate::algorithm::{Partitioner, run_chunks};
use crate::builder::{FlowBuilder, Task};
use std::sync::{Arc, Mutex};

impl FlowBuilder {
    /// Add a task folding `data` into `result` in parallel.
    ///
    /// Chunks are folded left-to-right and the partial results are combined
    /// in range order, so `combine` does not need to be commutative, only
    /// associative. The value already in `result` seeds the fold.
    pub fn reduce<T, F>(
        &self,
        data: Arc<Vec<T>>,
        result: Arc<Mutex<T>>,
        partitioner: Partitioner,
        combine: F,
    ) -> Task
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T, &T) -> T + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let partials: Mutex<Vec<(usize, T)>> = Mutex::new(Vec::new());
            run_chunks(rt.worker(), data.len(), partitioner, |chunk| {
                let items = &data[chunk.clone()];
                let mut acc = items[0].clone();
                for item in &items[1..] {
                    acc = combine(acc, item);
                }
                partials
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((chunk.start, acc));
            });
            let mut partials = partials.into_inner().unwrap_or_else(|e| e.into_inner());
            partials.sort_unstable_by_key(|(start, _)| *start);
            let mut out = result.lock().unwrap_or_else(|e| e.into_inner());
            let mut acc = out.clone();
            for (_, partial) in &partials {
                acc = combine(acc, partial);
            }
            *out = acc;
        });
        task.name("reduce");
        task
    }

    /// Add a task mapping every element through `transform` and folding the
    /// mapped values into `result`, combining partials in range order.
    pub fn transform_reduce<T, U, M, F>(
        &self,
        data: Arc<Vec<T>>,
        result: Arc<Mutex<U>>,
        partitioner: Partitioner,
        transform: M,
        combine: F,
    ) -> Task
    where
        T: Send + Sync + 'static,
        U: Clone + Send + 'static,
        M: Fn(&T) -> U + Send + Sync + 'static,
        F: Fn(U, U) -> U + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let partials: Mutex<Vec<(usize, U)>> = Mutex::new(Vec::new());
            run_chunks(rt.worker(), data.len(), partitioner, |chunk| {
                let items = &data[chunk.clone()];
                let mut acc = transform(&items[0]);
                for item in &items[1..] {
                    acc = combine(acc, transform(item));
                }
                partials
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((chunk.start, acc));
            });
            let mut partials = partials.into_inner().unwrap_or_else(|e| e.into_inner());
            partials.sort_unstable_by_key(|(start, _)| *start);
            let mut out = result.lock().unwrap_or_else(|e| e.into_inner());
            let mut acc = out.clone();
            for (_, partial) in partials {
                acc = combine(acc, partial);
            }
            *out = acc;
        });
        task.name("transform_reduce");
        task
    }
}
