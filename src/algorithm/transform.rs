use crate::algorithm::{Partitioner, run_chunks};
use crate::builder::{FlowBuilder, Task};
use std::sync::{Arc, Mutex};

impl FlowBuilder {
    /// Add a task mapping `src` through `op` into `dst` in parallel. `dst`
    /// is replaced wholesale; element `i` of the result is `op(&src[i])`.
    pub fn transform<T, U, F>(
        &self,
        src: Arc<Vec<T>>,
        dst: Arc<Mutex<Vec<U>>>,
        partitioner: Partitioner,
        op: F,
    ) -> Task
    where
        T: Send + Sync + 'static,
        U: Send + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let pieces: Mutex<Vec<(usize, Vec<U>)>> = Mutex::new(Vec::new());
            run_chunks(rt.worker(), src.len(), partitioner, |chunk| {
                let mapped: Vec<U> = src[chunk.clone()].iter().map(&op).collect();
                pieces
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((chunk.start, mapped));
            });
            let mut pieces = pieces.into_inner().unwrap_or_else(|e| e.into_inner());
            pieces.sort_unstable_by_key(|(start, _)| *start);
            let mut out = dst.lock().unwrap_or_else(|e| e.into_inner());
            out.clear();
            for (_, piece) in pieces {
                out.extend(piece);
            }
        });
        task.name("transform");
        task
    }
}
