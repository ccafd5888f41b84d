use crate::algorithm::{Partitioner, run_chunks};
use crate::builder::{FlowBuilder, Task};
use std::sync::Arc;

impl FlowBuilder {
    /// Add a task applying `body` to every index of `range` in parallel.
    pub fn for_each_index<F>(
        &self,
        range: std::ops::Range<usize>,
        partitioner: Partitioner,
        body: F,
    ) -> Task
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let offset = range.start;
            run_chunks(rt.worker(), range.len(), partitioner, |chunk| {
                for i in chunk {
                    body(offset + i);
                }
            });
        });
        task.name("for_each_index");
        task
    }

    /// Add a task applying `body` to every element of `data` in parallel.
    pub fn for_each<T, F>(&self, data: Arc<Vec<T>>, partitioner: Partitioner, body: F) -> Task
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            run_chunks(rt.worker(), data.len(), partitioner, |chunk| {
                for item in &data[chunk] {
                    body(item);
                }
            });
        });
        task.name("for_each");
        task
    }
}
