//! Structured parallel patterns inserted into workflows as single tasks.
//!
//! Every adapter is a [`FlowBuilder`](crate::FlowBuilder) method returning
//! one runtime task. The task splits its input range per a [`Partitioner`],
//! runs the chunks as scoped jobs on the pool, and joins them before
//! returning, so the adapter composes with ordinary edges like any other
//! task.

mod find;
mod for_each;
mod pipeline;
mod reduce;
mod scan;
mod sort;
mod transform;

pub use pipeline::{DataPipe, DataPipeline, Pipe, PipeKind, Pipeflow, Pipeline};

use crate::executor::WorkerLocal;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chunking policy for range-based algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioner {
    /// Even contiguous chunks, one per participating worker.
    Static,
    /// Fixed-size chunks grabbed from a shared cursor.
    Dynamic {
        chunk_size: usize,
    },
    /// Chunks proportional to the remaining work, shrinking toward the end.
    #[default]
    Guided,
    /// Randomized chunk sizes between one item and an even share.
    Random,
}

impl Partitioner {
    /// Claim the next chunk of `0..len`, or `None` when the range is
    /// exhausted.
    fn grab(
        &self,
        cursor: &AtomicUsize,
        len: usize,
        drivers: usize,
        rng: &mut SmallRng,
    ) -> Option<Range<usize>> {
        loop {
            let start = cursor.load(Ordering::Acquire);
            if start >= len {
                return None;
            }
            let remaining = len - start;
            let size = match *self {
                Self::Static => len.div_ceil(drivers),
                Self::Dynamic { chunk_size } => chunk_size.max(1),
                Self::Guided => (remaining / (2 * drivers)).max(1),
                Self::Random => rng.random_range(1..=(remaining / drivers).max(1)),
            };
            let end = (start + size).min(len);
            if cursor
                .compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(start..end);
            }
        }
    }
}

/// Run `body` over disjoint chunks of `0..len` on the pool and join.
pub(crate) fn run_chunks<F>(worker: &WorkerLocal, len: usize, partitioner: Partitioner, body: F)
where
    F: Fn(Range<usize>) + Sync,
{
    if len == 0 {
        return;
    }
    let drivers = worker.num_workers().min(len).max(1);
    let cursor = AtomicUsize::new(0);
    let cursor = &cursor;
    let body = &body;
    let jobs: Vec<Box<dyn FnOnce(&WorkerLocal) + Send + '_>> = (0..drivers)
        .map(|driver| {
            Box::new(move |_: &WorkerLocal| {
                let mut rng = SmallRng::seed_from_u64(driver as u64);
                while let Some(chunk) = partitioner.grab(cursor, len, drivers, &mut rng) {
                    body(chunk);
                }
            }) as Box<dyn FnOnce(&WorkerLocal) + Send + '_>
        })
        .collect();
    worker.corun_scoped(jobs);
}
