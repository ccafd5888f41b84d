use crate::builder::{FlowBuilder, Task};
use crate::executor::WorkerLocal;
use std::ops::Range;
use std::sync::{Arc, Mutex};

fn even_chunks(len: usize, parts: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let parts = parts.min(len).max(1);
    let size = len.div_ceil(parts);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Upsweep: locally scan each chunk of `src` (mapped through `unary`),
/// returning the pieces in range order.
fn scan_pieces<T, U>(
    worker: &WorkerLocal,
    src: &[T],
    unary: &(impl Fn(&T) -> U + Sync),
    op: &(impl Fn(&U, &U) -> U + Sync),
) -> Vec<Vec<U>>
where
    T: Sync,
    U: Send,
{
    let chunks = even_chunks(src.len(), worker.num_workers());
    let pieces: Mutex<Vec<(usize, Vec<U>)>> = Mutex::new(Vec::new());
    let jobs: Vec<Box<dyn FnOnce(&WorkerLocal) + Send + '_>> = chunks
        .into_iter()
        .map(|chunk| {
            let pieces = &pieces;
            Box::new(move |_: &WorkerLocal| {
                let items = &src[chunk.clone()];
                let mut scanned = Vec::with_capacity(items.len());
                scanned.push(unary(&items[0]));
                for item in &items[1..] {
                    let next = op(scanned.last().expect("scanned is non-empty"), &unary(item));
                    scanned.push(next);
                }
                pieces
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((chunk.start, scanned));
            }) as Box<dyn FnOnce(&WorkerLocal) + Send + '_>
        })
        .collect();
    worker.corun_scoped(jobs);
    let mut pieces = pieces.into_inner().unwrap_or_else(|e| e.into_inner());
    pieces.sort_unstable_by_key(|(start, _)| *start);
    pieces.into_iter().map(|(_, piece)| piece).collect()
}

/// Downsweep: combine each piece (after the first) with the running total of
/// the pieces before it, in parallel, then concatenate.
fn stitch_pieces<U>(
    worker: &WorkerLocal,
    mut pieces: Vec<Vec<U>>,
    op: &(impl Fn(&U, &U) -> U + Sync),
) -> Vec<U>
where
    U: Clone + Send + Sync,
{
    // Running totals of the chunk sums give each piece its offset.
    let mut offsets: Vec<U> = Vec::with_capacity(pieces.len().saturating_sub(1));
    for piece in &pieces[..pieces.len().saturating_sub(1)] {
        let total = piece.last().expect("pieces are non-empty");
        let offset = match offsets.last() {
            Some(prev) => op(prev, total),
            None => total.clone(),
        };
        offsets.push(offset);
    }
    let jobs: Vec<Box<dyn FnOnce(&WorkerLocal) + Send + '_>> = pieces
        .iter_mut()
        .skip(1)
        .zip(&offsets)
        .map(|(piece, offset)| {
            Box::new(move |_: &WorkerLocal| {
                for value in piece.iter_mut() {
                    *value = op(offset, value);
                }
            }) as Box<dyn FnOnce(&WorkerLocal) + Send + '_>
        })
        .collect();
    worker.corun_scoped(jobs);
    pieces.into_iter().flatten().collect()
}

impl FlowBuilder {
    /// Add a task computing the inclusive prefix scan of `src` under the
    /// associative `op` into `dst` (`dst[i] = src[0] op .. op src[i]`).
    pub fn inclusive_scan<T, F>(
        &self,
        src: Arc<Vec<T>>,
        dst: Arc<Mutex<Vec<T>>>,
        op: F,
    ) -> Task
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let mut out = dst.lock().unwrap_or_else(|e| e.into_inner());
            out.clear();
            if src.is_empty() {
                return;
            }
            let pieces = scan_pieces(rt.worker(), &src, &|x: &T| x.clone(), &op);
            *out = stitch_pieces(rt.worker(), pieces, &op);
        });
        task.name("inclusive_scan");
        task
    }

    /// Add a task computing the exclusive prefix scan of `src` seeded with
    /// `init` into `dst` (`dst[0] = init`, `dst[i] = init op src[0] op .. op
    /// src[i-1]`).
    pub fn exclusive_scan<T, F>(
        &self,
        src: Arc<Vec<T>>,
        dst: Arc<Mutex<Vec<T>>>,
        init: T,
        op: F,
    ) -> Task
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let mut out = dst.lock().unwrap_or_else(|e| e.into_inner());
            out.clear();
            if src.is_empty() {
                return;
            }
            let pieces = scan_pieces(rt.worker(), &src, &|x: &T| x.clone(), &op);
            let inclusive = stitch_pieces(rt.worker(), pieces, &op);
            out.reserve(inclusive.len());
            out.push(init.clone());
            for value in &inclusive[..inclusive.len() - 1] {
                out.push(op(&init, value));
            }
        });
        task.name("exclusive_scan");
        task
    }

    /// Add a task mapping `src` through `unary` and computing the inclusive
    /// prefix scan of the mapped values into `dst`.
    pub fn transform_inclusive_scan<T, U, M, F>(
        &self,
        src: Arc<Vec<T>>,
        dst: Arc<Mutex<Vec<U>>>,
        unary: M,
        op: F,
    ) -> Task
    where
        T: Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        M: Fn(&T) -> U + Send + Sync + 'static,
        F: Fn(&U, &U) -> U + Send + Sync + 'static,
    {
        let task = self.emplace_runtime(move |rt| {
            let mut out = dst.lock().unwrap_or_else(|e| e.into_inner());
            out.clear();
            if src.is_empty() {
                return;
            }
            let pieces = scan_pieces(rt.worker(), &src, &unary, &op);
            *out = stitch_pieces(rt.worker(), pieces, &op);
        });
        task.name("transform_inclusive_scan");
        task
    }
}
