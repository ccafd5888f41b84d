//! Parallel algorithm adapters run against sequential references.

#![cfg(not(feature = "loom"))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use taskdag::{DataPipe, DataPipeline, Executor, Partitioner, Pipe, Pipeline, Workflow};

fn executor() -> Executor {
    Executor::try_with_workers(4).expect("spawning workers")
}

const PARTITIONERS: [Partitioner; 4] = [
    Partitioner::Static,
    Partitioner::Dynamic { chunk_size: 7 },
    Partitioner::Guided,
    Partitioner::Random,
];

fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

#[test]
fn for_each_index_touches_every_index_once() {
    let executor = executor();
    for partitioner in PARTITIONERS {
        let workflow = Workflow::new();
        let sum = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let s = sum.clone();
        let h = hits.clone();
        workflow.for_each_index(10..1010, partitioner, move |i| {
            s.fetch_add(i, Ordering::AcqRel);
            h.fetch_add(1, Ordering::AcqRel);
        });
        assert_eq!(executor.run(&workflow).get(), Ok(()));
        assert_eq!(hits.load(Ordering::Acquire), 1000, "{partitioner:?}");
        assert_eq!(
            sum.load(Ordering::Acquire),
            (10..1010).sum::<usize>(),
            "{partitioner:?}"
        );
    }
}

#[test]
fn for_each_visits_every_element() {
    let executor = executor();
    let data: Arc<Vec<usize>> = Arc::new((0..500).collect());
    let workflow = Workflow::new();
    let sum = Arc::new(AtomicUsize::new(0));
    let s = sum.clone();
    workflow.for_each(data.clone(), Partitioner::Guided, move |item| {
        s.fetch_add(*item, Ordering::AcqRel);
    });
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(sum.load(Ordering::Acquire), (0..500).sum::<usize>());
}

#[test]
fn transform_preserves_element_order() {
    let executor = executor();
    let src: Arc<Vec<i32>> = Arc::new((0..1000).collect());
    let dst: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::new();
    workflow.transform(src.clone(), dst.clone(), Partitioner::Dynamic { chunk_size: 13 }, |v| {
        format!("#{v}")
    });
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    let out = dst.lock().unwrap();
    let expected: Vec<String> = (0..1000).map(|v| format!("#{v}")).collect();
    assert_eq!(*out, expected);
}

#[test]
fn reduce_respects_order_for_non_commutative_ops() {
    let executor = executor();
    let data: Arc<Vec<String>> = Arc::new(('a'..='z').map(String::from).collect());
    let result = Arc::new(Mutex::new(String::from(">")));
    let workflow = Workflow::new();
    workflow.reduce(
        data.clone(),
        result.clone(),
        Partitioner::Dynamic { chunk_size: 3 },
        |acc: String, item: &String| acc + item,
    );
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(*result.lock().unwrap(), ">abcdefghijklmnopqrstuvwxyz");
}

#[test]
fn transform_reduce_folds_mapped_values() {
    let executor = executor();
    let data: Arc<Vec<String>> = Arc::new(
        (0..200).map(|i| "x".repeat(i % 7)).collect(),
    );
    let expected: usize = data.iter().map(String::len).sum();
    let result = Arc::new(Mutex::new(0usize));
    let workflow = Workflow::new();
    workflow.transform_reduce(
        data.clone(),
        result.clone(),
        Partitioner::Guided,
        |s: &String| s.len(),
        |a, b| a + b,
    );
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(*result.lock().unwrap(), expected);
}

#[test]
fn inclusive_scan_matches_sequential_prefix_sums() {
    let executor = executor();
    let src: Arc<Vec<i64>> = Arc::new((1..=5000).collect());
    let dst: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::new();
    workflow.inclusive_scan(src.clone(), dst.clone(), |a, b| a + b);
    assert_eq!(executor.run(&workflow).get(), Ok(()));

    let mut expected = Vec::with_capacity(src.len());
    let mut acc = 0i64;
    for v in src.iter() {
        acc += v;
        expected.push(acc);
    }
    assert_eq!(*dst.lock().unwrap(), expected);
}

#[test]
fn exclusive_scan_shifts_and_seeds() {
    let executor = executor();
    let src: Arc<Vec<i64>> = Arc::new((1..=100).collect());
    let dst: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::new();
    workflow.exclusive_scan(src.clone(), dst.clone(), 1000, |a, b| a + b);
    assert_eq!(executor.run(&workflow).get(), Ok(()));

    let mut expected = vec![1000i64];
    let mut acc = 1000i64;
    for v in &src[..src.len() - 1] {
        acc += v;
        expected.push(acc);
    }
    assert_eq!(*dst.lock().unwrap(), expected);
}

#[test]
fn transform_inclusive_scan_maps_then_scans() {
    let executor = executor();
    let src: Arc<Vec<String>> = Arc::new((0..300).map(|i| "y".repeat(i % 5)).collect());
    let dst: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::new();
    workflow.transform_inclusive_scan(
        src.clone(),
        dst.clone(),
        |s: &String| s.len(),
        |a, b| a + b,
    );
    assert_eq!(executor.run(&workflow).get(), Ok(()));

    let mut expected = Vec::new();
    let mut acc = 0usize;
    for s in src.iter() {
        acc += s.len();
        expected.push(acc);
    }
    assert_eq!(*dst.lock().unwrap(), expected);
}

#[test]
fn sort_orders_large_inputs() {
    let executor = executor();
    let mut state = 0x1234_5678_9abc_def0u64;
    let input: Vec<u64> = (0..10_000).map(|_| xorshift(&mut state)).collect();
    let mut expected = input.clone();
    expected.sort_unstable();

    let data = Arc::new(Mutex::new(input));
    let workflow = Workflow::new();
    workflow.sort(data.clone(), |a: &u64, b: &u64| a.cmp(b));
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(*data.lock().unwrap(), expected);
}

#[test]
fn sort_handles_small_and_duplicate_heavy_inputs() {
    let executor = executor();
    for input in [vec![], vec![3u64], vec![2, 1], vec![5; 4000]] {
        let mut expected = input.clone();
        expected.sort_unstable();
        let data = Arc::new(Mutex::new(input));
        let workflow = Workflow::new();
        workflow.sort(data.clone(), |a: &u64, b: &u64| a.cmp(b));
        assert_eq!(executor.run(&workflow).get(), Ok(()));
        assert_eq!(*data.lock().unwrap(), expected);
    }
}

#[test]
fn find_if_returns_the_smallest_hit() {
    let executor = executor();
    let data: Arc<Vec<usize>> = Arc::new((0..5000).collect());
    let result = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::new();
    workflow.find_if(data.clone(), result.clone(), Partitioner::Static, |v| {
        *v >= 777
    });
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(result.load(Ordering::Acquire), 777);
}

#[test]
fn find_if_misses_with_the_length_sentinel() {
    let executor = executor();
    let data: Arc<Vec<usize>> = Arc::new((0..100).collect());
    let result = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::new();
    workflow.find_if(data.clone(), result.clone(), Partitioner::Guided, |v| {
        *v > 1_000_000
    });
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(result.load(Ordering::Acquire), 100);
}

#[test]
fn find_if_not_spots_the_odd_one_out() {
    let executor = executor();
    let mut values = vec![5u32; 1000];
    values[432] = 7;
    let data = Arc::new(values);
    let result = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::new();
    workflow.find_if_not(data.clone(), result.clone(), Partitioner::Static, |v| {
        *v == 5
    });
    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(result.load(Ordering::Acquire), 432);
}

#[test]
fn pipeline_produces_tokens_in_serial_order() {
    let executor = executor();
    let order = Arc::new(Mutex::new(Vec::new()));
    let touched = Arc::new(AtomicUsize::new(0));

    let o = order.clone();
    let t = touched.clone();
    let pipeline = Pipeline::new(
        4,
        vec![
            Pipe::serial(|pf| {
                if pf.token() >= 100 {
                    pf.stop();
                }
            }),
            Pipe::parallel(move |_pf| {
                t.fetch_add(1, Ordering::AcqRel);
            }),
            Pipe::serial(move |pf| {
                o.lock().unwrap().push(pf.token());
            }),
        ],
    );
    assert_eq!(pipeline.num_lines(), 4);
    assert_eq!(pipeline.num_pipes(), 3);

    assert_eq!(executor.run(pipeline.workflow()).get(), Ok(()));
    assert_eq!(pipeline.num_tokens(), 100);
    assert_eq!(touched.load(Ordering::Acquire), 100);
    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn pipeline_composes_into_a_workflow() {
    let executor = executor();
    let before = Arc::new(AtomicUsize::new(0));

    let pipeline = Pipeline::new(
        2,
        vec![Pipe::serial(|pf| {
            if pf.token() >= 10 {
                pf.stop();
            }
        })],
    );

    let workflow = Workflow::new();
    let b = before.clone();
    let head = workflow.emplace(move || {
        b.fetch_add(1, Ordering::AcqRel);
    });
    let stage = workflow.composed_of(pipeline.workflow());
    head.precede(&stage);

    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(before.load(Ordering::Acquire), 1);
    assert_eq!(pipeline.num_tokens(), 10);
}

#[test]
fn pipeline_runs_are_repeatable() {
    let executor = executor();
    let total = Arc::new(AtomicUsize::new(0));
    let t = total.clone();
    let pipeline = Pipeline::new(
        3,
        vec![
            Pipe::serial(|pf| {
                if pf.token() >= 50 {
                    pf.stop();
                }
            }),
            Pipe::parallel(move |_pf| {
                t.fetch_add(1, Ordering::AcqRel);
            }),
        ],
    );
    assert_eq!(executor.run(pipeline.workflow()).get(), Ok(()));
    assert_eq!(executor.run(pipeline.workflow()).get(), Ok(()));
    assert_eq!(pipeline.num_tokens(), 50);
    assert_eq!(total.load(Ordering::Acquire), 100);
}

#[test]
fn data_pipeline_carries_values_through_stages() {
    let executor = executor();
    let collected = Arc::new(Mutex::new(Vec::new()));

    let c = collected.clone();
    let pipeline = DataPipeline::new(
        4,
        vec![
            DataPipe::serial_source(|pf| {
                if pf.token() < 50 {
                    Some(pf.token() as u64)
                } else {
                    None
                }
            }),
            DataPipe::parallel(|_pf, value: u64| value * 2),
            DataPipe::serial(move |_pf, value| {
                c.lock().unwrap().push(value);
                value
            }),
        ],
    );

    assert_eq!(executor.run(pipeline.workflow()).get(), Ok(()));
    assert_eq!(pipeline.num_tokens(), 50);
    let expected: Vec<u64> = (0..50).map(|i| i * 2).collect();
    assert_eq!(*collected.lock().unwrap(), expected);
}

#[test]
fn algorithms_compose_with_ordinary_edges() {
    let executor = executor();
    let src: Arc<Vec<i64>> = Arc::new((1..=256).collect());
    let doubled: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let total = Arc::new(Mutex::new(0i64));

    let workflow = Workflow::new();
    let map = workflow.transform(src.clone(), doubled.clone(), Partitioner::Guided, |v| v * 2);
    let doubled_for_fold = doubled.clone();
    let t = total.clone();
    let fold = workflow.emplace(move || {
        let values = doubled_for_fold.lock().unwrap();
        *t.lock().unwrap() = values.iter().sum();
    });
    map.precede(&fold);

    assert_eq!(executor.run(&workflow).get(), Ok(()));
    assert_eq!(*total.lock().unwrap(), (1..=256i64).map(|v| v * 2).sum());
}
