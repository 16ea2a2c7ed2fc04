//! Integration tests for reentrant backward
//!
//! A node's `apply` invokes `execute` again; the engine must drive the
//! nested graph task without deadlocking the worker that is already busy
//! running the outer one.

mod common;

use common::{edge, seed, ScaleFn, SinkFn};
use gradr::device::Device;
use gradr::dtype::DType;
use gradr::engine::Engine;
use gradr::error::Result;
use gradr::graph::{Edge, GradList, InputMetadata, Node};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Leaf op whose backward runs a whole nested backward pass
struct ReentrantFn {
    engine: Engine,
    nested_roots: Vec<Edge>,
    metadata: InputMetadata,
    worker_thread: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl ReentrantFn {
    fn new(engine: Engine, nested_roots: Vec<Edge>) -> Self {
        Self {
            engine,
            nested_roots,
            metadata: InputMetadata::new(&[1][..], DType::F32, Device::cpu()),
            worker_thread: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Node for ReentrantFn {
    fn apply(&self, _inputs: GradList) -> Result<GradList> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.worker_thread.lock().unwrap() = std::thread::current()
            .name()
            .map(|name| name.to_string());
        self.engine.execute(
            &self.nested_roots,
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )?;
        Ok(Vec::new())
    }

    fn next_edges(&self) -> &[Edge] {
        &[]
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn input_metadata(&self, _index: usize) -> &InputMetadata {
        &self.metadata
    }

    fn name(&self) -> &str {
        "ReentrantFn"
    }
}

/// Sink that records the name of the thread it ran on
struct ThreadProbeSink {
    inner: SinkFn,
    thread: Mutex<Option<String>>,
}

impl ThreadProbeSink {
    fn new() -> Self {
        Self {
            inner: SinkFn::new("nested_sink", 1, &[1]),
            thread: Mutex::new(None),
        }
    }
}

impl Node for ThreadProbeSink {
    fn apply(&self, inputs: GradList) -> Result<GradList> {
        *self.thread.lock().unwrap() = std::thread::current()
            .name()
            .map(|name| name.to_string());
        self.inner.apply(inputs)
    }

    fn next_edges(&self) -> &[Edge] {
        &[]
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn input_metadata(&self, index: usize) -> &InputMetadata {
        self.inner.input_metadata(index)
    }

    fn name(&self) -> &str {
        "ThreadProbeSink"
    }
}

#[test]
fn test_reentrant_backward_completes_inline() {
    let engine = Engine::new();

    let nested_sink = Arc::new(SinkFn::new("nested_sink", 1, &[1]));
    let nested_mid = Arc::new(ScaleFn::new("nested_mid", 3.0, &[1], vec![edge(&nested_sink, 0)]));

    let reentrant = Arc::new(ReentrantFn::new(
        engine.clone(),
        vec![edge(&nested_mid, 0)],
    ));

    engine
        .execute(
            &[edge(&reentrant, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap();

    assert_eq!(reentrant.calls.load(Ordering::SeqCst), 1);
    assert_eq!(nested_mid.calls(), 1);
    assert_eq!(nested_sink.grad().to_vec::<f32>(), vec![3.0]);
}

#[test]
fn test_doubly_nested_reentrant_backward() {
    let engine = Engine::new();

    let innermost_sink = Arc::new(SinkFn::new("innermost", 1, &[1]));
    let inner_reentrant = Arc::new(ReentrantFn::new(
        engine.clone(),
        vec![edge(&innermost_sink, 0)],
    ));
    let outer_reentrant = Arc::new(ReentrantFn::new(
        engine.clone(),
        vec![edge(&inner_reentrant, 0)],
    ));

    engine
        .execute(
            &[edge(&outer_reentrant, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap();

    assert_eq!(outer_reentrant.calls.load(Ordering::SeqCst), 1);
    assert_eq!(inner_reentrant.calls.load(Ordering::SeqCst), 1);
    assert_eq!(innermost_sink.calls(), 1);
}

#[test]
fn test_depth_limit_offloads_to_reentrant_pool() {
    // With the recursion limit at zero every reentrant call must hop to the
    // pool instead of recursing inline.
    let engine = Engine::with_max_recursion_depth(0);

    let nested_sink = Arc::new(ThreadProbeSink::new());
    let reentrant = Arc::new(ReentrantFn::new(
        engine.clone(),
        vec![edge(&nested_sink, 0)],
    ));

    engine
        .execute(
            &[edge(&reentrant, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap();

    // The outer pass ran on the calling thread; the nested graph task was
    // completed by a pool worker.
    assert_eq!(
        nested_sink.thread.lock().unwrap().as_deref(),
        Some("gradr-reentrant")
    );
    assert_eq!(nested_sink.inner.calls(), 1);
}

#[test]
fn test_nested_error_propagates_to_outer_caller() {
    struct FailingFn {
        metadata: InputMetadata,
    }

    impl Node for FailingFn {
        fn apply(&self, _inputs: GradList) -> Result<GradList> {
            Err(gradr::error::Error::Internal("nested failure".into()))
        }
        fn next_edges(&self) -> &[Edge] {
            &[]
        }
        fn num_inputs(&self) -> usize {
            1
        }
        fn input_metadata(&self, _index: usize) -> &InputMetadata {
            &self.metadata
        }
        fn name(&self) -> &str {
            "FailingFn"
        }
    }

    let engine = Engine::new();
    let failing = Arc::new(FailingFn {
        metadata: InputMetadata::new(&[1][..], DType::F32, Device::cpu()),
    });
    let reentrant = Arc::new(ReentrantFn::new(engine.clone(), vec![edge(&failing, 0)]));

    let err = engine
        .execute(
            &[edge(&reentrant, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap_err();

    assert_eq!(err, gradr::error::Error::Internal("nested failure".into()));
}
