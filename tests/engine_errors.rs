//! Integration tests for error propagation, callbacks, and anomaly mode

mod common;

use common::{edge, seed, ScaleFn, SinkFn};
use gradr::device::Device;
use gradr::dtype::DType;
use gradr::engine::Engine;
use gradr::error::{Error, Result};
use gradr::graph::{Edge, GradList, InputMetadata, Node};
use gradr::mode::AnomalyMode;
use gradr::tensor::Tensor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct FailingFn {
    metadata: InputMetadata,
    edges: Vec<Edge>,
}

impl FailingFn {
    fn new(edges: Vec<Edge>) -> Self {
        Self {
            metadata: InputMetadata::new(&[1][..], DType::F32, Device::cpu()),
            edges,
        }
    }
}

impl Node for FailingFn {
    fn apply(&self, _inputs: GradList) -> Result<GradList> {
        Err(Error::Internal("deliberate failure".into()))
    }
    fn next_edges(&self) -> &[Edge] {
        &self.edges
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

#[test]
fn test_node_failure_reaches_the_caller() {
    let failing = Arc::new(FailingFn::new(vec![]));
    let err = Engine::new()
        .execute(
            &[edge(&failing, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap_err();
    assert_eq!(err, Error::Internal("deliberate failure".into()));
}

#[test]
fn test_first_error_wins_and_graph_drains() {
    // Parallel branches: one fails, the sibling either runs before the latch
    // or is skipped after it; either way execute reports the failure and the
    // pass terminates.
    let sink = Arc::new(SinkFn::new("sink", 1, &[1]));
    let ok_branch = Arc::new(ScaleFn::new("ok", 1.0, &[1], vec![edge(&sink, 0)]));
    let failing = Arc::new(FailingFn::new(vec![]));

    let err = Engine::new()
        .execute(
            &[edge(&failing, 0), edge(&ok_branch, 0)],
            vec![Some(seed(1.0, &[1])), Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap_err();

    assert_eq!(err, Error::Internal("deliberate failure".into()));
    assert!(sink.calls() <= 1);
}

#[test]
fn test_panicking_node_is_caught_as_error() {
    struct PanickingFn {
        metadata: InputMetadata,
    }

    impl Node for PanickingFn {
        fn apply(&self, _inputs: GradList) -> Result<GradList> {
            panic!("backward blew up");
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
            "PanickingFn"
        }
    }

    let node = Arc::new(PanickingFn {
        metadata: InputMetadata::new(&[1][..], DType::F32, Device::cpu()),
    });
    let err = Engine::new()
        .execute(
            &[edge(&node, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap_err();
    assert_eq!(err, Error::Internal("backward blew up".into()));
}

#[test]
fn test_callbacks_run_after_backward_and_are_cleared() {
    struct CallbackFn {
        engine: Engine,
        counter: Arc<AtomicUsize>,
        metadata: InputMetadata,
    }

    impl Node for CallbackFn {
        fn apply(&self, _inputs: GradList) -> Result<GradList> {
            let counter = Arc::clone(&self.counter);
            self.engine
                .queue_callback(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
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
            "CallbackFn"
        }
    }

    let engine = Engine::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let node = Arc::new(CallbackFn {
        engine: engine.clone(),
        counter: Arc::clone(&counter),
        metadata: InputMetadata::new(&[1][..], DType::F32, Device::cpu()),
    });

    engine
        .execute(
            &[edge(&node, 0)],
            vec![Some(seed(1.0, &[1]))],
            true,
            false,
            &[],
        )
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // A plain backward on an unrelated graph must not replay the callback.
    let sink = Arc::new(SinkFn::new("sink", 1, &[1]));
    engine
        .execute(
            &[edge(&sink, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_callbacks_run_even_when_backward_fails() {
    struct FailingCallbackFn {
        engine: Engine,
        counter: Arc<AtomicUsize>,
        metadata: InputMetadata,
    }

    impl Node for FailingCallbackFn {
        fn apply(&self, _inputs: GradList) -> Result<GradList> {
            let counter = Arc::clone(&self.counter);
            self.engine
                .queue_callback(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            Err(Error::Internal("failed after queueing".into()))
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
            "FailingCallbackFn"
        }
    }

    let engine = Engine::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let node = Arc::new(FailingCallbackFn {
        engine: engine.clone(),
        counter: Arc::clone(&counter),
        metadata: InputMetadata::new(&[1][..], DType::F32, Device::cpu()),
    });

    let err = engine
        .execute(
            &[edge(&node, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap_err();
    assert_eq!(err, Error::Internal("failed after queueing".into()));
    // The future was already errored, but the drain still runs callbacks.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_anomaly_mode_flags_nan_outputs() {
    struct NanFn {
        metadata: InputMetadata,
        edges: Vec<Edge>,
    }

    impl Node for NanFn {
        fn apply(&self, _inputs: GradList) -> Result<GradList> {
            let bad = Tensor::from_slice(&[f32::NAN], &[1], Device::cpu());
            Ok(vec![Some(bad)])
        }
        fn next_edges(&self) -> &[Edge] {
            &self.edges
        }
        fn num_inputs(&self) -> usize {
            1
        }
        fn input_metadata(&self, _index: usize) -> &InputMetadata {
            &self.metadata
        }
        fn name(&self) -> &str {
            "NanFn"
        }
        fn anomaly_stack(&self) -> Option<String> {
            Some("forward stack placeholder".into())
        }
    }

    let sink = Arc::new(SinkFn::new("sink", 1, &[1]));
    let node = Arc::new(NanFn {
        metadata: InputMetadata::new(&[1][..], DType::F32, Device::cpu()),
        edges: vec![edge(&sink, 0)],
    });

    AnomalyMode::set_enabled(true);
    let err = Engine::new()
        .execute(
            &[edge(&node, 0)],
            vec![Some(seed(1.0, &[1]))],
            false,
            false,
            &[],
        )
        .unwrap_err();
    AnomalyMode::set_enabled(false);

    assert_eq!(
        err,
        Error::NanGradient {
            function: "NanFn".into(),
            output_index: 0
        }
    );
    assert_eq!(sink.calls(), 0);
}
