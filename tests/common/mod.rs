//! Common test utilities
#![allow(dead_code)]

use gradr::device::Device;
use gradr::dtype::DType;
use gradr::error::Result;
use gradr::graph::{Edge, FunctionPostHook, FunctionPreHook, GradList, InputMetadata, Node};
use gradr::tensor::Tensor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared execution-order log written by test nodes as they run
pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

/// Create an empty execution log
pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A CPU f32 tensor filled with `value`
pub fn seed(value: f32, shape: &[usize]) -> Tensor {
    let numel: usize = shape.iter().product();
    Tensor::from_slice(&vec![value; numel], shape, Device::cpu())
}

/// Elementwise scale of a CPU f32 tensor
pub fn scale(tensor: &Tensor, factor: f32) -> Tensor {
    let data: Vec<f32> = tensor.to_vec::<f32>().iter().map(|x| x * factor).collect();
    Tensor::from_slice(&data, tensor.shape(), tensor.device())
}

/// Assert two f32 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Backward op multiplying its single input by a factor and fanning the
/// result out to every successor edge
pub struct ScaleFn {
    name: &'static str,
    factor: f32,
    edges: Vec<Edge>,
    metadata: InputMetadata,
    calls: AtomicUsize,
    log: Option<CallLog>,
    pre_hooks: Vec<Arc<dyn FunctionPreHook>>,
    post_hooks: Vec<Arc<dyn FunctionPostHook>>,
}

impl ScaleFn {
    pub fn new(name: &'static str, factor: f32, shape: &[usize], edges: Vec<Edge>) -> Self {
        Self {
            name,
            factor,
            edges,
            metadata: InputMetadata::new(shape, DType::F32, Device::cpu()),
            calls: AtomicUsize::new(0),
            log: None,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(Arc::clone(log));
        self
    }

    pub fn with_post_hook(mut self, hook: Arc<dyn FunctionPostHook>) -> Self {
        self.post_hooks.push(hook);
        self
    }

    pub fn with_pre_hook(mut self, hook: Arc<dyn FunctionPreHook>) -> Self {
        self.pre_hooks.push(hook);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Node for ScaleFn {
    fn apply(&self, inputs: GradList) -> Result<GradList> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.name);
        }
        let grad = inputs[0].as_ref().expect("ScaleFn received no gradient");
        let output = scale(grad, self.factor);
        Ok(self.edges.iter().map(|_| Some(output.clone())).collect())
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
        self.name
    }

    fn pre_hooks(&self) -> &[Arc<dyn FunctionPreHook>] {
        &self.pre_hooks
    }

    fn post_hooks(&self) -> &[Arc<dyn FunctionPostHook>] {
        &self.post_hooks
    }
}

/// Terminal op with no successors; records every gradient list it receives
///
/// Stands in for a gradient accumulator: the engine treats it as a leaf and
/// the test inspects what arrived.
pub struct SinkFn {
    name: &'static str,
    num_inputs: usize,
    metadata: InputMetadata,
    received: Mutex<Vec<GradList>>,
    log: Option<CallLog>,
}

impl SinkFn {
    pub fn new(name: &'static str, num_inputs: usize, shape: &[usize]) -> Self {
        Self {
            name,
            num_inputs,
            metadata: InputMetadata::new(shape, DType::F32, Device::cpu()),
            received: Mutex::new(Vec::new()),
            log: None,
        }
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(Arc::clone(log));
        self
    }

    /// Gradient lists received so far, one entry per invocation
    pub fn received(&self) -> Vec<GradList> {
        self.received.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// The single gradient of the single invocation this sink expects
    pub fn grad(&self) -> Tensor {
        let received = self.received.lock().unwrap();
        assert_eq!(received.len(), 1, "{}: expected exactly one invocation", self.name);
        received[0][0].clone().expect("sink slot 0 is undefined")
    }
}

impl Node for SinkFn {
    fn apply(&self, inputs: GradList) -> Result<GradList> {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.name);
        }
        self.received.lock().unwrap().push(inputs);
        Ok(Vec::new())
    }

    fn next_edges(&self) -> &[Edge] {
        &[]
    }

    fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    fn input_metadata(&self, _index: usize) -> &InputMetadata {
        &self.metadata
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Build `Edge`s into a shared node
pub fn edge<N: Node + 'static>(node: &Arc<N>, input_nr: usize) -> Edge {
    Edge::new(Arc::clone(node) as Arc<dyn Node>, input_nr)
}
