//! Per-invocation backward state

use super::input_buffer::InputBuffer;
use super::ready_queue::ReadyQueue;
use crate::device::{Stream, NO_DEVICE};
use crate::error::{Error, Result};
use crate::graph::{node_key, Edge, GradList, Node};
use crate::mode::AnomalyMode;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

/// Execution metadata for one node when specific outputs were requested
///
/// `needed` marks nodes on a path to a requested output; `captures` lists
/// the input slots whose values are the requested outputs themselves.
#[derive(Clone, Default)]
pub(crate) struct ExecInfo {
    pub(crate) needed: bool,
    pub(crate) captures: Option<Vec<Capture>>,
}

impl ExecInfo {
    pub(crate) fn should_execute(&self) -> bool {
        self.needed || self.captures.is_some()
    }
}

/// Routes input slot `input_idx` of a node into result slot `output_idx`
#[derive(Clone, Copy)]
pub(crate) struct Capture {
    pub(crate) input_idx: usize,
    pub(crate) output_idx: usize,
}

/// The maps a graph task's mutex guards
#[derive(Default)]
pub(crate) struct GraphTaskState {
    /// Unsatisfied producer count per pending node
    pub(crate) dependencies: HashMap<usize, usize>,
    /// Partially filled input buffers of not-yet-ready nodes
    pub(crate) not_ready: HashMap<usize, InputBuffer>,
    /// Populated iff specific outputs were requested
    pub(crate) exec_info: HashMap<usize, ExecInfo>,
    /// Requested outputs, indexed by capture `output_idx`
    pub(crate) captured_vars: GradList,
    /// Streams used by nodes with no successors, synced at the end
    pub(crate) leaf_streams: HashSet<Stream>,
}

/// State of one backward invocation
///
/// A graph task is complete when its outstanding-task counter returns to
/// zero (or its error latch fires with `exit_on_error`); the caller blocked
/// on [`GraphTask::future_result`] is then unparked with either the captured
/// variables or the first error.
pub struct GraphTask {
    pub(crate) keep_graph: bool,
    pub(crate) grad_mode: bool,
    pub(crate) exit_on_error: bool,
    /// Tasks enqueued minus tasks fully processed
    pub(crate) outstanding_tasks: AtomicU64,
    pub(crate) has_error: AtomicBool,
    /// 0 for a top-level invocation, parent depth + 1 for reentrant ones
    pub(crate) reentrant_depth: i32,
    /// Worker-device index of the thread blocked on this task's future
    pub(crate) owner: AtomicI32,
    /// The CPU ready queue of the thread driving this task
    pub(crate) cpu_ready_queue: Arc<ReadyQueue>,
    /// Debug scope captured from the calling thread, reinstalled per call
    pub(crate) debug_info: Option<String>,
    has_exec_info: AtomicBool,
    pub(crate) state: Mutex<GraphTaskState>,
    pub(crate) future_result: FutureResult,
}

impl GraphTask {
    /// Create the state for one backward invocation
    pub fn new(
        keep_graph: bool,
        create_graph: bool,
        reentrant_depth: i32,
        cpu_ready_queue: Arc<ReadyQueue>,
        exit_on_error: bool,
    ) -> Self {
        Self {
            keep_graph,
            grad_mode: create_graph,
            exit_on_error,
            outstanding_tasks: AtomicU64::new(0),
            has_error: AtomicBool::new(false),
            reentrant_depth,
            owner: AtomicI32::new(NO_DEVICE),
            cpu_ready_queue,
            debug_info: super::current_debug_info(),
            has_exec_info: AtomicBool::new(false),
            state: Mutex::new(GraphTaskState::default()),
            future_result: FutureResult::new(),
        }
    }

    /// Whether all enqueued tasks have been processed (or the error latch
    /// fired under the exit-on-error policy)
    pub fn completed(&self) -> bool {
        self.outstanding_tasks.load(Ordering::SeqCst) == 0
            || (self.exit_on_error && self.has_error.load(Ordering::SeqCst))
    }

    /// True for an imperative backward (no output pruning), which is what
    /// gradient checkpointing requires of every invocation on the stack
    pub(crate) fn can_checkpoint(&self) -> bool {
        !self.has_exec_info.load(Ordering::Relaxed)
    }

    /// Latch the first error and complete the future with it
    ///
    /// Later errors are dropped; in anomaly mode the offending node's
    /// forward stack is logged before the latch fires.
    pub(crate) fn set_exception(&self, error: Error, func: Option<&Arc<dyn Node>>) {
        let _state = self.state.lock();
        if !self.has_error.load(Ordering::SeqCst) {
            if AnomalyMode::is_enabled() {
                if let Some(func) = func {
                    if let Some(stack) = func.anomaly_stack() {
                        log::error!(
                            "Error detected in {}. Traceback of forward call that caused the error:\n{}",
                            func.name(),
                            stack
                        );
                    }
                }
            }
            self.has_error.store(true, Ordering::SeqCst);
            if !self.future_result.completed() {
                self.future_result.set_error(error);
            }
        }
    }

    /// Restrict execution to the subgraph feeding the requested outputs
    ///
    /// Installs a capture per output edge, then computes `needed` for every
    /// reachable node by iterative post-order traversal: a node is needed iff
    /// any successor should execute.
    pub(crate) fn init_to_execute(&self, graph_root: &Arc<dyn Node>, outputs: &[Edge]) {
        let mut state = self.state.lock();
        state
            .exec_info
            .entry(node_key(graph_root))
            .or_default()
            .needed = true;

        let mut output_idx = 0;
        for output_edge in outputs {
            if let Some(function) = &output_edge.function {
                let info = state.exec_info.entry(node_key(function)).or_default();
                info.captures.get_or_insert_with(Vec::new).push(Capture {
                    input_idx: output_edge.input_nr,
                    output_idx,
                });
            }
            output_idx += 1;
        }
        state.captured_vars = vec![None; output_idx];
        self.has_exec_info.store(true, Ordering::Relaxed);

        struct Frame {
            node: Arc<dyn Node>,
            next_edge_index: usize,
        }

        impl Frame {
            fn next_fn(&mut self) -> Option<Arc<dyn Node>> {
                let edges = self.node.next_edges();
                while self.next_edge_index < edges.len() {
                    let edge = &edges[self.next_edge_index];
                    self.next_edge_index += 1;
                    if let Some(function) = &edge.function {
                        return Some(Arc::clone(function));
                    }
                }
                None
            }
        }

        let mut seen: HashSet<usize> = HashSet::new();
        let mut stack: Vec<Frame> = Vec::new();
        for input_edge in graph_root.next_edges() {
            let Some(input_fn) = &input_edge.function else {
                continue;
            };
            if seen.contains(&node_key(input_fn)) {
                continue;
            }
            stack.push(Frame {
                node: Arc::clone(input_fn),
                next_edge_index: 0,
            });
            loop {
                let next = match stack.last_mut() {
                    None => break,
                    Some(frame) => frame.next_fn(),
                };
                match next {
                    Some(next_fn) => {
                        if seen.insert(node_key(&next_fn)) {
                            stack.push(Frame {
                                node: next_fn,
                                next_edge_index: 0,
                            });
                        }
                    }
                    None => {
                        let frame = stack.pop().expect("loop guard saw a frame");
                        let needed = frame.node.next_edges().iter().any(|edge| {
                            edge.function.as_ref().is_some_and(|function| {
                                state
                                    .exec_info
                                    .get(&node_key(function))
                                    .is_some_and(ExecInfo::should_execute)
                            })
                        });
                        state
                            .exec_info
                            .entry(node_key(&frame.node))
                            .or_default()
                            .needed = needed;
                    }
                }
            }
        }
    }
}

/// Completion channel carrying the captured variables or the first error
///
/// Transitions from pending to completed exactly once.
pub(crate) struct FutureResult {
    state: Mutex<Option<Result<GradList>>>,
    completed_cv: Condvar,
}

impl FutureResult {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            completed_cv: Condvar::new(),
        }
    }

    pub(crate) fn completed(&self) -> bool {
        self.state.lock().is_some()
    }

    pub(crate) fn mark_completed(&self, value: GradList) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.is_none(), "future completed twice");
            if state.is_none() {
                *state = Some(Ok(value));
            }
        }
        self.completed_cv.notify_all();
    }

    pub(crate) fn set_error(&self, error: Error) {
        {
            let mut state = self.state.lock();
            match &*state {
                None => *state = Some(Err(error)),
                Some(existing) => {
                    debug_assert!(existing.is_err(), "error after successful completion");
                    return;
                }
            }
        }
        self.completed_cv.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<GradList> {
        let mut state = self.state.lock();
        while state.is_none() {
            self.completed_cv.wait(&mut state);
        }
        state.as_ref().expect("woke on completed future").clone()
    }
}
