//! The backward execution engine
//!
//! This module provides the scheduler that drives a recorded graph backward:
//! per-device worker threads, dependency counting, input-buffer accumulation,
//! reentrant backward, and the completion protocol.
//!
//! # Reentrant backwards
//!
//! `execute` blocks until differentiation finishes, and every ready queue is
//! drained by exactly one worker pinned to its device. If a node's `apply`
//! calls `execute` again, the worker it runs on must not block: every task of
//! the nested invocation (and the outer one) is behind that worker's queue.
//! Instead, the calling worker drives the nested graph task itself, up to
//! [`MAX_RECURSION_DEPTH`] nested invocations per thread. Past the limit the
//! nested graph task is handed to a pool of reentrant workers; the pool
//! worker adopts the caller's ready queue (sharing it is a mild win over a
//! fresh queue) and the caller blocks until the nested future completes.
//!
//! # Streaming backwards
//!
//! Accelerator nodes run on the stream that ran them in forward. Producer and
//! consumer are synchronized when outputs are placed into input buffers: the
//! consumer stream waits on an event recorded on the producer stream, and
//! accumulation runs under the consumer stream. Nodes with no successors have
//! their stream recorded as a *leaf stream*; at the end of backward each leaf
//! stream is synced against its device's default stream, preserving the
//! historical contract that syncing with default streams after `execute`
//! observes all backward effects.

mod graph_task;
mod input_buffer;
mod ready_queue;

pub use graph_task::GraphTask;
pub use input_buffer::InputBuffer;
pub use ready_queue::{NodeTask, ReadyQueue};

use crate::device::{
    device_runtime, max_device_count, Device, DeviceType, Stream, StreamGuard, CPU_DEVICE,
    NO_DEVICE,
};
use crate::error::{Error, Result};
use crate::graph::{node_key, Edge, GradList, GraphRoot, Node};
use crate::mode::{AnomalyMode, AutoGradMode};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Nested reentrant invocations a thread drives inline before the nested
/// graph task is offloaded to the reentrant pool
pub const MAX_RECURSION_DEPTH: i32 = 100;

// Engine worker threads carry a constant worker_device naming the device
// they process work for; caller threads that have not entered the engine
// read NO_DEVICE. The depth counters and the local ready queue implement the
// reentrant protocol; checkpoint_valid is exposed for the gradient
// checkpointing integration.
thread_local! {
    static WORKER_DEVICE: Cell<i32> = const { Cell::new(NO_DEVICE) };
    static CHECKPOINT_VALID: Cell<bool> = const { Cell::new(true) };
    static CURRENT_DEPTH: Cell<i32> = const { Cell::new(0) };
    static TOTAL_DEPTH: Cell<i32> = const { Cell::new(0) };
    static LOCAL_READY_QUEUE: RefCell<Option<Arc<ReadyQueue>>> = const { RefCell::new(None) };
    static DEBUG_INFO: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn worker_device() -> i32 {
    WORKER_DEVICE.get()
}

fn local_ready_queue() -> Arc<ReadyQueue> {
    LOCAL_READY_QUEUE
        .with(|queue| queue.borrow().clone())
        .expect("no ready queue bound to this thread")
}

fn init_local_ready_queue(ready_queue: Arc<ReadyQueue>) {
    LOCAL_READY_QUEUE.with(|queue| *queue.borrow_mut() = Some(ready_queue));
}

/// Pin the calling thread to `device` on every runtime that has it
///
/// Never constructs a guard for the CPU; the index alone marks the thread as
/// the CPU worker.
fn set_device(device: i32) {
    if device != CPU_DEVICE {
        for device_type in DeviceType::ACCELERATORS {
            if let Some(runtime) = device_runtime(device_type) {
                if device < runtime.device_count() {
                    runtime.set_device(device);
                }
            }
        }
    }
    WORKER_DEVICE.set(device);
}

/// The debug scope currently installed on this thread, if any
pub fn current_debug_info() -> Option<String> {
    DEBUG_INFO.with(|info| info.borrow().clone())
}

/// Scoped installation of a thread-local debug scope
///
/// A graph task captures the caller's scope at construction; workers
/// reinstall it around every node call so attribution survives the thread
/// hop.
pub struct DebugInfoGuard {
    prev: Option<String>,
}

impl DebugInfoGuard {
    /// Install `info` for the guard's lifetime
    pub fn new(info: Option<String>) -> Self {
        Self {
            prev: DEBUG_INFO.with(|slot| slot.replace(info)),
        }
    }
}

impl Drop for DebugInfoGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        DEBUG_INFO.with(|slot| *slot.borrow_mut() = prev);
    }
}

struct CheckpointGuard {
    prev: bool,
}

impl CheckpointGuard {
    fn enter(can_checkpoint: bool) -> Self {
        let prev = CHECKPOINT_VALID.get();
        CHECKPOINT_VALID.set(prev && can_checkpoint);
        Self { prev }
    }
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        CHECKPOINT_VALID.set(self.prev);
    }
}

type Callback = Box<dyn FnOnce() + Send>;

/// Clears the callback list on entry and on every exit path of `execute`.
struct ClearCallbacks<'a> {
    callbacks: &'a Mutex<Vec<Option<Callback>>>,
}

impl<'a> ClearCallbacks<'a> {
    fn new(callbacks: &'a Mutex<Vec<Option<Callback>>>) -> Self {
        callbacks.lock().clear();
        Self { callbacks }
    }
}

impl Drop for ClearCallbacks<'_> {
    fn drop(&mut self) {
        self.callbacks.lock().clear();
    }
}

struct PoolState {
    num_workers: usize,
    graphtasks_queue: VecDeque<Weak<GraphTask>>,
}

struct ThreadPoolShared {
    state: Mutex<PoolState>,
    work: Condvar,
}

impl ThreadPoolShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                num_workers: 0,
                graphtasks_queue: VecDeque::new(),
            }),
            work: Condvar::new(),
        }
    }
}

struct EngineShared {
    max_recursion_depth: i32,
    device_ready_queues: OnceLock<Vec<Arc<ReadyQueue>>>,
    thread_pool_shared: Arc<ThreadPoolShared>,
    final_callbacks: Mutex<Vec<Option<Callback>>>,
}

/// The backward execution engine
///
/// `Engine` is a cheap-clone handle over shared scheduler state. Device
/// worker threads start lazily on the first `execute` and are shared by all
/// clones; construct separate engines for isolated worker sets.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine with the default reentrant depth limit
    pub fn new() -> Self {
        Self::with_max_recursion_depth(MAX_RECURSION_DEPTH)
    }

    /// Create an engine that offloads reentrant calls past `depth` to the
    /// reentrant thread pool
    pub fn with_max_recursion_depth(depth: i32) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                max_recursion_depth: depth,
                device_ready_queues: OnceLock::new(),
                thread_pool_shared: Arc::new(ThreadPoolShared::new()),
                final_callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Run a backward pass
    ///
    /// Validates `grads` (the seed gradients, one per root edge) against the
    /// roots' input metadata, then drives the graph to completion on the
    /// calling thread plus any device workers involved.
    ///
    /// With `outputs` non-empty, execution is pruned to the subgraph feeding
    /// the requested edges and the returned list holds one captured gradient
    /// per output edge; otherwise the returned list is empty.
    ///
    /// `keep_graph` retains node state for a repeat invocation;
    /// `create_graph` records gradient history through backward (enabling
    /// higher-order gradients). The first node failure is returned after the
    /// graph drains.
    pub fn execute(
        &self,
        roots: &[Edge],
        grads: GradList,
        keep_graph: bool,
        create_graph: bool,
        outputs: &[Edge],
    ) -> Result<GradList> {
        self.shared
            .execute(roots, grads, keep_graph, create_graph, outputs)
    }

    /// Register a callback to run after the current backward pass completes
    ///
    /// Callbacks are scoped to a single `execute` call and cleared on every
    /// exit path, including errors. A callback may register further
    /// callbacks.
    pub fn queue_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared
            .final_callbacks
            .lock()
            .push(Some(Box::new(callback)));
    }

    /// Whether every engine invocation on this thread's stack is an
    /// imperative backward, as gradient checkpointing requires
    pub fn is_checkpoint_valid(&self) -> bool {
        CHECKPOINT_VALID.get()
    }

    /// Push a pre-built task onto the CPU queue of its graph task
    ///
    /// Does not increment the outstanding counter: the caller (typically a
    /// distributed engine) has already accounted for the task.
    ///
    /// # Panics
    ///
    /// Panics if the task's graph task has been dropped.
    pub fn enqueue_blocked_task_on_cpu(&self, task: NodeTask) {
        self.shared.start_device_threads();
        let graph_task = task.base.upgrade().expect("GraphTask is no longer valid");
        self.shared
            .ready_queue(&graph_task, Device::cpu())
            .push(task, false);
    }

    /// Number of tasks queued for `device` under `graph_task`
    ///
    /// Returns 0 before the device threads have started.
    pub fn ready_queue_size(&self, graph_task: &Arc<GraphTask>, device: Device) -> usize {
        if self.shared.device_ready_queues.get().is_none() {
            return 0;
        }
        self.shared.ready_queue(graph_task, device).size()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineShared {
    fn execute(
        self: &Arc<Self>,
        roots: &[Edge],
        grads: GradList,
        keep_graph: bool,
        create_graph: bool,
        outputs: &[Edge],
    ) -> Result<GradList> {
        let mut grads = grads;
        validate_outputs(roots, &mut grads)?;

        // Callbacks are only valid for the duration of this run.
        let _callbacks_guard = ClearCallbacks::new(&self.final_callbacks);

        let is_reentrant_call = worker_device() != NO_DEVICE;
        let cpu_ready_queue = if is_reentrant_call {
            // A reentrant call keeps draining the parent worker's queue.
            local_ready_queue()
        } else {
            let queue = Arc::new(ReadyQueue::new());
            init_local_ready_queue(Arc::clone(&queue));
            queue
        };
        let reentrant_depth = if is_reentrant_call {
            TOTAL_DEPTH.get() + 1
        } else {
            0
        };
        let graph_task = Arc::new(GraphTask::new(
            keep_graph,
            create_graph,
            reentrant_depth,
            cpu_ready_queue,
            false,
        ));

        let graph_root: Arc<dyn Node> = Arc::new(GraphRoot::new(roots, grads));
        compute_dependencies(&graph_root, &graph_task);
        if !outputs.is_empty() {
            graph_task.init_to_execute(&graph_root, outputs);
        }

        self.execute_with_graph_task(graph_task, graph_root)
    }

    fn execute_with_graph_task(
        self: &Arc<Self>,
        graph_task: Arc<GraphTask>,
        graph_root: Arc<dyn Node>,
    ) -> Result<GradList> {
        self.start_device_threads();

        let lock = graph_task.state.lock();
        self.ready_queue(&graph_task, Device::cpu()).push(
            NodeTask::new(&graph_task, Some(graph_root), InputBuffer::new(0)),
            true,
        );

        if worker_device() == NO_DEVICE {
            // Not a reentrant call: the calling thread becomes the CPU worker
            // for the duration of this graph task.
            set_device(CPU_DEVICE);
            graph_task.owner.store(CPU_DEVICE, Ordering::SeqCst);
            drop(lock);
            self.thread_main(None);

            // Reset thread state so repeated backward calls start clean.
            WORKER_DEVICE.set(NO_DEVICE);
            LOCAL_READY_QUEUE.with(|queue| queue.borrow_mut().take());
            graph_task.future_result.wait()
        } else {
            // Reentrant call from an engine worker.
            graph_task.owner.store(worker_device(), Ordering::SeqCst);
            if CURRENT_DEPTH.get() >= self.max_recursion_depth {
                drop(lock);
                self.add_thread_pool_task(Arc::downgrade(&graph_task));
                graph_task.future_result.wait()
            } else {
                // total_depth is only maintained on this path; the pool path
                // bootstraps it from the graph task's reentrant_depth.
                CURRENT_DEPTH.set(CURRENT_DEPTH.get() + 1);
                TOTAL_DEPTH.set(TOTAL_DEPTH.get() + 1);
                drop(lock);
                self.thread_main(Some(&graph_task));
                CURRENT_DEPTH.set(CURRENT_DEPTH.get() - 1);
                TOTAL_DEPTH.set(TOTAL_DEPTH.get() - 1);
                debug_assert!(graph_task.future_result.completed());
                graph_task.future_result.wait()
            }
        }
    }

    /// Worker loop over the thread-local ready queue
    ///
    /// With a graph task, runs as a reentrant worker: the loop ends once that
    /// graph task has no outstanding work. Without one, runs until a shutdown
    /// task arrives or (for the top-level CPU driver) its graph task
    /// completes.
    fn thread_main(self: &Arc<Self>, graph_task: Option<&Arc<GraphTask>>) {
        let local_queue = local_ready_queue();
        while graph_task.is_none_or(|gt| gt.outstanding_tasks.load(Ordering::SeqCst) > 0) {
            let task = local_queue.pop();
            if task.is_shutdown_task {
                log::info!("autograd worker received shutdown task");
                break;
            }
            if self.process_task(task, graph_task.is_some()) {
                break;
            }
        }
    }

    /// Handle one popped task. Returns true when the worker should leave its
    /// loop: the top-level CPU driver just completed its graph task.
    fn process_task(self: &Arc<Self>, task: NodeTask, reentrant: bool) -> bool {
        let NodeTask {
            base, func, inputs, ..
        } = task;

        let Some(local_graph_task) = base.upgrade() else {
            // A reentrant worker holds a strong reference through its caller,
            // so expiry means a straggler from a prior non-reentrant execute.
            assert!(!reentrant, "reentrant worker lost its GraphTask");
            log::info!(
                "GraphTask for function {} is no longer valid, skipping execution",
                func.as_ref().map_or("<no fn>", |f| f.name())
            );
            return false;
        };

        if let Some(func) = &func {
            if !local_graph_task.has_error.load(Ordering::SeqCst) {
                let _grad_mode = AutoGradMode::new(local_graph_task.grad_mode);
                let result = match panic::catch_unwind(AssertUnwindSafe(|| {
                    self.evaluate_function(&local_graph_task, func, inputs)
                })) {
                    Ok(result) => result,
                    Err(payload) => Err(Error::Internal(panic_message(payload))),
                };
                if let Err(error) = result {
                    local_graph_task.set_exception(error, Some(func));
                }
            }
        }

        local_graph_task
            .outstanding_tasks
            .fetch_sub(1, Ordering::SeqCst);

        let completed = local_graph_task.completed();
        if completed {
            self.mark_graph_task_completed(&local_graph_task);
            // The CPU worker is the thread that requested the backward pass;
            // it must return to the code that called execute.
            if worker_device() == CPU_DEVICE {
                return true;
            }
        }

        let base_owner = local_graph_task.owner.load(Ordering::SeqCst);
        if completed && base_owner != worker_device() {
            // The owner may be blocked in pop(); a no-op task guarantees it
            // wakes and observes outstanding_tasks == 0.
            atomic::fence(Ordering::Release);
            self.ready_queue_by_index(&local_graph_task, base_owner)
                .push(NodeTask::new(&local_graph_task, None, InputBuffer::new(0)), true);
        }
        false
    }

    fn evaluate_function(
        self: &Arc<Self>,
        graph_task: &Arc<GraphTask>,
        func: &Arc<dyn Node>,
        inputs: InputBuffer,
    ) -> Result<()> {
        {
            let mut state = graph_task.state.lock();
            if !state.exec_info.is_empty() {
                let info = state
                    .exec_info
                    .get(&node_key(func))
                    .cloned()
                    .unwrap_or_else(|| panic!("no exec info entry for {}", func.name()));
                if let Some(captures) = &info.captures {
                    for capture in captures {
                        state.captured_vars[capture.output_idx] =
                            inputs.get(capture.input_idx).clone();
                    }
                }
                if !info.needed {
                    return Ok(());
                }
            }
        }

        // Run the node under the stream it used in forward (if any).
        let opt_parent_stream = node_stream(func.as_ref());
        let _parent_stream_guard = StreamGuard::new(opt_parent_stream);

        let outputs = self.call_function(graph_task, func, inputs)?;

        if !graph_task.keep_graph {
            func.release_variables();
        }

        if outputs.is_empty() {
            // Leaf node: remember its stream for the final default-stream sync.
            if let Some(stream) = opt_parent_stream {
                graph_task.state.lock().leaf_streams.insert(stream);
            }
            return Ok(());
        }

        if AnomalyMode::is_enabled() {
            let _no_grad = AutoGradMode::new(false);
            for (i, output) in outputs.iter().enumerate() {
                if let Some(tensor) = output {
                    if tensor.has_nan() {
                        return Err(Error::NanGradient {
                            function: func.name().to_string(),
                            output_index: i,
                        });
                    }
                }
            }
        }

        let next_edges = func.next_edges();
        let mut state = graph_task.state.lock();
        for (i, output) in outputs.into_iter().enumerate() {
            let next = &next_edges[i];
            let Some(next_fn) = &next.function else {
                continue;
            };
            let key = node_key(next_fn);

            let mut is_ready = false;
            match state.dependencies.get_mut(&key) {
                None => panic!("dependency not found for {}", next_fn.name()),
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        state.dependencies.remove(&key);
                        is_ready = true;
                    }
                }
            }

            let mut input_buffer = match state.not_ready.remove(&key) {
                None => {
                    // First contribution. Skip functions masked out by the
                    // requested-output pruning.
                    if !state.exec_info.is_empty()
                        && !state
                            .exec_info
                            .get(&key)
                            .is_some_and(graph_task::ExecInfo::should_execute)
                    {
                        continue;
                    }
                    InputBuffer::new(next_fn.num_inputs())
                }
                Some(buffer) => buffer,
            };

            let opt_next_stream = node_stream(next_fn.as_ref());
            input_buffer.add(next.input_nr, output, opt_parent_stream, opt_next_stream)?;

            if is_ready {
                let queue = self.ready_queue(graph_task, input_buffer.device());
                queue.push(
                    NodeTask::new(graph_task, Some(Arc::clone(next_fn)), input_buffer),
                    true,
                );
            } else {
                state.not_ready.insert(key, input_buffer);
            }
        }
        Ok(())
    }

    fn call_function(
        &self,
        graph_task: &Arc<GraphTask>,
        func: &Arc<dyn Node>,
        input_buffer: InputBuffer,
    ) -> Result<GradList> {
        let _checkpoint_guard = CheckpointGuard::enter(graph_task.can_checkpoint());

        let mut inputs = call_pre_hooks(func.as_ref(), input_buffer.into_variables());

        if !graph_task.keep_graph {
            func.will_release_variables();
        }

        let has_post_hooks = !func.post_hooks().is_empty();
        let outputs = {
            let _debug_guard = DebugInfoGuard::new(graph_task.debug_info.clone());
            if has_post_hooks {
                // Accumulator nodes steal an incoming gradient when its
                // storage use count says nothing else references it. Keeping
                // `inputs` alive across the call adds one reference, and the
                // accumulator's use-count check accounts for exactly that.
                // Any change here must stay compatible with that check.
                func.apply(inputs.clone())
            } else {
                func.apply(std::mem::take(&mut inputs))
            }
        };
        let mut outputs = outputs?;

        validate_outputs(func.next_edges(), &mut outputs)
            .map_err(|error| Error::function(func.name(), error))?;

        if has_post_hooks {
            Ok(call_post_hooks(func.as_ref(), outputs, &inputs))
        } else {
            Ok(outputs)
        }
    }

    fn mark_graph_task_completed(&self, graph_task: &Arc<GraphTask>) {
        let mut state = graph_task.state.lock();
        if graph_task.future_result.completed() {
            // The first failure already errored the future; callbacks still
            // get their drain (each runs at most once).
            self.run_post_callbacks();
            return;
        }
        match self.exec_post_processing(&mut state) {
            Ok(captured_vars) => graph_task.future_result.mark_completed(captured_vars),
            Err(error) => graph_task.future_result.set_error(error),
        }
    }

    /// Run queued post-backward callbacks, once each
    ///
    /// Index-wise so callbacks can register more callbacks (possibly from
    /// other threads) while the lock is released around each call; each slot
    /// is taken before invocation, making a second drain a no-op.
    fn run_post_callbacks(&self) {
        let mut i = 0;
        loop {
            let callback = {
                let mut callbacks = self.final_callbacks.lock();
                if i >= callbacks.len() {
                    break;
                }
                callbacks[i].take()
            };
            if let Some(callback) = callback {
                callback();
            }
            i += 1;
        }
    }

    fn exec_post_processing(
        &self,
        state: &mut graph_task::GraphTaskState,
    ) -> Result<GradList> {
        if !state.not_ready.is_empty() {
            return Err(Error::GraphIncomplete);
        }

        self.run_post_callbacks();

        // Sync leaf streams with their device default streams.
        for leaf_stream in &state.leaf_streams {
            let Some(runtime) = device_runtime(leaf_stream.device().device_type()) else {
                continue;
            };
            let default_stream = runtime.default_stream(leaf_stream.device());
            if *leaf_stream != default_stream {
                let event = runtime.record_event(*leaf_stream);
                runtime.wait_event(default_stream, event);
            }
        }

        Ok(state.captured_vars.clone())
    }

    fn start_device_threads(self: &Arc<Self>) -> &[Arc<ReadyQueue>] {
        self.device_ready_queues.get_or_init(|| {
            // One worker per device index; device types sharing an index are
            // colocated on one thread.
            let num_devices = max_device_count();
            let queues: Vec<Arc<ReadyQueue>> = (0..num_devices)
                .map(|_| Arc::new(ReadyQueue::new()))
                .collect();
            for (i, queue) in queues.iter().enumerate() {
                let engine = Arc::downgrade(self);
                let queue = Arc::clone(queue);
                std::thread::Builder::new()
                    .name(format!("gradr-device-{}", i))
                    .spawn(move || device_thread_main(engine, i as i32, queue))
                    .expect("failed to spawn autograd device worker");
            }
            queues
        })
    }

    fn add_thread_pool_task(self: &Arc<Self>, graph_task: Weak<GraphTask>) {
        let create_thread = {
            let mut pool = self.thread_pool_shared.state.lock();
            // Earlier queue entries may already have claimed the idle workers.
            let create_thread = pool.num_workers <= pool.graphtasks_queue.len();
            pool.graphtasks_queue.push_back(graph_task);
            create_thread
        };
        if create_thread {
            let engine = Arc::downgrade(self);
            let pool = Arc::clone(&self.thread_pool_shared);
            let parent_ready_queue = local_ready_queue();
            std::thread::Builder::new()
                .name("gradr-reentrant".into())
                .spawn(move || reentrant_thread_main(engine, pool, parent_ready_queue))
                .expect("failed to spawn reentrant worker");
        }
        // wait() re-tests the predicate, so this is safe even when the new
        // worker has not parked yet.
        self.thread_pool_shared.work.notify_one();
    }

    fn ready_queue(&self, graph_task: &Arc<GraphTask>, device: Device) -> Arc<ReadyQueue> {
        self.ready_queue_by_index(graph_task, device.ready_queue_index())
    }

    /// The CPU queue lives in the graph task; device queues are shared across
    /// all graph tasks.
    fn ready_queue_by_index(
        &self,
        graph_task: &Arc<GraphTask>,
        device_index: i32,
    ) -> Arc<ReadyQueue> {
        if device_index == CPU_DEVICE {
            Arc::clone(&graph_task.cpu_ready_queue)
        } else {
            let queues = self
                .device_ready_queues
                .get()
                .expect("device threads not started");
            Arc::clone(&queues[device_index as usize])
        }
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        // Device workers hold only weak engine references, so this runs when
        // the last handle goes away. Deliver shutdown only if no backward
        // work is queued; otherwise the workers are leaked.
        if let Some(queues) = self.device_ready_queues.get() {
            if queues.iter().all(|queue| queue.is_empty()) {
                for queue in queues {
                    queue.push_shutdown();
                }
            }
        }
    }
}

fn device_thread_main(engine: Weak<EngineShared>, device: i32, ready_queue: Arc<ReadyQueue>) {
    set_device(device);
    init_local_ready_queue(ready_queue);
    loop {
        let task = local_ready_queue().pop();
        if task.is_shutdown_task {
            log::info!("autograd device worker {} shutting down", device);
            break;
        }
        // Upgraded per task, not held while blocked in pop, so engine
        // teardown can proceed and deliver the shutdown sentinel.
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.process_task(task, false);
    }
}

fn reentrant_thread_main(
    engine: Weak<EngineShared>,
    pool: Arc<ThreadPoolShared>,
    parent_ready_queue: Arc<ReadyQueue>,
) {
    loop {
        let task = {
            let mut state = pool.state.lock();
            state.num_workers += 1;
            while state.graphtasks_queue.is_empty() {
                pool.work.wait(&mut state);
            }
            state.num_workers -= 1;
            state.graphtasks_queue.pop_front().expect("pool queue non-empty")
        };
        let Some(graph_task) = task.upgrade() else {
            log::info!("GraphTask has expired, skipping reentrant execution");
            continue;
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };
        set_device(graph_task.owner.load(Ordering::SeqCst));
        init_local_ready_queue(Arc::clone(&parent_ready_queue));
        TOTAL_DEPTH.set(graph_task.reentrant_depth);
        engine.thread_main(Some(&graph_task));
    }
}

/// Count unsatisfied producers for every node reachable from `root`
fn compute_dependencies(root: &Arc<dyn Node>, graph_task: &GraphTask) {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut queue: Vec<Arc<dyn Node>> = vec![Arc::clone(root)];
    let mut state = graph_task.state.lock();
    while let Some(func) = queue.pop() {
        for edge in func.next_edges() {
            if let Some(next_fn) = &edge.function {
                let key = node_key(next_fn);
                *state.dependencies.entry(key).or_insert(0) += 1;
                if seen.insert(key) {
                    queue.push(Arc::clone(next_fn));
                }
            }
        }
    }
}

/// Validate gradients against the metadata of the edges that consume them
///
/// Coerces where the tensor semantics allow it: a shape that differs from the
/// expected one but is broadcast-compatible is summed/expanded to it, and a
/// float dtype differing from the expected float dtype is cast. Undefined
/// gradients pass through untouched; consumers treat them as absent. (That
/// passthrough suppresses what would otherwise be an invalid-gradient error;
/// it is a known contract some operators rely on, not an oversight.)
pub(crate) fn validate_outputs(edges: &[Edge], grads: &mut GradList) -> Result<()> {
    if grads.len() != edges.len() {
        return Err(Error::GradientCount {
            expected: edges.len(),
            got: grads.len(),
        });
    }
    for i in 0..grads.len() {
        let edge = &edges[i];
        let Some(function) = &edge.function else {
            continue;
        };
        let metadata = function.input_metadata(edge.input_nr);

        let Some(grad) = grads[i].as_ref() else {
            continue;
        };
        if grad.shape() != metadata.shape.as_slice() {
            if !grad.broadcast_compatible(&metadata.shape) {
                return Err(Error::GradientShape {
                    index: i,
                    got: grad.shape().to_vec(),
                    expected: metadata.shape.to_vec(),
                });
            }
            let coerced = grad.sum_to(&metadata.shape)?;
            grads[i] = Some(coerced);
        }

        let grad = grads[i].as_ref().expect("slot populated above");
        if !grad.dtype().is_float() {
            return Err(Error::GradientNotFloat {
                index: i,
                dtype: grad.dtype(),
            });
        }
        if grad.dtype() != metadata.dtype {
            let casted = grad.cast(metadata.dtype);
            grads[i] = Some(casted);
        }

        let grad = grads[i].as_ref().expect("slot populated above");
        if grad.device() != metadata.device {
            return Err(Error::GradientDevice {
                index: i,
                expected: metadata.device,
                got: grad.device(),
            });
        }
    }
    Ok(())
}

fn call_pre_hooks(func: &dyn Node, mut inputs: GradList) -> GradList {
    for hook in func.pre_hooks() {
        inputs = hook.call(inputs);
    }
    inputs
}

fn call_post_hooks(func: &dyn Node, mut outputs: GradList, inputs: &GradList) -> GradList {
    for hook in func.post_hooks() {
        outputs = hook.call(outputs, inputs);
    }
    outputs
}

/// First registered accelerator stream the node reports
///
/// Device types are colocated per index, so the first hit is the stream the
/// colocated worker should run under.
fn node_stream(func: &dyn Node) -> Option<Stream> {
    DeviceType::ACCELERATORS.iter().find_map(|device_type| {
        device_runtime(*device_type)?;
        func.stream(*device_type)
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "backward function panicked".to_string()
    }
}

/// Signature of the factory producing the process default engine
pub type EngineStub = fn() -> Engine;

fn base_engine() -> Engine {
    static BASE: OnceLock<Engine> = OnceLock::new();
    BASE.get_or_init(Engine::new).clone()
}

static ENGINE_STUB: RwLock<EngineStub> = RwLock::new(base_engine as EngineStub);

/// Install a replacement factory for the process default engine
///
/// Compatibility shim for embedders that extend the engine; everything else
/// should construct an [`Engine`] explicitly.
pub fn set_default_engine_stub(stub: EngineStub) {
    *ENGINE_STUB.write() = stub;
}

/// The process default engine, as produced by the installed stub
pub fn get_default_engine() -> Engine {
    let stub = *ENGINE_STUB.read();
    stub()
}
