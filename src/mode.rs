//! Gradient-mode and anomaly-mode flags
//!
//! Gradient mode is thread-local: each worker installs the graph task's flag
//! for the duration of a node call so that double-backward graphs are only
//! recorded when `create_graph` was requested. Anomaly mode is process-wide
//! and makes the engine scan every output for NaNs.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static GRAD_MODE: Cell<bool> = const { Cell::new(true) };
}

/// Thread-local gradient-recording flag
pub struct GradMode;

impl GradMode {
    /// Whether operations on this thread should record gradient history
    #[inline]
    pub fn is_enabled() -> bool {
        GRAD_MODE.get()
    }

    /// Set the gradient-recording flag for this thread
    #[inline]
    pub fn set_enabled(enabled: bool) {
        GRAD_MODE.set(enabled);
    }
}

/// RAII guard that installs a gradient mode and restores the previous one
pub struct AutoGradMode {
    prev: bool,
}

impl AutoGradMode {
    /// Set the thread's gradient mode for the guard's lifetime
    pub fn new(enabled: bool) -> Self {
        let prev = GradMode::is_enabled();
        GradMode::set_enabled(enabled);
        Self { prev }
    }
}

impl Drop for AutoGradMode {
    fn drop(&mut self) {
        GradMode::set_enabled(self.prev);
    }
}

static ANOMALY_MODE: AtomicBool = AtomicBool::new(false);

/// Process-wide anomaly detection flag
///
/// When enabled, the engine checks every node output for NaNs (with gradient
/// mode disabled during the scan) and fails the backward pass naming the
/// offending function, printing its forward stack if the node captured one.
pub struct AnomalyMode;

impl AnomalyMode {
    /// Whether anomaly detection is on
    #[inline]
    pub fn is_enabled() -> bool {
        ANOMALY_MODE.load(Ordering::Relaxed)
    }

    /// Turn anomaly detection on or off
    #[inline]
    pub fn set_enabled(enabled: bool) {
        ANOMALY_MODE.store(enabled, Ordering::Relaxed);
    }
}
