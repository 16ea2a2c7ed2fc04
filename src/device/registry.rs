//! Registry of per-device-type runtimes
//!
//! The engine discovers accelerator capabilities (device counts, streams,
//! events) through runtimes registered here. CPU needs no runtime: it has no
//! streams and its worker is driven by the calling thread.

use super::{Device, DeviceType, Event, Stream, MAX_DEVICE_TYPES};
use parking_lot::RwLock;
use std::sync::Arc;

/// Per-device-type runtime the engine uses for scheduling
///
/// Implementations wrap a real accelerator runtime (CUDA, WebGPU, ...).
/// The engine only needs enough surface to count devices, pin a worker
/// thread to one, and order producer/consumer streams with events.
pub trait DeviceRuntime: Send + Sync {
    /// Number of devices of this type present on the machine
    fn device_count(&self) -> i32;

    /// Make `index` the active device for the calling thread
    fn set_device(&self, index: i32);

    /// The default stream of `device`
    fn default_stream(&self, device: Device) -> Stream;

    /// Record an event on `stream`
    fn record_event(&self, stream: Stream) -> Event;

    /// Make `stream` wait until `event` has been reached
    fn wait_event(&self, stream: Stream, event: Event);
}

static DEVICE_RUNTIMES: RwLock<[Option<Arc<dyn DeviceRuntime>>; MAX_DEVICE_TYPES]> =
    RwLock::new([None, None, None]);

/// Register the runtime for an accelerator device type
///
/// Replaces any previously registered runtime of the same type. Must happen
/// before the first `execute` that touches devices of this type; the engine
/// sizes its worker pool from the registered runtimes on first use.
///
/// # Panics
///
/// Panics if called with [`DeviceType::Cpu`]; the CPU takes no runtime.
pub fn register_device_runtime(device_type: DeviceType, runtime: Arc<dyn DeviceRuntime>) {
    assert!(
        device_type != DeviceType::Cpu,
        "the CPU does not take a device runtime"
    );
    DEVICE_RUNTIMES.write()[device_type as usize] = Some(runtime);
}

/// Look up the registered runtime for a device type
pub fn device_runtime(device_type: DeviceType) -> Option<Arc<dyn DeviceRuntime>> {
    DEVICE_RUNTIMES.read()[device_type as usize].clone()
}

/// Largest device count across the registered accelerator runtimes
///
/// Determines how many device worker threads the engine spawns; accelerator
/// types sharing an index share a worker.
pub(crate) fn max_device_count() -> i32 {
    let runtimes = DEVICE_RUNTIMES.read();
    DeviceType::ACCELERATORS
        .iter()
        .filter_map(|dt| runtimes[*dt as usize].as_ref())
        .map(|rt| rt.device_count())
        .max()
        .unwrap_or(0)
}
