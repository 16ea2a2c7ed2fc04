//! Stream and event handles, plus the thread-local current stream

use super::Device;
use std::cell::Cell;

/// An ordered queue of work on a device
///
/// Streams are opaque handles; their ordering semantics live in the
/// registered [`DeviceRuntime`](super::DeviceRuntime). The engine compares
/// streams for identity and passes them back to the runtime for event
/// recording and waiting.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Stream {
    device: Device,
    id: u64,
}

impl Stream {
    /// Create a stream handle on the given device
    pub fn new(device: Device, id: u64) -> Self {
        Self { device, id }
    }

    /// The device this stream belongs to
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// The runtime-assigned stream id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A marker recorded on one stream that another stream can wait on
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    stream: Stream,
    id: u64,
}

impl Event {
    /// Create an event handle recorded on `stream`
    pub fn new(stream: Stream, id: u64) -> Self {
        Self { stream, id }
    }

    /// The stream this event was recorded on
    #[inline]
    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// The runtime-assigned event id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

thread_local! {
    static CURRENT_STREAM: Cell<Option<Stream>> = const { Cell::new(None) };
}

/// The stream operator launches on this thread are ordered by, if any
pub fn current_stream() -> Option<Stream> {
    CURRENT_STREAM.get()
}

/// Scoped selection of the current stream
///
/// Installs a stream as the thread's current stream and restores the
/// previous value on drop. Constructing the guard with `None` is a no-op,
/// so a node without a recorded forward stream costs nothing.
pub struct StreamGuard {
    prev: Option<Option<Stream>>,
}

impl StreamGuard {
    /// Install `stream` as the current stream for the guard's lifetime
    pub fn new(stream: Option<Stream>) -> Self {
        match stream {
            Some(stream) => Self {
                prev: Some(CURRENT_STREAM.replace(Some(stream))),
            },
            None => Self { prev: None },
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            CURRENT_STREAM.set(prev);
        }
    }
}
