//! Per-node accumulator for incoming gradient contributions

use crate::device::{device_runtime, Device, Stream, StreamGuard};
use crate::error::Result;
use crate::graph::GradList;
use crate::tensor::Tensor;

/// Slot-indexed accumulator gathering gradient contributions for one node
///
/// One slot per consumer input. The first contribution to a slot is stored;
/// later contributions are summed in. When producer and consumer ran on
/// different streams, the consumer stream is made to wait on an event
/// recorded on the producer stream before the value is touched, and the
/// accumulation itself runs under the consumer stream.
#[derive(Debug, Default)]
pub struct InputBuffer {
    buffer: GradList,
}

impl InputBuffer {
    /// Create a buffer with `size` empty slots
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![None; size],
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer has zero slots
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Accumulate `var` into slot `pos` under stream-ordered synchronization
    ///
    /// An undefined contribution (`None`) is dropped; the slot keeps whatever
    /// it already holds.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is out of bounds.
    pub fn add(
        &mut self,
        pos: usize,
        var: Option<Tensor>,
        producer_stream: Option<Stream>,
        consumer_stream: Option<Stream>,
    ) -> Result<()> {
        assert!(
            pos < self.buffer.len(),
            "input buffer slot {} out of range ({} slots)",
            pos,
            self.buffer.len()
        );
        let Some(var) = var else {
            return Ok(());
        };

        // Producer-before-consumer ordering on the consumer stream.
        if let (Some(producer), Some(consumer)) = (producer_stream, consumer_stream) {
            if producer != consumer {
                let producer_runtime = device_runtime(producer.device().device_type());
                let consumer_runtime = device_runtime(consumer.device().device_type());
                if let (Some(producer_runtime), Some(consumer_runtime)) =
                    (producer_runtime, consumer_runtime)
                {
                    let event = producer_runtime.record_event(producer);
                    consumer_runtime.wait_event(consumer, event);
                }
            }
        }

        match self.buffer[pos].take() {
            None => self.buffer[pos] = Some(var),
            Some(prev) => {
                let _stream_guard = StreamGuard::new(consumer_stream);
                self.buffer[pos] = Some(prev.add(&var)?);
            }
        }
        Ok(())
    }

    /// The device the consuming node should be scheduled on
    ///
    /// CPU if any populated slot is on the CPU, otherwise the device of the
    /// first populated accelerator slot, otherwise CPU.
    pub fn device(&self) -> Device {
        let mut first_accelerator = None;
        for slot in self.buffer.iter().flatten() {
            if slot.device().is_cpu() {
                return Device::cpu();
            }
            if first_accelerator.is_none() {
                first_accelerator = Some(slot.device());
            }
        }
        first_accelerator.unwrap_or_else(Device::cpu)
    }

    /// Read a slot without draining the buffer
    pub(crate) fn get(&self, pos: usize) -> &Option<Tensor> {
        &self.buffer[pos]
    }

    /// Drain into a gradient list; empty slots stay `None`
    pub fn into_variables(self) -> GradList {
        self.buffer
    }
}
