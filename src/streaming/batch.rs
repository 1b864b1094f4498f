//! Byte-budgeted batch accumulators.
//!
//! Record batches are measured by serialized JSON length, asset batches by
//! raw chunk bytes. A batch reports full once its size reaches the threshold;
//! the owner flushes it with `take()`, which leaves it empty.

use serde::Serialize;
use serde_json::value::{to_raw_value, RawValue};

use crate::error::Result;
use crate::streaming::protocol::AssetEvent;

/// Records waiting to go out as one `stream` event
#[derive(Debug)]
pub struct RecordBatch {
    records: Vec<Box<RawValue>>,
    /// Sum of the serialized record lengths
    content_len: usize,
    threshold: usize,
}

impl RecordBatch {
    pub fn new(threshold: usize) -> Self {
        Self {
            records: Vec::new(),
            content_len: 0,
            threshold,
        }
    }

    /// Serialize and append a record. Returns true when the batch is full.
    pub fn push<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<bool> {
        let raw = to_raw_value(record)?;
        self.content_len += raw.get().len();
        self.records.push(raw);
        Ok(self.is_full())
    }

    /// Length of the batch serialized as a compact JSON array
    pub fn json_len(&self) -> usize {
        // brackets + separating commas
        2 + self.content_len + self.records.len().saturating_sub(1)
    }

    pub fn is_full(&self) -> bool {
        self.json_len() >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn take(&mut self) -> Vec<Box<RawValue>> {
        self.content_len = 0;
        std::mem::take(&mut self.records)
    }
}

/// Asset sub-events waiting to go out as one `stream` event of the assets step
#[derive(Debug)]
pub struct AssetBatch {
    events: Vec<AssetEvent>,
    data_len: usize,
    threshold: usize,
}

impl AssetBatch {
    pub fn new(threshold: usize) -> Self {
        Self {
            events: Vec::new(),
            data_len: 0,
            threshold,
        }
    }

    /// Append a sub-event. Returns true when the accumulated chunk bytes reach
    /// the threshold.
    pub fn push(&mut self, event: AssetEvent) -> bool {
        self.data_len += event.data_len();
        self.events.push(event);
        self.is_full()
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn is_full(&self) -> bool {
        self.data_len >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn take(&mut self) -> Vec<AssetEvent> {
        self.data_len = 0;
        std::mem::take(&mut self.events)
    }
}
