//! FIFO of random units fed by an entropy source.
//!
//! The buffer is the adapter between push-style delivery (chunks arriving
//! whenever the source has them) and pull-style consumption (one trial per
//! clock tick). Units leave in exactly the order they arrived: no reordering,
//! no duplication, and no unit is ever handed out twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

/// A batch of units delivered by an entropy source.
#[derive(Debug, Clone)]
pub struct BitChunk {
    pub arrival: Instant,
    pub source_label: String,
    /// Ordered 0/1 units.
    pub units: Vec<u8>,
}

impl BitChunk {
    /// Stamp a new chunk with the current time.
    pub fn new(source_label: impl Into<String>, units: Vec<u8>) -> Self {
        Self {
            arrival: Instant::now(),
            source_label: source_label.into(),
            units,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// One buffered unit together with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit {
    pub value: u8,
    /// Position in the stream of every unit ever pushed into this buffer.
    pub global_index: u64,
    /// Sequence number of the chunk the unit arrived in.
    pub chunk: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer underrun: requested {requested} units, {available} available")]
    Underrun { requested: usize, available: usize },
}

/// Arrival-ordered unit queue with per-chunk source labels.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    units: VecDeque<Unit>,
    labels: Vec<Arc<str>>,
    total_pushed: u64,
    total_popped: u64,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk's units in order. Returns the number of units appended.
    pub fn push(&mut self, chunk: BitChunk) -> usize {
        let chunk_id = self.labels.len() as u32;
        self.labels.push(Arc::from(chunk.source_label.as_str()));
        let n = chunk.units.len();
        for value in chunk.units {
            self.units.push_back(Unit {
                value,
                global_index: self.total_pushed,
                chunk: chunk_id,
            });
            self.total_pushed += 1;
        }
        n
    }

    /// Units currently available.
    pub fn depth(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Remove and return the oldest `count` units.
    ///
    /// Fails without consuming anything when fewer than `count` are buffered.
    pub fn pop(&mut self, count: usize) -> Result<Vec<Unit>, BufferError> {
        if self.units.len() < count {
            return Err(BufferError::Underrun {
                requested: count,
                available: self.units.len(),
            });
        }
        self.total_popped += count as u64;
        Ok(self.units.drain(..count).collect())
    }

    /// Source label of the chunk a unit came from.
    pub fn label(&self, unit: &Unit) -> &str {
        self.labels
            .get(unit.chunk as usize)
            .map(|l| l.as_ref())
            .unwrap_or("")
    }

    pub fn chunks_received(&self) -> usize {
        self.labels.len()
    }

    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    pub fn total_popped(&self) -> u64 {
        self.total_popped
    }
}
