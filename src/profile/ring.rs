//! Fixed-capacity sample history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bounded ring of `(value, timestamp)` samples indexed by insertion
/// position. Memory is fixed at `capacity` entries; the oldest sample is
/// overwritten once full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRing {
    capacity: usize,
    samples: Vec<(f64, DateTime<Utc>)>,
    head: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Vec::new(),
            head: 0,
        }
    }

    pub fn push(&mut self, value: f64, ts: DateTime<Utc>) {
        if self.samples.len() < self.capacity {
            self.samples.push((value, ts));
        } else {
            self.samples[self.head] = (value, ts);
        }
        self.head = (self.head + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in chronological order, oldest first.
    pub fn ordered(&self) -> Vec<(f64, DateTime<Utc>)> {
        if self.samples.len() < self.capacity {
            return self.samples.clone();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.samples[self.head..]);
        out.extend_from_slice(&self.samples[..self.head]);
        out
    }

    /// Count of samples with timestamps at or after `since`.
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.samples.iter().filter(|(_, ts)| *ts >= since).count()
    }
}
