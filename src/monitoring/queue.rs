//! Bounded per-item value queue.

use std::collections::VecDeque;

use super::SubscriptionDiagnostics;
use crate::types::DataValue;

/// Holds values that passed the filter until the next notification cycle.
#[derive(Debug, Clone)]
pub struct ItemQueue {
    values: VecDeque<DataValue>,
    capacity: usize,
    discard_oldest: bool,
}

impl ItemQueue {
    /// A queue size of 0 is treated as 1.
    pub fn new(size: u32, discard_oldest: bool) -> Self {
        let capacity = (size as usize).max(1);
        Self {
            values: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            discard_oldest,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Add a value, applying the discard policy when full.
    ///
    /// Returns `true` if a value was discarded.
    pub fn enqueue(&mut self, mut value: DataValue, diagnostics: &SubscriptionDiagnostics) -> bool {
        if self.values.len() < self.capacity {
            self.values.push_back(value);
            return false;
        }

        if self.capacity == 1 {
            // a single slot cannot signal overflow
            value.status = value.status.with_overflow(false);
            self.values.clear();
            self.values.push_back(value);
            return true;
        }

        value.status = value.status.with_overflow(true);
        diagnostics.record_overflow();

        if self.discard_oldest {
            self.values.pop_front();
            self.values.push_back(value);
        } else if let Some(newest) = self.values.back_mut() {
            *newest = value;
        }

        true
    }

    /// Change the size and discard policy, trimming values according to the new policy.
    pub fn resize(&mut self, size: u32, discard_oldest: bool) {
        self.capacity = (size as usize).max(1);
        self.discard_oldest = discard_oldest;

        while self.values.len() > self.capacity {
            if discard_oldest {
                self.values.pop_front();
            } else {
                self.values.pop_back();
            }
        }
    }

    pub fn drain(&mut self) -> Vec<DataValue> {
        self.values.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataValue> {
        self.values.iter()
    }
}
