//! Bounded, most-recent-first record store.
//!
//! A single mutex guards the deque. Every operation holds it for at most one
//! splice or one O(capacity) copy, and never across an `.await`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::models::SensorRecord;

// ---

pub const DEFAULT_MAX_RECORDS: usize = 100;

#[derive(Debug)]
pub struct RecordStore {
    // ---
    capacity: usize,
    records: Mutex<VecDeque<Arc<SensorRecord>>>,
}

impl RecordStore {
    // ---
    /// Create an empty store. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity + 1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert at the front, evicting from the back down to capacity.
    ///
    /// Refuses to touch a store already found above capacity rather than
    /// trimming it silently.
    pub fn append(&self, record: Arc<SensorRecord>) -> Result<(), StoreError> {
        // ---
        let mut records = self.lock();
        if records.len() > self.capacity {
            let err = StoreError::CapacityInvariantViolation {
                len: records.len(),
                capacity: self.capacity,
            };
            tracing::error!("Record store invariant broken: {}", err);
            return Err(err);
        }

        records.push_front(record);
        records.truncate(self.capacity);
        Ok(())
    }

    /// Independent copy of the current contents, most recent first.
    pub fn snapshot(&self) -> Vec<Arc<SensorRecord>> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Bypass the capacity check to simulate a corrupted store.
    #[cfg(test)]
    pub(crate) fn force_extend(&self, records: impl IntoIterator<Item = Arc<SensorRecord>>) {
        self.lock().extend(records);
    }

    // Mutations are single splices, so a panicking holder cannot leave the
    // deque half-updated.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<SensorRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}
