//! Bounded delivery log.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::types::{DeliveryFilter, DeliveryRecord};

/// Append-only ring buffer of delivery attempts. When full, the oldest record is dropped.
#[derive(Debug)]
pub struct DeliveryLog {
    records: Mutex<VecDeque<DeliveryRecord>>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeliveryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, record: DeliveryRecord) {
        let mut records = self.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Matching records, newest first.
    pub fn list(&self, filter: &DeliveryFilter) -> Vec<DeliveryRecord> {
        let records = self.lock();
        let matching = records.iter().rev().filter(|r| filter.matches(r)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
