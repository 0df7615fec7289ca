use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::serial::PinStatus;

pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// A status observed at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Device that produced the status; `None` when no device was reachable.
    pub device: Option<DeviceId>,
    pub status: PinStatus,
    pub time: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(device: Option<DeviceId>, status: PinStatus, time: DateTime<Utc>) -> Self {
        Self { device, status, time }
    }
}

/// Bounded status history, oldest entries evicted first.
///
/// Appends and eviction happen under one lock, so concurrent writers never
/// push the store past its capacity.
#[derive(Debug)]
pub struct HistoryStore {
    capacity: usize,
    records: Mutex<VecDeque<StatusRecord>>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, record: StatusRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    /// Copy of the retained records, oldest first.
    pub fn snapshot(&self) -> Vec<StatusRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
