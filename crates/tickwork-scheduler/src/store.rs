use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A persisted task as the store sees it: every field is text.
///
/// Encoding and decoding live in [`crate::bridge`]; stores never interpret
/// anything but `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identity, primary key.
    pub hash: String,
    /// Function name.
    pub name: String,
    /// JSON array of string arguments.
    pub params: String,
    /// Interval between runs, humantime format.
    pub duration: String,
    /// RFC 3339, empty if never run.
    pub last_run: String,
    /// RFC 3339.
    pub next_run: String,
    /// `"1"` for recurring tasks, `"0"` otherwise.
    pub is_recurring: String,
}

/// Durable mirror of the scheduler's task registry, keyed by hash.
pub trait TaskStore: Send + Sync {
    /// Insert the record unless one with the same hash exists.
    fn add(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Overwrite `last_run` / `next_run` of an existing record. No-op if absent.
    fn update(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Every stored record.
    fn fetch(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Delete by hash. No-op if absent.
    fn remove(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Release underlying resources. Later calls fail with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    fn add(&self, record: &TaskRecord) -> Result<(), StoreError> {
        (**self).add(record)
    }
    fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        (**self).update(record)
    }
    fn fetch(&self) -> Result<Vec<TaskRecord>, StoreError> {
        (**self).fetch()
    }
    fn remove(&self, record: &TaskRecord) -> Result<(), StoreError> {
        (**self).remove(record)
    }
    fn close(&self) -> Result<(), StoreError> {
        (**self).close()
    }
}

/// Process-local store. Records vanish with the process.
pub struct MemoryStore {
    /// `None` once closed.
    records: Mutex<Option<BTreeMap<String, TaskRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Some(BTreeMap::new())),
        }
    }

    fn with_records<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, TaskRecord>) -> T,
    ) -> Result<T, StoreError> {
        let mut guard = self.records.lock().expect("memory store poisoned");
        let records = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(f(records))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore for MemoryStore {
    fn add(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.with_records(|records| {
            records
                .entry(record.hash.clone())
                .or_insert_with(|| record.clone());
        })
    }

    fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.with_records(|records| {
            if let Some(existing) = records.get_mut(&record.hash) {
                existing.last_run = record.last_run.clone();
                existing.next_run = record.next_run.clone();
            }
        })
    }

    fn fetch(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.with_records(|records| records.values().cloned().collect())
    }

    fn remove(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.with_records(|records| {
            records.remove(&record.hash);
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        self.records.lock().expect("memory store poisoned").take();
        Ok(())
    }
}
