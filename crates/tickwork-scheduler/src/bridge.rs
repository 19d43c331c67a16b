//! Translation between [`Task`] and the all-text [`TaskRecord`].
//!
//! | Field          | Encoding                                   |
//! |----------------|--------------------------------------------|
//! | `is_recurring` | `"1"` / `"0"`                              |
//! | `last_run`     | RFC 3339 UTC, `""` when never run          |
//! | `next_run`     | RFC 3339 UTC                               |
//! | `duration`     | humantime (`"5s"`, `"1h 30m"`)             |
//! | `params`       | JSON array of strings                      |
//!
//! Timestamps keep their sub-second digits so decoding is exact.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::store::{TaskRecord, TaskStore};
use crate::task::{Schedule, Task, TaskId};

/// A decoded record together with the hash it was stored under.
///
/// The two only differ when a row was edited outside the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTask {
    pub hash: TaskId,
    pub task: Task,
}

/// Result of [`StoreBridge::fetch`].
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Records that decoded cleanly.
    pub tasks: Vec<StoredTask>,
    /// Stored hash of every fetched record, corrupt ones included.
    pub hashes: HashSet<TaskId>,
}

/// Stateless adapter from tasks to a [`TaskStore`].
#[derive(Clone)]
pub struct StoreBridge {
    store: Arc<dyn TaskStore>,
}

impl StoreBridge {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn add(&self, task: &Task) -> Result<()> {
        Ok(self.store.add(&encode(task))?)
    }

    pub fn update(&self, task: &Task) -> Result<()> {
        Ok(self.store.update(&encode(task))?)
    }

    pub fn remove(&self, task: &Task) -> Result<()> {
        Ok(self.store.remove(&encode(task))?)
    }

    /// Delete the row stored under `hash`, whatever its content hashes to.
    pub fn remove_stale(&self, hash: &TaskId, task: &Task) -> Result<()> {
        let mut record = encode(task);
        record.hash = hash.to_string();
        Ok(self.store.remove(&record)?)
    }

    /// Fetch and decode every record. Corrupt records are logged and skipped.
    pub fn fetch(&self) -> Result<Snapshot> {
        let records = self.store.fetch()?;
        let mut snapshot = Snapshot::default();
        for record in &records {
            let hash = TaskId::new(record.hash.clone());
            snapshot.hashes.insert(hash.clone());
            match decode(record) {
                Ok(task) => snapshot.tasks.push(StoredTask { hash, task }),
                Err(e) => warn!(hash = %record.hash, error = %e, "skipping corrupt task record"),
            }
        }
        Ok(snapshot)
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.store.close()?)
    }
}

/// Task → record.
pub fn encode(task: &Task) -> TaskRecord {
    let schedule = &task.schedule;
    TaskRecord {
        hash: task.id().to_string(),
        name: task.function.clone(),
        params: serde_json::Value::from(task.params.clone()).to_string(),
        duration: humantime::format_duration(schedule.interval).to_string(),
        last_run: schedule.last_run.map(format_time).unwrap_or_default(),
        next_run: format_time(schedule.next_run),
        is_recurring: if schedule.is_recurring { "1" } else { "0" }.to_string(),
    }
}

/// Record → task. Fails with [`SchedulerError::CorruptRecord`] on any bad field.
pub fn decode(record: &TaskRecord) -> Result<Task> {
    let corrupt = |reason: String| SchedulerError::CorruptRecord {
        hash: record.hash.clone(),
        reason,
    };

    let params: Vec<String> = serde_json::from_str(&record.params)
        .map_err(|e| corrupt(format!("params {:?}: {e}", record.params)))?;
    let interval = humantime::parse_duration(record.duration.trim())
        .map_err(|e| corrupt(format!("duration {:?}: {e}", record.duration)))?;
    let last_run = match record.last_run.trim() {
        "" => None,
        raw => Some(parse_time(raw).map_err(|e| corrupt(format!("last_run {raw:?}: {e}")))?),
    };
    let next_run = parse_time(record.next_run.trim())
        .map_err(|e| corrupt(format!("next_run {:?}: {e}", record.next_run)))?;
    let is_recurring = match record.is_recurring.trim() {
        "1" | "true" => true,
        "0" | "false" => false,
        other => return Err(corrupt(format!("is_recurring {other:?}"))),
    };

    Ok(Task::with_schedule(
        record.name.clone(),
        params,
        Schedule {
            is_recurring,
            last_run,
            next_run,
            interval,
        },
    ))
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        // RFC 3339 stops at year 9999; later instants are written as `+YYYYY-...Z`.
        Err(e) => match raw.strip_suffix('Z') {
            Some(naive) if naive.starts_with(['+', '-']) => {
                NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|dt| Utc.from_utc_datetime(&dt))
            }
            _ => Err(e),
        },
    }
}
