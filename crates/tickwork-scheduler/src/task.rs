use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::invoker::Invoker;

/// Content-derived task identity: lowercase hex SHA-256.
///
/// Returned by every scheduling call and accepted by `cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// When a task runs and when it last ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub is_recurring: bool,
    /// `None` until the first execution.
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    /// Time between two runs. Zero for one-shot tasks.
    pub interval: Duration,
}

impl Schedule {
    pub fn once(at: DateTime<Utc>) -> Self {
        Self {
            is_recurring: false,
            last_run: None,
            next_run: at,
            interval: Duration::ZERO,
        }
    }

    pub fn every(interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            is_recurring: true,
            last_run: None,
            next_run: add_interval(now, interval),
            interval,
        }
    }
}

/// A named callback, its string arguments and its schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub function: String,
    pub params: Vec<String>,
    pub schedule: Schedule,
}

impl Task {
    /// One-shot task due at `at`.
    pub fn once(function: impl Into<String>, params: Vec<String>, at: DateTime<Utc>) -> Self {
        Self::with_schedule(function, params, Schedule::once(at))
    }

    /// Recurring task first due one `interval` after `now`.
    pub fn every(
        function: impl Into<String>,
        params: Vec<String>,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_schedule(function, params, Schedule::every(interval, now))
    }

    pub fn with_schedule(
        function: impl Into<String>,
        params: Vec<String>,
        schedule: Schedule,
    ) -> Self {
        Self {
            function: function.into(),
            params,
            schedule,
        }
    }

    /// Digest over function name, params, interval and recurrence flag.
    ///
    /// Timestamps are excluded so a task keeps its identity as it runs. Every
    /// variable-length field is length-prefixed, so `("ab", ["c"])` and
    /// `("a", ["bc"])` hash differently.
    pub fn id(&self) -> TaskId {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, self.function.as_bytes());
        hasher.update((self.params.len() as u64).to_le_bytes());
        for param in &self.params {
            write_field(&mut hasher, param.as_bytes());
        }
        hasher.update(self.schedule.interval.as_nanos().to_le_bytes());
        hasher.update([u8::from(self.schedule.is_recurring)]);
        TaskId(hex::encode(hasher.finalize()))
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.is_recurring
    }

    /// True once `now` has reached `next_run`. Equality counts as due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.schedule.next_run
    }

    /// Advance a recurring task by one interval, measured from the previous
    /// `next_run` rather than from the wall clock. One-shot tasks are untouched.
    pub fn schedule_next_run(&mut self) {
        if !self.schedule.is_recurring {
            return;
        }
        let previous = self.schedule.next_run;
        self.schedule.last_run = Some(previous);
        self.schedule.next_run = add_interval(previous, self.schedule.interval);
    }

    /// Run the callback through `invoker`. Failures are logged, never returned.
    pub async fn execute(&self, invoker: &dyn Invoker) {
        debug!(function = %self.function, args = self.params.len(), "invoking task");
        if let Err(e) = invoker.invoke(&self.function, &self.params).await {
            error!(function = %self.function, error = %e, "task execution failed");
        }
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// `at + interval`, saturating at the largest representable instant.
pub(crate) fn add_interval(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(interval)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
