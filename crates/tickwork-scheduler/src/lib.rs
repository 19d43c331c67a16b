//! `tickwork-scheduler`: in-process task scheduler with a persistent mirror.
//!
//! # Overview
//!
//! A task is a function *name*, a list of string arguments and a schedule.
//! The [`engine::Scheduler`] keeps registered tasks in memory, sweeps them on
//! a fixed tick and dispatches every due task through an [`invoker::Invoker`].
//! Each change is mirrored to a [`store::TaskStore`] so tasks survive restarts
//! and can be shared by several schedulers pointed at the same store.
//!
//! # Task identity
//!
//! A task's id is a SHA-256 over its function name, arguments, interval and
//! recurrence flag. Timestamps are excluded, so the same logical task keeps
//! its id as it runs and two processes registering it agree on one record.
//!
//! # Stores
//!
//! | Store         | Lifetime                                   |
//! |---------------|--------------------------------------------|
//! | `MemoryStore` | Process-local, gone on exit                |
//! | `SqliteStore` | `scheduled_tasks` table in a SQLite file   |

pub mod bridge;
pub mod db;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod store;
pub mod task;

pub use bridge::StoreBridge;
pub use db::SqliteStore;
pub use engine::Scheduler;
pub use error::{InvocationError, RegistrationError, Result, SchedulerError, StoreError};
pub use invoker::{FunctionRegistry, Invoker};
pub use store::{MemoryStore, TaskRecord, TaskStore};
pub use task::{Schedule, Task, TaskId};
