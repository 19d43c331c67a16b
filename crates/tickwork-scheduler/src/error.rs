use thiserror::Error;

/// Failures reported by a [`crate::store::TaskStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The store was closed and can no longer be used.
    #[error("Store is closed")]
    Closed,

    /// Any other backend failure.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by an [`crate::invoker::Invoker`] while running a callback.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Unknown function: {function}")]
    UnknownFunction { function: String },

    #[error("Function {function} expects {expected} argument(s), got {got}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("Function {function} failed: {reason}")]
    Failed { function: String, reason: String },
}

/// Rejected [`crate::invoker::FunctionRegistry::register`] calls.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Function name must not be empty")]
    EmptyName,

    #[error("Function already registered: {name}")]
    Duplicate { name: String },
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The function reference is empty or unknown to the invoker.
    #[error("Cannot resolve function: {function:?}")]
    FunctionResolution { function: String },

    /// No task with the given identity is registered.
    #[error("Task not found: {id}")]
    NotFound { id: String },

    /// A store operation failed.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    /// A persisted record could not be decoded back into a task.
    #[error("Corrupt task record {hash}: {reason}")]
    CorruptRecord { hash: String, reason: String },

    /// The invoker failed to run a callback.
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// Recurring tasks need a non-zero interval.
    #[error("Recurring interval must be greater than zero")]
    InvalidInterval,

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Scheduler already stopped")]
    AlreadyStopped,
}

impl SchedulerError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::FunctionResolution { .. } => "FUNCTION_RESOLUTION",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SchedulerError::CorruptRecord { .. } => "CORRUPT_RECORD",
            SchedulerError::Invocation(_) => "INVOCATION_FAILED",
            SchedulerError::InvalidInterval => "INVALID_INTERVAL",
            SchedulerError::AlreadyStarted => "ALREADY_STARTED",
            SchedulerError::AlreadyStopped => "ALREADY_STOPPED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
