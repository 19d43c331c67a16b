//! Demo callbacks and the schedule the `run` subcommand installs.

use std::time::Duration;

use tickwork_scheduler::{FunctionRegistry, RegistrationError, Result, Scheduler};
use tracing::info;

pub const TASK_WITHOUT_ARGS: &str = "task_without_args";
pub const TASK_WITH_ARGS: &str = "task_with_args";

/// Register the demo callbacks on `registry`.
pub fn register(registry: &FunctionRegistry) -> std::result::Result<(), RegistrationError> {
    registry.register(TASK_WITHOUT_ARGS, 0, |_| async {
        info!("task_without_args ran");
        Ok::<(), String>(())
    })?;
    registry.register(TASK_WITH_ARGS, 1, |args| async move {
        let message = args.into_iter().next().unwrap_or_default();
        info!(%message, "task_with_args ran");
        Ok::<(), String>(())
    })?;
    Ok(())
}

/// Two one-shots and two recurring tasks with different messages.
pub fn schedule(scheduler: &Scheduler) -> Result<()> {
    scheduler.run_after(Duration::from_secs(60), TASK_WITHOUT_ARGS, &[])?;
    scheduler.run_after(Duration::from_secs(30), TASK_WITH_ARGS, &["reportId"])?;
    scheduler.run_every(Duration::from_secs(5), TASK_WITH_ARGS, &["every 5 seconds"])?;
    scheduler.run_every(Duration::from_secs(10), TASK_WITH_ARGS, &["every 10 seconds"])?;
    Ok(())
}
