//! `tickwork-core`: configuration and error types shared by the tickwork crates.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, SchedulerConfig, TickworkConfig};
pub use error::{Result, TickworkError};
