//! Configuration-driven backup orchestration.
//!
//! Collect points gather data from sources into a local area, backup points
//! ship that data elsewhere. Tags decide which backup points serve which
//! collect points; [`backup::Runner`] drives a whole pass.

pub mod api;
pub mod backup;
pub mod cli;
pub mod error;
pub mod storage;
pub mod utils;

pub use backup::{BackupRequest, RestoreRequest, RunReport, Runner};
pub use error::{ConfigError, LockError};
