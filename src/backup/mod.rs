pub mod drivers;
pub mod filters;
pub mod frequency;
pub mod hooks;
pub mod info;
pub mod lifecycle;
pub mod lock;
pub mod matcher;
pub mod point;
pub mod registry;
pub mod rsync;
pub mod runner;
pub mod sources;
pub mod transport;
pub mod variables;

#[cfg(test)]
pub(crate) mod testing;

pub use drivers::BackupDriver;
pub use filters::FileFilter;
pub use frequency::Frequency;
pub use hooks::{Hook, HookBinding, HookEvent};
pub use info::{InfoKey, PointInfo};
pub use lock::Lock;
pub use matcher::{can_associate, TagPatterns, TagPolicy};
pub use point::{BackupPoint, CollectPoint};
pub use runner::{BackupRequest, RestoreRequest, RunReport, Runner};
pub use sources::Source;

use crate::utils::log_buffer::RunLog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome per collect point name.
pub type CollectOutcomes = BTreeMap<String, bool>;

/// Outcome per `(backup point, collect point)` pair.
pub type BackupOutcomes = BTreeMap<(String, String), bool>;

/// Shared settings of one runner pass.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub now: DateTime<Utc>,
    pub dry_run: bool,
    pub lock_timeout: Duration,
    pub log: RunLog,
}

impl RunContext {
    pub fn new(dry_run: bool, lock_timeout: Duration, log: RunLog) -> Self {
        Self {
            now: Utc::now(),
            dry_run,
            lock_timeout,
            log,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PointState {
    Idle,
    Checking,
    Skipped,
    Locking,
    LockFailed,
    Running,
    Succeeded,
    Failed,
}

/// Result of one point lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointRun {
    pub state: PointState,
    pub success: bool,
}
