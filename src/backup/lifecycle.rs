//! Per-point state machine shared by collect and backup points:
//! check frequency, lock, run, release, persist, notify.

use super::frequency::Frequency;
use super::hooks::{dispatch, HookBinding, HookEvent};
use super::info::{InfoKey, PointInfo};
use super::lock::Lock;
use super::{BackupOutcomes, CollectOutcomes, PointRun, PointState, RunContext};
use crate::storage::InfoStore;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// The point-specific work run while the lock is held.
#[async_trait]
pub(crate) trait Pipeline: Send + Sync {
    async fn execute(&self, ctx: &RunContext, info: &mut PointInfo) -> Result<()>;
}

pub(crate) struct Lifecycle<'a> {
    pub label: String,
    pub key: InfoKey,
    pub store: &'a dyn InfoStore,
    pub frequency: Frequency,
    pub lock_dir: &'a Path,
    pub hooks: &'a [HookBinding],
}

impl Lifecycle<'_> {
    pub async fn run(&self, ctx: &RunContext, force: bool, pipeline: &dyn Pipeline) -> PointRun {
        let label = self.label.as_str();

        // Checking
        let mut info = match self.store.get_info(&self.key).await {
            Ok(info) => info,
            Err(e) => {
                ctx.log.error(label, format!("cannot load status record: {:#}", e));
                return self.finish(ctx, PointState::Failed, false).await;
            }
        };
        if !force && !self.frequency.is_due(ctx.now, info.last_success) {
            ctx.log.info(label, "up to date, skipped");
            return PointRun {
                state: PointState::Skipped,
                success: info.last_state_valid != Some(false),
            };
        }

        // Locking: contention leaves the persisted history untouched.
        let mut lock = Lock::new(self.lock_dir);
        if !lock.acquire(ctx.lock_timeout).await {
            ctx.log.error(label, format!("locked by another run ({})", lock.path().display()));
            return self.finish(ctx, PointState::LockFailed, false).await;
        }

        // Running
        dispatch(
            self.hooks,
            HookEvent::BeforeBackup,
            &ctx.log,
            &CollectOutcomes::new(),
            &BackupOutcomes::new(),
        )
        .await;
        let outcome = pipeline.execute(ctx, &mut info).await;

        // Finalize
        if let Err(e) = lock.release() {
            ctx.log.warn(label, e.to_string());
        }
        let mut success = match outcome {
            Ok(()) => {
                info.record_success(ctx.now);
                ctx.log.info(label, "backup succeeded");
                true
            }
            Err(e) => {
                let message = format!("{:#}", e);
                ctx.log.error(label, format!("backup failed: {}", message));
                info.record_failure(ctx.now, message);
                false
            }
        };

        if ctx.dry_run {
            debug!("Dry run, status of {} not saved", label);
        } else if let Err(e) = self.store.set_info(&self.key, &info).await {
            ctx.log.error(label, format!("cannot save status record: {:#}", e));
            success = false;
        }

        let state = if success {
            PointState::Succeeded
        } else {
            PointState::Failed
        };
        self.finish(ctx, state, success).await
    }

    async fn finish(&self, ctx: &RunContext, state: PointState, success: bool) -> PointRun {
        let (collect, backup) = self.outcomes(success);
        dispatch(self.hooks, HookEvent::outcome(success), &ctx.log, &collect, &backup).await;
        dispatch(self.hooks, HookEvent::AfterBackup, &ctx.log, &collect, &backup).await;
        PointRun { state, success }
    }

    fn outcomes(&self, success: bool) -> (CollectOutcomes, BackupOutcomes) {
        match &self.key {
            InfoKey::Collect(name) => (CollectOutcomes::from([(name.clone(), success)]), BackupOutcomes::new()),
            InfoKey::Backup { backup, collect } => (
                CollectOutcomes::new(),
                BackupOutcomes::from([((backup.clone(), collect.clone()), success)]),
            ),
        }
    }
}
