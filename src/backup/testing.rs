//! Test doubles for sources, drivers and hooks.

use super::drivers::BackupDriver;
use super::hooks::{Hook, HookEvent};
use super::info::PointInfo;
use super::sources::Source;
use super::variables::Variables;
use super::{BackupOutcomes, CollectOutcomes, RunContext};
use crate::utils::log_buffer::{LogEntry, RunLog};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn ctx() -> RunContext {
    RunContext::new(false, Duration::from_millis(50), RunLog::default())
}

pub struct FailingSource;

#[async_trait]
impl Source for FailingSource {
    fn name(&self) -> &str {
        "failing"
    }

    fn engine(&self) -> &'static str {
        "test"
    }

    async fn backup(&self, _import_path: &Path, _ctx: &RunContext) -> Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn restore(&self, _import_path: &Path, _ctx: &RunContext) -> Result<()> {
        anyhow::bail!("connection refused")
    }
}

/// Counts invocations and records which collect point each backup was for.
#[derive(Clone, Default)]
pub struct CountingDriver {
    pub backups: Arc<Mutex<Vec<String>>>,
    pub restores: Arc<AtomicUsize>,
}

#[async_trait]
impl BackupDriver for CountingDriver {
    fn engine(&self) -> &'static str {
        "counting"
    }

    fn describe(&self) -> String {
        "counting driver".to_string()
    }

    async fn backup(
        &self,
        _export_path: &Path,
        variables: &Variables,
        _info: &mut PointInfo,
        _ctx: &RunContext,
    ) -> Result<()> {
        let name = variables.get("name").cloned().unwrap_or_default();
        self.backups.lock().push(name);
        Ok(())
    }

    async fn restore(&self, _export_path: &Path, _info: &PointInfo, _ctx: &RunContext) -> Result<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHook {
    calls: Mutex<Vec<(HookEvent, CollectOutcomes, BackupOutcomes)>>,
}

impl RecordingHook {
    pub fn events(&self) -> Vec<HookEvent> {
        self.calls.lock().iter().map(|(event, _, _)| *event).collect()
    }

    pub fn calls(&self) -> Vec<(HookEvent, CollectOutcomes, BackupOutcomes)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Hook for RecordingHook {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn call(
        &self,
        event: HookEvent,
        _output: &[LogEntry],
        collect: &CollectOutcomes,
        backup: &BackupOutcomes,
    ) -> Result<()> {
        self.calls.lock().push((event, collect.clone(), backup.clone()));
        Ok(())
    }
}

pub struct FailingHook;

#[async_trait]
impl Hook for FailingHook {
    fn name(&self) -> &str {
        "failing-hook"
    }

    async fn call(
        &self,
        _event: HookEvent,
        _output: &[LogEntry],
        _collect: &CollectOutcomes,
        _backup: &BackupOutcomes,
    ) -> Result<()> {
        anyhow::bail!("smtp unreachable")
    }
}
