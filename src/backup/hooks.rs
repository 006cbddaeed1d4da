use super::{BackupOutcomes, CollectOutcomes};
use crate::utils::log_buffer::{LogEntry, RunLog};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeBackup,
    BackupSuccess,
    BackupError,
    AfterBackup,
}

impl HookEvent {
    pub const ALL: [HookEvent; 4] = [
        HookEvent::BeforeBackup,
        HookEvent::BackupSuccess,
        HookEvent::BackupError,
        HookEvent::AfterBackup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeBackup => "before_backup",
            HookEvent::BackupSuccess => "backup_success",
            HookEvent::BackupError => "backup_error",
            HookEvent::AfterBackup => "after_backup",
        }
    }

    pub fn outcome(success: bool) -> Self {
        if success {
            HookEvent::BackupSuccess
        } else {
            HookEvent::BackupError
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn call(
        &self,
        event: HookEvent,
        output: &[LogEntry],
        collect: &CollectOutcomes,
        backup: &BackupOutcomes,
    ) -> Result<()>;
}

/// A hook together with the events it listens to.
#[derive(Clone)]
pub struct HookBinding {
    pub events: BTreeSet<HookEvent>,
    pub hook: Arc<dyn Hook>,
}

impl HookBinding {
    pub fn new(hook: Arc<dyn Hook>, events: impl IntoIterator<Item = HookEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            hook,
        }
    }
}

/// Calls every subscribed hook. A failing hook is logged and does not stop the others.
pub async fn dispatch(
    hooks: &[HookBinding],
    event: HookEvent,
    log: &RunLog,
    collect: &CollectOutcomes,
    backup: &BackupOutcomes,
) {
    let subscribed: Vec<_> = hooks.iter().filter(|b| b.events.contains(&event)).collect();
    if subscribed.is_empty() {
        return;
    }
    let output = log.get_logs(None);
    for binding in subscribed {
        debug!("Calling hook {} for {}", binding.hook.name(), event);
        if let Err(e) = binding.hook.call(event, &output, collect, backup).await {
            log.warn(binding.hook.name(), format!("hook failed on {}: {:#}", event, e));
        }
    }
}

/// Names of every failed point or pair, for summaries.
pub fn failures(collect: &CollectOutcomes, backup: &BackupOutcomes) -> Vec<String> {
    collect
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(name, _)| name.clone())
        .chain(
            backup
                .iter()
                .filter(|(_, ok)| !**ok)
                .map(|((b, c), _)| format!("({}, {})", b, c)),
        )
        .collect()
}

/// Writes a one-line outcome summary through tracing.
pub struct LogHook {
    name: String,
}

impl LogHook {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Hook for LogHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        event: HookEvent,
        output: &[LogEntry],
        collect: &CollectOutcomes,
        backup: &BackupOutcomes,
    ) -> Result<()> {
        let failed = failures(collect, backup);
        if failed.is_empty() {
            info!(
                "[{}] {}: {} collect point(s), {} backup pair(s) ok",
                self.name,
                event,
                collect.len(),
                backup.len()
            );
        } else {
            warn!("[{}] {}: failed: {}", self.name, event, failed.join(", "));
            for entry in output.iter().filter(|e| e.level == "error") {
                warn!("[{}]   {}", self.name, entry.message);
            }
        }
        Ok(())
    }
}

/// Runs an external command; the event and failing pairs are passed through the environment.
pub struct CommandHook {
    name: String,
    argv: Vec<String>,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            anyhow::bail!("command hook needs a non-empty command");
        }
        Ok(Self {
            name: name.into(),
            argv,
        })
    }
}

#[async_trait]
impl Hook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        event: HookEvent,
        _output: &[LogEntry],
        collect: &CollectOutcomes,
        backup: &BackupOutcomes,
    ) -> Result<()> {
        let output = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .env("ARCHIVIST_EVENT", event.as_str())
            .env("ARCHIVIST_FAILURES", failures(collect, backup).join("\n"))
            .output()
            .await
            .with_context(|| format!("spawning {}", self.argv[0]))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} exited with {}: {}", self.argv[0], output.status, stderr.trim());
        }
        Ok(())
    }
}
