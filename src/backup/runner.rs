use super::hooks::{dispatch, failures, HookBinding, HookEvent};
use super::info::PointInfo;
use super::matcher::can_associate;
use super::point::{BackupPoint, CollectPoint};
use super::{BackupOutcomes, CollectOutcomes, RunContext};
use crate::storage::{RunRecord, Storage};
use crate::utils::log_buffer::RunLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// Exit status when every pair is fine.
pub const EXIT_OK: i32 = 0;
/// Exit status when something is out of date but nothing failed.
pub const EXIT_DEGRADED: i32 = 1;
/// Exit status when at least one point or pair failed.
pub const EXIT_FAILED: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub force: bool,
    pub only_collect_points: Option<BTreeSet<String>>,
    pub only_backup_points: Option<BTreeSet<String>>,
    pub skip_collect: bool,
    pub skip_backup: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub only_collect_points: Option<BTreeSet<String>>,
    pub only_backup_points: Option<BTreeSet<String>>,
    pub skip_collect: bool,
    pub skip_backup: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collect: CollectOutcomes,
    #[serde(serialize_with = "serialize_pairs")]
    pub backup: BackupOutcomes,
}

fn serialize_pairs<S: serde::Serializer>(pairs: &BackupOutcomes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(pairs.iter().map(|((b, c), ok)| (format!("{}/{}", b, c), ok)))
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.collect.values().chain(self.backup.values()).all(|ok| *ok)
    }

    pub fn failures(&self) -> Vec<String> {
        failures(&self.collect, &self.backup)
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() {
            EXIT_OK
        } else {
            EXIT_FAILED
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Ok,
    OutOfDate,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckEntry {
    pub point: String,
    pub health: Health,
    pub last_success: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub entries: Vec<CheckEntry>,
}

impl CheckReport {
    pub fn exit_code(&self) -> i32 {
        let any = |health| self.entries.iter().any(|e| e.health == health);
        if any(Health::Failed) {
            EXIT_FAILED
        } else if any(Health::OutOfDate) {
            EXIT_DEGRADED
        } else {
            EXIT_OK
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub point: String,
    pub info: Option<PointInfo>,
    pub error: Option<String>,
}

/// Runs backup and restore passes over every collect point and its backup points.
pub struct Runner {
    collect_points: Vec<CollectPoint>,
    backup_points: Vec<BackupPoint>,
    hooks: Vec<HookBinding>,
    dry_run: bool,
    lock_timeout: Duration,
    history: Option<Storage>,
    log: RunLog,
}

fn selected(filter: &Option<BTreeSet<String>>, name: &str) -> bool {
    filter.as_ref().map_or(true, |names| names.contains(name))
}

impl Runner {
    pub fn new(
        mut collect_points: Vec<CollectPoint>,
        mut backup_points: Vec<BackupPoint>,
        hooks: Vec<HookBinding>,
    ) -> Self {
        collect_points.sort_by(|a, b| a.name.cmp(&b.name));
        backup_points.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            collect_points,
            backup_points,
            hooks,
            dry_run: false,
            lock_timeout: Duration::from_secs(1),
            history: None,
            log: RunLog::default(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_history(mut self, storage: Storage) -> Self {
        self.history = Some(storage);
        self
    }

    pub fn collect_points(&self) -> &[CollectPoint] {
        &self.collect_points
    }

    pub fn backup_points(&self) -> &[BackupPoint] {
        &self.backup_points
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn history(&self) -> Option<&Storage> {
        self.history.as_ref()
    }

    /// Backup points serving `collect`, in name order.
    pub fn associated<'a>(&'a self, collect: &'a CollectPoint) -> impl Iterator<Item = &'a BackupPoint> + 'a {
        self.backup_points
            .iter()
            .filter(move |bp| can_associate(&collect.policy, &bp.policy))
    }

    pub fn associations(&self) -> Vec<(String, Vec<String>)> {
        self.collect_points
            .iter()
            .map(|cp| (cp.name.clone(), self.associated(cp).map(|bp| bp.name.clone()).collect()))
            .collect()
    }

    fn context(&self) -> RunContext {
        self.log.clear();
        RunContext::new(self.dry_run, self.lock_timeout, self.log.clone())
    }

    pub async fn backup(&self, request: &BackupRequest) -> RunReport {
        let ctx = self.context();
        let mut collect = CollectOutcomes::new();
        let mut backup = BackupOutcomes::new();
        info!("Starting backup pass ({} collect points)", self.collect_points.len());

        dispatch(&self.hooks, HookEvent::BeforeBackup, &ctx.log, &collect, &backup).await;

        for cp in self.collect_points.iter().filter(|cp| selected(&request.only_collect_points, &cp.name)) {
            if !request.skip_collect {
                let run = cp.backup(&ctx, request.force).await;
                collect.insert(cp.name.clone(), run.success);
                if !run.success {
                    ctx.log.warn(&cp.name, "collect failed, its backup points are skipped");
                    continue;
                }
            }
            if request.skip_backup {
                continue;
            }
            for bp in self
                .associated(cp)
                .filter(|bp| selected(&request.only_backup_points, &bp.name))
            {
                let run = bp.backup(cp, &ctx, request.force).await;
                backup.insert((bp.name.clone(), cp.name.clone()), run.success);
            }
        }

        let report = self.report(&ctx, collect, backup);
        let event = HookEvent::outcome(report.all_succeeded());
        dispatch(&self.hooks, event, &ctx.log, &report.collect, &report.backup).await;
        dispatch(&self.hooks, HookEvent::AfterBackup, &ctx.log, &report.collect, &report.backup).await;
        self.record(&report, "backup").await;
        report
    }

    /// Brings data back from the most recent successful backup point, then
    /// into the sources.
    pub async fn restore(&self, request: &RestoreRequest) -> RunReport {
        let ctx = self.context();
        let mut collect = CollectOutcomes::new();
        let mut backup = BackupOutcomes::new();

        for cp in self.collect_points.iter().filter(|cp| selected(&request.only_collect_points, &cp.name)) {
            if !request.skip_backup {
                let candidates: Vec<&BackupPoint> = self
                    .associated(cp)
                    .filter(|bp| selected(&request.only_backup_points, &bp.name))
                    .collect();
                let Some(bp) = self.most_recent(cp, &candidates, &ctx).await else {
                    ctx.log.error(&cp.name, "no backup point holds a successful backup");
                    collect.insert(cp.name.clone(), false);
                    continue;
                };
                let restored = match bp.restore(cp, &ctx).await {
                    Ok(()) => true,
                    Err(e) => {
                        ctx.log.error(&bp.name, format!("restore of {} failed: {:#}", cp.name, e));
                        false
                    }
                };
                backup.insert((bp.name.clone(), cp.name.clone()), restored);
                if !restored {
                    continue;
                }
            }
            if !request.skip_collect {
                let restored = match cp.restore(&ctx).await {
                    Ok(()) => true,
                    Err(e) => {
                        ctx.log.error(&cp.name, format!("restore failed: {:#}", e));
                        false
                    }
                };
                collect.insert(cp.name.clone(), restored);
            }
        }

        let report = self.report(&ctx, collect, backup);
        self.record(&report, "restore").await;
        report
    }

    /// Latest `last_success` wins; ties go to the first name.
    async fn most_recent<'a>(
        &self,
        cp: &CollectPoint,
        candidates: &[&'a BackupPoint],
        ctx: &RunContext,
    ) -> Option<&'a BackupPoint> {
        let mut best: Option<(&'a BackupPoint, DateTime<Utc>)> = None;
        for bp in candidates {
            let last = match bp.get_info(cp).await {
                Ok(info) => info.last_success,
                Err(e) => {
                    ctx.log.warn(&bp.name, format!("cannot read status for {}: {:#}", cp.name, e));
                    None
                }
            };
            if let Some(last) = last {
                if best.map_or(true, |(_, current)| last > current) {
                    best = Some((*bp, last));
                }
            }
        }
        best.map(|(bp, _)| bp)
    }

    pub async fn check(&self, now: DateTime<Utc>) -> CheckReport {
        let mut entries = Vec::new();
        for cp in &self.collect_points {
            entries.push(classify(cp.name.clone(), cp.get_info().await, |info| {
                cp.frequency.is_due(now, info.last_success)
            }));
            for bp in self.associated(cp) {
                let label = format!("({}, {})", bp.name, cp.name);
                entries.push(classify(label, bp.get_info(cp).await, |info| {
                    bp.frequency.is_due(now, info.last_success)
                }));
            }
        }
        CheckReport { entries }
    }

    pub async fn status(&self) -> Vec<StatusEntry> {
        let mut entries = Vec::new();
        for cp in &self.collect_points {
            entries.push(status_entry(cp.name.clone(), cp.get_info().await));
            for bp in self.associated(cp) {
                let label = format!("({}, {})", bp.name, cp.name);
                entries.push(status_entry(label, bp.get_info(cp).await));
            }
        }
        entries
    }

    fn report(&self, ctx: &RunContext, collect: CollectOutcomes, backup: BackupOutcomes) -> RunReport {
        RunReport {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: ctx.now,
            finished_at: Utc::now(),
            collect,
            backup,
        }
    }

    async fn record(&self, report: &RunReport, kind: &str) {
        let failed = report.failures();
        if failed.is_empty() {
            info!("{} pass finished without failures", kind);
        } else {
            warn!("{} pass finished with failures: {}", kind, failed.join(", "));
        }
        let Some(history) = &self.history else {
            return;
        };
        let record = RunRecord {
            id: report.id.clone(),
            kind: kind.to_string(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            pairs: report.collect.len() + report.backup.len(),
            failures: failed,
        };
        if let Err(e) = history.record_run(&record).await {
            warn!("Cannot record run history: {:#}", e);
        }
    }
}

fn classify(
    point: String,
    info: anyhow::Result<PointInfo>,
    is_due: impl Fn(&PointInfo) -> bool,
) -> CheckEntry {
    match info {
        Ok(info) => {
            let health = if info.last_state_valid == Some(false) {
                Health::Failed
            } else if is_due(&info) {
                Health::OutOfDate
            } else {
                Health::Ok
            };
            CheckEntry {
                point,
                health,
                last_success: info.last_success,
                message: info.last_message,
            }
        }
        Err(e) => CheckEntry {
            point,
            health: Health::Failed,
            last_success: None,
            message: format!("{:#}", e),
        },
    }
}

fn status_entry(point: String, info: anyhow::Result<PointInfo>) -> StatusEntry {
    match info {
        Ok(info) => StatusEntry {
            point,
            info: Some(info),
            error: None,
        },
        Err(e) => StatusEntry {
            point,
            info: None,
            error: Some(format!("{:#}", e)),
        },
    }
}
