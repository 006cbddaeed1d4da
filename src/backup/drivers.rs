//! Backup point drivers: how exported data reaches its destination.

use super::info::PointInfo;
use super::transport::Transport;
use super::variables::{render, Variables};
use super::RunContext;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[async_trait]
pub trait BackupDriver: Send + Sync {
    fn engine(&self) -> &'static str;

    fn describe(&self) -> String;

    /// Sends `export_path`. May record history in `info.data`.
    async fn backup(
        &self,
        export_path: &Path,
        variables: &Variables,
        info: &mut PointInfo,
        ctx: &RunContext,
    ) -> Result<()>;

    /// Brings the data described by `info` back into `export_path`.
    async fn restore(&self, export_path: &Path, info: &PointInfo, ctx: &RunContext) -> Result<()>;
}

/// Renders `template`, then adds a `<collect point>` component unless the
/// template already places data per collect point with `{name}`.
fn collect_location(template: &str, variables: &Variables) -> String {
    let rendered = render(template, variables);
    if template.contains("{name}") {
        return rendered;
    }
    match variables.get("name") {
        Some(name) => format!("{}/{}", rendered.trim_end_matches('/'), name),
        None => rendered,
    }
}

/// Keeps one synchronized copy at a (possibly templated) destination.
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorDriver {
    pub destination: String,
    #[serde(default)]
    pub transport: Transport,
}

#[async_trait]
impl BackupDriver for MirrorDriver {
    fn engine(&self) -> &'static str {
        "mirror"
    }

    fn describe(&self) -> String {
        format!("mirror to {}", self.destination)
    }

    async fn backup(
        &self,
        export_path: &Path,
        variables: &Variables,
        _info: &mut PointInfo,
        ctx: &RunContext,
    ) -> Result<()> {
        let destination = collect_location(&self.destination, variables);
        let backend = self.transport.open(&destination);
        if ctx.dry_run {
            ctx.log.info(&destination, format!("would sync {}", export_path.display()));
            return Ok(());
        }
        backend
            .sync_dir_from_local(export_path)
            .await
            .with_context(|| format!("sending to {}", backend.location()))
    }

    async fn restore(&self, export_path: &Path, info: &PointInfo, ctx: &RunContext) -> Result<()> {
        let destination = collect_location(&self.destination, &info.variables);
        let backend = self.transport.open(&destination);
        if ctx.dry_run {
            ctx.log.info(&destination, format!("would fetch into {}", export_path.display()));
            return Ok(());
        }
        backend
            .sync_dir_to_local(export_path)
            .await
            .with_context(|| format!("fetching from {}", backend.location()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub location: String,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SnapshotHistory {
    snapshots: Vec<SnapshotEntry>,
}

impl SnapshotHistory {
    fn load(info: &PointInfo) -> Self {
        info.data
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }
}

fn default_keep() -> usize {
    7
}

/// Dated copies under a root, keeping the `keep` most recent.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotsDriver {
    pub destination: String,
    #[serde(default = "default_keep")]
    pub keep: usize,
    #[serde(default)]
    pub transport: Transport,
}

impl SnapshotsDriver {
    pub fn snapshots(info: &PointInfo) -> Vec<SnapshotEntry> {
        SnapshotHistory::load(info).snapshots
    }
}

#[async_trait]
impl BackupDriver for SnapshotsDriver {
    fn engine(&self) -> &'static str {
        "snapshots"
    }

    fn describe(&self) -> String {
        format!("snapshots under {} (keep {})", self.destination, self.keep)
    }

    async fn backup(
        &self,
        export_path: &Path,
        variables: &Variables,
        info: &mut PointInfo,
        ctx: &RunContext,
    ) -> Result<()> {
        let root = collect_location(&self.destination, variables);
        let location = format!(
            "{}/{}",
            root.trim_end_matches('/'),
            ctx.now.format("%Y%m%dT%H%M%S")
        );
        if ctx.dry_run {
            ctx.log.info(&root, format!("would create snapshot {}", location));
            return Ok(());
        }

        let backend = self.transport.open(&location);
        backend
            .sync_dir_from_local(export_path)
            .await
            .with_context(|| format!("sending snapshot to {}", location))?;

        let mut history = SnapshotHistory::load(info);
        history.snapshots.retain(|s| s.location != location);
        history.snapshots.push(SnapshotEntry {
            location,
            taken_at: ctx.now,
        });
        history.snapshots.sort_by_key(|s| s.taken_at);

        let excess = history.snapshots.len().saturating_sub(self.keep.max(1));
        let expired: Vec<SnapshotEntry> = history.snapshots.drain(..excess).collect();
        for old in expired {
            if let Err(e) = self.transport.open(&old.location).delete_on_distant().await {
                ctx.log.warn(&root, format!("cannot prune {}: {:#}", old.location, e));
                history.snapshots.insert(0, old);
            }
        }
        history.snapshots.sort_by_key(|s| s.taken_at);
        info.data = Some(serde_json::to_value(&history)?);
        Ok(())
    }

    async fn restore(&self, export_path: &Path, info: &PointInfo, ctx: &RunContext) -> Result<()> {
        let Some(latest) = SnapshotHistory::load(info).snapshots.pop() else {
            anyhow::bail!("no snapshot recorded under {}", self.destination);
        };
        if ctx.dry_run {
            ctx.log.info(&latest.location, format!("would fetch into {}", export_path.display()));
            return Ok(());
        }
        self.transport
            .open(&latest.location)
            .sync_dir_to_local(export_path)
            .await
            .with_context(|| format!("fetching snapshot {}", latest.location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::variables::snapshot;
    use crate::utils::log_buffer::RunLog;
    use chrono::{Duration, TimeZone};

    fn ctx_at(now: DateTime<Utc>) -> RunContext {
        let mut ctx = RunContext::new(false, std::time::Duration::from_millis(50), RunLog::default());
        ctx.now = now;
        ctx
    }

    #[tokio::test]
    async fn test_mirror_uses_recorded_variables_on_restore() {
        let export = tempfile::tempdir().unwrap();
        let distant = tempfile::tempdir().unwrap();
        std::fs::write(export.path().join("a.txt"), b"alpha").unwrap();

        let driver = MirrorDriver {
            destination: format!("{}/{{name}}/{{Y}}", distant.path().display()),
            transport: Transport::Local,
        };
        let now = Utc.with_ymd_and_hms(2016, 6, 1, 0, 0, 0).unwrap();
        let vars = snapshot(now, "app1", "remote1");
        let mut info = PointInfo::default();
        driver.backup(export.path(), &vars, &mut info, &ctx_at(now)).await.unwrap();
        assert!(distant.path().join("app1/2016/a.txt").exists());

        info.variables = vars;
        let restored = export.path().join("restored");
        driver.restore(&restored, &info, &ctx_at(Utc::now())).await.unwrap();
        assert_eq!(std::fs::read(restored.join("a.txt")).unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn test_snapshots_rolling_retention() {
        let export = tempfile::tempdir().unwrap();
        let distant = tempfile::tempdir().unwrap();
        std::fs::write(export.path().join("a.txt"), b"v0").unwrap();
        let driver = SnapshotsDriver {
            destination: distant.path().display().to_string(),
            keep: 2,
            transport: Transport::Local,
        };

        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let vars = snapshot(t0, "app1", "snaps");
        let mut info = PointInfo::default();
        for day in 0..3 {
            std::fs::write(export.path().join("a.txt"), format!("v{}", day)).unwrap();
            let ctx = ctx_at(t0 + Duration::days(day));
            driver.backup(export.path(), &vars, &mut info, &ctx).await.unwrap();
        }

        let kept = SnapshotsDriver::snapshots(&info);
        assert_eq!(kept.len(), 2);
        assert!(!distant.path().join("app1/20200101T000000").exists());
        assert!(distant.path().join("app1/20200103T000000").exists());

        let restored = export.path().join("restored");
        driver.restore(&restored, &info, &ctx_at(Utc::now())).await.unwrap();
        assert_eq!(std::fs::read_to_string(restored.join("a.txt")).unwrap(), "v2");
    }

    #[test]
    fn test_collect_location() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let vars = snapshot(now, "app1", "remote1");
        assert_eq!(collect_location("/srv/backups/", &vars), "/srv/backups/app1");
        assert_eq!(collect_location("/srv/{Y}", &vars), "/srv/2020/app1");
        assert_eq!(collect_location("/srv/{name}/{Y}", &vars), "/srv/app1/2020");
    }

    #[tokio::test]
    async fn test_snapshots_restore_without_history() {
        let driver = SnapshotsDriver {
            destination: "/nowhere".into(),
            keep: 1,
            transport: Transport::Local,
        };
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_at(Utc::now());
        assert!(driver.restore(dir.path(), &PointInfo::default(), &ctx).await.is_err());
    }
}
