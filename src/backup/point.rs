use super::drivers::BackupDriver;
use super::filters::{chain, chain_output, restore_chain, run_chain, FileFilter};
use super::frequency::Frequency;
use super::hooks::HookBinding;
use super::info::{InfoKey, PointInfo};
use super::lifecycle::{Lifecycle, Pipeline};
use super::matcher::TagPolicy;
use super::sources::Source;
use super::variables::snapshot;
use super::{PointRun, RunContext};
use crate::storage::{InfoStore, JsonInfoStore};
use crate::utils::disk::dir_size_async;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

const IMPORT_DIR: &str = "import";
const PRIVATE_DIR: &str = ".archivist";

/// Local aggregation area fed by one or more sources.
pub struct CollectPoint {
    pub name: String,
    pub policy: TagPolicy,
    pub frequency: Frequency,
    root: PathBuf,
    sources: Vec<Box<dyn Source>>,
    filters: Vec<Box<dyn FileFilter>>,
    hooks: Vec<HookBinding>,
    store: Arc<dyn InfoStore>,
}

impl CollectPoint {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let store = Arc::new(JsonInfoStore::new(root.join(PRIVATE_DIR)));
        Self {
            name: name.into(),
            policy: TagPolicy::with_default_tag("collect"),
            frequency: Frequency::default(),
            root,
            sources: Vec::new(),
            filters: Vec::new(),
            hooks: Vec::new(),
            store,
        }
    }

    pub fn with_policy(mut self, policy: TagPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_source(mut self, source: Box<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_filter(mut self, filter: Box<dyn FileFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_hook(mut self, hook: HookBinding) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn InfoStore>) -> Self {
        self.store = store;
        self
    }

    pub fn sources(&self) -> &[Box<dyn Source>] {
        &self.sources
    }

    pub fn filters(&self) -> &[Box<dyn FileFilter>] {
        &self.filters
    }

    /// Raw area the sources write into.
    pub fn import_data_path(&self) -> PathBuf {
        self.root.join(IMPORT_DIR)
    }

    /// Metadata directory: lock marker, status record, filter work areas.
    pub fn private_path(&self) -> PathBuf {
        self.root.join(PRIVATE_DIR)
    }

    /// Data as seen by backup points, after every filter.
    pub fn export_data_path(&self) -> PathBuf {
        let filters_dir = self.private_path().join("filters");
        chain_output(&chain(&self.filters, &filters_dir), &self.import_data_path())
    }

    pub fn info_key(&self) -> InfoKey {
        InfoKey::collect(&self.name)
    }

    pub async fn get_info(&self) -> Result<PointInfo> {
        self.store.get_info(&self.info_key()).await
    }

    pub async fn backup(&self, ctx: &RunContext, force: bool) -> PointRun {
        let private = self.private_path();
        let lifecycle = Lifecycle {
            label: self.name.clone(),
            key: self.info_key(),
            store: self.store.as_ref(),
            frequency: self.frequency,
            lock_dir: &private,
            hooks: &self.hooks,
        };
        lifecycle.run(ctx, force, &CollectPipeline { point: self }).await
    }

    /// Undoes the filters, then hands the data back to every source.
    pub async fn restore(&self, ctx: &RunContext) -> Result<()> {
        let import = self.import_data_path();
        let steps = chain(&self.filters, &self.private_path().join("filters"));
        restore_chain(&steps, &import, ctx).await?;
        for source in &self.sources {
            ctx.log.info(&self.name, format!("restoring source {}", source.name()));
            source
                .restore(&import, ctx)
                .await
                .with_context(|| format!("restoring source {}", source.name()))?;
        }
        Ok(())
    }
}

struct CollectPipeline<'a> {
    point: &'a CollectPoint,
}

#[async_trait]
impl Pipeline for CollectPipeline<'_> {
    async fn execute(&self, ctx: &RunContext, info: &mut PointInfo) -> Result<()> {
        let point = self.point;
        let import = point.import_data_path();
        tokio::fs::create_dir_all(&import)
            .await
            .with_context(|| format!("creating {}", import.display()))?;

        for source in &point.sources {
            ctx.log.info(&point.name, format!("running source {} ({})", source.name(), source.engine()));
            source
                .backup(&import, ctx)
                .await
                .with_context(|| format!("source {}", source.name()))?;
        }

        let steps = chain(&point.filters, &point.private_path().join("filters"));
        let export = run_chain(&steps, &import, ctx).await?;
        if !ctx.dry_run {
            info.total_size = dir_size_async(export).await?;
        }
        Ok(())
    }
}

/// Destination that receives exported data from associated collect points.
pub struct BackupPoint {
    pub name: String,
    pub policy: TagPolicy,
    pub frequency: Frequency,
    root: PathBuf,
    driver: Box<dyn BackupDriver>,
    filters: Vec<Box<dyn FileFilter>>,
    hooks: Vec<HookBinding>,
    store: Arc<dyn InfoStore>,
}

impl BackupPoint {
    /// `root` is a local working directory for this point's filters and records.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, driver: Box<dyn BackupDriver>) -> Self {
        let root = root.into();
        let store = Arc::new(JsonInfoStore::new(root.clone()));
        Self {
            name: name.into(),
            policy: TagPolicy::with_default_tag("backup"),
            frequency: Frequency::default(),
            root,
            driver,
            filters: Vec::new(),
            hooks: Vec::new(),
            store,
        }
    }

    pub fn with_policy(mut self, policy: TagPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_filter(mut self, filter: Box<dyn FileFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_hook(mut self, hook: HookBinding) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn InfoStore>) -> Self {
        self.store = store;
        self
    }

    pub fn driver(&self) -> &dyn BackupDriver {
        self.driver.as_ref()
    }

    pub fn filters(&self) -> &[Box<dyn FileFilter>] {
        &self.filters
    }

    pub fn info_key(&self, collect: &CollectPoint) -> InfoKey {
        InfoKey::backup(&self.name, &collect.name)
    }

    pub async fn get_info(&self, collect: &CollectPoint) -> Result<PointInfo> {
        self.store.get_info(&self.info_key(collect)).await
    }

    fn filters_dir(&self, collect: &CollectPoint) -> PathBuf {
        self.root.join("filters").join(&collect.name)
    }

    pub async fn backup(&self, collect: &CollectPoint, ctx: &RunContext, force: bool) -> PointRun {
        let lock_dir = collect.private_path();
        let lifecycle = Lifecycle {
            label: format!("({}, {})", self.name, collect.name),
            key: self.info_key(collect),
            store: self.store.as_ref(),
            frequency: self.frequency,
            lock_dir: &lock_dir,
            hooks: &self.hooks,
        };
        let pipeline = BackupPipeline { point: self, collect };
        lifecycle.run(ctx, force, &pipeline).await
    }

    /// Fetches the last successful backup of `collect` into its export path.
    pub async fn restore(&self, collect: &CollectPoint, ctx: &RunContext) -> Result<()> {
        let info = self.get_info(collect).await?;
        let export = collect.export_data_path();
        let steps = chain(&self.filters, &self.filters_dir(collect));
        let data = chain_output(&steps, &export);
        ctx.log.info(&self.name, format!("restoring {} via {}", collect.name, self.driver.describe()));
        self.driver.restore(&data, &info, ctx).await?;
        restore_chain(&steps, &export, ctx).await
    }
}

struct BackupPipeline<'a> {
    point: &'a BackupPoint,
    collect: &'a CollectPoint,
}

#[async_trait]
impl Pipeline for BackupPipeline<'_> {
    async fn execute(&self, ctx: &RunContext, info: &mut PointInfo) -> Result<()> {
        let (point, collect) = (self.point, self.collect);
        let export = collect.export_data_path();
        if !ctx.dry_run && !export.is_dir() {
            anyhow::bail!("no exported data at {}", export.display());
        }

        let steps = chain(&point.filters, &point.filters_dir(collect));
        let data = run_chain(&steps, &export, ctx).await?;
        let variables = snapshot(ctx.now, &collect.name, &point.name);
        point.driver.backup(&data, &variables, info, ctx).await?;
        info.variables = variables;
        Ok(())
    }
}
