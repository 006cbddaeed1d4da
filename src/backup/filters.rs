//! Reversible path-to-path transforms applied to exported data.

use super::RunContext;
use crate::utils::disk::{list_files, mirror_tree};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait FileFilter: Send + Sync {
    fn name(&self) -> &str;

    fn engine(&self) -> &'static str;

    /// Where `backup` will leave its output. Pure: no I/O.
    fn next_path(&self, previous: &Path, private: &Path, allow_in_place: bool) -> PathBuf;

    /// Transforms `previous` and returns the path holding the result.
    async fn backup(
        &self,
        previous: &Path,
        private: &Path,
        allow_in_place: bool,
        ctx: &RunContext,
    ) -> Result<PathBuf>;

    /// Reverses `backup`: reads `next` and rebuilds `previous`.
    async fn restore(
        &self,
        next: &Path,
        previous: &Path,
        private: &Path,
        allow_in_place: bool,
        ctx: &RunContext,
    ) -> Result<()>;
}

/// A filter with the paths it owns inside a point's private directory.
pub struct FilterStep<'a> {
    pub filter: &'a dyn FileFilter,
    pub private: PathBuf,
    pub allow_in_place: bool,
}

/// Lays out a filter chain. The first filter never works in place so the
/// chain input stays untouched; later filters own their input already.
pub fn chain<'a>(filters: &'a [Box<dyn FileFilter>], private_root: &Path) -> Vec<FilterStep<'a>> {
    filters
        .iter()
        .enumerate()
        .map(|(index, filter)| FilterStep {
            filter: filter.as_ref(),
            private: private_root.join(format!("{:02}-{}", index, filter.name())),
            allow_in_place: index > 0,
        })
        .collect()
}

/// Output path of the chain without running it.
pub fn chain_output(steps: &[FilterStep<'_>], input: &Path) -> PathBuf {
    steps.iter().fold(input.to_path_buf(), |path, step| {
        step.filter.next_path(&path, &step.private, step.allow_in_place)
    })
}

pub async fn run_chain(steps: &[FilterStep<'_>], input: &Path, ctx: &RunContext) -> Result<PathBuf> {
    let mut path = input.to_path_buf();
    for step in steps {
        path = step
            .filter
            .backup(&path, &step.private, step.allow_in_place, ctx)
            .await
            .with_context(|| format!("filter {}", step.filter.name()))?;
    }
    Ok(path)
}

/// Undoes the chain, last filter first, rebuilding `input`.
pub async fn restore_chain(steps: &[FilterStep<'_>], input: &Path, ctx: &RunContext) -> Result<()> {
    let mut inputs = Vec::with_capacity(steps.len());
    let mut path = input.to_path_buf();
    for step in steps {
        inputs.push(path.clone());
        path = step.filter.next_path(&path, &step.private, step.allow_in_place);
    }
    for (step, previous) in steps.iter().zip(inputs).rev() {
        let next = step.filter.next_path(&previous, &step.private, step.allow_in_place);
        step.filter
            .restore(&next, &previous, &step.private, step.allow_in_place, ctx)
            .await
            .with_context(|| format!("restoring filter {}", step.filter.name()))?;
    }
    Ok(())
}

fn default_manifest() -> String {
    "archivist.blake3".to_string()
}

/// Writes a BLAKE3 manifest of every file and checks it on restore.
#[derive(Debug, Clone, Deserialize)]
pub struct HashsumFilter {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_manifest")]
    pub manifest: String,
}

fn default_name() -> String {
    "hashsum".to_string()
}

impl Default for HashsumFilter {
    fn default() -> Self {
        Self {
            name: default_name(),
            manifest: default_manifest(),
        }
    }
}

impl HashsumFilter {
    fn manifest_for(&self, root: &Path) -> Result<String> {
        let mut manifest = String::new();
        for rel in list_files(root)? {
            if rel == Path::new(&self.manifest) {
                continue;
            }
            let bytes = std::fs::read(root.join(&rel))
                .with_context(|| format!("reading {}", rel.display()))?;
            let _ = writeln!(manifest, "{}  {}", blake3::hash(&bytes).to_hex(), rel.display());
        }
        Ok(manifest)
    }

    fn verify(&self, root: &Path) -> Result<()> {
        let path = root.join(&self.manifest);
        let expected = std::fs::read_to_string(&path)
            .with_context(|| format!("reading checksum manifest {}", path.display()))?;
        let actual = self.manifest_for(root)?;
        if expected != actual {
            let mismatched: Vec<&str> = actual
                .lines()
                .filter(|line| !expected.lines().any(|e| e == *line))
                .filter_map(|line| line.split_once("  ").map(|(_, file)| file))
                .collect();
            anyhow::bail!("checksum mismatch in {}: {}", root.display(), mismatched.join(", "));
        }
        Ok(())
    }
}

#[async_trait]
impl FileFilter for HashsumFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> &'static str {
        "hashsum"
    }

    fn next_path(&self, previous: &Path, private: &Path, allow_in_place: bool) -> PathBuf {
        if allow_in_place {
            previous.to_path_buf()
        } else {
            private.join("data")
        }
    }

    async fn backup(
        &self,
        previous: &Path,
        private: &Path,
        allow_in_place: bool,
        ctx: &RunContext,
    ) -> Result<PathBuf> {
        let target = self.next_path(previous, private, allow_in_place);
        if ctx.dry_run {
            ctx.log.info(&self.name, format!("would write checksums into {}", target.display()));
            return Ok(target);
        }
        let filter = self.clone();
        let (previous, out) = (previous.to_path_buf(), target.clone());
        tokio::task::spawn_blocking(move || -> Result<()> {
            if !allow_in_place {
                mirror_tree(&previous, &out, &[])?;
            }
            let manifest = filter.manifest_for(&out)?;
            std::fs::write(out.join(&filter.manifest), manifest)?;
            Ok(())
        })
        .await??;
        Ok(target)
    }

    async fn restore(
        &self,
        next: &Path,
        previous: &Path,
        _private: &Path,
        allow_in_place: bool,
        ctx: &RunContext,
    ) -> Result<()> {
        if ctx.dry_run {
            ctx.log.info(&self.name, format!("would verify checksums in {}", next.display()));
            return Ok(());
        }
        let filter = self.clone();
        let (next, previous) = (next.to_path_buf(), previous.to_path_buf());
        tokio::task::spawn_blocking(move || -> Result<()> {
            filter.verify(&next)?;
            if !allow_in_place {
                mirror_tree(&next, &previous, &[filter.manifest.as_str()])?;
            }
            Ok(())
        })
        .await?
    }
}
