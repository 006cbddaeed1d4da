//! File-sync capability used by drivers and remote status records.
//!
//! A backend is bound to one distant location (a file or a directory); the
//! local side is given per call.

use super::rsync::run_rsync;
use crate::utils::disk::mirror_tree_async;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn location(&self) -> String;

    /// Pulls the distant file into `local`. A missing distant file is not an error.
    async fn sync_file_to_local(&self, local: &Path) -> Result<()>;

    async fn sync_file_from_local(&self, local: &Path) -> Result<()>;

    async fn sync_dir_to_local(&self, local: &Path) -> Result<()>;

    async fn sync_dir_from_local(&self, local: &Path) -> Result<()>;

    async fn delete_on_distant(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Local,
    Rsync,
}

impl Transport {
    pub fn open(self, location: &str) -> Box<dyn StorageBackend> {
        match self {
            Transport::Local => Box::new(LocalBackend::new(location)),
            Transport::Rsync => Box::new(RsyncBackend::new(location)),
        }
    }
}

/// Distant location on a mounted filesystem.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn sync_file_to_local(&self, local: &Path) -> Result<()> {
        if !tokio::fs::try_exists(&self.root).await? {
            debug!("No distant file at {}", self.root.display());
            return Ok(());
        }
        copy_file(&self.root, local).await
    }

    async fn sync_file_from_local(&self, local: &Path) -> Result<()> {
        copy_file(local, &self.root).await
    }

    async fn sync_dir_to_local(&self, local: &Path) -> Result<()> {
        mirror_tree_async(self.root.clone(), local.to_path_buf()).await?;
        Ok(())
    }

    async fn sync_dir_from_local(&self, local: &Path) -> Result<()> {
        mirror_tree_async(local.to_path_buf(), self.root.clone()).await?;
        Ok(())
    }

    async fn delete_on_distant(&self) -> Result<()> {
        let meta = match tokio::fs::metadata(&self.root).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&self.root).await?;
        } else {
            tokio::fs::remove_file(&self.root).await?;
        }
        Ok(())
    }
}

/// Distant location reachable by rsync (`host:/path` or `rsync://...`).
#[derive(Debug, Clone)]
pub struct RsyncBackend {
    url: String,
}

impl RsyncBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn local_str(local: &Path) -> String {
    local.to_string_lossy().into_owned()
}

#[async_trait]
impl StorageBackend for RsyncBackend {
    fn location(&self) -> String {
        self.url.clone()
    }

    async fn sync_file_to_local(&self, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = vec!["--ignore-missing-args".to_string()];
        run_rsync(&self.url, &local_str(local), &options, false, false).await
    }

    async fn sync_file_from_local(&self, local: &Path) -> Result<()> {
        run_rsync(&local_str(local), &self.url, &[], false, false).await
    }

    async fn sync_dir_to_local(&self, local: &Path) -> Result<()> {
        tokio::fs::create_dir_all(local).await?;
        run_rsync(&self.url, &local_str(local), &[], true, false).await
    }

    async fn sync_dir_from_local(&self, local: &Path) -> Result<()> {
        run_rsync(&local_str(local), &self.url, &[], true, false).await
    }

    async fn delete_on_distant(&self) -> Result<()> {
        // rsync cannot delete a target directly: mirror an empty directory over it.
        let empty = empty_scratch_dir()?;
        run_rsync(&local_str(&empty), &self.url, &[], true, false).await?;
        tokio::fs::remove_dir_all(&empty).await?;
        Ok(())
    }
}

fn empty_scratch_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("archivist-empty-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
