use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Total size in bytes of the regular files under `path` (0 if it does not exist).
pub fn dir_size(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.with_context(|| format!("walking {}", path.display()))?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Makes `destination` an exact copy of `source`, removing anything else.
/// Paths in `skip` (relative to `source`) are neither copied nor kept.
pub fn mirror_tree(source: &Path, destination: &Path, skip: &[&str]) -> Result<u64> {
    if !source.is_dir() {
        anyhow::bail!("source directory does not exist: {}", source.display());
    }
    if destination.exists() {
        fs::remove_dir_all(destination)
            .with_context(|| format!("clearing {}", destination.display()))?;
    }
    fs::create_dir_all(destination)
        .with_context(|| format!("creating {}", destination.display()))?;

    let mut copied = 0u64;
    let walker = WalkDir::new(source).min_depth(1).into_iter().filter_entry(|e| {
        e.path()
            .strip_prefix(source)
            .map(|rel| !skip.iter().any(|s| rel == Path::new(s)))
            .unwrap_or(true)
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", source.display()))?;
        let rel = entry.path().strip_prefix(source)?;
        let target = destination.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copied += fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }
    Ok(copied)
}

/// Relative paths of all regular files under `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.path().strip_prefix(root)?.to_path_buf());
        }
    }
    Ok(files)
}

pub async fn dir_size_async(path: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || dir_size(&path)).await?
}

pub async fn mirror_tree_async(source: PathBuf, destination: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || mirror_tree(&source, &destination, &[])).await?
}
