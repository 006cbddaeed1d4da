//! Persistence of point status records.

use crate::backup::info::{InfoKey, PointInfo};
use crate::backup::transport::StorageBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[async_trait]
pub trait InfoStore: Send + Sync {
    /// Returns a default record when nothing was persisted yet.
    async fn get_info(&self, key: &InfoKey) -> Result<PointInfo>;

    async fn set_info(&self, key: &InfoKey, info: &PointInfo) -> Result<()>;
}

/// One pretty-printed JSON file per record.
#[derive(Debug, Clone)]
pub struct JsonInfoStore {
    root: PathBuf,
}

impl JsonInfoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &InfoKey) -> PathBuf {
        self.root.join(format!("{}.json", key.file_stem()))
    }
}

async fn read_info(path: &Path) -> Result<PointInfo> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("decoding status record {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PointInfo::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

async fn write_info(path: &Path, info: &PointInfo) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_json::to_string_pretty(info)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("writing status record {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl InfoStore for JsonInfoStore {
    async fn get_info(&self, key: &InfoKey) -> Result<PointInfo> {
        read_info(&self.path_for(key)).await
    }

    async fn set_info(&self, key: &InfoKey, info: &PointInfo) -> Result<()> {
        write_info(&self.path_for(key), info).await
    }
}

/// JSON records kept in a local cache and mirrored to a distant location.
pub struct RemoteInfoStore {
    cache: JsonInfoStore,
    open: Box<dyn Fn(&str) -> Box<dyn StorageBackend> + Send + Sync>,
}

impl RemoteInfoStore {
    /// `open` maps a record file name to the backend holding that file.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        open: impl Fn(&str) -> Box<dyn StorageBackend> + Send + Sync + 'static,
    ) -> Self {
        Self {
            cache: JsonInfoStore::new(cache_dir),
            open: Box::new(open),
        }
    }

    fn backend(&self, key: &InfoKey) -> Box<dyn StorageBackend> {
        (self.open)(&format!("{}.json", key.file_stem()))
    }
}

#[async_trait]
impl InfoStore for RemoteInfoStore {
    async fn get_info(&self, key: &InfoKey) -> Result<PointInfo> {
        let local = self.cache.path_for(key);
        let backend = self.backend(key);
        debug!("Fetching status record from {}", backend.location());
        backend.sync_file_to_local(&local).await?;
        read_info(&local).await
    }

    async fn set_info(&self, key: &InfoKey, info: &PointInfo) -> Result<()> {
        let local = self.cache.path_for(key);
        write_info(&local, info).await?;
        self.backend(key).sync_file_from_local(&local).await
    }
}

/// SQLite-backed records plus a history of runner passes.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create database file if it doesn't exist
        if !database_url.contains(":memory:") {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if !Path::new(path).exists() {
                tokio::fs::File::create(path).await?;
            }
        }

        let pool = SqlitePool::connect(database_url).await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS point_infos (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_history (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                pairs INTEGER NOT NULL,
                failures TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_history (id, kind, started_at, finished_at, pairs, failures)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&run.id)
        .bind(&run.kind)
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.to_rfc3339())
        .bind(run.pairs as i64)
        .bind(serde_json::to_string(&run.failures)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT id, kind, started_at, finished_at, pairs, failures
             FROM run_history ORDER BY started_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<RunRecord> {
                let started: String = row.get("started_at");
                let finished: String = row.get("finished_at");
                let failures: String = row.get("failures");
                let pairs: i64 = row.get("pairs");
                Ok(RunRecord {
                    id: row.get("id"),
                    kind: row.get("kind"),
                    started_at: DateTime::parse_from_rfc3339(&started)?.with_timezone(&Utc),
                    finished_at: DateTime::parse_from_rfc3339(&finished)?.with_timezone(&Utc),
                    pairs: pairs.max(0) as usize,
                    failures: serde_json::from_str(&failures)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl InfoStore for Storage {
    async fn get_info(&self, key: &InfoKey) -> Result<PointInfo> {
        let row = sqlx::query("SELECT data FROM point_infos WHERE key = ?1")
            .bind(key.file_stem())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(serde_json::from_str(&data)?)
            }
            None => Ok(PointInfo::default()),
        }
    }

    async fn set_info(&self, key: &InfoKey, info: &PointInfo) -> Result<()> {
        let data = serde_json::to_string(info)?;

        sqlx::query(
            r#"
            INSERT INTO point_infos (key, data, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key.file_stem())
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// One runner pass, as kept in `run_history`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RunRecord {
    pub id: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs: usize,
    pub failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::transport::LocalBackend;

    fn sample() -> PointInfo {
        let mut info = PointInfo::default();
        info.record_success(Utc::now());
        info.total_size = 42;
        info.variables.insert("Y".into(), "2016".into());
        info
    }

    #[tokio::test]
    async fn test_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonInfoStore::new(dir.path());
        let key = InfoKey::backup("remote1", "app1");

        assert_eq!(store.get_info(&key).await.unwrap(), PointInfo::default());
        let info = sample();
        store.set_info(&key, &info).await.unwrap();
        assert_eq!(store.get_info(&key).await.unwrap(), info);
        assert!(dir.path().join("backup--remote1--app1.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonInfoStore::new(dir.path());
        let key = InfoKey::collect("app1");
        tokio::fs::write(store.path_for(&key), "{not json").await.unwrap();
        assert!(store.get_info(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_store_mirrors_records() {
        let cache = tempfile::tempdir().unwrap();
        let distant = tempfile::tempdir().unwrap();
        let root = distant.path().to_path_buf();
        let store = RemoteInfoStore::new(cache.path(), move |file| {
            Box::new(LocalBackend::new(root.join(file))) as Box<dyn StorageBackend>
        });
        let key = InfoKey::backup("offsite", "db");

        assert_eq!(store.get_info(&key).await.unwrap(), PointInfo::default());
        let info = sample();
        store.set_info(&key, &info).await.unwrap();
        assert!(distant.path().join("backup--offsite--db.json").exists());

        tokio::fs::remove_dir_all(cache.path()).await.unwrap();
        assert_eq!(store.get_info(&key).await.unwrap(), info);
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.run_migrations().await.unwrap();
        let key = InfoKey::collect("app1");

        assert_eq!(storage.get_info(&key).await.unwrap(), PointInfo::default());
        let info = sample();
        storage.set_info(&key, &info).await.unwrap();
        storage.set_info(&key, &info).await.unwrap();
        assert_eq!(storage.get_info(&key).await.unwrap(), info);

        let run = RunRecord {
            id: "r1".into(),
            kind: "backup".into(),
            started_at: info.last_success.unwrap(),
            finished_at: info.last_success.unwrap(),
            pairs: 3,
            failures: vec!["(remote1, app1)".into()],
        };
        storage.record_run(&run).await.unwrap();
        assert_eq!(storage.recent_runs(5).await.unwrap(), vec![run]);
    }
}
