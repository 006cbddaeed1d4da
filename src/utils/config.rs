use crate::backup::hooks::{HookBinding, HookEvent};
use crate::backup::matcher::{TagPatterns, TagPolicy};
use crate::backup::point::{BackupPoint, CollectPoint};
use crate::backup::registry::Registry;
use crate::backup::transport::Transport;
use crate::backup::{Frequency, Runner};
use crate::error::ConfigError;
use crate::storage::{InfoStore, RemoteInfoStore, Storage};
use anyhow::Result;
use config::{Config, File, FileFormat, Value};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const COLLECT_SUFFIX: &str = ".collect.toml";
const BACKUP_SUFFIX: &str = ".backup.toml";
const HOOKS_FILE: &str = "hooks.toml";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the point files
    pub config_dir: PathBuf,

    /// Working area of collect points without a `root`, and of backup points
    pub metadata_dir: PathBuf,

    /// SQLite status store and run history, when set
    pub database_url: Option<String>,

    /// How long a point waits for its lock marker
    pub lock_timeout: Duration,

    pub dry_run: bool,

    /// Status server port
    pub port: u16,

    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("archivist");
        let metadata_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("archivist");

        Self {
            config_dir,
            metadata_dir,
            database_url: None,
            lock_timeout: Duration::from_secs(1),
            dry_run: false,
            port: 8899,
            log_json: false,
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::Setting {
            key,
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}

impl Settings {
    /// Defaults, then `.env`, then `ARCHIVIST_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(dir) = lookup("ARCHIVIST_CONFIG_DIR") {
            settings.config_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("ARCHIVIST_METADATA_DIR") {
            settings.metadata_dir = PathBuf::from(dir);
        }

        if let Some(url) = lookup("ARCHIVIST_DATABASE_URL") {
            settings.database_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(timeout) = lookup("ARCHIVIST_LOCK_TIMEOUT") {
            settings.lock_timeout =
                humantime::parse_duration(&timeout).map_err(|e| ConfigError::Setting {
                    key: "ARCHIVIST_LOCK_TIMEOUT",
                    message: e.to_string(),
                })?;
        }

        if let Some(dry_run) = lookup("ARCHIVIST_DRY_RUN") {
            settings.dry_run = parse_bool("ARCHIVIST_DRY_RUN", &dry_run)?;
        }

        if let Some(port) = lookup("ARCHIVIST_PORT") {
            settings.port = port.parse().map_err(|e: std::num::ParseIntError| ConfigError::Setting {
                key: "ARCHIVIST_PORT",
                message: e.to_string(),
            })?;
        }

        if let Some(json) = lookup("ARCHIVIST_LOG_JSON") {
            settings.log_json = parse_bool("ARCHIVIST_LOG_JSON", &json)?;
        }

        Ok(settings)
    }
}

/// Shape shared by collect, backup and hooks files.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PointFile {
    name: Option<String>,
    root: Option<PathBuf>,
    tags: Option<Vec<String>>,
    included_tags: Option<Vec<String>>,
    excluded_tags: Vec<String>,
    frequency: String,
    metadata_remote: Option<String>,
    metadata_transport: Transport,
    driver: Option<Value>,
    source: Vec<Value>,
    filter: Vec<Value>,
    hook: Vec<Value>,
}

impl PointFile {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let parse = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .build()
            .map_err(parse)?
            .try_deserialize()
            .map_err(parse)
    }

    fn policy(&self, default_tag: &str) -> Result<TagPolicy, ConfigError> {
        let tags = match &self.tags {
            Some(tags) => tags.iter().cloned().collect(),
            None => BTreeSet::from([default_tag.to_string()]),
        };
        let included = match &self.included_tags {
            Some(patterns) => TagPatterns::new(patterns.iter().cloned())?,
            None => TagPatterns::everything(),
        };
        Ok(TagPolicy {
            tags,
            included,
            excluded: TagPatterns::new(self.excluded_tags.iter().cloned())?,
        })
    }

    fn hooks(&self, registry: &Registry) -> Result<Vec<HookBinding>, ConfigError> {
        self.hook.iter().map(|table| hook_binding(registry, table)).collect()
    }
}

#[derive(Deserialize)]
struct HookEvents {
    #[serde(default = "all_events")]
    events: Vec<HookEvent>,
}

fn all_events() -> Vec<HookEvent> {
    HookEvent::ALL.to_vec()
}

fn hook_binding(registry: &Registry, table: &Value) -> Result<HookBinding, ConfigError> {
    let events: HookEvents = table.clone().try_deserialize().map_err(|e| ConfigError::Parameters {
        kind: "hook",
        engine: String::new(),
        message: format!("events: {}", e),
    })?;
    let hook = registry.hook(table.clone())?;
    Ok(HookBinding::new(hook, events.events))
}

/// Everything declared in a configuration directory.
pub struct PointsConfig {
    pub collect_points: Vec<CollectPoint>,
    pub backup_points: Vec<BackupPoint>,
    pub hooks: Vec<HookBinding>,
}

fn point_files(config_dir: &Path, suffix: &str) -> Result<Vec<(String, PathBuf)>, ConfigError> {
    let io = |source| ConfigError::Io {
        path: config_dir.to_path_buf(),
        source,
    };
    let mut found = Vec::new();
    for entry in std::fs::read_dir(config_dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(stem) = file_name.strip_suffix(suffix) {
            if !stem.is_empty() && path.is_file() {
                found.push((stem.to_string(), path.clone()));
            }
        }
    }
    found.sort();
    Ok(found)
}

fn check_unique(kind: &'static str, seen: &mut BTreeSet<String>, name: &str) -> Result<(), ConfigError> {
    if seen.insert(name.to_string()) {
        Ok(())
    } else {
        Err(ConfigError::DuplicateName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Loads every point file of `config_dir`.
///
/// `shared_store`, when given, keeps all status records (the SQLite store).
/// Backup points with `metadata_remote` always use their remote location.
pub fn load_points(
    config_dir: &Path,
    metadata_dir: &Path,
    registry: &Registry,
    shared_store: Option<Arc<dyn InfoStore>>,
) -> Result<PointsConfig, ConfigError> {
    let mut collect_points = Vec::new();
    let mut names = BTreeSet::new();
    for (stem, path) in point_files(config_dir, COLLECT_SUFFIX)? {
        let file = PointFile::read(&path)?;
        let name = file.name.clone().unwrap_or(stem);
        check_unique("collect", &mut names, &name)?;

        let root = file
            .root
            .clone()
            .unwrap_or_else(|| metadata_dir.join("collect").join(&name));
        let mut point = CollectPoint::new(name.as_str(), root)
            .with_policy(file.policy("collect")?)
            .with_frequency(Frequency::parse(&file.frequency));
        for table in &file.source {
            point = point.with_source(registry.source(table.clone())?);
        }
        for table in &file.filter {
            point = point.with_filter(registry.filter(table.clone())?);
        }
        for binding in file.hooks(registry)? {
            point = point.with_hook(binding);
        }
        if let Some(store) = &shared_store {
            point = point.with_store(store.clone());
        }
        debug!("Loaded collect point {} from {}", name, path.display());
        collect_points.push(point);
    }

    let mut backup_points = Vec::new();
    let mut names = BTreeSet::new();
    for (stem, path) in point_files(config_dir, BACKUP_SUFFIX)? {
        let file = PointFile::read(&path)?;
        let name = file.name.clone().unwrap_or(stem);
        check_unique("backup", &mut names, &name)?;

        let driver = file.driver.clone().ok_or_else(|| ConfigError::Parameters {
            kind: "driver",
            engine: String::new(),
            message: format!("{} has no [driver] table", path.display()),
        })?;
        let root = file
            .root
            .clone()
            .unwrap_or_else(|| metadata_dir.join("backup").join(&name));
        let mut point = BackupPoint::new(name.as_str(), root.clone(), registry.driver(driver)?)
            .with_policy(file.policy("backup")?)
            .with_frequency(Frequency::parse(&file.frequency));
        for table in &file.filter {
            point = point.with_filter(registry.filter(table.clone())?);
        }
        for binding in file.hooks(registry)? {
            point = point.with_hook(binding);
        }
        if let Some(remote) = &file.metadata_remote {
            let remote = remote.trim_end_matches('/').to_string();
            let transport = file.metadata_transport;
            let store = RemoteInfoStore::new(root.join("metadata-cache"), move |file_name| {
                transport.open(&format!("{}/{}", remote, file_name))
            });
            point = point.with_store(Arc::new(store));
        } else if let Some(store) = &shared_store {
            point = point.with_store(store.clone());
        }
        debug!("Loaded backup point {} from {}", name, path.display());
        backup_points.push(point);
    }

    let hooks_path = config_dir.join(HOOKS_FILE);
    let hooks = if hooks_path.is_file() {
        PointFile::read(&hooks_path)?.hooks(registry)?
    } else {
        Vec::new()
    };

    info!(
        "Loaded {} collect points, {} backup points, {} global hooks from {}",
        collect_points.len(),
        backup_points.len(),
        hooks.len(),
        config_dir.display()
    );
    Ok(PointsConfig {
        collect_points,
        backup_points,
        hooks,
    })
}

/// Builds a runner from settings: opens the SQLite store when configured,
/// then loads the point files.
pub async fn build_runner(settings: &Settings, registry: &Registry) -> Result<Runner> {
    let history = match &settings.database_url {
        Some(url) => {
            let storage = Storage::new(url).await?;
            storage.run_migrations().await?;
            Some(storage)
        }
        None => None,
    };
    let shared = history
        .clone()
        .map(|storage| Arc::new(storage) as Arc<dyn InfoStore>);
    let points = load_points(&settings.config_dir, &settings.metadata_dir, registry, shared)?;

    let mut runner = Runner::new(points.collect_points, points.backup_points, points.hooks)
        .with_dry_run(settings.dry_run)
        .with_lock_timeout(settings.lock_timeout);
    if let Some(storage) = history {
        runner = runner.with_history(storage);
    }
    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn test_settings_from_lookup() {
        let env = HashMap::from([
            ("ARCHIVIST_CONFIG_DIR", "/srv/archivist"),
            ("ARCHIVIST_LOCK_TIMEOUT", "250ms"),
            ("ARCHIVIST_DRY_RUN", "yes"),
            ("ARCHIVIST_PORT", "9000"),
        ]);
        let settings = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.config_dir, PathBuf::from("/srv/archivist"));
        assert_eq!(settings.lock_timeout, Duration::from_millis(250));
        assert!(settings.dry_run);
        assert_eq!(settings.port, 9000);
        assert!(settings.database_url.is_none());

        let defaults = Settings::from_lookup(|_| None).unwrap();
        assert_eq!((defaults.port, defaults.lock_timeout), (8899, Duration::from_secs(1)));

        let bad = Settings::from_lookup(|k| (k == "ARCHIVIST_PORT").then(|| "http".to_string()));
        assert!(matches!(bad, Err(ConfigError::Setting { key: "ARCHIVIST_PORT", .. })));
    }

    #[test]
    fn test_load_points() {
        let dir = tempfile::tempdir().unwrap();
        let meta = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "app1.collect.toml",
            r#"
            tags = ["prod", "web"]
            frequency = "daily"

            [[source]]
            engine = "files"
            name = "www"
            path = "/var/www"

            [[filter]]
            engine = "hashsum"

            [[hook]]
            engine = "log"
            name = "trace"
            events = ["backup_error"]
            "#,
        );
        write(
            dir.path(),
            "offsite.backup.toml",
            r#"
            excluded_tags = ["dev*"]
            frequency = "weekly:0"

            [driver]
            engine = "snapshots"
            destination = "/mnt/offsite/{name}"
            keep = 3
            "#,
        );
        write(
            dir.path(),
            "hooks.toml",
            "[[hook]]\nengine = \"command\"\nname = \"mail\"\ncommand = [\"true\"]\n",
        );
        write(dir.path(), "README.md", "not a point");

        let points = load_points(dir.path(), meta.path(), &Registry::default(), None).unwrap();
        assert_eq!(points.collect_points.len(), 1);
        let app = &points.collect_points[0];
        assert_eq!(app.name, "app1");
        assert_eq!(app.frequency, Frequency::Every { seconds: 86_400 });
        assert_eq!(app.sources().len(), 1);
        assert_eq!(app.filters()[0].engine(), "hashsum");
        assert_eq!(app.import_data_path(), meta.path().join("collect/app1/import"));

        let offsite = &points.backup_points[0];
        assert_eq!(offsite.driver().engine(), "snapshots");
        assert_eq!(offsite.frequency, Frequency::Weekly { weekday: 0 });
        assert!(offsite.policy.tags.contains("backup"));
        assert!(crate::backup::can_associate(&app.policy, &offsite.policy));

        assert_eq!(points.hooks.len(), 1);
        assert_eq!(points.hooks[0].events.len(), HookEvent::ALL.len());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("meta");
        write(dir.path(), "a.backup.toml", "frequency = \"daily\"\n");
        let err = load_points(dir.path(), &meta, &Registry::default(), None).err().unwrap();
        assert!(matches!(err, ConfigError::Parameters { kind: "driver", .. }));

        std::fs::remove_file(dir.path().join("a.backup.toml")).unwrap();
        write(dir.path(), "a.collect.toml", "tags = [\"x\"]\nincluded_tags = [\"[\"]\n");
        let err = load_points(dir.path(), &meta, &Registry::default(), None).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));

        write(dir.path(), "a.collect.toml", "name = \"b\"\n");
        write(dir.path(), "b.collect.toml", "");
        let err = load_points(dir.path(), &meta, &Registry::default(), None).err().unwrap();
        assert!(matches!(err, ConfigError::DuplicateName { kind: "collect", .. }));

        let missing = load_points(&dir.path().join("nope"), &meta, &Registry::default(), None);
        assert!(matches!(missing.err(), Some(ConfigError::Io { .. })));
    }
}
