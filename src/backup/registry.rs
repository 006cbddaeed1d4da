//! Engine name to constructor tables.
//!
//! Every `[[source]]`, `[[filter]]`, `[[hook]]` table and the `[driver]` table
//! of a point file carries an `engine` key. The registry looks it up and hands
//! the whole table to the matching factory, which deserializes the typed
//! parameters of that engine.

use super::drivers::{BackupDriver, MirrorDriver, SnapshotsDriver};
use super::filters::{FileFilter, HashsumFilter};
use super::hooks::{CommandHook, Hook, LogHook};
use super::sources::{DumpSource, FilesSource, RsyncSource, Source};
use crate::error::ConfigError;
use anyhow::Result;
use config::Value;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type SourceFactory = fn(Value) -> Result<Box<dyn Source>>;
pub type FilterFactory = fn(Value) -> Result<Box<dyn FileFilter>>;
pub type DriverFactory = fn(Value) -> Result<Box<dyn BackupDriver>>;
pub type HookFactory = fn(Value) -> Result<Arc<dyn Hook>>;

pub struct Registry {
    sources: BTreeMap<&'static str, SourceFactory>,
    filters: BTreeMap<&'static str, FilterFactory>,
    drivers: BTreeMap<&'static str, DriverFactory>,
    hooks: BTreeMap<&'static str, HookFactory>,
}

fn typed<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(value.try_deserialize::<T>()?)
}

#[derive(Deserialize)]
struct LogHookParams {
    name: String,
}

#[derive(Deserialize)]
struct CommandHookParams {
    name: String,
    command: Vec<String>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_source("files", |v| Ok(Box::new(typed::<FilesSource>(v)?)));
        registry.register_source("rsync", |v| Ok(Box::new(typed::<RsyncSource>(v)?)));
        registry.register_source("dump", |v| Ok(Box::new(typed::<DumpSource>(v)?)));
        registry.register_filter("hashsum", |v| Ok(Box::new(typed::<HashsumFilter>(v)?)));
        registry.register_driver("mirror", |v| Ok(Box::new(typed::<MirrorDriver>(v)?)));
        registry.register_driver("snapshots", |v| Ok(Box::new(typed::<SnapshotsDriver>(v)?)));
        registry.register_hook("log", |v| {
            let params: LogHookParams = typed(v)?;
            Ok(Arc::new(LogHook::new(params.name)))
        });
        registry.register_hook("command", |v| {
            let params: CommandHookParams = typed(v)?;
            Ok(Arc::new(CommandHook::new(params.name, params.command)?))
        });
        registry
    }
}

impl Registry {
    /// A registry with no engine at all.
    pub fn empty() -> Self {
        Self {
            sources: BTreeMap::new(),
            filters: BTreeMap::new(),
            drivers: BTreeMap::new(),
            hooks: BTreeMap::new(),
        }
    }

    pub fn register_source(&mut self, engine: &'static str, factory: SourceFactory) {
        self.sources.insert(engine, factory);
    }

    pub fn register_filter(&mut self, engine: &'static str, factory: FilterFactory) {
        self.filters.insert(engine, factory);
    }

    pub fn register_driver(&mut self, engine: &'static str, factory: DriverFactory) {
        self.drivers.insert(engine, factory);
    }

    pub fn register_hook(&mut self, engine: &'static str, factory: HookFactory) {
        self.hooks.insert(engine, factory);
    }

    pub fn source(&self, table: Value) -> Result<Box<dyn Source>, ConfigError> {
        build(&self.sources, "source", table)
    }

    pub fn filter(&self, table: Value) -> Result<Box<dyn FileFilter>, ConfigError> {
        build(&self.filters, "filter", table)
    }

    pub fn driver(&self, table: Value) -> Result<Box<dyn BackupDriver>, ConfigError> {
        build(&self.drivers, "driver", table)
    }

    pub fn hook(&self, table: Value) -> Result<Arc<dyn Hook>, ConfigError> {
        build(&self.hooks, "hook", table)
    }

    /// Registered engine names per capability, for the plugins report.
    pub fn engines(&self) -> Vec<(&'static str, Vec<&'static str>)> {
        vec![
            ("sources", self.sources.keys().copied().collect()),
            ("filters", self.filters.keys().copied().collect()),
            ("drivers", self.drivers.keys().copied().collect()),
            ("hooks", self.hooks.keys().copied().collect()),
        ]
    }
}

fn engine_of(kind: &'static str, table: &Value) -> Result<String, ConfigError> {
    let missing = |message: String| ConfigError::Parameters {
        kind,
        engine: String::new(),
        message,
    };
    let map = table.clone().into_table().map_err(|e| missing(e.to_string()))?;
    let engine = map
        .get("engine")
        .cloned()
        .ok_or_else(|| missing("missing 'engine' key".to_string()))?;
    engine.into_string().map_err(|e| missing(e.to_string()))
}

fn build<T>(
    factories: &BTreeMap<&'static str, fn(Value) -> Result<T>>,
    kind: &'static str,
    table: Value,
) -> Result<T, ConfigError> {
    let engine = engine_of(kind, &table)?;
    let factory = factories
        .get(engine.as_str())
        .ok_or_else(|| ConfigError::UnknownEngine {
            kind,
            engine: engine.clone(),
        })?;
    factory(table).map_err(|e| ConfigError::Parameters {
        kind,
        engine,
        message: format!("{:#}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    fn tables(toml: &str, key: &str) -> Vec<Value> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        config.get_array(key).unwrap()
    }

    #[test]
    fn test_builds_builtin_engines() {
        let registry = Registry::default();
        let sources = tables(
            r#"
            [[source]]
            engine = "files"
            name = "etc"
            path = "/etc"

            [[source]]
            engine = "dump"
            name = "db"
            kind = "postgres"
            database = "app"
            destination = "app.sql"
            "#,
            "source",
        );
        let built: Vec<_> = sources.into_iter().map(|t| registry.source(t).unwrap()).collect();
        assert_eq!(built.iter().map(|s| s.engine()).collect::<Vec<_>>(), vec!["files", "dump"]);
        assert_eq!(built[1].name(), "db");

        let hooks = tables(
            r#"
            [[hook]]
            engine = "command"
            name = "notify"
            command = ["true"]
            "#,
            "hook",
        );
        assert_eq!(registry.hook(hooks[0].clone()).unwrap().name(), "notify");
    }

    #[test]
    fn test_unknown_engine() {
        let registry = Registry::default();
        let t = tables("[[filter]]\nengine = \"gpg\"\n", "filter");
        match registry.filter(t[0].clone()) {
            Err(ConfigError::UnknownEngine { kind, engine }) => {
                assert_eq!((kind, engine.as_str()), ("filter", "gpg"));
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_bad_parameters() {
        let registry = Registry::default();
        let t = tables("[[source]]\nengine = \"files\"\nname = \"etc\"\n", "source");
        assert!(matches!(
            registry.source(t[0].clone()),
            Err(ConfigError::Parameters { kind: "source", .. })
        ));

        let t = tables("[[hook]]\nengine = \"command\"\nname = \"x\"\ncommand = []\n", "hook");
        assert!(matches!(registry.hook(t[0].clone()), Err(ConfigError::Parameters { .. })));

        let t = tables("[[hook]]\nname = \"x\"\n", "hook");
        assert!(matches!(registry.hook(t[0].clone()), Err(ConfigError::Parameters { .. })));
    }

    #[test]
    fn test_engines_listing() {
        let engines = Registry::default().engines();
        assert_eq!(engines[0], ("sources", vec!["dump", "files", "rsync"]));
        assert_eq!(engines[3], ("hooks", vec!["command", "log"]));
        assert!(Registry::empty().engines().iter().all(|(_, names)| names.is_empty()));
    }
}
