//! Data-gathering adapters bound to a collect point.

use super::rsync::{exclude_options, run_rsync};
use super::RunContext;
use crate::utils::disk::mirror_tree_async;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Produces data into the collect point's import area, and puts it back on restore.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn engine(&self) -> &'static str;

    async fn backup(&self, import_path: &Path, ctx: &RunContext) -> Result<()>;

    async fn restore(&self, import_path: &Path, ctx: &RunContext) -> Result<()>;
}

fn default_destination() -> String {
    "files".to_string()
}

/// Copies a local directory tree.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesSource {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_destination")]
    pub destination: String,
}

#[async_trait]
impl Source for FilesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> &'static str {
        "files"
    }

    async fn backup(&self, import_path: &Path, ctx: &RunContext) -> Result<()> {
        let target = import_path.join(&self.destination);
        if ctx.dry_run {
            ctx.log.info(&self.name, format!("would copy {} to {}", self.path.display(), target.display()));
            return Ok(());
        }
        let copied = mirror_tree_async(self.path.clone(), target).await?;
        ctx.log.info(&self.name, format!("copied {} bytes from {}", copied, self.path.display()));
        Ok(())
    }

    async fn restore(&self, import_path: &Path, ctx: &RunContext) -> Result<()> {
        let origin = import_path.join(&self.destination);
        if ctx.dry_run {
            ctx.log.info(&self.name, format!("would restore {} to {}", origin.display(), self.path.display()));
            return Ok(());
        }
        mirror_tree_async(origin, self.path.clone()).await?;
        Ok(())
    }
}

/// Pulls a local or remote directory with rsync.
#[derive(Debug, Clone, Deserialize)]
pub struct RsyncSource {
    pub name: String,
    pub source_url: String,
    #[serde(default = "default_destination")]
    pub destination: String,
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[async_trait]
impl Source for RsyncSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> &'static str {
        "rsync"
    }

    async fn backup(&self, import_path: &Path, ctx: &RunContext) -> Result<()> {
        let target = import_path.join(&self.destination);
        tokio::fs::create_dir_all(&target).await?;
        let options = exclude_options(&self.excludes);
        run_rsync(&self.source_url, &target.to_string_lossy(), &options, true, ctx.dry_run).await
    }

    async fn restore(&self, import_path: &Path, ctx: &RunContext) -> Result<()> {
        let origin = import_path.join(&self.destination);
        run_rsync(&origin.to_string_lossy(), &self.source_url, &[], true, ctx.dry_run).await
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

/// Which dump tool a [`DumpSource`] drives.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DumpKind {
    Mysql {
        #[serde(default = "default_host")]
        host: String,
        port: Option<u16>,
        user: Option<String>,
        password: Option<String>,
        database: String,
    },
    Postgres {
        #[serde(default = "default_host")]
        host: String,
        port: Option<u16>,
        user: Option<String>,
        password: Option<String>,
        database: String,
    },
    Ldap {
        suffix: String,
    },
    Custom {
        dump: Vec<String>,
        load: Vec<String>,
    },
}

/// A command line plus the environment it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl DumpKind {
    fn connection(
        flags: [&str; 3],
        host: &str,
        port: Option<u16>,
        user: &Option<String>,
        argv: &mut Vec<String>,
    ) {
        argv.extend([flags[0].to_string(), host.to_string()]);
        if let Some(port) = port {
            argv.extend([flags[1].to_string(), port.to_string()]);
        }
        if let Some(user) = user {
            argv.extend([flags[2].to_string(), user.clone()]);
        }
    }

    fn invocation(&self, restore: bool) -> Invocation {
        match self {
            DumpKind::Mysql { host, port, user, password, database } => {
                let tool = if restore { "mysql" } else { "mysqldump" };
                let mut argv = vec![tool.to_string()];
                if !restore {
                    argv.push("--single-transaction".to_string());
                }
                Self::connection(["-h", "-P", "-u"], host, *port, user, &mut argv);
                argv.push(database.clone());
                let env = password.iter().map(|p| ("MYSQL_PWD".to_string(), p.clone())).collect();
                Invocation { argv, env }
            }
            DumpKind::Postgres { host, port, user, password, database } => {
                let tool = if restore { "psql" } else { "pg_dump" };
                let mut argv = vec![tool.to_string()];
                Self::connection(["-h", "-p", "-U"], host, *port, user, &mut argv);
                argv.extend(["-d".to_string(), database.clone()]);
                let env = password.iter().map(|p| ("PGPASSWORD".to_string(), p.clone())).collect();
                Invocation { argv, env }
            }
            DumpKind::Ldap { suffix } => {
                let tool = if restore { "slapadd" } else { "slapcat" };
                Invocation {
                    argv: vec![tool.to_string(), "-b".to_string(), suffix.clone()],
                    env: Vec::new(),
                }
            }
            DumpKind::Custom { dump, load } => Invocation {
                argv: if restore { load.clone() } else { dump.clone() },
                env: Vec::new(),
            },
        }
    }
}

/// Runs a dump tool and keeps its standard output as one file.
#[derive(Debug, Clone, Deserialize)]
pub struct DumpSource {
    pub name: String,
    #[serde(flatten)]
    pub kind: DumpKind,
    pub destination: String,
}

impl DumpSource {
    pub fn backup_invocation(&self) -> Invocation {
        self.kind.invocation(false)
    }

    pub fn restore_invocation(&self) -> Invocation {
        self.kind.invocation(true)
    }

    async fn run(&self, invocation: Invocation, file: &Path, restore: bool) -> Result<()> {
        let Some((program, args)) = invocation.argv.split_first() else {
            anyhow::bail!("{}: empty command", self.name);
        };
        let mut cmd = Command::new(program);
        cmd.args(args).envs(invocation.env).stderr(Stdio::piped());
        if restore {
            let input = std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;
            cmd.stdin(Stdio::from(input)).stdout(Stdio::null());
        } else {
            let output = std::fs::File::create(file).with_context(|| format!("creating {}", file.display()))?;
            cmd.stdin(Stdio::null()).stdout(Stdio::from(output));
        }

        let output = cmd.output().await.with_context(|| format!("spawning {}", program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} exited with {}: {}", program, output.status, stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl Source for DumpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> &'static str {
        "dump"
    }

    async fn backup(&self, import_path: &Path, ctx: &RunContext) -> Result<()> {
        let invocation = self.backup_invocation();
        let file = import_path.join(&self.destination);
        if ctx.dry_run {
            ctx.log.info(&self.name, format!("would run {:?} > {}", invocation.argv, file.display()));
            return Ok(());
        }
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.run(invocation, &file, false).await
    }

    async fn restore(&self, import_path: &Path, ctx: &RunContext) -> Result<()> {
        let invocation = self.restore_invocation();
        let file = import_path.join(&self.destination);
        if ctx.dry_run {
            ctx.log.info(&self.name, format!("would run {:?} < {}", invocation.argv, file.display()));
            return Ok(());
        }
        self.run(invocation, &file, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::log_buffer::RunLog;
    use std::time::Duration;

    fn ctx(dry_run: bool) -> RunContext {
        RunContext::new(dry_run, Duration::from_millis(50), RunLog::default())
    }

    #[test]
    fn test_dump_invocations() {
        let mysql = DumpKind::Mysql {
            host: "db".into(),
            port: Some(3307),
            user: Some("backup".into()),
            password: Some("s3cret".into()),
            database: "shop".into(),
        };
        let dump = mysql.invocation(false);
        assert_eq!(
            dump.argv,
            vec!["mysqldump", "--single-transaction", "-h", "db", "-P", "3307", "-u", "backup", "shop"]
        );
        assert_eq!(dump.env, vec![("MYSQL_PWD".to_string(), "s3cret".to_string())]);
        assert_eq!(mysql.invocation(true).argv[0], "mysql");

        let pg = DumpKind::Postgres {
            host: "localhost".into(),
            port: None,
            user: None,
            password: None,
            database: "crm".into(),
        };
        assert_eq!(pg.invocation(false).argv, vec!["pg_dump", "-h", "localhost", "-d", "crm"]);
        assert!(pg.invocation(false).env.is_empty());

        let ldap = DumpKind::Ldap { suffix: "dc=example,dc=org".into() };
        assert_eq!(ldap.invocation(true).argv, vec!["slapadd", "-b", "dc=example,dc=org"]);
    }

    #[tokio::test]
    async fn test_custom_dump_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let restored = dir.path().join("restored.txt");
        let source = DumpSource {
            name: "custom".into(),
            kind: DumpKind::Custom {
                dump: vec!["sh".into(), "-c".into(), "echo dumped".into()],
                load: vec!["sh".into(), "-c".into(), format!("cat > {}", restored.display())],
            },
            destination: "dumps/custom.txt".into(),
        };

        source.backup(dir.path(), &ctx(false)).await.unwrap();
        let dumped = std::fs::read_to_string(dir.path().join("dumps/custom.txt")).unwrap();
        assert_eq!(dumped, "dumped\n");

        source.restore(dir.path(), &ctx(false)).await.unwrap();
        assert_eq!(std::fs::read_to_string(restored).unwrap(), "dumped\n");
    }

    #[tokio::test]
    async fn test_failing_dump_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let source = DumpSource {
            name: "broken".into(),
            kind: DumpKind::Custom {
                dump: vec!["sh".into(), "-c".into(), "echo nope >&2; exit 3".into()],
                load: Vec::new(),
            },
            destination: "out.sql".into(),
        };
        let err = source.backup(dir.path(), &ctx(false)).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(source.restore(dir.path(), &ctx(false)).await.is_err());
    }

    #[tokio::test]
    async fn test_files_source_dry_run() {
        let src = tempfile::tempdir().unwrap();
        let import = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a"), b"1").unwrap();
        let source = FilesSource {
            name: "etc".into(),
            path: src.path().to_path_buf(),
            destination: "etc".into(),
        };
        let context = ctx(true);
        source.backup(import.path(), &context).await.unwrap();
        assert!(!import.path().join("etc").exists());
        assert_eq!(context.log.get_logs(None).len(), 1);

        source.backup(import.path(), &ctx(false)).await.unwrap();
        assert!(import.path().join("etc/a").exists());
    }
}
