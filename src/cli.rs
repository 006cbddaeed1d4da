//! CLI argument parsing with clap

use crate::backup::{BackupRequest, RestoreRequest};
use crate::utils::config::Settings;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Archivist - configuration-driven backups from collect points to backup points
#[derive(Parser, Debug)]
#[command(name = "archivist")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding the point files
    #[arg(short, long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Working directory for points without an explicit root
    #[arg(long, global = true)]
    pub metadata_dir: Option<PathBuf>,

    /// SQLite URL for status records and run history
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Time to wait for a point lock (e.g. "1s", "500ms")
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub lock_timeout: Option<Duration>,

    /// Log only what would be done
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run collect points, then their backup points
    Backup(BackupArgs),

    /// Bring data back from backup points into the sources
    Restore(SelectionArgs),

    /// Show points, tags, frequencies and associations
    Config,

    /// Report points that are failed or out of date
    Check(CheckArgs),

    /// List available engines
    Plugins,

    /// Serve point status over HTTP
    Serve(ServeArgs),
}

/// Point selection shared by backup and restore.
#[derive(Args, Debug, Default)]
pub struct SelectionArgs {
    /// Only these collect points (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub only_collect_points: Vec<String>,

    /// Only these backup points (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub only_backup_points: Vec<String>,

    /// Do not run collect points
    #[arg(long)]
    pub skip_collect: bool,

    /// Do not run backup points
    #[arg(long)]
    pub skip_backup: bool,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Ignore frequencies
    #[arg(short, long)]
    pub force: bool,

    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,
}

fn names(values: &[String]) -> Option<BTreeSet<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().cloned().collect())
    }
}

impl SelectionArgs {
    pub fn restore_request(&self) -> RestoreRequest {
        RestoreRequest {
            only_collect_points: names(&self.only_collect_points),
            only_backup_points: names(&self.only_backup_points),
            skip_collect: self.skip_collect,
            skip_backup: self.skip_backup,
        }
    }
}

impl BackupArgs {
    pub fn request(&self) -> BackupRequest {
        BackupRequest {
            force: self.force,
            only_collect_points: names(&self.selection.only_collect_points),
            only_backup_points: names(&self.selection.only_backup_points),
            skip_collect: self.selection.skip_collect,
            skip_backup: self.selection.skip_backup,
        }
    }
}

impl Cli {
    /// Command line flags override environment and defaults.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(dir) = &self.config_dir {
            settings.config_dir = dir.clone();
        }
        if let Some(dir) = &self.metadata_dir {
            settings.metadata_dir = dir.clone();
        }
        if let Some(url) = &self.database_url {
            settings.database_url = Some(url.clone());
        }
        if let Some(timeout) = self.lock_timeout {
            settings.lock_timeout = timeout;
        }
        if let Commands::Serve(ServeArgs { port: Some(port) }) = &self.command {
            settings.port = *port;
        }
        settings.dry_run |= self.dry_run;
        settings.log_json |= self.log_json;
    }

    /// Filter directive derived from -v / -q, if any.
    pub fn log_directive(&self) -> Option<&'static str> {
        match (self.quiet, self.verbose) {
            (true, _) => Some("error"),
            (false, 0) => None,
            (false, 1) => Some("debug"),
            (false, _) => Some("trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_flags() {
        let cli = Cli::parse_from([
            "archivist",
            "--dry-run",
            "backup",
            "--force",
            "--only-collect-points",
            "app1,app2",
            "--skip-backup",
        ]);
        let Commands::Backup(args) = &cli.command else {
            panic!("expected backup");
        };
        let request = args.request();
        assert!(request.force && request.skip_backup && !request.skip_collect);
        assert_eq!(
            request.only_collect_points,
            Some(BTreeSet::from(["app1".to_string(), "app2".to_string()]))
        );
        assert!(request.only_backup_points.is_none());

        let mut settings = Settings::default();
        cli.apply(&mut settings);
        assert!(settings.dry_run);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "archivist",
            "serve",
            "--port",
            "9100",
            "--config-dir",
            "/srv/points",
            "--lock-timeout",
            "3s",
            "-vv",
        ]);
        let mut settings = Settings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.config_dir, PathBuf::from("/srv/points"));
        assert_eq!(settings.lock_timeout, Duration::from_secs(3));
        assert_eq!(cli.log_directive(), Some("trace"));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
