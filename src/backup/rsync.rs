use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Builds an rsync invocation mirroring `source` into `destination`.
///
/// Directory arguments get a trailing slash so rsync copies contents, not the
/// directory itself.
pub fn rsync_command(source: &str, destination: &str, options: &[String], directory: bool) -> Command {
    let mut cmd = Command::new("rsync");
    cmd.args(["-a", "--delete", "-S"]);
    cmd.args(options);

    if directory {
        cmd.arg(with_trailing_slash(source));
        cmd.arg(with_trailing_slash(destination));
    } else {
        cmd.arg(source);
        cmd.arg(destination);
    }
    cmd
}

pub fn exclude_options(excludes: &[String]) -> Vec<String> {
    excludes.iter().map(|e| format!("--exclude={}", e)).collect()
}

/// Runs rsync, or only logs it in dry-run mode.
pub async fn run_rsync(
    source: &str,
    destination: &str,
    options: &[String],
    directory: bool,
    dry_run: bool,
) -> Result<()> {
    let mut cmd = rsync_command(source, destination, options, directory);
    if dry_run {
        debug!("Dry run, skipping: {:?}", cmd.as_std());
        return Ok(());
    }

    debug!("Running rsync command: {:?}", cmd.as_std());
    let output = cmd.output().await.context("spawning rsync")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("rsync failed: {}", stderr.trim()));
    }

    Ok(())
}

/// Check if rsync is available
pub async fn check_rsync() -> Result<String> {
    let output = Command::new("rsync").arg("--version").output().await?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("rsync not found"));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or("unknown").to_string())
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_arguments() {
        let options = exclude_options(&["*.tmp".to_string()]);
        let cmd = rsync_command("/srv/data", "backup@host:/dest/", &options, true);
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["-a", "--delete", "-S", "--exclude=*.tmp", "/srv/data/", "backup@host:/dest/"]
        );
    }

    #[test]
    fn test_file_arguments() {
        let cmd = rsync_command("/srv/info.json", "host:/meta/info.json", &[], false);
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args.last().map(String::as_str), Some("host:/meta/info.json"));
    }
}
