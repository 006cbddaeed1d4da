use anyhow::Result;
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use archivist::backup::registry::Registry;
use archivist::backup::rsync::check_rsync;
use archivist::backup::runner::{CheckReport, Health};
use archivist::backup::{RunReport, Runner};
use archivist::cli::{Cli, Commands};
use archivist::utils::config::{build_runner, Settings};
use archivist::utils::logging::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("archivist: {}", e);
            return ExitCode::from(2);
        }
    };
    cli.apply(&mut settings);
    init_tracing(settings.log_json, cli.log_directive());

    match run(cli, settings).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<i32> {
    let registry = Registry::default();

    if let Commands::Plugins = cli.command {
        print_plugins(&registry).await;
        return Ok(0);
    }

    let runner = build_runner(&settings, &registry).await?;
    if settings.dry_run {
        info!("Dry run: nothing will be written");
    }

    match cli.command {
        Commands::Backup(args) => {
            let report = runner.backup(&args.request()).await;
            print_report("backup", &report);
            Ok(report.exit_code())
        }
        Commands::Restore(args) => {
            let report = runner.restore(&args.restore_request()).await;
            print_report("restore", &report);
            Ok(report.exit_code())
        }
        Commands::Config => {
            print_config(&runner);
            Ok(0)
        }
        Commands::Check(args) => {
            let report = runner.check(chrono::Utc::now()).await;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_check(&report);
            }
            Ok(report.exit_code())
        }
        Commands::Serve(_) => {
            serve(runner, settings.port).await?;
            Ok(0)
        }
        Commands::Plugins => Ok(0),
    }
}

fn print_report(kind: &str, report: &RunReport) {
    for (name, ok) in &report.collect {
        println!("{:<8} {}", if *ok { "ok" } else { "FAILED" }, name);
    }
    for ((backup, collect), ok) in &report.backup {
        println!("{:<8} ({}, {})", if *ok { "ok" } else { "FAILED" }, backup, collect);
    }
    let failures = report.failures();
    if failures.is_empty() {
        info!("{} finished in {}s", kind, (report.finished_at - report.started_at).num_seconds());
    } else {
        warn!("{} finished with {} failure(s)", kind, failures.len());
    }
}

fn print_check(report: &CheckReport) {
    for entry in &report.entries {
        let health = match entry.health {
            Health::Ok => "ok",
            Health::OutOfDate => "STALE",
            Health::Failed => "FAILED",
        };
        let last = entry
            .last_success
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        if entry.message.is_empty() {
            println!("{:<8} {:<30} last success: {}", health, entry.point, last);
        } else {
            println!("{:<8} {:<30} last success: {} ({})", health, entry.point, last, entry.message);
        }
    }
}

fn print_config(runner: &Runner) {
    println!("Collect points:");
    for cp in runner.collect_points() {
        let tags: Vec<&str> = cp.policy.tags.iter().map(String::as_str).collect();
        println!("  {} [{}] frequency: {}", cp.name, tags.join(", "), cp.frequency);
        for source in cp.sources() {
            println!("    source {} ({})", source.name(), source.engine());
        }
        for filter in cp.filters() {
            println!("    filter {} ({})", filter.name(), filter.engine());
        }
    }
    println!("Backup points:");
    for bp in runner.backup_points() {
        let tags: Vec<&str> = bp.policy.tags.iter().map(String::as_str).collect();
        println!("  {} [{}] frequency: {}", bp.name, tags.join(", "), bp.frequency);
        println!("    driver {}", bp.driver().describe());
        for filter in bp.filters() {
            println!("    filter {} ({})", filter.name(), filter.engine());
        }
    }
    println!("Associations:");
    for (collect, backups) in runner.associations() {
        if backups.is_empty() {
            println!("  {} -> (none)", collect);
        } else {
            println!("  {} -> {}", collect, backups.join(", "));
        }
    }
}

async fn print_plugins(registry: &Registry) {
    for (capability, engines) in registry.engines() {
        println!("{}: {}", capability, engines.join(", "));
    }
    match check_rsync().await {
        Ok(version) => println!("rsync: {}", version),
        Err(e) => println!("rsync: unavailable ({:#})", e),
    }
}

async fn serve(runner: Runner, port: u16) -> Result<()> {
    let app = Router::new()
        .nest("/api", archivist::api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(runner));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Status server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
