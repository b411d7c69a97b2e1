use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use sift_core::Config;
use sift_index::session::{StopOutcome, running_owner, stop_owner};
use sift_index::{AnyStore, Session, SessionSettings, StartOutcome, StoreConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sift", version)]
#[command(about = "Incremental code index with live watching and ranked search")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Project root
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Config file (defaults to `$SIFT_CONFIG` or `<root>/.sift/config.toml`)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Index the project and keep it current until interrupted
    Start,
    /// Stop the process that owns the project
    Stop,
    /// Show the owning process and index totals
    Status,
    /// Ranked chunks matching a query, as JSON
    Search {
        /// Query text
        #[arg(required = true, trailing_var_arg = true)]
        query: Vec<String>,

        /// Maximum number of results
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Run one full reconciliation and print its report
    Reindex,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Config::default_path(&cli.root));
    let config = Config::load(&config_path)?;
    config.validate()?;
    let settings = config.session_settings(&cli.root);

    match cli.command {
        Command::Start => start(&config, settings).await,
        Command::Stop => stop(&config, &settings).await,
        Command::Status => status(&settings).await,
        Command::Search { query, limit } => search(&settings, &query.join(" "), limit).await,
        Command::Reindex => reindex(&config, settings).await,
    }
}

async fn start(config: &Config, settings: SessionSettings) -> anyhow::Result<()> {
    let mut session = match Session::start(settings).await? {
        StartOutcome::Started(session) => session,
        StartOutcome::AlreadyRunning { pid } => {
            print_json(&json!({ "status": "already-running", "pid": pid }))?;
            return Ok(());
        }
    };
    print_json(&json!({
        "status": "started",
        "pid": std::process::id(),
        "projectId": session.project_id(),
        "root": session.paths().root,
        "rankingMode": session.ranking_mode(),
    }))?;

    tokio::select! {
        () = shutdown_signal() => tracing::info!("received shutdown signal"),
        pass = session.wait_initial_pass() => {
            match pass {
                Ok(Some(report)) => tracing::info!(
                    changed = report.files_changed(),
                    failed = report.files_failed,
                    "initial reconciliation finished"
                ),
                Ok(None) => {}
                Err(e) => tracing::error!("initial reconciliation failed: {e}"),
            }
            shutdown_signal().await;
            tracing::info!("received shutdown signal");
        }
    }

    let summary = session.stop(config.stop_grace()).await?;
    if let Some(watch) = summary.watch {
        tracing::info!(
            events = watch.events_received,
            flushed = watch.paths_flushed,
            full_passes = watch.full_passes,
            "watcher totals"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            tracing::error!("failed to listen for ctrl-c: {e}");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("failed to install SIGTERM handler: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
    }
}

async fn stop(config: &Config, settings: &SessionSettings) -> anyhow::Result<()> {
    let paths = settings.resolve_paths()?;
    let outcome = stop_owner(&paths.lock_file, config.stop_grace())
        .await
        .context("failed to stop session")?;
    let value = match outcome {
        StopOutcome::NotRunning => json!({ "status": "not-running" }),
        StopOutcome::Stopped { pid } => json!({ "status": "stopped", "pid": pid }),
        StopOutcome::Killed { pid } => json!({ "status": "killed", "pid": pid }),
    };
    print_json(&value)
}

async fn status(settings: &SessionSettings) -> anyhow::Result<()> {
    let paths = settings.resolve_paths()?;
    let owner = running_owner(&paths.state_dir)?;
    let store = open_store(settings, &paths.sqlite_path).await?;
    let stats = store.get_stats(&paths.project_id).await;
    let ranking = store.ranking_mode();
    store.close().await;

    print_json(&json!({
        "projectId": paths.project_id,
        "root": paths.root,
        "running": owner.is_some(),
        "pid": owner,
        "rankingMode": ranking,
        "stats": stats.context("failed to read index totals")?,
    }))
}

async fn search(settings: &SessionSettings, query: &str, limit: usize) -> anyhow::Result<()> {
    let paths = settings.resolve_paths()?;
    let store = open_store(settings, &paths.sqlite_path).await?;
    let results = store.search(&paths.project_id, query, limit).await;
    store.close().await;
    print_json(&results.context("search failed")?)
}

async fn reindex(config: &Config, mut settings: SessionSettings) -> anyhow::Result<()> {
    settings.watch = None;
    let mut session = match Session::start(settings).await? {
        StartOutcome::Started(session) => session,
        StartOutcome::AlreadyRunning { pid } => {
            bail!("project is owned by running session (pid {pid}); it keeps the index current")
        }
    };
    let pass = session.wait_initial_pass().await;
    session.stop(config.stop_grace()).await?;
    match pass? {
        Some(report) => print_json(&report),
        None => Ok(()),
    }
}

async fn open_store(settings: &SessionSettings, sqlite_path: &Path) -> anyhow::Result<AnyStore> {
    if !sqlite_path.exists() {
        bail!(
            "no index at {}; run `sift start` or `sift reindex` first",
            sqlite_path.display()
        );
    }
    AnyStore::open(&StoreConfig {
        sqlite_path: sqlite_path.to_path_buf(),
        ..settings.store.clone()
    })
    .await
    .context("failed to open index")
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
