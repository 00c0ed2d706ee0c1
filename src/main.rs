use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use patchworkd::config::DaemonConfig;
use patchworkd::AppContext;

#[derive(Parser)]
#[command(
    name = "patchworkd",
    about = "Patchwork host — worktree lifecycle and pipeline orchestration daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for config and the SQLite database
    #[arg(long, env = "PATCHWORK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "PATCHWORK_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "PATCHWORK_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default when no subcommand given).
    ///
    /// Periodically reconciles persisted worktree records against disk for
    /// the given repository until interrupted.
    Serve {
        /// Repository to watch
        #[arg(long)]
        repo: PathBuf,
        /// Project identifier (default: repository directory name)
        #[arg(long)]
        project: Option<String>,
    },
    /// Run one reconcile pass and print the tally.
    Reconcile {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        project: Option<String>,
        /// Print the tally as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect managed worktrees.
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
    /// Approve a pending plan.
    Approve { approval_id: String },
    /// Reject a pending plan.
    Reject { approval_id: String },
}

#[derive(Subcommand)]
enum WorktreeAction {
    /// List active worktree records for a project.
    List {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".patchworkd"))
        .unwrap_or_else(|| PathBuf::from(".patchworkd"))
}

/// Project identity defaults to the repository directory name.
fn project_id_for(repo: &Path, explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| {
        repo.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string())
    })
}

fn init_tracing(
    filter: &str,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("patchworkd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(filter))
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(fmt::layer().compact())
            .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .compact()
            .init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    let config = DaemonConfig::load(data_dir, args.log.clone())
        .context("loading daemon configuration")?;
    let _log_guard = init_tracing(&config.log, args.log_file.as_deref());

    let ctx = AppContext::init(config).await?;

    match args.command {
        None => {
            // No default repo to watch without a subcommand — keep parity
            // with `--help` rather than guessing a repository.
            eprintln!("no subcommand given; see `patchworkd --help`");
            Ok(())
        }
        Some(Command::Serve { repo, project }) => serve(ctx, &repo, project).await,
        Some(Command::Reconcile {
            repo,
            project,
            json,
        }) => {
            let project = project_id_for(&repo, project);
            let report = ctx
                .reconciler(&repo)
                .run(&project, &repo)
                .await
                .map_err(anyhow::Error::from)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "reconciled: {} orphaned, {} untracked, {} expired locks, {} cleaned, {} errors",
                    report.orphaned,
                    report.untracked.len(),
                    report.expired_locks,
                    report.cleaned,
                    report.errors
                );
            }
            Ok(())
        }
        Some(Command::Worktree {
            action: WorktreeAction::List {
                repo,
                project,
                json,
            },
        }) => {
            let project = project_id_for(&repo, project);
            let records = ctx.storage.list_active(&project).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no active worktrees for project {project}");
            } else {
                for rec in records {
                    println!(
                        "{}  {}  {}  {}  locked_by={}",
                        rec.id,
                        rec.status,
                        rec.branch_name,
                        rec.worktree_path,
                        rec.locked_by.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }
        Some(Command::Approve { approval_id }) => resolve_approval(ctx, &approval_id, true).await,
        Some(Command::Reject { approval_id }) => resolve_approval(ctx, &approval_id, false).await,
    }
}

async fn serve(ctx: AppContext, repo: &Path, project: Option<String>) -> Result<()> {
    let project = project_id_for(repo, project);
    let worktree_config = ctx.config.worktree_for(repo);
    let reconciler = ctx.reconciler(repo);

    info!(
        repo = %repo.display(),
        project = %project,
        interval_secs = worktree_config.reconcile_interval_secs,
        "patchworkd serving"
    );

    // Startup pass repairs whatever a previous crash left behind.
    match reconciler.run(&project, repo).await {
        Ok(report) if !report.is_empty() => {
            info!(orphaned = report.orphaned, cleaned = report.cleaned, "startup reconcile done")
        }
        Ok(_) => {}
        Err(e) => warn!(err = %e, "startup reconcile failed"),
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        worktree_config.reconcile_interval_secs.max(1),
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = reconciler.run(&project, repo).await {
                    warn!(err = %e, "periodic reconcile failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn resolve_approval(ctx: AppContext, approval_id: &str, approve: bool) -> Result<()> {
    let gate = ctx.approval_gate();
    if gate.resolve(approval_id, approve).await? {
        println!(
            "plan {} {}",
            approval_id,
            if approve { "approved" } else { "rejected" }
        );
    } else {
        println!("plan {approval_id} not found or already resolved");
    }
    Ok(())
}
