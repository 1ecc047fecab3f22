//! hearthd: the hearth file daemon.
//!
//! ## Usage
//!
//! ```bash
//! # Watch the configured roots and keep favorites in sync
//! hearthd serve
//!
//! # One-shot operations against the virtual tree
//! hearthd ls /Home
//! hearthd cp /Home/a.txt /Home/Docs --collision keep-both
//! hearthd trash /Home/old.txt
//! hearthd restore /Trash/old.txt
//!
//! # Rewind
//! hearthd timeline r1
//! hearthd rewind r1:2024-05-01T03:00:00Z /Home --restore-to /Home
//! ```
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `info`); results go to
//! stdout, as JSON with `--json`.

mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hearth_kernel::{Files, FsError, Hearth, HearthConfig, KernelError, TransferFlow};
use hearth_types::{BackupId, Collision, LogicalPath, TransferJob, TransferState, WireError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Home-server file daemon.
#[derive(Parser, Debug)]
#[command(name = "hearthd", version)]
#[command(about = "Virtual filesystem, transfers and Rewind for a home server")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/hearth/hearth.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the change notifier and background tasks until interrupted
    Serve,
    /// List a directory
    Ls { path: String },
    /// Show one item and its allowed operations
    Stat { path: String },
    /// Case-insensitive name search
    Search {
        root: String,
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Rename in place
    Rename { path: String, new_name: String },
    /// Permanently delete (trash and external drives only)
    Rm { path: String },
    /// Copy sources into a directory
    Cp {
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
        /// error, keep-both or replace
        #[arg(long)]
        collision: Option<Collision>,
    },
    /// Move sources into a directory
    Mv {
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
        #[arg(long)]
        collision: Option<Collision>,
    },
    /// Move items to the trash
    Trash {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Put trashed items back where they came from
    Restore {
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long)]
        collision: Option<Collision>,
    },
    /// Permanently delete everything in the trash
    EmptyTrash,
    /// Manage favorites
    Favorites {
        #[command(subcommand)]
        action: FavoritesAction,
    },
    /// Report whether a folder holds a backup repository
    Detect { folder: String },
    /// List the snapshots of a configured repository
    Timeline { repository: String },
    /// Browse a snapshot, optionally copying a path out of it
    Rewind {
        /// `<repository>:<snapshot>`
        backup: String,
        path: String,
        /// Copy `path` from the snapshot into this live directory
        #[arg(long)]
        restore_to: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum FavoritesAction {
    List,
    Add { path: String },
    Remove { path: String },
}

fn logical(raw: &str) -> Result<LogicalPath> {
    LogicalPath::parse(raw).with_context(|| format!("bad path {raw:?}"))
}

fn logical_all(raw: &[String]) -> Result<Vec<LogicalPath>> {
    raw.iter().map(|p| logical(p)).collect()
}

/// Split `a b c dest` into sources and destination.
fn split_destination(paths: &[String]) -> Result<(Vec<LogicalPath>, LogicalPath)> {
    let Some((dest, sources)) = paths.split_last() else {
        bail!("need at least one source and a destination");
    };
    if sources.is_empty() {
        bail!("need at least one source and a destination");
    }
    Ok((logical_all(sources)?, logical(dest)?))
}

/// Block until `job` finishes, drawing progress on stderr.
async fn follow(hearth: &Hearth, job: TransferJob, json: bool) -> Result<TransferJob> {
    let engine = hearth.engine();
    let mut flows = engine.subscribe("transfer.progress");
    let wait = engine.wait(job.id);
    tokio::pin!(wait);

    let finished = loop {
        tokio::select! {
            done = &mut wait => break done?,
            Some(msg) = flows.recv() => {
                if let TransferFlow::Progress { id, progress } = msg.payload
                    && id == job.id
                    && !json
                {
                    eprint!("\r{}   ", render::progress_line(&progress));
                }
            }
        }
    };
    if !json {
        eprintln!();
    }
    Ok(finished)
}

async fn run_transfer(
    hearth: &Hearth,
    start: impl Future<Output = hearth_kernel::FsResult<TransferJob>>,
    json: bool,
) -> Result<bool> {
    let job = start.await?;
    tracing::debug!(job = %job.id, kind = %job.kind, "transfer started");
    let job = follow(hearth, job, json).await?;
    render::emit(json, &job, render::print_job)?;
    Ok(job.state == TransferState::Done)
}

async fn serve(hearth: &Hearth) -> Result<()> {
    let notifier = hearth.start_notifier()?;
    let tasks = hearth.spawn_background();
    let mut transfers = hearth.transfer_flows().subscribe("transfer.finished");
    let mut changes = hearth.change_flows().subscribe("fs.*");
    tracing::info!(watched = notifier.watched().len(), "hearthd serving");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(msg) = transfers.recv() => {
                if let TransferFlow::Finished { job } = msg.payload {
                    tracing::info!(job = %job.id, kind = %job.kind, state = %job.state, "transfer finished");
                }
            }
            Some(msg) = changes.recv() => {
                tracing::debug!(subject = %msg.subject, path = %msg.payload.path, "change");
            }
        }
    }

    tracing::info!("interrupted, shutting down");
    hearth.shutdown();
    notifier.stop();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}

async fn rewind(
    hearth: &Hearth,
    backup: &str,
    path: &str,
    restore_to: Option<&str>,
    json: bool,
) -> Result<bool> {
    let backup = BackupId::parse(backup)
        .with_context(|| format!("expected <repository>:<snapshot>, got {backup:?}"))?;
    let view = hearth.rewind();
    view.session.select_backup(&backup).await?;
    let path = logical(path)?;

    match restore_to {
        None => {
            let listing = view.files.list(&path).await?;
            render::emit(json, &listing, render::print_listing)?;
            Ok(true)
        }
        Some(dest) => {
            let start = view.files.copy(vec![path], logical(dest)?, Some(Collision::KeepBoth));
            run_transfer(hearth, start, json).await
        }
    }
}

/// Runs one command. `Ok(false)` means it ran but did not succeed.
async fn run(cli: Cli) -> Result<bool> {
    let config = HearthConfig::load(cli.config.as_deref())?;
    let hearth = Hearth::new(config)?;
    hearth.prepare().await?;
    let files: &Files = hearth.files();
    let json = cli.json;

    match cli.command {
        Command::Serve => serve(&hearth).await?,
        Command::Ls { path } => {
            let listing = files.list(&logical(&path)?).await?;
            render::emit(json, &listing, render::print_listing)?;
        }
        Command::Stat { path } => {
            let item = files.status(&logical(&path)?).await?;
            render::emit(json, &item, render::print_item)?;
        }
        Command::Search { root, query, limit } => {
            let found = files.search(&logical(&root)?, &query, limit).await?;
            render::emit(json, &found, |items| render::print_paths(items))?;
        }
        Command::Mkdir { path } => {
            let created = files.create_directory(&logical(&path)?).await?;
            render::emit(json, &created, |p| println!("{p}"))?;
        }
        Command::Rename { path, new_name } => {
            let renamed = files.rename(&logical(&path)?, &new_name).await?;
            render::emit(json, &renamed, |p| println!("{p}"))?;
        }
        Command::Rm { path } => {
            files.delete(&logical(&path)?).await?;
        }
        Command::Cp { paths, collision } => {
            let (sources, dest) = split_destination(&paths)?;
            return run_transfer(&hearth, files.copy(sources, dest, collision), json).await;
        }
        Command::Mv { paths, collision } => {
            let (sources, dest) = split_destination(&paths)?;
            return run_transfer(&hearth, files.move_to(sources, dest, collision), json).await;
        }
        Command::Trash { paths } => {
            return run_transfer(&hearth, files.trash(logical_all(&paths)?), json).await;
        }
        Command::Restore { paths, collision } => {
            let start = files.restore(logical_all(&paths)?, collision);
            return run_transfer(&hearth, start, json).await;
        }
        Command::EmptyTrash => {
            files.empty_trash().await?;
        }
        Command::Favorites { action } => {
            let favorites = hearth.favorites();
            match action {
                FavoritesAction::List => {}
                FavoritesAction::Add { path } => {
                    favorites.add(&logical(&path)?).await?;
                }
                FavoritesAction::Remove { path } => {
                    favorites.remove(&logical(&path)?).await?;
                }
            }
            let list = favorites.list().await?;
            render::emit(json, &list, |paths| {
                for p in paths {
                    println!("{p}");
                }
            })?;
        }
        Command::Detect { folder } => {
            let candidate = hearth.detector().detect(&folder).await;
            render::emit(json, &candidate, render::print_candidate)?;
        }
        Command::Timeline { repository } => {
            let snapshots = hearth.timeline().timeline(&repository).await?;
            render::emit(json, &snapshots, |s| render::print_timeline(s))?;
        }
        Command::Rewind { backup, path, restore_to } => {
            return rewind(&hearth, &backup, &path, restore_to.as_deref(), json).await;
        }
    }
    Ok(true)
}

/// The wire form of the first filesystem error in `e`'s chain.
fn wire_error(e: &anyhow::Error) -> Option<WireError> {
    e.chain().find_map(|cause| {
        if let Some(fs) = cause.downcast_ref::<FsError>() {
            return Some(fs.to_wire());
        }
        match cause.downcast_ref::<KernelError>() {
            Some(KernelError::Fs(fs)) => Some(fs.to_wire()),
            _ => None,
        }
    })
}

/// What the user sees for a failed command. Filesystem errors show only
/// their code and canonical message; OS and copy program detail stays in
/// the debug log.
fn failure_message(e: &anyhow::Error, json: bool) -> String {
    match wire_error(e) {
        Some(wire) if json => serde_json::to_string(&wire).unwrap_or_else(|_| format!("hearthd: {wire}")),
        Some(wire) => format!("hearthd: {wire}"),
        None => format!("hearthd: {e:#}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::debug!("command failed: {e:#}");
            eprintln!("{}", failure_message(&e, json));
            ExitCode::FAILURE
        }
    }
}
