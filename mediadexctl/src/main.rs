//! mediadexctl: administration and worker entrypoints for mediadex. One
//! worker role per OS process; every subcommand exits 0 on success and 1 on
//! any user-visible error.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use sqlx::PgPool;

use mediadex_core::config::Config;
use mediadex_core::model::AssetStatus;
use mediadex_core::repository::{asset as asset_repo, library as library_repo, system as system_repo};
use mediadex_core::scanner::ScannerStage;
use mediadex_core::stage::ai::{AiImageStage, AiVideoStage, AnalysisMode};
use mediadex_core::stage::image::ImageProxyStage;
use mediadex_core::stage::video::VideoProxyStage;
use mediadex_core::vision::create_analyzer;
use mediadex_core::worker::run_worker;
use mediadex_core::{db, logging, maintenance};

#[derive(Parser)]
#[command(name = "mediadexctl", version, about = "Index and search large media libraries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add, remove, restore and list libraries.
    Library {
        #[command(subcommand)]
        cmd: LibraryCmd,
    },
    /// Manage soft-deleted libraries.
    Trash {
        #[command(subcommand)]
        cmd: TrashCmd,
    },
    /// One-shot scanner run for a library.
    Scan {
        slug: String,
        #[arg(long, short)]
        verbose: bool,
    },
    /// Image proxy worker.
    Proxy(WorkerArgs),
    /// Video proxy worker (transcode, head clip, scene indexing).
    VideoProxy(WorkerArgs),
    /// AI vision workers and model administration.
    Ai {
        #[command(subcommand)]
        cmd: AiCmd,
    },
    /// Inspect assets.
    Asset {
        #[command(subcommand)]
        cmd: AssetCmd,
    },
    /// Janitor tasks.
    Maintenance {
        #[command(subcommand)]
        cmd: MaintenanceCmd,
    },
}

#[derive(Subcommand)]
enum LibraryCmd {
    /// Register a library. Fails on slug collision, trashed libraries included.
    Add { name: String, path: String },
    /// Soft-delete a library (move to trash).
    Remove { slug: String },
    /// Restore a library from the trash.
    Restore { slug: String },
    /// Print a table of libraries.
    List {
        #[arg(long)]
        include_deleted: bool,
    },
}

#[derive(Subcommand)]
enum TrashCmd {
    /// Permanently delete one trashed library (chunked).
    Empty {
        slug: String,
        #[arg(long)]
        force: bool,
    },
    /// Permanently delete all trashed libraries.
    EmptyAll {
        #[arg(long)]
        force: bool,
        #[arg(long, short)]
        verbose: bool,
    },
}

#[derive(Args, Clone)]
struct WorkerArgs {
    /// Restrict claiming to one library.
    #[arg(long, conflicts_with = "all")]
    library: Option<String>,
    /// Claim from every active library (the default).
    #[arg(long)]
    all: bool,
    /// Drain the queue once and exit instead of polling forever.
    #[arg(long)]
    once: bool,
    /// Reset assets with missing derivatives before the run loop.
    #[arg(long)]
    repair: bool,
    #[arg(long, short)]
    verbose: bool,
    /// Heartbeat interval override, in seconds.
    #[arg(long, value_name = "N")]
    heartbeat: Option<u64>,
    /// Stable worker id override (defaults to <role>-<hostname>-<random>).
    #[arg(long)]
    worker_name: Option<String>,
}

#[derive(Args, Clone)]
struct AiWorkerArgs {
    #[command(flatten)]
    worker: WorkerArgs,
    /// Analyzer backend name.
    #[arg(long, default_value = "mock")]
    analyzer: String,
    /// Analysis depth: light (description + tags) or full (adds OCR).
    #[arg(long, default_value = "light")]
    mode: String,
}

#[derive(Subcommand)]
enum AiCmd {
    /// Image AI worker.
    Start(AiWorkerArgs),
    /// Video AI worker (per-scene backfill).
    Video(AiWorkerArgs),
    /// Get or set the system default AI model.
    Default {
        #[command(subcommand)]
        cmd: AiDefaultCmd,
    },
}

#[derive(Subcommand)]
enum AiDefaultCmd {
    Get,
    Set {
        /// Analyzer whose model card becomes the default.
        analyzer: String,
    },
}

#[derive(Subcommand)]
enum AssetCmd {
    /// List assets in a library.
    List {
        slug: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum MaintenanceCmd {
    /// Prune stale workers, reclaim expired leases, collect aged temp files.
    Run {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        library: Option<String>,
    },
    /// Reset poisoned assets back to pending (operator action).
    RetryPoisoned {
        #[arg(long)]
        library: Option<String>,
    },
}

fn command_verbose(command: &Command) -> bool {
    match command {
        Command::Scan { verbose, .. } => *verbose,
        Command::Proxy(args) | Command::VideoProxy(args) => args.verbose,
        Command::Ai {
            cmd: AiCmd::Start(args) | AiCmd::Video(args),
        } => args.worker.verbose,
        Command::Trash {
            cmd: TrashCmd::EmptyAll { verbose, .. },
        } => *verbose,
        _ => false,
    }
}

fn confirm(prompt: &str, force: bool) -> anyhow::Result<bool> {
    if force {
        return Ok(true);
    }
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn worker_config(base: &Config, args: &WorkerArgs) -> Arc<Config> {
    let mut config = base.clone();
    if let Some(secs) = args.heartbeat {
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    Arc::new(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let flight = logging::init(command_verbose(&cli.command), &config.forensics_dir);

    if let Err(e) = run(cli, config, flight).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(
    cli: Cli,
    config: Config,
    flight: mediadex_core::worker::flight_log::FlightLog,
) -> anyhow::Result<()> {
    let pool = db::connect(&config).await?;
    db::migrate(&pool).await?;

    match cli.command {
        Command::Library { cmd } => library_cmd(&pool, cmd).await,
        Command::Trash { cmd } => trash_cmd(&pool, cmd).await,
        Command::Scan { slug, .. } => {
            library_repo::get_active_or_fail(&pool, &slug).await?;
            library_repo::request_scan(&pool, &slug).await?;
            let stage = ScannerStage::new(Some(slug));
            run_worker(pool, Arc::new(config), flight, Box::new(stage), true, None).await?;
            Ok(())
        }
        Command::Proxy(args) => {
            let stage = ImageProxyStage::new(args.library.clone(), args.repair, args.verbose);
            run_worker(
                pool,
                worker_config(&config, &args),
                flight,
                Box::new(stage),
                args.once,
                args.worker_name,
            )
            .await?;
            Ok(())
        }
        Command::VideoProxy(args) => {
            let stage = VideoProxyStage::new(args.library.clone(), args.repair, args.verbose);
            run_worker(
                pool,
                worker_config(&config, &args),
                flight,
                Box::new(stage),
                args.once,
                args.worker_name,
            )
            .await?;
            Ok(())
        }
        Command::Ai { cmd } => ai_cmd(&pool, &config, flight, cmd).await,
        Command::Asset { cmd } => asset_cmd(&pool, cmd).await,
        Command::Maintenance { cmd } => maintenance_cmd(&pool, &config, cmd).await,
    }
}

async fn library_cmd(pool: &PgPool, cmd: LibraryCmd) -> anyhow::Result<()> {
    match cmd {
        LibraryCmd::Add { name, path } => {
            let absolute = std::fs::canonicalize(&path)
                .with_context(|| format!("library path does not resolve: {path}"))?;
            let slug = library_repo::add(pool, &name, &absolute.to_string_lossy()).await?;
            println!("Added library '{name}' with slug '{slug}'.");
        }
        LibraryCmd::Remove { slug } => {
            library_repo::soft_delete(pool, &slug).await?;
            println!("Library '{slug}' moved to trash.");
        }
        LibraryCmd::Restore { slug } => {
            library_repo::restore(pool, &slug).await?;
            println!("Library '{slug}' restored.");
        }
        LibraryCmd::List { include_deleted } => {
            let libraries = library_repo::list(pool, include_deleted).await?;
            if libraries.is_empty() {
                println!("No libraries.");
                return Ok(());
            }
            println!("{:<24} {:<24} {:<10} {}", "SLUG", "NAME", "SCAN", "PATH");
            for lib in libraries {
                let marker = if lib.deleted_at.is_some() { " (trash)" } else { "" };
                println!(
                    "{:<24} {:<24} {:<10} {}{}",
                    lib.slug, lib.name, lib.scan_status, lib.absolute_path, marker
                );
            }
        }
    }
    Ok(())
}

async fn trash_cmd(pool: &PgPool, cmd: TrashCmd) -> anyhow::Result<()> {
    match cmd {
        TrashCmd::Empty { slug, force } => {
            if !confirm(
                &format!("Permanently delete library '{slug}' and all its assets?"),
                force,
            )? {
                bail!("aborted");
            }
            let deleted = library_repo::empty_trashed(pool, &slug).await?;
            println!("Permanently deleted library '{slug}' ({deleted} assets).");
        }
        TrashCmd::EmptyAll { force, verbose } => {
            let trashed = library_repo::list_trashed(pool).await?;
            if trashed.is_empty() {
                println!("No trashed libraries.");
                return Ok(());
            }
            if !confirm("Permanently delete ALL trashed libraries?", force)? {
                bail!("aborted");
            }
            let total = trashed.len();
            for (i, lib) in trashed.iter().enumerate() {
                if verbose {
                    println!("Emptying {}/{}: {}", i + 1, total, lib.slug);
                }
                library_repo::empty_trashed(pool, &lib.slug).await?;
            }
            println!("Permanently deleted {total} library(ies).");
        }
    }
    Ok(())
}

async fn ai_cmd(
    pool: &PgPool,
    config: &Config,
    flight: mediadex_core::worker::flight_log::FlightLog,
    cmd: AiCmd,
) -> anyhow::Result<()> {
    match cmd {
        AiCmd::Start(args) => {
            let mode = AnalysisMode::parse(&args.mode)
                .with_context(|| format!("invalid --mode '{}': expected light or full", args.mode))?;
            let analyzer = create_analyzer(&args.analyzer)?;
            let stage = AiImageStage::new(
                args.worker.library.clone(),
                mode,
                args.worker.repair,
                args.worker.verbose,
                analyzer,
            );
            run_worker(
                pool.clone(),
                worker_config(config, &args.worker),
                flight,
                Box::new(stage),
                args.worker.once,
                args.worker.worker_name,
            )
            .await?;
            Ok(())
        }
        AiCmd::Video(args) => {
            let mode = AnalysisMode::parse(&args.mode)
                .with_context(|| format!("invalid --mode '{}': expected light or full", args.mode))?;
            let analyzer = create_analyzer(&args.analyzer)?;
            let stage = AiVideoStage::new(
                args.worker.library.clone(),
                mode,
                args.worker.repair,
                args.worker.verbose,
                analyzer,
            );
            run_worker(
                pool.clone(),
                worker_config(config, &args.worker),
                flight,
                Box::new(stage),
                args.worker.once,
                args.worker.worker_name,
            )
            .await?;
            Ok(())
        }
        AiCmd::Default { cmd } => {
            match cmd {
                AiDefaultCmd::Get => match system_repo::default_model_id(pool).await? {
                    Some(id) => match system_repo::get_model(pool, id).await? {
                        Some(model) => println!("{} {} (id {})", model.name, model.version, id),
                        None => println!("default model id {id} (no ai_model row)"),
                    },
                    None => println!("No system default model set."),
                },
                AiDefaultCmd::Set { analyzer } => {
                    if analyzer == "mock" && !config.allow_mock_default {
                        bail!(
                            "the mock analyzer may only be the system default in tests \
                             (set MEDIASEARCH_ALLOW_MOCK_DEFAULT=1)"
                        );
                    }
                    let card = create_analyzer(&analyzer)?.model_card();
                    let id = system_repo::get_or_create_model(pool, &card).await?;
                    system_repo::set_default_model_id(pool, id).await?;
                    println!("System default model set to {} {} (id {id}).", card.name, card.version);
                }
            }
            Ok(())
        }
    }
}

async fn asset_cmd(pool: &PgPool, cmd: AssetCmd) -> anyhow::Result<()> {
    match cmd {
        AssetCmd::List { slug, status, limit } => {
            library_repo::get_active_or_fail(pool, &slug).await?;
            let status = match status.as_deref() {
                Some(raw) => Some(
                    AssetStatus::parse(raw)
                        .with_context(|| format!("invalid status '{raw}'"))?,
                ),
                None => None,
            };
            let assets = asset_repo::list_for_library(pool, &slug, status, limit).await?;
            if assets.is_empty() {
                println!("No assets.");
            } else {
                println!("{:<10} {:<14} {:<7} {:<7} PATH", "ID", "STATUS", "KIND", "RETRY");
                for asset in assets {
                    println!(
                        "{:<10} {:<14} {:<7} {:<7} {}",
                        asset.id, asset.status, asset.kind, asset.retry_count, asset.rel_path
                    );
                }
            }
            let counts = asset_repo::count_by_status(pool, Some(&slug)).await?;
            let summary: Vec<String> =
                counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
            println!("totals: {}", summary.join(" "));
            Ok(())
        }
    }
}

async fn maintenance_cmd(
    pool: &PgPool,
    config: &Config,
    cmd: MaintenanceCmd,
) -> anyhow::Result<()> {
    match cmd {
        MaintenanceCmd::Run { dry_run, library } => {
            let hostname = hostname_string();
            let m = maintenance::Maintenance::new(pool, &config.data_dir, hostname);
            let report = m.run_all(library.as_deref(), dry_run).await?;
            if dry_run {
                println!(
                    "Would prune {} stale worker(s), reclaim {} lease(s), delete {} temp file(s) ({} bytes).",
                    report.workers_pruned,
                    report.leases_reclaimed,
                    report.temp_files_deleted,
                    report.temp_bytes_deleted
                );
            } else {
                println!(
                    "Pruned {} worker(s), reclaimed {} lease(s), deleted {} temp file(s) ({} bytes).",
                    report.workers_pruned,
                    report.leases_reclaimed,
                    report.temp_files_deleted,
                    report.temp_bytes_deleted
                );
            }
            Ok(())
        }
        MaintenanceCmd::RetryPoisoned { library } => {
            let reset = asset_repo::retry_poisoned(pool, library.as_deref()).await?;
            println!("Reset {reset} poisoned asset(s) to pending.");
            Ok(())
        }
    }
}

fn hostname_string() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into())
    })
}
