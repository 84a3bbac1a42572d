//! marquee-ingest - import orchestration for movies, people and nominations
//!
//! One binary, several roles:
//! - `serve`: operator API plus in-process workers for every queue
//! - `work`: workers only (`--once` drains the queues and exits)
//! - `discover`, `import-ceremony`: start new work
//! - `resume`, `status`: operator maintenance

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use marquee_common::config::{load_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig};
use marquee_common::db::init_database;
use marquee_common::events::EventBus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use marquee_ingest::config::{resolve_ingest_config, IngestConfig};
use marquee_ingest::db::cursors::{self, NewCursor};
use marquee_ingest::db::manifests;
use marquee_ingest::queue::{JobQueue, SqliteJobQueue, Worker, ALL_QUEUES};
use marquee_ingest::services::ceremony_client::read_payload_file;
use marquee_ingest::services::ceremony_importer::CEREMONY_API_SOURCE;
use marquee_ingest::services::{
    CatalogSource, CeremonyImporter, CeremonySource, DiscoveryScheduler, FileCeremonySource,
    HttpCatalogClient, HttpCeremonyClient, OfflineCatalog, ResumeController, SourceRateLimiter,
};
use marquee_ingest::{AppState, IngestContext};

const DEFAULT_BIND: &str = "127.0.0.1:5780";
const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "marquee-ingest", version, about = "Movie, people and nomination import engine")]
struct Cli {
    /// Root folder holding the database
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Path to marquee.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the operator API with workers for every queue
    Serve {
        #[arg(long, default_value = DEFAULT_BIND)]
        bind: String,
    },
    /// Run workers without the API
    Work {
        /// Only this queue (default: all)
        #[arg(long)]
        queue: Option<String>,
        /// Drain the queues and exit
        #[arg(long)]
        once: bool,
    },
    /// Register a discovery stream and queue its first unit
    Discover(DiscoverArgs),
    /// Import one ceremony payload
    ImportCeremony(ImportCeremonyArgs),
    /// Re-queue unfinished work
    Resume {
        /// Also retry up to this many failed detail fetches
        #[arg(long, default_value_t = 0)]
        enrichment_limit: u32,
        /// Reopen this manifest, including a failed one
        #[arg(long)]
        manifest: Option<uuid::Uuid>,
        /// Reactivate this stalled cursor
        #[arg(long)]
        stream: Option<String>,
    },
    /// Print manifests, cursors and queue counts as JSON
    Status,
}

#[derive(Debug, Args)]
struct DiscoverArgs {
    /// Stream name, e.g. `movies-by-year`
    #[arg(long)]
    stream: String,
    /// `page` or `year`
    #[arg(long, default_value = "page")]
    kind: String,
    /// `movie` or `person`
    #[arg(long, default_value = "movie")]
    entity: String,
    /// First page or year
    #[arg(long, default_value_t = 1)]
    start: i64,
    /// Last year (inclusive) for year streams
    #[arg(long)]
    end: Option<i64>,
}

#[derive(Debug, Args)]
struct ImportCeremonyArgs {
    /// Read the payload from a JSON file
    #[arg(long, conflicts_with = "key")]
    file: Option<PathBuf>,
    /// Fetch the payload from the ceremony source
    #[arg(long)]
    key: Option<String>,
    /// Run Phase A now and leave Phases B and C to the workers
    #[arg(long)]
    queued: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let toml_config = load_toml_config(cli.config.as_deref())?;
    init_tracing(&toml_config)?;

    info!("Starting marquee-ingest {}", env!("CARGO_PKG_VERSION"));

    let root_folder = RootFolderResolver::new(cli.root.as_deref(), Some(&toml_config)).resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow!("Failed to initialize root folder: {}", e))?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db = init_database(&db_path).await?;

    let config = resolve_ingest_config(&db, &toml_config).await?;
    let ctx = build_context(db, config, initializer.root_folder())?;

    match cli.command {
        Command::Serve { bind } => serve(ctx, &bind).await,
        Command::Work { queue, once } => work(ctx, queue, once).await,
        Command::Discover(args) => discover(ctx, args).await,
        Command::ImportCeremony(args) => import_ceremony(ctx, args).await,
        Command::Resume {
            enrichment_limit,
            manifest,
            stream,
        } => resume(ctx, enrichment_limit, manifest, stream).await,
        Command::Status => status(ctx).await,
    }
}

/// RUST_LOG first, then `[logging] level`, then `info`
fn init_tracing(toml_config: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&toml_config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_context(
    db: sqlx::SqlitePool,
    config: IngestConfig,
    root_folder: &Path,
) -> Result<IngestContext> {
    let catalog: Arc<dyn CatalogSource> = match config.catalog.base_url.as_deref() {
        Some(base_url) => {
            let limiter = Arc::new(SourceRateLimiter::new(
                "catalog",
                config.catalog.requests_per_second,
                config.catalog.burst,
            ));
            info!(base_url, rps = config.catalog.requests_per_second, "Catalog source configured");
            Arc::new(HttpCatalogClient::new(base_url, config.catalog.api_key.clone(), limiter)?)
        }
        None => {
            warn!("No catalog base_url configured; references will stay soft until enriched");
            Arc::new(OfflineCatalog)
        }
    };

    let ceremonies: Arc<dyn CeremonySource> = match (
        config.ceremony.base_url.as_deref(),
        config.ceremony.payload_dir.clone(),
    ) {
        (Some(base_url), _) => {
            let limiter = Arc::new(SourceRateLimiter::new(
                "ceremony",
                config.ceremony.requests_per_second,
                config.ceremony.burst,
            ));
            Arc::new(HttpCeremonyClient::new(base_url, limiter)?)
        }
        (None, Some(dir)) => Arc::new(FileCeremonySource::new(dir)),
        (None, None) => Arc::new(FileCeremonySource::new(root_folder.join("ceremonies"))),
    };

    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(db.clone(), &config.import));

    Ok(IngestContext {
        db,
        catalog,
        ceremonies,
        queue,
        event_bus: EventBus::new(EVENT_BUS_CAPACITY),
        config: Arc::new(config),
    })
}

async fn serve(ctx: IngestContext, bind: &str) -> Result<()> {
    let report = ResumeController::new(ctx.clone()).resume_all().await?;
    info!(
        manifests = report.manifests,
        cursors = report.cursors,
        jobs_queued = report.jobs_queued,
        "Startup resume"
    );

    let cancel = CancellationToken::new();
    let mut workers = spawn_workers(&ctx, ALL_QUEUES.iter().map(|q| q.to_string()), &cancel);
    workers.push(spawn_stall_monitor(ctx.clone(), cancel.clone()));

    let app = marquee_ingest::build_router(AppState::new(ctx));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    for handle in workers {
        handle.await?;
    }
    Ok(())
}

async fn work(ctx: IngestContext, queue: Option<String>, once: bool) -> Result<()> {
    let queues: Vec<String> = match queue {
        Some(q) if ALL_QUEUES.contains(&q.as_str()) => vec![q],
        Some(q) => return Err(anyhow!("Unknown queue '{}', expected one of {:?}", q, ALL_QUEUES)),
        None => ALL_QUEUES.iter().map(|q| q.to_string()).collect(),
    };

    if once {
        let names: Vec<&str> = queues.iter().map(String::as_str).collect();
        let processed = Worker::new(ctx.clone())
            .run_until_idle(&names, ctx.config.import.parallelism)
            .await?;
        info!(processed, "Queues drained");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut workers = spawn_workers(&ctx, queues.into_iter(), &cancel);
    workers.push(spawn_stall_monitor(ctx.clone(), cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    for handle in workers {
        handle.await?;
    }
    Ok(())
}

fn spawn_workers(
    ctx: &IngestContext,
    queues: impl Iterator<Item = String>,
    cancel: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let concurrency = ctx.config.import.parallelism;
    queues
        .map(|queue| {
            let worker = Worker::new(ctx.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.run(&queue, concurrency, cancel).await {
                    tracing::error!(queue = %queue, error = %e, "Worker exited with error");
                }
            })
        })
        .collect()
}

fn spawn_stall_monitor(ctx: IngestContext, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let threshold = Duration::from_secs(ctx.config.import.stall_threshold_seconds.max(1));
    let period = (threshold / 4).max(Duration::from_secs(1));

    tokio::spawn(async move {
        let controller = ResumeController::new(ctx);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = controller.detect_stalled(threshold).await {
                        warn!(error = %e, "Stall detection failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

async fn discover(ctx: IngestContext, args: DiscoverArgs) -> Result<()> {
    let new = NewCursor {
        stream: args.stream,
        partition: args.kind.parse()?,
        entity_kind: args.entity.parse()?,
        start_position: args.start,
        end_position: args.end,
    };

    let cursor = DiscoveryScheduler::new(ctx).register_stream(&new).await?;
    println!("{}", serde_json::to_string_pretty(&cursor)?);
    Ok(())
}

async fn import_ceremony(ctx: IngestContext, args: ImportCeremonyArgs) -> Result<()> {
    let importer = CeremonyImporter::new(ctx.clone());

    let (source, hint_key, payload) = match (&args.file, &args.key) {
        (Some(path), _) => {
            let payload = read_payload_file(path).await?;
            let hint = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string());
            ("file", hint, payload)
        }
        (None, Some(key)) => {
            let payload = ctx.ceremonies.fetch_ceremony(key).await?;
            (CEREMONY_API_SOURCE, key.clone(), payload)
        }
        (None, None) => return Err(anyhow!("import-ceremony needs --file or --key")),
    };

    if args.queued {
        let staged = importer.stage_payload(source, &hint_key, &payload).await?;
        println!(
            "{}",
            serde_json::json!({
                "manifest_id": staged.manifest_id,
                "status": staged.status,
                "new_entities": staged.new_entities,
                "new_relations": staged.new_relations,
            })
        );
    } else {
        let report = importer.import_payload(source, &hint_key, &payload).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn resume(
    ctx: IngestContext,
    enrichment_limit: u32,
    manifest: Option<uuid::Uuid>,
    stream: Option<String>,
) -> Result<()> {
    let controller = ResumeController::new(ctx);

    if let Some(manifest_id) = manifest {
        let queued = controller.enqueue_manifest_resume(manifest_id).await?;
        info!(manifest_id = %manifest_id, queued, "Manifest reopened");
    }
    if let Some(stream) = stream {
        if !controller.resume_cursor(&stream).await? {
            warn!(stream = %stream, "Cursor was not stalled");
        }
    }

    let report = controller.resume_all().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if enrichment_limit > 0 {
        let enrichment = controller.retry_enrichment(enrichment_limit).await?;
        println!("{}", serde_json::to_string_pretty(&enrichment)?);
    }
    Ok(())
}

async fn status(ctx: IngestContext) -> Result<()> {
    let mut manifest_rows = Vec::new();
    for manifest in manifests::list_manifests(&ctx.db, None).await? {
        let summary = manifests::summarize(&ctx.db, manifest.manifest_id).await?;
        manifest_rows.push(serde_json::json!({ "manifest": manifest, "summary": summary }));
    }

    let mut queues = serde_json::Map::new();
    for queue in ALL_QUEUES {
        queues.insert(queue.to_string(), serde_json::to_value(ctx.queue.counts(queue).await?)?);
    }

    let status = serde_json::json!({
        "manifests": manifest_rows,
        "cursors": cursors::list_cursors(&ctx.db, None).await?,
        "queues": queues,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
