use chunkdb_core::chunk::ChunkStage;
use chunkdb_core::config::{self, Settings};
use chunkdb_core::pipeline::{CancelFlag, Orchestrator, RunReport};
use chunkdb_core::retrieve::Query;
use chunkdb_core::{Error, Result};
use chunkdb_server::api::create_router;
use chunkdb_server::api::handlers::AppState;
use chunkdb_server::api::metrics;
use chunkdb_server::api::models::ResultResponse;
use chunkdb_server::embedder::{build_embedder, EmbedderKind, RemoteEmbedderConfig};
use chunkdb_server::supervisor::{Supervisor, SupervisorConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "chunkdb", version, about = "Chunk embedding index and retrieval")]
struct Cli {
    /// Data directory for the store, index and journal
    #[arg(short, long, global = true, env = "CHUNKDB_DATA_DIR", default_value = config::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// TOML settings file (pipeline settings and supervised services)
    #[arg(short, long, global = true, env = "CHUNKDB_CONFIG")]
    config: Option<PathBuf>,

    /// Embedding dimension; overrides the settings file
    #[arg(long, global = true, env = "CHUNKDB_EMBEDDING_DIMENSION")]
    dimension: Option<usize>,

    /// Worker threads for extraction and embedding; overrides the settings file
    #[arg(long, global = true, env = "CHUNKDB_WORKER_THREADS")]
    workers: Option<usize>,

    #[command(flatten)]
    embedder: EmbedderArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct EmbedderArgs {
    /// Embedding backend
    #[arg(long, global = true, env = "CHUNKDB_EMBEDDER", value_enum, default_value_t = EmbedderKind::Hashing)]
    embedder: EmbedderKind,

    /// Base URL of the Ollama-compatible embedding service
    #[arg(long, global = true, env = "CHUNKDB_EMBEDDER_URL")]
    embedder_url: Option<String>,

    /// Embedding model name
    #[arg(long, global = true, env = "CHUNKDB_EMBEDDER_MODEL")]
    embedder_model: Option<String>,

    /// Per-request embedding timeout in seconds
    #[arg(long, global = true, env = "CHUNKDB_EMBED_TIMEOUT_SECS", default_value_t = config::DEFAULT_EMBED_TIMEOUT_SECS)]
    embed_timeout: u64,
}

#[derive(Args)]
struct InputArgs {
    /// Directory of source documents to discover before running
    #[arg(short, long, env = "CHUNKDB_INPUT")]
    input: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Extract text chunks from pending documents
    Extract(InputArgs),
    /// Normalize, hash, deduplicate and tag extracted chunks
    Enrich(InputArgs),
    /// Embed enriched chunks
    Embed(InputArgs),
    /// Add embedded chunks to the vector index
    Index(InputArgs),
    /// Run every stage
    Run(InputArgs),
    /// Retrieve the chunks closest to a query
    Query {
        /// Query text
        text: String,
        /// Number of results
        #[arg(short, long, default_value_t = 5, allow_negative_numbers = true)]
        k: i64,
        /// Restrict results to these documents
        #[arg(long = "document")]
        documents: Vec<Uuid>,
        /// Drop results below this cosine similarity
        #[arg(long)]
        min_score: Option<f32>,
        /// Keep results carrying an entity with this label (repeatable)
        #[arg(long = "entity")]
        entities: Vec<String>,
    },
    /// Show the pipeline state of every document
    Status,
    /// Re-run a failed document from its failed stage
    Retry { id: Uuid },
    /// Delete a document and its chunks
    Delete { id: Uuid },
    /// Compact and recalibrate the vector index
    Rebuild {
        /// Discard the index files and re-add every indexed chunk from the
        /// chunk store (use when the index no longer loads)
        #[arg(long)]
        from_store: bool,
    },
    /// Serve the HTTP query API and supervise configured services
    Serve {
        #[arg(long, env = "CHUNKDB_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(short, long, env = "CHUNKDB_PORT", default_value_t = config::DEFAULT_PORT)]
        port: u16,
        /// Restart services even if their ports look busy
        #[arg(long)]
        force: bool,
        /// Do not start the configured services
        #[arg(long)]
        no_services: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chunkdb_server=info,chunkdb_core=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(dimension) = cli.dimension {
        settings.embedding_dimension = dimension;
    }
    if let Some(workers) = cli.workers {
        settings.worker_threads = workers;
    }
    settings.validate()?;
    Ok(settings)
}

fn open_pipeline(cli: &Cli) -> Result<Arc<Orchestrator>> {
    if cli.data_dir.exists() && !cli.data_dir.is_dir() {
        return Err(Error::InvalidConfig(format!(
            "data_dir '{}' exists but is not a directory",
            cli.data_dir.display()
        )));
    }
    let settings = load_settings(cli)?;
    let mut remote = RemoteEmbedderConfig::default();
    if let Some(url) = &cli.embedder.embedder_url {
        remote.url = url.clone();
    }
    if let Some(model) = &cli.embedder.embedder_model {
        remote.model = model.clone();
    }
    remote.timeout = Duration::from_secs(cli.embedder.embed_timeout);
    let embedder = build_embedder(
        cli.embedder.embedder,
        settings.embedding_dimension,
        &remote,
        settings.retry_backoff,
    )?;
    Ok(Arc::new(Orchestrator::open(&cli.data_dir, settings, embedder)?))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| std::io::Error::other(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Rebuild { from_store: true } = cli.command {
        let settings = load_settings(&cli)?;
        return print_json(&Orchestrator::recover_index(&cli.data_dir, &settings)?);
    }
    let pipeline = open_pipeline(&cli)?;
    match &cli.command {
        Command::Extract(input) => stage(&pipeline, input, Some(ChunkStage::Extracted)),
        Command::Enrich(input) => stage(&pipeline, input, Some(ChunkStage::Enriched)),
        Command::Embed(input) => stage(&pipeline, input, Some(ChunkStage::Embedded)),
        Command::Index(input) => stage(&pipeline, input, Some(ChunkStage::Indexed)),
        Command::Run(input) => stage(&pipeline, input, None),
        Command::Query {
            text,
            k,
            documents,
            min_score,
            entities,
        } => {
            let mut query = Query::new(text.clone(), *k);
            if !documents.is_empty() {
                query = query.in_documents(documents.clone());
            }
            if let Some(min) = min_score {
                query = query.with_min_score(*min);
            }
            if !entities.is_empty() {
                query = query.with_entities(entities.clone());
            }
            let results = pipeline.retriever().retrieve(&query)?;
            let results: Vec<ResultResponse> = results.into_iter().map(ResultResponse::from).collect();
            print_json(&results)
        }
        Command::Status => print_json(&pipeline.status()),
        Command::Retry { id } => {
            let state = pipeline.retry(id)?;
            print_json(&serde_json::json!({ "id": id, "state": state.to_string() }))
        }
        Command::Delete { id } => {
            let removed = pipeline.delete(id)?;
            print_json(&serde_json::json!({ "id": id, "removed_chunks": removed }))
        }
        Command::Rebuild { .. } => print_json(&pipeline.rebuild_index()?),
        Command::Serve {
            host,
            port,
            force,
            no_services,
        } => {
            let services = match &cli.config {
                Some(path) if !no_services => SupervisorConfig::load(path)?,
                _ => SupervisorConfig::default(),
            };
            serve(pipeline, host, *port, *force, services)
        }
    }
}

/// Discover `input` if given, then run one stage (or all of them) with
/// Ctrl-C wired to the pipeline's cancel flag. Any document failing in this
/// invocation makes the command fail with that failure's exit status.
fn stage(pipeline: &Arc<Orchestrator>, input: &InputArgs, stage: Option<ChunkStage>) -> Result<()> {
    if let Some(dir) = &input.input {
        pipeline.discover(dir)?;
    }
    let worker = pipeline.clone();
    let report = with_cancellation(pipeline.cancel_flag(), move || match stage {
        Some(stage) => {
            let stages = vec![worker.run_stage(stage)?];
            let status = worker.status();
            Ok(RunReport {
                stages,
                ready: status.iter().filter(|r| r.state.is_ready()).count(),
                failed: status.iter().filter(|r| r.state.is_failed()).count(),
            })
        }
        None => worker.run(),
    })?;
    for stage_report in &report.stages {
        metrics::record_stage(stage_report);
    }
    for failure in report.failures() {
        tracing::warn!(document = %failure.document_id, kind = ?failure.kind, reason = %failure.reason, "document failed");
    }
    print_json(&report)?;
    report.check()
}

/// Run blocking pipeline work while listening for SIGINT/SIGTERM. A signal
/// sets the cancel flag; the work then stops at its next checkpoint.
fn with_cancellation<T, F>(flag: CancelFlag, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let joined = runtime.block_on(async move {
        let mut task = tokio::task::spawn_blocking(work);
        tokio::select! {
            res = &mut task => res,
            _ = wait_for_signal() => {
                tracing::warn!("cancelling, waiting for the current stage to checkpoint");
                flag.cancel();
                task.await
            }
        }
    });
    joined.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?
}

fn serve(
    pipeline: Arc<Orchestrator>,
    host: &str,
    port: u16,
    force: bool,
    services: SupervisorConfig,
) -> Result<()> {
    if port == 0 {
        return Err(Error::InvalidConfig("port must be > 0".into()));
    }
    let supervisor = Supervisor::new(services);
    let started = supervisor.start(force)?;

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::InvalidConfig(format!("metrics recorder: {e}")))?;
    let state = AppState::new(pipeline.clone(), prometheus_handle);
    let app = create_router(state);
    let addr = format!("{host}:{port}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served: Result<()> = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %addr,
            data_dir = ?pipeline.data_dir(),
            documents = pipeline.status().len(),
            indexed = pipeline.index().len(),
            services = ?started,
            "chunkdb ready"
        );

        let metrics_pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                interval.tick().await;
                metrics::update_index_metrics(&metrics_pipeline);
            }
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_signal())
            .await?;
        Ok(())
    });
    // the runtime owns router clones; drop it before the pipeline so a
    // blocking HTTP client is never torn down on an async thread
    runtime.shutdown_timeout(Duration::from_secs(5));

    tracing::info!("stopping supervised services");
    supervisor.stop();
    flush(&pipeline, pipeline.data_dir());
    served
}

fn flush(pipeline: &Orchestrator, data_dir: &Path) {
    match pipeline.store().save(data_dir) {
        Ok(()) => tracing::info!("store flushed on shutdown"),
        Err(e) => tracing::error!(error = %e, "failed to flush store on shutdown"),
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
