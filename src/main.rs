use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod chunker;
mod config;
mod embedder;
mod error;
mod governor;
mod ingester;
mod metrics;
mod naming;
mod queue;
mod search;
mod state;
mod store;
mod watcher;

use config::Config;
use error::{AppError, AppResult};
use search::{DecayMode, OutputFormat, SearchOptions, SearchScope};

#[derive(Parser)]
#[command(
    name = "recall",
    about = "Stream conversation logs into a vector store and search them semantically",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming watcher until interrupted
    Watch,

    /// Search past conversations
    Search {
        /// Search query
        query: String,

        /// Project path to search (defaults to the active project)
        #[arg(long)]
        project: Option<String>,

        /// Search every project collection instead of one
        #[arg(long)]
        all: bool,

        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Minimum similarity score (0-1)
        #[arg(long, default_value_t = 0.7)]
        min_score: f32,

        /// Time decay: on, off, or default (environment setting)
        #[arg(long, default_value = "default")]
        decay: String,

        /// Output format: brief, markdown, or raw
        #[arg(long, default_value = "brief")]
        format: String,

        /// Skip this many ranked results (pagination)
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Single best match for a query (shorthand for --limit 1)
    QuickSearch {
        /// Search query
        query: String,

        /// Minimum similarity score (0-1)
        #[arg(long, default_value_t = 0.7)]
        min_score: f32,
    },

    /// Find conversations that analyzed or edited a file
    SearchFile {
        /// File path to look up
        path: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Find conversations tagged with a development concept
    SearchConcept {
        /// Concept keyword (e.g. docker, testing, security)
        concept: String,

        /// Include per-conversation file lists in the output
        #[arg(long)]
        include_files: bool,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Store an insight into the reflections collection
    StoreReflection {
        /// The reflection text
        text: String,

        /// Tags to categorize the reflection (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Remove a file's ingest record so it is re-imported from scratch
    Forget {
        /// Conversation file path as recorded in the state file
        path: String,

        /// Also delete the conversation's points from the store
        #[arg(long)]
        purge: bool,
    },

    /// Summarize ingest state, store contents, and counters
    Status,

    /// Run connectivity and configuration diagnostics
    Doctor,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());
    let _log_guard = init_tracing(&config);

    // Log panics before aborting so the watcher never dies silently.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        error!(target: "recall::panic", location = %location, "PANIC: thread panicked");
        default_panic(info);
    }));

    let code = match run(cli, config).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "recall=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let log_dir = config.log_dir();
    let file_layer = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "recall.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
                .compact();
            Some((layer, guard))
        }
        Err(_) => None,
    };

    match file_layer {
        Some((layer, guard)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            None
        }
    }
}

async fn run(cli: Cli, config: Arc<Config>) -> AppResult<()> {
    let provider = embedder::select_provider(&config)?;
    let store = Arc::new(store::VectorStore::new(
        &config.store_url,
        config.request_timeout_s,
    )?);

    match cli.command {
        Commands::Watch => run_watch(config, provider, store).await,
        Commands::Search {
            query,
            project,
            all,
            limit,
            min_score,
            decay,
            format,
            offset,
        } => {
            let opts = SearchOptions {
                project,
                limit,
                min_score,
                decay: decay.parse::<DecayMode>()?,
                scope: if all {
                    SearchScope::All
                } else {
                    SearchScope::Current
                },
                format: format.parse::<OutputFormat>()?,
                offset,
            };
            let engine = search::SearchEngine::new(store, provider, config);
            let response = if opts.offset > 0 {
                engine
                    .get_more_results(&query, opts.offset, opts.limit, &opts)
                    .await?
            } else {
                engine.reflect(&query, &opts).await?
            };
            print!("{}", engine.format(&query, &response, opts.format));
            Ok(())
        }
        Commands::QuickSearch { query, min_score } => {
            let opts = SearchOptions {
                min_score,
                scope: SearchScope::All,
                ..SearchOptions::default()
            };
            let engine = search::SearchEngine::new(store, provider, config);
            let response = engine.quick_search(&query, &opts).await?;
            print!("{}", engine.format(&query, &response, search::OutputFormat::Brief));
            Ok(())
        }
        Commands::SearchFile { path, limit } => {
            let engine = search::SearchEngine::new(store, provider, config);
            let hits = engine.search_by_file(&path, limit).await?;
            print_hits(&path, &hits);
            Ok(())
        }
        Commands::SearchConcept {
            concept,
            include_files,
            limit,
        } => {
            let engine = search::SearchEngine::new(store, provider, config);
            let hits = engine.search_by_concept(&concept, include_files, limit).await?;
            print_hits(&concept, &hits);
            Ok(())
        }
        Commands::StoreReflection { text, tags } => {
            let engine = search::SearchEngine::new(store, provider, config);
            let id = engine.store_reflection(&text, &tags).await?;
            let tags = if tags.is_empty() {
                "none".to_string()
            } else {
                tags.join(", ")
            };
            println!("Reflection {id} stored with tags: {tags}");
            Ok(())
        }
        Commands::Forget { path, purge } => run_forget(config, provider, store, &path, purge).await,
        Commands::Status => run_status(config, provider, store).await,
        Commands::Doctor => run_doctor(config, provider, store).await,
    }
}

async fn run_forget(
    config: Arc<Config>,
    provider: Arc<dyn embedder::EmbeddingProvider>,
    store: Arc<store::VectorStore>,
    path: &str,
    purge: bool,
) -> AppResult<()> {
    let state = state::StateStore::load(config.state_file_for(provider.state_filename()))?;
    let Some(record) = state.get(path) else {
        println!("{path} is not tracked in the state file");
        return Ok(());
    };

    state.forget(path)?;
    println!("forgot {path} ({} chunks recorded)", record.chunks_written);

    if purge {
        let filter = serde_json::json!({
            "must": [ { "key": "conversation_id", "match": { "value": record.conversation_id } } ]
        });
        let count = store.count(&record.collection, Some(filter.clone())).await?;
        store.delete_by_filter(&record.collection, filter).await?;
        println!(
            "purged {count} points for conversation {} from {}",
            record.conversation_id, record.collection
        );
    }
    Ok(())
}

fn print_hits(subject: &str, hits: &[search::SearchHit]) {
    if hits.is_empty() {
        println!("No conversations found for '{subject}'.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{}] {}: {}",
            i + 1,
            hit.timestamp,
            hit.project,
            hit.excerpt(200)
        );
    }
}

async fn run_watch(
    config: Arc<Config>,
    provider: Arc<dyn embedder::EmbeddingProvider>,
    store: Arc<store::VectorStore>,
) -> AppResult<()> {
    let state = Arc::new(state::StateStore::load(
        config.state_file_for(provider.state_filename()),
    )?);
    let memory = Arc::new(governor::MemoryMonitor::new(
        config.memory_warning_mb,
        config.memory_limit_mb,
    ));
    let cpu = Arc::new(governor::CpuMonitor::new(config.max_cpu_percent_per_core));
    let queue = Arc::new(queue::IngestQueue::new(config.max_queue_size));
    let ingester = Arc::new(ingester::Ingester::new(
        store,
        provider.clone(),
        state.clone(),
        memory.clone(),
        cpu,
    ));

    let (warning_mb, limit_mb) = memory.thresholds();
    info!(
        provider = provider.suffix(),
        model = provider.model_name(),
        state_file = %state.path().display(),
        warning_mb,
        limit_mb,
        "starting watcher"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let watcher = watcher::Watcher::new(config, queue, ingester, state, memory, shutdown_rx);
    watcher.run().await
}

async fn run_status(
    config: Arc<Config>,
    provider: Arc<dyn embedder::EmbeddingProvider>,
    store: Arc<store::VectorStore>,
) -> AppResult<()> {
    let state_path = config.state_file_for(provider.state_filename());
    let state_summary = match state::StateStore::load(state_path.clone()) {
        Ok(state) => {
            let records = state.records();
            let chunks: u64 = records.iter().map(|r| r.chunks_written).sum();
            let corrupt: u64 = records.iter().map(|r| r.corrupt_lines).sum();
            let last_import = records
                .iter()
                .map(|r| r.last_imported_at.clone())
                .max()
                .unwrap_or_default();
            serde_json::json!({
                "path": state_path,
                "files": records.len(),
                "chunks_written": chunks,
                "corrupt_lines": corrupt,
                "last_imported_at": last_import,
            })
        }
        Err(e) => serde_json::json!({ "path": state_path, "error": e.to_string() }),
    };

    let store_summary = match store.healthz().await {
        Ok(()) => {
            let suffix = format!("_{}", provider.suffix());
            let mut collections = serde_json::Map::new();
            for name in store.list_collections().await? {
                if name.ends_with(&suffix) {
                    let count = store.collection_count(&name).await.unwrap_or(0);
                    collections.insert(name, serde_json::json!(count));
                }
            }
            serde_json::json!({ "url": config.store_url, "reachable": true, "collections": collections })
        }
        Err(e) => serde_json::json!({ "url": config.store_url, "reachable": false, "error": e.to_string() }),
    };

    let status = serde_json::json!({
        "provider": {
            "suffix": provider.suffix(),
            "model": provider.model_name(),
            "dim": provider.dim(),
        },
        "state": state_summary,
        "store": store_summary,
        "counters": metrics::metrics().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_doctor(
    config: Arc<Config>,
    provider: Arc<dyn embedder::EmbeddingProvider>,
    store: Arc<store::VectorStore>,
) -> AppResult<()> {
    let mut failure: Option<AppError> = None;
    let mut report = |ok: bool, line: String| {
        println!("{} {}", if ok { "ok  " } else { "FAIL" }, line);
    };

    let logs_ok = config.logs_dir.is_dir();
    report(logs_ok, format!("logs dir: {}", config.logs_dir.display()));
    if !logs_ok && failure.is_none() {
        failure = Some(AppError::Config(format!(
            "logs dir {} does not exist",
            config.logs_dir.display()
        )));
    }

    let state_path = config.state_file_for(provider.state_filename());
    match state::StateStore::load(state_path.clone()) {
        Ok(state) => report(
            true,
            format!("state file: {} ({} files)", state_path.display(), state.len()),
        ),
        Err(e) => {
            report(false, format!("state file: {e}"));
            if failure.is_none() {
                failure = Some(e);
            }
        }
    }

    report(
        true,
        format!(
            "provider: {} ({}d, suffix {})",
            provider.model_name(),
            provider.dim(),
            provider.suffix()
        ),
    );

    match store.healthz().await {
        Ok(()) => {
            report(true, format!("store reachable at {}", config.store_url));
            let suffix = format!("_{}", provider.suffix());
            for name in store.list_collections().await? {
                if !name.ends_with(&suffix) {
                    continue;
                }
                match store.collection_dim(&name).await {
                    Ok(Some(dim)) if dim == provider.dim() => {
                        report(true, format!("collection {name}: {dim}d"));
                    }
                    Ok(Some(dim)) => {
                        report(
                            false,
                            format!("collection {name}: {dim}d, provider expects {}d", provider.dim()),
                        );
                        if failure.is_none() {
                            failure = Some(AppError::ConfigMismatch {
                                collection: name.clone(),
                                expected: provider.dim(),
                                actual: dim,
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report(false, format!("collection {name}: {e}"));
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }
        }
        Err(e) => {
            report(false, format!("store unreachable at {}: {e}", config.store_url));
            if failure.is_none() {
                failure = Some(e);
            }
        }
    }

    match failure {
        None => {
            println!("all checks passed");
            Ok(())
        }
        Some(e) => Err(e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }
}
