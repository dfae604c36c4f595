//! Operational CLI for the data plane
//!
//! Thin glue around the library: submit indexing jobs, run consumers, run a
//! single worker batch (the consumer invokes this as a subprocess), query
//! the search engine, and inspect the error log and job status. HTTP
//! surfaces live elsewhere; this binary is what deployment scripts and the
//! consumer's subprocess contract need.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use mnemolite::breaker::{EMBEDDING_SERVICE, RELATIONAL_DB_HEALTH, VECTOR_CACHE_KV};
use mnemolite::cache::{CacheLayer, MultiLayerCache};
use mnemolite::chunker::Chunker;
use mnemolite::config::Config;
use mnemolite::consumer::Consumer;
use mnemolite::embedder::EmbeddingClient;
use mnemolite::errors::ErrorKind;
use mnemolite::producer::Producer;
use mnemolite::reranker::RerankClient;
use mnemolite::search::{SearchEngine, SearchMode, SearchRequest};
use mnemolite::store::{ChunkFilters, Store};
use mnemolite::stream::{BatchPayload, StreamClient};
use mnemolite::worker::Worker;

#[derive(Parser)]
#[command(name = "mnemolite")]
#[command(about = "Code-intelligence backend: batch indexing and hybrid code search")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a tree and submit an indexing job to the stream
    Index {
        /// Repository name recorded on every chunk
        #[arg(long)]
        repository: String,
        /// Root directory to scan
        path: PathBuf,
        /// Comma-separated extensions (default: all supported languages)
        #[arg(long)]
        extensions: Option<String>,
        /// Files per batch
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Run a batch consumer until interrupted
    Consume {
        /// Consumer name within the group (default: host-pid)
        #[arg(long)]
        consumer_id: Option<String>,
        /// Root directory batch file paths resolve against
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Process one batch payload from stdin (invoked by the consumer)
    Worker {
        /// Root directory batch file paths resolve against
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Search indexed chunks
    Search {
        /// Search query
        query: String,
        /// lexical, vector or hybrid
        #[arg(long, default_value = "hybrid")]
        mode: String,
        /// Max results
        #[arg(short = 'n', long, default_value = "10")]
        top_k: usize,
        /// Filter by repository
        #[arg(long)]
        repository: Option<String>,
        /// Filter by language
        #[arg(short = 'l', long)]
        lang: Option<String>,
        /// Filter by chunk type
        #[arg(long)]
        chunk_type: Option<String>,
        /// Filter by path prefix
        #[arg(long)]
        path_prefix: Option<String>,
        /// Skip the response cache
        #[arg(long)]
        bypass_cache: bool,
    },
    /// List indexing errors for a repository
    Errors {
        #[arg(long)]
        repository: String,
        /// Filter by error type
        #[arg(long)]
        error_type: Option<String>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Show a batch job's status
    Status {
        job_id: String,
    },
    /// Clear the search response cache
    CacheClear {
        /// l1, l2 or all
        #[arg(long, default_value = "all")]
        layer: String,
    },
    /// Probe the database and stream, and report breaker states
    Health,
}

pub async fn run_with(cli: Cli) -> Result<()> {
    let config = Config::from_env();

    match cli.command {
        Commands::Index {
            repository,
            path,
            extensions,
            batch_size,
        } => {
            let store = Store::connect(&config.database_url).await?;
            let stream = StreamClient::connect(&config.stream_url).await?;
            let producer = Producer::new(store, stream, config.max_file_size);

            let extensions: Vec<String> = match extensions {
                Some(raw) => raw.split(',').map(|e| e.trim().to_string()).collect(),
                None => mnemolite::language::Language::supported_extensions()
                    .iter()
                    .map(|e| e.to_string())
                    .collect(),
            };

            let response = producer
                .submit(
                    &repository,
                    &path,
                    &extensions,
                    batch_size.unwrap_or(config.batch_size),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        Commands::Consume { consumer_id, root } => {
            let store = Store::connect(&config.database_url).await?;
            let stream = StreamClient::connect(&config.stream_url).await?;

            let consumer_id = consumer_id.unwrap_or_else(|| {
                format!(
                    "{}-{}",
                    std::env::var("HOSTNAME").unwrap_or_else(|_| "consumer".to_string()),
                    std::process::id()
                )
            });

            let consumer = Consumer::new(
                stream,
                store,
                consumer_id,
                config.worker_timeout,
                root,
            );

            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, stopping after current entry");
                    let _ = stop_tx.send(true);
                }
            });

            consumer.run(stop_rx).await?;
            Ok(())
        }

        Commands::Worker { root } => {
            let mut input = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut input)
                .await
                .context("Failed to read payload from stdin")?;
            let payload: BatchPayload =
                serde_json::from_slice(&input).context("Invalid batch payload")?;

            let registry = config.breaker_registry();
            let embedding_breaker = registry
                .get(EMBEDDING_SERVICE)
                .context("embedding breaker missing from registry")?;

            let store = Store::connect(&config.database_url).await?;
            let worker = Worker::new(
                Chunker::new(config.max_file_size),
                EmbeddingClient::new(
                    &config.embedding_service_url,
                    config.embedding_batch_size,
                    embedding_breaker,
                ),
                store,
            );

            let report = worker.run_batch(&payload, &root).await?;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }

        Commands::Search {
            query,
            mode,
            top_k,
            repository,
            lang,
            chunk_type,
            path_prefix,
            bypass_cache,
        } => {
            let mode: SearchMode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let filters = ChunkFilters {
                repository,
                language: lang
                    .map(|l| l.parse().map_err(|e: String| anyhow::anyhow!(e)))
                    .transpose()?,
                chunk_type: chunk_type
                    .map(|t| t.parse().map_err(|e: String| anyhow::anyhow!(e)))
                    .transpose()?,
                path_prefix,
            };

            let engine = build_search_engine(&config).await?;
            let response = engine
                .search(&SearchRequest {
                    query,
                    mode,
                    filters,
                    top_k,
                    bypass_cache,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        Commands::Errors {
            repository,
            error_type,
            limit,
            offset,
        } => {
            let kind = error_type
                .map(|t| t.parse::<ErrorKind>().map_err(|e| anyhow::anyhow!(e)))
                .transpose()?;
            let store = Store::connect(&config.database_url).await?;
            let errors = store
                .list_indexing_errors(&repository, kind, limit, offset)
                .await?;
            let total = store.count_indexing_errors(&repository, kind).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "errors": errors,
                    "total": total,
                    "repository": repository,
                }))?
            );
            Ok(())
        }

        Commands::Status { job_id } => {
            let job_id = Uuid::parse_str(&job_id).context("Invalid job id")?;
            let store = Store::connect(&config.database_url).await?;
            match store.job(job_id).await? {
                Some(job) => {
                    println!("{}", serde_json::to_string_pretty(&job)?);
                    Ok(())
                }
                None => bail!("No job found with id {job_id}"),
            }
        }

        Commands::CacheClear { layer } => {
            let layer: CacheLayer = layer.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let cache = build_cache(&config).await;
            cache.clear(layer).await;
            println!("cache cleared: {layer:?}");
            Ok(())
        }

        Commands::Health => {
            let registry = config.breaker_registry();
            let db_breaker = registry
                .get(RELATIONAL_DB_HEALTH)
                .context("database breaker missing from registry")?;

            let database = match Store::connect(&config.database_url).await {
                Ok(store) => match db_breaker.call(store.ping()).await {
                    Ok(Ok(())) => "ok".to_string(),
                    Ok(Err(e)) => format!("error: {e}"),
                    Err(e) => format!("unavailable: {e}"),
                },
                Err(e) => format!("error: {e}"),
            };

            let stream_depth = match StreamClient::connect(&config.stream_url).await {
                Ok(stream) => stream
                    .len()
                    .await
                    .map(|n| n.to_string())
                    .unwrap_or_else(|e| format!("error: {e}")),
                Err(e) => format!("error: {e}"),
            };

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "database": database,
                    "stream_depth": stream_depth,
                    "breakers": registry.metrics(),
                }))?
            );
            Ok(())
        }
    }
}

async fn build_search_engine(config: &Config) -> Result<SearchEngine> {
    let registry = config.breaker_registry();
    let embedding_breaker = registry
        .get(EMBEDDING_SERVICE)
        .context("embedding breaker missing from registry")?;

    let store = Store::connect(&config.database_url).await?;
    let embedder = EmbeddingClient::new(
        &config.embedding_service_url,
        config.embedding_batch_size,
        embedding_breaker.clone(),
    );
    let reranker = RerankClient::new(&config.embedding_service_url, embedding_breaker);
    let cache = build_cache(config).await;

    Ok(SearchEngine::new(
        store,
        embedder,
        reranker,
        cache,
        config.search_timeout,
    ))
}

/// Build the two-layer cache, degrading to L1-only when Redis is unreachable.
async fn build_cache(config: &Config) -> MultiLayerCache {
    let registry = config.breaker_registry();
    let Some(breaker) = registry.get(VECTOR_CACHE_KV) else {
        return MultiLayerCache::l1_only(
            config.cache_l1_capacity,
            config.cache_l1_ttl,
            config.cache_negative_ttl,
        );
    };

    match MultiLayerCache::with_redis(
        config.cache_l1_capacity,
        config.cache_l1_ttl,
        config.cache_l2_ttl,
        config.cache_negative_ttl,
        &config.stream_url,
        breaker,
    )
    .await
    {
        Ok(cache) => cache,
        Err(e) => {
            tracing::warn!(error = %e, "L2 cache unavailable, running L1-only");
            MultiLayerCache::l1_only(
                config.cache_l1_capacity,
                config.cache_l1_ttl,
                config.cache_negative_ttl,
            )
        }
    }
}
