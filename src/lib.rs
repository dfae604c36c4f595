//! # MnemoLite: code-intelligence data plane
//!
//! Ingests source trees, breaks them into semantically meaningful chunks,
//! builds a cross-reference graph, and serves hybrid (lexical + vector)
//! search to LLM clients.
//!
//! ## Subsystems
//!
//! - **Batch indexing pipeline**: [`producer`] walks and partitions a tree
//!   into durable stream batches; [`consumer`] drains the stream with
//!   consumer-group semantics and runs each batch in a [`worker`]
//!   subprocess (chunk → embed → persist → graph), with continue-on-error
//!   per file and retry/dead-letter per batch ([`errors`]).
//! - **Hybrid search**: [`search`] fuses trigram and vector legs with
//!   reciprocal-rank fusion and cross-encoder reranking over the Postgres
//!   [`store`].
//! - **Resilience**: per-dependency circuit breakers ([`breaker`]) and an
//!   L1+L2 read-through cache ([`cache`]).
//!
//! ## Quick start
//!
//! ```no_run
//! use mnemolite::chunker::Chunker;
//! use mnemolite::language::Language;
//!
//! # fn main() -> anyhow::Result<()> {
//! let chunker = Chunker::new(1_048_576);
//! let outcome = chunker.chunk_source(
//!     "acme/shop",
//!     "src/cart.ts",
//!     "export function addItem(cart: Cart, item: Item) { return [...cart, item]; }",
//!     Language::TypeScript,
//! )?;
//! for chunk in &outcome.chunks {
//!     println!("{} {} ({}..{})", chunk.kind, chunk.name, chunk.line_start, chunk.line_end);
//! }
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod consumer;
pub mod embedder;
pub mod errors;
pub mod graph;
pub mod language;
pub mod metrics;
pub mod producer;
pub mod reranker;
pub mod search;
pub mod store;
pub mod stream;
pub mod worker;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use cache::{CacheLayer, MultiLayerCache};
pub use chunker::{Chunk, Chunker};
pub use config::Config;
pub use embedder::{Embedding, EmbeddingClient, EmbeddingDomain, EMBEDDING_DIM};
pub use errors::{classify, retry_delay, ErrorKind, ErrorTier};
pub use graph::{build_graph, CodeGraph, EdgeKind};
pub use language::{ChunkKind, Language};
pub use metrics::MetricsRecorder;
pub use producer::{BatchIndexingResponse, Producer};
pub use reranker::RerankClient;
pub use search::{SearchEngine, SearchMode, SearchRequest, SearchResponse};
pub use store::Store;
pub use stream::{BatchPayload, StreamClient};
pub use worker::Worker;
