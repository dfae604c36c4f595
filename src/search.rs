//! Hybrid search engine
//!
//! Three modes over the chunk store: lexical (trigram similarity), vector
//! (cosine over the domain picked by query intent), and hybrid, which issues
//! both legs with a candidate pool of `3·top_k` and fuses them by Reciprocal
//! Rank Fusion (`score = Σ 1/(k + rank)`, k = 60). Fused candidates are
//! optionally re-scored by the cross-encoder when `top_k ≤ 50`; rerank
//! output fully replaces ordering inside the re-scored window.
//!
//! Degradation rules: a failed vector leg with a healthy lexical leg returns
//! lexical-only results flagged `degraded`; rerank failures (including an
//! open breaker) fall back to fused order with `reranked: false`; cache
//! failures fall through to the origin. Only both legs failing surfaces an
//! error.
//!
//! Responses are cached under a fingerprint of (query, filters, mode,
//! top_k); `bypass_cache` skips the read but still refreshes the entry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::MultiLayerCache;
use crate::embedder::{EmbeddingClient, EmbeddingDomain};
use crate::reranker::RerankClient;
use crate::store::{ChunkFilters, ScoredChunk, Store, StoreError, VectorDomain};

/// RRF rank constant (the de facto standard).
const RRF_K: f32 = 60.0;

/// Rerank applies only when the caller asks for this many results or fewer.
const RERANK_MAX_TOP_K: usize = 50;

/// Candidate pool multiplier for the hybrid legs and the rerank window.
const POOL_FACTOR: usize = 3;

/// Longest snippet returned per result.
const SNIPPET_MAX_CHARS: usize = 500;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("query cannot be empty")]
    EmptyQuery,
    #[error("search timed out")]
    Timeout,
    #[error("both search legs failed: {0}")]
    AllLegsFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("embedding failed: {0}")]
    Embedder(#[from] crate::embedder::EmbedderError),
}

/// Search mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Lexical,
    Vector,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Lexical => "lexical",
            SearchMode::Vector => "vector",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lexical" => Ok(SearchMode::Lexical),
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!(
                "unknown search mode: '{}' (expected lexical, vector, hybrid)",
                other
            )),
        }
    }
}

/// A search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub filters: ChunkFilters,
    pub top_k: usize,
    pub bypass_cache: bool,
}

/// One result row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub chunk_id: String,
    pub repository: String,
    pub file_path: String,
    pub chunk_type: String,
    pub name: String,
    pub snippet: String,
    pub score: f32,
    /// 1-indexed final rank
    pub rank: usize,
}

/// Response metadata for observability and client fallbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub reranked: bool,
    pub degraded: bool,
    pub total_candidates: usize,
}

/// A complete search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub metadata: SearchMetadata,
}

/// Hybrid search over the chunk store, cache-fronted.
pub struct SearchEngine {
    store: Store,
    embedder: EmbeddingClient,
    reranker: RerankClient,
    cache: MultiLayerCache,
    timeout: Duration,
}

impl SearchEngine {
    pub fn new(
        store: Store,
        embedder: EmbeddingClient,
        reranker: RerankClient,
        cache: MultiLayerCache,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
            cache,
            timeout,
        }
    }

    /// Run one search request end-to-end.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let top_k = request.top_k.clamp(1, 100);
        let started = Instant::now();
        let _span = tracing::info_span!(
            "search",
            mode = request.mode.as_str(),
            top_k,
            bypass = request.bypass_cache
        )
        .entered();

        let key = fingerprint(query, &request.filters, request.mode, top_k);

        if !request.bypass_cache {
            if let Some(mut cached) = self.cache.get::<SearchResponse>(&key).await {
                cached.metadata.cache_hit = true;
                cached.metadata.latency_ms = started.elapsed().as_millis() as u64;
                return Ok(cached);
            }
        }

        let mut response = tokio::time::timeout(
            self.timeout,
            self.search_origin(query, request.mode, &request.filters, top_k),
        )
        .await
        .map_err(|_| SearchError::Timeout)??;

        response.metadata.latency_ms = started.elapsed().as_millis() as u64;

        // Refresh the cache even on a bypass; cache failures never surface
        self.cache.put(&key, &response).await;

        Ok(response)
    }

    async fn search_origin(
        &self,
        query: &str,
        mode: SearchMode,
        filters: &ChunkFilters,
        top_k: usize,
    ) -> Result<SearchResponse, SearchError> {
        match mode {
            SearchMode::Lexical => {
                let hits = self.store.lexical_top_k(query, filters, top_k).await?;
                Ok(assemble(hits, top_k, SearchMetadata::default()))
            }
            SearchMode::Vector => {
                let hits = self.vector_leg(query, filters, top_k).await?;
                Ok(assemble(hits, top_k, SearchMetadata::default()))
            }
            SearchMode::Hybrid => self.hybrid(query, filters, top_k).await,
        }
    }

    async fn vector_leg(
        &self,
        query: &str,
        filters: &ChunkFilters,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, SearchError> {
        let (embed_domain, store_domain) = match detect_intent(query) {
            QueryIntent::Code => (EmbeddingDomain::Code, VectorDomain::Code),
            QueryIntent::Text => (EmbeddingDomain::Text, VectorDomain::Text),
        };
        let embedding = self.embedder.embed_one(embed_domain, query).await?;
        Ok(self
            .store
            .vector_top_k(&embedding, store_domain, filters, k)
            .await?)
    }

    async fn hybrid(
        &self,
        query: &str,
        filters: &ChunkFilters,
        top_k: usize,
    ) -> Result<SearchResponse, SearchError> {
        let pool = top_k * POOL_FACTOR;

        let (lexical, vector) = tokio::join!(
            self.store.lexical_top_k(query, filters, pool),
            self.vector_leg(query, filters, pool),
        );

        let (candidates, fused, degraded) = match (lexical, vector) {
            (Ok(lex), Ok(vec)) => {
                let fused = rrf_fuse(
                    &ids(&lex),
                    &ids(&vec),
                    pool,
                );
                let mut candidates: HashMap<String, ScoredChunk> = HashMap::new();
                for hit in lex.into_iter().chain(vec) {
                    candidates.entry(hit.chunk.chunk_id.clone()).or_insert(hit);
                }
                (candidates, fused, false)
            }
            (Ok(lex), Err(e)) => {
                tracing::warn!(error = %e, "Vector leg failed, degrading to lexical-only");
                let fused: Vec<(String, f32)> = lex
                    .iter()
                    .map(|h| (h.chunk.chunk_id.clone(), h.score))
                    .collect();
                let candidates: HashMap<String, ScoredChunk> = lex
                    .into_iter()
                    .map(|h| (h.chunk.chunk_id.clone(), h))
                    .collect();
                (candidates, fused, true)
            }
            (Err(e), Ok(vec)) => {
                tracing::warn!(error = %e, "Lexical leg failed, degrading to vector-only");
                let fused: Vec<(String, f32)> = vec
                    .iter()
                    .map(|h| (h.chunk.chunk_id.clone(), h.score))
                    .collect();
                let candidates: HashMap<String, ScoredChunk> = vec
                    .into_iter()
                    .map(|h| (h.chunk.chunk_id.clone(), h))
                    .collect();
                (candidates, fused, true)
            }
            (Err(lex_err), Err(vec_err)) => {
                return Err(SearchError::AllLegsFailed(format!(
                    "lexical: {lex_err}; vector: {vec_err}"
                )));
            }
        };

        let total_candidates = candidates.len();

        // Materialize fused order
        let mut ordered: Vec<ScoredChunk> = fused
            .into_iter()
            .filter_map(|(id, score)| {
                candidates.get(&id).map(|hit| ScoredChunk {
                    chunk: hit.chunk.clone(),
                    score,
                })
            })
            .collect();

        // Cross-encoder pass over the fused window, skipped on failure
        let mut reranked = false;
        if !degraded && top_k <= RERANK_MAX_TOP_K && ordered.len() > 1 {
            let texts: Vec<&str> = ordered
                .iter()
                .map(|h| h.chunk.source_code.as_str())
                .collect();
            match self.reranker.score(query, &texts).await {
                Ok(scores) => {
                    for (hit, score) in ordered.iter_mut().zip(scores) {
                        hit.score = score;
                    }
                    ordered.sort_by(|a, b| b.score.total_cmp(&a.score));
                    reranked = true;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Rerank skipped, keeping fused order");
                }
            }
        }

        Ok(assemble(
            ordered,
            top_k,
            SearchMetadata {
                reranked,
                degraded,
                total_candidates,
                ..SearchMetadata::default()
            },
        ))
    }
}

fn ids(hits: &[ScoredChunk]) -> Vec<String> {
    hits.iter().map(|h| h.chunk.chunk_id.clone()).collect()
}

/// Reciprocal Rank Fusion of two ranked id lists.
///
/// `score(d) = Σ_s 1/(k + rank_s(d))` with k = 60 and 1-indexed ranks.
/// Returns ids sorted by fused score descending, ties broken by id so the
/// ordering is deterministic.
pub fn rrf_fuse(lexical_ids: &[String], vector_ids: &[String], limit: usize) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for (rank, id) in lexical_ids.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
    }
    for (rank, id) in vector_ids.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
    }

    let mut sorted: Vec<(String, f32)> = scores.into_iter().collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(limit);
    sorted
}

#[derive(Debug, PartialEq)]
enum QueryIntent {
    Code,
    Text,
}

/// Pick the embedding domain from the query's shape: identifier-like
/// queries (camelCase, snake_case, paths, call syntax) search the code
/// domain, prose searches the text domain.
fn detect_intent(query: &str) -> QueryIntent {
    let trimmed = query.trim();
    if trimmed.contains("()") || trimmed.contains("::") || trimmed.contains("->") {
        return QueryIntent::Code;
    }
    if trimmed.contains(char::is_whitespace) {
        return QueryIntent::Text;
    }
    let has_snake = trimmed.contains('_');
    let has_camel = trimmed
        .as_bytes()
        .windows(2)
        .any(|w| w[0].is_ascii_lowercase() && w[1].is_ascii_uppercase());
    let has_path = trimmed.contains('.') || trimmed.contains('/');
    if has_snake || has_camel || has_path {
        QueryIntent::Code
    } else {
        QueryIntent::Text
    }
}

/// Stable cache key over the request's semantic identity.
fn fingerprint(query: &str, filters: &ChunkFilters, mode: SearchMode, top_k: usize) -> String {
    let filters_json = serde_json::to_string(filters).unwrap_or_default();
    let key = format!("{query}\x1f{filters_json}\x1f{}\x1f{top_k}", mode.as_str());
    format!("search:{}", &blake3::hash(key.as_bytes()).to_hex()[..32])
}

fn assemble(hits: Vec<ScoredChunk>, top_k: usize, metadata: SearchMetadata) -> SearchResponse {
    let total = if metadata.total_candidates > 0 {
        metadata.total_candidates
    } else {
        hits.len()
    };
    let results: Vec<SearchResultItem> = hits
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(i, hit)| SearchResultItem {
            chunk_id: hit.chunk.chunk_id,
            repository: hit.chunk.repository,
            file_path: hit.chunk.file_path,
            chunk_type: hit.chunk.chunk_type,
            name: hit.chunk.name,
            snippet: snippet(&hit.chunk.source_code),
            score: hit.score,
            rank: i + 1,
        })
        .collect();

    SearchResponse {
        results,
        metadata: SearchMetadata {
            total_candidates: total,
            ..metadata
        },
    }
}

fn snippet(source: &str) -> String {
    if source.len() <= SNIPPET_MAX_CHARS {
        return source.to_string();
    }
    let mut end = SNIPPET_MAX_CHARS;
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &source[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids_of(fused: &[(String, f32)]) -> Vec<&str> {
        fused.iter().map(|(id, _)| id.as_str()).collect()
    }

    #[test]
    fn test_rrf_both_lists_beat_single_list() {
        let lexical = vec!["a".to_string(), "b".to_string()];
        let vector = vec!["b".to_string(), "c".to_string()];
        let fused = rrf_fuse(&lexical, &vector, 10);

        // b appears in both lists and wins despite never ranking first
        assert_eq!(ids_of(&fused)[0], "b");
        let b_score = fused[0].1;
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((b_score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_rrf_scores_non_increasing() {
        let lexical: Vec<String> = (0..10).map(|i| format!("l{i}")).collect();
        let vector: Vec<String> = (0..10).map(|i| format!("v{i}")).collect();
        let fused = rrf_fuse(&lexical, &vector, 20);
        for pair in fused.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_rrf_respects_limit() {
        let lexical: Vec<String> = (0..30).map(|i| format!("id{i}")).collect();
        let fused = rrf_fuse(&lexical, &[], 5);
        assert_eq!(fused.len(), 5);
    }

    #[test]
    fn test_rrf_deterministic_on_ties() {
        let lexical = vec!["x".to_string()];
        let vector = vec!["y".to_string()];
        // Identical scores; tie broken by id
        let fused = rrf_fuse(&lexical, &vector, 10);
        assert_eq!(ids_of(&fused), vec!["x", "y"]);
    }

    #[test]
    fn test_intent_code_shapes() {
        assert_eq!(detect_intent("parseTree"), QueryIntent::Code);
        assert_eq!(detect_intent("parse_tree"), QueryIntent::Code);
        assert_eq!(detect_intent("fs::read"), QueryIntent::Code);
        assert_eq!(detect_intent("main()"), QueryIntent::Code);
        assert_eq!(detect_intent("src/parser.ts"), QueryIntent::Code);
    }

    #[test]
    fn test_intent_text_shapes() {
        assert_eq!(detect_intent("builds a parse tree"), QueryIntent::Text);
        assert_eq!(detect_intent("authentication"), QueryIntent::Text);
    }

    #[test]
    fn test_fingerprint_varies_by_inputs() {
        let filters = ChunkFilters::default();
        let base = fingerprint("q", &filters, SearchMode::Hybrid, 10);
        assert_eq!(base, fingerprint("q", &filters, SearchMode::Hybrid, 10));
        assert_ne!(base, fingerprint("q2", &filters, SearchMode::Hybrid, 10));
        assert_ne!(base, fingerprint("q", &filters, SearchMode::Lexical, 10));
        assert_ne!(base, fingerprint("q", &filters, SearchMode::Hybrid, 20));

        let mut with_repo = ChunkFilters::default();
        with_repo.repository = Some("acme".to_string());
        assert_ne!(base, fingerprint("q", &with_repo, SearchMode::Hybrid, 10));
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let source = "é".repeat(600);
        let s = snippet(&source);
        assert!(s.chars().count() <= SNIPPET_MAX_CHARS + 1);
        assert!(s.ends_with('…'));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert_eq!("LEXICAL".parse::<SearchMode>().unwrap(), SearchMode::Lexical);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }
}
