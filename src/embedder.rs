//! Dual-domain embedding client
//!
//! Thin HTTP client for the external embedding service. Two vector domains:
//! TEXT for natural language (comments, docstrings, queries in prose) and
//! CODE for identifiers and structural tokens; HYBRID asks the service to
//! fuse both models into one vector for dual-index storage. Every domain
//! returns fixed-length 768-float vectors. The service loads models lazily
//! on its side; this client only batches, validates dimensions, and reports
//! failures to the `embedding_service` circuit breaker.
//!
//! When the breaker is open, calls fail immediately with
//! [`EmbedderError::CircuitOpen`] without touching the network.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::CircuitBreaker;

/// Vector length per embedding domain
pub const EMBEDDING_DIM: usize = 768;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding count mismatch: sent {sent} texts, got {got} vectors")]
    CountMismatch { sent: usize, got: usize },
    #[error("embedding service circuit breaker is open")]
    CircuitOpen,
}

/// Embedding domain selecting which model the service runs.
///
/// The wire contract is the same for every domain: each text comes back as
/// one 768-float vector. For `hybrid` the service fuses its text and code
/// models into that single vector; the combination happens server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingDomain {
    /// Natural language: comments, docstrings, prose queries
    Text,
    /// Identifiers and structural tokens
    Code,
    /// Both models fused server-side, for dual-index storage
    Hybrid,
}

impl EmbeddingDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingDomain::Text => "text",
            EmbeddingDomain::Code => "code",
            EmbeddingDomain::Hybrid => "hybrid",
        }
    }

    /// Expected vector length; fixed by the service contract for every domain.
    pub fn dimension(self) -> usize {
        EMBEDDING_DIM
    }
}

impl std::fmt::Display for EmbeddingDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-length embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(data: Vec<f32>) -> Self {
        Self(data)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a pgvector literal: `[0.1,0.2,…]`
    pub fn to_vector_literal(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 10 + 2);
        out.push('[');
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{}", v));
        }
        out.push(']');
        out
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    domain: &'a str,
    texts: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP client for the embedding service, batched and breaker-gated.
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    max_batch: usize,
    breaker: Arc<CircuitBreaker>,
}

impl EmbeddingClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, max_batch: usize, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_batch: max_batch.max(1),
            breaker,
        }
    }

    /// Embed a batch of texts in the given domain.
    ///
    /// Requests are split into sub-batches of at most `max_batch` texts; each
    /// sub-batch completes synchronously before the next is sent, so a
    /// returned `Ok` covers every input text in order.
    pub async fn embed(
        &self,
        domain: EmbeddingDomain,
        texts: &[&str],
    ) -> Result<Vec<Embedding>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let _span =
            tracing::info_span!("embed", domain = %domain, count = texts.len()).entered();

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch) {
            all.extend(self.embed_batch(domain, batch).await?);
        }
        Ok(all)
    }

    /// Embed a single text.
    pub async fn embed_one(
        &self,
        domain: EmbeddingDomain,
        text: &str,
    ) -> Result<Embedding, EmbedderError> {
        let mut vecs = self.embed(domain, &[text]).await?;
        vecs.pop().ok_or(EmbedderError::CountMismatch { sent: 1, got: 0 })
    }

    async fn embed_batch(
        &self,
        domain: EmbeddingDomain,
        texts: &[&str],
    ) -> Result<Vec<Embedding>, EmbedderError> {
        self.breaker.check().map_err(|_| EmbedderError::CircuitOpen)?;

        match self.post_embeddings(domain, texts).await {
            Ok(vecs) => {
                self.breaker.record_success();
                Ok(vecs)
            }
            Err(e) => {
                // Only infrastructure failures trip the breaker; payload
                // errors (4xx, dimension mismatch) are the caller's problem
                if e.trips_breaker() {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                Err(e)
            }
        }
    }

    async fn post_embeddings(
        &self,
        domain: EmbeddingDomain,
        texts: &[&str],
    ) -> Result<Vec<Embedding>, EmbedderError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&EmbedRequest {
                domain: domain.as_str(),
                texts,
            })
            .send()
            .await
            .map_err(|e| EmbedderError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedderError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbedderError::Request(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbedderError::CountMismatch {
                sent: texts.len(),
                got: parsed.embeddings.len(),
            });
        }

        let expected = domain.dimension();
        for vec in &parsed.embeddings {
            if vec.len() != expected {
                return Err(EmbedderError::DimensionMismatch {
                    expected,
                    actual: vec.len(),
                });
            }
        }

        Ok(parsed.embeddings.into_iter().map(Embedding::new).collect())
    }
}

impl EmbedderError {
    /// Whether this failure counts against the embedding service's breaker.
    fn trips_breaker(&self) -> bool {
        match self {
            EmbedderError::Request(_) => true,
            EmbedderError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "embedding_service",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        ))
    }

    fn vectors(n: usize, dim: usize) -> serde_json::Value {
        let vecs: Vec<Vec<f32>> = (0..n).map(|_| vec![0.1; dim]).collect();
        serde_json::json!({ "embeddings": vecs })
    }

    #[tokio::test]
    async fn test_embed_batches_and_preserves_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(vectors(2, 768));
            })
            .await;

        let client = EmbeddingClient::new(server.base_url(), 2, breaker(3));
        let out = client
            .embed(EmbeddingDomain::Code, &["a", "b", "c", "d"])
            .await
            .unwrap();

        assert_eq!(out.len(), 4);
        assert_eq!(out[0].len(), 768);
        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn test_hybrid_uses_same_wire_contract() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .json_body_includes(r#"{"domain": "hybrid"}"#);
                then.status(200).json_body(vectors(1, 768));
            })
            .await;

        let client = EmbeddingClient::new(server.base_url(), 8, breaker(3));
        let e = client
            .embed_one(EmbeddingDomain::Hybrid, "fn main()")
            .await
            .unwrap();
        assert_eq!(e.len(), 768);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(vectors(1, 42));
            })
            .await;

        let client = EmbeddingClient::new(server.base_url(), 8, breaker(3));
        let err = client.embed_one(EmbeddingDomain::Text, "x").await.unwrap_err();
        assert!(matches!(
            err,
            EmbedderError::DimensionMismatch { expected: 768, actual: 42 }
        ));
    }

    #[tokio::test]
    async fn test_5xx_trips_breaker_then_fails_fast() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(503).body("overloaded");
            })
            .await;

        let client = EmbeddingClient::new(server.base_url(), 8, breaker(3));
        for _ in 0..3 {
            let err = client.embed_one(EmbeddingDomain::Text, "x").await.unwrap_err();
            assert!(matches!(err, EmbedderError::Status { status: 503, .. }));
        }

        // Breaker is now open: no further requests reach the service
        let err = client.embed_one(EmbeddingDomain::Text, "x").await.unwrap_err();
        assert!(matches!(err, EmbedderError::CircuitOpen));
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn test_4xx_does_not_trip_breaker() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(422).body("empty text");
            })
            .await;

        let client = EmbeddingClient::new(server.base_url(), 8, breaker(1));
        let err = client.embed_one(EmbeddingDomain::Text, "").await.unwrap_err();
        assert!(matches!(err, EmbedderError::Status { status: 422, .. }));

        // Still closed: next call reaches the service
        let err = client.embed_one(EmbeddingDomain::Text, "").await.unwrap_err();
        assert!(matches!(err, EmbedderError::Status { status: 422, .. }));
    }

    #[tokio::test]
    async fn test_empty_input_is_noop() {
        let client = EmbeddingClient::new("http://localhost:1", 8, breaker(3));
        let out = client.embed(EmbeddingDomain::Text, &[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_vector_literal() {
        let e = Embedding::new(vec![1.0, -0.5, 0.25]);
        assert_eq!(e.to_vector_literal(), "[1,-0.5,0.25]");
    }
}
