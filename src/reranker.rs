//! Cross-encoder re-ranking for second-pass scoring
//!
//! Re-scores (query, passage) pairs with the embedding service's
//! cross-encoder endpoint, producing more accurate orderings than fused
//! first-pass scores alone. Rerank scores are opaque: they fully replace the
//! ordering inside the re-scored window and are never compared against
//! fusion scores.
//!
//! The client shares the `embedding_service` circuit breaker; when it is
//! open the search path skips reranking and flags the response instead of
//! failing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::CircuitBreaker;

#[derive(Error, Debug)]
pub enum RerankerError {
    #[error("rerank request failed: {0}")]
    Request(String),
    #[error("rerank service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("rerank score count mismatch: sent {sent}, got {got}")]
    CountMismatch { sent: usize, got: usize },
    #[error("embedding service circuit breaker is open")]
    CircuitOpen,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [&'a str],
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

/// Cross-encoder client for pairwise (query, candidate) scoring.
pub struct RerankClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl RerankClient {
    pub fn new(base_url: impl Into<String>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            breaker,
        }
    }

    /// Score each candidate text against the query.
    ///
    /// Returns one score per input text, in input order. Higher is better;
    /// the scale is model-defined and only meaningful for sorting.
    pub async fn score(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>, RerankerError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let _span =
            tracing::info_span!("rerank", count = texts.len(), query_len = query.len()).entered();

        self.breaker.check().map_err(|_| RerankerError::CircuitOpen)?;

        match self.post_rerank(query, texts).await {
            Ok(scores) => {
                self.breaker.record_success();
                Ok(scores)
            }
            Err(e) => {
                match &e {
                    RerankerError::Status { status, .. } if *status < 500 => {
                        self.breaker.record_success()
                    }
                    _ => self.breaker.record_failure(),
                }
                Err(e)
            }
        }
    }

    async fn post_rerank(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>, RerankerError> {
        let url = format!("{}/rerank", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&RerankRequest { query, texts })
            .send()
            .await
            .map_err(|e| RerankerError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RerankerError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| RerankerError::Request(e.to_string()))?;

        if parsed.scores.len() != texts.len() {
            return Err(RerankerError::CountMismatch {
                sent: texts.len(),
                got: parsed.scores.len(),
            });
        }
        Ok(parsed.scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "embedding_service",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        ))
    }

    #[tokio::test]
    async fn test_scores_in_input_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rerank");
                then.status(200)
                    .json_body(serde_json::json!({ "scores": [0.1, 0.9, 0.5] }));
            })
            .await;

        let client = RerankClient::new(server.base_url(), breaker());
        let scores = client.score("parse tree", &["a", "b", "c"]).await.unwrap();
        assert_eq!(scores, vec![0.1, 0.9, 0.5]);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let b = breaker();
        b.record_failure();

        let client = RerankClient::new("http://localhost:1", b);
        let err = client.score("q", &["a"]).await.unwrap_err();
        assert!(matches!(err, RerankerError::CircuitOpen));
    }

    #[tokio::test]
    async fn test_count_mismatch_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rerank");
                then.status(200)
                    .json_body(serde_json::json!({ "scores": [0.1] }));
            })
            .await;

        let client = RerankClient::new(server.base_url(), breaker());
        let err = client.score("q", &["a", "b"]).await.unwrap_err();
        assert!(matches!(err, RerankerError::CountMismatch { sent: 2, got: 1 }));
    }

    #[tokio::test]
    async fn test_empty_candidates_is_noop() {
        let client = RerankClient::new("http://localhost:1", breaker());
        let scores = client.score("q", &[]).await.unwrap();
        assert!(scores.is_empty());
    }
}
