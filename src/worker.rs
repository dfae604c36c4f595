//! Batch worker: one batch end-to-end
//!
//! Runs as an isolated subprocess (one batch per invocation) so a
//! memory-hungry parse or embed cannot take the consumer down. Every file is
//! processed behind its own error boundary: chunk → embed (text + code
//! domains) → persist in a single transaction → record captured failures in
//! the error log. A broken file never aborts the batch.
//!
//! After persisting, the repository's reference graph is rebuilt from the
//! stored chunks so graph reads stay consistent with the index.
//!
//! Exit contract: 0 on completion even when individual files failed; 1 only
//! for uncaught system failures. The consumer enforces the wall-clock batch
//! timeout and reports it as exit 124.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::chunker::{Chunk, Chunker};
use crate::embedder::{EmbedderError, EmbeddingClient, EmbeddingDomain};
use crate::errors::ErrorKind;
use crate::graph;
use crate::store::{NewIndexingError, Store, StoreError};
use crate::stream::BatchPayload;

/// Per-file processing deadline inside a batch.
const FILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Failures that abort the whole batch (batch- or system-tier).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of one processed batch.
#[derive(Debug, Default, serde::Serialize)]
pub struct BatchReport {
    pub files_processed: usize,
    pub files_failed: usize,
    pub chunks_written: u64,
}

/// Worker over one batch payload.
pub struct Worker {
    chunker: Chunker,
    embedder: EmbeddingClient,
    store: Store,
}

impl Worker {
    pub fn new(chunker: Chunker, embedder: EmbeddingClient, store: Store) -> Self {
        Self {
            chunker,
            embedder,
            store,
        }
    }

    /// Process every file of the batch, then rebuild the repository graph.
    ///
    /// File-tier failures are logged and skipped; store failures propagate so
    /// the consumer can classify and retry the batch.
    pub async fn run_batch(
        &self,
        payload: &BatchPayload,
        root: &Path,
    ) -> Result<BatchReport, WorkerError> {
        let _span = tracing::info_span!(
            "run_batch",
            job_id = %payload.job_id,
            batch_index = payload.batch_index,
            files = payload.files.len()
        )
        .entered();

        let mut report = BatchReport::default();

        for file in &payload.files {
            match tokio::time::timeout(
                FILE_TIMEOUT,
                self.process_file(&payload.repository, root, file),
            )
            .await
            {
                Ok(Ok(written)) => {
                    report.files_processed += 1;
                    report.chunks_written += written;
                }
                Ok(Err(FileError::Recorded)) => report.files_failed += 1,
                Ok(Err(FileError::Store(e))) => return Err(e.into()),
                Err(_elapsed) => {
                    report.files_failed += 1;
                    self.log_error(
                        &payload.repository,
                        file,
                        ErrorKind::Timeout,
                        format!("file processing timed out after {}s", FILE_TIMEOUT.as_secs()),
                        None,
                    )
                    .await?;
                }
            }
        }

        // Rebuild the reference graph from what is now persisted. Replace is
        // atomic, so concurrent batches of the same repository converge.
        let chunks = self.store.chunks_for_graph(&payload.repository).await?;
        let graph = graph::build_graph(&chunks);
        self.store.replace_graph(&payload.repository, &graph).await?;

        tracing::info!(
            processed = report.files_processed,
            failed = report.files_failed,
            chunks = report.chunks_written,
            "Batch complete"
        );
        Ok(report)
    }

    async fn process_file(
        &self,
        repository: &str,
        root: &Path,
        file: &str,
    ) -> Result<u64, FileError> {
        let abs_path = root.join(file);

        // 1. Chunk
        let outcome = match self.chunker.chunk_file(repository, &abs_path, file) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.log_error(repository, file, e.error_kind(), e.to_string(), None)
                    .await?;
                return Err(FileError::Recorded);
            }
        };

        // Localized declaration failures are logged but do not fail the file
        for issue in &outcome.issues {
            self.log_error(
                repository,
                file,
                issue.error_kind,
                issue.message.clone(),
                outcome.chunks.first().map(|c| c.language.to_string()),
            )
            .await?;
        }

        if outcome.chunks.is_empty() {
            return Ok(0);
        }

        // 2. Embed both domains
        let code_inputs: Vec<&str> = outcome.chunks.iter().map(|c| c.source.as_str()).collect();
        let text_inputs: Vec<String> = outcome.chunks.iter().map(text_input).collect();
        let text_refs: Vec<&str> = text_inputs.iter().map(String::as_str).collect();

        let code_embeddings = match self.embedder.embed(EmbeddingDomain::Code, &code_inputs).await {
            Ok(embeddings) => embeddings,
            Err(e) => return self.embed_failed(repository, file, &outcome.chunks, e).await,
        };
        let text_embeddings = match self.embedder.embed(EmbeddingDomain::Text, &text_refs).await {
            Ok(embeddings) => embeddings,
            Err(e) => return self.embed_failed(repository, file, &outcome.chunks, e).await,
        };

        // 3. Persist in one transaction
        let files = [file.to_string()];
        let written = self
            .store
            .replace_file_chunks(
                repository,
                &files,
                &outcome.chunks,
                &text_embeddings,
                &code_embeddings,
            )
            .await
            .map_err(FileError::Store)?;

        Ok(written)
    }

    async fn embed_failed(
        &self,
        repository: &str,
        file: &str,
        chunks: &[Chunk],
        error: EmbedderError,
    ) -> Result<u64, FileError> {
        self.log_error(
            repository,
            file,
            ErrorKind::EmbeddingError,
            error.to_string(),
            chunks.first().map(|c| c.language.to_string()),
        )
        .await?;
        Err(FileError::Recorded)
    }

    async fn log_error(
        &self,
        repository: &str,
        file: &str,
        error_type: ErrorKind,
        message: String,
        language: Option<String>,
    ) -> Result<(), StoreError> {
        tracing::warn!(file, error_type = %error_type, %message, "File failed");
        self.store
            .record_indexing_error(&NewIndexingError {
                repository: repository.to_string(),
                file_path: file.to_string(),
                error_type,
                error_message: message,
                error_traceback: None,
                chunk_type: None,
                language,
            })
            .await
    }
}

/// Outcome of one file inside the batch boundary.
enum FileError {
    /// File-tier failure, already written to the error log
    Recorded,
    /// Store failure; batch-tier, propagates to the consumer
    Store(StoreError),
}

impl From<StoreError> for FileError {
    fn from(e: StoreError) -> Self {
        FileError::Store(e)
    }
}

/// Text-domain embedding input: the natural-language surface of a chunk.
fn text_input(chunk: &Chunk) -> String {
    let mut parts = vec![chunk.name.clone()];
    if let Some(signature) = &chunk.signature {
        parts.push(signature.clone());
    }
    if let Some(doc) = &chunk.doc {
        parts.push(doc.clone());
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkMetrics;
    use crate::language::{ChunkKind, Language};

    fn chunk(name: &str, signature: Option<&str>, doc: Option<&str>) -> Chunk {
        Chunk {
            repository: "repo".to_string(),
            file_path: "a.py".to_string(),
            language: Language::Python,
            kind: ChunkKind::Function,
            name: name.to_string(),
            nameable: true,
            source: "def f(): pass".to_string(),
            byte_start: 0,
            byte_end: 13,
            line_start: 1,
            line_end: 1,
            content_hash: "h".to_string(),
            signature: signature.map(str::to_string),
            doc: doc.map(str::to_string),
            metrics: ChunkMetrics::default(),
            references: Vec::new(),
        }
    }

    #[test]
    fn test_text_input_prefers_doc_and_signature() {
        let c = chunk("parse_config", Some("def parse_config(path)"), Some("Parse the config."));
        let input = text_input(&c);
        assert!(input.contains("parse_config"));
        assert!(input.contains("def parse_config(path)"));
        assert!(input.contains("Parse the config."));
    }

    #[test]
    fn test_text_input_bare_name() {
        let c = chunk("helper", None, None);
        assert_eq!(text_input(&c), "helper");
    }
}
