//! Chunk persistence and the two search legs
//!
//! Upserts replace by identity: the chunk id is derived from the identity
//! tuple, so re-indexing unchanged code rewrites the same rows. Bulk inserts
//! run in one transaction and either commit every chunk of the batch or none.

use sqlx::{Postgres, QueryBuilder, Row};

use crate::chunker::Chunk;
use crate::embedder::Embedding;
use crate::language::{ChunkKind, Language};

use super::{Store, StoreError};

/// Which dense column a vector search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorDomain {
    Text,
    Code,
}

impl VectorDomain {
    fn column(self) -> &'static str {
        match self {
            VectorDomain::Text => "embedding_text",
            VectorDomain::Code => "embedding_code",
        }
    }
}

/// Search filters shared by the lexical and vector legs.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkFilters {
    pub repository: Option<String>,
    pub language: Option<Language>,
    pub chunk_type: Option<ChunkKind>,
    pub path_prefix: Option<String>,
}

/// A persisted chunk row (without embeddings).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub repository: String,
    pub file_path: String,
    pub chunk_type: String,
    pub name: String,
    pub language: String,
    pub source_code: String,
    pub line_start: i32,
    pub line_end: i32,
    pub content_hash: String,
    pub signature: Option<String>,
    pub doc: Option<String>,
}

/// A chunk row with a leg-specific relevance score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    /// Lexical: trigram similarity in [0,1]. Vector: cosine similarity.
    pub score: f32,
}

const CHUNK_COLUMNS: &str = "chunk_id, repository, file_path, chunk_type, name, language, \
     source_code, line_start, line_end, content_hash, signature, doc";

fn chunk_from_row(row: &sqlx::postgres::PgRow) -> StoredChunk {
    StoredChunk {
        chunk_id: row.get("chunk_id"),
        repository: row.get("repository"),
        file_path: row.get("file_path"),
        chunk_type: row.get("chunk_type"),
        name: row.get("name"),
        language: row.get("language"),
        source_code: row.get("source_code"),
        line_start: row.get("line_start"),
        line_end: row.get("line_end"),
        content_hash: row.get("content_hash"),
        signature: row.get("signature"),
        doc: row.get("doc"),
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &ChunkFilters) {
    if let Some(repository) = &filters.repository {
        qb.push(" AND repository = ").push_bind(repository.clone());
    }
    if let Some(language) = filters.language {
        qb.push(" AND language = ").push_bind(language.as_str());
    }
    if let Some(chunk_type) = filters.chunk_type {
        qb.push(" AND chunk_type = ").push_bind(chunk_type.as_str());
    }
    if let Some(prefix) = &filters.path_prefix {
        // Escape LIKE metacharacters so the prefix matches literally
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        qb.push(" AND file_path LIKE ").push_bind(format!("{escaped}%"));
    }
}

impl Store {
    /// Replace the given files' chunks in a single transaction.
    ///
    /// Deletes every existing chunk of the listed files, then inserts the new
    /// chunks with their embeddings. Partial commit is forbidden: any failure
    /// rolls the whole batch back. Replace-by-identity makes re-delivery of
    /// the same batch idempotent.
    pub async fn replace_file_chunks(
        &self,
        repository: &str,
        files: &[String],
        chunks: &[Chunk],
        text_embeddings: &[Embedding],
        code_embeddings: &[Embedding],
    ) -> Result<u64, StoreError> {
        if chunks.len() != text_embeddings.len() || chunks.len() != code_embeddings.len() {
            return Err(StoreError::Invalid(format!(
                "chunk/embedding count mismatch: {} chunks, {} text, {} code",
                chunks.len(),
                text_embeddings.len(),
                code_embeddings.len()
            )));
        }
        let _span = tracing::info_span!(
            "replace_file_chunks",
            repository,
            files = files.len(),
            chunks = chunks.len()
        )
        .entered();

        let mut tx = self.pool.begin().await?;

        for file in files {
            sqlx::query("DELETE FROM code_chunks WHERE repository = $1 AND file_path = $2")
                .bind(repository)
                .bind(file)
                .execute(&mut *tx)
                .await?;
        }

        let mut written = 0u64;
        for ((chunk, text_emb), code_emb) in
            chunks.iter().zip(text_embeddings).zip(code_embeddings)
        {
            let metadata = serde_json::json!({
                "nameable": chunk.nameable,
                "metrics": chunk.metrics,
                "references": chunk.references,
            });
            sqlx::query(
                "INSERT INTO code_chunks \
                 (chunk_id, repository, file_path, chunk_type, name, nameable, language, \
                  source_code, line_start, line_end, byte_start, byte_end, content_hash, \
                  signature, doc, metadata, embedding_text, embedding_code) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                         $17::vector, $18::vector) \
                 ON CONFLICT (chunk_id) DO UPDATE SET \
                  source_code = EXCLUDED.source_code, \
                  line_end = EXCLUDED.line_end, \
                  byte_start = EXCLUDED.byte_start, \
                  byte_end = EXCLUDED.byte_end, \
                  content_hash = EXCLUDED.content_hash, \
                  signature = EXCLUDED.signature, \
                  doc = EXCLUDED.doc, \
                  metadata = EXCLUDED.metadata, \
                  embedding_text = EXCLUDED.embedding_text, \
                  embedding_code = EXCLUDED.embedding_code, \
                  indexed_at = now()",
            )
            .bind(chunk.chunk_id())
            .bind(&chunk.repository)
            .bind(&chunk.file_path)
            .bind(chunk.kind.as_str())
            .bind(&chunk.name)
            .bind(chunk.nameable)
            .bind(chunk.language.as_str())
            .bind(&chunk.source)
            .bind(chunk.line_start as i32)
            .bind(chunk.line_end as i32)
            .bind(chunk.byte_start as i64)
            .bind(chunk.byte_end as i64)
            .bind(&chunk.content_hash)
            .bind(&chunk.signature)
            .bind(&chunk.doc)
            .bind(metadata)
            .bind(text_emb.to_vector_literal())
            .bind(code_emb.to_vector_literal())
            .execute(&mut *tx)
            .await?;
            written += 1;
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Fetch a chunk by its identity-derived id.
    pub async fn chunk_by_id(&self, chunk_id: &str) -> Result<Option<StoredChunk>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM code_chunks WHERE chunk_id = $1"
        ))
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(chunk_from_row))
    }

    /// Page through a repository's chunks in path/line order.
    pub async fn chunks_by_repository(
        &self,
        repository: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM code_chunks WHERE repository = $1 \
             ORDER BY file_path, line_start LIMIT $2 OFFSET $3"
        ))
        .bind(repository)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Delete every chunk of a repository. Returns rows removed.
    pub async fn delete_repository_chunks(&self, repository: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM code_chunks WHERE repository = $1")
            .bind(repository)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete one chunk by identity id.
    pub async fn delete_chunk(&self, chunk_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM code_chunks WHERE chunk_id = $1")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lexical leg: trigram similarity over body and name, best-first.
    pub async fn lexical_top_k(
        &self,
        query: &str,
        filters: &ChunkFilters,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let _span = tracing::info_span!("lexical_top_k", k).entered();

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {CHUNK_COLUMNS}, \
             GREATEST(similarity(name, "
        ));
        qb.push_bind(query.to_string());
        qb.push("), similarity(source_code, ");
        qb.push_bind(query.to_string());
        qb.push("))::float8 AS score FROM code_chunks WHERE 1=1");
        push_filters(&mut qb, filters);
        qb.push(" AND (name % ");
        qb.push_bind(query.to_string());
        qb.push(" OR similarity(source_code, ");
        qb.push_bind(query.to_string());
        qb.push(") > 0.05) ORDER BY score DESC LIMIT ");
        qb.push_bind(k as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| ScoredChunk {
                chunk: chunk_from_row(row),
                score: row.get::<f64, _>("score") as f32,
            })
            .collect())
    }

    /// Vector leg: cosine similarity against the chosen domain column.
    pub async fn vector_top_k(
        &self,
        embedding: &Embedding,
        domain: VectorDomain,
        filters: &ChunkFilters,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let _span = tracing::info_span!("vector_top_k", k, domain = ?domain).entered();
        let column = domain.column();

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {CHUNK_COLUMNS}, (1 - ({column} <=> "
        ));
        qb.push_bind(embedding.to_vector_literal());
        qb.push(format!(
            "::vector))::float8 AS score FROM code_chunks WHERE {column} IS NOT NULL"
        ));
        push_filters(&mut qb, filters);
        qb.push(format!(" ORDER BY {column} <=> "));
        qb.push_bind(embedding.to_vector_literal());
        qb.push("::vector LIMIT ");
        qb.push_bind(k as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| ScoredChunk {
                chunk: chunk_from_row(row),
                score: row.get::<f64, _>("score") as f32,
            })
            .collect())
    }

    /// Load a repository's chunks in full for graph construction,
    /// reconstructing nameability, metrics and references from the metadata
    /// blob.
    pub async fn chunks_for_graph(&self, repository: &str) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(
            "SELECT repository, file_path, chunk_type, name, nameable, language, source_code, \
             line_start, line_end, byte_start, byte_end, content_hash, signature, doc, metadata \
             FROM code_chunks WHERE repository = $1 ORDER BY file_path, line_start",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let language: String = row.get("language");
                let chunk_type: String = row.get("chunk_type");
                let metadata: serde_json::Value = row.get("metadata");
                let metrics = metadata
                    .get("metrics")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let references = metadata
                    .get("references")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                Ok(Chunk {
                    repository: row.get("repository"),
                    file_path: row.get("file_path"),
                    language: language.parse().map_err(StoreError::Invalid)?,
                    kind: chunk_type.parse().map_err(StoreError::Invalid)?,
                    name: row.get("name"),
                    nameable: row.get("nameable"),
                    source: row.get("source_code"),
                    byte_start: row.get::<i64, _>("byte_start") as usize,
                    byte_end: row.get::<i64, _>("byte_end") as usize,
                    line_start: row.get::<i32, _>("line_start") as u32,
                    line_end: row.get::<i32, _>("line_end") as u32,
                    content_hash: row.get("content_hash"),
                    signature: row.get("signature"),
                    doc: row.get("doc"),
                    metrics,
                    references,
                })
            })
            .collect()
    }

    /// Chunk count for a repository (status surfaces).
    pub async fn chunk_count(&self, repository: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM code_chunks WHERE repository = $1")
            .bind(repository)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}
