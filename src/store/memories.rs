//! Auxiliary memory storage
//!
//! Free-form notes LLM clients attach to a repository (decisions, caveats,
//! onboarding context). Memories carry an optional text-domain embedding so
//! they are retrievable by vector similarity alongside code search.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::embedder::Embedding;

use super::{Store, StoreError};

/// A stored memory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Memory {
    pub memory_id: Uuid,
    pub repository: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

fn memory_from_row(row: &sqlx::postgres::PgRow) -> Memory {
    Memory {
        memory_id: row.get("memory_id"),
        repository: row.get("repository"),
        title: row.get("title"),
        content: row.get("content"),
        tags: row.get("tags"),
        created_at: row.get("created_at"),
    }
}

impl Store {
    /// Store a memory, returning its id.
    pub async fn record_memory(
        &self,
        repository: &str,
        title: &str,
        content: &str,
        tags: &[String],
        embedding: Option<&Embedding>,
    ) -> Result<Uuid, StoreError> {
        let memory_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO memories (memory_id, repository, title, content, tags, embedding) \
             VALUES ($1, $2, $3, $4, $5, $6::vector)",
        )
        .bind(memory_id)
        .bind(repository)
        .bind(title)
        .bind(content)
        .bind(tags)
        .bind(embedding.map(Embedding::to_vector_literal))
        .execute(&self.pool)
        .await?;
        Ok(memory_id)
    }

    /// Fetch one memory.
    pub async fn memory(&self, memory_id: Uuid) -> Result<Option<Memory>, StoreError> {
        let row = sqlx::query(
            "SELECT memory_id, repository, title, content, tags, created_at \
             FROM memories WHERE memory_id = $1",
        )
        .bind(memory_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(memory_from_row))
    }

    /// Vector search over a repository's memories.
    pub async fn search_memories(
        &self,
        repository: &str,
        query: &Embedding,
        k: usize,
    ) -> Result<Vec<(Memory, f32)>, StoreError> {
        let rows = sqlx::query(
            "SELECT memory_id, repository, title, content, tags, created_at, \
             (1 - (embedding <=> $2::vector))::float8 AS score \
             FROM memories WHERE repository = $1 AND embedding IS NOT NULL \
             ORDER BY embedding <=> $2::vector LIMIT $3",
        )
        .bind(repository)
        .bind(query.to_vector_literal())
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (memory_from_row(row), row.get::<f64, _>("score") as f32))
            .collect())
    }

    /// Delete a memory. Returns whether a row was removed.
    pub async fn delete_memory(&self, memory_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM memories WHERE memory_id = $1")
            .bind(memory_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
