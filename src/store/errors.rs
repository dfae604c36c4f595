//! Append-only indexing error log
//!
//! Writers are the worker and the chunker paths; readers are monitoring
//! surfaces. Rows are never updated or deleted by the pipeline.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::errors::ErrorKind;

use super::{Store, StoreError};

/// A new failure to append.
#[derive(Debug, Clone)]
pub struct NewIndexingError {
    pub repository: String,
    pub file_path: String,
    pub error_type: ErrorKind,
    pub error_message: String,
    pub error_traceback: Option<String>,
    pub chunk_type: Option<String>,
    pub language: Option<String>,
}

/// A persisted failure row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexingErrorRecord {
    pub error_id: i64,
    pub repository: String,
    pub file_path: String,
    pub error_type: String,
    pub error_message: String,
    pub error_traceback: Option<String>,
    pub chunk_type: Option<String>,
    pub language: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl Store {
    /// Append one failure record.
    pub async fn record_indexing_error(
        &self,
        error: &NewIndexingError,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO indexing_errors \
             (repository, file_path, error_type, error_message, error_traceback, \
              chunk_type, language) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&error.repository)
        .bind(&error.file_path)
        .bind(error.error_type.as_str())
        .bind(&error.error_message)
        .bind(&error.error_traceback)
        .bind(&error.chunk_type)
        .bind(&error.language)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            repository = %error.repository,
            file = %error.file_path,
            error_type = %error.error_type,
            "Indexing error recorded"
        );
        Ok(())
    }

    /// Page through a repository's failures, newest first.
    pub async fn list_indexing_errors(
        &self,
        repository: &str,
        error_type: Option<ErrorKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<IndexingErrorRecord>, StoreError> {
        let kind_clause = if error_type.is_some() {
            " AND error_type = $4"
        } else {
            ""
        };
        let sql = format!(
            "SELECT error_id, repository, file_path, error_type, error_message, \
             error_traceback, chunk_type, language, occurred_at \
             FROM indexing_errors WHERE repository = $1{kind_clause} \
             ORDER BY occurred_at DESC LIMIT $2 OFFSET $3"
        );

        let mut query = sqlx::query(&sql).bind(repository).bind(limit).bind(offset);
        if let Some(kind) = error_type {
            query = query.bind(kind.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| IndexingErrorRecord {
                error_id: row.get("error_id"),
                repository: row.get("repository"),
                file_path: row.get("file_path"),
                error_type: row.get("error_type"),
                error_message: row.get("error_message"),
                error_traceback: row.get("error_traceback"),
                chunk_type: row.get("chunk_type"),
                language: row.get("language"),
                occurred_at: row.get("occurred_at"),
            })
            .collect())
    }

    /// Total failures for a repository (optionally one error type).
    pub async fn count_indexing_errors(
        &self,
        repository: &str,
        error_type: Option<ErrorKind>,
    ) -> Result<i64, StoreError> {
        let kind_clause = if error_type.is_some() {
            " AND error_type = $2"
        } else {
            ""
        };
        let sql = format!(
            "SELECT COUNT(*) AS n FROM indexing_errors WHERE repository = $1{kind_clause}"
        );
        let mut query = sqlx::query(&sql).bind(repository);
        if let Some(kind) = error_type {
            query = query.bind(kind.as_str());
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.get("n"))
    }
}
