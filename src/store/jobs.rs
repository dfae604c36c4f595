//! Batch job control records
//!
//! One row per indexing job. The producer creates the row and bumps
//! `submitted_batches` as entries are published; the consumer bumps the
//! completion counters. Lifecycle: queued → running on the first
//! acknowledgment → exactly one terminal transition once
//! `completed + failed == total`. Counter updates are guarded so a job can
//! never leave a terminal state or overcount its batches.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{Store, StoreError};

/// Batch job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: '{}'", other)),
        }
    }
}

/// A batch indexing job row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchJob {
    pub job_id: Uuid,
    pub repository: String,
    pub total_batches: i32,
    pub submitted_batches: i32,
    pub completed_batches: i32,
    pub failed_batches: i32,
    pub total_files: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<BatchJob, StoreError> {
    let status: String = row.get("status");
    Ok(BatchJob {
        job_id: row.get("job_id"),
        repository: row.get("repository"),
        total_batches: row.get("total_batches"),
        submitted_batches: row.get("submitted_batches"),
        completed_batches: row.get("completed_batches"),
        failed_batches: row.get("failed_batches"),
        total_files: row.get("total_files"),
        status: status.parse().map_err(StoreError::Invalid)?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

const JOB_COLUMNS: &str = "job_id, repository, total_batches, submitted_batches, \
     completed_batches, failed_batches, total_files, status, created_at, started_at, finished_at";

impl Store {
    /// Create a queued job row.
    pub async fn create_job(
        &self,
        job_id: Uuid,
        repository: &str,
        total_batches: i32,
        total_files: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO batch_jobs (job_id, repository, total_batches, total_files) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(job_id)
        .bind(repository)
        .bind(total_batches)
        .bind(total_files)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count one published batch entry.
    pub async fn record_batch_submitted(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE batch_jobs SET submitted_batches = submitted_batches + 1 WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count one successfully processed batch, transitioning queued → running
    /// and, on the last batch, to the terminal state.
    pub async fn record_batch_completed(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE batch_jobs SET \
              completed_batches = completed_batches + 1, \
              started_at = COALESCE(started_at, now()), \
              status = CASE \
                WHEN completed_batches + 1 + failed_batches >= total_batches THEN \
                  CASE WHEN failed_batches > 0 THEN 'failed' ELSE 'completed' END \
                ELSE 'running' END, \
              finished_at = CASE \
                WHEN completed_batches + 1 + failed_batches >= total_batches THEN now() \
                ELSE finished_at END \
             WHERE job_id = $1 AND status IN ('queued', 'running') \
               AND completed_batches + failed_batches < total_batches",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count one dead-lettered batch. A job with any failed batch terminates
    /// as failed.
    pub async fn record_batch_failed(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE batch_jobs SET \
              failed_batches = failed_batches + 1, \
              started_at = COALESCE(started_at, now()), \
              status = CASE \
                WHEN completed_batches + failed_batches + 1 >= total_batches THEN 'failed' \
                ELSE 'running' END, \
              finished_at = CASE \
                WHEN completed_batches + failed_batches + 1 >= total_batches THEN now() \
                ELSE finished_at END \
             WHERE job_id = $1 AND status IN ('queued', 'running') \
               AND completed_batches + failed_batches < total_batches",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition for a job that produced no batches at all.
    pub async fn complete_empty_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE batch_jobs SET status = 'completed', finished_at = now() \
             WHERE job_id = $1 AND total_batches = 0 AND status = 'queued'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel a job that has not reached a terminal state.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE batch_jobs SET status = 'cancelled', finished_at = now() \
             WHERE job_id = $1 AND status IN ('queued', 'running')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch a job row.
    pub async fn job(&self, job_id: Uuid) -> Result<Option<BatchJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
