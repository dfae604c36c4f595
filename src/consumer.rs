//! Batch consumer: consumer-group loop with retry, dead-letter and halt
//!
//! Reads batch entries from the durable stream with consumer-group
//! semantics, runs each batch in a worker subprocess with a wall-clock
//! timeout, and acknowledges based on the three-tier error taxonomy:
//!
//! - success → ack, `completed_batches` incremented
//! - batch-tier failure → re-publish with exponential backoff until the
//!   attempt cap, then dead-letter + ack (`failed_batches` incremented only
//!   on dead-letter)
//! - system-tier failure → no ack, the loop stops and the process exits
//!   non-zero
//!
//! Multiple consumer instances share the group; delivery is at-least-once
//! and the worker's replace-by-identity writes make redelivery idempotent.
//! The stop signal is honored between entries, never mid-worker.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use uuid::Uuid;

use crate::errors::{classify, retry_delay, ErrorKind, ErrorTier, MAX_RETRY_ATTEMPTS};
use crate::store::{Store, StoreError};
use crate::stream::{BatchPayload, StreamClient, StreamEntry, CONSUMER_GROUP};

/// Exit code the consumer assigns to a killed, timed-out worker.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Block duration for each group read.
const READ_BLOCK: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConsumerError {
    /// System-tier failure; the consumer stopped without acking.
    #[error("consumer halted on {kind}: {message}")]
    Halted { kind: ErrorKind, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one worker subprocess.
#[derive(Debug, PartialEq)]
pub enum WorkerVerdict {
    Success,
    Failed(ErrorKind, String),
}

/// What the consumer does with a failed entry.
#[derive(Debug, PartialEq)]
pub enum FailureAction {
    /// Re-publish with the next attempt number after this delay
    Retry { next_attempt: u32, delay: Duration },
    /// Retries exhausted: dead-letter and ack
    DeadLetter,
    /// System-tier: stop without acking
    Halt,
}

/// Map a worker exit to the taxonomy.
///
/// Workers exit 0 even with per-file failures, so any non-zero exit is at
/// least batch-tier: file-tier classifications of the stderr text are
/// upgraded to `subprocess_crash`.
pub fn classify_worker_exit(code: Option<i32>, stderr: &str) -> WorkerVerdict {
    match code {
        Some(0) => WorkerVerdict::Success,
        Some(TIMEOUT_EXIT_CODE) => WorkerVerdict::Failed(
            ErrorKind::SubprocessTimeout,
            "worker exceeded batch timeout".to_string(),
        ),
        other => {
            let message = stderr_tail(stderr, 500);
            let kind = match other {
                None => ErrorKind::SubprocessCrash, // killed by signal
                Some(_) => match classify(&message) {
                    k if k.tier() == ErrorTier::File => ErrorKind::SubprocessCrash,
                    k => k,
                },
            };
            WorkerVerdict::Failed(kind, message)
        }
    }
}

/// Decide the failure path for a batch-or-worse error on a given attempt.
pub fn failure_action(kind: ErrorKind, attempt: u32) -> FailureAction {
    if kind.should_stop_consumer() {
        return FailureAction::Halt;
    }
    if attempt < MAX_RETRY_ATTEMPTS {
        FailureAction::Retry {
            next_attempt: attempt + 1,
            delay: retry_delay(attempt),
        }
    } else {
        FailureAction::DeadLetter
    }
}

fn stderr_tail(stderr: &str, max: usize) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "worker produced no diagnostics".to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(max)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    tail
}

/// Consumer instance sharing the batch group.
pub struct Consumer {
    stream: StreamClient,
    store: Store,
    consumer_id: String,
    worker_timeout: Duration,
    /// Root directory batch file paths are resolved against
    root: PathBuf,
}

impl Consumer {
    pub fn new(
        stream: StreamClient,
        store: Store,
        consumer_id: impl Into<String>,
        worker_timeout: Duration,
        root: PathBuf,
    ) -> Self {
        Self {
            stream,
            store,
            consumer_id: consumer_id.into(),
            worker_timeout,
            root,
        }
    }

    /// Run the consume loop until the stop signal flips or a system-tier
    /// error halts it.
    pub async fn run(
        &self,
        stop: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        self.stream
            .ensure_group(CONSUMER_GROUP)
            .await
            .map_err(|e| ConsumerError::Halted {
                kind: ErrorKind::StreamConnectionLost,
                message: e.to_string(),
            })?;

        tracing::info!(consumer_id = %self.consumer_id, "Consumer started");

        loop {
            if *stop.borrow() {
                tracing::info!(consumer_id = %self.consumer_id, "Stop signal honored");
                return Ok(());
            }

            let entries = match self
                .stream
                .read_group(CONSUMER_GROUP, &self.consumer_id, 1, READ_BLOCK)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    return Err(ConsumerError::Halted {
                        kind: ErrorKind::StreamConnectionLost,
                        message: e.to_string(),
                    });
                }
            };

            for entry in entries {
                self.process_entry(entry).await?;
            }
        }
    }

    async fn process_entry(&self, entry: StreamEntry) -> Result<(), ConsumerError> {
        let _span = tracing::info_span!(
            "process_entry",
            entry_id = %entry.id,
            job_id = %entry.payload.job_id,
            batch_index = entry.payload.batch_index,
            attempt = entry.payload.attempt
        )
        .entered();

        let (code, stderr) = self.spawn_worker(&entry.payload).await;
        match classify_worker_exit(code, &stderr) {
            WorkerVerdict::Success => {
                self.ack(&entry.id).await?;
                if let Some(job_id) = parse_job_id(&entry.payload.job_id) {
                    self.store.record_batch_completed(job_id).await?;
                }
                Ok(())
            }
            WorkerVerdict::Failed(kind, message) => {
                tracing::warn!(error_type = %kind, %message, "Batch failed");
                match failure_action(kind, entry.payload.attempt) {
                    FailureAction::Halt => Err(ConsumerError::Halted { kind, message }),
                    FailureAction::Retry {
                        next_attempt,
                        delay,
                    } => {
                        // The unacked entry blocks this consumer until the
                        // delayed re-publish lands
                        tokio::time::sleep(delay).await;
                        let mut payload = entry.payload.clone();
                        payload.attempt = next_attempt;
                        self.stream.publish(&payload).await.map_err(|e| {
                            ConsumerError::Halted {
                                kind: ErrorKind::StreamConnectionLost,
                                message: e.to_string(),
                            }
                        })?;
                        self.ack(&entry.id).await
                    }
                    FailureAction::DeadLetter => {
                        self.stream
                            .dead_letter(entry.payload.clone(), kind, message)
                            .await
                            .map_err(|e| ConsumerError::Halted {
                                kind: ErrorKind::StreamConnectionLost,
                                message: e.to_string(),
                            })?;
                        self.ack(&entry.id).await?;
                        if let Some(job_id) = parse_job_id(&entry.payload.job_id) {
                            self.store.record_batch_failed(job_id).await?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<(), ConsumerError> {
        self.stream
            .ack(CONSUMER_GROUP, entry_id)
            .await
            .map_err(|e| ConsumerError::Halted {
                kind: ErrorKind::StreamConnectionLost,
                message: e.to_string(),
            })
    }

    /// Run one batch in a worker subprocess, enforcing the wall-clock
    /// timeout. Returns the exit code (124 for a killed timeout) and the
    /// worker's stderr.
    async fn spawn_worker(&self, payload: &BatchPayload) -> (Option<i32>, String) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return (Some(1), format!("subprocess spawn failed: {e}")),
        };

        let mut child = match Command::new(exe)
            .arg("worker")
            .arg("--root")
            .arg(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return (Some(1), format!("subprocess spawn failed: {e}")),
        };

        // Hand the payload over on stdin, then close it
        if let Some(mut stdin) = child.stdin.take() {
            let json = match serde_json::to_vec(payload) {
                Ok(json) => json,
                Err(e) => return (Some(1), format!("subprocess payload encode failed: {e}")),
            };
            if let Err(e) = stdin.write_all(&json).await {
                return (Some(1), format!("subprocess stdin write failed: {e}"));
            }
        }

        // Drain stderr concurrently so the child never blocks on a full pipe
        let stderr_handle = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr_handle {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = tokio::time::sleep(self.worker_timeout) => None,
        };

        match status {
            Some(status) => {
                let stderr = stderr_task.await.unwrap_or_default();
                (status.code(), stderr)
            }
            None => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stderr_task.abort();
                (Some(TIMEOUT_EXIT_CODE), String::new())
            }
        }
    }
}

fn parse_job_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| {
            tracing::warn!(job_id = raw, error = %e, "Unparseable job id, skipping counters");
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_zero_is_success() {
        assert_eq!(classify_worker_exit(Some(0), ""), WorkerVerdict::Success);
    }

    #[test]
    fn test_exit_124_is_subprocess_timeout() {
        let verdict = classify_worker_exit(Some(124), "");
        assert!(matches!(
            verdict,
            WorkerVerdict::Failed(ErrorKind::SubprocessTimeout, _)
        ));
    }

    #[test]
    fn test_signal_death_is_subprocess_crash() {
        let verdict = classify_worker_exit(None, "");
        assert!(matches!(
            verdict,
            WorkerVerdict::Failed(ErrorKind::SubprocessCrash, _)
        ));
    }

    #[test]
    fn test_db_error_classified_from_stderr() {
        let verdict = classify_worker_exit(Some(1), "error: database connection refused");
        assert!(matches!(
            verdict,
            WorkerVerdict::Failed(ErrorKind::DbConnectionError, _)
        ));
    }

    #[test]
    fn test_file_tier_stderr_upgraded_to_crash() {
        // A worker that exits 1 with a parse message still failed as a batch
        let verdict = classify_worker_exit(Some(1), "syntax error in something");
        assert!(matches!(
            verdict,
            WorkerVerdict::Failed(ErrorKind::SubprocessCrash, _)
        ));
    }

    #[test]
    fn test_oom_stderr_halts() {
        let verdict = classify_worker_exit(Some(1), "out of memory");
        let WorkerVerdict::Failed(kind, _) = verdict else {
            panic!("expected failure");
        };
        assert_eq!(failure_action(kind, 1), FailureAction::Halt);
    }

    #[test]
    fn test_retry_then_dead_letter() {
        assert_eq!(
            failure_action(ErrorKind::SubprocessTimeout, 1),
            FailureAction::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            failure_action(ErrorKind::SubprocessTimeout, 2),
            FailureAction::Retry {
                next_attempt: 3,
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            failure_action(ErrorKind::SubprocessTimeout, 3),
            FailureAction::DeadLetter
        );
    }

    #[test]
    fn test_stderr_tail_truncates_from_the_end() {
        let long = format!("{}database connection refused", "x".repeat(1000));
        let tail = stderr_tail(&long, 500);
        assert_eq!(tail.chars().count(), 500);
        assert!(tail.ends_with("database connection refused"));
    }
}
