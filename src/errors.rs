//! Indexing error taxonomy and retry policy
//!
//! Every failure in the indexing pipeline is mapped onto a closed taxonomy
//! split into three tiers:
//!
//! - **File-level**: recorded in the error log, the batch continues.
//! - **Batch-level**: the whole batch is re-queued with exponential backoff,
//!   then dead-lettered after [`MAX_RETRY_ATTEMPTS`].
//! - **System-level**: the consumer stops and exits non-zero.
//!
//! Classification is pattern-based on the error message and total: anything
//! unmatched becomes [`ErrorKind::CriticalError`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum retry attempts for a batch-level error before dead-lettering.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Tier of an indexing error, driving propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTier {
    /// Logged per-file, batch proceeds
    File,
    /// Batch re-queued with backoff, then dead-lettered
    Batch,
    /// Consumer stops, operator intervention required
    System,
}

/// Closed taxonomy of indexing pipeline errors.
///
/// Serialized snake_case values are the stable `error_type` strings written
/// to the error log and dead-letter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // File-level (continue-on-error)
    FileNotFound,
    ParseError,
    ChunkingError,
    Timeout,
    EmbeddingError,

    // Batch-level (retry)
    SubprocessCrash,
    SubprocessTimeout,
    DbConnectionError,

    // System-level (halt)
    StreamConnectionLost,
    OutOfMemory,
    CriticalError,
}

impl ErrorKind {
    /// Tier of this error kind.
    pub fn tier(self) -> ErrorTier {
        match self {
            ErrorKind::FileNotFound
            | ErrorKind::ParseError
            | ErrorKind::ChunkingError
            | ErrorKind::Timeout
            | ErrorKind::EmbeddingError => ErrorTier::File,
            ErrorKind::SubprocessCrash
            | ErrorKind::SubprocessTimeout
            | ErrorKind::DbConnectionError => ErrorTier::Batch,
            ErrorKind::StreamConnectionLost
            | ErrorKind::OutOfMemory
            | ErrorKind::CriticalError => ErrorTier::System,
        }
    }

    /// Whether this error should trigger a batch retry.
    pub fn is_retryable(self) -> bool {
        self.tier() == ErrorTier::Batch
    }

    /// Whether this error must stop the consumer.
    pub fn should_stop_consumer(self) -> bool {
        self.tier() == ErrorTier::System
    }

    /// Stable wire name (the serde snake_case value).
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::ChunkingError => "chunking_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::EmbeddingError => "embedding_error",
            ErrorKind::SubprocessCrash => "subprocess_crash",
            ErrorKind::SubprocessTimeout => "subprocess_timeout",
            ErrorKind::DbConnectionError => "db_connection_error",
            ErrorKind::StreamConnectionLost => "stream_connection_lost",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::CriticalError => "critical_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_not_found" => Ok(ErrorKind::FileNotFound),
            "parse_error" => Ok(ErrorKind::ParseError),
            "chunking_error" => Ok(ErrorKind::ChunkingError),
            "timeout" => Ok(ErrorKind::Timeout),
            "embedding_error" => Ok(ErrorKind::EmbeddingError),
            "subprocess_crash" => Ok(ErrorKind::SubprocessCrash),
            "subprocess_timeout" => Ok(ErrorKind::SubprocessTimeout),
            "db_connection_error" => Ok(ErrorKind::DbConnectionError),
            "stream_connection_lost" => Ok(ErrorKind::StreamConnectionLost),
            "out_of_memory" => Ok(ErrorKind::OutOfMemory),
            "critical_error" => Ok(ErrorKind::CriticalError),
            other => Err(format!("unknown error kind: '{}'", other)),
        }
    }
}

/// Exponential backoff delay for a batch retry.
///
/// Formula: `min(5 * 2^(attempt-1), 60)` seconds, attempt is 1-indexed.
/// The sequence for attempts 1.. is 5, 10, 20, 40, 60, 60, ...
pub fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_secs((5u64 << exp).min(60))
}

/// Classify a raw error message into the taxonomy.
///
/// Total: unmatched messages map to [`ErrorKind::CriticalError`]. Patterns
/// are checked most-specific first so "subprocess timeout" does not land on
/// the generic file-level `timeout`.
pub fn classify(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();

    // System-level first: these must never be mistaken for retryable errors
    if msg.contains("stream connection") || msg.contains("redis connection") {
        return ErrorKind::StreamConnectionLost;
    }
    if msg.contains("out of memory") || msg.contains("oom") || msg.contains("cannot allocate") {
        return ErrorKind::OutOfMemory;
    }

    // Batch-level
    if msg.contains("subprocess") && msg.contains("timeout") {
        return ErrorKind::SubprocessTimeout;
    }
    if msg.contains("subprocess") || msg.contains("worker exited") || msg.contains("signal") {
        return ErrorKind::SubprocessCrash;
    }
    if msg.contains("database connection")
        || msg.contains("connection refused")
        || msg.contains("pool timed out")
        || (msg.contains("connection") && msg.contains("closed"))
    {
        return ErrorKind::DbConnectionError;
    }

    // File-level
    if msg.contains("no such file") || msg.contains("not found") {
        return ErrorKind::FileNotFound;
    }
    if msg.contains("embedding") {
        return ErrorKind::EmbeddingError;
    }
    if msg.contains("chunking") {
        return ErrorKind::ChunkingError;
    }
    if msg.contains("parse") || msg.contains("syntax") || msg.contains("invalid utf-8") {
        return ErrorKind::ParseError;
    }
    if msg.contains("timeout") || msg.contains("timed out") {
        return ErrorKind::Timeout;
    }

    ErrorKind::CriticalError
}
