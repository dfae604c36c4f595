//! Durable batch stream over Redis Streams
//!
//! The producer publishes one entry per batch; consumers share a consumer
//! group (`XREADGROUP`) so each entry is delivered to exactly one consumer,
//! with at-least-once semantics. Acked entries are trimmed from the stream.
//! Entries that exhaust their retries move to a parallel dead-letter stream
//! for operator inspection, carrying the final error classification.

use std::time::Duration;

use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::ErrorKind;

/// Main batch stream key.
pub const STREAM_KEY: &str = "mnemolite:indexing:batches";
/// Dead-letter stream key.
pub const DEAD_LETTER_KEY: &str = "mnemolite:indexing:dead_letter";
/// Consumer group shared by batch consumers.
pub const CONSUMER_GROUP: &str = "batch_indexers";

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream connection error: {0}")]
    Connection(String),
    #[error("stream entry malformed: {0}")]
    Malformed(String),
}

/// One batch of files queued for indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub job_id: String,
    pub batch_index: u32,
    pub repository: String,
    /// Repository-relative file paths, forward slashes
    pub files: Vec<String>,
    /// 1-indexed delivery attempt
    pub attempt: u32,
}

/// A dead-lettered batch with its final classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterPayload {
    #[serde(flatten)]
    pub batch: BatchPayload,
    pub error_type: ErrorKind,
    pub last_error: String,
}

/// An entry read from the stream, with its delivery id for acking.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: BatchPayload,
}

/// Client over the durable batch stream.
#[derive(Clone)]
pub struct StreamClient {
    conn: redis::aio::ConnectionManager,
    stream_key: String,
    dead_letter_key: String,
}

impl StreamClient {
    /// Connect to the stream backend.
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url).map_err(|e| StreamError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            stream_key: STREAM_KEY.to_string(),
            dead_letter_key: DEAD_LETTER_KEY.to_string(),
        })
    }

    /// Override stream keys (test isolation).
    pub fn with_keys(mut self, stream_key: &str, dead_letter_key: &str) -> Self {
        self.stream_key = stream_key.to_string();
        self.dead_letter_key = dead_letter_key.to_string();
        self
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream_key, group, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            // Group already exists: another consumer got there first
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(StreamError::Connection(e.to_string())),
        }
    }

    /// Publish one batch entry. Returns the stream entry id.
    pub async fn publish(&self, payload: &BatchPayload) -> Result<String, StreamError> {
        let json = serde_json::to_string(payload)
            .map_err(|e| StreamError::Malformed(e.to_string()))?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&self.stream_key, "*", &[("payload", json)])
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        tracing::debug!(
            job_id = %payload.job_id,
            batch_index = payload.batch_index,
            attempt = payload.attempt,
            entry_id = %id,
            "Published batch entry"
        );
        Ok(id)
    }

    /// Blocking group read of up to `count` entries.
    ///
    /// Returns an empty Vec when the block timeout elapses with nothing new.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[">"], &options)
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let Some(json) = id.get::<String>("payload") else {
                    return Err(StreamError::Malformed(format!(
                        "entry {} missing payload field",
                        id.id
                    )));
                };
                let payload: BatchPayload = serde_json::from_str(&json)
                    .map_err(|e| StreamError::Malformed(format!("entry {}: {}", id.id, e)))?;
                entries.push(StreamEntry { id: id.id, payload });
            }
        }
        Ok(entries)
    }

    /// Acknowledge and trim a delivered entry.
    pub async fn ack(&self, group: &str, entry_id: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream_key, group, &[entry_id])
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        let _: i64 = conn
            .xdel(&self.stream_key, &[entry_id])
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Move an exhausted batch to the dead-letter stream.
    pub async fn dead_letter(
        &self,
        batch: BatchPayload,
        error_type: ErrorKind,
        last_error: String,
    ) -> Result<(), StreamError> {
        let payload = DeadLetterPayload {
            batch,
            error_type,
            last_error,
        };
        let json = serde_json::to_string(&payload)
            .map_err(|e| StreamError::Malformed(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(&self.dead_letter_key, "*", &[("payload", json)])
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        tracing::warn!(
            job_id = %payload.batch.job_id,
            batch_index = payload.batch.batch_index,
            error_type = %error_type,
            "Batch dead-lettered"
        );
        Ok(())
    }

    /// Current stream depth (operator monitoring; the producer never reads it).
    pub async fn len(&self) -> Result<u64, StreamError> {
        let mut conn = self.conn.clone();
        conn.xlen(&self.stream_key)
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let payload = BatchPayload {
            job_id: "7b1e4c1a".to_string(),
            batch_index: 3,
            repository: "acme/shop".to_string(),
            files: vec!["src/a.ts".to_string(), "src/b.ts".to_string()],
            attempt: 2,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: BatchPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_dead_letter_payload_flattens_batch() {
        let payload = DeadLetterPayload {
            batch: BatchPayload {
                job_id: "j".to_string(),
                batch_index: 0,
                repository: "r".to_string(),
                files: vec![],
                attempt: 3,
            },
            error_type: ErrorKind::SubprocessTimeout,
            last_error: "timed out after 300s".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&payload).unwrap()).unwrap();
        // Same shape as the batch entry plus the error fields
        assert_eq!(value["job_id"], "j");
        assert_eq!(value["attempt"], 3);
        assert_eq!(value["error_type"], "subprocess_timeout");
        assert_eq!(value["last_error"], "timed out after 300s");
    }
}
