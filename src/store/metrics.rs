//! Persistence for API metrics and alerts
//!
//! The in-memory rolling aggregations live in [`crate::metrics`]; these rows
//! are the durable trail monitoring reads back.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{Store, StoreError};

/// A persisted alert row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertRow {
    pub alert_id: i64,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Append one request metric row.
    pub async fn record_api_metric(
        &self,
        endpoint: &str,
        status: u16,
        latency_ms: f64,
        trace_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_metrics (endpoint, status, latency_ms, trace_id) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(endpoint)
        .bind(status as i32)
        .bind(latency_ms)
        .bind(trace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a triggered alert.
    pub async fn record_alert(
        &self,
        alert_type: &str,
        severity: &str,
        message: &str,
        value: f64,
        threshold: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO alerts (alert_type, severity, message, value, threshold) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(alert_type)
        .bind(severity)
        .bind(message)
        .bind(value)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unacknowledged alerts, newest first.
    pub async fn unacknowledged_alerts(&self, limit: i64) -> Result<Vec<AlertRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT alert_id, alert_type, severity, message, value, threshold, \
             acknowledged, created_at \
             FROM alerts WHERE NOT acknowledged ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| AlertRow {
                alert_id: row.get("alert_id"),
                alert_type: row.get("alert_type"),
                severity: row.get("severity"),
                message: row.get("message"),
                value: row.get("value"),
                threshold: row.get("threshold"),
                acknowledged: row.get("acknowledged"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
