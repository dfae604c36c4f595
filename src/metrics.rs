//! Request analytics and alerting
//!
//! Every API call records `(endpoint, status, latency_ms, trace_id)`. A
//! bounded in-memory rolling window answers the hot aggregation queries
//! (per-endpoint P50/P95/P99, slow-endpoint detection, error hotspots);
//! rows are additionally persisted to `api_metrics` best-effort without ever
//! blocking the recording caller. Alert rules evaluate window counters
//! against static thresholds and emit alerts with a severity level.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::Store;

/// One recorded request.
#[derive(Debug, Clone)]
struct Sample {
    endpoint: String,
    status: u16,
    latency_ms: f64,
    #[allow(dead_code)]
    recorded_at: DateTime<Utc>,
}

/// Rolling per-endpoint latency statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub request_count: usize,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
}

/// An endpoint exceeding the latency target.
#[derive(Debug, Clone, Serialize)]
pub struct SlowEndpoint {
    pub endpoint: String,
    pub request_count: usize,
    pub avg_latency_ms: f64,
    pub latency_above_target_ms: f64,
}

/// Error concentration per endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorHotspot {
    pub endpoint: String,
    pub status_codes: HashMap<u16, usize>,
    pub total_errors: usize,
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Which window counter an alert rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertMetric {
    /// Fraction of requests with status ≥ 500, over the whole window
    ErrorRate,
    /// Window-wide P95 latency in milliseconds
    P95LatencyMs,
}

/// A static-threshold alert rule.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: &'static str,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub severity: Severity,
}

/// A triggered alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

/// Default rule set applied when the caller has none of its own.
pub fn default_alert_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "error_rate_elevated",
            metric: AlertMetric::ErrorRate,
            threshold: 0.05,
            severity: Severity::Warning,
        },
        AlertRule {
            name: "error_rate_critical",
            metric: AlertMetric::ErrorRate,
            threshold: 0.25,
            severity: Severity::Critical,
        },
        AlertRule {
            name: "p95_latency_high",
            metric: AlertMetric::P95LatencyMs,
            threshold: 1000.0,
            severity: Severity::Warning,
        },
    ]
}

/// Bounded rolling window of request samples, with optional persistence.
pub struct MetricsRecorder {
    window: Mutex<VecDeque<Sample>>,
    capacity: usize,
    store: Option<Store>,
}

impl MetricsRecorder {
    /// In-memory recorder with the given window capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            store: None,
        }
    }

    /// Recorder that also appends rows to `api_metrics`.
    pub fn with_store(capacity: usize, store: Store) -> Self {
        let mut recorder = Self::new(capacity);
        recorder.store = Some(store);
        recorder
    }

    /// Record one request. Persistence is fire-and-forget; the caller's
    /// latency is never extended by the metrics path.
    pub fn record(&self, endpoint: &str, status: u16, latency_ms: f64, trace_id: &str) {
        {
            let mut window = self.lock();
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back(Sample {
                endpoint: endpoint.to_string(),
                status,
                latency_ms,
                recorded_at: Utc::now(),
            });
        }

        if let Some(store) = self.store.clone() {
            let endpoint = endpoint.to_string();
            let trace_id = trace_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = store
                    .record_api_metric(&endpoint, status, latency_ms, &trace_id)
                    .await
                {
                    tracing::debug!(error = %e, "Metric row persistence failed");
                }
            });
        }
    }

    /// Per-endpoint latency statistics over the window.
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        let window = self.lock();
        let mut by_endpoint: HashMap<&str, Vec<f64>> = HashMap::new();
        for sample in window.iter() {
            by_endpoint
                .entry(sample.endpoint.as_str())
                .or_default()
                .push(sample.latency_ms);
        }

        let mut stats: Vec<EndpointStats> = by_endpoint
            .into_iter()
            .map(|(endpoint, mut latencies)| {
                latencies.sort_by(f64::total_cmp);
                let count = latencies.len();
                let avg = latencies.iter().sum::<f64>() / count as f64;
                EndpointStats {
                    endpoint: endpoint.to_string(),
                    request_count: count,
                    avg_latency_ms: avg,
                    p50_latency_ms: percentile(&latencies, 50.0),
                    p95_latency_ms: percentile(&latencies, 95.0),
                    p99_latency_ms: percentile(&latencies, 99.0),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    /// Endpoints whose average latency exceeds the target.
    pub fn slow_endpoints(&self, threshold_ms: f64) -> Vec<SlowEndpoint> {
        let mut slow: Vec<SlowEndpoint> = self
            .endpoint_stats()
            .into_iter()
            .filter(|s| s.avg_latency_ms > threshold_ms)
            .map(|s| SlowEndpoint {
                endpoint: s.endpoint,
                request_count: s.request_count,
                avg_latency_ms: s.avg_latency_ms,
                latency_above_target_ms: s.avg_latency_ms - threshold_ms,
            })
            .collect();
        slow.sort_by(|a, b| b.latency_above_target_ms.total_cmp(&a.latency_above_target_ms));
        slow
    }

    /// Server errors (status ≥ 500) grouped by endpoint and status code.
    pub fn error_hotspots(&self) -> Vec<ErrorHotspot> {
        let window = self.lock();
        let mut by_endpoint: HashMap<&str, HashMap<u16, usize>> = HashMap::new();
        for sample in window.iter().filter(|s| s.status >= 500) {
            *by_endpoint
                .entry(sample.endpoint.as_str())
                .or_default()
                .entry(sample.status)
                .or_insert(0) += 1;
        }

        let mut hotspots: Vec<ErrorHotspot> = by_endpoint
            .into_iter()
            .map(|(endpoint, status_codes)| ErrorHotspot {
                endpoint: endpoint.to_string(),
                total_errors: status_codes.values().sum(),
                status_codes,
            })
            .collect();
        hotspots.sort_by(|a, b| b.total_errors.cmp(&a.total_errors));
        hotspots
    }

    /// Evaluate rules against the window, persisting triggered alerts when a
    /// store is attached.
    pub fn evaluate_alerts(&self, rules: &[AlertRule]) -> Vec<Alert> {
        let (error_rate, p95) = {
            let window = self.lock();
            if window.is_empty() {
                return Vec::new();
            }
            let errors = window.iter().filter(|s| s.status >= 500).count();
            let error_rate = errors as f64 / window.len() as f64;
            let mut latencies: Vec<f64> = window.iter().map(|s| s.latency_ms).collect();
            latencies.sort_by(f64::total_cmp);
            (error_rate, percentile(&latencies, 95.0))
        };

        let alerts: Vec<Alert> = rules
            .iter()
            .filter_map(|rule| {
                let value = match rule.metric {
                    AlertMetric::ErrorRate => error_rate,
                    AlertMetric::P95LatencyMs => p95,
                };
                (value > rule.threshold).then(|| Alert {
                    alert_type: rule.name.to_string(),
                    severity: rule.severity,
                    message: format!(
                        "{} at {:.3} exceeds threshold {:.3}",
                        rule.name, value, rule.threshold
                    ),
                    value,
                    threshold: rule.threshold,
                })
            })
            .collect();

        if let Some(store) = self.store.clone() {
            for alert in alerts.clone() {
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(e) = store
                        .record_alert(
                            &alert.alert_type,
                            alert.severity.as_str(),
                            &alert.message,
                            alert.value,
                            alert.threshold,
                        )
                        .await
                    {
                        tracing::debug!(error = %e, "Alert persistence failed");
                    }
                });
            }
        }

        alerts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Sample>> {
        self.window.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder_with(latencies: &[(u16, f64)]) -> MetricsRecorder {
        let recorder = MetricsRecorder::new(1024);
        for (i, (status, latency)) in latencies.iter().enumerate() {
            recorder.record("/search", *status, *latency, &format!("trace-{i}"));
        }
        recorder
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&sorted, 50.0), 50.0);
        assert_eq!(percentile(&sorted, 95.0), 95.0);
        assert_eq!(percentile(&sorted, 99.0), 99.0);
        assert_eq!(percentile(&[42.0], 99.0), 42.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_endpoint_stats() {
        let samples: Vec<(u16, f64)> = (1..=100).map(|i| (200, i as f64)).collect();
        let recorder = recorder_with(&samples);

        let stats = recorder.endpoint_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].endpoint, "/search");
        assert_eq!(stats[0].request_count, 100);
        assert_eq!(stats[0].p50_latency_ms, 50.0);
        assert_eq!(stats[0].p95_latency_ms, 95.0);
        assert_eq!(stats[0].p99_latency_ms, 99.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let recorder = MetricsRecorder::new(10);
        for i in 0..100 {
            recorder.record("/x", 200, i as f64, "t");
        }
        let stats = recorder.endpoint_stats();
        assert_eq!(stats[0].request_count, 10);
        // Only the newest samples remain
        assert!(stats[0].avg_latency_ms >= 90.0);
    }

    #[test]
    fn test_slow_endpoint_detection() {
        let recorder = MetricsRecorder::new(64);
        for _ in 0..10 {
            recorder.record("/fast", 200, 20.0, "t");
            recorder.record("/slow", 200, 400.0, "t");
        }

        let slow = recorder.slow_endpoints(100.0);
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].endpoint, "/slow");
        assert!((slow[0].latency_above_target_ms - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_hotspots_only_5xx() {
        let recorder = MetricsRecorder::new(64);
        recorder.record("/a", 200, 10.0, "t");
        recorder.record("/a", 404, 10.0, "t");
        recorder.record("/a", 500, 10.0, "t");
        recorder.record("/a", 503, 10.0, "t");
        recorder.record("/a", 503, 10.0, "t");

        let hotspots = recorder.error_hotspots();
        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].total_errors, 3);
        assert_eq!(hotspots[0].status_codes[&503], 2);
        assert!(!hotspots[0].status_codes.contains_key(&404));
    }

    #[test]
    fn test_alerts_fire_above_threshold() {
        // 3 errors out of 10 = 30% error rate
        let samples: Vec<(u16, f64)> = (0..10)
            .map(|i| (if i < 3 { 500 } else { 200 }, 10.0))
            .collect();
        let recorder = recorder_with(&samples);

        let alerts = recorder.evaluate_alerts(&default_alert_rules());
        let kinds: Vec<&str> = alerts.iter().map(|a| a.alert_type.as_str()).collect();
        assert!(kinds.contains(&"error_rate_elevated"));
        assert!(kinds.contains(&"error_rate_critical"));
        assert_eq!(
            alerts
                .iter()
                .find(|a| a.alert_type == "error_rate_critical")
                .unwrap()
                .severity,
            Severity::Critical
        );
    }

    #[test]
    fn test_no_alerts_on_empty_window() {
        let recorder = MetricsRecorder::new(8);
        assert!(recorder.evaluate_alerts(&default_alert_rules()).is_empty());
    }

    #[test]
    fn test_no_alerts_below_threshold() {
        let samples: Vec<(u16, f64)> = (0..100).map(|_| (200, 10.0)).collect();
        let recorder = recorder_with(&samples);
        assert!(recorder.evaluate_alerts(&default_alert_rules()).is_empty());
    }
}
