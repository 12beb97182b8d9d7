//! Request metrics for the client and the reference node
//!
//! Every event is published through the `metrics` facade, so any installed
//! recorder (the node installs a Prometheus one) sees it. The client also
//! keeps lock-free counters of its own plus a per-node tally of routed
//! requests, which makes the router's spread observable in-process.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ClientError;

static PROMETHEUS: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Install the process-wide Prometheus recorder, once
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    let mut installed = PROMETHEUS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = installed.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    *installed = Some(handle.clone());
    Ok(handle)
}

/// Publish one request served by a node
pub fn record_node_request(operation: &str, status: u16, duration: Duration) {
    metrics::counter!(
        "colstore_node_requests_total",
        1,
        "operation" => operation.to_string(),
        "status" => status.to_string()
    );
    metrics::histogram!(
        "colstore_node_request_duration_ms",
        duration.as_secs_f64() * 1000.0,
        "operation" => operation.to_string()
    );
}

/// Publish the outcome of a write or read that waited on peers
pub fn record_replication(kind: &str, acknowledged: usize, peers: usize) {
    metrics::counter!("colstore_node_replications_total", 1, "kind" => kind.to_string());
    if acknowledged < peers {
        metrics::counter!(
            "colstore_node_replication_misses_total",
            (peers - acknowledged) as u64,
            "kind" => kind.to_string()
        );
    }
}

/// Metrics collector shared by all clones of a client
#[derive(Debug, Default)]
pub struct ClientMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    validation_errors: AtomicU64,
    unreachable_errors: AtomicU64,
    rejected_errors: AtomicU64,
    decode_errors: AtomicU64,
    per_node: Mutex<HashMap<String, u64>>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub requests: u64,
    pub successes: u64,
    pub validation_errors: u64,
    pub unreachable_errors: u64,
    pub rejected_errors: u64,
    pub decode_errors: u64,
    pub per_node: HashMap<String, u64>,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request that was routed to `node`
    pub fn record_routed(&self, node: &str) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut per_node) = self.per_node.lock() {
            *per_node.entry(node.to_string()).or_insert(0) += 1;
        }
        metrics::counter!("colstore_client_requests_total", 1, "node" => node.to_string());
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("colstore_client_success_total", 1);
    }

    /// Count a failure; validation failures never reach `record_routed`
    pub fn record_failure(&self, error: &ClientError) {
        let counter = match error {
            ClientError::Validation(_) => &self.validation_errors,
            ClientError::Unreachable(_) => &self.unreachable_errors,
            ClientError::ServerRejected { .. } => &self.rejected_errors,
            ClientError::Decode(_) => &self.decode_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("colstore_client_errors_total", 1, "kind" => error.kind());
    }

    /// Record the wall time of one routed call
    pub fn record_latency(&self, operation: &str, duration: Duration) {
        metrics::histogram!(
            "colstore_client_request_duration_ms",
            duration.as_secs_f64() * 1000.0,
            "operation" => operation.to_string()
        );
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            unreachable_errors: self.unreachable_errors.load(Ordering::Relaxed),
            rejected_errors: self.rejected_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            per_node: self.per_node.lock().map(|m| m.clone()).unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requests={} ok={} validation={} unreachable={} rejected={} decode={}",
            self.requests,
            self.successes,
            self.validation_errors,
            self.unreachable_errors,
            self.rejected_errors,
            self.decode_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DecodeError, TransportError, ValidationError};

    #[test]
    fn test_counters() {
        let metrics = ClientMetrics::new();
        metrics.record_routed("a:1");
        metrics.record_routed("a:1");
        metrics.record_routed("b:2");
        metrics.record_success();
        metrics.record_failure(&ClientError::Decode(DecodeError::Empty));
        metrics.record_failure(&ClientError::Validation(ValidationError::NoCells));

        let summary = metrics.summary();
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.decode_errors, 1);
        assert_eq!(summary.validation_errors, 1);
        assert_eq!(summary.per_node["a:1"], 2);
        assert_eq!(summary.per_node["b:2"], 1);
        assert!(summary.to_string().starts_with("requests=3 ok=1"));
    }

    #[test]
    fn test_events_reach_prometheus_recorder() {
        let handle = install_prometheus_recorder().unwrap();
        // A second install hands back the same recorder.
        assert!(install_prometheus_recorder().is_ok());

        let metrics = ClientMetrics::new();
        metrics.record_routed("10.1.1.1:8000");
        metrics.record_failure(&ClientError::Unreachable(TransportError::Timeout {
            endpoint: "10.1.1.1:8000".to_string(),
        }));
        metrics.record_latency("READ", Duration::from_millis(12));
        record_node_request("INSERT", 200, Duration::from_millis(3));
        record_replication("write", 1, 3);

        let rendered = handle.render();
        assert!(rendered.contains("colstore_client_requests_total{node=\"10.1.1.1:8000\"}"));
        assert!(rendered.contains("colstore_client_errors_total{kind=\"unreachable\"}"));
        assert!(rendered.contains("colstore_client_request_duration_ms"));
        assert!(rendered.contains("colstore_node_requests_total"));
        assert!(rendered.contains("colstore_node_replication_misses_total{kind=\"write\"}"));
    }
}
