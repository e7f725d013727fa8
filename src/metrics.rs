//! Request metrics emitted for instrumented calls.
//!
//! # Metrics
//! Every instrumented call touches four co-registered instruments sharing one
//! label schema:
//! - an in-flight gauge (`*_requests`), incremented at call entry and
//!   decremented exactly once at call exit regardless of outcome
//! - a completed-call counter (`*_requests_total`)
//! - a duration histogram (`*_request_duration_seconds`)
//! - a duration quantiles series (`*_request_duration_quantiles_seconds`)
//!
//! # Design Decisions
//! - Values are emitted through the `metrics` facade; the backing recorder is
//!   whatever the host process installed
//! - The facade has no summary kind, so the quantiles series is recorded as a
//!   second histogram; a Prometheus exporter renders it as a summary by
//!   matching the `_quantiles_` name when configuring aggregation
//! - Filtered or bypassed calls never touch any instrument

use metrics::{counter, gauge, histogram, Label};

/// The four instrument names used for one side of one protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestMetrics {
    in_flight: &'static str,
    total: &'static str,
    duration: &'static str,
    duration_quantiles: &'static str,
}

impl RequestMetrics {
    /// Instruments for outgoing gRPC calls.
    pub const fn grpc_client() -> Self {
        Self {
            in_flight: "grpc_client_requests",
            total: "grpc_client_requests_total",
            duration: "grpc_client_request_duration_seconds",
            duration_quantiles: "grpc_client_request_duration_quantiles_seconds",
        }
    }

    /// Instruments for incoming gRPC calls.
    pub const fn grpc_server() -> Self {
        Self {
            in_flight: "grpc_server_requests",
            total: "grpc_server_requests_total",
            duration: "grpc_server_request_duration_seconds",
            duration_quantiles: "grpc_server_request_duration_quantiles_seconds",
        }
    }

    /// Instruments for outgoing HTTP requests.
    pub const fn http_client() -> Self {
        Self {
            in_flight: "http_client_requests",
            total: "http_client_requests_total",
            duration: "http_client_request_duration_seconds",
            duration_quantiles: "http_client_request_duration_quantiles_seconds",
        }
    }

    /// Instruments for incoming HTTP requests.
    pub const fn http_server() -> Self {
        Self {
            in_flight: "http_server_requests",
            total: "http_server_requests_total",
            duration: "http_server_request_duration_seconds",
            duration_quantiles: "http_server_request_duration_quantiles_seconds",
        }
    }

    /// Increment the in-flight gauge.
    pub fn in_flight_inc(&self, labels: Vec<Label>) {
        gauge!(self.in_flight, labels).increment(1.0);
    }

    /// Decrement the in-flight gauge.
    pub fn in_flight_dec(&self, labels: Vec<Label>) {
        gauge!(self.in_flight, labels).decrement(1.0);
    }

    /// Record a completed call: bump the counter and observe the duration on
    /// both the histogram and the quantiles series.
    pub fn observe(&self, labels: Vec<Label>, seconds: f64) {
        counter!(self.total, labels.clone()).increment(1);
        histogram!(self.duration, labels.clone()).record(seconds);
        histogram!(self.duration_quantiles, labels).record(seconds);
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;

    #[test]
    fn test_observe_touches_all_terminal_instruments() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let m = RequestMetrics::grpc_client();
            let labels = vec![Label::new("package", "billing")];
            m.in_flight_inc(labels.clone());
            m.in_flight_dec(labels.clone());
            m.observe(labels, 0.25);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let mut names: Vec<String> = snapshot
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "grpc_client_request_duration_quantiles_seconds",
                "grpc_client_request_duration_seconds",
                "grpc_client_requests",
                "grpc_client_requests_total",
            ]
        );

        for (key, _, _, value) in snapshot {
            match value {
                DebugValue::Gauge(v) => assert_eq!(v.into_inner(), 0.0),
                DebugValue::Counter(v) => assert_eq!(v, 1),
                DebugValue::Histogram(v) => assert_eq!(v.len(), 1),
            }
            assert!(key
                .key()
                .labels()
                .any(|l| l.key() == "package" && l.value() == "billing"));
        }
    }
}
