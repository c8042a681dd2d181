//! Prometheus metrics
//!
//! All collectors live on a dedicated registry so the exposition endpoint
//! never leaks process-default metrics from other libraries.

use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts,
    HistogramVec, Opts, Registry, TextEncoder,
};

use cinder_core::EngineError;

const NAMESPACE: &str = "sandbox";

/// Metrics for the sandbox system.
pub struct Metrics {
    pub registry: Registry,

    pub executions_total: CounterVec,
    pub execution_duration_seconds: HistogramVec,
    pub execution_errors_total: CounterVec,
    pub active_executions: Gauge,
    pub security_events_total: CounterVec,
    pub requests_in_flight: Gauge,
    pub rate_limited_total: Counter,
    pub code_size_bytes: Histogram,
    pub output_size_bytes: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, EngineError> {
        let registry = Registry::new();
        let internal = |e: prometheus::Error| EngineError::Internal(format!("metrics: {e}"));

        let executions_total = CounterVec::new(
            Opts::new(
                "executions_total",
                "Total sandbox executions by language and status.",
            )
            .namespace(NAMESPACE),
            &["language", "status"],
        )
        .map_err(internal)?;

        let execution_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "execution_duration_seconds",
                "Duration of sandbox executions in seconds.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["language"],
        )
        .map_err(internal)?;

        let execution_errors_total = CounterVec::new(
            Opts::new("execution_errors_total", "Execution errors by type.").namespace(NAMESPACE),
            &["type"],
        )
        .map_err(internal)?;

        let active_executions = Gauge::with_opts(
            Opts::new(
                "active_executions",
                "Number of currently running sandbox executions.",
            )
            .namespace(NAMESPACE),
        )
        .map_err(internal)?;

        let security_events_total = CounterVec::new(
            Opts::new(
                "security_events_total",
                "Security events detected during execution.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )
        .map_err(internal)?;

        let requests_in_flight = Gauge::with_opts(
            Opts::new(
                "requests_in_flight",
                "HTTP requests currently being processed.",
            )
            .namespace(NAMESPACE)
            .subsystem("api"),
        )
        .map_err(internal)?;

        let rate_limited_total = Counter::with_opts(
            Opts::new("rate_limited_total", "Requests rejected by the rate limiter.")
                .namespace(NAMESPACE)
                .subsystem("api"),
        )
        .map_err(internal)?;

        let code_size_bytes = Histogram::with_opts(
            HistogramOpts::new("code_size_bytes", "Size of submitted code in bytes.")
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(100.0, 4.0, 8).map_err(internal)?),
        )
        .map_err(internal)?;

        let output_size_bytes = Histogram::with_opts(
            HistogramOpts::new("output_size_bytes", "Size of execution output in bytes.")
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(10.0, 4.0, 8).map_err(internal)?),
        )
        .map_err(internal)?;

        for collector in [
            Box::new(executions_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(execution_duration_seconds.clone()),
            Box::new(execution_errors_total.clone()),
            Box::new(active_executions.clone()),
            Box::new(security_events_total.clone()),
            Box::new(requests_in_flight.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(code_size_bytes.clone()),
            Box::new(output_size_bytes.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            executions_total,
            execution_duration_seconds,
            execution_errors_total,
            active_executions,
            security_events_total,
            requests_in_flight,
            rate_limited_total,
            code_size_bytes,
            output_size_bytes,
        })
    }

    pub fn record_execution(&self, language: &str, status: &str, duration_secs: f64) {
        self.executions_total
            .with_label_values(&[language, status])
            .inc();
        self.execution_duration_seconds
            .with_label_values(&[language])
            .observe(duration_secs);
    }

    pub fn record_error(&self, error_type: &str) {
        self.execution_errors_total
            .with_label_values(&[error_type])
            .inc();
    }

    pub fn record_security_event(&self, event_type: &str) {
        self.security_events_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Text exposition of every registered collector.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        let m = Metrics::new().unwrap();
        m.record_execution("python", "success", 0.25);
        m.record_security_event("timeout");
        m.active_executions.inc();

        let text = m.render();
        assert!(text.contains("sandbox_executions_total"));
        assert!(text.contains("sandbox_execution_duration_seconds"));
        assert!(text.contains("sandbox_security_events_total"));
        assert!(text.contains("language=\"python\""));
    }

    #[test]
    fn test_gauge_balances() {
        let m = Metrics::new().unwrap();
        m.requests_in_flight.inc();
        m.requests_in_flight.inc();
        m.requests_in_flight.dec();
        assert_eq!(m.requests_in_flight.get() as i64, 1);
    }
}
