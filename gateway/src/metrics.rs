use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use common_http_errors::register_http_error_metrics;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Per-process Prometheus registry for the gateway. Every component that
/// produces an observable signal (admission, rate limiting, the queue, the
/// dispatcher, upstream calls) records through this one struct, mirroring
/// how each service in this stack owns its own `Metrics` rather than
/// reaching for a shared generic registry.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,

    admission_outcomes: IntCounterVec,

    rate_checks: IntCounterVec,
    rate_rejections: IntCounterVec,

    queue_depth: IntGauge,
    queue_capacity: IntGauge,

    dispatcher_in_flight: IntGauge,
    dispatcher_capacity: IntGauge,

    upstream_latency: Histogram,
    upstream_errors: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let admission_outcomes = IntCounterVec::new(
            Opts::new("gateway_admission_outcomes_total", "Requests admitted at the front door, by outcome"),
            &["outcome"],
        )?;
        let rate_checks = IntCounterVec::new(
            Opts::new("gateway_rate_limit_checks_total", "Total rate limit checks"),
            &["identity"],
        )?;
        let rate_rejections = IntCounterVec::new(
            Opts::new("gateway_rate_limit_rejections_total", "Total rate limit rejections"),
            &["identity"],
        )?;
        registry.register(Box::new(admission_outcomes.clone()))?;
        registry.register(Box::new(rate_checks.clone()))?;
        registry.register(Box::new(rate_rejections.clone()))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "gateway_queue_depth",
            "Current number of jobs waiting in the admission queue",
        ))?;
        let queue_capacity = IntGauge::with_opts(Opts::new(
            "gateway_queue_capacity",
            "Configured capacity of the admission queue",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;

        let dispatcher_in_flight = IntGauge::with_opts(Opts::new(
            "gateway_dispatcher_in_flight",
            "Number of jobs currently holding a dispatcher semaphore permit",
        ))?;
        let dispatcher_capacity = IntGauge::with_opts(Opts::new(
            "gateway_dispatcher_capacity",
            "Configured dispatcher concurrency cap (vllm_max_concurrency)",
        ))?;
        registry.register(Box::new(dispatcher_in_flight.clone()))?;
        registry.register(Box::new(dispatcher_capacity.clone()))?;

        let upstream_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_upstream_call_duration_seconds",
            "Time spent waiting on the upstream inference server",
        ))?;
        let upstream_errors = IntCounterVec::new(
            Opts::new("gateway_upstream_errors_total", "Upstream call failures, by status code"),
            &["status"],
        )?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(upstream_errors.clone()))?;

        register_http_error_metrics(&registry)?;

        Ok(Self {
            registry,
            admission_outcomes,
            rate_checks,
            rate_rejections,
            queue_depth,
            queue_capacity,
            dispatcher_in_flight,
            dispatcher_capacity,
            upstream_latency,
            upstream_errors,
        })
    }

    pub fn record_admission(&self, outcome: &str) {
        self.admission_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn record_rate_check(&self, identity: &str, allowed: bool) {
        self.rate_checks.with_label_values(&[identity]).inc();
        if !allowed {
            self.rate_rejections.with_label_values(&[identity]).inc();
        }
    }

    pub fn set_queue_capacity(&self, capacity: usize) {
        self.queue_capacity.set(capacity as i64);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_dispatcher_capacity(&self, capacity: usize) {
        self.dispatcher_capacity.set(capacity as i64);
    }

    pub fn set_dispatcher_in_flight(&self, in_flight: i64) {
        self.dispatcher_in_flight.set(in_flight);
    }

    pub fn observe_upstream_latency(&self, secs: f64) {
        self.upstream_latency.observe(secs);
    }

    pub fn record_upstream_error(&self, status_code: u16) {
        self.upstream_errors.with_label_values(&[&status_code.to_string()]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))
            .body(Body::from(buffer))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_in_flight_gauge_reflects_last_set_value() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.set_dispatcher_in_flight(3);
        let families = metrics.registry.gather();
        let gauge = families
            .iter()
            .find(|f| f.get_name() == "gateway_dispatcher_in_flight")
            .expect("gauge registered");
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 3.0);
    }
}
