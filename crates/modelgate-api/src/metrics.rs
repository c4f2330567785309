// Prometheus metrics
//
// One struct owns every series, registered on an injected registry at
// startup and shared through AppState. No global registry.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub request_latency: HistogramVec,

    pub upstream_latency: HistogramVec,
    pub upstream_latency_by_upstream: HistogramVec,
    pub stream_ttft: HistogramVec,
    pub upstream_selected: IntCounterVec,
    pub upstream_success: IntCounterVec,
    pub upstream_error: IntCounterVec,
    pub upstream_retries: IntCounterVec,
    pub breaker_open: IntCounterVec,
    pub upstream_health: IntGaugeVec,

    pub key_auth_allowed: IntCounterVec,
    pub key_auth_blocked: IntCounterVec,
    pub ratelimit_allowed: IntCounterVec,
    pub ratelimit_blocked: IntCounterVec,
    pub timeout_errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total requests"),
            &["route", "status"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("gateway_request_latency_seconds", "Request latency"),
            &["route"],
        )?;
        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("gateway_upstream_latency_seconds", "Upstream latency by path"),
            &["path"],
        )?;
        let upstream_latency_by_upstream = HistogramVec::new(
            HistogramOpts::new(
                "gateway_upstream_latency_by_upstream_seconds",
                "Upstream latency by path and base_url",
            ),
            &["path", "base_url"],
        )?;
        let stream_ttft = HistogramVec::new(
            HistogramOpts::new(
                "gateway_stream_ttft_seconds",
                "Time to first upstream chunk for streaming routes",
            ),
            &["path"],
        )?;
        let upstream_selected = IntCounterVec::new(
            Opts::new(
                "gateway_upstream_selected_total",
                "Upstream selections by path and base_url",
            ),
            &["path", "base_url"],
        )?;
        let upstream_success = IntCounterVec::new(
            Opts::new("gateway_upstream_success_total", "Successful upstream responses"),
            &["path"],
        )?;
        let upstream_error = IntCounterVec::new(
            Opts::new("gateway_upstream_error_total", "Errored upstream responses"),
            &["path"],
        )?;
        let upstream_retries = IntCounterVec::new(
            Opts::new("gateway_upstream_retries_total", "Retries attempted for upstream calls"),
            &["path"],
        )?;
        let breaker_open = IntCounterVec::new(
            Opts::new("gateway_breaker_open_total", "Circuit breaker opened events"),
            &["base_url"],
        )?;
        let upstream_health = IntGaugeVec::new(
            Opts::new("gateway_upstream_health", "Upstream health (1 healthy, 0 down)"),
            &["base_url"],
        )?;
        let key_auth_allowed = IntCounterVec::new(
            Opts::new("gateway_key_auth_allowed_total", "API key auth accepted"),
            &["reason"],
        )?;
        let key_auth_blocked = IntCounterVec::new(
            Opts::new("gateway_key_auth_blocked_total", "API key auth blocked"),
            &["reason"],
        )?;
        let ratelimit_allowed = IntCounterVec::new(
            Opts::new("gateway_ratelimit_allowed_total", "Requests allowed by rate limiter"),
            &["type"],
        )?;
        let ratelimit_blocked = IntCounterVec::new(
            Opts::new("gateway_ratelimit_blocked_total", "Requests blocked by rate limiter"),
            &["type"],
        )?;
        let timeout_errors = IntCounterVec::new(
            Opts::new(
                "gateway_timeout_errors_total",
                "Request timeout errors by model and type",
            ),
            &["model", "error_type", "path"],
        )?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_latency.clone()),
            Box::new(upstream_latency.clone()),
            Box::new(upstream_latency_by_upstream.clone()),
            Box::new(stream_ttft.clone()),
            Box::new(upstream_selected.clone()),
            Box::new(upstream_success.clone()),
            Box::new(upstream_error.clone()),
            Box::new(upstream_retries.clone()),
            Box::new(breaker_open.clone()),
            Box::new(upstream_health.clone()),
            Box::new(key_auth_allowed.clone()),
            Box::new(key_auth_blocked.clone()),
            Box::new(ratelimit_allowed.clone()),
            Box::new(ratelimit_blocked.clone()),
            Box::new(timeout_errors.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            requests_total,
            request_latency,
            upstream_latency,
            upstream_latency_by_upstream,
            stream_ttft,
            upstream_selected,
            upstream_success,
            upstream_error,
            upstream_retries,
            breaker_open,
            upstream_health,
            key_auth_allowed,
            key_auth_blocked,
            ratelimit_allowed,
            ratelimit_blocked,
            timeout_errors,
        })
    }

    /// Text exposition for /metrics
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %err, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_series_register_and_render() {
        let metrics = Metrics::new().unwrap();
        metrics
            .requests_total
            .with_label_values(&["/v1/chat/completions", "200"])
            .inc();
        metrics
            .upstream_health
            .with_label_values(&["http://e1:8000"])
            .set(1);
        metrics
            .stream_ttft
            .with_label_values(&["/v1/chat/completions"])
            .observe(0.25);

        let text = metrics.render();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("gateway_upstream_health"));
        assert!(text.contains("gateway_stream_ttft_seconds"));
    }

    #[test]
    fn duplicate_construction_is_independent() {
        // Each instance owns its registry, so tests and the server never fight
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.requests_total.with_label_values(&["/x", "200"]).inc();
        assert!(!b.render().contains("/x"));
    }
}
