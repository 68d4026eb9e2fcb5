use gateway_core::{CircuitBreaker, CircuitState, EndpointKey};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Partner-facing outcomes
    pub static ref GATEWAY_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("partner_gateway_requests_total", "Partner requests by operation and response code"),
        &["operation", "response_code"]
    ).expect("metric can be created");

    pub static ref GATEWAY_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("partner_gateway_request_duration_seconds", "Partner request duration in seconds")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["operation"]
    ).expect("metric can be created");

    // Downstream
    pub static ref DOWNSTREAM_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("partner_gateway_downstream_calls_total", "Downstream calls by breaker and outcome"),
        &["breaker", "outcome"]
    ).expect("metric can be created");

    pub static ref DOWNSTREAM_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("partner_gateway_downstream_duration_seconds", "Downstream call duration including retries")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["breaker"]
    ).expect("metric can be created");

    /// 0 closed, 1 half-open, 2 open
    pub static ref BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("partner_gateway_breaker_state", "Circuit state per endpoint"),
        &["breaker", "endpoint"]
    ).expect("metric can be created");

    // Voucher queue
    pub static ref VOUCHER_JOBS: IntCounterVec = IntCounterVec::new(
        Opts::new("partner_gateway_voucher_jobs_total", "Voucher jobs by kind and outcome"),
        &["kind", "outcome"]
    ).expect("metric can be created");

    pub static ref TICKET_CONFLICTS: IntCounterVec = IntCounterVec::new(
        Opts::new("partner_gateway_ticket_conflicts_total", "Optimistic update conflicts on tickets"),
        &["operation"]
    ).expect("metric can be created");
}

/// Register all metrics with the service registry
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(GATEWAY_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(GATEWAY_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(DOWNSTREAM_CALLS.clone()))?;
    REGISTRY.register(Box::new(DOWNSTREAM_LATENCY.clone()))?;
    REGISTRY.register(Box::new(BREAKER_STATE.clone()))?;
    REGISTRY.register(Box::new(VOUCHER_JOBS.clone()))?;
    REGISTRY.register(Box::new(TICKET_CONFLICTS.clone()))?;
    Ok(())
}

pub fn record_breaker_state(breaker: &CircuitBreaker, endpoint: &EndpointKey) {
    let value = match breaker.state(endpoint) {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    };
    BREAKER_STATE
        .with_label_values(&[breaker.name(), endpoint.as_str()])
        .set(value);
}

pub fn record_response(operation: &str, response_code: &str) {
    GATEWAY_REQUESTS
        .with_label_values(&[operation, response_code])
        .inc();
}

/// Observes into the request duration histogram when dropped
pub fn request_timer(operation: &str) -> prometheus::HistogramTimer {
    GATEWAY_REQUEST_DURATION
        .with_label_values(&[operation])
        .start_timer()
}

/// Prometheus text exposition of the service registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        // Registration is global; a second registration from another test is fine to ignore
        let _ = register_metrics();
        record_response("inquiry", "211000");
        let text = render().unwrap();
        assert!(text.contains("partner_gateway_requests_total"));
    }
}
