//! Process-wide self-telemetry. Every counter/gauge/histogram named
//! here is exposed on `/metrics` via [`gather`].

use lazy_static::lazy_static;
use prometheus::{CounterVec, Gauge, GaugeVec, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref RECEIVED_REQUESTS: prometheus::Counter = register_counter(
        "anodot_remote_write_received_requests",
        "The total number of received requests from the scrape server",
    );

    pub static ref HTTP_RESPONSES: CounterVec = register_counter_vec(
        "anodot_remote_write_http_responses_total",
        "Total number of receive-endpoint HTTP responses",
        &["response_code"],
    );

    pub static ref SAMPLES_RECEIVED: prometheus::Counter = register_counter(
        "anodot_remote_write_prometheus_samples_received_total",
        "Total number of samples received",
    );

    pub static ref CONCURRENT_WORKERS: GaugeVec = register_gauge_vec(
        "anodot_remote_write_concurrent_workers",
        "Number of concurrently in-flight submissions per backend",
        &["anodot_url"],
    );

    pub static ref BUFFERED_METRICS: GaugeVec = register_gauge_vec(
        "anodot_remote_write_buffered_metrics",
        "Number of metrics currently buffered per backend",
        &["anodot_url"],
    );

    pub static ref SERVER_RESPONSE_TIME: prometheus::HistogramVec = register_histogram_vec(
        "anodot_server_response_time_seconds",
        "Backend submission response time in seconds",
        &["anodot_url"],
    );

    pub static ref METRICS_SUBMISSION_ERRORS: CounterVec = register_counter_vec(
        "anodot_metrics_submission_errors",
        "Number of failed metric submissions per backend",
        &["anodot_url"],
    );

    pub static ref SERVER_HTTP_RESPONSES: CounterVec = register_counter_vec(
        "anodot_server_http_responses_total",
        "HTTP status codes returned by each backend",
        &["anodot_url", "response_code"],
    );

    pub static ref WORKERS_THROTTLE_TIME_MS: CounterVec = register_counter_vec(
        "anodot_workers_throttle_time_ms",
        "Cumulative milliseconds spent waiting on the EPS rate limiter",
        &["anodot_url"],
    );

    pub static ref MAX_NUMBER_LABELS_REACHED: prometheus::Counter = register_counter(
        "anodot_parser_max_number_labels_reached",
        "Number of times a sample had more labels than allowed",
    );

    pub static ref VALUE_NOT_ACCEPTED: prometheus::Counter = register_counter(
        "anodot_parser_value_not_accepted",
        "Number of times a sample's value was not accepted (NaN or infinite)",
    );

    pub static ref KUBERNETES_RELABELING_METRICS_DROPPED: prometheus::Counter = register_counter(
        "anodot_parser_kubernetes_relabling_metrics_dropped",
        "Number of samples dropped by the pod-name relabeling processor",
    );

    pub static ref POD_MAPPING_FETCH_ERRORS: prometheus::Counter = register_counter(
        "anodot_pod_mapping_fetch_errors",
        "Number of failed pod mapping fetches",
    );

    pub static ref CONCURRENCY_LIMIT_REACHED: CounterVec = register_counter_vec(
        "anodot_remote_write_concurrency_limit_reached_total",
        "Number of times a backend's concurrency limit forced a synchronous submission",
        &["anodot_url"],
    );

    pub static ref BUILD_INFO: Gauge = {
        let g = Gauge::with_opts(
            Opts::new(
                "anodot_remote_write_build_info",
                "Build information, value is always 1",
            )
            .const_label("version", env!("CARGO_PKG_VERSION")),
        )
        .unwrap();
        REGISTRY.register(Box::new(g.clone())).unwrap();
        g.set(1.0);
        g
    };
}

fn register_counter(name: &str, help: &str) -> prometheus::Counter {
    let c = prometheus::Counter::with_opts(Opts::new(name, help)).unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
}

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
}

fn register_gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
}

fn register_histogram_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::HistogramVec {
    let h = prometheus::HistogramVec::new(HistogramOpts::new(name, help), labels).unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
}

/// Renders the registry in the standard Prometheus text exposition
/// format, for the `/metrics` endpoint.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Forces registration of every metric above, even if nothing else in
/// the process has touched them yet (otherwise `lazy_static` would
/// leave unreferenced metrics out of the first `/metrics` scrape).
pub fn init() {
    lazy_static::initialize(&RECEIVED_REQUESTS);
    lazy_static::initialize(&HTTP_RESPONSES);
    lazy_static::initialize(&SAMPLES_RECEIVED);
    lazy_static::initialize(&CONCURRENT_WORKERS);
    lazy_static::initialize(&BUFFERED_METRICS);
    lazy_static::initialize(&SERVER_RESPONSE_TIME);
    lazy_static::initialize(&METRICS_SUBMISSION_ERRORS);
    lazy_static::initialize(&SERVER_HTTP_RESPONSES);
    lazy_static::initialize(&WORKERS_THROTTLE_TIME_MS);
    lazy_static::initialize(&MAX_NUMBER_LABELS_REACHED);
    lazy_static::initialize(&VALUE_NOT_ACCEPTED);
    lazy_static::initialize(&KUBERNETES_RELABELING_METRICS_DROPPED);
    lazy_static::initialize(&POD_MAPPING_FETCH_ERRORS);
    lazy_static::initialize(&CONCURRENCY_LIMIT_REACHED);
    lazy_static::initialize(&BUILD_INFO);
}
