use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static REPORTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STATUS_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static VIEW_CACHE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "transit_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create transit_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "transit_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create transit_gateway_http_request_duration_seconds"),
        )
    })
}

fn reports_total() -> &'static IntCounterVec {
    REPORTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "transit_gateway_reports_total",
                    "Issue report submissions by outcome.",
                ),
                &["outcome"],
            )
            .expect("create transit_gateway_reports_total"),
        )
    })
}

fn status_transitions_total() -> &'static IntCounterVec {
    STATUS_TRANSITIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "transit_gateway_status_transitions_total",
                    "Line status records opened, by trigger and status.",
                ),
                &["trigger", "status"],
            )
            .expect("create transit_gateway_status_transitions_total"),
        )
    })
}

fn view_cache_total() -> &'static IntCounterVec {
    VIEW_CACHE_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "transit_gateway_view_cache_total",
                    "View cache lookups by view and outcome.",
                ),
                &["view", "outcome"],
            )
            .expect("create transit_gateway_view_cache_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_report(outcome: &str) {
    reports_total().with_label_values(&[outcome]).inc();
}

pub fn observe_status_transition(trigger: &str, status: &str) {
    status_transitions_total()
        .with_label_values(&[trigger, status])
        .inc();
}

pub fn observe_view_cache(view: &str, outcome: &str) {
    view_cache_total().with_label_values(&[view, outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = reports_total();
    let _ = status_transitions_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
