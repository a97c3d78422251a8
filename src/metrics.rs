// Prometheus metrics definitions for the pet backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Live WebSocket pet sessions (each runs a decay and a sync timer).
    pub static ref LIVE_SESSIONS: IntGauge =
        IntGauge::new("tamagotchi_live_sessions", "Live pet sessions").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Care actions applied, by action name.
    pub static ref PET_ACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tamagotchi_pet_actions_total", "Care actions applied"),
        &["action"],
    )
    .unwrap();

    /// Worlds opened (including re-opens under a new code).
    pub static ref WORLD_OPENS_TOTAL: IntCounter =
        IntCounter::new("tamagotchi_world_opens_total", "Worlds opened").unwrap();

    /// Successful world visits.
    pub static ref WORLD_VISITS_TOTAL: IntCounter =
        IntCounter::new("tamagotchi_world_visits_total", "World visits").unwrap();

    /// Chat replies, by source (llm or fallback).
    pub static ref TALK_REPLIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tamagotchi_talk_replies_total", "Chat replies sent"),
        &["source"],
    )
    .unwrap();

    /// Stat snapshots written by live sessions.
    pub static ref SESSION_SYNCS_TOTAL: IntCounter =
        IntCounter::new("tamagotchi_session_syncs_total", "Session stat syncs").unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tamagotchi_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "tamagotchi_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(LIVE_SESSIONS.clone()),
        Box::new(PET_ACTIONS_TOTAL.clone()),
        Box::new(WORLD_OPENS_TOTAL.clone()),
        Box::new(WORLD_VISITS_TOTAL.clone()),
        Box::new(TALK_REPLIES_TOTAL.clone()),
        Box::new(SESSION_SYNCS_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        // Already registered (tests build several routers in one process)
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("Metric registration skipped: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// and world codes with `:code` to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();
    for i in 0..segments.len() {
        if segments[i].parse::<i64>().is_ok() {
            segments[i] = ":id";
        } else if i > 0 && segments[i - 1] == "world" && !segments[i].is_empty() {
            segments[i] = ":code";
        }
    }
    segments.join("/")
}
