use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Session-layer metrics
    pub static ref SESSIONS_OPEN: IntGauge = IntGauge::with_opts(
        Opts::new("ccas_sessions_open", "Credit-control sessions currently in OPEN state")
    ).unwrap();

    pub static ref TRANSITIONS_TOTAL: Counter = Counter::with_opts(
        Opts::new("ccas_transitions_total", "Completed session state machine transitions")
    ).unwrap();

    pub static ref PROTOCOL_ERRORS_TOTAL: Counter = Counter::with_opts(
        Opts::new("ccas_protocol_errors_total", "Events rejected as illegal for the current state")
    ).unwrap();

    pub static ref TCC_EXPIRIES_TOTAL: Counter = Counter::with_opts(
        Opts::new("ccas_tcc_expiries_total", "Supervision timer (Tcc) expiries")
    ).unwrap();

    pub static ref ANSWERS_DISPATCHED_TOTAL: Counter = Counter::with_opts(
        Opts::new("ccas_answers_dispatched_total", "Outgoing messages handed to the transport")
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn register_metrics() {
    REGISTRY.register(Box::new(SESSIONS_OPEN.clone())).unwrap();
    REGISTRY.register(Box::new(TRANSITIONS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(PROTOCOL_ERRORS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(TCC_EXPIRIES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(ANSWERS_DISPATCHED_TOTAL.clone()))
        .unwrap();
}

/// Gather metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
