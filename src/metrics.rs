use ::metrics::{counter, histogram};
use tracing::trace;

// Recorded through the `metrics` facade so `/metrics` renders them once the
// Prometheus recorder is installed; the trace events stay for log-only runs.

pub fn inc_requests(route: &'static str) {
    counter!("artisan_requests_total", "route" => route).increment(1);
    trace!(
        target = "artisan.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!("artisan_stage_elapsed_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "artisan.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn fallback_used(stage: &'static str) {
    counter!("artisan_fallback_total", "stage" => stage).increment(1);
    trace!(
        target = "artisan.metrics",
        stage = stage,
        "fallback_total_inc"
    );
}

pub fn request_panicked() {
    counter!("artisan_panics_total").increment(1);
}
