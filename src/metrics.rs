use tracing::trace;

// Counter events at trace level; the Prometheus recorder only serves /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "buysmart.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn scrape_finished(outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "buysmart.metrics",
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "scrape_finished"
    );
}

pub fn pass_finished(dispatched: usize, elapsed_ms: u128) {
    trace!(
        target = "buysmart.metrics",
        dispatched = dispatched as u64,
        elapsed_ms = elapsed_ms as u64,
        "scheduler_pass"
    );
}
