use tracing::trace;

// Counters are emitted as trace events; the Prometheus recorder installed in
// main only renders what the exporter itself tracks.

pub fn inc_requests(route: &'static str) {
    trace!(target = "oc.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "oc.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn rate_limited(call: &str) {
    trace!(target = "oc.metrics", call = call, "rate_limited_total_inc");
}

pub fn dispatch_outcome(outcome: &str) {
    trace!(target = "oc.metrics", outcome = outcome, "dispatch_total_inc");
}

pub fn notification_failed() {
    trace!(target = "oc.metrics", "notification_failures_total_inc");
}

pub fn duplicate_delivery() {
    trace!(target = "oc.metrics", "duplicate_deliveries_total_inc");
}
