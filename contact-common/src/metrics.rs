use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Add the prometheus endpoint and the HTTP metrics middleware to a router.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();
    describe_pipeline_metrics();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Install the global prometheus recorder. Panics if called twice in one process.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

fn describe_pipeline_metrics() {
    describe_counter!(
        "positions_received_total",
        "Position events received over HTTP, before admission."
    );
    describe_counter!(
        "positions_accepted_total",
        "Position events stored and queued for proximity detection."
    );
    describe_counter!(
        "positions_rejected_total",
        "Position events rejected, labelled by reason."
    );
    describe_counter!(
        "proximity_queries_failed_total",
        "Nearby event lookups that failed, skipping the triggering event."
    );
    describe_counter!(
        "proximity_matches_total",
        "Minute aggregates produced by the proximity workers."
    );
    describe_histogram!(
        "proximity_candidates",
        "Position events returned by a nearby event lookup."
    );
    describe_counter!(
        "minute_aggregates_inserted_total",
        "Minute aggregates stored for the first time."
    );
    describe_counter!(
        "minute_aggregates_duplicate_total",
        "Minute aggregates already stored for their pair and time bucket."
    );
    describe_counter!(
        "minute_aggregates_failed_total",
        "Minute aggregates that could not be stored."
    );
    describe_counter!(
        "contact_events_written_total",
        "Successful contact event merges."
    );
    describe_counter!(
        "contact_events_failed_total",
        "Contact event merges abandoned after a store failure."
    );
    describe_counter!(
        "retention_purged_total",
        "Stored records deleted once out of the retention period, labelled by collection."
    );
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
