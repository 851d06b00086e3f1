use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use contact_common::metrics::setup_metrics_routes;
use contact_common::store::ContactStore;
use contact_common::types::PositionEvent;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::admission;
use crate::auth::{require_venue_claims, ClaimsVerifier};

#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn ContactStore>,
    /// Sending end of the ingestion queue.
    pub events: mpsc::Sender<PositionEvent>,
    pub accuracy_threshold: f64,
}

async fn index() -> &'static str {
    "contact-ingest"
}

pub fn router(state: State, verifier: Arc<dyn ClaimsVerifier>, metrics: bool) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/positions",
            post(admission::post_positions).route_layer(axum::middleware::from_fn_with_state(
                verifier,
                require_venue_claims,
            )),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Installing a global recorder more than once per process fails, tests leave it off.
    if metrics {
        setup_metrics_routes(router)
    } else {
        router
    }
}
