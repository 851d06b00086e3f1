use std::sync::Arc;

use assert_json_diff::assert_json_eq;
use axum::body::Body;
use axum::http::{self, Request, StatusCode};
use axum::Router;
use contact_common::store::MemoryStore;
use contact_ingest::auth::{JwtVerifier, VenueClaims};
use contact_ingest::config::PipelineSettings;
use contact_ingest::pipeline::{self, PipelineHandle};
use contact_ingest::router::{router, State};
use http_body_util::BodyExt; // for `collect`
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

const SECRET: &str = "device-token-secret";

fn token(venue: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        &VenueClaims {
            venue: venue.to_owned(),
            exp: 4_000_000_000,
        },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn setup(store: &MemoryStore) -> (Router, PipelineHandle) {
    let settings = PipelineSettings {
        proximity_workers: 4,
        merge_partitions: 4,
        partition_queue_capacity: 2,
        maximum_distance_between_devices: 5.0,
        accuracy_threshold: 10.0,
    };
    let (events, handle) = pipeline::start(Arc::new(store.clone()), settings);

    let state = State {
        store: Arc::new(store.clone()),
        events,
        accuracy_threshold: settings.accuracy_threshold,
    };
    let app = router(state, Arc::new(JwtVerifier::new(SECRET)), false);

    (app, handle)
}

fn position(device: &str, time: i64, venue: &str) -> Value {
    json!({
        "device": device,
        "time": time,
        "lonlat": [4.9041, 52.3676],
        "acc": 2.0,
        "floor": 1,
        "userConsent": true,
        "venue": venue,
    })
}

fn post(token: Option<&str>, body: String) -> Request<Body> {
    let mut request = Request::builder()
        .method(http::Method::POST)
        .uri("/positions")
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
    }
    request.body(Body::from(body)).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn it_reports_one_status_per_event() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (app, _handle) = setup(&store);

    let body = json!([
        position("d1", 0, "hall-A"),
        position("d1", 1000, "hall-A"),
        position("d1", 61000, "hall-A"),
    ]);
    let response = app
        .oneshot(post(Some(&token("hall-A")), body.to_string()))
        .await?;

    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    assert_json_eq!(
        json_body(response).await,
        json!([
            {"status": 200},
            {"status": 409, "message": "There is already a position for this device at this time"},
            {"status": 200},
        ])
    );
    assert_eq!(store.position_events().len(), 2);

    Ok(())
}

#[tokio::test]
async fn it_rejects_events_of_other_venues() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (app, _handle) = setup(&store);

    let body = json!([position("d1", 0, "hall-B"), position("d2", 0, "hall-A")]);
    let response = app
        .oneshot(post(Some(&token("hall-A")), body.to_string()))
        .await?;

    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    let statuses: Vec<u64> = json_body(response)
        .await
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["status"].as_u64().unwrap())
        .collect();
    assert_eq!(statuses, vec![401, 200]);

    let stored = store.position_events();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].device_id, "d2");

    Ok(())
}

#[tokio::test]
async fn it_requires_a_valid_token() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (app, _handle) = setup(&store);
    let body = json!([position("d1", 0, "hall-A")]).to_string();

    let response = app.clone().oneshot(post(None, body.clone())).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(post(Some("not-a-token"), body)).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(store.position_events().is_empty());

    Ok(())
}

#[tokio::test]
async fn it_rejects_malformed_batches() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (app, _handle) = setup(&store);

    let response = app
        .clone()
        .oneshot(post(Some(&token("hall-A")), "{\"device\": \"d1\"}".to_owned()))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let missing_field = json!([{"device": "d1", "time": 0, "venue": "hall-A"}]);
    let response = app
        .oneshot(post(Some(&token("hall-A")), missing_field.to_string()))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(store.position_events().is_empty());

    Ok(())
}

#[tokio::test]
async fn it_merges_nearby_devices_into_a_contact_event() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (app, handle) = setup(&store);

    for device in ["d1", "d2"] {
        let body = json!([
            position(device, 60_000, "hall-A"),
            position(device, 120_000, "hall-A"),
            position(device, 180_000, "hall-A"),
        ]);
        let response = app
            .clone()
            .oneshot(post(Some(&token("hall-A")), body.to_string()))
            .await?;
        assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    }

    // Dropping the router closes the ingestion queue, letting the pipeline drain.
    drop(app);
    handle.drain().await;

    let contacts = store.contact_events();
    assert_eq!(contacts.len(), 1);
    let contact = &contacts[0];
    assert_eq!(contact.devices.first(), "d1");
    assert_eq!(contact.devices.second(), "d2");
    assert_eq!((contact.start, contact.end, contact.duration), (1, 3, 3));
    assert_eq!(contact.minute_aggregates.len(), 3);
    assert_eq!(contact.min_distance, 0.0);

    Ok(())
}
