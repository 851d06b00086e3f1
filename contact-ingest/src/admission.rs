use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use bytes::Bytes;
use contact_common::store::{ContactStore, InsertOutcome};
use contact_common::types::{NewPositionEvent, PositionEvent};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::api::{IngestError, PositionError, PositionResponse};
use crate::auth::VenueClaims;
use crate::event::RawPositionEvent;
use crate::router;

/// Admission verdict for the event found at `index` in the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub index: usize,
    pub verdict: Result<NewPositionEvent, PositionError>,
}

/// Select at most one event per device and time bucket out of a batch.
///
/// Events are walked in timestamp order (ties keep request order). An event is rejected if its
/// venue is not the caller's, if its accuracy is worse than `accuracy_threshold`, or if an
/// earlier event of the same device already claimed its time bucket. Only admitted events
/// claim a bucket. Verdicts are returned in processing order.
pub fn admit(venue: &str, events: Vec<RawPositionEvent>, accuracy_threshold: f64) -> Vec<Admitted> {
    let mut events: Vec<(usize, RawPositionEvent)> = events.into_iter().enumerate().collect();
    events.sort_by_key(|(_, event)| event.time);

    let mut current_buckets: HashMap<String, u32> = HashMap::new();

    events
        .into_iter()
        .map(|(index, event)| {
            let verdict = if event.venue != venue {
                Err(PositionError::Unauthorized {
                    venue: event.venue,
                    allowed: venue.to_owned(),
                })
            } else if event.accuracy > accuracy_threshold {
                Err(PositionError::AccuracyExceeded {
                    accuracy: event.accuracy,
                    threshold: accuracy_threshold,
                })
            } else {
                let bucket = event.time_bucket();
                match current_buckets.get(&event.device_id) {
                    Some(current) if *current == bucket => Err(PositionError::DuplicateBucket),
                    _ => {
                        current_buckets.insert(event.device_id.clone(), bucket);
                        Ok(event.into_new())
                    }
                }
            };

            Admitted { index, verdict }
        })
        .collect()
}

/// Persist an admitted event and hand it to the proximity workers.
/// Only events that are new to the store are queued.
pub async fn submit(
    store: &dyn ContactStore,
    queue: &mpsc::Sender<PositionEvent>,
    event: NewPositionEvent,
) -> Result<(), PositionError> {
    if !event.user_consent {
        return Err(PositionError::MissingConsent);
    }

    match store.insert_position_event(&event).await {
        Ok(InsertOutcome::Inserted(id)) => {
            // Blocks while the proximity workers are saturated.
            queue.send(event.into_stored(id)).await.map_err(|e| {
                tracing::error!(id = e.0.id, "ingestion queue closed, dropping position event");
                PositionError::ShuttingDown
            })
        }
        Ok(InsertOutcome::Duplicate) => Err(PositionError::AlreadyExists),
        Err(error) => {
            tracing::error!("error inserting position event: {}", error);
            Err(PositionError::Internal)
        }
    }
}

#[instrument(skip_all, fields(venue, batch_size))]
pub async fn post_positions(
    State(state): State<router::State>,
    Extension(claims): Extension<VenueClaims>,
    body: Bytes,
) -> Result<(StatusCode, Json<Vec<PositionResponse>>), IngestError> {
    let events = RawPositionEvent::from_bytes(&body).map_err(|e| {
        tracing::warn!("rejected invalid payload: {}", e);
        IngestError::from(e)
    })?;

    tracing::Span::current().record("venue", claims.venue.as_str());
    tracing::Span::current().record("batch_size", events.len());
    counter!("positions_received_total").increment(events.len() as u64);

    let mut responses = vec![PositionResponse::accepted(); events.len()];

    for Admitted { index, verdict } in admit(&claims.venue, events, state.accuracy_threshold) {
        let result = match verdict {
            Ok(event) => submit(state.store.as_ref(), &state.events, event).await,
            Err(error) => Err(error),
        };

        match &result {
            Ok(()) => counter!("positions_accepted_total").increment(1),
            Err(error) => {
                counter!("positions_rejected_total", "reason" => error.reason()).increment(1)
            }
        }

        responses[index] = result.into();
    }

    Ok((StatusCode::MULTI_STATUS, Json(responses)))
}
