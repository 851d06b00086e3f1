use std::sync::Arc;

use contact_common::geo;
use contact_common::store::{ContactStore, NearbyQuery};
use contact_common::types::{MinuteAggregate, PositionEvent};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Fixed slack, in meters, added to the two accuracies when matching a pair of events.
pub const PROXIMITY_SLACK_METERS: f64 = 5.0;

/// The ingestion queue, shared by every proximity worker.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<PositionEvent>>>;

/// Turns stored position events into minute aggregates for every nearby device.
pub struct ProximityWorker {
    /// Index of this worker in the pool, for logging.
    index: usize,
    store: Arc<dyn ContactStore>,
    maximum_distance_between_devices: f64,
    accuracy_threshold: f64,
}

impl ProximityWorker {
    pub fn new(
        index: usize,
        store: Arc<dyn ContactStore>,
        maximum_distance_between_devices: f64,
        accuracy_threshold: f64,
    ) -> Self {
        Self {
            index,
            store,
            maximum_distance_between_devices,
            accuracy_threshold,
        }
    }

    /// Radius of the store query: wide enough to include any event that could match.
    fn search_radius(&self, event: &PositionEvent) -> f64 {
        event.accuracy + self.maximum_distance_between_devices + self.accuracy_threshold
    }

    /// Find the minute aggregates `event` takes part in. Store failures are logged and
    /// yield no aggregate.
    pub async fn process(&self, event: &PositionEvent) -> Vec<MinuteAggregate> {
        let query = NearbyQuery::around(event, self.search_radius(event));

        let candidates = match self.store.find_nearby_events(&query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                counter!("proximity_queries_failed_total").increment(1);
                error!(
                    worker = self.index,
                    event = event.id,
                    "failed to query nearby position events: {}",
                    e
                );
                return Vec::new();
            }
        };

        histogram!("proximity_candidates").record(candidates.len() as f64);

        find_matches(event, &candidates)
    }

    /// Drain `receiver` until it is closed, sending aggregates to `output`.
    pub async fn run(self, receiver: SharedReceiver, output: mpsc::Sender<MinuteAggregate>) {
        info!("proximity worker {} started", self.index);

        loop {
            // The lock is only held while waiting for the next event.
            let next = receiver.lock().await.recv().await;
            let Some(event) = next else {
                break;
            };

            for aggregate in self.process(&event).await {
                counter!("proximity_matches_total").increment(1);
                if output.send(aggregate).await.is_err() {
                    error!(
                        "proximity worker {} lost the aggregate queue, dropping event {}",
                        self.index, event.id
                    );
                    break;
                }
            }
        }

        info!("proximity worker {} shutting down", self.index);
    }
}

/// Pair `event` with every candidate close enough to be considered in contact.
///
/// Two events are in contact when they are distinct, belong to different devices, and are
/// closer than the sum of their accuracies plus `PROXIMITY_SLACK_METERS`.
pub fn find_matches(event: &PositionEvent, candidates: &[PositionEvent]) -> Vec<MinuteAggregate> {
    candidates
        .iter()
        .filter(|candidate| candidate.id != event.id && candidate.device_id != event.device_id)
        .filter_map(|candidate| {
            let distance = geo::distance(event.lonlat, candidate.lonlat);
            if distance < event.accuracy + candidate.accuracy + PROXIMITY_SLACK_METERS {
                Some(MinuteAggregate::new(
                    event.time_bucket,
                    event.partial(),
                    candidate.partial(),
                    distance,
                    event.floor,
                ))
            } else {
                None
            }
        })
        .collect()
}

/// Spawn `count` proximity workers sharing `receiver`.
pub fn spawn_proximity_workers(
    count: usize,
    store: Arc<dyn ContactStore>,
    receiver: mpsc::Receiver<PositionEvent>,
    output: mpsc::Sender<MinuteAggregate>,
    maximum_distance_between_devices: f64,
    accuracy_threshold: f64,
) -> Vec<JoinHandle<()>> {
    let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));

    (0..count)
        .map(|index| {
            let worker = ProximityWorker::new(
                index,
                store.clone(),
                maximum_distance_between_devices,
                accuracy_threshold,
            );
            tokio::spawn(worker.run(receiver.clone(), output.clone()))
        })
        .collect()
}
