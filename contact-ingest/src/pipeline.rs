//! Wiring of the asynchronous stages behind the HTTP handler:
//!
//! ingestion queue -> proximity pool -> aggregate queue -> partition router -> merge workers
//!
//! Every queue is bounded, so a slow stage throttles the stages feeding it, up to the handler.
//! Shutdown cascades the same way: once every sender of the ingestion queue is dropped, each
//! stage drains its input then drops its outputs, closing the next stage's queue.
use std::sync::Arc;

use contact_common::store::ContactStore;
use contact_common::types::PositionEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::PipelineSettings;
use crate::merge::spawn_merge_workers;
use crate::partition::PartitionRouter;
use crate::proximity::spawn_proximity_workers;

/// The running stages of a pipeline.
pub struct PipelineHandle {
    proximity: Vec<JoinHandle<()>>,
    router: JoinHandle<()>,
    merge: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Wait for every stage to drain. Resolves once all senders of the ingestion queue have
    /// been dropped and every event in flight has been merged.
    pub async fn drain(self) {
        for handle in self.proximity {
            if let Err(e) = handle.await {
                error!("proximity worker failed: {}", e);
            }
        }
        info!("proximity workers drained");

        if let Err(e) = self.router.await {
            error!("partition router failed: {}", e);
        }

        for handle in self.merge {
            if let Err(e) = handle.await {
                error!("merge worker failed: {}", e);
            }
        }
        info!("merge workers drained");
    }
}

/// Start every stage, returning the sending end of the ingestion queue.
pub fn start(
    store: Arc<dyn ContactStore>,
    settings: PipelineSettings,
) -> (mpsc::Sender<PositionEvent>, PipelineHandle) {
    let (events, ingestion) = mpsc::channel(settings.proximity_workers);
    let (aggregates, routed) = mpsc::channel(settings.proximity_workers);

    let proximity = spawn_proximity_workers(
        settings.proximity_workers,
        store.clone(),
        ingestion,
        aggregates,
        settings.maximum_distance_between_devices,
        settings.accuracy_threshold,
    );

    let (router, partitions) =
        PartitionRouter::new(settings.merge_partitions, settings.partition_queue_capacity);
    let router = router.spawn(routed);

    let merge = spawn_merge_workers(store, partitions);

    info!(
        proximity_workers = settings.proximity_workers,
        merge_partitions = settings.merge_partitions,
        "pipeline started"
    );

    (
        events,
        PipelineHandle {
            proximity,
            router,
            merge,
        },
    )
}
