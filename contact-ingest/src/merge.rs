use std::sync::Arc;

use contact_common::store::{ContactStore, ContactWrite, InsertOutcome};
use contact_common::types::{ContactEvent, MinuteAggregate};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Compute the writes that fold a freshly stored aggregate into the contact events of its
/// device pair.
///
/// `before` is the contact ending right before the aggregate's bucket and `after` the one
/// starting right after it. Both are replaced by a single contact covering all of them.
pub fn merge_contact(
    aggregate_id: i64,
    aggregate: &MinuteAggregate,
    before: Option<ContactEvent>,
    after: Option<ContactEvent>,
) -> Vec<ContactWrite> {
    let mut writes = Vec::with_capacity(3);
    let mut contact = ContactEvent::from_aggregate(aggregate_id, aggregate);

    if let Some(before) = before {
        writes.push(ContactWrite::delete(&before));
        contact.extend_backward(before);
    }
    if let Some(after) = after {
        writes.push(ContactWrite::delete(&after));
        contact.extend_forward(after);
    }

    writes.push(ContactWrite::Insert(contact));
    writes
}

/// Merges the minute aggregates of one partition into contact events, one at a time.
pub struct AggregateWorker {
    partition: usize,
    store: Arc<dyn ContactStore>,
}

impl AggregateWorker {
    pub fn new(partition: usize, store: Arc<dyn ContactStore>) -> Self {
        Self { partition, store }
    }

    /// Store `aggregate` and merge it with its neighbours. Failures are logged and the
    /// aggregate is skipped.
    pub async fn process(&self, aggregate: &MinuteAggregate) {
        let devices = aggregate.devices();

        let aggregate_id = match self.store.insert_minute_aggregate(aggregate).await {
            Ok(InsertOutcome::Inserted(id)) => {
                counter!("minute_aggregates_inserted_total").increment(1);
                id
            }
            Ok(InsertOutcome::Duplicate) => {
                counter!("minute_aggregates_duplicate_total").increment(1);
                debug!(
                    "minute aggregate {} at {} already merged",
                    devices, aggregate.time_bucket
                );
                return;
            }
            Err(e) => {
                counter!("minute_aggregates_failed_total").increment(1);
                error!(
                    partition = self.partition,
                    "failed to insert minute aggregate {} at {}: {}",
                    devices,
                    aggregate.time_bucket,
                    e
                );
                return;
            }
        };

        let before = match aggregate.time_bucket.checked_sub(1) {
            Some(end) => self.store.find_contact_ending_at(&devices, end).await,
            None => Ok(None),
        };
        let after = match aggregate.time_bucket.checked_add(1) {
            Some(start) => self.store.find_contact_starting_at(&devices, start).await,
            None => Ok(None),
        };

        let (before, after) = match (before, after) {
            (Ok(before), Ok(after)) => (before, after),
            (Err(e), _) | (_, Err(e)) => {
                counter!("contact_events_failed_total").increment(1);
                error!(
                    partition = self.partition,
                    "failed to read contact events of {}: {}", devices, e
                );
                return;
            }
        };

        let writes = merge_contact(aggregate_id, aggregate, before, after);

        match self.store.write_contacts(writes).await {
            Ok(()) => counter!("contact_events_written_total").increment(1),
            Err(e) => {
                counter!("contact_events_failed_total").increment(1);
                error!(
                    partition = self.partition,
                    "failed to write contact events of {}: {}", devices, e
                );
            }
        }
    }

    /// Drain the partition queue until it is closed.
    pub async fn run(self, mut receiver: mpsc::Receiver<MinuteAggregate>) {
        info!("merge worker {} started", self.partition);

        while let Some(aggregate) = receiver.recv().await {
            self.process(&aggregate).await;
        }

        info!("merge worker {} shutting down", self.partition);
    }
}

/// Spawn one merge worker per partition queue.
pub fn spawn_merge_workers(
    store: Arc<dyn ContactStore>,
    receivers: Vec<mpsc::Receiver<MinuteAggregate>>,
) -> Vec<JoinHandle<()>> {
    info!("starting {} merge workers", receivers.len());

    receivers
        .into_iter()
        .enumerate()
        .map(|(partition, receiver)| {
            tokio::spawn(AggregateWorker::new(partition, store.clone()).run(receiver))
        })
        .collect()
}
