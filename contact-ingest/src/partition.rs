use std::hash::Hasher;

use contact_common::types::{DevicePair, MinuteAggregate};
use siphasher::sip::SipHasher13;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Routes minute aggregates to partition queues, so that every aggregate of a device pair is
/// merged by the same serial worker. Merging reads then replaces contact events, which is
/// only safe if no two aggregates of a pair are merged concurrently.
pub struct PartitionRouter {
    partitions: Vec<mpsc::Sender<MinuteAggregate>>,
}

impl PartitionRouter {
    /// Build a router over `partition_count` bounded queues, returning the receiving end
    /// of each queue, indexed by partition.
    pub fn new(
        partition_count: usize,
        capacity: usize,
    ) -> (Self, Vec<mpsc::Receiver<MinuteAggregate>>) {
        assert!(partition_count > 0, "partition_count must be > 0");

        let (partitions, receivers) = (0..partition_count)
            .map(|_| mpsc::channel(capacity))
            .unzip();

        (Self { partitions }, receivers)
    }

    pub fn partition_for(&self, devices: &DevicePair) -> usize {
        partition_for(devices, self.partitions.len())
    }

    /// Route everything read from `input` until it is closed. Dropping the router afterwards
    /// closes every partition queue.
    pub async fn run(self, mut input: mpsc::Receiver<MinuteAggregate>) {
        info!(
            "partition router started with {} partitions",
            self.partitions.len()
        );

        while let Some(aggregate) = input.recv().await {
            let partition = self.partition_for(&aggregate.devices());

            // A full partition blocks the router, throttling the proximity workers.
            if self.partitions[partition].send(aggregate).await.is_err() {
                error!("partition {} queue closed, dropping aggregate", partition);
            }
        }

        info!("partition router shutting down");
    }

    pub fn spawn(self, input: mpsc::Receiver<MinuteAggregate>) -> JoinHandle<()> {
        tokio::spawn(self.run(input))
    }
}

/// Stable partition of a device pair: a hash of both identifiers in canonical order.
pub fn partition_for(devices: &DevicePair, partition_count: usize) -> usize {
    let mut hasher = SipHasher13::new();
    hasher.write(devices.key().as_bytes());

    (hasher.finish() % partition_count as u64) as usize
}
