//! Periodic deletion of data older than the retention period.
use std::sync::Arc;
use std::time::Duration;

use contact_common::store::{ContactStore, PurgeSummary, StoreResult};
use contact_common::types::TIME_BUCKET_MILLIS;
use metrics::counter;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Purger {
    store: Arc<dyn ContactStore>,
    retention: time::Duration,
}

impl Purger {
    pub fn new(store: Arc<dyn ContactStore>, retention_days: u32) -> Self {
        Self {
            store,
            retention: time::Duration::days(i64::from(retention_days)),
        }
    }

    /// Purge everything that fell out of the retention period as of `now`.
    pub async fn purge_at(&self, now: OffsetDateTime) -> StoreResult<PurgeSummary> {
        let bucket = cutoff_bucket(now, self.retention);
        let summary = self.store.purge_before(bucket).await?;

        counter!("retention_purged_total", "collection" => "position_event")
            .increment(summary.position_events);
        counter!("retention_purged_total", "collection" => "minute_aggregate")
            .increment(summary.minute_aggregates);
        counter!("retention_purged_total", "collection" => "contact_event")
            .increment(summary.contact_events);

        info!(
            bucket,
            position_events = summary.position_events,
            minute_aggregates = summary.minute_aggregates,
            contact_events = summary.contact_events,
            "purged expired data"
        );

        Ok(summary)
    }

    pub async fn cleanup(&self) {
        if let Err(e) = self.purge_at(OffsetDateTime::now_utc()).await {
            error!("failed to purge expired data: {}", e);
        }
    }

    /// Purge every `interval`, starting right away. Runs until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;
                self.cleanup().await;
            }
        })
    }
}

/// The first time bucket kept when data older than `retention` is purged at `now`.
pub fn cutoff_bucket(now: OffsetDateTime, retention: time::Duration) -> u32 {
    let Some(cutoff) = now.checked_sub(retention) else {
        return 0;
    };

    let cutoff_ms = cutoff.unix_timestamp_nanos() / 1_000_000;
    let bucket = cutoff_ms.div_euclid(i128::from(TIME_BUCKET_MILLIS)).max(0);

    u32::try_from(bucket).unwrap_or(u32::MAX)
}
