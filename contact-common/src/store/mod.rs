//! Persistence contract of the position event pipeline.
//!
//! Three collections are involved: position events, minute aggregates and contact events.
//! Correctness of the pipeline relies on two properties of any implementation:
//!   - uniqueness of position events per (device, time bucket) and of minute aggregates per
//!     (device pair, time bucket), reported as `InsertOutcome::Duplicate` instead of an error,
//!   - contact event writes applied as one ordered batch of deletes and inserts.
//!
//! Stored data is only kept for a retention period, see `ContactStore::purge_before`.
use async_trait::async_trait;
use thiserror::Error;

use crate::geo::Coord;
use crate::types::{ContactEvent, DevicePair, MinuteAggregate, NewPositionEvent, PositionEvent};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Enumeration of errors for operations with a ContactStore.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("failed to decode stored record: {0}")]
    DecodeError(String),
    #[error("batch write rejected: {0}")]
    WriteRejected(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record is new and was assigned this identity.
    Inserted(i64),
    /// A record with the same unique key already exists; nothing was written.
    Duplicate,
}

/// Rows deleted by a retention purge, per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub position_events: u64,
    pub minute_aggregates: u64,
    pub contact_events: u64,
}

/// Find stored position events around a point, within the same floor and time bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyQuery {
    pub center: Coord,
    pub radius_meters: f64,
    pub floor: i16,
    pub time_bucket: u32,
    pub exclude_id: i64,
}

impl NearbyQuery {
    /// The query a proximity worker issues for a freshly stored event.
    pub fn around(event: &PositionEvent, radius_meters: f64) -> Self {
        Self {
            center: event.lonlat,
            radius_meters,
            floor: event.floor,
            time_bucket: event.time_bucket,
            exclude_id: event.id,
        }
    }
}

/// One operation of a contact event batch write.
#[derive(Debug, Clone, PartialEq)]
pub enum ContactWrite {
    /// Delete the contact event of `devices` covering exactly `start..=end`.
    Delete {
        devices: DevicePair,
        start: u32,
        end: u32,
    },
    Insert(ContactEvent),
}

impl ContactWrite {
    pub fn delete(contact: &ContactEvent) -> Self {
        ContactWrite::Delete {
            devices: contact.devices.clone(),
            start: contact.start,
            end: contact.end,
        }
    }
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Insert a position event, unique per (device, time bucket).
    async fn insert_position_event(&self, event: &NewPositionEvent) -> StoreResult<InsertOutcome>;

    /// All position events matching `query`, excluding the one with `query.exclude_id`.
    async fn find_nearby_events(&self, query: &NearbyQuery) -> StoreResult<Vec<PositionEvent>>;

    /// Insert a minute aggregate, unique per (device pair, time bucket).
    async fn insert_minute_aggregate(
        &self,
        aggregate: &MinuteAggregate,
    ) -> StoreResult<InsertOutcome>;

    /// The contact event of `devices` whose last bucket is `end`, if any.
    async fn find_contact_ending_at(
        &self,
        devices: &DevicePair,
        end: u32,
    ) -> StoreResult<Option<ContactEvent>>;

    /// The contact event of `devices` whose first bucket is `start`, if any.
    async fn find_contact_starting_at(
        &self,
        devices: &DevicePair,
        start: u32,
    ) -> StoreResult<Option<ContactEvent>>;

    /// Apply `writes` in order, as one unit.
    async fn write_contacts(&self, writes: Vec<ContactWrite>) -> StoreResult<()>;

    /// Delete position events and minute aggregates older than `bucket`, and contact events
    /// that ended before it.
    async fn purge_before(&self, bucket: u32) -> StoreResult<PurgeSummary>;
}
