use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::geo;
use crate::store::{
    ContactStore, ContactWrite, InsertOutcome, NearbyQuery, PurgeSummary, StoreError,
    StoreResult,
};
use crate::types::{ContactEvent, DevicePair, MinuteAggregate, NewPositionEvent, PositionEvent};

#[derive(Default)]
struct Collections {
    last_id: i64,
    position_events: Vec<PositionEvent>,
    minute_aggregates: Vec<(i64, MinuteAggregate)>,
    contact_events: Vec<ContactEvent>,
}

impl Collections {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// A ContactStore kept in process memory.
/// Enforces the same uniqueness constraints as the PostgreSQL schema, every operation runs
/// under a single lock so batches are applied atomically.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.collections
            .lock()
            .expect("poisoned MemoryStore mutex")
    }

    pub fn position_events(&self) -> Vec<PositionEvent> {
        self.lock().position_events.clone()
    }

    pub fn minute_aggregates(&self) -> Vec<(i64, MinuteAggregate)> {
        self.lock().minute_aggregates.clone()
    }

    /// Stored contact events, sorted by device pair then start bucket.
    pub fn contact_events(&self) -> Vec<ContactEvent> {
        let mut contacts = self.lock().contact_events.clone();
        contacts.sort_by(|a, b| (&a.devices, a.start).cmp(&(&b.devices, b.start)));
        contacts
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn insert_position_event(&self, event: &NewPositionEvent) -> StoreResult<InsertOutcome> {
        let mut collections = self.lock();

        let exists = collections.position_events.iter().any(|stored| {
            stored.device_id == event.device_id && stored.time_bucket == event.time_bucket
        });
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }

        let id = collections.next_id();
        collections
            .position_events
            .push(event.clone().into_stored(id));

        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_nearby_events(&self, query: &NearbyQuery) -> StoreResult<Vec<PositionEvent>> {
        let collections = self.lock();

        Ok(collections
            .position_events
            .iter()
            .filter(|event| {
                event.id != query.exclude_id
                    && event.floor == query.floor
                    && event.time_bucket == query.time_bucket
                    && geo::distance(query.center, event.lonlat) <= query.radius_meters
            })
            .cloned()
            .collect())
    }

    async fn insert_minute_aggregate(
        &self,
        aggregate: &MinuteAggregate,
    ) -> StoreResult<InsertOutcome> {
        let mut collections = self.lock();

        let devices = aggregate.devices();
        let exists = collections
            .minute_aggregates
            .iter()
            .any(|(_, stored)| {
                stored.time_bucket == aggregate.time_bucket && stored.devices() == devices
            });
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }

        let id = collections.next_id();
        collections.minute_aggregates.push((id, aggregate.clone()));

        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_contact_ending_at(
        &self,
        devices: &DevicePair,
        end: u32,
    ) -> StoreResult<Option<ContactEvent>> {
        Ok(self
            .lock()
            .contact_events
            .iter()
            .find(|contact| &contact.devices == devices && contact.end == end)
            .cloned())
    }

    async fn find_contact_starting_at(
        &self,
        devices: &DevicePair,
        start: u32,
    ) -> StoreResult<Option<ContactEvent>> {
        Ok(self
            .lock()
            .contact_events
            .iter()
            .find(|contact| &contact.devices == devices && contact.start == start)
            .cloned())
    }

    async fn write_contacts(&self, writes: Vec<ContactWrite>) -> StoreResult<()> {
        let mut collections = self.lock();
        let mut contacts = collections.contact_events.clone();

        for write in writes {
            match write {
                ContactWrite::Delete {
                    devices,
                    start,
                    end,
                } => {
                    match contacts.iter().position(|contact| {
                        contact.devices == devices && contact.start == start && contact.end == end
                    }) {
                        Some(position) => {
                            contacts.remove(position);
                        }
                        None => debug!(
                            "no contact event {} [{}, {}] to delete",
                            devices, start, end
                        ),
                    }
                }
                ContactWrite::Insert(contact) => {
                    let conflict = contacts.iter().any(|stored| {
                        stored.devices == contact.devices
                            && stored.start == contact.start
                            && stored.end == contact.end
                    });
                    if conflict {
                        warn!(
                            "rejecting contact batch, {} [{}, {}] already exists",
                            contact.devices, contact.start, contact.end
                        );
                        return Err(StoreError::WriteRejected(format!(
                            "contact event {} [{}, {}] already exists",
                            contact.devices, contact.start, contact.end
                        )));
                    }
                    contacts.push(contact);
                }
            }
        }

        collections.contact_events = contacts;
        Ok(())
    }

    async fn purge_before(&self, bucket: u32) -> StoreResult<PurgeSummary> {
        let mut collections = self.lock();

        let before = (
            collections.position_events.len(),
            collections.minute_aggregates.len(),
            collections.contact_events.len(),
        );

        collections
            .position_events
            .retain(|event| event.time_bucket >= bucket);
        collections
            .minute_aggregates
            .retain(|(_, aggregate)| aggregate.time_bucket >= bucket);
        collections
            .contact_events
            .retain(|contact| contact.end >= bucket);

        Ok(PurgeSummary {
            position_events: (before.0 - collections.position_events.len()) as u64,
            minute_aggregates: (before.1 - collections.minute_aggregates.len()) as u64,
            contact_events: (before.2 - collections.contact_events.len()) as u64,
        })
    }
}
