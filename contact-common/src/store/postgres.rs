use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::debug;

use crate::geo::{self, Coord};
use crate::store::{
    ContactStore, ContactWrite, InsertOutcome, NearbyQuery, PurgeSummary, StoreError,
    StoreResult,
};
use crate::types::{
    ContactEvent, DevicePair, MinuteAggregate, NewPositionEvent, PartialPositionEvent,
    PositionEvent,
};

/// A ContactStore implemented on top of PostgreSQL tables. See `migrations/` for the schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Initialize a new PgStore with a pool of at most `max_connections` connections.
    /// The pool size bounds how many store operations the pipeline can have in flight.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new PgStore from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| match error {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::DecodeError(error.to_string())
        }
        error => StoreError::QueryError {
            command: command.to_owned(),
            error,
        },
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error.is_unique_violation(),
        _ => false,
    }
}

fn bucket_from_db(value: i64, column: &str) -> StoreResult<u32> {
    u32::try_from(value)
        .map_err(|_| StoreError::DecodeError(format!("{column} {value} is not a valid time bucket")))
}

#[derive(sqlx::FromRow)]
struct PositionEventRow {
    id: i64,
    device: String,
    time: i64,
    lon: f64,
    lat: f64,
    accuracy: f64,
    floor: i16,
    user_consent: bool,
    venue: String,
    time_bucket: i64,
}

impl TryFrom<PositionEventRow> for PositionEvent {
    type Error = StoreError;

    fn try_from(row: PositionEventRow) -> StoreResult<Self> {
        Ok(PositionEvent {
            id: row.id,
            device_id: row.device,
            time: row.time,
            lonlat: Coord::new(row.lon, row.lat),
            accuracy: row.accuracy,
            floor: row.floor,
            user_consent: row.user_consent,
            venue: row.venue,
            time_bucket: bucket_from_db(row.time_bucket, "time_bucket")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ContactEventRow {
    device_a: String,
    device_b: String,
    start_bucket: i64,
    end_bucket: i64,
    duration: i32,
    minute_aggregates: Vec<i64>,
    first_contact: Json<MinuteAggregate>,
    min_distance: f64,
    max_distance: f64,
}

impl TryFrom<ContactEventRow> for ContactEvent {
    type Error = StoreError;

    fn try_from(row: ContactEventRow) -> StoreResult<Self> {
        Ok(ContactEvent {
            devices: DevicePair::new(row.device_a, row.device_b),
            start: bucket_from_db(row.start_bucket, "start_bucket")?,
            end: bucket_from_db(row.end_bucket, "end_bucket")?,
            duration: u32::try_from(row.duration).map_err(|_| {
                StoreError::DecodeError(format!("duration {} is negative", row.duration))
            })?,
            minute_aggregates: row.minute_aggregates,
            first_contact: row.first_contact.0,
            min_distance: row.min_distance,
            max_distance: row.max_distance,
        })
    }
}

impl PgStore {
    async fn find_contact(
        &self,
        devices: &DevicePair,
        column: &str,
        bucket: u32,
    ) -> StoreResult<Option<ContactEvent>> {
        let base_query = format!(
            r#"
SELECT
    device_a, device_b, start_bucket, end_bucket, duration,
    minute_aggregates, first_contact, min_distance, max_distance
FROM
    contact_event
WHERE
    device_a = $1
    AND device_b = $2
    AND {column} = $3
LIMIT 1
            "#
        );

        let row: Option<ContactEventRow> = sqlx::query_as(&base_query)
            .bind(devices.first())
            .bind(devices.second())
            .bind(i64::from(bucket))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        row.map(ContactEvent::try_from).transpose()
    }
}

#[async_trait]
impl ContactStore for PgStore {
    async fn insert_position_event(&self, event: &NewPositionEvent) -> StoreResult<InsertOutcome> {
        let base_query = r#"
INSERT INTO position_event
    (device, time, lon, lat, accuracy, floor, user_consent, venue, time_bucket)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
RETURNING
    id
        "#;

        let result: Result<(i64,), sqlx::Error> = sqlx::query_as(base_query)
            .bind(&event.device_id)
            .bind(event.time)
            .bind(event.lonlat.longitude())
            .bind(event.lonlat.latitude())
            .bind(event.accuracy)
            .bind(event.floor)
            .bind(event.user_consent)
            .bind(&event.venue)
            .bind(i64::from(event.time_bucket))
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok((id,)) => Ok(InsertOutcome::Inserted(id)),
            Err(error) if is_unique_violation(&error) => Ok(InsertOutcome::Duplicate),
            Err(error) => Err(query_error("INSERT")(error)),
        }
    }

    async fn find_nearby_events(&self, query: &NearbyQuery) -> StoreResult<Vec<PositionEvent>> {
        // Containment in a spherical cap: the haversine central angle between the stored point
        // and the center must not exceed the angular radius.
        let base_query = r#"
SELECT
    id, device, time, lon, lat, accuracy, floor, user_consent, venue, time_bucket
FROM
    position_event
WHERE
    id <> $1
    AND floor = $2
    AND time_bucket = $3
    AND 2 * asin(least(1.0, sqrt(
        power(sin(radians(lat - $5) / 2), 2)
        + cos(radians($5)) * cos(radians(lat)) * power(sin(radians(lon - $4) / 2), 2)
    ))) <= $6
        "#;

        let rows: Vec<PositionEventRow> = sqlx::query_as(base_query)
            .bind(query.exclude_id)
            .bind(query.floor)
            .bind(i64::from(query.time_bucket))
            .bind(query.center.longitude())
            .bind(query.center.latitude())
            .bind(geo::angular_radius(query.radius_meters))
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        rows.into_iter().map(PositionEvent::try_from).collect()
    }

    async fn insert_minute_aggregate(
        &self,
        aggregate: &MinuteAggregate,
    ) -> StoreResult<InsertOutcome> {
        let base_query = r#"
INSERT INTO minute_aggregate
    (device_a, device_b, time_bucket, events, distance, floor)
VALUES
    ($1, $2, $3, $4, $5, $6)
RETURNING
    id
        "#;

        let devices = aggregate.devices();
        let events: Json<&[PartialPositionEvent; 2]> = Json(&aggregate.events);

        let result: Result<(i64,), sqlx::Error> = sqlx::query_as(base_query)
            .bind(devices.first())
            .bind(devices.second())
            .bind(i64::from(aggregate.time_bucket))
            .bind(events)
            .bind(aggregate.distance)
            .bind(aggregate.floor)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok((id,)) => Ok(InsertOutcome::Inserted(id)),
            Err(error) if is_unique_violation(&error) => Ok(InsertOutcome::Duplicate),
            Err(error) => Err(query_error("INSERT")(error)),
        }
    }

    async fn find_contact_ending_at(
        &self,
        devices: &DevicePair,
        end: u32,
    ) -> StoreResult<Option<ContactEvent>> {
        self.find_contact(devices, "end_bucket", end).await
    }

    async fn find_contact_starting_at(
        &self,
        devices: &DevicePair,
        start: u32,
    ) -> StoreResult<Option<ContactEvent>> {
        self.find_contact(devices, "start_bucket", start).await
    }

    async fn write_contacts(&self, writes: Vec<ContactWrite>) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("BEGIN"))?;

        for write in writes {
            match write {
                ContactWrite::Delete {
                    devices,
                    start,
                    end,
                } => {
                    let result = sqlx::query(
                        r#"
DELETE FROM contact_event
WHERE
    device_a = $1
    AND device_b = $2
    AND start_bucket = $3
    AND end_bucket = $4
                        "#,
                    )
                    .bind(devices.first())
                    .bind(devices.second())
                    .bind(i64::from(start))
                    .bind(i64::from(end))
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error("DELETE"))?;

                    if result.rows_affected() == 0 {
                        debug!("no contact event {} [{}, {}] to delete", devices, start, end);
                    }
                }
                ContactWrite::Insert(contact) => {
                    let duration = i32::try_from(contact.duration).map_err(|_| {
                        StoreError::WriteRejected(format!(
                            "duration {} does not fit the schema",
                            contact.duration
                        ))
                    })?;

                    sqlx::query(
                        r#"
INSERT INTO contact_event
    (device_a, device_b, start_bucket, end_bucket, duration,
     minute_aggregates, first_contact, min_distance, max_distance)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(contact.devices.first())
                    .bind(contact.devices.second())
                    .bind(i64::from(contact.start))
                    .bind(i64::from(contact.end))
                    .bind(duration)
                    .bind(&contact.minute_aggregates)
                    .bind(Json(&contact.first_contact))
                    .bind(contact.min_distance)
                    .bind(contact.max_distance)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error("INSERT"))?;
                }
            }
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;

        Ok(())
    }

    async fn purge_before(&self, bucket: u32) -> StoreResult<PurgeSummary> {
        let bucket = i64::from(bucket);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("BEGIN"))?;

        let position_events = sqlx::query("DELETE FROM position_event WHERE time_bucket < $1")
            .bind(bucket)
            .execute(&mut *tx)
            .await
            .map_err(query_error("DELETE"))?
            .rows_affected();

        let minute_aggregates = sqlx::query("DELETE FROM minute_aggregate WHERE time_bucket < $1")
            .bind(bucket)
            .execute(&mut *tx)
            .await
            .map_err(query_error("DELETE"))?
            .rows_affected();

        let contact_events = sqlx::query("DELETE FROM contact_event WHERE end_bucket < $1")
            .bind(bucket)
            .execute(&mut *tx)
            .await
            .map_err(query_error("DELETE"))?
            .rows_affected();

        tx.commit().await.map_err(query_error("COMMIT"))?;

        Ok(PurgeSummary {
            position_events,
            minute_aggregates,
            contact_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(device: &str, lonlat: Coord, time_bucket: u32) -> NewPositionEvent {
        NewPositionEvent {
            device_id: device.to_owned(),
            time: i64::from(time_bucket) * 60_000,
            lonlat,
            accuracy: 3.0,
            floor: 0,
            user_consent: true,
            venue: "hall-A".to_owned(),
            time_bucket,
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_insert_position_event_detects_duplicates(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let event = new_event("d1", Coord::new(4.9041, 52.3676), 100);

        let first = store.insert_position_event(&event).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = store.insert_position_event(&event).await.unwrap();
        assert_eq!(second, InsertOutcome::Duplicate);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_find_nearby_events_uses_angular_radius(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let center = Coord::new(4.9041, 52.3676);

        let InsertOutcome::Inserted(own_id) = store
            .insert_position_event(&new_event("own", center, 100))
            .await
            .unwrap()
        else {
            panic!("expected an insert")
        };
        store
            .insert_position_event(&new_event("near", Coord::new(4.9041, 52.36761), 100))
            .await
            .unwrap();
        store
            .insert_position_event(&new_event("far", Coord::new(4.9041, 52.3686), 100))
            .await
            .unwrap();

        let found = store
            .find_nearby_events(&NearbyQuery {
                center,
                radius_meters: 10.0,
                floor: 0,
                time_bucket: 100,
                exclude_id: own_id,
            })
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_id, "near");
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_write_contacts_replaces_intervals(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let partial = |id: i64, device: &str| PartialPositionEvent {
            id,
            device_id: device.to_owned(),
            lonlat: Coord::new(0.0, 0.0),
            accuracy: 1.0,
        };
        let first = MinuteAggregate::new(5, partial(1, "a"), partial(2, "b"), 1.0, 0);
        let second = MinuteAggregate::new(6, partial(3, "a"), partial(4, "b"), 2.0, 0);

        let InsertOutcome::Inserted(first_id) =
            store.insert_minute_aggregate(&first).await.unwrap()
        else {
            panic!("expected an insert")
        };
        assert_eq!(
            store.insert_minute_aggregate(&first).await.unwrap(),
            InsertOutcome::Duplicate
        );

        let before = ContactEvent::from_aggregate(first_id, &first);
        store
            .write_contacts(vec![ContactWrite::Insert(before.clone())])
            .await
            .unwrap();

        let mut merged = ContactEvent::from_aggregate(first_id + 1, &second);
        merged.extend_backward(before.clone());
        store
            .write_contacts(vec![
                ContactWrite::delete(&before),
                ContactWrite::Insert(merged.clone()),
            ])
            .await
            .unwrap();

        let devices = DevicePair::new("a", "b");
        assert_eq!(store.find_contact_ending_at(&devices, 5).await.unwrap(), None);
        assert_eq!(
            store.find_contact_ending_at(&devices, 6).await.unwrap(),
            Some(merged)
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_mixed_case_pairs_are_stored_in_canonical_order(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let partial = |id: i64, device: &str| PartialPositionEvent {
            id,
            device_id: device.to_owned(),
            lonlat: Coord::new(0.0, 0.0),
            accuracy: 1.0,
        };
        // "Bob" sorts before "alice" byte-wise, but after it in most linguistic collations.
        let aggregate = MinuteAggregate::new(5, partial(1, "alice"), partial(2, "Bob"), 1.0, 0);
        assert_eq!(aggregate.devices().first(), "Bob");

        let InsertOutcome::Inserted(id) = store.insert_minute_aggregate(&aggregate).await.unwrap()
        else {
            panic!("expected an insert")
        };
        let contact = ContactEvent::from_aggregate(id, &aggregate);
        store
            .write_contacts(vec![ContactWrite::Insert(contact.clone())])
            .await
            .unwrap();

        let devices = DevicePair::new("alice", "Bob");
        assert_eq!(
            store.find_contact_starting_at(&devices, 5).await.unwrap(),
            Some(contact)
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_purge_before_deletes_expired_rows(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let partial = |id: i64, device: &str| PartialPositionEvent {
            id,
            device_id: device.to_owned(),
            lonlat: Coord::new(0.0, 0.0),
            accuracy: 1.0,
        };

        for bucket in [99, 100] {
            store
                .insert_position_event(&new_event("d1", Coord::new(4.9041, 52.3676), bucket))
                .await
                .unwrap();
            let aggregate =
                MinuteAggregate::new(bucket, partial(1, "a"), partial(2, "b"), 1.0, 0);
            let InsertOutcome::Inserted(id) =
                store.insert_minute_aggregate(&aggregate).await.unwrap()
            else {
                panic!("expected an insert")
            };
            let mut contact = ContactEvent::from_aggregate(id, &aggregate);
            contact.devices = DevicePair::new(format!("c{bucket}"), "d");
            store
                .write_contacts(vec![ContactWrite::Insert(contact)])
                .await
                .unwrap();
        }

        let summary = store.purge_before(100).await.unwrap();

        assert_eq!(
            summary,
            PurgeSummary {
                position_events: 1,
                minute_aggregates: 1,
                contact_events: 1,
            }
        );
        let devices = DevicePair::new("c100", "d");
        assert!(store
            .find_contact_ending_at(&devices, 100)
            .await
            .unwrap()
            .is_some());
    }
}
