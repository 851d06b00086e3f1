use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geo::Coord;

/// Length of a time bucket: 60 seconds in milliseconds.
pub const TIME_BUCKET_MILLIS: i64 = 60 * 1000;

/// Compute the time bucket of an epoch milliseconds timestamp as the rounded quotient by
/// `TIME_BUCKET_MILLIS`. Timestamps before the epoch saturate to bucket 0.
pub fn time_bucket(time_ms: i64) -> u32 {
    // `as` saturates for floats, which is what we want at both ends of the range.
    (time_ms as f64 / TIME_BUCKET_MILLIS as f64).round() as u32
}

/// A position event that passed admission but has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPositionEvent {
    pub device_id: String,
    pub time: i64,
    pub lonlat: Coord,
    pub accuracy: f64,
    pub floor: i16,
    pub user_consent: bool,
    pub venue: String,
    pub time_bucket: u32,
}

impl NewPositionEvent {
    /// Attach the identity assigned by the store on insert.
    pub fn into_stored(self, id: i64) -> PositionEvent {
        PositionEvent {
            id,
            device_id: self.device_id,
            time: self.time,
            lonlat: self.lonlat,
            accuracy: self.accuracy,
            floor: self.floor,
            user_consent: self.user_consent,
            venue: self.venue,
            time_bucket: self.time_bucket,
        }
    }
}

/// A spatial and temporal position of a device, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub id: i64,
    pub device_id: String,
    pub time: i64,
    pub lonlat: Coord,
    pub accuracy: f64,
    pub floor: i16,
    pub user_consent: bool,
    pub venue: String,
    pub time_bucket: u32,
}

impl PositionEvent {
    pub fn partial(&self) -> PartialPositionEvent {
        PartialPositionEvent {
            id: self.id,
            device_id: self.device_id.clone(),
            lonlat: self.lonlat,
            accuracy: self.accuracy,
        }
    }
}

/// A small view of a position event, embedded in minute aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialPositionEvent {
    pub id: i64,
    #[serde(rename = "device")]
    pub device_id: String,
    pub lonlat: Coord,
    pub accuracy: f64,
}

/// An unordered pair of device identifiers, kept sorted ascending so that `(a, b)` and `(b, a)`
/// are the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePair([String; 2]);

impl DevicePair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            DevicePair([a, b])
        } else {
            DevicePair([b, a])
        }
    }

    pub fn first(&self) -> &str {
        &self.0[0]
    }

    pub fn second(&self) -> &str {
        &self.0[1]
    }

    /// Both identifiers joined in canonical order, used as the routing key of the pair.
    pub fn key(&self) -> String {
        format!("{}:{}", self.0[0], self.0[1])
    }
}

impl fmt::Display for DevicePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0[0], self.0[1])
    }
}

/// One detected co-location of two devices within one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteAggregate {
    pub time_bucket: u32,
    /// Always ordered by device identifier ascending.
    pub events: [PartialPositionEvent; 2],
    pub distance: f64,
    pub floor: i16,
}

impl MinuteAggregate {
    pub fn new(
        time_bucket: u32,
        a: PartialPositionEvent,
        b: PartialPositionEvent,
        distance: f64,
        floor: i16,
    ) -> Self {
        let events = if a.device_id <= b.device_id {
            [a, b]
        } else {
            [b, a]
        };

        Self {
            time_bucket,
            events,
            distance,
            floor,
        }
    }

    pub fn devices(&self) -> DevicePair {
        DevicePair::new(
            self.events[0].device_id.clone(),
            self.events[1].device_id.clone(),
        )
    }
}

/// A contiguous interval of minute aggregates for one device pair.
/// `start` and `end` are inclusive time buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEvent {
    pub devices: DevicePair,
    pub start: u32,
    pub end: u32,
    pub duration: u32,
    pub minute_aggregates: Vec<i64>,
    pub first_contact: MinuteAggregate,
    pub min_distance: f64,
    pub max_distance: f64,
}

impl ContactEvent {
    /// A one bucket interval made of a single freshly stored aggregate.
    pub fn from_aggregate(aggregate_id: i64, aggregate: &MinuteAggregate) -> Self {
        Self {
            devices: aggregate.devices(),
            start: aggregate.time_bucket,
            end: aggregate.time_bucket,
            duration: 1,
            minute_aggregates: vec![aggregate_id],
            first_contact: aggregate.clone(),
            min_distance: aggregate.distance,
            max_distance: aggregate.distance,
        }
    }

    /// Absorb an interval that ends right before this one starts.
    /// The earlier interval's first contact wins.
    pub fn extend_backward(&mut self, before: ContactEvent) {
        self.start = before.start;
        let mut ids = before.minute_aggregates;
        ids.append(&mut self.minute_aggregates);
        self.minute_aggregates = ids;
        self.duration += before.duration;
        self.first_contact = before.first_contact;
        self.min_distance = self.min_distance.min(before.min_distance);
        self.max_distance = self.max_distance.max(before.max_distance);
    }

    /// Absorb an interval that starts right after this one ends.
    pub fn extend_forward(&mut self, after: ContactEvent) {
        self.end = after.end;
        self.minute_aggregates.extend(after.minute_aggregates);
        self.duration += after.duration;
        self.min_distance = self.min_distance.min(after.min_distance);
        self.max_distance = self.max_distance.max(after.max_distance);
    }
}
