use contact_common::geo::Coord;
use contact_common::types::{time_bucket, NewPositionEvent};
use serde::{Deserialize, Serialize};

/// A position event as submitted by a device. Every field is mandatory.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawPositionEvent {
    #[serde(rename = "device")]
    pub device_id: String,
    /// Epoch milliseconds.
    pub time: i64,
    pub lonlat: Coord,
    #[serde(rename = "acc")]
    pub accuracy: f64,
    pub floor: i16,
    #[serde(rename = "userConsent")]
    pub user_consent: bool,
    pub venue: String,
}

impl RawPositionEvent {
    /// Decode a request body holding an array of events.
    pub fn from_bytes(bytes: &[u8]) -> Result<Vec<RawPositionEvent>, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn time_bucket(&self) -> u32 {
        time_bucket(self.time)
    }

    pub fn into_new(self) -> NewPositionEvent {
        let time_bucket = self.time_bucket();
        NewPositionEvent {
            device_id: self.device_id,
            time: self.time,
            lonlat: self.lonlat,
            accuracy: self.accuracy,
            floor: self.floor,
            user_consent: self.user_consent,
            venue: self.venue,
            time_bucket,
        }
    }
}
