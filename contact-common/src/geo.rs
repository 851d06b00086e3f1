use serde::{Deserialize, Serialize};

/// Radius of the earth used for every distance and angular radius computation.
pub const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

/// A (longitude, latitude) pair in degrees, in that order.
/// Serialized as a two element array to match the wire format of position events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord(pub [f64; 2]);

impl Coord {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Coord([longitude, latitude])
    }

    pub fn longitude(&self) -> f64 {
        self.0[0]
    }

    pub fn latitude(&self) -> f64 {
        self.0[1]
    }
}

fn haversin(theta: f64) -> f64 {
    (theta / 2.0).sin().powi(2)
}

/// Great-circle distance in meters between two coordinates, using the haversine formula.
/// The formula stays numerically stable at short range, which is where we compare
/// distances against device accuracies of a few meters.
pub fn distance(a: Coord, b: Coord) -> f64 {
    let la1 = a.latitude().to_radians();
    let lo1 = a.longitude().to_radians();
    let la2 = b.latitude().to_radians();
    let lo2 = b.longitude().to_radians();

    let h = haversin(la2 - la1) + la1.cos() * la2.cos() * haversin(lo2 - lo1);

    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Convert a radius in meters on the earth surface into radians.
pub fn angular_radius(meters: f64) -> f64 {
    meters / EARTH_RADIUS_METERS
}
