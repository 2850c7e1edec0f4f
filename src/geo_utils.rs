//! # Geographic Utilities
//!
//! Distance estimation between location samples.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`distance_meters`] | Same, by value; the session tracker's distance estimator |
//! | [`offset_point`] | Move a point by north/east meters |
//!
//! ## Haversine Formula
//!
//! Spherical Earth with the mean radius used by `geo` (6,371,008.8 m). The
//! error against an ellipsoidal geodesic is around 0.5%, which is fine for a
//! gamified distance counter.

use geo::{Distance, Haversine, Point};

use crate::GpsPoint;

/// Meters per degree of latitude on the mean sphere.
pub const METERS_PER_DEGREE: f64 = 111_195.0;

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// Returns the distance in meters. Symmetric, zero for identical points and
/// never negative.
///
/// ```rust
/// use stridewars_core::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2).max(0.0)
}

/// Distance estimator used by the session tracker.
#[inline]
pub fn distance_meters(a: GpsPoint, b: GpsPoint) -> f64 {
    haversine_distance(&a, &b)
}

/// Move a point by the given north and east offsets in meters.
///
/// Uses a local equirectangular approximation; accurate for offsets of a
/// few kilometers away from the poles.
pub fn offset_point(origin: &GpsPoint, north_m: f64, east_m: f64) -> GpsPoint {
    let dlat = north_m / METERS_PER_DEGREE;
    let cos_lat = origin.latitude.to_radians().cos().max(1e-6);
    let dlng = east_m / (METERS_PER_DEGREE * cos_lat);
    GpsPoint::new(origin.latitude + dlat, origin.longitude + dlng)
}
