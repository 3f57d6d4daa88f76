//! Firestore `GeoPoint` value.

use crate::error::FirestoreError;
use serde::{Deserialize, Serialize};

use super::value::Value;

/// Geographic point (latitude/longitude).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees (range: -90 to 90).
    pub latitude: f64,

    /// Longitude in degrees (range: -180 to 180).
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new geographic point.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, FirestoreError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(FirestoreError::InvalidArgument(format!(
                "latitude must be in range [-90, 90], got {latitude}"
            )));
        }

        if !(-180.0..=180.0).contains(&longitude) {
            return Err(FirestoreError::InvalidArgument(format!(
                "longitude must be in range [-180, 180], got {longitude}"
            )));
        }

        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Wrap this point as a document field `Value`.
    pub fn to_value(&self) -> Value {
        Value::GeoPoint(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geopoint_creation_valid() {
        let gp = GeoPoint::new(37.7749, -122.4194).unwrap();
        assert_eq!(gp.latitude, 37.7749);
        assert_eq!(gp.longitude, -122.4194);
    }

    #[test]
    fn test_geopoint_origin() {
        assert!(GeoPoint::new(0.0, 0.0).is_ok());
    }

    #[test]
    fn test_geopoint_north_pole() {
        assert!(GeoPoint::new(90.0, 0.0).is_ok());
    }

    #[test]
    fn test_geopoint_south_pole() {
        assert!(GeoPoint::new(-90.0, 0.0).is_ok());
    }

    #[test]
    fn test_geopoint_dateline() {
        assert!(GeoPoint::new(0.0, 180.0).is_ok());
        assert!(GeoPoint::new(0.0, -180.0).is_ok());
    }

    #[test]
    fn test_geopoint_invalid_latitude_too_high() {
        assert!(GeoPoint::new(91.0, 0.0).is_err());
    }

    #[test]
    fn test_geopoint_invalid_latitude_too_low() {
        assert!(GeoPoint::new(-91.0, 0.0).is_err());
    }

    #[test]
    fn test_geopoint_invalid_longitude_too_high() {
        assert!(GeoPoint::new(0.0, 181.0).is_err());
    }

    #[test]
    fn test_geopoint_invalid_longitude_too_low() {
        assert!(GeoPoint::new(0.0, -181.0).is_err());
    }

    #[test]
    fn test_geopoint_to_value() {
        let gp = GeoPoint::new(37.7749, -122.4194).unwrap();
        match gp.to_value() {
            Value::GeoPoint(inner) => assert_eq!(inner, gp),
            _ => panic!("expected Value::GeoPoint"),
        }
    }
}
