//! Firestore `Timestamp` value.

use crate::error::FirestoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::Value;

/// A point in time: seconds since the Unix epoch plus a sub-second
/// nanosecond offset, matching the server's timestamp resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch.
    pub seconds: i64,

    /// Nanoseconds component (0-999,999,999).
    pub nanoseconds: i32,
}

impl Timestamp {
    /// Create a new timestamp, rejecting a `nanoseconds` value outside
    /// `[0, 999_999_999]`.
    pub fn new(seconds: i64, nanoseconds: i32) -> Result<Self, FirestoreError> {
        if nanoseconds < 0 || nanoseconds >= 1_000_000_000 {
            return Err(FirestoreError::InvalidArgument(format!(
                "nanoseconds must be in range [0, 999999999], got {nanoseconds}"
            )));
        }

        Ok(Self {
            seconds,
            nanoseconds,
        })
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert from a `chrono::DateTime<Utc>`.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanoseconds: dt.timestamp_subsec_nanos() as i32,
        }
    }

    /// Convert to a `chrono::DateTime<Utc>`.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.seconds, self.nanoseconds as u32).unwrap_or_else(Utc::now)
    }

    /// Wrap this timestamp as a document field `Value`.
    pub fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.seconds, self.nanoseconds).cmp(&(other.seconds, other.nanoseconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_creation() {
        let ts = Timestamp::new(1234567890, 123456789).unwrap();
        assert_eq!(ts.seconds, 1234567890);
        assert_eq!(ts.nanoseconds, 123456789);
    }

    #[test]
    fn test_timestamp_invalid_nanoseconds_negative() {
        assert!(Timestamp::new(0, -1).is_err());
    }

    #[test]
    fn test_timestamp_invalid_nanoseconds_too_large() {
        assert!(Timestamp::new(0, 1_000_000_000).is_err());
    }

    #[test]
    fn test_timestamp_valid_nanoseconds_boundary() {
        assert!(Timestamp::new(0, 0).is_ok());
        assert!(Timestamp::new(0, 999_999_999).is_ok());
    }

    #[test]
    fn test_timestamp_datetime_conversion() {
        let now = Utc::now();
        let ts = Timestamp::from_datetime(now);
        let dt = ts.to_datetime();
        assert!((dt.timestamp() - now.timestamp()).abs() <= 1);
    }

    #[test]
    fn test_timestamp_epoch() {
        let epoch = Timestamp::new(0, 0).unwrap();
        assert_eq!(epoch.to_datetime().timestamp(), 0);
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::new(10, 500).unwrap();
        let b = Timestamp::new(10, 600).unwrap();
        let c = Timestamp::new(11, 0).unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_timestamp_negative_seconds() {
        let ts = Timestamp::new(-1000, 0).unwrap();
        assert_eq!(ts.seconds, -1000);
    }

    #[test]
    fn test_timestamp_to_value() {
        let ts = Timestamp::new(1234567890, 123456789).unwrap();
        match ts.to_value() {
            Value::Timestamp(inner) => assert_eq!(inner, ts),
            _ => panic!("expected Value::Timestamp"),
        }
    }
}
