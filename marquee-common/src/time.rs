//! Timestamp utilities
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings with millisecond
//! precision, so SQL string comparison orders them chronologically.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage
pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time, formatted for storage
pub fn now_db() -> String {
    to_db(now())
}

/// Parse a stored timestamp
pub fn from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("Bad timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_round_trip_keeps_millis() {
        let ts = now();
        let parsed = from_db(&to_db(ts)).unwrap();
        assert_eq!(parsed.timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn test_string_order_matches_time_order() {
        let earlier = now();
        let later = earlier + Duration::milliseconds(1500);
        assert!(to_db(earlier) < to_db(later));
        assert_eq!(to_db(earlier).len(), to_db(later).len());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(from_db("yesterday"), Err(Error::InvalidInput(_))));
    }
}
