use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Utc};

/// Returns start of the next day.
pub fn next_day_start(date: NaiveDateTime) -> NaiveDateTime {
    (date + Duration::days(1)).date().and_time(NaiveTime::MIN)
}

/// The tracking file stores start instants as float UNIX seconds.
pub fn to_unix_seconds(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((seconds * 1_000_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

    use super::{from_unix_seconds, next_day_start, to_unix_seconds};

    #[test]
    fn test_next_day_start() {
        let date = NaiveDate::from_ymd_opt(2019, 8, 31)
            .unwrap()
            .and_hms_opt(16, 30, 12)
            .unwrap();
        let next = next_day_start(date);
        assert_eq!(next.date(), NaiveDate::from_ymd_opt(2019, 9, 1).unwrap());
        assert_eq!(next.time(), NaiveTime::MIN);
    }

    #[test]
    fn test_unix_seconds_round_trip() {
        let instant = Utc.with_ymd_and_hms(2019, 8, 21, 16, 0, 0).unwrap();
        assert_eq!(from_unix_seconds(to_unix_seconds(instant)), Some(instant));
    }

    #[test]
    fn test_invalid_unix_seconds() {
        assert_eq!(from_unix_seconds(f64::NAN), None);
        assert_eq!(from_unix_seconds(f64::INFINITY), None);
    }
}
