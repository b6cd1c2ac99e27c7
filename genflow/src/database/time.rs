//! Timestamp helpers for the database layer.
//!
//! We store timestamps as `INTEGER` Unix epoch milliseconds (UTC) in SQLite.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Values outside chrono's supported range fall back to the Unix epoch.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => DateTime::<Utc>::default(),
    }
}

/// Start of the local day containing `at`, in `tz`, as epoch milliseconds.
pub fn start_of_day_ms(tz: Tz, at: DateTime<Utc>) -> i64 {
    let local_date = at.with_timezone(&tz).date_naive();
    let midnight = local_date.and_hms_opt(0, 0, 0).unwrap_or_default();
    // A DST gap at midnight has no local 00:00; take the earliest instant of the day.
    match tz.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc).timestamp_millis(),
        chrono::LocalResult::Ambiguous(earliest, _) => {
            earliest.with_timezone(&Utc).timestamp_millis()
        }
        chrono::LocalResult::None => {
            let shifted = midnight + chrono::Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
                .unwrap_or_else(|| midnight.and_utc().timestamp_millis())
        }
    }
}

/// Start of today in `tz`, as epoch milliseconds.
pub fn start_of_today_ms(tz: Tz) -> i64 {
    start_of_day_ms(tz, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_round_trip() {
        let now = Utc::now();
        let ms = datetime_to_ms(now);
        assert_eq!(ms_to_datetime(ms).timestamp_millis(), ms);
    }

    #[test]
    fn test_start_of_day_shanghai() {
        // 2024-03-10T17:30:00Z is 2024-03-11T01:30 in Shanghai (UTC+8).
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 17, 30, 0).unwrap();
        let start = start_of_day_ms(chrono_tz::Asia::Shanghai, at);
        let expected = Utc.with_ymd_and_hms(2024, 3, 10, 16, 0, 0).unwrap();
        assert_eq!(start, expected.timestamp_millis());
    }

    #[test]
    fn test_start_of_day_is_not_after_now() {
        let start = start_of_today_ms(chrono_tz::UTC);
        assert!(start <= now_ms());
        assert!(now_ms() - start < 24 * 60 * 60 * 1000);
    }
}
