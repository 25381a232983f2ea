//! Conversions between archive timestamps and `SystemTime`.
//!
//! Zip stores DOS local time; it is treated as UTC here so that the same
//! archive yields the same times on every machine.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

pub(crate) fn from_zip(dt: zip::DateTime) -> SystemTime {
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)
        .and_then(|date| date.and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32))
        .map(|naive| SystemTime::from(naive.and_utc()))
        .unwrap_or(UNIX_EPOCH)
}

/// Times before 1980 (the DOS epoch) clamp to the zip default.
pub(crate) fn to_zip(time: SystemTime) -> zip::DateTime {
    let utc: DateTime<Utc> = time.into();
    let Ok(year) = u16::try_from(utc.year()) else {
        return zip::DateTime::default();
    };
    zip::DateTime::from_date_and_time(
        year,
        utc.month() as u8,
        utc.day() as u8,
        utc.hour() as u8,
        utc.minute() as u8,
        utc.second() as u8,
    )
    .unwrap_or_default()
}

pub(crate) fn from_unix_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

pub(crate) fn to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_round_trip_at_two_second_resolution() {
        let time = from_unix_secs(1_600_000_000);
        assert_eq!(from_zip(to_zip(time)), time);
    }

    #[test]
    fn pre_dos_epoch_clamps() {
        assert_eq!(to_zip(UNIX_EPOCH), zip::DateTime::default());
    }
}
