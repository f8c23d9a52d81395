//! Time periods anchored to an explicit timezone.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::dst::{resolve_local, DstPolicy};
use crate::error::{BookingError, Result};

/// A local start/end pair plus the timezone it is expressed in.
///
/// The end may fall on a later date than the start (overnight bookings); the
/// occurrence date is always the start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub timezone: Tz,
}

/// A half-open `[start, end)` interval in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtcInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimePeriod {
    /// # Errors
    /// Returns `BookingError::InvalidRecurrence` if `end` is not after `start`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime, timezone: Tz) -> Result<Self> {
        if end <= start {
            return Err(BookingError::InvalidRecurrence(format!(
                "period end {end} is not after start {start}"
            )));
        }
        Ok(Self {
            start,
            end,
            timezone,
        })
    }

    /// Build a period on `date` between two local times; an `end` at or before
    /// `start` rolls over to the next day.
    pub fn on(date: NaiveDate, start: NaiveTime, end: NaiveTime, timezone: Tz) -> Self {
        let start_dt = date.and_time(start);
        let mut end_dt = date.and_time(end);
        if end_dt <= start_dt {
            end_dt += Duration::days(1);
        }
        Self {
            start: start_dt,
            end: end_dt,
            timezone,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn start_time(&self) -> NaiveTime {
        self.start.time()
    }

    pub fn end_time(&self) -> NaiveTime {
        self.end.time()
    }

    /// The same times of day and duration, moved onto `date`.
    #[must_use]
    pub fn on_date(&self, date: NaiveDate) -> Self {
        let shift = date - self.date();
        Self {
            start: self.start + shift,
            end: self.end + shift,
            timezone: self.timezone,
        }
    }

    /// True when both periods start and end at the same local times of day.
    pub fn same_times_of_day(&self, other: &Self) -> bool {
        self.start.time() == other.start.time()
            && self.duration() == other.duration()
            && self.timezone == other.timezone
    }

    /// Convert to UTC. Returns `None` when the start falls into a DST gap and
    /// the policy is [`DstPolicy::Skip`].
    pub fn to_utc(&self, policy: DstPolicy) -> Option<UtcInterval> {
        let start = resolve_local(self.timezone, self.start, policy)?.with_timezone(&Utc);
        let end = match resolve_local(self.timezone, self.end, policy) {
            Some(end) => end.with_timezone(&Utc),
            None => start + self.duration(),
        };
        Some(UtcInterval { start, end })
    }
}

impl UtcInterval {
    /// Half-open overlap: adjacent intervals (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn overlap_minutes(&self, other: &Self) -> i64 {
        if !self.overlaps(other) {
            return 0;
        }
        (self.end.min(other.end) - self.start.max(other.start)).num_minutes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn overnight_period_rolls_end_to_next_day() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let p = TimePeriod::on(date, time(22, 0), time(1, 0), Tz::UTC);
        assert_eq!(p.end.date(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(p.duration(), Duration::hours(3));
    }

    #[test]
    fn on_date_preserves_times() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let p = TimePeriod::on(date, time(9, 0), time(10, 30), Tz::UTC);
        let moved = p.on_date(NaiveDate::from_ymd_opt(2024, 2, 15).unwrap());
        assert!(moved.same_times_of_day(&p));
        assert_eq!(moved.date(), NaiveDate::from_ymd_opt(2024, 2, 15).unwrap());
    }

    #[test]
    fn utc_conversion_uses_zone() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let p = TimePeriod::on(date, time(9, 0), time(10, 0), chrono_tz::America::New_York);
        let utc = p.to_utc(DstPolicy::WallClock).unwrap();
        assert_eq!(utc.start, Utc.with_ymd_and_hms(2024, 7, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn adjacent_intervals_do_not_overlap() {
        let a = UtcInterval {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
        };
        let b = UtcInterval {
            start: a.end,
            end: Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap(),
        };
        assert!(!a.overlaps(&b));
        assert_eq!(a.overlap_minutes(&b), 0);
    }

    #[test]
    fn inverted_period_is_rejected() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = TimePeriod::new(date.and_time(time(10, 0)), date.and_time(time(9, 0)), Tz::UTC);
        assert!(err.is_err());
    }
}
