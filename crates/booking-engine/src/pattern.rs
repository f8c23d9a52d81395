//! Recurrence patterns.
//!
//! A [`RecurrencePattern`] is the crate's own, closed recurrence model: six
//! shapes (daily, weekly, monthly/yearly by date or by weekday), an interval,
//! a start date, and an end given either as a date or an occurrence count.
//! [`crate::datelist`] expands it into dates; [`crate::recurrence_rule`] translates it to
//! and from the RRULE subset sent to the external calendar.

use chrono::{Datelike, Duration, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{BookingError, Result};

/// Position of a weekday within its month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekOfMonth {
    First,
    Second,
    Third,
    Fourth,
    Last,
}

impl WeekOfMonth {
    /// RRULE ordinal: 1..=4, or -1 for the last one.
    pub fn ordinal(self) -> i16 {
        match self {
            Self::First => 1,
            Self::Second => 2,
            Self::Third => 3,
            Self::Fourth => 4,
            Self::Last => -1,
        }
    }

    pub fn from_ordinal(n: i16) -> Option<Self> {
        match n {
            1 => Some(Self::First),
            2 => Some(Self::Second),
            3 => Some(Self::Third),
            4 => Some(Self::Fourth),
            -1 => Some(Self::Last),
            _ => None,
        }
    }
}

/// The per-period selection rule of a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecurrenceKind {
    Daily,
    Weekly {
        weekdays: Vec<Weekday>,
    },
    MonthlyByDate {
        day: u32,
    },
    MonthlyByWeekday {
        week: WeekOfMonth,
        weekday: Weekday,
    },
    YearlyByDate {
        month: u32,
        day: u32,
    },
    YearlyByWeekday {
        month: u32,
        week: WeekOfMonth,
        weekday: Weekday,
    },
}

/// How a series ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceEnd {
    /// Last permitted date, inclusive.
    Until(NaiveDate),
    /// Total number of occurrences counted from `start`.
    Count(u32),
}

/// Unit a pattern's interval is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    #[serde(flatten)]
    pub kind: RecurrenceKind,
    pub interval: u32,
    pub start: NaiveDate,
    pub end: RecurrenceEnd,
}

impl RecurrencePattern {
    /// Build and validate a pattern. Weekly weekday sets are sorted Monday first
    /// and deduplicated.
    ///
    /// # Errors
    /// Returns `BookingError::InvalidRecurrence` when the pattern is malformed.
    pub fn new(
        kind: RecurrenceKind,
        interval: u32,
        start: NaiveDate,
        end: RecurrenceEnd,
    ) -> Result<Self> {
        let kind = match kind {
            RecurrenceKind::Weekly { mut weekdays } => {
                weekdays.sort_by_key(Weekday::num_days_from_monday);
                weekdays.dedup();
                RecurrenceKind::Weekly { weekdays }
            }
            other => other,
        };
        let pattern = Self {
            kind,
            interval,
            start,
            end,
        };
        pattern.validate()?;
        Ok(pattern)
    }

    pub fn daily(start: NaiveDate, interval: u32, end: RecurrenceEnd) -> Result<Self> {
        Self::new(RecurrenceKind::Daily, interval, start, end)
    }

    pub fn weekly(
        start: NaiveDate,
        interval: u32,
        weekdays: Vec<Weekday>,
        end: RecurrenceEnd,
    ) -> Result<Self> {
        Self::new(RecurrenceKind::Weekly { weekdays }, interval, start, end)
    }

    /// Structural checks only; a valid pattern may still yield no dates.
    ///
    /// # Errors
    /// Returns `BookingError::InvalidRecurrence` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(invalid("interval must be at least 1"));
        }
        match &self.kind {
            RecurrenceKind::Daily => {}
            RecurrenceKind::Weekly { weekdays } => {
                if weekdays.is_empty() {
                    return Err(invalid("weekly pattern needs at least one weekday"));
                }
            }
            RecurrenceKind::MonthlyByDate { day } => check_day(*day)?,
            RecurrenceKind::MonthlyByWeekday { .. } => {}
            RecurrenceKind::YearlyByDate { month, day } => {
                check_month(*month)?;
                check_day(*day)?;
                // 2000 is a leap year, so Feb 29 passes here.
                if NaiveDate::from_ymd_opt(2000, *month, *day).is_none() {
                    return Err(invalid(format!("month {month} has no day {day}")));
                }
            }
            RecurrenceKind::YearlyByWeekday { month, .. } => check_month(*month)?,
        }
        Ok(())
    }

    pub fn frequency(&self) -> Frequency {
        match self.kind {
            RecurrenceKind::Daily => Frequency::Daily,
            RecurrenceKind::Weekly { .. } => Frequency::Weekly,
            RecurrenceKind::MonthlyByDate { .. } | RecurrenceKind::MonthlyByWeekday { .. } => {
                Frequency::Monthly
            }
            RecurrenceKind::YearlyByDate { .. } | RecurrenceKind::YearlyByWeekday { .. } => {
                Frequency::Yearly
            }
        }
    }

    pub fn until(&self) -> Option<NaiveDate> {
        match self.end {
            RecurrenceEnd::Until(date) => Some(date),
            RecurrenceEnd::Count(_) => None,
        }
    }

    pub fn count(&self) -> Option<u32> {
        match self.end {
            RecurrenceEnd::Count(count) => Some(count),
            RecurrenceEnd::Until(_) => None,
        }
    }

    /// Per-unit predicate: `date` is on or after `start`, not after `until`,
    /// lies in a period aligned with the interval, and satisfies the
    /// period's selection rule. Occurrence counts are not considered.
    pub fn matches(&self, date: NaiveDate) -> bool {
        if date < self.start || self.until().is_some_and(|until| date > until) {
            return false;
        }
        let interval = i64::from(self.interval);
        match &self.kind {
            RecurrenceKind::Daily => (date - self.start).num_days() % interval == 0,
            RecurrenceKind::Weekly { weekdays } => {
                let weeks = (week_start(date) - week_start(self.start)).num_weeks();
                weeks % interval == 0 && weekdays.contains(&date.weekday())
            }
            RecurrenceKind::MonthlyByDate { .. } | RecurrenceKind::MonthlyByWeekday { .. } => {
                month_offset(self.start, date) % interval == 0
                    && self.dates_in_month(date.year(), date.month()).contains(&date)
            }
            RecurrenceKind::YearlyByDate { .. } | RecurrenceKind::YearlyByWeekday { .. } => {
                i64::from(date.year() - self.start.year()) % interval == 0
                    && self.dates_in_month(date.year(), date.month()).contains(&date)
            }
        }
    }

    /// Candidate dates the selection rule picks inside one calendar month,
    /// ignoring start/end bounds. Empty for months a yearly rule does not use.
    pub(crate) fn dates_in_month(&self, year: i32, month: u32) -> Vec<NaiveDate> {
        match &self.kind {
            RecurrenceKind::Daily | RecurrenceKind::Weekly { .. } => Vec::new(),
            RecurrenceKind::MonthlyByDate { day } => {
                NaiveDate::from_ymd_opt(year, month, *day).into_iter().collect()
            }
            RecurrenceKind::MonthlyByWeekday { week, weekday } => {
                nth_weekday(year, month, *week, *weekday).into_iter().collect()
            }
            RecurrenceKind::YearlyByDate { month: m, day } if *m == month => {
                NaiveDate::from_ymd_opt(year, month, *day).into_iter().collect()
            }
            RecurrenceKind::YearlyByWeekday {
                month: m,
                week,
                weekday,
            } if *m == month => nth_weekday(year, month, *week, *weekday).into_iter().collect(),
            RecurrenceKind::YearlyByDate { .. } | RecurrenceKind::YearlyByWeekday { .. } => {
                Vec::new()
            }
        }
    }

    /// The same pattern with its start moved by `steps` whole intervals.
    /// Returns `None` if the shifted date is out of range.
    pub fn shifted(&self, steps: i32) -> Option<Self> {
        let units = i64::from(steps) * i64::from(self.interval);
        let start = match self.frequency() {
            Frequency::Daily => self.start.checked_add_signed(Duration::days(units))?,
            Frequency::Weekly => self.start.checked_add_signed(Duration::weeks(units))?,
            Frequency::Monthly => add_months(self.start, units)?,
            Frequency::Yearly => add_months(self.start, units * 12)?,
        };
        Some(Self {
            start,
            ..self.clone()
        })
    }

    /// The remainder of this pattern starting at `date`, with `already` earlier
    /// occurrences deducted from a count-based end.
    #[must_use]
    pub fn starting_at(&self, date: NaiveDate, already: u32) -> Self {
        let end = match self.end {
            RecurrenceEnd::Count(count) => RecurrenceEnd::Count(count.saturating_sub(already)),
            until @ RecurrenceEnd::Until(_) => until,
        };
        Self {
            kind: self.kind.clone(),
            interval: self.interval,
            start: date,
            end,
        }
    }
}

/// Monday of the week containing `date`.
pub(crate) fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Whole calendar months from `from` to `to` (negative if `to` is earlier).
pub(crate) fn month_offset(from: NaiveDate, to: NaiveDate) -> i64 {
    i64::from(to.year() - from.year()) * 12 + i64::from(to.month()) - i64::from(from.month())
}

/// Add (or subtract) months, clamping the day to the end of the target month.
pub(crate) fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        date.checked_add_months(magnitude)
    } else {
        date.checked_sub_months(magnitude)
    }
}

/// First day of the month `offset` months after the month of `date`.
pub(crate) fn month_after(date: NaiveDate, offset: i64) -> Option<NaiveDate> {
    add_months(date.with_day(1)?, offset)
}

/// The `week`-th `weekday` of a month.
pub fn nth_weekday(year: i32, month: u32, week: WeekOfMonth, weekday: Weekday) -> Option<NaiveDate> {
    match week {
        WeekOfMonth::Last => {
            let last = month_after(NaiveDate::from_ymd_opt(year, month, 1)?, 1)?.pred_opt()?;
            let back = (7 + last.weekday().num_days_from_monday()
                - weekday.num_days_from_monday())
                % 7;
            Some(last - Duration::days(i64::from(back)))
        }
        other => {
            let n = u8::try_from(other.ordinal()).ok()?;
            NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
        }
    }
}

fn check_day(day: u32) -> Result<()> {
    if (1..=31).contains(&day) {
        Ok(())
    } else {
        Err(invalid(format!("day of month {day} is out of range")))
    }
}

fn check_month(month: u32) -> Result<()> {
    if (1..=12).contains(&month) {
        Ok(())
    } else {
        Err(invalid(format!("month {month} is out of range")))
    }
}

fn invalid(message: impl Into<String>) -> BookingError {
    BookingError::InvalidRecurrence(message.into())
}
