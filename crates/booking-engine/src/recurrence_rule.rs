//! Recurrence pattern ↔ RRULE translation.
//!
//! Only the subset the crate itself emits is understood: `FREQ`, `INTERVAL`,
//! `COUNT` or `UNTIL`, and the `BYDAY` / `BYMONTHDAY` / `BYMONTH` selectors
//! the six pattern shapes need. `UNTIL` is always UTC: the local end of the
//! last permitted occurrence, converted through the location's timezone.

use chrono::{Datelike, NaiveDate, Utc, Weekday};
use rrule::{Frequency, NWeekday, RRule, Unvalidated};

use crate::dst::{resolve_local, DstPolicy};
use crate::error::{BookingError, Result};
use crate::pattern::{RecurrenceEnd, RecurrenceKind, RecurrencePattern, WeekOfMonth};
use crate::period::TimePeriod;

/// Translate a pattern into an RRULE value (without the `RRULE:` prefix).
///
/// # Arguments
/// - `pattern` -- the recurrence to translate
/// - `template` -- any occurrence period of the series; its times of day,
///   duration and timezone place `UNTIL`
/// - `dst` -- how to resolve an `UNTIL` that falls into a DST gap
///
/// # Errors
/// Returns `BookingError::InvalidRecurrence` for a malformed pattern and
/// `BookingError::InvalidTimezone` if the `UNTIL` instant cannot be resolved.
pub fn to_rule(pattern: &RecurrencePattern, template: &TimePeriod, dst: DstPolicy) -> Result<String> {
    pattern.validate()?;

    let mut parts = rule_parts(pattern);
    let end = match pattern.end {
        RecurrenceEnd::Count(count) => format!("COUNT={count}"),
        RecurrenceEnd::Until(until) => {
            let last_end = template.on_date(until).end;
            let utc = resolve_local(template.timezone, last_end, dst)
                .ok_or_else(|| {
                    BookingError::InvalidTimezone(format!(
                        "{last_end} does not exist in {}",
                        template.timezone
                    ))
                })?
                .with_timezone(&Utc);
            format!("UNTIL={}", utc.format("%Y%m%dT%H%M%SZ"))
        }
    };
    parts.insert(2, end);

    Ok(parts.join(";"))
}

/// `FREQ`, `INTERVAL` and the selectors of a pattern, without an end.
pub(crate) fn rule_parts(pattern: &RecurrencePattern) -> Vec<String> {
    let mut parts: Vec<String> = Vec::with_capacity(5);
    let freq = match pattern.kind {
        RecurrenceKind::Daily => "DAILY",
        RecurrenceKind::Weekly { .. } => "WEEKLY",
        RecurrenceKind::MonthlyByDate { .. } | RecurrenceKind::MonthlyByWeekday { .. } => "MONTHLY",
        RecurrenceKind::YearlyByDate { .. } | RecurrenceKind::YearlyByWeekday { .. } => "YEARLY",
    };
    parts.push(format!("FREQ={freq}"));
    parts.push(format!("INTERVAL={}", pattern.interval));

    match &pattern.kind {
        RecurrenceKind::Daily => {}
        RecurrenceKind::Weekly { weekdays } => {
            let days: Vec<&str> = weekdays.iter().map(|d| weekday_code(*d)).collect();
            parts.push(format!("BYDAY={}", days.join(",")));
        }
        RecurrenceKind::MonthlyByDate { day } => parts.push(format!("BYMONTHDAY={day}")),
        RecurrenceKind::MonthlyByWeekday { week, weekday } => {
            parts.push(format!("BYDAY={}{}", week.ordinal(), weekday_code(*weekday)));
        }
        RecurrenceKind::YearlyByDate { month, day } => {
            parts.push(format!("BYMONTH={month}"));
            parts.push(format!("BYMONTHDAY={day}"));
        }
        RecurrenceKind::YearlyByWeekday {
            month,
            week,
            weekday,
        } => {
            parts.push(format!("BYMONTH={month}"));
            parts.push(format!("BYDAY={}{}", week.ordinal(), weekday_code(*weekday)));
        }
    }
    parts
}

/// Translate an RRULE emitted by [`to_rule`] back into a pattern.
///
/// # Arguments
/// - `rule` -- RRULE value, with or without the `RRULE:` prefix
/// - `start` -- series start date (the rule itself does not carry it)
/// - `template` -- occurrence period used to map `UNTIL` back to a local date
///
/// # Errors
/// Returns `BookingError::InvalidRecurrence` if the rule cannot be parsed or
/// uses anything outside the supported subset.
pub fn from_rule(rule: &str, start: NaiveDate, template: &TimePeriod) -> Result<RecurrencePattern> {
    let trimmed = rule.trim();
    let body = trimmed.strip_prefix("RRULE:").unwrap_or(trimmed);
    let parsed: RRule<Unvalidated> = body
        .parse()
        .map_err(|e| BookingError::InvalidRecurrence(format!("{e}")))?;

    let by_day = parsed.get_by_weekday();
    let by_month_day = parsed.get_by_month_day();
    let by_month = parsed.get_by_month();

    let kind = match parsed.get_freq() {
        Frequency::Daily => RecurrenceKind::Daily,
        Frequency::Weekly => {
            let weekdays = by_day
                .iter()
                .map(|d| match d {
                    NWeekday::Every(day) => Ok(*day),
                    NWeekday::Nth(..) => Err(unsupported("ordinal BYDAY in a weekly rule")),
                })
                .collect::<Result<Vec<Weekday>>>()?;
            // An RRULE without BYDAY repeats on the start's weekday.
            let weekdays = if weekdays.is_empty() {
                vec![start.weekday()]
            } else {
                weekdays
            };
            RecurrenceKind::Weekly { weekdays }
        }
        Frequency::Monthly => match (by_month_day, by_day) {
            ([day], []) => RecurrenceKind::MonthlyByDate {
                day: positive_day(*day)?,
            },
            ([], [nth]) => {
                let (week, weekday) = nth_weekday(nth)?;
                RecurrenceKind::MonthlyByWeekday { week, weekday }
            }
            ([], []) => RecurrenceKind::MonthlyByDate { day: start.day() },
            _ => return Err(unsupported("monthly selector combination")),
        },
        Frequency::Yearly => {
            let month = match by_month {
                [month] => u32::from(*month),
                [] => start.month(),
                _ => return Err(unsupported("more than one BYMONTH")),
            };
            match (by_month_day, by_day) {
                ([day], []) => RecurrenceKind::YearlyByDate {
                    month,
                    day: positive_day(*day)?,
                },
                ([], [nth]) => {
                    let (week, weekday) = nth_weekday(nth)?;
                    RecurrenceKind::YearlyByWeekday {
                        month,
                        week,
                        weekday,
                    }
                }
                ([], []) => RecurrenceKind::YearlyByDate {
                    month,
                    day: start.day(),
                },
                _ => return Err(unsupported("yearly selector combination")),
            }
        }
        other => return Err(unsupported(&format!("frequency {other:?}"))),
    };

    let end = match (parsed.get_count(), parsed.get_until()) {
        (Some(count), None) => RecurrenceEnd::Count(count),
        (None, Some(until)) => {
            let last_end = until.with_timezone(&template.timezone).naive_local();
            RecurrenceEnd::Until((last_end - template.duration()).date())
        }
        (None, None) => return Err(unsupported("rule without COUNT or UNTIL")),
        (Some(_), Some(_)) => {
            return Err(BookingError::InvalidRecurrence(
                "COUNT and UNTIL are mutually exclusive".to_string(),
            ))
        }
    };

    RecurrencePattern::new(kind, u32::from(parsed.get_interval()), start, end)
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

fn nth_weekday(day: &NWeekday) -> Result<(WeekOfMonth, Weekday)> {
    match day {
        NWeekday::Nth(n, weekday) => WeekOfMonth::from_ordinal(*n)
            .map(|week| (week, *weekday))
            .ok_or_else(|| unsupported(&format!("weekday ordinal {n}"))),
        NWeekday::Every(_) => Err(unsupported("BYDAY without ordinal in a monthly/yearly rule")),
    }
}

fn positive_day(day: i8) -> Result<u32> {
    u32::try_from(day).map_err(|_| unsupported("negative BYMONTHDAY"))
}

fn unsupported(what: &str) -> BookingError {
    BookingError::InvalidRecurrence(format!("unsupported RRULE: {what}"))
}
