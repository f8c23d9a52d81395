//! Date-list generation -- converts a [`RecurrencePattern`] into concrete dates.
//!
//! Expansion goes through the `rrule` crate: the pattern is rendered as an
//! open-ended rule anchored at its start date, expanded up to the cap, and
//! the count or `until` bound is applied here. The result is always
//! ascending, duplicate-free, and capped at a configurable maximum so a
//! far-away `until` can never produce an unbounded list.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rrule::RRuleSet;
use tracing::{debug, warn};

use crate::error::{BookingError, Result};
use crate::pattern::{RecurrenceEnd, RecurrencePattern};
use crate::recurrence_rule::rule_parts;

/// Default cap on the number of generated dates.
pub const DEFAULT_MAX_DATES: usize = 500;

/// Largest cap the expansion supports; `rrule` limits a run to `u16` dates
/// and one slot is kept for a start date that is not itself an occurrence.
const MAX_SUPPORTED_DATES: usize = u16::MAX as usize - 2;

/// Upper bound on interval steps tried by [`DateListGenerator::align_to_fixed`].
const MAX_ALIGN_STEPS: u32 = 520;

/// Expands recurrence patterns into dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateListGenerator {
    max_dates: usize,
}

impl Default for DateListGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATES)
    }
}

impl DateListGenerator {
    pub fn new(max_dates: usize) -> Self {
        Self {
            max_dates: max_dates.clamp(1, MAX_SUPPORTED_DATES),
        }
    }

    pub fn max_dates(&self) -> usize {
        self.max_dates
    }

    /// Expand `pattern` into its dates, earliest first.
    ///
    /// A count-based end is honoured exactly; either way the list is cropped
    /// to the earliest `max_dates` entries.
    ///
    /// # Errors
    /// Returns `BookingError::InvalidRecurrence` if the pattern is malformed
    /// and `BookingError::PatternEmpty` if no date satisfies it.
    pub fn generate(&self, pattern: &RecurrencePattern) -> Result<Vec<NaiveDate>> {
        pattern.validate()?;

        // One extra date for until-bounded patterns tells us whether cropping happened.
        let wanted = match pattern.end {
            RecurrenceEnd::Count(count) => (count as usize).min(self.max_dates),
            RecurrenceEnd::Until(_) => self.max_dates + 1,
        };
        let until = pattern.until();
        if wanted == 0 || until.is_some_and(|until| until < pattern.start) {
            return Err(BookingError::PatternEmpty);
        }

        let mut parts = rule_parts(pattern);
        if let Some(until) = until {
            parts.insert(2, format!("UNTIL={}", until.format("%Y%m%dT235959Z")));
        }
        let text = format!(
            "DTSTART:{}\nRRULE:{}",
            pattern.start.format("%Y%m%dT000000Z"),
            parts.join(";")
        );
        let set: RRuleSet = text
            .parse()
            .map_err(|e| BookingError::InvalidRecurrence(format!("{e}")))?;

        // A start date off the pattern may come back as the first instance.
        let limit = u16::try_from(wanted + 1).unwrap_or(u16::MAX);
        let expanded = set.all(limit);
        if expanded.limited {
            debug!(start = %pattern.start, "rrule expansion stopped at its iteration limit");
        }
        let mut dates: Vec<NaiveDate> = expanded
            .dates
            .iter()
            .map(|instance| instance.date_naive())
            .filter(|date| pattern.matches(*date))
            .collect();
        dates.dedup();
        if pattern.count().is_some() {
            dates.truncate(wanted);
        }

        let cropped = dates.len() > self.max_dates
            || pattern
                .count()
                .is_some_and(|count| count as usize > self.max_dates);
        if cropped {
            warn!(
                start = %pattern.start,
                max = self.max_dates,
                "recurrence exceeds the date cap, keeping the earliest dates"
            );
            dates.truncate(self.max_dates);
        }

        if dates.is_empty() {
            return Err(BookingError::PatternEmpty);
        }
        Ok(dates)
    }

    /// Expand `pattern` and number the dates from `first_index`.
    ///
    /// # Errors
    /// Same as [`DateListGenerator::generate`].
    pub fn generate_indexed(
        &self,
        pattern: &RecurrencePattern,
        first_index: u32,
    ) -> Result<Vec<(u32, NaiveDate)>> {
        Ok(self
            .generate(pattern)?
            .into_iter()
            .zip(first_index..)
            .map(|(date, index)| (index, date))
            .collect())
    }

    /// Walk the pattern start backward or forward by whole intervals until the
    /// generated date at the lowest fixed index equals its fixed date.
    ///
    /// This repairs drift when the first occurrence of a series was moved to a
    /// date the pattern would not produce and the stored start followed it.
    /// Other fixed entries are not enforced; they may be exceptions.
    ///
    /// # Errors
    /// Returns `BookingError::InvalidRecurrence` when the fixed date is not
    /// reachable by whole-interval shifts, plus any error from generation.
    pub fn align_to_fixed(
        &self,
        pattern: &RecurrencePattern,
        fixed: &BTreeMap<u32, NaiveDate>,
    ) -> Result<RecurrencePattern> {
        let Some((&index, &target)) = fixed.iter().next() else {
            return Ok(pattern.clone());
        };
        if index == 0 {
            return Err(BookingError::InvalidRecurrence(
                "occurrence indices start at 1".to_string(),
            ));
        }

        let mut candidate = pattern.clone();
        let mut direction = 0i32;
        for _ in 0..MAX_ALIGN_STEPS {
            let dates = self.generate(&candidate)?;
            let step = match dates.get(index as usize - 1) {
                Some(date) if *date == target => {
                    if direction != 0 {
                        debug!(from = %pattern.start, to = %candidate.start, "aligned pattern start");
                    }
                    return Ok(candidate);
                }
                Some(date) if *date < target => 1,
                // Past the target, or the series is too short to reach the index.
                _ => -1,
            };
            if direction != 0 && step != direction {
                break;
            }
            direction = step;
            candidate = candidate.shifted(step).ok_or_else(|| {
                BookingError::InvalidRecurrence("pattern start out of range".to_string())
            })?;
        }

        Err(BookingError::InvalidRecurrence(format!(
            "occurrence {index} on {target} does not lie on the pattern"
        )))
    }
}
