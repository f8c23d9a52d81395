//! Detect overlapping bookings on a reservable.
//!
//! Overlap is half-open: two bookings conflict when `a.start < b.end && b.start < a.end`.
//! Adjacent bookings (where one ends exactly when another starts) are NOT conflicts.

use serde::{Deserialize, Serialize};

use crate::dst::DstPolicy;
use crate::model::{ReservationId, SeriesId};
use crate::period::{TimePeriod, UtcInterval};

/// An interval already booked on a reservable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookedInterval {
    pub reservation_id: ReservationId,
    pub series_id: Option<SeriesId>,
    pub interval: UtcInterval,
}

/// A detected conflict between a candidate and an existing booking.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub booked: BookedInterval,
    pub overlap_minutes: i64,
}

/// Find every booking the candidate overlaps.
pub fn find_conflicts(candidate: &UtcInterval, booked: &[BookedInterval]) -> Vec<Conflict> {
    booked
        .iter()
        .filter(|b| candidate.overlaps(&b.interval))
        .map(|b| Conflict {
            booked: b.clone(),
            overlap_minutes: candidate.overlap_minutes(&b.interval),
        })
        .collect()
}

/// True if the candidate overlaps none of the booked intervals.
pub fn is_available(candidate: &UtcInterval, booked: &[BookedInterval]) -> bool {
    !booked.iter().any(|b| candidate.overlaps(&b.interval))
}

/// What to do with the first occurrence of a brand-new series whose room is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Refuse to create the series.
    #[default]
    Strict,
    /// Create it with the first occurrence in conflict so the user can resolve it.
    AllowFirstOccurrenceConflict,
}

/// Outcome of evaluating one occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allocate,
    /// Persist the occurrence without an allocation, status `conflict`.
    MarkConflict(Vec<Conflict>),
    /// Abort the operation.
    Reject(Vec<Conflict>),
}

/// Bookings that belong to the reservation being edited and must not count
/// against it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exclusion {
    pub series_id: Option<SeriesId>,
    pub reservation_id: Option<ReservationId>,
    /// Series the occurrence is moving out of.
    pub source_series_id: Option<SeriesId>,
}

impl Exclusion {
    fn excludes(&self, booked: &BookedInterval) -> bool {
        let own_series = |id: Option<SeriesId>| id.is_some() && booked.series_id == id;
        own_series(self.series_id)
            || own_series(self.source_series_id)
            || self.reservation_id == Some(booked.reservation_id)
    }
}

/// Availability check with the first-occurrence policy applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictEvaluator {
    pub policy: ConflictPolicy,
    pub dst: DstPolicy,
}

impl ConflictEvaluator {
    pub fn new(policy: ConflictPolicy, dst: DstPolicy) -> Self {
        Self { policy, dst }
    }

    /// Evaluate `period` against the booked intervals of its reservable.
    ///
    /// Only the first occurrence of a brand-new series is policy-gated; every
    /// other unavailable occurrence is marked as a conflict and never aborts
    /// the batch. A period that cannot be placed on the timeline at all (a DST
    /// gap under [`DstPolicy::Skip`]) counts as unavailable.
    pub fn evaluate(
        &self,
        period: &TimePeriod,
        booked: &[BookedInterval],
        exclusion: Exclusion,
        first_of_new_series: bool,
    ) -> Verdict {
        let conflicts = match period.to_utc(self.dst) {
            Some(candidate) => {
                let relevant: Vec<BookedInterval> = booked
                    .iter()
                    .filter(|b| !exclusion.excludes(b))
                    .cloned()
                    .collect();
                let found = find_conflicts(&candidate, &relevant);
                if found.is_empty() {
                    return Verdict::Allocate;
                }
                found
            }
            None => Vec::new(),
        };

        match (first_of_new_series, self.policy) {
            (true, ConflictPolicy::Strict) => Verdict::Reject(conflicts),
            (true, ConflictPolicy::AllowFirstOccurrenceConflict) | (false, _) => {
                Verdict::MarkConflict(conflicts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use chrono_tz::Tz;

    fn booked(id: u64, series: Option<u64>, h0: u32, h1: u32) -> BookedInterval {
        BookedInterval {
            reservation_id: ReservationId(id),
            series_id: series.map(SeriesId),
            interval: UtcInterval {
                start: Utc.with_ymd_and_hms(2026, 3, 1, h0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2026, 3, 1, h1, 0, 0).unwrap(),
            },
        }
    }

    fn period(h0: u32, h1: u32) -> TimePeriod {
        TimePeriod::on(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveTime::from_hms_opt(h0, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(h1, 0, 0).unwrap(),
            Tz::UTC,
        )
    }

    #[test]
    fn free_slot_is_allocated() {
        let evaluator = ConflictEvaluator::default();
        let verdict = evaluator.evaluate(&period(9, 10), &[booked(1, None, 10, 11)], Exclusion::default(), false);
        assert_eq!(verdict, Verdict::Allocate);
    }

    #[test]
    fn overlap_marks_subsequent_occurrence() {
        let evaluator = ConflictEvaluator::default();
        let verdict = evaluator.evaluate(&period(9, 11), &[booked(1, None, 10, 12)], Exclusion::default(), false);
        match verdict {
            Verdict::MarkConflict(conflicts) => assert_eq!(conflicts[0].overlap_minutes, 60),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn strict_policy_rejects_first_occurrence() {
        let evaluator = ConflictEvaluator::new(ConflictPolicy::Strict, DstPolicy::WallClock);
        let verdict = evaluator.evaluate(&period(9, 11), &[booked(1, None, 10, 12)], Exclusion::default(), true);
        assert!(matches!(verdict, Verdict::Reject(_)));
    }

    #[test]
    fn lenient_policy_marks_first_occurrence() {
        let evaluator =
            ConflictEvaluator::new(ConflictPolicy::AllowFirstOccurrenceConflict, DstPolicy::WallClock);
        let verdict = evaluator.evaluate(&period(9, 11), &[booked(1, None, 10, 12)], Exclusion::default(), true);
        assert!(matches!(verdict, Verdict::MarkConflict(_)));
    }

    #[test]
    fn own_series_is_ignored() {
        let evaluator = ConflictEvaluator::default();
        let exclusion = Exclusion {
            series_id: Some(SeriesId(7)),
            ..Exclusion::default()
        };
        let verdict = evaluator.evaluate(&period(9, 11), &[booked(1, Some(7), 9, 11)], exclusion, false);
        assert_eq!(verdict, Verdict::Allocate);
    }

    #[test]
    fn adjacent_booking_is_available() {
        let candidate = period(9, 10).to_utc(DstPolicy::WallClock).unwrap();
        assert!(is_available(&candidate, &[booked(1, None, 10, 11), booked(2, None, 8, 9)]));
    }

    #[test]
    fn fully_contained_booking_reports_overlap() {
        let candidate = period(9, 12).to_utc(DstPolicy::WallClock).unwrap();
        let conflicts = find_conflicts(&candidate, &[booked(1, None, 10, 11)]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].overlap_minutes, 60);
    }
}
