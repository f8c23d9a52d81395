//! DST transition policies for recurring bookings.
//!
//! A recurring booking keeps its local wall-clock time across the year, so an
//! occurrence can land inside a spring-forward gap (the local time never exists)
//! or a fall-back overlap (it exists twice). [`resolve_local`] turns a local
//! time into a concrete instant according to the configured policy.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Policy for handling occurrences that fall during DST transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DstPolicy {
    /// Skip instances that fall in the DST gap (e.g., 2:30 AM during spring forward)
    Skip,
    /// Shift to the next valid time after the gap
    ShiftForward,
    /// Use wall clock time (maintain local time, adjust UTC offset)
    #[default]
    WallClock,
}

/// Resolve a local date-time in `tz` to an instant.
///
/// Ambiguous times (fall back) always resolve to the earlier instant. Times in
/// a gap (spring forward) return `None` under [`DstPolicy::Skip`], the first
/// valid quarter hour after the gap under [`DstPolicy::ShiftForward`], and the
/// instant given by the pre-transition offset under [`DstPolicy::WallClock`].
pub fn resolve_local(tz: Tz, local: NaiveDateTime, policy: DstPolicy) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => match policy {
            DstPolicy::Skip => None,
            DstPolicy::ShiftForward => (1..=16)
                .map(|step| local + Duration::minutes(15 * step))
                .find_map(|candidate| tz.from_local_datetime(&candidate).earliest()),
            DstPolicy::WallClock => {
                let before = tz
                    .offset_from_local_datetime(&(local - Duration::hours(4)))
                    .earliest()?;
                let utc = local - Duration::seconds(i64::from(before.fix().local_minus_utc()));
                Some(Utc.from_utc_datetime(&utc).with_timezone(&tz))
            }
        },
    }
}
