//! Accumulated result of an edit: what changed, plus every non-fatal warning.
//!
//! A returned `Ok(EditOutcome)` means the booking records were committed. It
//! does not mean every occurrence got its room or that the calendar and mail
//! projections succeeded; those show up in [`EditOutcome::warnings`].

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::model::{ConferenceId, Reservable, ReservationId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The occurrence was saved without an allocation.
    RoomConflict {
        reservable: Reservable,
        occurrence_index: u32,
        date: NaiveDate,
    },
    /// At least one room of a conference call is in conflict at this index.
    RoomConflictInConferenceCall {
        conference_id: ConferenceId,
        occurrence_index: u32,
        date: NaiveDate,
    },
    /// The external series was lost and rebuilt from the surviving occurrences.
    SeriesRecreated {
        previous_uid: String,
        uid: String,
        occurrences: usize,
    },
    Calendar {
        message: String,
    },
    Notification {
        message: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoomConflict {
                reservable,
                occurrence_index,
                date,
            } => write!(
                f,
                "{reservable} is unavailable for occurrence {occurrence_index} on {date}"
            ),
            Self::RoomConflictInConferenceCall {
                conference_id,
                occurrence_index,
                date,
            } => write!(
                f,
                "conference {conference_id} has a room conflict at occurrence {occurrence_index} on {date}"
            ),
            Self::SeriesRecreated {
                previous_uid,
                uid,
                occurrences,
            } => write!(
                f,
                "calendar series {previous_uid} was missing and was recreated as {uid} with {occurrences} occurrences"
            ),
            Self::Calendar { message } => write!(f, "calendar update failed: {message}"),
            Self::Notification { message } => write!(f, "notification failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub created: Vec<ReservationId>,
    pub updated: Vec<ReservationId>,
    pub cancelled: Vec<ReservationId>,
    pub warnings: Vec<Warning>,
}

impl EditOutcome {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Number of create/update/cancel operations applied.
    pub fn change_count(&self) -> usize {
        self.created.len() + self.updated.len() + self.cancelled.len()
    }

    pub fn warn(&mut self, warning: Warning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        for warning in warnings {
            self.warn(warning);
        }
    }
}
