//! Reservation data model: reservables, occurrences, series and external refs.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::pattern::RecurrencePattern;
use crate::period::TimePeriod;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Repository-assigned id of one occurrence.
    ReservationId
);
id_type!(
    /// Id shared by every occurrence generated from one pattern.
    SeriesId
);
id_type!(
    /// Id shared by every room of one conference call, across edits.
    ConferenceId
);

/// Something that can be booked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reservable {
    Room { room_id: String, building_id: String },
    Resource { resource_id: String },
}

impl Reservable {
    pub fn room(room_id: impl Into<String>, building_id: impl Into<String>) -> Self {
        Self::Room {
            room_id: room_id.into(),
            building_id: building_id.into(),
        }
    }

    pub fn resource(resource_id: impl Into<String>) -> Self {
        Self::Resource {
            resource_id: resource_id.into(),
        }
    }

    /// Stable key used in conflict lookups and log lines.
    pub fn key(&self) -> &str {
        match self {
            Self::Room { room_id, .. } => room_id,
            Self::Resource { resource_id } => resource_id,
        }
    }

    pub fn building(&self) -> Option<&str> {
        match self {
            Self::Room { building_id, .. } => Some(building_id),
            Self::Resource { .. } => None,
        }
    }
}

impl fmt::Display for Reservable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room {
                room_id,
                building_id,
            } => write!(f, "room {room_id} ({building_id})"),
            Self::Resource { resource_id } => write!(f, "resource {resource_id}"),
        }
    }
}

/// A confirmed hold on a reservable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAllocation {
    pub reservable: Reservable,
    pub period: TimePeriod,
    pub comments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    #[default]
    Confirmed,
    /// Persisted without an allocation because the reservable was taken.
    Conflict,
    Cancelled,
    Rejected,
}

impl OccurrenceStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Confirmed | Self::Conflict)
    }
}

/// One date-bound instance of a (possibly recurring) reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationOccurrence {
    pub id: Option<ReservationId>,
    pub series_id: Option<SeriesId>,
    /// 1-based position within the series.
    pub occurrence_index: u32,
    pub period: TimePeriod,
    pub subject: String,
    pub attendees: Vec<String>,
    /// What was asked for, kept even when no allocation could be made.
    pub reservable: Reservable,
    pub allocation: Option<RoomAllocation>,
    pub comments: String,
    pub status: OccurrenceStatus,
    /// Moved away from the date the pattern would give it.
    pub is_exception: bool,
    pub conference_id: Option<ConferenceId>,
    pub external_uid: Option<String>,
    pub external_sequence: u32,
}

impl ReservationOccurrence {
    /// A fresh, unsaved occurrence with a confirmed allocation.
    pub fn new(
        reservable: Reservable,
        period: TimePeriod,
        subject: impl Into<String>,
        comments: impl Into<String>,
    ) -> Self {
        let comments = comments.into();
        Self {
            id: None,
            series_id: None,
            occurrence_index: 1,
            allocation: Some(RoomAllocation {
                reservable: reservable.clone(),
                period,
                comments: comments.clone(),
            }),
            period,
            subject: subject.into(),
            attendees: Vec::new(),
            reservable,
            comments,
            status: OccurrenceStatus::Confirmed,
            is_exception: false,
            conference_id: None,
            external_uid: None,
            external_sequence: 0,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.period.date()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Same content as far as attendees and the calendar are concerned.
    /// Ids, status and external bookkeeping are ignored.
    pub fn same_content(&self, other: &Self) -> bool {
        self.period == other.period
            && self.subject == other.subject
            && self.attendees == other.attendees
            && self.reservable == other.reservable
            && self.comments == other.comments
    }

    pub(crate) fn allocate(&mut self) {
        self.allocation = Some(RoomAllocation {
            reservable: self.reservable.clone(),
            period: self.period,
            comments: self.comments.clone(),
        });
        self.status = OccurrenceStatus::Confirmed;
    }

    pub(crate) fn mark_conflict(&mut self) {
        self.allocation = None;
        self.status = OccurrenceStatus::Conflict;
    }
}

/// The persisted owner of a recurrence pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: SeriesId,
    pub pattern: RecurrencePattern,
    pub conference_id: Option<ConferenceId>,
}

/// Handle on an appointment held by the external calendar system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAppointmentRef {
    pub uid: String,
    pub sequence: u32,
    /// Original local start of a single occurrence within a tracked series.
    pub recurrence_id: Option<NaiveDateTime>,
}

impl ExternalAppointmentRef {
    pub fn series(uid: impl Into<String>, sequence: u32) -> Self {
        Self {
            uid: uid.into(),
            sequence,
            recurrence_id: None,
        }
    }

    #[must_use]
    pub fn occurrence(&self, recurrence_id: NaiveDateTime) -> Self {
        Self {
            uid: self.uid.clone(),
            sequence: self.sequence,
            recurrence_id: Some(recurrence_id),
        }
    }
}
