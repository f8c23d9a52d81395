//! Collaborator contracts: storage, external calendar, notification transport
//! and building timezones. Everything the core does not own sits behind one of
//! these traits; [`crate::memory`] has in-memory implementations.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CalendarError, NotificationError, RepositoryError};
use crate::model::{
    ConferenceId, ExternalAppointmentRef, Reservable, ReservationId, ReservationOccurrence,
    Series, SeriesId,
};
use crate::payload::CalendarPayload;

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

pub trait ReservationRepository {
    fn occurrence(&self, id: ReservationId) -> Result<Option<ReservationOccurrence>, RepositoryError>;

    /// Every occurrence of a series, any status, ordered by index.
    fn series_occurrences(
        &self,
        series_id: SeriesId,
        range: Option<DateRange>,
    ) -> Result<Vec<ReservationOccurrence>, RepositoryError>;

    fn by_external_uid(&self, uid: &str) -> Result<Vec<ReservationOccurrence>, RepositoryError>;

    /// Every occurrence of every room of a conference call, any status.
    fn conference_members(
        &self,
        conference_id: ConferenceId,
    ) -> Result<Vec<ReservationOccurrence>, RepositoryError>;

    /// Active occurrences holding an allocation on `reservable` within `range`.
    fn allocated_on(
        &self,
        reservable: &Reservable,
        range: DateRange,
    ) -> Result<Vec<ReservationOccurrence>, RepositoryError>;

    fn series(&self, id: SeriesId) -> Result<Option<Series>, RepositoryError>;

    fn next_series_id(&mut self) -> Result<SeriesId, RepositoryError>;

    fn next_conference_id(&mut self) -> Result<ConferenceId, RepositoryError>;

    fn save_series(&mut self, series: Series) -> Result<(), RepositoryError>;

    /// Insert or update. Assigns an id when the occurrence has none.
    fn save(&mut self, occurrence: ReservationOccurrence) -> Result<ReservationOccurrence, RepositoryError>;

    /// Status change only; occurrences are never deleted.
    fn cancel(&mut self, id: ReservationId) -> Result<ReservationOccurrence, RepositoryError>;
}

/// The external appointment system the bookings are projected onto.
///
/// Occurrence-level calls address one instance through
/// [`ExternalAppointmentRef::recurrence_id`].
pub trait ExternalCalendarService {
    fn create_appointment(
        &mut self,
        payload: &CalendarPayload,
    ) -> Result<ExternalAppointmentRef, CalendarError>;

    fn update_appointment(
        &mut self,
        appointment: &ExternalAppointmentRef,
        payload: &CalendarPayload,
    ) -> Result<(), CalendarError>;

    fn update_appointment_occurrence(
        &mut self,
        appointment: &ExternalAppointmentRef,
        payload: &CalendarPayload,
    ) -> Result<(), CalendarError>;

    /// `deviations` carries one override per occurrence that no longer matches
    /// the series template.
    fn update_appointment_series(
        &mut self,
        appointment: &ExternalAppointmentRef,
        payload: &CalendarPayload,
        deviations: Option<&CalendarPayload>,
    ) -> Result<(), CalendarError>;

    fn cancel_appointment(&mut self, appointment: &ExternalAppointmentRef) -> Result<(), CalendarError>;

    fn cancel_appointment_occurrence(
        &mut self,
        appointment: &ExternalAppointmentRef,
    ) -> Result<(), CalendarError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A rendered outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

pub trait NotificationDispatcher {
    fn send(&mut self, notification: Notification) -> Result<(), NotificationError>;

    /// Queue many messages as one deferred job.
    fn send_deferred(&mut self, job: Vec<Notification>) -> Result<(), NotificationError>;
}

/// Maps a building to its IANA timezone identifier.
pub trait BuildingTimeZoneLookup: Send + Sync {
    fn timezone_id(&self, building_id: &str) -> Option<String>;
}
