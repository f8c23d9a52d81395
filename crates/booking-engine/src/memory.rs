//! In-memory collaborators for tests and the CLI.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::error::{CalendarError, NotificationError, RepositoryError};
use crate::model::{
    ConferenceId, ExternalAppointmentRef, Reservable, ReservationId, ReservationOccurrence,
    Series, SeriesId,
};
use crate::payload::CalendarPayload;
use crate::ports::{
    BuildingTimeZoneLookup, DateRange, ExternalCalendarService, Notification,
    NotificationDispatcher, ReservationRepository,
};

#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    occurrences: BTreeMap<ReservationId, ReservationOccurrence>,
    series: BTreeMap<SeriesId, Series>,
    last_reservation: u64,
    last_series: u64,
    last_conference: u64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored occurrence, ordered by id.
    pub fn all(&self) -> Vec<&ReservationOccurrence> {
        self.occurrences.values().collect()
    }

    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }
}

impl ReservationRepository for InMemoryRepository {
    fn occurrence(&self, id: ReservationId) -> Result<Option<ReservationOccurrence>, RepositoryError> {
        Ok(self.occurrences.get(&id).cloned())
    }

    fn series_occurrences(
        &self,
        series_id: SeriesId,
        range: Option<DateRange>,
    ) -> Result<Vec<ReservationOccurrence>, RepositoryError> {
        let mut found: Vec<ReservationOccurrence> = self
            .occurrences
            .values()
            .filter(|o| o.series_id == Some(series_id))
            .filter(|o| range.is_none_or(|r| r.contains(o.date())))
            .cloned()
            .collect();
        found.sort_by_key(|o| (o.occurrence_index, o.id));
        Ok(found)
    }

    fn by_external_uid(&self, uid: &str) -> Result<Vec<ReservationOccurrence>, RepositoryError> {
        Ok(self
            .occurrences
            .values()
            .filter(|o| o.external_uid.as_deref() == Some(uid))
            .cloned()
            .collect())
    }

    fn conference_members(
        &self,
        conference_id: ConferenceId,
    ) -> Result<Vec<ReservationOccurrence>, RepositoryError> {
        let mut found: Vec<ReservationOccurrence> = self
            .occurrences
            .values()
            .filter(|o| o.conference_id == Some(conference_id))
            .cloned()
            .collect();
        found.sort_by_key(|o| (o.occurrence_index, o.id));
        Ok(found)
    }

    fn allocated_on(
        &self,
        reservable: &Reservable,
        range: DateRange,
    ) -> Result<Vec<ReservationOccurrence>, RepositoryError> {
        Ok(self
            .occurrences
            .values()
            .filter(|o| o.is_active() && range.contains(o.date()))
            .filter(|o| {
                o.allocation
                    .as_ref()
                    .is_some_and(|allocation| &allocation.reservable == reservable)
            })
            .cloned()
            .collect())
    }

    fn series(&self, id: SeriesId) -> Result<Option<Series>, RepositoryError> {
        Ok(self.series.get(&id).cloned())
    }

    fn next_series_id(&mut self) -> Result<SeriesId, RepositoryError> {
        self.last_series += 1;
        Ok(SeriesId(self.last_series))
    }

    fn next_conference_id(&mut self) -> Result<ConferenceId, RepositoryError> {
        self.last_conference += 1;
        Ok(ConferenceId(self.last_conference))
    }

    fn save_series(&mut self, series: Series) -> Result<(), RepositoryError> {
        self.series.insert(series.id, series);
        Ok(())
    }

    fn save(
        &mut self,
        mut occurrence: ReservationOccurrence,
    ) -> Result<ReservationOccurrence, RepositoryError> {
        let id = match occurrence.id {
            Some(id) => id,
            None => {
                self.last_reservation += 1;
                ReservationId(self.last_reservation)
            }
        };
        occurrence.id = Some(id);
        self.occurrences.insert(id, occurrence.clone());
        Ok(occurrence)
    }

    fn cancel(&mut self, id: ReservationId) -> Result<ReservationOccurrence, RepositoryError> {
        let occurrence = self
            .occurrences
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("reservation {id}")))?;
        occurrence.status = crate::model::OccurrenceStatus::Cancelled;
        occurrence.allocation = None;
        Ok(occurrence.clone())
    }
}

/// One call received by [`RecordingCalendar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarCall {
    Create {
        uid: String,
    },
    Update {
        uid: String,
        sequence: u32,
    },
    UpdateOccurrence {
        uid: String,
        recurrence_id: Option<NaiveDateTime>,
    },
    UpdateSeries {
        uid: String,
        sequence: u32,
        deviations: usize,
    },
    Cancel {
        uid: String,
    },
    CancelOccurrence {
        uid: String,
        recurrence_id: Option<NaiveDateTime>,
    },
}

/// Calendar service that records every call and keeps a set of known UIDs.
/// Updating an unknown UID reports `SeriesNotFound`.
#[derive(Debug, Default)]
pub struct RecordingCalendar {
    pub calls: Vec<CalendarCall>,
    pub payloads: Vec<CalendarPayload>,
    known: HashSet<String>,
    fail_next: Option<CalendarError>,
}

impl RecordingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knows(&self, uid: &str) -> bool {
        self.known.contains(uid)
    }

    /// Drop a UID as if it had been deleted on the external side.
    pub fn forget(&mut self, uid: &str) {
        self.known.remove(uid);
    }

    /// Fail the next call with `error`.
    pub fn fail_next(&mut self, error: CalendarError) {
        self.fail_next = Some(error);
    }

    fn check(&mut self, uid: &str) -> Result<(), CalendarError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        if self.known.contains(uid) {
            Ok(())
        } else {
            Err(CalendarError::SeriesNotFound(uid.to_string()))
        }
    }
}

impl ExternalCalendarService for RecordingCalendar {
    fn create_appointment(
        &mut self,
        payload: &CalendarPayload,
    ) -> Result<ExternalAppointmentRef, CalendarError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        let entry = payload
            .entries
            .first()
            .ok_or_else(|| CalendarError::Service("payload has no events".to_string()))?;
        self.known.insert(entry.uid.clone());
        self.calls.push(CalendarCall::Create {
            uid: entry.uid.clone(),
        });
        self.payloads.push(payload.clone());
        Ok(ExternalAppointmentRef::series(entry.uid.clone(), entry.sequence))
    }

    fn update_appointment(
        &mut self,
        appointment: &ExternalAppointmentRef,
        payload: &CalendarPayload,
    ) -> Result<(), CalendarError> {
        self.check(&appointment.uid)?;
        self.calls.push(CalendarCall::Update {
            uid: appointment.uid.clone(),
            sequence: appointment.sequence,
        });
        self.payloads.push(payload.clone());
        Ok(())
    }

    fn update_appointment_occurrence(
        &mut self,
        appointment: &ExternalAppointmentRef,
        payload: &CalendarPayload,
    ) -> Result<(), CalendarError> {
        self.check(&appointment.uid)?;
        self.calls.push(CalendarCall::UpdateOccurrence {
            uid: appointment.uid.clone(),
            recurrence_id: appointment.recurrence_id,
        });
        self.payloads.push(payload.clone());
        Ok(())
    }

    fn update_appointment_series(
        &mut self,
        appointment: &ExternalAppointmentRef,
        payload: &CalendarPayload,
        deviations: Option<&CalendarPayload>,
    ) -> Result<(), CalendarError> {
        self.check(&appointment.uid)?;
        self.calls.push(CalendarCall::UpdateSeries {
            uid: appointment.uid.clone(),
            sequence: appointment.sequence,
            deviations: deviations.map_or(0, |d| d.entries.len()),
        });
        self.payloads.push(payload.clone());
        Ok(())
    }

    fn cancel_appointment(&mut self, appointment: &ExternalAppointmentRef) -> Result<(), CalendarError> {
        self.check(&appointment.uid)?;
        self.known.remove(&appointment.uid);
        self.calls.push(CalendarCall::Cancel {
            uid: appointment.uid.clone(),
        });
        Ok(())
    }

    fn cancel_appointment_occurrence(
        &mut self,
        appointment: &ExternalAppointmentRef,
    ) -> Result<(), CalendarError> {
        self.check(&appointment.uid)?;
        self.calls.push(CalendarCall::CancelOccurrence {
            uid: appointment.uid.clone(),
            recurrence_id: appointment.recurrence_id,
        });
        Ok(())
    }
}

/// Keeps every message instead of sending it.
#[derive(Debug, Default)]
pub struct CollectingDispatcher {
    pub sent: Vec<Notification>,
    pub jobs: Vec<Vec<Notification>>,
}

impl CollectingDispatcher {
    /// Messages sent directly plus those inside deferred jobs.
    pub fn total(&self) -> usize {
        self.sent.len() + self.jobs.iter().map(Vec::len).sum::<usize>()
    }
}

impl NotificationDispatcher for CollectingDispatcher {
    fn send(&mut self, notification: Notification) -> Result<(), NotificationError> {
        self.sent.push(notification);
        Ok(())
    }

    fn send_deferred(&mut self, job: Vec<Notification>) -> Result<(), NotificationError> {
        self.jobs.push(job);
        Ok(())
    }
}

/// Fixed building → timezone table.
#[derive(Debug, Clone, Default)]
pub struct StaticTimeZones {
    zones: HashMap<String, String>,
}

impl StaticTimeZones {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, building_id: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.zones.insert(building_id.into(), timezone.into());
        self
    }
}

impl BuildingTimeZoneLookup for StaticTimeZones {
    fn timezone_id(&self, building_id: &str) -> Option<String> {
        self.zones.get(building_id).cloned()
    }
}
