//! Projection of booking groups onto the external calendar service.
//!
//! An [`AppointmentGroup`] (a conference call, a series, or one standalone
//! occurrence) is either [`LinkState::NotLinked`] or linked to exactly one
//! external appointment. Every successful transition stores a higher
//! sequence number on the members.
//!
//! Calendar failures never roll a booking back. They are reported as
//! warnings, with one exception: when the external side no longer knows a
//! series during an occurrence or series update, the series is rebuilt from
//! the occurrences that survive locally.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::datelist::DateListGenerator;
use crate::error::{BookingError, CalendarError, Result};
use crate::model::{
    ExternalAppointmentRef, Reservable, ReservationOccurrence, Series, SeriesId,
};
use crate::outcome::Warning;
use crate::payload::{derive_uid, CalendarPayload, Method, PayloadBuilder, SeriesPayload, Slot};
use crate::pattern::RecurrencePattern;
use crate::ports::{ExternalCalendarService, ReservationRepository};

/// Every occurrence projected onto one external appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentGroup {
    pub pattern: Option<RecurrencePattern>,
    pub members: Vec<ReservationOccurrence>,
}

impl AppointmentGroup {
    /// The conference call, series or standalone booking `occurrence`
    /// belongs to.
    ///
    /// # Errors
    /// `SeriesNotFound` for a dangling series id, plus repository errors.
    pub fn load<R: ReservationRepository + ?Sized>(
        repo: &R,
        occurrence: &ReservationOccurrence,
    ) -> Result<Self> {
        let pattern = match occurrence.series_id {
            Some(series_id) => Some(
                repo.series(series_id)?
                    .ok_or(BookingError::SeriesNotFound(series_id))?
                    .pattern,
            ),
            None => None,
        };
        let members = match (occurrence.conference_id, occurrence.series_id) {
            (Some(conference_id), _) => repo.conference_members(conference_id)?,
            (None, Some(series_id)) => repo.series_occurrences(series_id, None)?,
            (None, None) => vec![occurrence.clone()],
        };
        Ok(Self { pattern, members })
    }

    pub fn slots(&self) -> Vec<Slot> {
        Slot::collect(&self.members)
    }

    pub fn has_active(&self) -> bool {
        self.members.iter().any(ReservationOccurrence::is_active)
    }

    /// Highest sequence number stored on any member.
    pub fn sequence(&self) -> u32 {
        self.members
            .iter()
            .map(|m| m.external_sequence)
            .max()
            .unwrap_or(0)
    }

    /// Stored external UID, else the one derived from the lowest-id regular
    /// member.
    pub fn uid(&self) -> String {
        if let Some(uid) = self.members.iter().find_map(|m| m.external_uid.clone()) {
            return uid;
        }
        self.members
            .iter()
            .filter(|m| !m.is_exception)
            .min_by_key(|m| m.id)
            .or_else(|| self.members.iter().min_by_key(|m| m.id))
            .map_or_else(|| "reservation-new".to_string(), derive_uid)
    }

    /// A UID alone is not a link: a caller may pre-assign one before the
    /// appointment exists. Linked groups have sent at least one sequence.
    pub fn link(&self) -> LinkState {
        let sequence = self.sequence();
        match self.members.iter().find_map(|m| m.external_uid.as_deref()) {
            Some(uid) if sequence > 0 => {
                LinkState::Linked(ExternalAppointmentRef::series(uid, sequence))
            }
            _ => LinkState::NotLinked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    NotLinked,
    Linked(ExternalAppointmentRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Create,
    /// Replace a standalone appointment.
    UpdateInPlace,
    UpdateOccurrence { index: u32 },
    UpdateSeries,
    Cancel,
    CancelOccurrence { index: u32 },
    /// Forget the link without telling the external side.
    Disconnect,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Payload the external side accepted.
    pub payload: Option<CalendarPayload>,
    pub link: Option<ExternalAppointmentRef>,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone)]
pub struct CalendarSyncAdapter {
    generator: DateListGenerator,
    builder: PayloadBuilder,
}

impl CalendarSyncAdapter {
    pub fn new(generator: DateListGenerator, builder: PayloadBuilder) -> Self {
        Self { generator, builder }
    }

    pub fn builder(&self) -> &PayloadBuilder {
        &self.builder
    }

    /// The payload `action` would send, without calling the service.
    ///
    /// # Errors
    /// Propagates date generation and rule translation errors.
    pub fn prepare(
        &self,
        group: &AppointmentGroup,
        action: SyncAction,
    ) -> Result<Option<CalendarPayload>> {
        let uid = group.uid();
        let sequence = group.sequence() + 1;
        let slots = group.slots();
        match action {
            SyncAction::Disconnect => Ok(None),
            SyncAction::Create | SyncAction::UpdateInPlace | SyncAction::UpdateSeries => Ok(self
                .whole(group, &uid, sequence, &slots)?
                .map(|built| built.series)),
            SyncAction::UpdateOccurrence { index } => {
                let Some(slot) = slots.iter().find(|s| s.index == index) else {
                    return Ok(None);
                };
                let recurrence_id = self.recurrence_id(group, &slots, index)?;
                Ok(Some(self.builder.single(&uid, sequence, recurrence_id, slot)))
            }
            SyncAction::Cancel => Ok(slots
                .first()
                .map(|slot| self.builder.cancellation(&uid, sequence, None, slot))),
            SyncAction::CancelOccurrence { index } => {
                let Some(slot) = slots.iter().find(|s| s.index == index) else {
                    return Ok(None);
                };
                let recurrence_id = self.recurrence_id(group, &slots, index)?;
                Ok(Some(self.builder.cancellation(&uid, sequence, recurrence_id, slot)))
            }
        }
    }

    /// Apply `action` to the external calendar and record the new link state
    /// on the group's members.
    ///
    /// # Errors
    /// Only repository failures and payload construction errors. Calendar
    /// errors are returned as warnings in the report.
    pub fn sync<C, R>(
        &self,
        service: &mut C,
        repo: &mut R,
        group: &AppointmentGroup,
        action: SyncAction,
    ) -> Result<SyncReport>
    where
        C: ExternalCalendarService + ?Sized,
        R: ReservationRepository + ?Sized,
    {
        let mut report = SyncReport::default();
        let reference = match (group.link(), action) {
            (
                LinkState::NotLinked,
                SyncAction::Cancel | SyncAction::CancelOccurrence { .. } | SyncAction::Disconnect,
            ) => {
                debug!(?action, "group is not linked, nothing to send");
                return Ok(report);
            }
            (LinkState::NotLinked, _) => {
                return self.create(service, repo, group, &group.uid(), group.sequence() + 1);
            }
            (LinkState::Linked(reference), _) => reference,
        };

        let sequence = reference.sequence + 1;
        let current = ExternalAppointmentRef::series(reference.uid.clone(), sequence);
        let uid = reference.uid.as_str();
        let slots = group.slots();

        let sent: std::result::Result<Option<CalendarPayload>, CalendarError> = match action {
            SyncAction::Disconnect => {
                store_link(repo, &group.members, None, 0)?;
                info!(uid, "calendar link removed");
                return Ok(report);
            }
            SyncAction::Create | SyncAction::UpdateSeries | SyncAction::UpdateInPlace => {
                let Some(built) = self.whole(group, uid, sequence, &slots)? else {
                    return Ok(report);
                };
                let result = if group.pattern.is_some() && action != SyncAction::UpdateInPlace {
                    service.update_appointment_series(&current, &built.series, built.deviations.as_ref())
                } else {
                    service.update_appointment(&current, &built.series)
                };
                result.map(|()| Some(built.series))
            }
            SyncAction::UpdateOccurrence { index } => {
                let Some(slot) = slots.iter().find(|s| s.index == index) else {
                    return Ok(report);
                };
                match self.recurrence_id(group, &slots, index)? {
                    Some(recurrence_id) => {
                        let payload = self.builder.single(uid, sequence, Some(recurrence_id), slot);
                        service
                            .update_appointment_occurrence(&current.occurrence(recurrence_id), &payload)
                            .map(|()| Some(payload))
                    }
                    None => {
                        let payload = self.builder.single(uid, sequence, None, slot);
                        service
                            .update_appointment(&current, &payload)
                            .map(|()| Some(payload))
                    }
                }
            }
            SyncAction::Cancel => {
                let Some(slot) = slots.first() else {
                    return Ok(report);
                };
                let payload = self.builder.cancellation(uid, sequence, None, slot);
                service.cancel_appointment(&current).map(|()| Some(payload))
            }
            SyncAction::CancelOccurrence { index } => {
                let Some(slot) = slots.iter().find(|s| s.index == index) else {
                    return Ok(report);
                };
                let recurrence_id = self.recurrence_id(group, &slots, index)?;
                let payload = self.builder.cancellation(uid, sequence, recurrence_id, slot);
                let result = match recurrence_id {
                    Some(recurrence_id) => {
                        service.cancel_appointment_occurrence(&current.occurrence(recurrence_id))
                    }
                    None => service.cancel_appointment(&current),
                };
                result.map(|()| Some(payload))
            }
        };

        match sent {
            Ok(payload) => {
                store_link(repo, &group.members, Some(uid), sequence)?;
                info!(uid, sequence, ?action, "calendar updated");
                report.payload = payload;
                report.link = Some(current);
            }
            Err(CalendarError::SeriesNotFound(_))
                if group.pattern.is_some()
                    && matches!(
                        action,
                        SyncAction::UpdateSeries | SyncAction::UpdateOccurrence { .. }
                    ) =>
            {
                return self.recreate(service, repo, group, uid);
            }
            Err(err) => report.warnings.push(calendar_warning(&err)),
        }
        Ok(report)
    }

    fn create<C, R>(
        &self,
        service: &mut C,
        repo: &mut R,
        group: &AppointmentGroup,
        uid: &str,
        sequence: u32,
    ) -> Result<SyncReport>
    where
        C: ExternalCalendarService + ?Sized,
        R: ReservationRepository + ?Sized,
    {
        let mut report = SyncReport::default();
        let slots = group.slots();
        let Some(built) = self.whole(group, uid, sequence, &slots)? else {
            return Ok(report);
        };
        match service.create_appointment(&built.series) {
            Ok(reference) => {
                if let Some(deviations) = built.deviations.as_ref() {
                    if let Err(err) =
                        service.update_appointment_series(&reference, &built.series, Some(deviations))
                    {
                        report.warnings.push(calendar_warning(&err));
                    }
                }
                store_link(repo, &group.members, Some(&reference.uid), reference.sequence)?;
                info!(uid = %reference.uid, "calendar appointment created");
                report.link = Some(reference);
                report.payload = Some(built.series);
            }
            Err(err) => report.warnings.push(calendar_warning(&err)),
        }
        Ok(report)
    }

    /// Rebuild a series the external side lost. One surviving index is
    /// detached into a standalone booking; otherwise every room moves to a
    /// new series anchored at the first survivor and renumbered from 1.
    fn recreate<C, R>(
        &self,
        service: &mut C,
        repo: &mut R,
        group: &AppointmentGroup,
        previous_uid: &str,
    ) -> Result<SyncReport>
    where
        C: ExternalCalendarService + ?Sized,
        R: ReservationRepository + ?Sized,
    {
        let mut report = SyncReport::default();
        let survivors: BTreeSet<u32> = group
            .members
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.occurrence_index)
            .collect();
        let (Some(&first_index), Some(pattern)) = (survivors.first(), group.pattern.as_ref()) else {
            report.warnings.push(Warning::Calendar {
                message: format!("series {previous_uid} was not found and has no surviving occurrence"),
            });
            return Ok(report);
        };

        let mut members = Vec::new();
        let rebuilt_pattern = if survivors.len() == 1 {
            for member in group.members.iter().filter(|m| m.is_active()) {
                let mut detached = member.clone();
                detached.series_id = None;
                detached.occurrence_index = 1;
                detached.is_exception = false;
                detached.external_uid = None;
                detached.external_sequence = 0;
                members.push(repo.save(detached)?);
            }
            None
        } else {
            let first_date = self
                .generator
                .generate_indexed(pattern, 1)?
                .into_iter()
                .find(|(index, _)| *index == first_index)
                .map(|(_, date)| date)
                .or_else(|| {
                    group
                        .members
                        .iter()
                        .find(|m| m.is_active() && m.occurrence_index == first_index)
                        .map(ReservationOccurrence::date)
                })
                .ok_or(BookingError::PatternEmpty)?;
            let rebased = pattern.starting_at(first_date, first_index - 1);

            let mut series_ids: BTreeMap<Reservable, SeriesId> = BTreeMap::new();
            for member in group.members.iter().filter(|m| m.occurrence_index >= first_index) {
                let series_id = match series_ids.get(&member.reservable) {
                    Some(id) => *id,
                    None => {
                        let id = repo.next_series_id()?;
                        repo.save_series(Series {
                            id,
                            pattern: rebased.clone(),
                            conference_id: member.conference_id,
                        })?;
                        series_ids.insert(member.reservable.clone(), id);
                        id
                    }
                };
                let mut moved = member.clone();
                moved.series_id = Some(series_id);
                moved.occurrence_index = member.occurrence_index - first_index + 1;
                moved.external_uid = None;
                moved.external_sequence = 0;
                members.push(repo.save(moved)?);
            }
            Some(rebased)
        };

        let rebuilt = AppointmentGroup {
            pattern: rebuilt_pattern,
            members,
        };
        let uid = Uuid::new_v4().to_string();
        let slots = rebuilt.slots();
        let Some(built) = self.whole(&rebuilt, &uid, 1, &slots)? else {
            return Ok(report);
        };

        // The series goes out bare; gaps and deviations are replayed per
        // occurrence against the new appointment.
        let mut bare = built.series.clone();
        let exdates: Vec<NaiveDateTime> = bare
            .entries
            .iter_mut()
            .flat_map(|entry| std::mem::take(&mut entry.exdates))
            .collect();
        let reference = match service.create_appointment(&bare) {
            Ok(reference) => reference,
            Err(err) => {
                report.warnings.push(calendar_warning(&err));
                return Ok(report);
            }
        };
        for exdate in exdates {
            if let Err(err) = service.cancel_appointment_occurrence(&reference.occurrence(exdate)) {
                report.warnings.push(calendar_warning(&err));
            }
        }
        for entry in built.deviations.into_iter().flat_map(|d| d.entries) {
            let Some(recurrence_id) = entry.recurrence_id else {
                continue;
            };
            let single = CalendarPayload {
                method: Method::Request,
                organizer: bare.organizer.clone(),
                entries: vec![entry],
            };
            if let Err(err) =
                service.update_appointment_occurrence(&reference.occurrence(recurrence_id), &single)
            {
                report.warnings.push(calendar_warning(&err));
            }
        }

        store_link(repo, &rebuilt.members, Some(&reference.uid), reference.sequence)?;
        info!(
            previous_uid,
            uid = %reference.uid,
            occurrences = survivors.len(),
            "recreated calendar series"
        );
        report.warnings.push(Warning::SeriesRecreated {
            previous_uid: previous_uid.to_string(),
            uid: reference.uid.clone(),
            occurrences: survivors.len(),
        });
        report.link = Some(reference);
        report.payload = Some(built.series);
        Ok(report)
    }

    /// Payload for the whole group: a series when there is a pattern, else
    /// one event for the first surviving slot. `None` once nothing survives.
    fn whole(
        &self,
        group: &AppointmentGroup,
        uid: &str,
        sequence: u32,
        slots: &[Slot],
    ) -> Result<Option<SeriesPayload>> {
        let Some(lead) = slots.iter().find(|s| !s.cancelled) else {
            return Ok(None);
        };
        match group.pattern.as_ref() {
            Some(pattern) => self.builder.series(uid, sequence, pattern, slots).map(Some),
            None => Ok(Some(SeriesPayload {
                series: self.builder.single(uid, sequence, None, lead),
                deviations: None,
            })),
        }
    }

    fn recurrence_id(
        &self,
        group: &AppointmentGroup,
        slots: &[Slot],
        index: u32,
    ) -> Result<Option<NaiveDateTime>> {
        let template = slots
            .iter()
            .filter(|s| !s.cancelled)
            .min_by_key(|s| (s.is_exception, s.index));
        match (group.pattern.as_ref(), template) {
            (Some(pattern), Some(template)) => {
                let pattern = self.builder.aligned(pattern, slots);
                self.builder.original_start(&pattern, &template.period, index)
            }
            _ => Ok(None),
        }
    }
}

fn store_link<R: ReservationRepository + ?Sized>(
    repo: &mut R,
    members: &[ReservationOccurrence],
    uid: Option<&str>,
    sequence: u32,
) -> Result<()> {
    for member in members {
        if member.external_uid.as_deref() == uid && member.external_sequence == sequence {
            continue;
        }
        let mut linked = member.clone();
        linked.external_uid = uid.map(str::to_string);
        linked.external_sequence = sequence;
        repo.save(linked)?;
    }
    Ok(())
}

fn calendar_warning(err: &CalendarError) -> Warning {
    Warning::Calendar {
        message: err.to_string(),
    }
}
