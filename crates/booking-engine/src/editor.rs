//! The reservation editor: one entry point composing reconciliation,
//! conference coordination, calendar sync and notifications.
//!
//! Policies are injected through [`EngineConfig`]; the collaborators are
//! generic so tests can plug in the in-memory versions from
//! [`crate::memory`].

use chrono::{NaiveDateTime, Utc};
use tracing::{debug, info};

use crate::batch::BatchScope;
use crate::conference::{ConferenceCallCoordinator, ConferenceEdit};
use crate::config::EngineConfig;
use crate::conflict::ConflictEvaluator;
use crate::datelist::DateListGenerator;
use crate::error::{BookingError, Result};
use crate::model::{Reservable, ReservationId, ReservationOccurrence};
use crate::outcome::{EditOutcome, Warning};
use crate::pattern::RecurrencePattern;
use crate::payload::{CalendarPayload, PayloadBuilder};
use crate::period::TimePeriod;
use crate::ports::{
    BuildingTimeZoneLookup, ExternalCalendarService, NotificationDispatcher, ReservationRepository,
};
use crate::reconcile::{EditScope, OccurrenceReconciler, OccurrenceTemplate, SeriesEdit};
use crate::sync::{AppointmentGroup, CalendarSyncAdapter, LinkState, SyncAction};
use crate::timezone::TimeZoneCache;

/// A booking as submitted by a user. Times are wall-clock in the timezone
/// of the first location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    /// The occurrence being edited; `None` books something new.
    pub reservation_id: Option<ReservationId>,
    pub scope: EditScope,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub subject: String,
    pub attendees: Vec<String>,
    pub comments: String,
    pub external_uid: Option<String>,
    pub pattern: Option<RecurrencePattern>,
    /// Two or more locations make a conference call.
    pub locations: Vec<Reservable>,
    pub requested_by: Option<String>,
}

pub struct ReservationEditor<R, C, N> {
    config: EngineConfig,
    reconciler: OccurrenceReconciler,
    coordinator: ConferenceCallCoordinator,
    sync: CalendarSyncAdapter,
    builder: PayloadBuilder,
    timezones: TimeZoneCache,
    repo: R,
    calendar: Option<C>,
    dispatcher: N,
}

impl<R, C, N> ReservationEditor<R, C, N>
where
    R: ReservationRepository,
    C: ExternalCalendarService,
    N: NotificationDispatcher,
{
    pub fn new(
        config: EngineConfig,
        repo: R,
        calendar: Option<C>,
        dispatcher: N,
        timezones: Box<dyn BuildingTimeZoneLookup>,
    ) -> Self {
        let generator = DateListGenerator::new(config.max_dates);
        let evaluator = ConflictEvaluator::new(config.conflict_policy, config.dst_policy);
        let reconciler = OccurrenceReconciler::new(generator, evaluator);
        let builder = PayloadBuilder::new(
            generator,
            config.dst_policy,
            config.product_id.clone(),
            config.organizer.clone(),
        );
        Self {
            reconciler,
            coordinator: ConferenceCallCoordinator::new(reconciler),
            sync: CalendarSyncAdapter::new(generator, builder.clone()),
            builder,
            timezones: TimeZoneCache::new(timezones, config.default_timezone),
            config,
            repo,
            calendar,
            dispatcher,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn repo_mut(&mut self) -> &mut R {
        &mut self.repo
    }

    pub fn calendar(&self) -> Option<&C> {
        self.calendar.as_ref()
    }

    pub fn calendar_mut(&mut self) -> Option<&mut C> {
        self.calendar.as_mut()
    }

    pub fn dispatcher(&self) -> &N {
        &self.dispatcher
    }

    pub fn timezones(&self) -> &TimeZoneCache {
        &self.timezones
    }

    /// Create or edit a booking, then project it onto the calendar and
    /// notify attendees through `batch`.
    ///
    /// # Errors
    /// Everything [`OccurrenceReconciler::reconcile`] and
    /// [`ConferenceCallCoordinator::edit`] return, plus `UnknownReservable`
    /// when no location is given. Calendar and notification failures are
    /// warnings.
    #[tracing::instrument(skip_all, fields(
        reservation = ?request.reservation_id,
        scope = ?request.scope,
        locations = request.locations.len()
    ))]
    pub fn submit(&mut self, request: &BookingRequest, batch: &mut BatchScope) -> Result<EditOutcome> {
        let Some(first) = request.locations.first() else {
            return Err(BookingError::UnknownReservable(
                "no location requested".to_string(),
            ));
        };
        let timezone = self.timezones.for_reservable(first);
        let template = OccurrenceTemplate {
            period: TimePeriod::new(request.start, request.end, timezone)?,
            subject: request.subject.clone(),
            attendees: request.attendees.clone(),
            comments: request.comments.clone(),
            external_uid: request.external_uid.clone(),
        };
        let edited = match request.reservation_id {
            Some(id) => Some(
                self.repo
                    .occurrence(id)?
                    .ok_or(BookingError::ReservationNotFound(id))?,
            ),
            None => None,
        };
        let edited_conference = edited.as_ref().and_then(|e| e.conference_id);

        let mut outcome = EditOutcome::default();
        let saved = if request.locations.len() >= 2 || edited_conference.is_some() {
            let edit = ConferenceEdit {
                reservation_id: request.reservation_id,
                locations: request.locations.clone(),
                template,
                pattern: request.pattern.clone(),
                scope: request.scope,
            };
            self.coordinator.edit(&mut self.repo, &edit, &mut outcome)?
        } else {
            let edit = SeriesEdit {
                reservation_id: request.reservation_id,
                reservable: first.clone(),
                template,
                pattern: request.pattern.clone(),
                scope: request.scope,
            };
            self.reconciler.reconcile(&mut self.repo, &edit, &mut outcome)?
        };
        info!(
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            cancelled = outcome.cancelled.len(),
            "booking saved"
        );
        if outcome.change_count() == 0 {
            return Ok(outcome);
        }

        let anchor_id = request
            .reservation_id
            .or_else(|| saved.iter().filter(|o| o.is_active()).find_map(|o| o.id))
            .or_else(|| saved.iter().find_map(|o| o.id));
        let Some(anchor_id) = anchor_id else {
            return Ok(outcome);
        };
        let anchor = self
            .repo
            .occurrence(anchor_id)?
            .ok_or(BookingError::ReservationNotFound(anchor_id))?;
        if let Some(previous) = edited.as_ref().filter(|e| e.series_id != anchor.series_id) {
            self.project_remainder(previous, request.requested_by.as_deref(), batch, &mut outcome)?;
        }

        let group = AppointmentGroup::load(&self.repo, &anchor)?;
        let action = match group.link() {
            LinkState::NotLinked => SyncAction::Create,
            LinkState::Linked(_) if group.pattern.is_none() => SyncAction::UpdateInPlace,
            LinkState::Linked(_) => match (request.scope, request.reservation_id) {
                (EditScope::Single, Some(_)) => SyncAction::UpdateOccurrence {
                    index: anchor.occurrence_index,
                },
                _ => SyncAction::UpdateSeries,
            },
        };
        self.project(&group, action, &anchor, request.requested_by.as_deref(), batch, &mut outcome)?;
        Ok(outcome)
    }

    /// Cancel many occurrences in one batch: every notification goes out as
    /// a single deferred job.
    ///
    /// # Errors
    /// `ReservationNotFound` for an unknown id, plus repository errors.
    /// Occurrences cancelled before the failure stay cancelled.
    #[tracing::instrument(skip_all, fields(count = ids.len()))]
    pub fn cancel(&mut self, ids: &[ReservationId], batch: &mut BatchScope) -> Result<EditOutcome> {
        let mut outcome = EditOutcome::default();
        batch.begin();
        let result = self.cancel_each(ids, batch, &mut outcome);
        let flushed = batch.flush(&mut self.dispatcher);
        result?;
        match flushed {
            Ok(count) => debug!(count, "cancellation notices queued"),
            Err(err) => outcome.warn(Warning::Notification {
                message: err.to_string(),
            }),
        }
        Ok(outcome)
    }

    fn cancel_each(
        &mut self,
        ids: &[ReservationId],
        batch: &mut BatchScope,
        outcome: &mut EditOutcome,
    ) -> Result<()> {
        for &id in ids {
            let occurrence = self
                .repo
                .occurrence(id)?
                .ok_or(BookingError::ReservationNotFound(id))?;
            if !occurrence.is_active() {
                debug!(%id, "already cancelled");
                continue;
            }
            let cancelled = self.repo.cancel(id)?;
            outcome.cancelled.push(id);
            info!(%id, index = cancelled.occurrence_index, "occurrence cancelled");

            let group = AppointmentGroup::load(&self.repo, &cancelled)?;
            let index = cancelled.occurrence_index;
            let index_survives = group
                .members
                .iter()
                .any(|m| m.is_active() && m.occurrence_index == index);
            let action = match (group.has_active(), index_survives, group.pattern.is_some()) {
                (false, _, _) => SyncAction::Cancel,
                (true, true, true) => SyncAction::UpdateOccurrence { index },
                (true, true, false) => SyncAction::UpdateInPlace,
                (true, false, true) => SyncAction::CancelOccurrence { index },
                (true, false, false) => SyncAction::Cancel,
            };
            self.project(&group, action, &cancelled, None, batch, outcome)?;
        }
        Ok(())
    }

    /// Change the location description of one occurrence, copy it to every
    /// room of the same conference call and push the result.
    ///
    /// # Errors
    /// `ReservationNotFound` for an unknown id, plus repository errors.
    #[tracing::instrument(skip(self, comments, batch))]
    pub fn edit_location_description(
        &mut self,
        reservation_id: ReservationId,
        comments: &str,
        scope: EditScope,
        batch: &mut BatchScope,
    ) -> Result<EditOutcome> {
        let mut outcome = EditOutcome::default();
        let changed = self.coordinator.edit_location_description(
            &mut self.repo,
            reservation_id,
            comments,
            scope,
            &mut outcome,
        )?;
        if changed.is_empty() {
            return Ok(outcome);
        }
        let anchor = self
            .repo
            .occurrence(reservation_id)?
            .ok_or(BookingError::ReservationNotFound(reservation_id))?;
        let group = AppointmentGroup::load(&self.repo, &anchor)?;
        let action = match (group.link(), group.pattern.is_some(), scope) {
            (LinkState::NotLinked, _, _) => SyncAction::Create,
            (_, false, _) => SyncAction::UpdateInPlace,
            (_, true, EditScope::Single) => SyncAction::UpdateOccurrence {
                index: anchor.occurrence_index,
            },
            (_, true, _) => SyncAction::UpdateSeries,
        };
        self.project(&group, action, &anchor, None, batch, &mut outcome)?;
        Ok(outcome)
    }

    /// Forget the external appointment of the group `reservation_id` belongs
    /// to. Bookings are untouched; the next edit creates a fresh appointment.
    ///
    /// # Errors
    /// `ReservationNotFound` for an unknown id, plus repository errors.
    #[tracing::instrument(skip(self))]
    pub fn disconnect_calendar(&mut self, reservation_id: ReservationId) -> Result<EditOutcome> {
        let mut outcome = EditOutcome::default();
        let occurrence = self
            .repo
            .occurrence(reservation_id)?
            .ok_or(BookingError::ReservationNotFound(reservation_id))?;
        let group = AppointmentGroup::load(&self.repo, &occurrence)?;
        if let Some(calendar) = self.calendar.as_mut() {
            let report = self
                .sync
                .sync(calendar, &mut self.repo, &group, SyncAction::Disconnect)?;
            outcome.extend_warnings(report.warnings);
        }
        Ok(outcome)
    }

    /// After a split, push the series the edited occurrence moved out of,
    /// now ending before it.
    fn project_remainder(
        &mut self,
        previous: &ReservationOccurrence,
        requested_by: Option<&str>,
        batch: &mut BatchScope,
        outcome: &mut EditOutcome,
    ) -> Result<()> {
        let Some(series_id) = previous.series_id else {
            return Ok(());
        };
        let remaining = self.repo.series_occurrences(series_id, None)?;
        let Some(member) = remaining
            .iter()
            .filter(|m| m.is_active())
            .min_by_key(|m| m.occurrence_index)
            .or_else(|| remaining.first())
        else {
            return Ok(());
        };
        let group = AppointmentGroup::load(&self.repo, member)?;
        let action = match group.link() {
            LinkState::NotLinked => return Ok(()),
            LinkState::Linked(_) => SyncAction::UpdateSeries,
        };
        info!(%series_id, "series split, updating the earlier part");
        self.project(&group, action, member, requested_by, batch, outcome)
    }

    /// Push `action` to the calendar (when enabled) and queue the attendee
    /// notification for the resulting payload.
    fn project(
        &mut self,
        group: &AppointmentGroup,
        action: SyncAction,
        anchor: &ReservationOccurrence,
        requested_by: Option<&str>,
        batch: &mut BatchScope,
        outcome: &mut EditOutcome,
    ) -> Result<()> {
        let prepared = self.sync.prepare(group, action)?;
        let sent = match self.calendar.as_mut() {
            Some(calendar) if self.config.calendar_sync => {
                let report = self.sync.sync(calendar, &mut self.repo, group, action)?;
                outcome.extend_warnings(report.warnings);
                report.payload
            }
            _ => None,
        };
        let Some(payload) = sent.or(prepared) else {
            return Ok(());
        };
        self.notify(&payload, anchor, requested_by, batch, outcome);
        Ok(())
    }

    fn notify(
        &mut self,
        payload: &CalendarPayload,
        anchor: &ReservationOccurrence,
        requested_by: Option<&str>,
        batch: &mut BatchScope,
        outcome: &mut EditOutcome,
    ) {
        let Some(reservation_id) = anchor.id else {
            return;
        };
        let notification = self
            .builder
            .notification(payload, reservation_id, requested_by, Utc::now());
        if notification.recipients.is_empty() {
            debug!(%reservation_id, "no attendees to notify");
            return;
        }
        if let Err(err) = batch.dispatch(&mut self.dispatcher, notification) {
            outcome.warn(Warning::Notification {
                message: err.to_string(),
            });
        }
    }
}

impl<R, C, N> std::fmt::Debug for ReservationEditor<R, C, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationEditor")
            .field("config", &self.config)
            .field("timezones", &self.timezones)
            .field("calendar", &self.calendar.is_some())
            .finish_non_exhaustive()
    }
}
