//! Conference calls: one meeting booking two or more rooms at once.
//!
//! Every room holds its own series under a shared conference id. An edit
//! computes the desired state once, from the room the user edited, and diffs
//! each requested room against it, so all rooms at one occurrence index end
//! up with the same period, subject and comments. Rooms dropped from the
//! submission are cancelled occurrence by occurrence within the edit's scope.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BookingError, Result};
use crate::model::{
    ConferenceId, OccurrenceStatus, Reservable, ReservationId, ReservationOccurrence,
};
use crate::outcome::{EditOutcome, Warning};
use crate::pattern::RecurrencePattern;
use crate::period::TimePeriod;
use crate::ports::ReservationRepository;
use crate::reconcile::{
    check_duplicate_creation, series_record, DesiredState, EditScope, OccurrenceReconciler,
    OccurrenceTemplate, SeriesContext,
};

/// A whole-group edit: every location is resubmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceEdit {
    pub reservation_id: Option<ReservationId>,
    pub locations: Vec<Reservable>,
    pub template: OccurrenceTemplate,
    pub pattern: Option<RecurrencePattern>,
    pub scope: EditScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOccurrenceState {
    Confirmed,
    /// At least one room could not be allocated.
    RoomConflictInConferenceCall,
    Cancelled,
}

/// Every room booked at one occurrence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceOccurrence {
    pub index: u32,
    pub period: TimePeriod,
    /// Lowest surviving reservation id.
    pub primary: Option<ReservationId>,
    pub members: Vec<ReservationOccurrence>,
    pub state: GroupOccurrenceState,
}

impl ConferenceOccurrence {
    pub fn active(&self) -> impl Iterator<Item = &ReservationOccurrence> {
        self.members.iter().filter(|m| m.is_active())
    }

    pub fn rooms(&self) -> Vec<&Reservable> {
        self.active().map(|m| &m.reservable).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceCallGroup {
    pub conference_id: ConferenceId,
    /// Primary of the first surviving occurrence.
    pub primary: Option<ReservationId>,
    pub occurrences: Vec<ConferenceOccurrence>,
}

impl ConferenceCallGroup {
    pub fn from_members(conference_id: ConferenceId, members: Vec<ReservationOccurrence>) -> Self {
        let mut by_index: BTreeMap<u32, Vec<ReservationOccurrence>> = BTreeMap::new();
        for member in members {
            by_index.entry(member.occurrence_index).or_default().push(member);
        }

        let occurrences: Vec<ConferenceOccurrence> = by_index
            .into_iter()
            .filter_map(|(index, mut members)| {
                members.sort_by_key(|m| (!m.is_active(), m.id));
                let lead = members.first()?;
                let period = lead.period;
                let primary = lead.is_active().then_some(lead.id).flatten();
                let state = if primary.is_none() {
                    GroupOccurrenceState::Cancelled
                } else if members.iter().any(|m| m.status == OccurrenceStatus::Conflict) {
                    GroupOccurrenceState::RoomConflictInConferenceCall
                } else {
                    GroupOccurrenceState::Confirmed
                };
                Some(ConferenceOccurrence {
                    index,
                    period,
                    primary,
                    members,
                    state,
                })
            })
            .collect();

        let primary = occurrences.iter().find_map(|o| o.primary);
        Self {
            conference_id,
            primary,
            occurrences,
        }
    }

    pub fn occurrence(&self, index: u32) -> Option<&ConferenceOccurrence> {
        self.occurrences.iter().find(|o| o.index == index)
    }

    /// Every surviving index has one period, subject and comment text
    /// across its rooms.
    pub fn is_consistent(&self) -> bool {
        self.occurrences.iter().all(|occurrence| {
            let mut active = occurrence.active();
            let Some(first) = active.next() else {
                return true;
            };
            active.all(|m| {
                m.period == first.period && m.subject == first.subject && m.comments == first.comments
            })
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConferenceCallCoordinator {
    reconciler: OccurrenceReconciler,
}

impl ConferenceCallCoordinator {
    pub fn new(reconciler: OccurrenceReconciler) -> Self {
        Self { reconciler }
    }

    /// Reconcile every requested room against one desired state and cancel
    /// the in-scope occurrences of rooms no longer requested.
    ///
    /// # Errors
    /// `UnknownReservable` when no location is given, plus everything
    /// [`OccurrenceReconciler::reconcile`] can return.
    pub fn edit<R: ReservationRepository + ?Sized>(
        &self,
        repo: &mut R,
        edit: &ConferenceEdit,
        outcome: &mut EditOutcome,
    ) -> Result<Vec<ReservationOccurrence>> {
        let mut locations: Vec<Reservable> = Vec::with_capacity(edit.locations.len());
        for location in &edit.locations {
            if !locations.contains(location) {
                locations.push(location.clone());
            }
        }
        if locations.is_empty() {
            return Err(BookingError::UnknownReservable(
                "no location requested".to_string(),
            ));
        }

        let mut ctx = SeriesContext::load(repo, edit.reservation_id)?;
        let existing_conference = ctx.edited.as_ref().and_then(|e| e.conference_id);
        if let Some(conference_id) = existing_conference {
            ctx.existing = repo.conference_members(conference_id)?;
        }
        let mut by_room: BTreeMap<Reservable, Vec<ReservationOccurrence>> = BTreeMap::new();
        for member in &ctx.existing {
            by_room.entry(member.reservable.clone()).or_default().push(member.clone());
        }

        let desired = self.reconciler.desired_state(
            &edit.template,
            edit.pattern.as_ref(),
            edit.scope,
            &ctx,
        )?;
        // The part split off a series forms a conference call of its own.
        let conference_id = match existing_conference {
            Some(_) if desired.split_from.is_some() && locations.len() >= 2 => {
                Some(repo.next_conference_id()?)
            }
            Some(_) if desired.split_from.is_some() => None,
            Some(id) => Some(id),
            None if locations.len() >= 2 => Some(repo.next_conference_id()?),
            None => None,
        };
        let fallback = desired
            .pattern
            .clone()
            .or_else(|| ctx.series.as_ref().map(|s| s.pattern.clone()));
        debug!(
            ?conference_id,
            rooms = locations.len(),
            slots = desired.slots.len(),
            "editing conference call"
        );

        // Every room is planned and admitted before the first write, so a
        // rejected room leaves the group as it was.
        let mut plans = Vec::with_capacity(locations.len());
        for room in &locations {
            let existing = by_room.remove(room).unwrap_or_default();
            let new_room = existing.is_empty();
            if new_room && ctx.is_new() && edit.pattern.is_some() {
                check_duplicate_creation(repo, room, &edit.template)?;
            }
            let series = match existing.iter().find_map(|o| o.series_id) {
                Some(series_id) => repo.series(series_id)?,
                None => None,
            };
            let (series_id, records) =
                series_record(repo, series.as_ref(), &desired, fallback.as_ref(), conference_id)?;
            let plan = self.reconciler.plan(
                &desired,
                room,
                &existing,
                series_id,
                conference_id,
                new_room && ctx.is_new(),
                records,
            );
            self.reconciler.admit(&plan, &*repo)?;
            plans.push(plan);
        }

        let mut saved = Vec::new();
        for plan in plans {
            saved.extend(self.reconciler.apply(plan, repo, outcome)?);
        }

        for (room, members) in by_room {
            for member in members {
                if !member.is_active() || !desired.in_scope(member.occurrence_index) {
                    continue;
                }
                let Some(id) = member.id else { continue };
                info!(%room, index = member.occurrence_index, "room removed from conference call");
                saved.push(repo.cancel(id)?);
                outcome.cancelled.push(id);
            }
        }

        if let Some(conference_id) = conference_id {
            self.flag_conflicts(repo, conference_id, &desired, outcome)?;
        }
        Ok(saved)
    }

    /// Change the location description of one occurrence and copy it to
    /// every room at the in-scope indices. Times are not touched.
    ///
    /// # Errors
    /// `ReservationNotFound` for an unknown id, plus repository errors.
    pub fn edit_location_description<R: ReservationRepository + ?Sized>(
        &self,
        repo: &mut R,
        reservation_id: ReservationId,
        comments: &str,
        scope: EditScope,
        outcome: &mut EditOutcome,
    ) -> Result<Vec<ReservationOccurrence>> {
        let edited = repo
            .occurrence(reservation_id)?
            .ok_or(BookingError::ReservationNotFound(reservation_id))?;
        let members = match (edited.conference_id, edited.series_id) {
            (Some(conference_id), _) => repo.conference_members(conference_id)?,
            (None, Some(series_id)) => repo.series_occurrences(series_id, None)?,
            (None, None) => vec![edited.clone()],
        };
        let in_scope = |index: u32| match scope {
            EditScope::Series => true,
            EditScope::ThisAndFollowing => index >= edited.occurrence_index,
            EditScope::Single => index == edited.occurrence_index,
        };

        let mut saved = Vec::new();
        for mut member in members {
            if !member.is_active() || !in_scope(member.occurrence_index) || member.comments == comments {
                continue;
            }
            member.comments = comments.to_string();
            if let Some(allocation) = member.allocation.as_mut() {
                allocation.comments = comments.to_string();
            }
            let member = repo.save(member)?;
            outcome.updated.extend(member.id);
            saved.push(member);
        }
        debug!(%reservation_id, updated = saved.len(), "fanned out location description");
        Ok(saved)
    }

    /// # Errors
    /// Propagates repository errors.
    pub fn group<R: ReservationRepository + ?Sized>(
        &self,
        repo: &R,
        conference_id: ConferenceId,
    ) -> Result<ConferenceCallGroup> {
        Ok(ConferenceCallGroup::from_members(
            conference_id,
            repo.conference_members(conference_id)?,
        ))
    }

    fn flag_conflicts<R: ReservationRepository + ?Sized>(
        &self,
        repo: &R,
        conference_id: ConferenceId,
        desired: &DesiredState,
        outcome: &mut EditOutcome,
    ) -> Result<()> {
        let group = self.group(repo, conference_id)?;
        for occurrence in &group.occurrences {
            // Group indices follow the renumbering of a split.
            let original = desired
                .split_from
                .map_or(occurrence.index, |from| occurrence.index + from - 1);
            if occurrence.state != GroupOccurrenceState::RoomConflictInConferenceCall
                || !desired.in_scope(original)
            {
                continue;
            }
            outcome.warn(Warning::RoomConflictInConferenceCall {
                conference_id,
                occurrence_index: occurrence.index,
                date: desired
                    .date_of(original)
                    .unwrap_or_else(|| occurrence.period.date()),
            });
        }
        Ok(())
    }
}
