//! Occurrence reconciliation.
//!
//! An edit is handled in three steps, none of which mutates its inputs:
//!
//! 1. [`OccurrenceReconciler::desired_state`] turns the requested template,
//!    pattern and scope into the per-index slots the series should have,
//!    anchored at the edited occurrence.
//! 2. [`OccurrenceReconciler::plan`] diffs those slots against one room's
//!    persisted occurrences, keyed by occurrence index, into a list of
//!    create/update/cancel changes. Unchanged occurrences produce nothing,
//!    so reconciling an already-matching series is a no-op.
//! 3. [`OccurrenceReconciler::apply`] evaluates availability and writes the
//!    changes. A taken room marks that one occurrence as a conflict; only the
//!    first occurrence of a brand-new series can abort the edit.
//!
//! Occurrences before the anchor are never part of a plan.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conflict::{BookedInterval, ConflictEvaluator, Exclusion, Verdict};
use crate::datelist::DateListGenerator;
use crate::error::{BookingError, Result};
use crate::model::{
    ConferenceId, OccurrenceStatus, Reservable, ReservationId, ReservationOccurrence, Series,
    SeriesId,
};
use crate::outcome::{EditOutcome, Warning};
use crate::pattern::{RecurrenceEnd, RecurrencePattern};
use crate::period::TimePeriod;
use crate::ports::{DateRange, ReservationRepository};

/// Which occurrences an edit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditScope {
    /// Every occurrence, regenerated from index 1.
    #[default]
    Series,
    /// The edited occurrence and everything after it.
    ThisAndFollowing,
    /// Only the edited occurrence.
    Single,
}

/// Requested content of the edited occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceTemplate {
    pub period: TimePeriod,
    pub subject: String,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default)]
    pub comments: String,
    /// UID pre-assigned by the caller for a brand-new booking.
    #[serde(default)]
    pub external_uid: Option<String>,
}

/// A single-room edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesEdit {
    /// The occurrence being edited; `None` books something new.
    pub reservation_id: Option<ReservationId>,
    pub reservable: Reservable,
    pub template: OccurrenceTemplate,
    /// `None` keeps the stored pattern, or books a single occurrence.
    pub pattern: Option<RecurrencePattern>,
    pub scope: EditScope,
}

/// Target period of one occurrence index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesiredSlot {
    pub index: u32,
    pub period: TimePeriod,
    pub is_exception: bool,
    /// Set on the occurrence the user edited directly; it always takes
    /// `period`, even where exceptions are otherwise preserved.
    pub explicit: bool,
}

/// What the series should look like from the anchor on. Computed once per
/// edit and shared by every room of a conference call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub anchor: u32,
    pub slots: Vec<DesiredSlot>,
    /// Series timing is unchanged: existing exceptions keep their periods and
    /// cancelled occurrences stay cancelled.
    pub preserve_exceptions: bool,
    /// Active occurrences at or after this index with no slot are cancelled.
    /// `None` for single-occurrence edits.
    pub cancel_from: Option<u32>,
    pub subject: String,
    pub attendees: Vec<String>,
    pub comments: String,
    pub external_uid: Option<String>,
    /// Pattern to persist on the series; `None` leaves the stored one.
    pub pattern: Option<RecurrencePattern>,
    /// Old index from which occurrences move to a new series, renumbered
    /// from 1. Set when a this-and-following edit produces dates the stored
    /// pattern cannot express.
    pub split_from: Option<u32>,
    /// Stored pattern cut back to the occurrences before the split.
    pub truncated: Option<RecurrencePattern>,
}

impl DesiredState {
    /// Whether `index` lies inside the part of the series this edit owns.
    pub fn in_scope(&self, index: u32) -> bool {
        match self.cancel_from {
            Some(from) => index >= from,
            None => self.slots.iter().any(|slot| slot.index == index),
        }
    }

    pub fn indices(&self) -> BTreeSet<u32> {
        self.slots.iter().map(|slot| slot.index).collect()
    }

    /// Index an occurrence currently at `index` has after the edit.
    pub fn renumbered(&self, index: u32) -> u32 {
        match self.split_from {
            Some(from) if index >= from => index - from + 1,
            _ => index,
        }
    }

    /// Date of the slot at `index`.
    pub fn date_of(&self, index: u32) -> Option<NaiveDate> {
        self.slots
            .iter()
            .find(|slot| slot.index == index)
            .map(|slot| slot.period.date())
    }

    /// Carry existing deviations into the generated slots: an index with an
    /// active exception keeps that period, and an index where every member
    /// is cancelled is dropped. `existing` may span several rooms, so a room
    /// joining the group later lands on the same periods as the others.
    fn adopt_deviations(&mut self, existing: &[ReservationOccurrence]) {
        let mut by_index: BTreeMap<u32, Vec<&ReservationOccurrence>> = BTreeMap::new();
        for occ in existing {
            by_index.entry(occ.occurrence_index).or_default().push(occ);
        }
        self.slots.retain_mut(|slot| {
            let Some(members) = by_index.get(&slot.index) else {
                return true;
            };
            if slot.explicit {
                return true;
            }
            if let Some(exception) = members.iter().find(|m| m.is_active() && m.is_exception) {
                slot.period = exception.period;
                slot.is_exception = true;
            }
            members.iter().any(|m| m.is_active())
        });
    }
}

/// Persisted state an edit starts from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesContext {
    pub edited: Option<ReservationOccurrence>,
    pub series: Option<Series>,
    /// Every occurrence of the edited series (any status), or just the edited
    /// occurrence when it is not part of a series.
    pub existing: Vec<ReservationOccurrence>,
}

impl SeriesContext {
    /// # Errors
    /// Returns `BookingError::ReservationNotFound` or
    /// `BookingError::SeriesNotFound` for dangling references.
    pub fn load<R: ReservationRepository + ?Sized>(
        repo: &R,
        reservation_id: Option<ReservationId>,
    ) -> Result<Self> {
        let Some(id) = reservation_id else {
            return Ok(Self::default());
        };
        let edited = repo
            .occurrence(id)?
            .ok_or(BookingError::ReservationNotFound(id))?;
        let (series, existing) = match edited.series_id {
            Some(series_id) => {
                let series = repo
                    .series(series_id)?
                    .ok_or(BookingError::SeriesNotFound(series_id))?;
                (Some(series), repo.series_occurrences(series_id, None)?)
            }
            None => (None, vec![edited.clone()]),
        };
        Ok(Self {
            edited: Some(edited),
            series,
            existing,
        })
    }

    pub fn is_new(&self) -> bool {
        self.edited.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccurrenceChange {
    Create(ReservationOccurrence),
    Update {
        before: ReservationOccurrence,
        after: ReservationOccurrence,
    },
    Cancel(ReservationOccurrence),
}

impl OccurrenceChange {
    pub fn index(&self) -> u32 {
        match self {
            Self::Create(occ) | Self::Cancel(occ) => occ.occurrence_index,
            Self::Update { after, .. } => after.occurrence_index,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Cancel(_) => 0,
            Self::Create(_) | Self::Update { .. } => 1,
        }
    }
}

/// The changes for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub reservable: Reservable,
    pub series_id: Option<SeriesId>,
    /// Series records to persist before the occurrences.
    pub series: Vec<Series>,
    /// The first created occurrence is subject to the conflict policy.
    pub new_series: bool,
    pub changes: Vec<OccurrenceChange>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.series.is_empty()
    }

    pub fn creates(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, OccurrenceChange::Create(_)))
            .count()
    }

    pub fn updates(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, OccurrenceChange::Update { .. }))
            .count()
    }

    pub fn cancels(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, OccurrenceChange::Cancel(_)))
            .count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OccurrenceReconciler {
    generator: DateListGenerator,
    evaluator: ConflictEvaluator,
}

impl OccurrenceReconciler {
    pub fn new(generator: DateListGenerator, evaluator: ConflictEvaluator) -> Self {
        Self {
            generator,
            evaluator,
        }
    }

    pub fn generator(&self) -> &DateListGenerator {
        &self.generator
    }

    /// Reconcile a single-room edit end to end.
    ///
    /// # Errors
    /// `PatternEmpty` / `InvalidRecurrence` for a bad pattern,
    /// `CreationTimeout` for a duplicate submission, `ReservableUnavailable`
    /// when the first occurrence of a new series is taken under the strict
    /// policy, and repository errors.
    pub fn reconcile<R: ReservationRepository + ?Sized>(
        &self,
        repo: &mut R,
        edit: &SeriesEdit,
        outcome: &mut EditOutcome,
    ) -> Result<Vec<ReservationOccurrence>> {
        let ctx = SeriesContext::load(repo, edit.reservation_id)?;
        if ctx.is_new() && edit.pattern.is_some() {
            check_duplicate_creation(repo, &edit.reservable, &edit.template)?;
        }
        let desired = self.desired_state(&edit.template, edit.pattern.as_ref(), edit.scope, &ctx)?;
        let conference_id = ctx.edited.as_ref().and_then(|e| e.conference_id);
        let (series_id, series) = series_record(repo, ctx.series.as_ref(), &desired, None, conference_id)?;
        let plan = self.plan(
            &desired,
            &edit.reservable,
            &ctx.existing,
            series_id,
            conference_id,
            ctx.is_new(),
            series,
        );
        self.apply(plan, repo, outcome)
    }

    /// Compute the desired slots for an edit.
    ///
    /// Whole-series edits regenerate every index from the pattern. Partial
    /// edits resolve the anchor by walking the stored pattern to the edited
    /// occurrence's original date and regenerate from there with the
    /// remaining count. If the edited date is not on the pattern it becomes
    /// an exception at the anchor index.
    ///
    /// A partial scope on a booking that is not yet a series is treated as a
    /// whole-series edit.
    ///
    /// # Errors
    /// Returns `BookingError::InvalidRecurrence` or `BookingError::PatternEmpty`
    /// from validation and generation.
    pub fn desired_state(
        &self,
        template: &OccurrenceTemplate,
        pattern: Option<&RecurrencePattern>,
        scope: EditScope,
        ctx: &SeriesContext,
    ) -> Result<DesiredState> {
        let mut desired = DesiredState {
            anchor: 1,
            slots: Vec::new(),
            preserve_exceptions: false,
            cancel_from: None,
            subject: template.subject.clone(),
            attendees: template.attendees.clone(),
            comments: template.comments.clone(),
            external_uid: template.external_uid.clone(),
            pattern: None,
            split_from: None,
            truncated: None,
        };

        let stored = ctx.series.as_ref().map(|series| &series.pattern);
        let Some(pattern) = pattern.or(stored) else {
            let index = ctx.edited.as_ref().map_or(1, |e| e.occurrence_index);
            desired.anchor = index;
            desired.slots.push(DesiredSlot {
                index,
                period: template.period,
                is_exception: false,
                explicit: true,
            });
            return Ok(desired);
        };
        pattern.validate()?;

        match (scope, stored.zip(ctx.edited.as_ref())) {
            (EditScope::ThisAndFollowing, Some((stored, edited))) => {
                let (anchor, original_date) = self.resolve_anchor(stored, &ctx.existing, edited);
                desired.anchor = anchor;
                desired.preserve_exceptions =
                    same_rule(stored, pattern) && self.times_unchanged(template, ctx, anchor);
                let template_date = template.period.date();
                let generation_start = if desired.preserve_exceptions {
                    original_date
                } else {
                    template_date
                };
                let rest = pattern.starting_at(generation_start, anchor - 1);
                let mut dates = match self.generator.generate(&rest) {
                    Ok(dates) => dates,
                    Err(BookingError::PatternEmpty) => Vec::new(),
                    Err(err) => return Err(err),
                };

                if dates.first() == Some(&generation_start) {
                    dates.remove(0);
                    desired.slots.push(DesiredSlot {
                        index: anchor,
                        period: template.period,
                        is_exception: template_date != generation_start,
                        explicit: true,
                    });
                } else {
                    // Off-pattern anchor: it takes one slot of a count-based end.
                    if let Some(count) = rest.count() {
                        dates.truncate(count.saturating_sub(1) as usize);
                    }
                    desired.slots.push(DesiredSlot {
                        index: anchor,
                        period: template.period,
                        is_exception: true,
                        explicit: true,
                    });
                }
                desired.slots.extend(dates.into_iter().zip(anchor + 1..).map(|(date, index)| {
                    DesiredSlot {
                        index,
                        period: template.period.on_date(date),
                        is_exception: false,
                        explicit: false,
                    }
                }));
                desired.cancel_from = Some(anchor);

                let aligned = self.aligned(stored, &ctx.existing);
                let kept = RecurrencePattern {
                    start: aligned.start,
                    ..pattern.clone()
                };
                let regular = desired.slots.iter().any(|slot| !slot.is_exception);
                if !regular || self.expresses(&kept, &ctx.existing, &desired.slots, anchor) {
                    if kept != *stored {
                        desired.pattern = Some(kept);
                    }
                } else {
                    desired.pattern = Some(self.rebased(&rest, &desired.slots, anchor)?);
                    if anchor > 1 {
                        desired.split_from = Some(anchor);
                        desired.truncated = Some(self.truncated(&aligned, anchor));
                        debug!(anchor, "splitting series at the edited occurrence");
                    }
                }
            }
            (EditScope::Single, Some((_, edited))) => {
                desired.anchor = edited.occurrence_index;
                desired.preserve_exceptions = true;
                desired.slots.push(DesiredSlot {
                    index: edited.occurrence_index,
                    period: template.period,
                    is_exception: edited.series_id.is_some()
                        && (edited.is_exception || edited.period != template.period),
                    explicit: true,
                });
            }
            // Whole series, a new booking, or a standalone booking turned into a series.
            _ => {
                let unchanged = stored == Some(pattern);
                desired.preserve_exceptions = unchanged && self.times_unchanged(template, ctx, 1);
                let pattern = match stored {
                    Some(stored) if unchanged => self.aligned(stored, &ctx.existing),
                    _ => pattern.clone(),
                };
                desired.slots = self
                    .generator
                    .generate_indexed(&pattern, 1)?
                    .into_iter()
                    .map(|(index, date)| DesiredSlot {
                        index,
                        period: template.period.on_date(date),
                        is_exception: false,
                        explicit: false,
                    })
                    .collect();
                desired.cancel_from = Some(1);
                desired.pattern = Some(pattern);
            }
        }

        if desired.preserve_exceptions {
            desired.adopt_deviations(&ctx.existing);
        }
        debug!(
            anchor = desired.anchor,
            slots = desired.slots.len(),
            preserve = desired.preserve_exceptions,
            "computed desired state"
        );
        Ok(desired)
    }

    /// Diff the desired slots against one room's persisted occurrences.
    #[allow(clippy::too_many_arguments)]
    pub fn plan(
        &self,
        desired: &DesiredState,
        reservable: &Reservable,
        existing: &[ReservationOccurrence],
        series_id: Option<SeriesId>,
        conference_id: Option<ConferenceId>,
        new_series: bool,
        series: Vec<Series>,
    ) -> ReconcilePlan {
        let mut by_index: BTreeMap<u32, &ReservationOccurrence> = BTreeMap::new();
        for occ in existing {
            by_index
                .entry(occ.occurrence_index)
                .and_modify(|current| {
                    if !current.is_active() && occ.is_active() {
                        *current = occ;
                    }
                })
                .or_insert(occ);
        }
        // Moved occurrences start over on a new appointment.
        let split = desired.split_from.is_some();
        let external_uid = existing
            .iter()
            .find_map(|o| o.external_uid.clone())
            .or_else(|| desired.external_uid.clone())
            .filter(|_| !split);
        let external_sequence = if split {
            0
        } else {
            existing.iter().map(|o| o.external_sequence).max().unwrap_or(0)
        };
        let covered = desired.indices();

        let mut changes = Vec::new();
        if let Some(from) = desired.cancel_from {
            changes.extend(
                existing
                    .iter()
                    .filter(|o| o.is_active() && o.occurrence_index >= from)
                    .filter(|o| !covered.contains(&o.occurrence_index))
                    .cloned()
                    .map(OccurrenceChange::Cancel),
            );
        }

        for slot in &desired.slots {
            let preserve = desired.preserve_exceptions && !slot.explicit;
            match by_index.get(&slot.index) {
                None => {
                    let mut occ = ReservationOccurrence::new(
                        reservable.clone(),
                        slot.period,
                        desired.subject.clone(),
                        desired.comments.clone(),
                    );
                    occ.allocation = None;
                    occ.series_id = series_id;
                    occ.occurrence_index = desired.renumbered(slot.index);
                    occ.attendees = desired.attendees.clone();
                    occ.is_exception = slot.is_exception;
                    occ.conference_id = conference_id;
                    occ.external_uid = external_uid.clone();
                    occ.external_sequence = external_sequence;
                    changes.push(OccurrenceChange::Create(occ));
                }
                // Cancelled occurrences stay cancelled.
                Some(old) if !old.is_active() => {}
                Some(old) => {
                    let before = (*old).clone();
                    let mut after = before.clone();
                    if preserve && old.is_exception {
                        after.is_exception = true;
                    } else {
                        after.period = slot.period;
                        after.is_exception = slot.is_exception;
                    }
                    after.subject = desired.subject.clone();
                    after.attendees = desired.attendees.clone();
                    after.comments = desired.comments.clone();
                    after.reservable = reservable.clone();
                    after.series_id = series_id;
                    after.conference_id = conference_id;
                    after.occurrence_index = desired.renumbered(slot.index);
                    if split {
                        after.external_uid = None;
                        after.external_sequence = 0;
                    }
                    if differs(&before, &after) {
                        changes.push(OccurrenceChange::Update { before, after });
                    }
                }
            }
        }

        ReconcilePlan {
            reservable: reservable.clone(),
            series_id,
            series,
            new_series,
            changes,
        }
    }

    /// Evaluate availability and persist a plan. Cancellations go first so
    /// they free the room for the rest.
    ///
    /// # Errors
    /// `ReservableUnavailable` if the first occurrence of a new series is
    /// rejected (nothing is written in that case), and repository errors.
    pub fn apply<R: ReservationRepository + ?Sized>(
        &self,
        plan: ReconcilePlan,
        repo: &mut R,
        outcome: &mut EditOutcome,
    ) -> Result<Vec<ReservationOccurrence>> {
        let ReconcilePlan {
            reservable,
            series_id,
            mut series,
            new_series,
            mut changes,
        } = plan;
        changes.sort_by_key(|c| (c.rank(), c.index()));
        let first_created = changes
            .iter()
            .filter(|c| matches!(c, OccurrenceChange::Create(_)))
            .map(OccurrenceChange::index)
            .min();
        debug!(
            %reservable,
            changes = changes.len(),
            new_series,
            "applying reconcile plan"
        );

        let mut saved = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                OccurrenceChange::Cancel(old) => {
                    let Some(id) = old.id else { continue };
                    persist_series(repo, &mut series)?;
                    saved.push(repo.cancel(id)?);
                    outcome.cancelled.push(id);
                }
                OccurrenceChange::Create(mut occ) => {
                    let first = new_series && Some(occ.occurrence_index) == first_created;
                    let exclusion = Exclusion {
                        series_id,
                        ..Exclusion::default()
                    };
                    self.place(repo, &mut occ, exclusion, first, outcome)?;
                    persist_series(repo, &mut series)?;
                    let occ = repo.save(occ)?;
                    outcome.created.extend(occ.id);
                    saved.push(occ);
                }
                OccurrenceChange::Update { before, mut after } => {
                    let timing_kept = before.status == OccurrenceStatus::Confirmed
                        && before.period == after.period
                        && before.reservable == after.reservable;
                    if timing_kept {
                        after.allocate();
                    } else {
                        let exclusion = Exclusion {
                            series_id,
                            reservation_id: after.id,
                            source_series_id: before.series_id,
                        };
                        self.place(repo, &mut after, exclusion, false, outcome)?;
                    }
                    persist_series(repo, &mut series)?;
                    let occ = repo.save(after)?;
                    outcome.updated.extend(occ.id);
                    saved.push(occ);
                }
            }
        }
        persist_series(repo, &mut series)?;
        Ok(saved)
    }

    /// Check the policy-gated first occurrence of a new series without
    /// writing anything.
    ///
    /// # Errors
    /// `ReservableUnavailable` when [`OccurrenceReconciler::apply`] would
    /// reject the plan, plus repository errors.
    pub fn admit<R: ReservationRepository + ?Sized>(&self, plan: &ReconcilePlan, repo: &R) -> Result<()> {
        if !plan.new_series {
            return Ok(());
        }
        let first = plan
            .changes
            .iter()
            .filter_map(|change| match change {
                OccurrenceChange::Create(occ) => Some(occ),
                _ => None,
            })
            .min_by_key(|occ| occ.occurrence_index);
        let Some(first) = first else {
            return Ok(());
        };
        let exclusion = Exclusion {
            series_id: plan.series_id,
            ..Exclusion::default()
        };
        match self.verdict(repo, first, exclusion, true)? {
            Verdict::Reject(_) => Err(BookingError::ReservableUnavailable {
                reservable: first.reservable.clone(),
                date: first.date(),
            }),
            Verdict::Allocate | Verdict::MarkConflict(_) => Ok(()),
        }
    }

    fn verdict<R: ReservationRepository + ?Sized>(
        &self,
        repo: &R,
        occ: &ReservationOccurrence,
        exclusion: Exclusion,
        first_of_new_series: bool,
    ) -> Result<Verdict> {
        let date = occ.date();
        let range = DateRange::new(
            date.pred_opt().unwrap_or(date),
            date.succ_opt().unwrap_or(date),
        );
        let booked: Vec<BookedInterval> = repo
            .allocated_on(&occ.reservable, range)?
            .into_iter()
            .filter_map(|other| {
                Some(BookedInterval {
                    reservation_id: other.id?,
                    series_id: other.series_id,
                    interval: other.period.to_utc(self.evaluator.dst)?,
                })
            })
            .collect();
        Ok(self
            .evaluator
            .evaluate(&occ.period, &booked, exclusion, first_of_new_series))
    }

    fn place<R: ReservationRepository + ?Sized>(
        &self,
        repo: &R,
        occ: &mut ReservationOccurrence,
        exclusion: Exclusion,
        first_of_new_series: bool,
        outcome: &mut EditOutcome,
    ) -> Result<()> {
        let date = occ.date();
        match self.verdict(repo, occ, exclusion, first_of_new_series)? {
            Verdict::Allocate => occ.allocate(),
            Verdict::MarkConflict(conflicts) => {
                debug!(
                    reservable = %occ.reservable,
                    index = occ.occurrence_index,
                    overlapping = conflicts.len(),
                    "marking occurrence as conflict"
                );
                occ.mark_conflict();
                outcome.warn(Warning::RoomConflict {
                    reservable: occ.reservable.clone(),
                    occurrence_index: occ.occurrence_index,
                    date,
                });
            }
            Verdict::Reject(_) => {
                return Err(BookingError::ReservableUnavailable {
                    reservable: occ.reservable.clone(),
                    date,
                })
            }
        }
        Ok(())
    }

    /// Anchor index of a partial edit and the date the stored pattern gives it.
    fn resolve_anchor(
        &self,
        stored: &RecurrencePattern,
        existing: &[ReservationOccurrence],
        edited: &ReservationOccurrence,
    ) -> (u32, NaiveDate) {
        let aligned = self.aligned(stored, existing);
        let dates = self.generator.generate_indexed(&aligned, 1).unwrap_or_default();

        if edited.is_exception {
            let original = dates
                .iter()
                .find(|(index, _)| *index == edited.occurrence_index)
                .map_or(edited.date(), |(_, date)| *date);
            return (edited.occurrence_index, original);
        }
        dates
            .iter()
            .find(|(_, date)| *date == edited.date())
            .map_or((edited.occurrence_index, edited.date()), |(index, date)| {
                (*index, *date)
            })
    }

    /// The stored pattern with its start walked onto the regular active
    /// occurrences, undoing any drift of the stored start.
    fn aligned(&self, stored: &RecurrencePattern, existing: &[ReservationOccurrence]) -> RecurrencePattern {
        let fixed: BTreeMap<u32, NaiveDate> = existing
            .iter()
            .filter(|o| o.is_active() && !o.is_exception)
            .map(|o| (o.occurrence_index, o.date()))
            .collect();
        self.generator
            .align_to_fixed(stored, &fixed)
            .unwrap_or_else(|err| {
                debug!(%err, "stored pattern not aligned, using it as is");
                stored.clone()
            })
    }

    /// Whether `pattern`, numbered from 1, lands on every regular occurrence
    /// before `anchor` and every regular slot, and stops at the last slot.
    fn expresses(
        &self,
        pattern: &RecurrencePattern,
        existing: &[ReservationOccurrence],
        slots: &[DesiredSlot],
        anchor: u32,
    ) -> bool {
        let Ok(dates) = self.generator.generate_indexed(pattern, 1) else {
            return false;
        };
        let dates: BTreeMap<u32, NaiveDate> = dates.into_iter().collect();
        let earlier = existing
            .iter()
            .filter(|o| o.is_active() && !o.is_exception && o.occurrence_index < anchor)
            .all(|o| dates.get(&o.occurrence_index) == Some(&o.date()));
        let following = slots
            .iter()
            .filter(|slot| !slot.is_exception)
            .all(|slot| dates.get(&slot.index) == Some(&slot.period.date()));
        let last_slot = slots.iter().map(|slot| slot.index).max().unwrap_or(anchor);
        let last_index = dates.keys().next_back().copied().unwrap_or(0);
        earlier && following && last_index <= last_slot
    }

    /// Pattern of the occurrences from `anchor` on, numbered from 1 and
    /// aligned onto the regular slots.
    fn rebased(
        &self,
        rest: &RecurrencePattern,
        slots: &[DesiredSlot],
        anchor: u32,
    ) -> Result<RecurrencePattern> {
        let fixed: BTreeMap<u32, NaiveDate> = slots
            .iter()
            .filter(|slot| !slot.is_exception)
            .map(|slot| (slot.index - anchor + 1, slot.period.date()))
            .collect();
        self.generator.align_to_fixed(rest, &fixed)
    }

    /// `stored` ending with the occurrence before `anchor`.
    fn truncated(&self, stored: &RecurrencePattern, anchor: u32) -> RecurrencePattern {
        let last = anchor - 1;
        let end = match stored.end {
            RecurrenceEnd::Count(_) => RecurrenceEnd::Count(last),
            RecurrenceEnd::Until(until) => RecurrenceEnd::Until(
                self.generator
                    .generate_indexed(stored, 1)
                    .ok()
                    .and_then(|dates| dates.into_iter().find(|(index, _)| *index == last))
                    .map_or(until, |(_, date)| date),
            ),
        };
        RecurrencePattern {
            end,
            ..stored.clone()
        }
    }

    /// The template keeps the times of day of the first active, regular
    /// occurrence at or after `from`.
    fn times_unchanged(&self, template: &OccurrenceTemplate, ctx: &SeriesContext, from: u32) -> bool {
        ctx.existing
            .iter()
            .filter(|o| o.is_active() && !o.is_exception && o.occurrence_index >= from)
            .min_by_key(|o| o.occurrence_index)
            .is_some_and(|reference| reference.period.same_times_of_day(&template.period))
    }
}

/// Refuse to create a series when the caller's UID is already booked on the
/// same reservable. Another room under the same UID is a conference call and
/// does not count. This detects a double submission after the fact; two
/// independent bookings that coincide are not caught.
///
/// # Errors
/// Returns `BookingError::CreationTimeout` on a match.
pub fn check_duplicate_creation<R: ReservationRepository + ?Sized>(
    repo: &R,
    reservable: &Reservable,
    template: &OccurrenceTemplate,
) -> Result<()> {
    let Some(uid) = template.external_uid.as_deref() else {
        return Ok(());
    };
    let duplicate = repo
        .by_external_uid(uid)?
        .iter()
        .any(|o| o.is_active() && &o.reservable == reservable);
    if duplicate {
        warn!(uid, %reservable, "series already exists for this uid");
        return Err(BookingError::CreationTimeout {
            external_uid: uid.to_string(),
            reservable: reservable.clone(),
        });
    }
    Ok(())
}

/// Series id for a room plus the records to persist, if any changed. A
/// split allocates a new series for the moved occurrences and cuts the
/// existing one back.
///
/// # Errors
/// Propagates id allocation failures.
pub fn series_record<R: ReservationRepository + ?Sized>(
    repo: &mut R,
    existing: Option<&Series>,
    desired: &DesiredState,
    fallback: Option<&RecurrencePattern>,
    conference_id: Option<ConferenceId>,
) -> Result<(Option<SeriesId>, Vec<Series>)> {
    match existing {
        Some(series) if desired.split_from.is_some() => {
            let id = repo.next_series_id()?;
            let mut records = vec![Series {
                id,
                pattern: desired
                    .pattern
                    .clone()
                    .unwrap_or_else(|| series.pattern.clone()),
                conference_id,
            }];
            if let Some(truncated) = &desired.truncated {
                records.push(Series {
                    pattern: truncated.clone(),
                    ..series.clone()
                });
            }
            Ok((Some(id), records))
        }
        Some(series) => {
            let updated = Series {
                id: series.id,
                pattern: desired
                    .pattern
                    .clone()
                    .unwrap_or_else(|| series.pattern.clone()),
                conference_id,
            };
            let changed = (updated != *series).then_some(updated);
            Ok((Some(series.id), changed.into_iter().collect()))
        }
        None => match desired.pattern.as_ref().or(fallback) {
            Some(pattern) => {
                let id = repo.next_series_id()?;
                Ok((
                    Some(id),
                    vec![Series {
                        id,
                        pattern: pattern.clone(),
                        conference_id,
                    }],
                ))
            }
            None => Ok((None, Vec::new())),
        },
    }
}

fn persist_series<R: ReservationRepository + ?Sized>(
    repo: &mut R,
    series: &mut Vec<Series>,
) -> Result<()> {
    for series in series.drain(..) {
        repo.save_series(series)?;
    }
    Ok(())
}

/// Same rule apart from the start date.
fn same_rule(a: &RecurrencePattern, b: &RecurrencePattern) -> bool {
    a.kind == b.kind && a.interval == b.interval && a.end == b.end
}

fn differs(before: &ReservationOccurrence, after: &ReservationOccurrence) -> bool {
    !before.same_content(after)
        || before.is_exception != after.is_exception
        || before.status != after.status
        || before.series_id != after.series_id
        || before.conference_id != after.conference_id
        || before.occurrence_index != after.occurrence_index
}
