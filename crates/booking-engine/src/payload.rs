//! Calendar payload assembly and iCalendar rendering.
//!
//! A [`CalendarPayload`] is the in-memory form of one `VCALENDAR`: a method
//! and one or more events. The sync adapter hands payloads to the external
//! calendar service; notifications carry the same payload rendered to `.ics`.
//!
//! Series payloads are built from [`Slot`]s, the per-index view of an
//! appointment group (one slot may span several rooms of a conference call).
//! Occurrences that no longer match the series template travel in a second
//! payload of `RECURRENCE-ID` overrides so the series itself stays one event.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use icalendar::{Calendar, Component, EventLike, Property};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datelist::DateListGenerator;
use crate::dst::DstPolicy;
use crate::error::{BookingError, Result};
use crate::model::{Reservable, ReservationId, ReservationOccurrence};
use crate::pattern::RecurrencePattern;
use crate::period::TimePeriod;
use crate::ports::{Attachment, Notification};
use crate::recurrence_rule::to_rule;

pub const ICS_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

const ICS_LOCAL: &str = "%Y%m%dT%H%M%S";
const ICS_UTC: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Request,
    Cancel,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Cancel => "CANCEL",
        }
    }
}

/// One `VEVENT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub uid: String,
    pub sequence: u32,
    /// Original local start of the addressed occurrence, in `period.timezone`.
    pub recurrence_id: Option<NaiveDateTime>,
    pub period: TimePeriod,
    pub summary: String,
    pub location: String,
    pub description: String,
    pub attendees: Vec<String>,
    pub rrule: Option<String>,
    pub exdates: Vec<NaiveDateTime>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarPayload {
    pub method: Method,
    pub organizer: Option<String>,
    pub entries: Vec<CalendarEntry>,
}

impl CalendarPayload {
    pub fn uid(&self) -> Option<&str> {
        self.entries.first().map(|entry| entry.uid.as_str())
    }

    /// Render as an RFC 5545 document with CRLF line endings.
    pub fn to_ics(&self, product_id: &str, stamp: DateTime<Utc>) -> String {
        let mut cal = Calendar::new();
        for entry in &self.entries {
            let mut event = icalendar::Event::new();
            let tz = entry.period.timezone;
            event.uid(&entry.uid);
            event.summary(&entry.summary);
            event.add_property("DTSTAMP", stamp.format(ICS_UTC).to_string());
            event.add_property("SEQUENCE", entry.sequence.to_string());
            add_local_time(&mut event, "DTSTART", entry.period.start, tz);
            add_local_time(&mut event, "DTEND", entry.period.end, tz);
            if let Some(recurrence_id) = entry.recurrence_id {
                add_local_time(&mut event, "RECURRENCE-ID", recurrence_id, tz);
            }
            if let Some(rule) = &entry.rrule {
                event.add_property("RRULE", rule);
            }
            for exdate in &entry.exdates {
                let mut prop = Property::new("EXDATE", exdate.format(ICS_LOCAL).to_string());
                prop.add_parameter("TZID", tz.name());
                event.append_multi_property(prop);
            }
            if !entry.location.is_empty() {
                event.location(&entry.location);
            }
            if !entry.description.is_empty() {
                event.description(&entry.description);
            }
            if entry.cancelled {
                event.add_property("STATUS", "CANCELLED");
            }
            if let Some(organizer) = &self.organizer {
                event.append_property(Property::new("ORGANIZER", format!("mailto:{organizer}")));
            }
            for attendee in &entry.attendees {
                event.append_multi_property(Property::new("ATTENDEE", format!("mailto:{attendee}")));
            }
            cal.push(event.done());
        }
        finish_ics(&cal.done().to_string(), product_id, self.method)
    }
}

/// Replace the library PRODID, add METHOD, and drop the default CALSCALE.
fn finish_ics(ics: &str, product_id: &str, method: Method) -> String {
    let mut result = String::with_capacity(ics.len() + 32);
    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            result.push_str("PRODID:");
            result.push_str(&sanitize_header(product_id));
            result.push_str("\r\n");
            result.push_str("METHOD:");
            result.push_str(method.as_str());
            result.push_str("\r\n");
            continue;
        }
        if line == "CALSCALE:GREGORIAN" {
            continue;
        }
        result.push_str(line);
        result.push_str("\r\n");
    }
    result
}

fn add_local_time(event: &mut icalendar::Event, name: &str, time: NaiveDateTime, tz: Tz) {
    let mut prop = Property::new(name, time.format(ICS_LOCAL).to_string());
    prop.add_parameter("TZID", tz.name());
    event.append_property(prop);
}

/// Remove CR and LF so a value cannot break out of a header or filename.
pub fn sanitize_header(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// `reservation-<id>-<startDate>[-cancel][-requestedBy].ics`
pub fn attachment_filename(
    reservation_id: ReservationId,
    start: NaiveDateTime,
    cancel: bool,
    requested_by: Option<&str>,
) -> String {
    let mut name = format!("reservation-{reservation_id}-{}", start.format("%Y-%m-%d"));
    if cancel {
        name.push_str("-cancel");
    }
    if let Some(requested_by) = requested_by.map(sanitize_header).filter(|r| !r.is_empty()) {
        name.push('-');
        name.push_str(&requested_by);
    }
    name.push_str(".ics");
    name
}

/// UID of the external appointment that represents `occurrence`: conference
/// id, then series id, then reservation id. Exceptions get their index
/// appended so a detached occurrence never reuses its series' UID.
pub fn derive_uid(occurrence: &ReservationOccurrence) -> String {
    let base = base_uid(occurrence);
    if occurrence.is_exception {
        format!("{base}-{}", occurrence.occurrence_index)
    } else {
        base
    }
}

fn base_uid(occurrence: &ReservationOccurrence) -> String {
    if let Some(conference_id) = occurrence.conference_id {
        format!("conference-{conference_id}")
    } else if let Some(series_id) = occurrence.series_id {
        format!("series-{series_id}")
    } else {
        match occurrence.id {
            Some(id) => format!("reservation-{id}"),
            None => "reservation-new".to_string(),
        }
    }
}

/// Everything booked at one occurrence index of an appointment group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub index: u32,
    /// Lowest-id active member, or the lowest-id member if none is active.
    pub primary: Option<ReservationId>,
    pub period: TimePeriod,
    pub subject: String,
    pub attendees: Vec<String>,
    pub locations: Vec<Reservable>,
    pub comments: String,
    pub is_exception: bool,
    pub cancelled: bool,
}

impl Slot {
    /// Group members by occurrence index.
    pub fn collect(members: &[ReservationOccurrence]) -> Vec<Slot> {
        let mut by_index: BTreeMap<u32, Vec<&ReservationOccurrence>> = BTreeMap::new();
        for member in members {
            by_index.entry(member.occurrence_index).or_default().push(member);
        }
        by_index
            .into_iter()
            .filter_map(|(index, mut group)| {
                group.sort_by_key(|m| (!m.is_active(), m.id));
                let lead = *group.first()?;
                let active: Vec<&ReservationOccurrence> =
                    group.iter().copied().filter(|m| m.is_active()).collect();
                let mut locations: Vec<Reservable> = if active.is_empty() {
                    group.iter().map(|m| m.reservable.clone()).collect()
                } else {
                    active.iter().map(|m| m.reservable.clone()).collect()
                };
                locations.sort();
                locations.dedup();
                Some(Slot {
                    index,
                    primary: lead.id,
                    period: lead.period,
                    subject: lead.subject.clone(),
                    attendees: lead.attendees.clone(),
                    locations,
                    comments: lead.comments.clone(),
                    is_exception: lead.is_exception,
                    cancelled: active.is_empty(),
                })
            })
            .collect()
    }

    pub fn location_text(&self) -> String {
        self.locations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn same_content(&self, other: &Slot) -> bool {
        self.subject == other.subject
            && self.attendees == other.attendees
            && self.locations == other.locations
            && self.comments == other.comments
    }
}

/// A series appointment plus the overrides for occurrences that deviate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPayload {
    pub series: CalendarPayload,
    pub deviations: Option<CalendarPayload>,
}

/// Builds calendar payloads, notifications and attachments.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    generator: DateListGenerator,
    dst: DstPolicy,
    product_id: String,
    organizer: Option<String>,
}

impl PayloadBuilder {
    pub fn new(
        generator: DateListGenerator,
        dst: DstPolicy,
        product_id: impl Into<String>,
        organizer: Option<String>,
    ) -> Self {
        Self {
            generator,
            dst,
            product_id: product_id.into(),
            organizer,
        }
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Build the series appointment for `pattern` from the group's slots.
    ///
    /// The template is the first active slot that is not an exception.
    /// `DTSTART` is the first generated date. Expected indices whose slot is
    /// missing or cancelled become `EXDATE`s; active slots that differ from
    /// the template on their expected date become overrides.
    ///
    /// # Errors
    /// Returns `BookingError::InvalidRecurrence` if no slot is active, plus
    /// any error from date generation or rule translation.
    pub fn series(
        &self,
        uid: &str,
        sequence: u32,
        pattern: &RecurrencePattern,
        slots: &[Slot],
    ) -> Result<SeriesPayload> {
        let template = slots
            .iter()
            .filter(|slot| !slot.cancelled)
            .min_by_key(|slot| (slot.is_exception, slot.index))
            .ok_or_else(|| {
                BookingError::InvalidRecurrence("series has no active occurrence".to_string())
            })?;
        let pattern = self.aligned(pattern, slots);
        let expected = self.generator.generate_indexed(&pattern, 1)?;
        let rule = to_rule(&pattern, &template.period, self.dst)?;
        let by_index: BTreeMap<u32, &Slot> = slots.iter().map(|slot| (slot.index, slot)).collect();

        let mut exdates = Vec::new();
        let mut overrides = Vec::new();
        for (index, date) in &expected {
            let original = template.period.on_date(*date);
            match by_index.get(index) {
                None => exdates.push(original.start),
                Some(slot) if slot.cancelled => exdates.push(original.start),
                Some(slot) if slot.period != original || !slot.same_content(template) => {
                    overrides.push(self.entry(uid, sequence, Some(original.start), slot));
                }
                Some(_) => {}
            }
        }
        debug!(
            uid,
            expected = expected.len(),
            exdates = exdates.len(),
            overrides = overrides.len(),
            "built series payload"
        );

        let first = expected
            .first()
            .map(|(_, date)| template.period.on_date(*date))
            .unwrap_or(template.period);
        let mut entry = self.entry(uid, sequence, None, template);
        entry.period = first;
        entry.rrule = Some(rule);
        entry.exdates = exdates;
        entry.cancelled = false;

        let deviations = (!overrides.is_empty()).then(|| CalendarPayload {
            method: Method::Request,
            organizer: self.organizer.clone(),
            entries: overrides,
        });
        Ok(SeriesPayload {
            series: CalendarPayload {
                method: Method::Request,
                organizer: self.organizer.clone(),
                entries: vec![entry],
            },
            deviations,
        })
    }

    /// A one-event payload: a standalone appointment, or one occurrence of a
    /// tracked series when `recurrence_id` is set. Cancelled slots produce a
    /// `CANCEL`.
    pub fn single(
        &self,
        uid: &str,
        sequence: u32,
        recurrence_id: Option<NaiveDateTime>,
        slot: &Slot,
    ) -> CalendarPayload {
        let method = if slot.cancelled {
            Method::Cancel
        } else {
            Method::Request
        };
        CalendarPayload {
            method,
            organizer: self.organizer.clone(),
            entries: vec![self.entry(uid, sequence, recurrence_id, slot)],
        }
    }

    /// A `CANCEL` for the whole appointment, or one occurrence of it.
    pub fn cancellation(
        &self,
        uid: &str,
        sequence: u32,
        recurrence_id: Option<NaiveDateTime>,
        slot: &Slot,
    ) -> CalendarPayload {
        let mut entry = self.entry(uid, sequence, recurrence_id, slot);
        entry.cancelled = true;
        CalendarPayload {
            method: Method::Cancel,
            organizer: self.organizer.clone(),
            entries: vec![entry],
        }
    }

    /// `pattern` with its start walked onto the regular active slots, so a
    /// drifted stored start does not shift `DTSTART` or the expected dates.
    pub fn aligned(&self, pattern: &RecurrencePattern, slots: &[Slot]) -> RecurrencePattern {
        let fixed: BTreeMap<u32, NaiveDate> = slots
            .iter()
            .filter(|slot| !slot.cancelled && !slot.is_exception)
            .map(|slot| (slot.index, slot.period.date()))
            .collect();
        self.generator
            .align_to_fixed(pattern, &fixed)
            .unwrap_or_else(|err| {
                debug!(%err, "series pattern not aligned, using it as is");
                pattern.clone()
            })
    }

    /// Local start the pattern gives occurrence `index`, at the template's
    /// time of day. `None` if the pattern does not reach that index.
    ///
    /// # Errors
    /// Propagates date generation errors.
    pub fn original_start(
        &self,
        pattern: &RecurrencePattern,
        template: &TimePeriod,
        index: u32,
    ) -> Result<Option<NaiveDateTime>> {
        Ok(self
            .generator
            .generate_indexed(pattern, 1)?
            .into_iter()
            .find(|(i, _)| *i == index)
            .map(|(_, date)| template.on_date(date).start))
    }

    pub fn attachment(
        &self,
        payload: &CalendarPayload,
        reservation_id: ReservationId,
        requested_by: Option<&str>,
        stamp: DateTime<Utc>,
    ) -> Attachment {
        let start = payload
            .entries
            .first()
            .map(|entry| entry.period.start)
            .unwrap_or_else(|| stamp.naive_utc());
        Attachment {
            filename: attachment_filename(
                reservation_id,
                start,
                payload.method == Method::Cancel,
                requested_by,
            ),
            content_type: ICS_CONTENT_TYPE.to_string(),
            data: payload.to_ics(&self.product_id, stamp).into_bytes(),
        }
    }

    /// Render the message sent to attendees for `payload`.
    pub fn notification(
        &self,
        payload: &CalendarPayload,
        reservation_id: ReservationId,
        requested_by: Option<&str>,
        stamp: DateTime<Utc>,
    ) -> Notification {
        let Some(entry) = payload.entries.first() else {
            return Notification {
                recipients: Vec::new(),
                subject: String::new(),
                body: String::new(),
                attachments: Vec::new(),
            };
        };
        let verb = match payload.method {
            Method::Request => "Booking",
            Method::Cancel => "Cancelled",
        };
        let subject = sanitize_header(&format!("{verb}: {}", entry.summary));
        let mut body = format!(
            "{}\n{} {} - {} ({})\n",
            entry.summary,
            entry.period.date(),
            entry.period.start_time().format("%H:%M"),
            entry.period.end_time().format("%H:%M"),
            entry.period.timezone.name(),
        );
        if !entry.location.is_empty() {
            body.push_str(&format!("Location: {}\n", entry.location));
        }
        if entry.rrule.is_some() {
            body.push_str("This is a recurring booking.\n");
        }
        if !entry.description.is_empty() {
            body.push('\n');
            body.push_str(&entry.description);
            body.push('\n');
        }
        Notification {
            recipients: entry.attendees.clone(),
            subject,
            body,
            attachments: vec![self.attachment(payload, reservation_id, requested_by, stamp)],
        }
    }

    fn entry(
        &self,
        uid: &str,
        sequence: u32,
        recurrence_id: Option<NaiveDateTime>,
        slot: &Slot,
    ) -> CalendarEntry {
        CalendarEntry {
            uid: uid.to_string(),
            sequence,
            recurrence_id,
            period: slot.period,
            summary: slot.subject.clone(),
            location: slot.location_text(),
            description: slot.comments.clone(),
            attendees: slot.attendees.clone(),
            rrule: None,
            exdates: Vec::new(),
            cancelled: slot.cancelled,
        }
    }
}
