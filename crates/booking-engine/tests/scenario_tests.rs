//! End-to-end booking scenarios through the editor and the in-memory
//! collaborators.

use booking_engine::memory::{
    CalendarCall, CollectingDispatcher, InMemoryRepository, RecordingCalendar, StaticTimeZones,
};
use booking_engine::ports::ReservationRepository;
use booking_engine::{
    BatchScope, BookingError, BookingRequest, DateListGenerator, EditScope, EngineConfig,
    OccurrenceStatus, RecurrenceEnd, RecurrencePattern, Reservable, ReservationEditor,
    ReservationId, ReservationOccurrence, Series, Warning,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};

type Editor = ReservationEditor<InMemoryRepository, RecordingCalendar, CollectingDispatcher>;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn at(date: NaiveDate, hour: u32) -> NaiveDateTime {
    date.and_hms_opt(hour, 0, 0).unwrap()
}

fn editor() -> Editor {
    ReservationEditor::new(
        EngineConfig::default(),
        InMemoryRepository::new(),
        Some(RecordingCalendar::new()),
        CollectingDispatcher::default(),
        Box::new(StaticTimeZones::new().with("zrh", "Europe/Zurich")),
    )
}

fn room(id: &str) -> Reservable {
    Reservable::room(id, "zrh")
}

fn daily_request(rooms: &[&str], start: NaiveDate, count: u32) -> BookingRequest {
    BookingRequest {
        start: at(start, 9),
        end: at(start, 10),
        subject: "Design review".to_string(),
        attendees: vec!["mo@example.com".to_string(), "sam@example.com".to_string()],
        pattern: Some(RecurrencePattern::daily(start, 1, RecurrenceEnd::Count(count)).unwrap()),
        locations: rooms.iter().map(|r| room(r)).collect(),
        ..BookingRequest::default()
    }
}

fn occurrences_of(editor: &Editor, reservable: &Reservable) -> Vec<ReservationOccurrence> {
    let mut found: Vec<ReservationOccurrence> = editor
        .repo()
        .all()
        .into_iter()
        .filter(|o| &o.reservable == reservable)
        .cloned()
        .collect();
    found.sort_by_key(|o| (o.occurrence_index, o.id));
    found
}

fn id_at(editor: &Editor, reservable: &Reservable, index: u32) -> Option<ReservationId> {
    occurrences_of(editor, reservable)
        .into_iter()
        .find(|o| o.occurrence_index == index && o.is_active())
        .and_then(|o| o.id)
}

// ---------------------------------------------------------------------------
// Scenario A: weekly Monday & Wednesday
// ---------------------------------------------------------------------------

#[test]
fn scenario_a_weekly_monday_wednesday() {
    let pattern = RecurrencePattern::weekly(
        d(2024, 1, 1),
        1,
        vec![Weekday::Mon, Weekday::Wed],
        RecurrenceEnd::Count(3),
    )
    .unwrap();
    let dates = DateListGenerator::default().generate(&pattern).unwrap();
    assert_eq!(dates, vec![d(2024, 1, 1), d(2024, 1, 3), d(2024, 1, 8)]);

    let mut editor = editor();
    let request = BookingRequest {
        pattern: Some(pattern),
        ..daily_request(&["R1"], d(2024, 1, 1), 3)
    };
    editor.submit(&request, &mut BatchScope::new()).unwrap();
    let booked: Vec<NaiveDate> = occurrences_of(&editor, &room("R1"))
        .iter()
        .map(ReservationOccurrence::date)
        .collect();
    assert_eq!(booked, dates);
}

// ---------------------------------------------------------------------------
// Scenario B: editing occurrence 3 and following
// ---------------------------------------------------------------------------

#[test]
fn scenario_b_edit_from_third_occurrence() {
    let mut editor = editor();
    let mut batch = BatchScope::new();
    editor
        .submit(&daily_request(&["R1"], d(2024, 4, 8), 5), &mut batch)
        .unwrap();
    let before = occurrences_of(&editor, &room("R1"));

    let edit = BookingRequest {
        reservation_id: before[2].id,
        scope: EditScope::ThisAndFollowing,
        start: at(d(2024, 4, 10), 14),
        end: at(d(2024, 4, 10), 15),
        ..daily_request(&["R1"], d(2024, 4, 8), 5)
    };
    let outcome = editor.submit(&edit, &mut batch).unwrap();
    assert_eq!(outcome.updated.len(), 3);
    assert!(outcome.created.is_empty());
    assert!(outcome.cancelled.is_empty());

    let after = occurrences_of(&editor, &room("R1"));
    assert_eq!(after[0].period, before[0].period);
    assert_eq!(after[1].period, before[1].period);
    let fourteen = NaiveTime::from_hms_opt(14, 0, 0).unwrap();
    for (occ, date) in after[2..].iter().zip([d(2024, 4, 10), d(2024, 4, 11), d(2024, 4, 12)]) {
        assert_eq!(occ.date(), date);
        assert_eq!(occ.period.start_time(), fourteen);
        assert!(!occ.is_exception);
    }
}

// ---------------------------------------------------------------------------
// Scenario C: dropping one room from one conference occurrence
// ---------------------------------------------------------------------------

#[test]
fn scenario_c_remove_room_from_one_occurrence() {
    let mut editor = editor();
    let mut batch = BatchScope::new();
    editor
        .submit(&daily_request(&["A", "B"], d(2024, 5, 13), 3), &mut batch)
        .unwrap();
    let before: Vec<ReservationOccurrence> = editor.repo().all().into_iter().cloned().collect();
    let b2 = id_at(&editor, &room("B"), 2).unwrap();

    let edit = BookingRequest {
        reservation_id: Some(b2),
        scope: EditScope::Single,
        start: at(d(2024, 5, 14), 9),
        end: at(d(2024, 5, 14), 10),
        pattern: None,
        ..daily_request(&["A"], d(2024, 5, 13), 3)
    };
    let outcome = editor.submit(&edit, &mut batch).unwrap();
    assert_eq!(outcome.cancelled, vec![b2]);
    assert!(outcome.updated.is_empty());
    assert!(outcome.created.is_empty());

    for old in before {
        let now = editor.repo().occurrence(old.id.unwrap()).unwrap().unwrap();
        if old.id == Some(b2) {
            assert_eq!(now.status, OccurrenceStatus::Cancelled);
        } else {
            assert_eq!(now.status, old.status);
            assert_eq!(now.period, old.period);
        }
    }
    // The calendar occurrence now lists only room A.
    let calendar = editor.calendar().unwrap();
    assert!(matches!(
        calendar.calls.last(),
        Some(CalendarCall::UpdateOccurrence { recurrence_id: Some(_), .. })
    ));
    let last = calendar.payloads.last().unwrap();
    assert_eq!(last.entries[0].location, room("A").to_string());
}

// ---------------------------------------------------------------------------
// Scenario D: the external series disappeared
// ---------------------------------------------------------------------------

#[test]
fn scenario_d_recreate_lost_series() {
    let mut editor = editor();
    let mut batch = BatchScope::new();
    editor
        .submit(&daily_request(&["R1"], d(2024, 6, 3), 6), &mut batch)
        .unwrap();
    let original = occurrences_of(&editor, &room("R1"));
    let old_series = original[0].series_id;
    let old_uid = original[0].external_uid.clone().unwrap();

    editor
        .cancel(&[original[0].id.unwrap(), original[1].id.unwrap()], &mut batch)
        .unwrap();
    editor.calendar_mut().unwrap().forget(&old_uid);

    let rename = BookingRequest {
        reservation_id: original[2].id,
        subject: "Design review (moved to new tool)".to_string(),
        ..daily_request(&["R1"], d(2024, 6, 3), 6)
    };
    let outcome = editor.submit(&rename, &mut batch).unwrap();
    assert_eq!(outcome.updated.len(), 4);
    assert!(outcome.warnings.iter().any(|w| matches!(
        w,
        Warning::SeriesRecreated { previous_uid, occurrences: 4, .. } if *previous_uid == old_uid
    )));

    let survivors: Vec<ReservationOccurrence> = occurrences_of(&editor, &room("R1"))
        .into_iter()
        .filter(|o| o.is_active())
        .collect();
    let indices: Vec<u32> = survivors.iter().map(|o| o.occurrence_index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    let new_series = survivors[0].series_id;
    assert_ne!(new_series, old_series);
    assert!(survivors.iter().all(|o| o.series_id == new_series));
    assert_eq!(survivors[0].date(), d(2024, 6, 5));
    assert!(survivors
        .iter()
        .all(|o| o.external_uid.as_deref() != Some(old_uid.as_str())));

    let series = editor.repo().series(new_series.unwrap()).unwrap().unwrap();
    assert_eq!(series.pattern.start, d(2024, 6, 5));
    assert_eq!(series.pattern.count(), Some(4));
}

// ---------------------------------------------------------------------------
// Scenario E: a conference call one room cannot take
// ---------------------------------------------------------------------------

#[test]
fn scenario_e_conference_with_taken_room_books_nothing() {
    let mut editor = editor();
    let mut batch = BatchScope::new();
    let blocker = BookingRequest {
        subject: "Interview".to_string(),
        pattern: None,
        ..daily_request(&["B"], d(2024, 3, 4), 1)
    };
    editor.submit(&blocker, &mut batch).unwrap();
    let calls = editor.calendar().unwrap().calls.len();

    let err = editor
        .submit(&daily_request(&["A", "B"], d(2024, 3, 4), 3), &mut batch)
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::ReservableUnavailable { ref reservable, date }
            if *reservable == room("B") && date == d(2024, 3, 4)
    ));
    // Room A comes first and was free; it must not have been booked either.
    assert!(occurrences_of(&editor, &room("A")).is_empty());
    assert_eq!(editor.repo().all().len(), 1);
    assert_eq!(editor.calendar().unwrap().calls.len(), calls);
}

// ---------------------------------------------------------------------------
// Scenario F: moving the first occurrence does not drag the series
// ---------------------------------------------------------------------------

#[test]
fn scenario_f_moved_first_occurrence_keeps_series_dates() {
    let mut editor = editor();
    let mut batch = BatchScope::new();
    editor
        .submit(&daily_request(&["R1"], d(2024, 3, 4), 3), &mut batch)
        .unwrap();
    let booked = occurrences_of(&editor, &room("R1"));
    let series_id = booked[0].series_id.unwrap();

    let move_first = BookingRequest {
        reservation_id: booked[0].id,
        scope: EditScope::Single,
        start: at(d(2024, 3, 2), 9),
        end: at(d(2024, 3, 2), 10),
        pattern: None,
        ..daily_request(&["R1"], d(2024, 3, 4), 3)
    };
    editor.submit(&move_first, &mut batch).unwrap();
    let series = editor.repo().series(series_id).unwrap().unwrap();
    assert_eq!(series.pattern.start, d(2024, 3, 4));

    let rename = BookingRequest {
        reservation_id: booked[1].id,
        subject: "Design review (renamed)".to_string(),
        ..daily_request(&["R1"], d(2024, 3, 4), 3)
    };
    editor.submit(&rename, &mut batch).unwrap();

    let after = occurrences_of(&editor, &room("R1"));
    let dates: Vec<NaiveDate> = after.iter().map(ReservationOccurrence::date).collect();
    assert_eq!(dates, vec![d(2024, 3, 2), d(2024, 3, 5), d(2024, 3, 6)]);
    assert!(after[0].is_exception);
    assert!(after.iter().all(|o| o.subject == "Design review (renamed)"));
    let series = editor.repo().series(series_id).unwrap().unwrap();
    assert_eq!(series.pattern.start, d(2024, 3, 4));
}

#[test]
fn scenario_f_drifted_stored_start_is_realigned() {
    let mut editor = editor();
    let mut batch = BatchScope::new();
    editor
        .submit(&daily_request(&["R1"], d(2024, 3, 4), 3), &mut batch)
        .unwrap();
    let booked = occurrences_of(&editor, &room("R1"));
    let series_id = booked[0].series_id.unwrap();
    let move_first = BookingRequest {
        reservation_id: booked[0].id,
        scope: EditScope::Single,
        start: at(d(2024, 3, 2), 9),
        end: at(d(2024, 3, 2), 10),
        pattern: None,
        ..daily_request(&["R1"], d(2024, 3, 4), 3)
    };
    editor.submit(&move_first, &mut batch).unwrap();

    // A series stored with its start on the moved first occurrence.
    let drifted = RecurrencePattern::daily(d(2024, 3, 2), 1, RecurrenceEnd::Count(3)).unwrap();
    editor
        .repo_mut()
        .save_series(Series {
            id: series_id,
            pattern: drifted.clone(),
            conference_id: None,
        })
        .unwrap();

    let rename = BookingRequest {
        reservation_id: booked[2].id,
        subject: "Design review (renamed)".to_string(),
        pattern: Some(drifted),
        ..daily_request(&["R1"], d(2024, 3, 4), 3)
    };
    editor.submit(&rename, &mut batch).unwrap();

    let dates: Vec<NaiveDate> = occurrences_of(&editor, &room("R1"))
        .iter()
        .map(ReservationOccurrence::date)
        .collect();
    assert_eq!(dates, vec![d(2024, 3, 2), d(2024, 3, 5), d(2024, 3, 6)]);
    let series = editor.repo().series(series_id).unwrap().unwrap();
    assert_eq!(series.pattern.start, d(2024, 3, 4));

    let pushed = editor
        .calendar()
        .unwrap()
        .payloads
        .iter()
        .rev()
        .find(|p| p.entries[0].rrule.is_some())
        .unwrap();
    assert_eq!(pushed.entries[0].period.date(), d(2024, 3, 4));
    assert!(pushed.entries[0].exdates.is_empty());
}

// ---------------------------------------------------------------------------
// Scenario G: this-and-following with a new rhythm splits the series
// ---------------------------------------------------------------------------

#[test]
fn scenario_g_new_rhythm_from_third_occurrence() {
    let mut editor = editor();
    let mut batch = BatchScope::new();
    editor
        .submit(&daily_request(&["R1"], d(2024, 4, 8), 5), &mut batch)
        .unwrap();
    let before = occurrences_of(&editor, &room("R1"));
    let old_uid = before[0].external_uid.clone().unwrap();

    let edit = BookingRequest {
        reservation_id: before[2].id,
        scope: EditScope::ThisAndFollowing,
        start: at(d(2024, 4, 10), 9),
        end: at(d(2024, 4, 10), 10),
        pattern: Some(RecurrencePattern::daily(d(2024, 4, 8), 2, RecurrenceEnd::Count(5)).unwrap()),
        ..daily_request(&["R1"], d(2024, 4, 8), 5)
    };
    editor.submit(&edit, &mut batch).unwrap();

    let moved = editor.repo().occurrence(before[2].id.unwrap()).unwrap().unwrap();
    let new_uid = moved.external_uid.clone().unwrap();
    assert_ne!(moved.series_id, before[0].series_id);
    assert_ne!(new_uid, old_uid);
    let earlier = editor.repo().occurrence(before[0].id.unwrap()).unwrap().unwrap();
    assert_eq!(earlier.external_uid.as_deref(), Some(old_uid.as_str()));

    // The earlier part is cut back, the moved part is a new appointment.
    let calls = &editor.calendar().unwrap().calls;
    assert!(matches!(
        &calls[calls.len() - 2],
        CalendarCall::UpdateSeries { uid, .. } if *uid == old_uid
    ));
    assert_eq!(calls.last(), Some(&CalendarCall::Create { uid: new_uid }));
    let cut = editor
        .calendar()
        .unwrap()
        .payloads
        .iter()
        .rev()
        .find(|p| p.uid() == Some(old_uid.as_str()))
        .unwrap();
    assert_eq!(
        cut.entries[0].rrule.as_deref(),
        Some("FREQ=DAILY;INTERVAL=1;COUNT=2")
    );
}
