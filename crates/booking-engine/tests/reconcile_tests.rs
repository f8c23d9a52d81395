//! Reconciliation invariants across whole edit sequences.

use booking_engine::conference::{ConferenceCallCoordinator, ConferenceEdit};
use booking_engine::memory::InMemoryRepository;
use booking_engine::ports::ReservationRepository;
use booking_engine::reconcile::OccurrenceTemplate;
use booking_engine::{
    ConferenceId, EditOutcome, EditScope, OccurrenceReconciler, OccurrenceStatus, RecurrenceEnd,
    RecurrenceKind, RecurrencePattern, Reservable, ReservationOccurrence, SeriesEdit, SeriesId,
    TimePeriod,
};
use chrono::{NaiveDate, NaiveTime, Weekday};
use proptest::prelude::*;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn period(date: NaiveDate, h0: u32, h1: u32) -> TimePeriod {
    TimePeriod::on(
        date,
        NaiveTime::from_hms_opt(h0, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(h1, 0, 0).unwrap(),
        chrono_tz::America::New_York,
    )
}

fn template(date: NaiveDate, h0: u32, h1: u32) -> OccurrenceTemplate {
    OccurrenceTemplate {
        period: period(date, h0, h1),
        subject: "Quarterly planning".to_string(),
        attendees: vec!["ops@example.com".to_string()],
        comments: String::new(),
        external_uid: None,
    }
}

fn room(id: &str) -> Reservable {
    Reservable::room(id, "nyc")
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

fn arb_pattern() -> impl Strategy<Value = RecurrencePattern> {
    let kind = prop_oneof![
        Just(RecurrenceKind::Daily),
        Just(RecurrenceKind::Weekly {
            weekdays: vec![Weekday::Tue, Weekday::Thu]
        }),
        (1u32..=28).prop_map(|day| RecurrenceKind::MonthlyByDate { day }),
    ];
    (kind, 1u32..=3, 1u32..=28, 1u32..=25).prop_map(|(kind, interval, day, count)| {
        RecurrencePattern::new(kind, interval, d(2025, 2, day), RecurrenceEnd::Count(count)).unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn reconciling_matching_series_changes_nothing(pattern in arb_pattern(), hour in 7u32..=18) {
        let mut repo = InMemoryRepository::new();
        let reconciler = OccurrenceReconciler::default();
        let first = booking_engine::DateListGenerator::default().generate(&pattern).unwrap()[0];
        let edit = SeriesEdit {
            reservation_id: None,
            reservable: room("R1"),
            template: template(first, hour, hour + 1),
            pattern: Some(pattern.clone()),
            scope: EditScope::Series,
        };
        let saved = reconciler.reconcile(&mut repo, &edit, &mut EditOutcome::default()).unwrap();
        prop_assert_eq!(saved.len() as u32, pattern.count().unwrap());

        for scope in [EditScope::Series, EditScope::ThisAndFollowing] {
            let again = SeriesEdit {
                reservation_id: saved[0].id,
                scope,
                ..edit.clone()
            };
            let mut outcome = EditOutcome::default();
            reconciler.reconcile(&mut repo, &again, &mut outcome).unwrap();
            prop_assert_eq!(outcome.change_count(), 0, "scope {:?}", scope);
        }
    }
}

// ---------------------------------------------------------------------------
// Conference-group invariant
// ---------------------------------------------------------------------------

fn assert_consistent(repo: &InMemoryRepository, conference_id: ConferenceId) {
    let group = ConferenceCallCoordinator::default()
        .group(repo, conference_id)
        .unwrap();
    assert!(group.is_consistent(), "inconsistent group: {group:#?}");
}

#[test]
fn conference_stays_consistent_through_edits() {
    let mut repo = InMemoryRepository::new();
    let coordinator = ConferenceCallCoordinator::default();
    let weekly = RecurrencePattern::weekly(
        d(2025, 3, 3),
        1,
        vec![Weekday::Mon, Weekday::Wed],
        RecurrenceEnd::Count(6),
    )
    .unwrap();
    let base = ConferenceEdit {
        reservation_id: None,
        locations: vec![room("A"), room("B")],
        template: template(d(2025, 3, 3), 10, 11),
        pattern: Some(weekly.clone()),
        scope: EditScope::Series,
    };
    let mut outcome = EditOutcome::default();
    let saved = coordinator.edit(&mut repo, &base, &mut outcome).unwrap();
    let conference_id = saved[0].conference_id.unwrap();
    assert_consistent(&repo, conference_id);

    let member = |repo: &InMemoryRepository, reservable: &Reservable, index: u32| {
        repo.conference_members(conference_id)
            .unwrap()
            .into_iter()
            .find(|o| &o.reservable == reservable && o.occurrence_index == index && o.is_active())
            .and_then(|o| o.id)
    };

    // Move occurrence 2 in room B only; room A follows.
    let single = ConferenceEdit {
        reservation_id: member(&repo, &room("B"), 2),
        template: template(d(2025, 3, 6), 15, 16),
        pattern: None,
        scope: EditScope::Single,
        ..base.clone()
    };
    coordinator.edit(&mut repo, &single, &mut outcome).unwrap();
    assert_consistent(&repo, conference_id);
    let group = coordinator.group(&repo, conference_id).unwrap();
    assert_eq!(group.occurrence(2).unwrap().period, period(d(2025, 3, 6), 15, 16));

    // Add room C from occurrence 4 on at a new time.
    let following = ConferenceEdit {
        reservation_id: member(&repo, &room("A"), 4),
        locations: vec![room("A"), room("B"), room("C")],
        template: template(d(2025, 3, 12), 8, 9),
        scope: EditScope::ThisAndFollowing,
        ..base.clone()
    };
    coordinator.edit(&mut repo, &following, &mut outcome).unwrap();
    assert_consistent(&repo, conference_id);
    let group = coordinator.group(&repo, conference_id).unwrap();
    assert_eq!(group.occurrence(3).unwrap().rooms().len(), 2);
    assert_eq!(group.occurrence(4).unwrap().rooms().len(), 3);
    assert_eq!(group.occurrence(6).unwrap().period, period(d(2025, 3, 19), 8, 9));

    // Whole-series subject change keeps the moved occurrence 2.
    let rename = ConferenceEdit {
        reservation_id: member(&repo, &room("A"), 1),
        locations: vec![room("A"), room("B"), room("C")],
        template: OccurrenceTemplate {
            subject: "Renamed".to_string(),
            ..template(d(2025, 3, 3), 10, 11)
        },
        ..base.clone()
    };
    coordinator.edit(&mut repo, &rename, &mut outcome).unwrap();
    assert_consistent(&repo, conference_id);
    let group = coordinator.group(&repo, conference_id).unwrap();
    assert!(group
        .occurrences
        .iter()
        .flat_map(|o| o.active())
        .all(|m| m.subject == "Renamed"));
}

// ---------------------------------------------------------------------------
// Series pattern stays on the regular occurrences
// ---------------------------------------------------------------------------

fn book_daily(repo: &mut InMemoryRepository, start: NaiveDate, count: u32) -> Vec<ReservationOccurrence> {
    let pattern = RecurrencePattern::daily(start, 1, RecurrenceEnd::Count(count)).unwrap();
    OccurrenceReconciler::default()
        .reconcile(
            repo,
            &SeriesEdit {
                reservation_id: None,
                reservable: room("R1"),
                template: template(start, 9, 10),
                pattern: Some(pattern),
                scope: EditScope::Series,
            },
            &mut EditOutcome::default(),
        )
        .unwrap()
}

fn members(repo: &InMemoryRepository, series_id: SeriesId) -> Vec<ReservationOccurrence> {
    let mut found = repo.series_occurrences(series_id, None).unwrap();
    found.sort_by_key(|o| o.occurrence_index);
    found
}

#[test]
fn moving_first_occurrence_keeps_series_start() {
    let mut repo = InMemoryRepository::new();
    let reconciler = OccurrenceReconciler::default();
    let saved = book_daily(&mut repo, d(2025, 1, 6), 3);

    // Pull the first occurrence two days earlier.
    let edit = SeriesEdit {
        reservation_id: saved[0].id,
        reservable: room("R1"),
        template: template(d(2025, 1, 4), 9, 10),
        pattern: None,
        scope: EditScope::Single,
    };
    reconciler.reconcile(&mut repo, &edit, &mut EditOutcome::default()).unwrap();
    let series = repo.series(saved[0].series_id.unwrap()).unwrap().unwrap();
    assert_eq!(series.pattern.start, d(2025, 1, 6));
    let moved = repo.occurrence(saved[0].id.unwrap()).unwrap().unwrap();
    assert_eq!(moved.date(), d(2025, 1, 4));
    assert!(moved.is_exception);
}

#[test]
fn timing_change_leaves_cancelled_occurrence_cancelled() {
    let mut repo = InMemoryRepository::new();
    let reconciler = OccurrenceReconciler::default();
    let saved = book_daily(&mut repo, d(2025, 1, 6), 3);
    repo.cancel(saved[1].id.unwrap()).unwrap();

    let later = SeriesEdit {
        reservation_id: saved[0].id,
        reservable: room("R1"),
        template: template(d(2025, 1, 6), 14, 15),
        pattern: Some(RecurrencePattern::daily(d(2025, 1, 6), 1, RecurrenceEnd::Count(3)).unwrap()),
        scope: EditScope::Series,
    };
    let mut outcome = EditOutcome::default();
    reconciler.reconcile(&mut repo, &later, &mut outcome).unwrap();
    assert_eq!(outcome.updated.len(), 2);
    assert!(outcome.created.is_empty());

    let after = members(&repo, saved[0].series_id.unwrap());
    assert_eq!(after.len(), 3);
    assert_eq!(after[1].status, OccurrenceStatus::Cancelled);
    assert_eq!(after[1].period, saved[1].period);
    assert_eq!(after[0].period, period(d(2025, 1, 6), 14, 15));
    assert_eq!(after[2].period, period(d(2025, 1, 8), 14, 15));
}

#[test]
fn this_and_following_with_new_interval_splits_the_series() {
    let mut repo = InMemoryRepository::new();
    let reconciler = OccurrenceReconciler::default();
    let saved = book_daily(&mut repo, d(2024, 4, 8), 5);
    let old_series = saved[0].series_id.unwrap();

    let every_other_day = RecurrencePattern::daily(d(2024, 4, 8), 2, RecurrenceEnd::Count(5)).unwrap();
    let following = SeriesEdit {
        reservation_id: saved[2].id,
        reservable: room("R1"),
        template: template(d(2024, 4, 10), 9, 10),
        pattern: Some(every_other_day),
        scope: EditScope::ThisAndFollowing,
    };
    let mut outcome = EditOutcome::default();
    reconciler.reconcile(&mut repo, &following, &mut outcome).unwrap();
    assert_eq!(outcome.updated.len(), 3);
    assert!(outcome.created.is_empty());
    assert!(outcome.cancelled.is_empty());

    let earlier = members(&repo, old_series);
    let dates: Vec<NaiveDate> = earlier.iter().map(ReservationOccurrence::date).collect();
    assert_eq!(dates, vec![d(2024, 4, 8), d(2024, 4, 9)]);
    let truncated = repo.series(old_series).unwrap().unwrap().pattern;
    assert_eq!(truncated.count(), Some(2));
    assert_eq!(truncated.start, d(2024, 4, 8));

    let moved = repo.occurrence(saved[2].id.unwrap()).unwrap().unwrap();
    let new_series = moved.series_id.unwrap();
    assert_ne!(new_series, old_series);
    let later = members(&repo, new_series);
    let indexed: Vec<(u32, NaiveDate)> = later.iter().map(|o| (o.occurrence_index, o.date())).collect();
    assert_eq!(
        indexed,
        vec![(1, d(2024, 4, 10)), (2, d(2024, 4, 12)), (3, d(2024, 4, 14))]
    );
    assert!(later.iter().all(|o| !o.is_exception));
    let rebased = repo.series(new_series).unwrap().unwrap().pattern;
    assert_eq!(rebased.start, d(2024, 4, 10));
    assert_eq!(rebased.count(), Some(3));

    // Renaming either part as a whole keeps every date.
    for (first, pattern, start) in [
        (&earlier[0], truncated, d(2024, 4, 8)),
        (&later[0], rebased, d(2024, 4, 10)),
    ] {
        let rename = SeriesEdit {
            reservation_id: first.id,
            reservable: room("R1"),
            template: OccurrenceTemplate {
                subject: "Renamed".to_string(),
                ..template(start, 9, 10)
            },
            pattern: Some(pattern),
            scope: EditScope::Series,
        };
        let mut outcome = EditOutcome::default();
        reconciler.reconcile(&mut repo, &rename, &mut outcome).unwrap();
        assert!(outcome.created.is_empty());
        assert!(outcome.cancelled.is_empty());
    }
    let renamed: Vec<ReservationOccurrence> = members(&repo, old_series)
        .into_iter()
        .chain(members(&repo, new_series))
        .collect();
    let dates: Vec<NaiveDate> = renamed.iter().map(ReservationOccurrence::date).collect();
    assert_eq!(
        dates,
        vec![d(2024, 4, 8), d(2024, 4, 9), d(2024, 4, 10), d(2024, 4, 12), d(2024, 4, 14)]
    );
    assert!(renamed.iter().all(|o| o.subject == "Renamed" && o.is_active()));
}
