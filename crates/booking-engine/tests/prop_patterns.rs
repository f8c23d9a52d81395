//! Property-based tests for date-list generation and RRULE translation.
//!
//! These hold for any valid pattern, not just the fixed cases in the unit
//! tests: expansion order, the pattern predicate, cropping, and agreement with
//! the `rrule` crate on the rules we emit.

use booking_engine::{
    from_rule, to_rule, DateListGenerator, DstPolicy, RecurrenceEnd, RecurrenceKind,
    RecurrencePattern, TimePeriod, WeekOfMonth,
};
use chrono::{Duration, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use proptest::prelude::*;
use rrule::RRuleSet;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_weekday() -> impl Strategy<Value = Weekday> {
    prop_oneof![
        Just(Weekday::Mon),
        Just(Weekday::Tue),
        Just(Weekday::Wed),
        Just(Weekday::Thu),
        Just(Weekday::Fri),
        Just(Weekday::Sat),
        Just(Weekday::Sun),
    ]
}

fn arb_week() -> impl Strategy<Value = WeekOfMonth> {
    prop_oneof![
        Just(WeekOfMonth::First),
        Just(WeekOfMonth::Second),
        Just(WeekOfMonth::Third),
        Just(WeekOfMonth::Fourth),
        Just(WeekOfMonth::Last),
    ]
}

/// Yearly days stop at 28 so every (month, day) exists at least once.
fn arb_kind() -> impl Strategy<Value = RecurrenceKind> {
    prop_oneof![
        Just(RecurrenceKind::Daily),
        prop::collection::vec(arb_weekday(), 1..4)
            .prop_map(|weekdays| RecurrenceKind::Weekly { weekdays }),
        (1u32..=31).prop_map(|day| RecurrenceKind::MonthlyByDate { day }),
        (arb_week(), arb_weekday())
            .prop_map(|(week, weekday)| RecurrenceKind::MonthlyByWeekday { week, weekday }),
        (1u32..=12, 1u32..=28).prop_map(|(month, day)| RecurrenceKind::YearlyByDate { month, day }),
        (1u32..=12, arb_week(), arb_weekday())
            .prop_map(|(month, week, weekday)| RecurrenceKind::YearlyByWeekday {
                month,
                week,
                weekday
            }),
    ]
}

fn arb_start() -> impl Strategy<Value = NaiveDate> {
    (2024i32..=2026, 1u32..=12, 1u32..=28)
        .prop_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn arb_pattern() -> impl Strategy<Value = RecurrencePattern> {
    (arb_kind(), 1u32..=4, arb_start(), any::<bool>(), 1u32..=40, 30i64..=900).prop_filter_map(
        "pattern must validate",
        |(kind, interval, start, by_count, count, days)| {
            let end = if by_count {
                RecurrenceEnd::Count(count)
            } else {
                RecurrenceEnd::Until(start + Duration::days(days))
            };
            RecurrencePattern::new(kind, interval, start, end).ok()
        },
    )
}

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    }
}

fn template(date: NaiveDate) -> TimePeriod {
    TimePeriod::on(
        date,
        NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        Tz::UTC,
    )
}

fn generous() -> DateListGenerator {
    DateListGenerator::new(5_000)
}

// ---------------------------------------------------------------------------
// Property 1: strictly ascending, every date on the pattern
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(config())]

    #[test]
    fn dates_ascend_and_match(pattern in arb_pattern()) {
        if let Ok(dates) = generous().generate(&pattern) {
            for window in dates.windows(2) {
                prop_assert!(window[0] < window[1], "not ascending: {} >= {}", window[0], window[1]);
            }
            for date in &dates {
                prop_assert!(*date >= pattern.start);
                prop_assert!(pattern.matches(*date), "{} does not match {:?}", date, pattern);
            }
            if let Some(count) = pattern.count() {
                prop_assert_eq!(dates.len(), count as usize);
            }
            if let Some(until) = pattern.until() {
                prop_assert!(dates.iter().all(|d| *d <= until));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Property 2: cropping keeps the chronological prefix
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(config())]

    #[test]
    fn cropping_is_a_prefix(pattern in arb_pattern(), cap in 1usize..=20) {
        if let Ok(full) = generous().generate(&pattern) {
            let cropped = DateListGenerator::new(cap).generate(&pattern).unwrap();
            prop_assert_eq!(cropped.len(), cap.min(full.len()));
            prop_assert_eq!(&cropped[..], &full[..cropped.len()]);
        }
    }
}

// ---------------------------------------------------------------------------
// Property 3: the emitted rule expands to the same dates in `rrule`
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(config())]

    #[test]
    fn rule_agrees_with_rrule_crate(pattern in arb_pattern()) {
        let Ok(dates) = generous().generate(&pattern) else {
            return Ok(());
        };
        // Anchor DTSTART on an actual occurrence; a DTSTART off the pattern
        // is counted differently by RFC 5545 implementations.
        let first = dates[0];
        let anchored = pattern.starting_at(first, 0);
        let rule = to_rule(&anchored, &template(first), DstPolicy::WallClock).unwrap();
        let text = format!("DTSTART:{}\nRRULE:{}", first.format("%Y%m%dT090000Z"), rule);
        let set: RRuleSet = text.parse().unwrap();
        let expanded: Vec<NaiveDate> = set.all(u16::MAX).dates.iter().map(|d| d.date_naive()).collect();
        prop_assert_eq!(expanded, dates, "rule {}", rule);
    }
}

// ---------------------------------------------------------------------------
// Property 4: to_rule → from_rule reproduces the occurrence set
// ---------------------------------------------------------------------------
proptest! {
    #![proptest_config(config())]

    #[test]
    fn rule_round_trips(pattern in arb_pattern()) {
        let period = template(pattern.start);
        let rule = to_rule(&pattern, &period, DstPolicy::WallClock).unwrap();
        let parsed = from_rule(&rule, pattern.start, &period).unwrap();
        prop_assert_eq!(&parsed.kind, &pattern.kind);
        prop_assert_eq!(parsed.interval, pattern.interval);
        prop_assert_eq!(generous().generate(&parsed).ok(), generous().generate(&pattern).ok());
    }
}
