//! # booking-engine
//!
//! Recurring room bookings: pattern expansion, occurrence reconciliation,
//! multi-room conference calls and projection onto an external calendar.
//!
//! An edit flows through the crate in one direction. A [`RecurrencePattern`]
//! is expanded into dates, the reconciler diffs the resulting slots against
//! the persisted occurrences, availability is checked per occurrence, and the
//! final state is pushed to the calendar service and to attendees as an
//! iCalendar payload. [`ReservationEditor`] composes all of it.
//!
//! ## Modules
//!
//! - [`datelist`] -- pattern → ascending, capped date list
//! - [`conflict`] -- half-open overlap checks and the conflict policy
//! - [`reconcile`] -- desired state, diff plan and apply for one room
//! - [`conference`] -- keeps every room of a conference call in step
//! - [`recurrence_rule`] -- pattern ⇄ RRULE subset
//! - [`payload`] -- calendar payloads, `.ics` rendering, notifications
//! - [`sync`] -- link state and recovery against the external calendar
//! - [`editor`] -- the composed entry point
//! - [`ports`] -- collaborator traits; [`memory`] implements them in memory
//! - [`error`] -- Error types

pub mod batch;
pub mod conference;
pub mod config;
pub mod conflict;
pub mod datelist;
pub mod dst;
pub mod editor;
pub mod error;
pub mod memory;
pub mod model;
pub mod outcome;
pub mod pattern;
pub mod payload;
pub mod period;
pub mod ports;
pub mod reconcile;
pub mod recurrence_rule;
pub mod sync;
pub mod timezone;

pub use batch::BatchScope;
pub use conference::{ConferenceCallCoordinator, ConferenceCallGroup, ConferenceEdit};
pub use config::EngineConfig;
pub use conflict::{find_conflicts, is_available, ConflictEvaluator, ConflictPolicy};
pub use datelist::DateListGenerator;
pub use dst::DstPolicy;
pub use editor::{BookingRequest, ReservationEditor};
pub use error::{BookingError, CalendarError, NotificationError, RepositoryError, Result};
pub use model::{
    ConferenceId, ExternalAppointmentRef, OccurrenceStatus, Reservable, ReservationId,
    ReservationOccurrence, Series, SeriesId,
};
pub use outcome::{EditOutcome, Warning};
pub use pattern::{RecurrenceEnd, RecurrenceKind, RecurrencePattern, WeekOfMonth};
pub use payload::{CalendarPayload, PayloadBuilder};
pub use period::TimePeriod;
pub use reconcile::{EditScope, OccurrenceReconciler, SeriesEdit};
pub use recurrence_rule::{from_rule, to_rule};
pub use sync::{AppointmentGroup, CalendarSyncAdapter, LinkState, SyncAction};
