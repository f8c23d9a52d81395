//! Error types for booking-engine operations.
//!
//! Only failures that abort an operation live here. Problems scoped to one
//! occurrence (an unavailable room, a calendar push that failed) are collected
//! as [`crate::outcome::Warning`]s instead, so a single bad date never takes
//! its siblings down with it.

use chrono::NaiveDate;
use thiserror::Error;

use crate::model::{ReservationId, Reservable, SeriesId};

#[derive(Error, Debug)]
pub enum BookingError {
    /// The pattern produced no dates at all.
    #[error("Recurrence pattern produced no dates")]
    PatternEmpty,

    /// The pattern itself is malformed (zero interval, empty weekday set, ...).
    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// A series the caller believed to be new already exists for the same
    /// external uid and reservable. Usually a double submission.
    #[error("Series creation timed out: {external_uid} already booked on {reservable}")]
    CreationTimeout {
        external_uid: String,
        reservable: Reservable,
    },

    /// The reservable is booked at the requested time and the conflict policy
    /// does not allow recording a conflict for this occurrence.
    #[error("{reservable} is unavailable on {date}")]
    ReservableUnavailable { reservable: Reservable, date: NaiveDate },

    /// A reservation, series or room reference could not be resolved.
    #[error("Unknown reservable: {0}")]
    UnknownReservable(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("Series not found: {0}")]
    SeriesNotFound(SeriesId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Failure reported by a [`crate::ports::ReservationRepository`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Failure reported by an [`crate::ports::ExternalCalendarService`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalendarError {
    /// The external system no longer knows the appointment series.
    #[error("External series not found: {0}")]
    SeriesNotFound(String),

    #[error("Calendar service error: {0}")]
    Service(String),
}

/// Failure reported by a [`crate::ports::NotificationDispatcher`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotificationError {
    #[error("Notification transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, BookingError>;
