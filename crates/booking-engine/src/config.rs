//! Engine configuration: built-in defaults, an optional TOML file, then
//! `BOOKING_*` environment variables, later sources winning.

use chrono_tz::Tz;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::conflict::ConflictPolicy;
use crate::datelist::DEFAULT_MAX_DATES;
use crate::dst::DstPolicy;
use crate::error::Result;

pub const DEFAULT_CONFIG_FILE: &str = "booking";
pub const DEFAULT_PRODUCT_ID: &str = "-//Room Bookings//booking-engine//EN";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Cap on generated dates per pattern.
    pub max_dates: usize,
    pub conflict_policy: ConflictPolicy,
    pub dst_policy: DstPolicy,
    /// Used for resources and for buildings without a known timezone.
    pub default_timezone: Tz,
    /// Project edits onto the external calendar service.
    pub calendar_sync: bool,
    /// `PRODID` of generated `.ics` documents.
    pub product_id: String,
    #[serde(default)]
    pub organizer: Option<String>,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_dates: DEFAULT_MAX_DATES,
            conflict_policy: ConflictPolicy::default(),
            dst_policy: DstPolicy::default(),
            default_timezone: Tz::UTC,
            calendar_sync: true,
            product_id: DEFAULT_PRODUCT_ID.to_string(),
            organizer: None,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from `booking.toml` in the working directory, if present.
    ///
    /// # Errors
    /// Returns `BookingError::Config` if a source cannot be read or a value
    /// does not deserialize.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load with `path` as the optional file source. The extension may be
    /// omitted.
    ///
    /// # Errors
    /// Same as [`EngineConfig::load`].
    pub fn load_from(path: &str) -> Result<Self> {
        let max_dates = i64::try_from(DEFAULT_MAX_DATES).unwrap_or(i64::MAX);
        Ok(Config::builder()
            .set_default("max_dates", max_dates)?
            .set_default("conflict_policy", "strict")?
            .set_default("dst_policy", "wall_clock")?
            .set_default("default_timezone", "UTC")?
            .set_default("calendar_sync", true)?
            .set_default("product_id", DEFAULT_PRODUCT_ID)?
            .set_default("log_level", "info")?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("BOOKING")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<EngineConfig>()?)
    }
}
