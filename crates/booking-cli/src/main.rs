//! `booking` CLI: expand recurrence patterns, translate them to and from
//! RRULEs, and render calendar payloads as `.ics`.
//!
//! ## Usage
//!
//! ```sh
//! # Dates of a pattern (stdin → stdout)
//! echo '{"type":"weekly","weekdays":["Mon","Wed"],"interval":1,"start":"2024-01-01","end":{"count":3}}' \
//!   | booking expand
//!
//! # Indexed dates as JSON, capped at 10
//! booking expand -i pattern.json --max 10 --json
//!
//! # Pattern → RRULE for a 09:00-10:00 booking in Zurich
//! booking rrule -i pattern.json --from 09:00 --to 10:00 --tz Europe/Zurich
//!
//! # RRULE → pattern JSON
//! booking parse-rule "FREQ=DAILY;INTERVAL=1;COUNT=3" --start 2024-01-01
//!
//! # Render a calendar payload
//! booking ics -i payload.json -o invite.ics
//! ```
//!
//! Settings come from `booking.toml` (or `--config`) and `BOOKING_*`
//! environment variables. Logs go to stderr, filtered by `RUST_LOG` or the
//! configured `log_level`.

use anyhow::{Context, Result};
use booking_engine::config::DEFAULT_CONFIG_FILE;
use booking_engine::{
    from_rule, to_rule, CalendarPayload, DateListGenerator, DstPolicy, EngineConfig,
    RecurrencePattern, TimePeriod,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Read, Write};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "booking", version, about = "Recurring room booking tools")]
struct Cli {
    /// Configuration file; the extension may be omitted
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a pattern (JSON) into its dates
    Expand {
        /// Input file (reads from stdin if omitted)
        #[arg(short, long)]
        input: Option<String>,
        /// Output file (writes to stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
        /// Cap on generated dates (defaults to the configured max_dates)
        #[arg(long)]
        max: Option<usize>,
        /// Print `[{"index":..,"date":..}]` instead of one date per line
        #[arg(long)]
        json: bool,
    },
    /// Translate a pattern (JSON) into an RRULE
    Rrule {
        /// Input file (reads from stdin if omitted)
        #[arg(short, long)]
        input: Option<String>,
        #[command(flatten)]
        times: Times,
    },
    /// Translate an RRULE back into a pattern (JSON)
    ParseRule {
        /// RRULE value, with or without the `RRULE:` prefix
        rule: String,
        /// Series start date (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        #[command(flatten)]
        times: Times,
    },
    /// Render a calendar payload (JSON) as an iCalendar document
    Ics {
        /// Input file (reads from stdin if omitted)
        #[arg(short, long)]
        input: Option<String>,
        /// Output file (writes to stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
        /// DTSTAMP as RFC 3339 (defaults to now)
        #[arg(long)]
        stamp: Option<DateTime<Utc>>,
    },
}

/// Occurrence times used to anchor a rule.
#[derive(Args)]
struct Times {
    /// Local start time (HH:MM)
    #[arg(long, default_value = "09:00", value_parser = parse_time)]
    from: NaiveTime,
    /// Local end time (HH:MM)
    #[arg(long, default_value = "10:00", value_parser = parse_time)]
    to: NaiveTime,
    /// IANA timezone (defaults to the configured default_timezone)
    #[arg(long, value_parser = parse_tz)]
    tz: Option<Tz>,
    /// DST policy (defaults to the configured dst_policy)
    #[arg(long, value_enum)]
    dst: Option<DstArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum DstArg {
    Skip,
    ShiftForward,
    WallClock,
}

impl From<DstArg> for DstPolicy {
    fn from(arg: DstArg) -> Self {
        match arg {
            DstArg::Skip => DstPolicy::Skip,
            DstArg::ShiftForward => DstPolicy::ShiftForward,
            DstArg::WallClock => DstPolicy::WallClock,
        }
    }
}

impl Times {
    fn period(&self, date: NaiveDate, config: &EngineConfig) -> TimePeriod {
        TimePeriod::on(
            date,
            self.from,
            self.to,
            self.tz.unwrap_or(config.default_timezone),
        )
    }

    fn dst(&self, config: &EngineConfig) -> DstPolicy {
        self.dst.map_or(config.dst_policy, DstPolicy::from)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    init_tracing(&config);
    debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Expand {
            input,
            output,
            max,
            json,
        } => {
            let pattern = read_pattern(input.as_deref())?;
            let generator = DateListGenerator::new(max.unwrap_or(config.max_dates));
            let dates = generator
                .generate_indexed(&pattern, 1)
                .context("Failed to expand pattern")?;
            let text = if json {
                let rows: Vec<serde_json::Value> = dates
                    .iter()
                    .map(|(index, date)| serde_json::json!({ "index": index, "date": date }))
                    .collect();
                let mut text = serde_json::to_string_pretty(&rows)?;
                text.push('\n');
                text
            } else {
                dates.iter().map(|(_, date)| format!("{date}\n")).collect()
            };
            emit(output.as_deref(), "dates", &text)?;
        }
        Commands::Rrule { input, times } => {
            let pattern = read_pattern(input.as_deref())?;
            let template = times.period(pattern.start, &config);
            let rule = to_rule(&pattern, &template, times.dst(&config))
                .context("Failed to translate pattern to RRULE")?;
            println!("{rule}");
        }
        Commands::ParseRule { rule, start, times } => {
            let template = times.period(start, &config);
            let pattern = from_rule(&rule, start, &template)
                .with_context(|| format!("Failed to parse RRULE: {rule}"))?;
            println!("{}", serde_json::to_string_pretty(&pattern)?);
        }
        Commands::Ics {
            input,
            output,
            stamp,
        } => {
            let payload: CalendarPayload = read_json(input.as_deref(), "calendar payload")?;
            let ics = payload.to_ics(&config.product_id, stamp.unwrap_or_else(Utc::now));
            emit(output.as_deref(), "calendar", &ics)?;
        }
    }

    Ok(())
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_time(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| format!("expected HH:MM: {e}"))
}

fn parse_tz(value: &str) -> Result<Tz, String> {
    value
        .parse::<Tz>()
        .map_err(|e| format!("unknown timezone '{value}': {e}"))
}

fn read_pattern(path: Option<&str>) -> Result<RecurrencePattern> {
    let pattern: RecurrencePattern = read_json(path, "pattern")?;
    pattern.validate().context("Invalid recurrence pattern")?;
    Ok(pattern)
}

/// Deserialize a pattern or payload from `path`, or from stdin when piped.
fn read_json<T: DeserializeOwned>(path: Option<&str>, what: &str) -> Result<T> {
    let json = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {what} from {path}"))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .with_context(|| format!("Failed to read {what} from stdin"))?;
            buf
        }
    };
    debug!(what, bytes = json.len(), "input read");
    serde_json::from_str(&json).with_context(|| format!("Failed to parse {what} JSON"))
}

/// Write expanded dates or an `.ics` document to `path`, or to stdout.
fn emit(path: Option<&str>, what: &str, text: &str) -> Result<()> {
    match path {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("Failed to write {what} to {path}"))?;
            debug!(what, path, "output written");
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(text.as_bytes())
                .and_then(|()| stdout.flush())
                .with_context(|| format!("Failed to write {what} to stdout"))?;
        }
    }
    Ok(())
}
