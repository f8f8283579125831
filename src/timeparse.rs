//! Turns site-local, ambiguous or partially specified time expressions into
//! absolute UTC instants.
//!
//! Everything goes through [`TimeResolver`], which carries the target zone plus
//! the two per-adapter choices sites disagree on:
//!
//! * [`AlignMode`]: whether an embedded offset is trusted (`convert`) or the
//!   visible wall-clock digits are re-read in the target zone (`shift`).
//! * [`NaiveIso`]: whether an ISO-8601 string without offset is UTC or local.

use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::TimeParseError;

/// Values in `[0, MINUTES_PER_DAY]` are minutes since local midnight.
pub const MINUTES_PER_DAY: f64 = 1440.0;
/// Epoch values at or above this are milliseconds.
pub const EPOCH_MILLIS_FLOOR: f64 = 1e12;
/// Epoch values at or above this (and below [`EPOCH_MILLIS_FLOOR`]) are seconds.
pub const EPOCH_SECONDS_FLOOR: f64 = 1e9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignMode {
    /// Trust the embedded offset.
    #[default]
    Convert,
    /// Trust the visible digits; drop the offset and relocalize.
    Shift,
}

/// Interpretation of an ISO-8601 timestamp that carries no offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NaiveIso {
    Utc,
    #[default]
    Local,
}

static RE_MERIDIEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*\b([ap])\.?\s?m\.?\s*$").unwrap());
static RE_HOURS_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d)\s*(?:hrs?|h)\.?\s*$").unwrap());
static RE_CLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,2})(?:[:.h ](\d{2}))?(?::(\d{2}))?(?:\s*(AM|PM))?$").unwrap()
});
static RE_TIME_SHAPED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,2}[:. ]\d{2}(?:\s*(?:AM|PM))?$").unwrap());

/// Canonicalizes AM/PM markers (`a. m.`, `p.m.`, `pm`) and whitespace.
pub fn normalize_meridiem(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let without_suffix = RE_HOURS_SUFFIX.replace(&collapsed, "$1");
    match RE_MERIDIEM.captures(&without_suffix) {
        Some(caps) => {
            let marker = if caps[1].eq_ignore_ascii_case("a") {
                "AM"
            } else {
                "PM"
            };
            let head = &without_suffix[..caps.get(0).map_or(0, |m| m.start())];
            format!("{} {}", head.trim_end(), marker)
        }
        None => without_suffix.into_owned(),
    }
}

/// True for tokens such as `6:30 AM`, `22.15` or `1 05 pm`.
pub fn looks_like_time(text: &str) -> bool {
    let norm = normalize_meridiem(text.trim()).to_uppercase();
    RE_TIME_SHAPED.is_match(&norm)
}

/// Parses a bare clock string (`6:30 AM`, `22:15`, `6 p. m.`, `21.00h`).
pub fn parse_clock(text: &str) -> Result<NaiveTime, TimeParseError> {
    let norm = normalize_meridiem(text.trim()).to_uppercase();
    let caps = RE_CLOCK
        .captures(&norm)
        .ok_or_else(|| TimeParseError::new(text))?;
    let mut hour: u32 = caps[1].parse().map_err(|_| TimeParseError::new(text))?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().map_err(|_| TimeParseError::new(text))?,
        None => 0,
    };
    let second: u32 = match caps.get(3) {
        Some(s) => s.as_str().parse().map_err(|_| TimeParseError::new(text))?,
        None => 0,
    };
    match caps.get(4).map(|m| m.as_str()) {
        Some(meridiem) => {
            if !(1..=12).contains(&hour) {
                return Err(TimeParseError::new(text));
            }
            if meridiem == "PM" && hour != 12 {
                hour += 12;
            } else if meridiem == "AM" && hour == 12 {
                hour = 0;
            }
        }
        // a lone number with no minutes is not a clock time
        None if caps.get(2).is_none() => return Err(TimeParseError::new(text)),
        None => {}
    }
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| TimeParseError::new(text))
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%:z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S%:z",
    "%Y%m%dT%H%M%S%:z",
    "%Y%m%dT%H%M%S%z",
    "%Y%m%dT%H%M%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y%m%dT%H%M%S",
    "%Y%m%dT%H%M",
];

fn parse_with_offset(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = match text.strip_suffix('Z').or_else(|| text.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => text.to_string(),
    };
    OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(&text, fmt).ok())
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

/// Resolves time expressions for one target zone.
#[derive(Debug, Clone, Copy)]
pub struct TimeResolver {
    tz: Tz,
    mode: AlignMode,
    naive_iso: NaiveIso,
}

impl TimeResolver {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            mode: AlignMode::Convert,
            naive_iso: NaiveIso::Local,
        }
    }

    pub fn with_mode(mut self, mode: AlignMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_naive_iso(mut self, naive_iso: NaiveIso) -> Self {
        self.naive_iso = naive_iso;
        self
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// The calendar date `now` falls on in the target zone.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Interprets a wall-clock value in the target zone.
    ///
    /// Ambiguous (fall-back) times take the earlier instant; times that fall in
    /// a spring-forward gap are moved past the gap.
    pub fn localize(&self, naive: NaiveDateTime) -> Result<DateTime<Utc>, TimeParseError> {
        let local = match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => self
                .tz
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest(),
        };
        local
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| TimeParseError::new(naive.to_string()))
    }

    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>, TimeParseError> {
        self.localize(date.and_time(time))
    }

    fn align(&self, dt: DateTime<FixedOffset>) -> Result<DateTime<Utc>, TimeParseError> {
        match self.mode {
            AlignMode::Convert => Ok(dt.with_timezone(&Utc)),
            AlignMode::Shift => self.localize(dt.naive_local()),
        }
    }

    /// Resolves a textual time: ISO-8601 (with or without offset), compact
    /// `YYYYMMDDTHHMMSS[Z]`, or a clock string anchored on `base`.
    pub fn resolve(&self, text: &str, base: NaiveDate) -> Result<DateTime<Utc>, TimeParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(TimeParseError::new(text));
        }
        if let Some(dt) = parse_with_offset(trimmed) {
            return self.align(dt);
        }
        if let Some(naive) = parse_naive(trimmed) {
            return match self.naive_iso {
                NaiveIso::Utc => Ok(Utc.from_utc_datetime(&naive)),
                NaiveIso::Local => self.localize(naive),
            };
        }
        // bare numbers mean the same as their JSON counterparts
        if trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
            && let Ok(value) = trimmed.parse::<f64>()
        {
            return self.resolve_number(value, base);
        }
        let time = parse_clock(trimmed)?;
        self.at(base, time)
    }

    /// Resolves a numeric encoding.
    ///
    /// | value                         | meaning                     |
    /// |-------------------------------|-----------------------------|
    /// | `0 ..= 1440`                  | minutes since local midnight of `base` |
    /// | `1e9 .. 1e12`                 | Unix epoch seconds          |
    /// | `>= 1e12`                     | Unix epoch milliseconds     |
    /// | anything else                 | error                       |
    pub fn resolve_number(&self, value: f64, base: NaiveDate) -> Result<DateTime<Utc>, TimeParseError> {
        if !value.is_finite() || value < 0.0 {
            return Err(TimeParseError::new(value.to_string()));
        }
        if value <= MINUTES_PER_DAY {
            let midnight = base.and_time(NaiveTime::MIN);
            return self.localize(midnight + Duration::minutes(value as i64));
        }
        let instant = if value >= EPOCH_MILLIS_FLOOR {
            DateTime::from_timestamp_millis(value as i64)
        } else if value >= EPOCH_SECONDS_FLOOR {
            DateTime::from_timestamp(value as i64, 0)
        } else {
            None
        };
        instant.ok_or_else(|| TimeParseError::new(value.to_string()))
    }

    /// Resolves a loosely typed JSON value (number or string).
    pub fn resolve_json(&self, value: &serde_json::Value, base: NaiveDate) -> Result<DateTime<Utc>, TimeParseError> {
        match value {
            serde_json::Value::Number(n) => {
                let x = n.as_f64().ok_or_else(|| TimeParseError::new(n.to_string()))?;
                self.resolve_number(x, base)
            }
            serde_json::Value::String(s) => self.resolve(s, base),
            other => Err(TimeParseError::new(other.to_string())),
        }
    }
}

/// Resolves `text` in `timezone` against `base`, trusting embedded offsets.
pub fn resolve(text: &str, base: NaiveDate, timezone: Tz) -> Result<DateTime<Utc>, TimeParseError> {
    TimeResolver::new(timezone).resolve(text, base)
}
