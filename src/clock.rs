//! # Clock Strings and Durations
//!
//! Parsers for the two human-facing time grammars used in the configuration:
//!
//! - **Clock times**: `H:MM` / `HH:MM`, optionally followed by `am`/`pm`
//!   (case-insensitive, optional space). `10:30pm`, `7:30 AM`, `22:00`.
//! - **Durations**: concatenated `<digits><unit>` terms with unit one of
//!   `w d h m s`. `1d2h3m4s` is 93784 seconds.
//!
//! Neither parser ever produces a partially-populated value. A bad clock time
//! is an error; a bad or zero duration is an error. Callers decide the fallback.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a clock or duration string was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("missing ':' separator in {0:?}")]
    MissingSeparator(String),

    #[error("hour/minute out of range in {0:?}")]
    OutOfRange(String),

    #[error("not a number in {0:?}")]
    NotANumber(String),

    #[error("unknown duration unit {unit:?} in {input:?}")]
    UnknownUnit { unit: char, input: String },

    #[error("duration term without unit in {0:?}")]
    MissingUnit(String),

    #[error("duration overflows 32 bits in {0:?}")]
    Overflow(String),

    #[error("duration is empty or zero: {0:?}")]
    Empty(String),
}

/// A validated time of day in 24-hour form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl ClockTime {
    /// Build from 24-hour components, rejecting out-of-range values.
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour <= 23 && minute <= 59).then_some(Self { hour, minute })
    }

    /// Minutes elapsed since local midnight (0..1440).
    pub fn minute_of_day(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    /// Parse a clock string such as `10:30pm`, `12:00 AM` or `22:00`.
    ///
    /// 12-hour input must have hour 1-12; `12:xxam` becomes `00:xx` and
    /// `12:xxpm` stays `12:xx`. 24-hour input must have hour 0-23.
    pub fn parse(input: &str) -> Result<Self, ParseFailure> {
        let lowered = input.trim().to_ascii_lowercase();

        let (body, meridiem) = if let Some(rest) = lowered.strip_suffix("am") {
            (rest.trim_end(), Some(false))
        } else if let Some(rest) = lowered.strip_suffix("pm") {
            (rest.trim_end(), Some(true))
        } else {
            (lowered.as_str(), None)
        };

        let (hour_str, minute_str) = body
            .split_once(':')
            .ok_or_else(|| ParseFailure::MissingSeparator(input.to_string()))?;

        let hour = parse_component(hour_str, input)?;
        let minute = parse_component(minute_str, input)?;
        if minute > 59 {
            return Err(ParseFailure::OutOfRange(input.to_string()));
        }

        let hour = match meridiem {
            Some(is_pm) => {
                if !(1..=12).contains(&hour) {
                    return Err(ParseFailure::OutOfRange(input.to_string()));
                }
                match (is_pm, hour) {
                    (false, 12) => 0,
                    (true, 12) => 12,
                    (true, h) => h + 12,
                    (false, h) => h,
                }
            }
            None if hour > 23 => return Err(ParseFailure::OutOfRange(input.to_string())),
            None => hour,
        };

        Ok(Self {
            hour: hour as u8,
            minute: minute as u8,
        })
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl std::str::FromStr for ClockTime {
    type Err = ParseFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_component(part: &str, input: &str) -> Result<u32, ParseFailure> {
    let part = part.trim();
    if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseFailure::NotANumber(input.to_string()));
    }
    part.parse()
        .map_err(|_| ParseFailure::NotANumber(input.to_string()))
}

/// Daily range during which the device stays asleep.
///
/// Start is inclusive, stop is exclusive. When `start > stop` the window
/// wraps past midnight and membership is `t >= start || t < stop`.
/// A zero-width window (`start == stop`) contains nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SleepWindow {
    pub start: ClockTime,
    pub stop: ClockTime,
}

impl SleepWindow {
    /// Build a window from the two configured strings.
    ///
    /// Returns `None` if either string is empty or fails to parse; the
    /// scheduler then behaves as though no window were configured.
    pub fn from_strs(start: &str, stop: &str) -> Option<Self> {
        if start.trim().is_empty() || stop.trim().is_empty() {
            return None;
        }
        let start = ClockTime::parse(start).ok()?;
        let stop = ClockTime::parse(stop).ok()?;
        Some(Self { start, stop })
    }

    pub fn crosses_midnight(&self) -> bool {
        self.start.minute_of_day() > self.stop.minute_of_day()
    }

    /// Whether a minute-of-day (0..1440) falls inside the window.
    pub fn contains_minute(&self, minute_of_day: u16) -> bool {
        let start = self.start.minute_of_day();
        let stop = self.stop.minute_of_day();
        if self.crosses_midnight() {
            minute_of_day >= start || minute_of_day < stop
        } else {
            minute_of_day >= start && minute_of_day < stop
        }
    }

    pub fn contains(&self, time: ClockTime) -> bool {
        self.contains_minute(time.minute_of_day())
    }
}

const MAX_SECONDS: i64 = i32::MAX as i64;

/// Parse a duration string into a positive number of seconds.
///
/// Terms are scanned left to right. Spaces before a term are skipped and any
/// non-digit filler after a unit letter is ignored, so `1h, 30m` works.
/// Unknown units, a trailing number without unit, a total of zero and any
/// value that would not fit a signed 32-bit accumulator are all failures.
pub fn parse_duration(input: &str) -> Result<u32, ParseFailure> {
    let bytes = input.as_bytes();
    let mut pos = 0;
    let mut total: i64 = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        if pos == bytes.len() {
            break;
        }

        let digits_start = pos;
        let mut value: i64 = 0;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            value = value * 10 + i64::from(bytes[pos] - b'0');
            if value > MAX_SECONDS {
                return Err(ParseFailure::Overflow(input.to_string()));
            }
            pos += 1;
        }
        if pos == digits_start {
            return Err(ParseFailure::NotANumber(input.to_string()));
        }

        let Some(&unit) = bytes.get(pos) else {
            return Err(ParseFailure::MissingUnit(input.to_string()));
        };
        pos += 1;

        let multiplier: i64 = match unit.to_ascii_lowercase() {
            b'w' => 7 * 24 * 3600,
            b'd' => 24 * 3600,
            b'h' => 3600,
            b'm' => 60,
            b's' => 1,
            other => {
                return Err(ParseFailure::UnknownUnit {
                    unit: other as char,
                    input: input.to_string(),
                })
            }
        };

        if value > MAX_SECONDS / multiplier {
            return Err(ParseFailure::Overflow(input.to_string()));
        }
        let partial = value * multiplier;
        if total > MAX_SECONDS - partial {
            return Err(ParseFailure::Overflow(input.to_string()));
        }
        total += partial;

        while pos < bytes.len() && !bytes[pos].is_ascii_digit() && bytes[pos] != b' ' {
            pos += 1;
        }
    }

    if total <= 0 {
        return Err(ParseFailure::Empty(input.to_string()));
    }
    Ok(total as u32)
}
