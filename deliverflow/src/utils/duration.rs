//! Human-readable retention windows (`expire_in: 1 day`).

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Longest accepted window, 100 years.
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Errors produced while parsing a retention window.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DurationParseError {
    /// Nothing to parse.
    #[error("Empty duration")]
    Empty,

    /// A segment did not look like `<number> <unit>`.
    #[error("Invalid duration segment '{0}'")]
    InvalidSegment(String),

    /// The unit is not recognised.
    #[error("Unknown duration unit '{0}'")]
    UnknownUnit(String),

    /// The window exceeds [`MAX_DURATION`].
    #[error("Duration '{0}' exceeds 100 years")]
    TooLong(String),
}

#[allow(clippy::expect_used)]
fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s*([a-zA-Z]+)\s*$").expect("static duration pattern is valid")
    })
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(60),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(3_600),
        "d" | "day" | "days" => Some(86_400),
        "w" | "wk" | "week" | "weeks" => Some(604_800),
        _ => None,
    }
}

/// Parses durations like `1 day`, `2 hours 30 min`, `1w`, or a bare number of seconds.
///
/// Segments may be separated by whitespace, `,` or `and`. Windows longer
/// than [`MAX_DURATION`] are rejected.
pub fn parse_duration(value: &str) -> Result<Duration, DurationParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }
    let too_long = || DurationParseError::TooLong(trimmed.to_string());

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return check_max(Duration::from_secs(seconds)).ok_or_else(too_long);
    }

    let normalized = trimmed.replace(',', " ").replace(" and ", " ");
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    let mut total = 0_u64;
    let mut index = 0;
    while index < tokens.len() {
        // Accept both "1 day" and "1day".
        let (segment, consumed) = if tokens[index].chars().all(|c| c.is_ascii_digit()) {
            match tokens.get(index + 1) {
                Some(unit) => (format!("{}{}", tokens[index], unit), 2),
                None => return Err(DurationParseError::InvalidSegment(tokens[index].to_string())),
            }
        } else {
            (tokens[index].to_string(), 1)
        };

        let captures = segment_pattern()
            .captures(&segment)
            .ok_or_else(|| DurationParseError::InvalidSegment(segment.clone()))?;
        let amount: u64 = captures[1]
            .parse()
            .map_err(|_| DurationParseError::InvalidSegment(segment.clone()))?;
        let unit = &captures[2];
        let factor = unit_seconds(unit).ok_or_else(|| DurationParseError::UnknownUnit(unit.to_string()))?;

        total = amount
            .checked_mul(factor)
            .and_then(|seconds| total.checked_add(seconds))
            .ok_or_else(too_long)?;
        index += consumed;
    }

    check_max(Duration::from_secs(total)).ok_or_else(too_long)
}

/// `duration` when it does not exceed [`MAX_DURATION`].
#[must_use]
pub fn check_max(duration: Duration) -> Option<Duration> {
    (duration <= MAX_DURATION).then_some(duration)
}

/// Formats a duration back into the coarsest exact unit (`1 day`, `90 min`).
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let units = [
        (604_800, "week"),
        (86_400, "day"),
        (3_600, "hour"),
        (60, "min"),
    ];
    for (size, name) in units {
        if seconds >= size && seconds % size == 0 {
            let amount = seconds / size;
            return match (name, amount) {
                ("min", _) | (_, 1) => format!("{amount} {name}"),
                _ => format!("{amount} {name}s"),
            };
        }
    }
    format!("{seconds} sec")
}
