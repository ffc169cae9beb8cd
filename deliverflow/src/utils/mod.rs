//! Utility functions for timestamps and retention windows.

pub mod duration;
pub mod timestamps;

pub use duration::{check_max, format_duration, parse_duration, DurationParseError, MAX_DURATION};
pub use timestamps::{format_iso8601, iso_timestamp, now_utc, parse_timestamp, Timestamp};
