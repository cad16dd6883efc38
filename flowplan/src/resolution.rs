//! Resolution codec and bucket arithmetic.
//!
//! Rollup tables encode their bucket width in their name: the raw table is
//! `flows`, a one-minute rollup is `flows_1m0s`, an hourly one `flows_1h0m0s`.
//! The encoding is the canonical duration text used across the flow pipeline:
//! hours, minutes and seconds from the largest non-zero unit down, seconds
//! always present, sub-second widths written in `ms`, `µs` or `ns`.
//!
//! This module converts between that text, [`Duration`] and table names, and
//! provides the flooring used to align query bounds with bucket boundaries.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{ConfigurationError, Result};
use crate::table::RAW_TABLE;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Formats a resolution using the canonical duration text.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use flowplan::resolution::format_resolution;
///
/// assert_eq!(format_resolution(Duration::ZERO), "0s");
/// assert_eq!(format_resolution(Duration::from_secs(1)), "1s");
/// assert_eq!(format_resolution(Duration::from_secs(300)), "5m0s");
/// assert_eq!(format_resolution(Duration::from_secs(3600)), "1h0m0s");
/// assert_eq!(format_resolution(Duration::from_millis(1500)), "1.5s");
/// ```
pub fn format_resolution(resolution: Duration) -> String {
    let nanos = resolution.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 3));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", decimal(nanos, 6));
    }

    let total_secs = resolution.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = u128::from(total_secs % 60) * NANOS_PER_SEC + u128::from(resolution.subsec_nanos());

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{}s", decimal(seconds, 9));
    out
}

/// Renders `value / 10^scale` without trailing zeros in the fraction.
fn decimal(value: u128, scale: u32) -> String {
    let divisor = 10u128.pow(scale);
    let integer = value / divisor;
    let fraction = value % divisor;
    if fraction == 0 {
        return integer.to_string();
    }
    let digits = format!("{fraction:0width$}", width = scale as usize);
    format!("{integer}.{}", digits.trim_end_matches('0'))
}

/// Parses a resolution from its duration text.
///
/// Accepts a sequence of `<decimal><unit>` components (`1h30m`, `1.5s`,
/// `250ms`) with units `d`, `h`, `m`, `s`, `ms`, `us`/`µs` and `ns`, and the
/// bare string `0`. Negative durations are rejected. Days are always 24
/// hours; [`format_resolution`] never writes them.
///
/// # Errors
///
/// Returns [`ConfigurationError::InvalidDuration`] if the text is empty,
/// negative, has an unknown unit, or overflows.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use flowplan::resolution::parse_resolution;
///
/// assert_eq!(parse_resolution("5m0s").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_resolution("1h").unwrap(), Duration::from_secs(3600));
/// assert_eq!(parse_resolution("7d").unwrap(), Duration::from_secs(7 * 86_400));
/// assert!(parse_resolution("5 minutes").is_err());
/// ```
pub fn parse_resolution(text: &str) -> Result<Duration> {
    let invalid = |reason: &str| ConfigurationError::InvalidDuration {
        value: text.to_string(),
        reason: reason.to_string(),
    };

    let body = text.strip_prefix('+').unwrap_or(text);
    if body.starts_with('-') {
        return Err(invalid("negative durations are not allowed").into());
    }
    if body == "0" {
        return Ok(Duration::ZERO);
    }
    if body.is_empty() {
        return Err(invalid("empty duration").into());
    }

    let mut total: u128 = 0;
    let mut rest = body;
    while !rest.is_empty() {
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (int_part, after_int) = rest.split_at(int_len);

        let (frac_part, after_number) = match after_int.strip_prefix('.') {
            Some(after_dot) => {
                let frac_len = after_dot
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(after_dot.len());
                after_dot.split_at(frac_len)
            }
            None => ("", after_int),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("expected a number").into());
        }

        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let (unit, remainder) = after_number.split_at(unit_len);
        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3600 * NANOS_PER_SEC,
            "d" => 86_400 * NANOS_PER_SEC,
            "" => return Err(invalid("missing unit").into()),
            _ => return Err(invalid(&format!("unknown unit '{unit}'")).into()),
        };

        let integer: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid("number out of range"))?
        };
        let mut component = integer
            .checked_mul(scale)
            .ok_or_else(|| invalid("duration out of range"))?;
        if !frac_part.is_empty() {
            // Digits beyond nanosecond precision do not change the result.
            let digits = &frac_part[..frac_part.len().min(18)];
            let numerator: u128 = digits.parse().map_err(|_| invalid("number out of range"))?;
            #[allow(clippy::cast_possible_truncation)] // at most 18 digits
            let denominator = 10u128.pow(digits.len() as u32);
            component += numerator * scale / denominator;
        }

        total = total
            .checked_add(component)
            .ok_or_else(|| invalid("duration out of range"))?;
        rest = remainder;
    }

    let nanos = u64::try_from(total).map_err(|_| invalid("duration out of range"))?;
    Ok(Duration::from_nanos(nanos))
}

/// Returns the table name holding data at `resolution`.
///
/// Zero is the raw table, anything else a rollup suffixed with the canonical
/// duration text.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use flowplan::resolution::table_name;
///
/// assert_eq!(table_name(Duration::ZERO), "flows");
/// assert_eq!(table_name(Duration::from_secs(60)), "flows_1m0s");
/// ```
pub fn table_name(resolution: Duration) -> String {
    if resolution.is_zero() {
        RAW_TABLE.to_string()
    } else {
        format!("{RAW_TABLE}_{}", format_resolution(resolution))
    }
}

/// Extracts the resolution encoded in a flow table name.
///
/// # Errors
///
/// Returns [`ConfigurationError::InvalidTableName`] if the name is not
/// `flows` or `flows_<duration>`, or if the suffix is zero.
pub fn resolution_from_table_name(name: &str) -> Result<Duration> {
    if name == RAW_TABLE {
        return Ok(Duration::ZERO);
    }

    let invalid = |reason: String| ConfigurationError::InvalidTableName {
        name: name.to_string(),
        reason,
    };

    let suffix = name
        .strip_prefix(RAW_TABLE)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| invalid(format!("expected '{RAW_TABLE}' or '{RAW_TABLE}_<duration>'")))?;

    let resolution = parse_resolution(suffix).map_err(|e| invalid(e.to_string()))?;
    if resolution.is_zero() {
        return Err(invalid("rollup resolution must be non-zero".to_string()).into());
    }
    Ok(resolution)
}

/// Floors `instant` down to a multiple of `resolution` since the Unix epoch.
///
/// A zero resolution returns the instant unchanged.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use chrono::{TimeZone, Utc};
/// use flowplan::resolution::floor_to;
///
/// let t = Utc.with_ymd_and_hms(2022, 4, 10, 15, 45, 10).unwrap();
/// let floored = floor_to(t, Duration::from_secs(60));
/// assert_eq!(floored, Utc.with_ymd_and_hms(2022, 4, 10, 15, 45, 0).unwrap());
/// assert_eq!(floor_to(floored, Duration::from_secs(60)), floored);
/// ```
pub fn floor_to(instant: DateTime<Utc>, resolution: Duration) -> DateTime<Utc> {
    let Ok(step) = i128::try_from(resolution.as_nanos()) else {
        return instant;
    };
    if step == 0 {
        return instant;
    }

    let nanos_per_sec = i128::from(1_000_000_000u32);
    let since_epoch =
        i128::from(instant.timestamp()) * nanos_per_sec + i128::from(instant.timestamp_subsec_nanos());
    let floored = since_epoch.div_euclid(step) * step;

    let Ok(secs) = i64::try_from(floored.div_euclid(nanos_per_sec)) else {
        return instant;
    };
    let Ok(nanos) = u32::try_from(floored.rem_euclid(nanos_per_sec)) else {
        return instant;
    };
    DateTime::from_timestamp(secs, nanos).unwrap_or(instant)
}

/// Returns the bucket width in whole seconds used by placeholders.
///
/// The raw table stores individual records; it is treated as one-second
/// granular so that downstream bucket arithmetic never divides by zero.
pub fn effective_seconds(resolution: Duration) -> u64 {
    resolution.as_secs().max(1)
}
