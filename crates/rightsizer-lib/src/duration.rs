//! Duration strings as written in policy specs ("7d", "5m", "1h30m")

use crate::error::{Error, Result};
use std::time::Duration;

const SECOND: f64 = 1.0;
const MINUTE: f64 = 60.0 * SECOND;
const HOUR: f64 = 60.0 * MINUTE;
const DAY: f64 = 24.0 * HOUR;
const WEEK: f64 = 7.0 * DAY;

/// Parse a duration made of one or more `<number><unit>` segments.
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. Fractional numbers are accepted
/// (`1.5h`). A bare `0` is accepted as zero.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::Duration(input.to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0.0_f64;
    let mut rest = s;

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(Error::Duration(input.to_string()));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| Error::Duration(input.to_string()))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => SECOND / 1000.0,
            "s" => SECOND,
            "m" => MINUTE,
            "h" => HOUR,
            "d" => DAY,
            "w" => WEEK,
            _ => return Err(Error::Duration(input.to_string())),
        };
        rest = &rest[unit_len..];

        total += value * scale;
    }

    Ok(Duration::from_secs_f64(total))
}

/// Render a duration the way specs write it, using the largest exact unit
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs % size == 0 {
            return format!("{}{}", secs / size, unit);
        }
    }
    format!("{}s", secs)
}
