//! Resample rule parsing
//!
//! Accepts pandas-style offset strings such as `"1min"`, `"15s"`, `"T"` or
//! `"1h30min"` and turns them into a [`Duration`].

use super::ConfigError;
use std::time::Duration;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Parse a resample rule into its period
pub fn parse_resample_rule(rule: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidResampleRule(rule.to_string());

    let mut chars = rule.trim().chars().peekable();
    if chars.peek().is_none() {
        return Err(invalid());
    }

    let mut total_secs = 0.0;
    while chars.peek().is_some() {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut number = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() || *c == '.') {
            number.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut unit = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphabetic()) {
            unit.push(c);
        }

        if unit.is_empty() {
            return Err(invalid());
        }

        // "T" alone means one minute
        let count = if number.is_empty() {
            1.0
        } else {
            number.parse::<f64>().map_err(|_| invalid())?
        };
        let unit_secs = unit_seconds(&unit).ok_or_else(invalid)?;
        total_secs += count * unit_secs;

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    if !total_secs.is_finite() || total_secs <= 0.0 {
        return Err(invalid());
    }

    match Duration::try_from_secs_f64(total_secs) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(invalid()),
    }
}

/// Seconds per unit. Single-letter pandas aliases are case-sensitive.
fn unit_seconds(unit: &str) -> Option<f64> {
    let secs = match unit {
        "W" | "w" => 7.0 * SECONDS_PER_DAY,
        "D" | "d" => SECONDS_PER_DAY,
        "H" | "h" => 3_600.0,
        "T" | "m" => 60.0,
        "S" | "s" => 1.0,
        "L" => 1e-3,
        "U" => 1e-6,
        "N" => 1e-9,
        _ => match unit.to_ascii_lowercase().as_str() {
            "day" | "days" => SECONDS_PER_DAY,
            "hr" | "hour" | "hours" => 3_600.0,
            "min" | "mins" | "minute" | "minutes" => 60.0,
            "sec" | "secs" | "second" | "seconds" => 1.0,
            "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => 1e-3,
            "us" | "micro" | "micros" | "microsecond" | "microseconds" => 1e-6,
            "ns" | "nano" | "nanos" | "nanosecond" | "nanoseconds" => 1e-9,
            _ => return None,
        },
    };
    Some(secs)
}
