//! Parsing of human-formatted intervals reported by Passenger (e.g., process uptimes).

use std::time::Duration;

/// Units that Passenger uses when formatting intervals.
const UNITS: &[&str] = &["d", "h", "m", "s", "ms", "us", "ns"];

/// Error parsing a Passenger interval.
#[derive(Debug, thiserror::Error)]
#[error("invalid interval `{raw}`: {kind}")]
pub struct IntervalError {
    raw: String,
    #[source]
    kind: IntervalErrorKind,
}

#[derive(Debug, thiserror::Error)]
enum IntervalErrorKind {
    #[error("unsupported unit `{0}`")]
    Unit(String),
    #[error(transparent)]
    Format(#[from] humantime::DurationError),
}

/// Parses an interval like `1h 20m 5s` into a number of seconds.
///
/// The interval is a concatenation of `<int><unit>` tokens with optional whitespace between them;
/// whitespace is removed before parsing. Supported units are `ns`, `us`, `ms`, `s`, `m` and `h`,
/// as well as `d` which Passenger prints for long-running processes.
///
/// # Errors
///
/// Returns an error if the interval is empty or malformed, or if it contains an unsupported unit.
pub fn parse_interval(raw: &str) -> Result<f64, IntervalError> {
    parse_duration(raw).map(|duration| duration.as_secs_f64())
}

/// Same as [`parse_interval()`], but returns a [`Duration`].
///
/// # Errors
///
/// Returns an error if the interval is empty or malformed, or if it contains an unsupported unit.
pub fn parse_duration(raw: &str) -> Result<Duration, IntervalError> {
    let collapsed: String = raw.split_whitespace().collect();
    check_units(&collapsed)
        .and_then(|()| humantime::parse_duration(&collapsed).map_err(IntervalErrorKind::from))
        .map_err(|kind| IntervalError {
            raw: raw.to_owned(),
            kind,
        })
}

/// Rejects units that `humantime` understands but Passenger never prints (e.g., `M` for months).
fn check_units(collapsed: &str) -> Result<(), IntervalErrorKind> {
    let unit = collapsed
        .split(|ch: char| ch.is_ascii_digit())
        .find(|unit| !unit.is_empty() && !UNITS.contains(unit));
    match unit {
        Some(unit) => Err(IntervalErrorKind::Unit(unit.to_owned())),
        None => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn parsing_passenger_uptimes() {
        assert_eq!(parse_interval("1h 2m 3s").unwrap(), 3_723.0);
        assert_eq!(parse_interval("17m 40s").unwrap(), 1_060.0);
        assert_eq!(parse_interval("  5s ").unwrap(), 5.0);
        assert_eq!(parse_interval("2d 1h 0m 1s").unwrap(), 176_401.0);
    }

    #[test]
    fn parsing_sub_second_intervals() {
        assert_eq!(parse_interval("500ms").unwrap(), 0.5);
        assert_eq!(parse_interval("1s 250ms").unwrap(), 1.25);
        assert_eq!(parse_interval("20us").unwrap(), 0.000_02);
        assert_eq!(parse_interval("3ns").unwrap(), 0.000_000_003);
    }

    #[test]
    fn parsing_collapses_inner_whitespace() {
        assert_eq!(parse_interval("1 h 2 m").unwrap(), 3_720.0);
        assert_eq!(parse_interval("1h2m3s").unwrap(), 3_723.0);
    }

    #[test]
    fn malformed_intervals() {
        for raw in ["1 banana", "", "   ", "h", "1.5.2s", "-1s", "1s2"] {
            let err = parse_interval(raw).unwrap_err();
            assert!(err.to_string().contains("invalid interval"), "{err}");
        }
    }

    #[test]
    fn units_not_printed_by_passenger_are_rejected() {
        for (raw, unit) in [
            ("1y", "y"),
            ("2weeks", "weeks"),
            ("1M", "M"),
            ("5min", "min"),
            ("3 hours", "hours"),
            ("10sec", "sec"),
            ("1h 5msec", "msec"),
        ] {
            let err = parse_interval(raw).unwrap_err();
            let message = err.to_string();
            assert!(message.contains(&format!("unsupported unit `{unit}`")), "{message}");
        }
    }
}
