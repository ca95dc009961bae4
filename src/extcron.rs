//! Extended cron expression parsing.
//!
//! Accepts five- or six-field cron specs, the `@every <duration>` and
//! `@manually` descriptors, the usual `@hourly`/`@daily`/... shorthands and
//! an explicit `TZ=` / `CRON_TZ=` prefix. The `~` hash extension is applied
//! per job before parsing, see [`crate::job::Job::schedule_hash`].

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("can't parse job schedule: {0}")]
    Parse(String),

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
}

/// A parsed schedule ready to answer "when is the next fire after t".
#[derive(Debug, Clone)]
pub enum ExtSchedule {
    /// A cron expression, optionally evaluated in an explicit timezone.
    Cron(Schedule, Option<Tz>),
    /// `@every <duration>`: fires on a fixed interval from the reference
    /// instant.
    Every(Duration),
    /// `@manually`: never fires on its own, the job runs only on demand.
    Manually,
}

impl ExtSchedule {
    /// The next fire time strictly after `after`, or `None` if the schedule
    /// never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ExtSchedule::Cron(schedule, Some(tz)) => schedule
                .after(&after.with_timezone(tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            ExtSchedule::Cron(schedule, None) => schedule.after(&after).next(),
            ExtSchedule::Every(d) => {
                Some(after + chrono::Duration::from_std(*d).unwrap_or_else(|_| chrono::Duration::zero()))
            }
            ExtSchedule::Manually => None,
        }
    }
}

/// Parse an extended cron spec.
pub fn parse(spec: &str) -> Result<ExtSchedule, ScheduleError> {
    let spec = spec.trim();

    let (tz, rest) = split_timezone(spec)?;

    if let Some(arg) = rest.strip_prefix("@every ") {
        return Ok(ExtSchedule::Every(parse_go_duration(arg.trim())?));
    }
    if rest == "@manually" {
        return Ok(ExtSchedule::Manually);
    }

    let expr = if let Some(descriptor) = rest.strip_prefix('@') {
        descriptor_to_expr(descriptor).ok_or_else(|| ScheduleError::Parse(rest.to_string()))?
    } else {
        normalize_fields(rest)
    };

    let schedule =
        Schedule::from_str(&expr).map_err(|e| ScheduleError::Parse(e.to_string()))?;
    Ok(ExtSchedule::Cron(schedule, tz))
}

/// Validate a spec without keeping the result.
pub fn validate(spec: &str) -> Result<(), ScheduleError> {
    parse(spec).map(|_| ())
}

fn split_timezone(spec: &str) -> Result<(Option<Tz>, &str), ScheduleError> {
    for prefix in ["CRON_TZ=", "TZ="] {
        if let Some(rest) = spec.strip_prefix(prefix) {
            let (name, tail) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| ScheduleError::Parse(spec.to_string()))?;
            let tz = name
                .parse::<Tz>()
                .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))?;
            return Ok((Some(tz), tail.trim_start()));
        }
    }
    Ok((None, spec))
}

fn descriptor_to_expr(descriptor: &str) -> Option<String> {
    let expr = match descriptor {
        "yearly" | "annually" => "0 0 0 1 1 *",
        "monthly" => "0 0 0 1 * *",
        "weekly" => "0 0 0 * * Sun",
        "daily" | "midnight" => "0 0 0 * * *",
        "hourly" => "0 0 * * * *",
        "minutely" => "0 * * * * *",
        _ => return None,
    };
    Some(expr.to_string())
}

// The cron engine wants a seconds field; plain five-field specs get a
// zero-second prefix.
fn normalize_fields(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse a Go-style duration string such as `1h30m`, `90s` or `500ms`.
pub fn parse_go_duration(s: &str) -> Result<Duration, ScheduleError> {
    let err = || ScheduleError::InvalidDuration(s.to_string());

    if s.is_empty() {
        return Err(err());
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(err)?;
        if digits_end == 0 {
            return Err(err());
        }
        let value: f64 = rest[..digits_end].parse().map_err(|_| err())?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let nanos_per_unit: u128 = match &rest[..unit_end] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(err()),
        };
        rest = &rest[unit_end..];

        total_nanos += (value * nanos_per_unit as f64) as u128;
    }

    Ok(Duration::new(
        (total_nanos / 1_000_000_000) as u64,
        (total_nanos % 1_000_000_000) as u32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_five_and_six_fields() {
        assert!(parse("* * * * *").is_ok());
        assert!(parse("0 30 * * * *").is_ok());
        assert!(parse("not a schedule").is_err());
    }

    #[test]
    fn test_parse_descriptors() {
        for spec in ["@yearly", "@monthly", "@weekly", "@daily", "@hourly", "@minutely"] {
            assert!(parse(spec).is_ok(), "descriptor {spec} should parse");
        }
        assert!(parse("@fortnightly").is_err());
    }

    #[test]
    fn test_every_descriptor() {
        let sched = parse("@every 1m30s").unwrap();
        let now = Utc::now();
        let next = sched.next_after(now).unwrap();
        assert_eq!((next - now).num_seconds(), 90);
    }

    #[test]
    fn test_manually_never_fires() {
        let sched = parse("@manually").unwrap();
        assert!(sched.next_after(Utc::now()).is_none());
    }

    #[test]
    fn test_timezone_prefix() {
        let sched = parse("CRON_TZ=America/New_York 0 0 12 * * *").unwrap();
        // Noon in New York is never noon UTC.
        let next = sched.next_after(Utc::now()).unwrap();
        assert_ne!(next.hour(), 12);

        assert!(matches!(
            parse("TZ=Not/AZone * * * * *"),
            Err(ScheduleError::UnknownTimezone(_))
        ));
        // A bare prefix with no expression is malformed.
        assert!(parse("TZ=UTC").is_err());
    }

    #[test]
    fn test_next_after_is_strictly_after() {
        let sched = parse("0 * * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let next = sched.next_after(at).unwrap();
        assert!(next > at);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 31, 0).unwrap());
    }

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_go_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_go_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_go_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_go_duration("").is_err());
        assert!(parse_go_duration("10").is_err());
        assert!(parse_go_duration("ten seconds").is_err());
    }
}
