//! Timestamp expressions and calendar bucketing.
//!
//! Timestamps are epoch milliseconds. Expressions are resolved on the
//! client at serialization time:
//!
//! - `now`
//! - `now + 5d`, `now - 30m` (units: `ms s m h d w y`)
//! - RFC 3339 (`2024-01-05T10:00:00Z`), `2024-01-05T10:00:00`, `2024-01-05`

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest timestamp representable by a JS Date, kept for parity of ranges.
pub const MAX_TIMESTAMP: i64 = 8_640_000_000_000_000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn invalid(expr: &str, message: &str) -> Error {
    Error::InvalidValue {
        type_name: String::new(),
        path: String::new(),
        message: format!("timestamp {:?}: {}", expr, message),
    }
}

/// Resolve a timestamp expression against `now` (epoch ms).
pub fn resolve(expr: &str, now: i64) -> Result<i64> {
    let trimmed = expr.trim();
    if let Some(rest) = trimmed.strip_prefix("now") {
        let rest = rest.trim();
        if rest.is_empty() {
            return Ok(now);
        }
        let (sign, amount) = match rest.as_bytes()[0] {
            b'+' => (1i64, rest[1..].trim()),
            b'-' => (-1i64, rest[1..].trim()),
            _ => return Err(invalid(expr, "expected + or - after now")),
        };
        let split = amount
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| invalid(expr, "missing unit"))?;
        let n: f64 = amount[..split]
            .parse()
            .map_err(|_| invalid(expr, "invalid amount"))?;
        let unit_ms = unit_ms(amount[split..].trim()).ok_or_else(|| invalid(expr, "unknown unit"))?;
        return Ok(now + sign * (n * unit_ms as f64) as i64);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    Err(invalid(expr, "unrecognised format"))
}

fn unit_ms(unit: &str) -> Option<i64> {
    Some(match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "y" => 365 * 86_400_000,
        _ => return None,
    })
}

/// Named calendar interval for time-bucketed group-by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CalendarInterval {
    Hour = 1,
    Day = 2,
    Week = 3,
    Month = 4,
    Year = 5,
}

impl CalendarInterval {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => CalendarInterval::Hour,
            2 => CalendarInterval::Day,
            3 => CalendarInterval::Week,
            4 => CalendarInterval::Month,
            5 => CalendarInterval::Year,
            _ => return None,
        })
    }

    /// Group key of the interval containing `ms`.
    pub fn bucket_key(&self, ms: i64) -> String {
        let Some(dt) = DateTime::<Utc>::from_timestamp_millis(ms) else {
            return ms.to_string();
        };
        match self {
            CalendarInterval::Hour => format!(
                "{:04}-{:02}-{:02}T{:02}",
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour()
            ),
            CalendarInterval::Day => format!("{:04}-{:02}-{:02}", dt.year(), dt.month(), dt.day()),
            CalendarInterval::Week => {
                let w = dt.iso_week();
                format!("{:04}-W{:02}", w.year(), w.week())
            }
            CalendarInterval::Month => format!("{:04}-{:02}", dt.year(), dt.month()),
            CalendarInterval::Year => format!("{:04}", dt.year()),
        }
    }
}

/// Bucket start for a fixed-step bucketing.
pub fn step_bucket(ms: i64, step: i64) -> i64 {
    if step <= 0 {
        return ms;
    }
    ms.div_euclid(step) * step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_expressions() {
        let now = 1_700_000_000_000;
        assert_eq!(resolve("now", now).unwrap(), now);
        assert_eq!(resolve("now + 1d", now).unwrap(), now + 86_400_000);
        assert_eq!(resolve("now-2h", now).unwrap(), now - 7_200_000);
        assert_eq!(resolve("now + 500ms", now).unwrap(), now + 500);
        assert!(resolve("now * 2d", now).is_err());
        assert!(resolve("now + 2q", now).is_err());
    }

    #[test]
    fn test_absolute_dates() {
        assert_eq!(resolve("1970-01-01", 0).unwrap(), 0);
        assert_eq!(resolve("1970-01-02T00:00:00Z", 0).unwrap(), 86_400_000);
        assert_eq!(resolve("1970-01-01T00:00:01", 0).unwrap(), 1_000);
        assert!(resolve("yesterday", 0).is_err());
    }

    #[test]
    fn test_buckets() {
        let ms = resolve("2024-03-15T13:45:00Z", 0).unwrap();
        assert_eq!(CalendarInterval::Day.bucket_key(ms), "2024-03-15");
        assert_eq!(CalendarInterval::Month.bucket_key(ms), "2024-03");
        assert_eq!(CalendarInterval::Hour.bucket_key(ms), "2024-03-15T13");
        assert_eq!(step_bucket(1_050, 100), 1_000);
        assert_eq!(step_bucket(-50, 100), -100);
    }
}
