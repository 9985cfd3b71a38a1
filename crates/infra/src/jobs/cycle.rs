//! Failed-job retry cycles (ISO 8601 repeating intervals).
//!
//! Accepted forms:
//!
//! - `PT10M`: one repetition, ten minutes apart
//! - `R5/PT10M`: five repetitions
//! - `R/PT10M`: unbounded repetitions
//! - `R3/2026-01-01T00:00:00Z/PT1H`: repetitions on a grid anchored at a start
//! - `R3/PT1H/2026-01-02T00:00:00Z`: repetitions until an end instant
//! - `R3/2026-01-01T00:00:00Z/2026-01-01T01:00:00Z`: period given by start and end

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use thiserror::Error;

use jobforge_core::JobError;

/// Upper bound on grid steps when anchoring a calendar-based period.
const MAX_GRID_STEPS: usize = 100_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid retry cycle '{expression}': {reason}")]
pub struct CycleParseError {
    pub expression: String,
    pub reason: String,
}

impl From<CycleParseError> for JobError {
    fn from(err: CycleParseError) -> Self {
        JobError::configuration(err.to_string())
    }
}

/// An ISO 8601 duration, split into a calendar part and a fixed part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoDuration {
    months: u32,
    fixed: Duration,
}

impl IsoDuration {
    pub fn from_fixed(fixed: Duration) -> Self {
        Self { months: 0, fixed }
    }

    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.fixed.is_zero()
    }

    /// `at + self`, or `None` on overflow.
    pub fn add_to(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let shifted = if self.months > 0 {
            at.checked_add_months(Months::new(self.months))?
        } else {
            at
        };
        shifted.checked_add_signed(self.fixed)
    }
}

impl FromStr for IsoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('P')
            .ok_or_else(|| format!("duration '{s}' must start with 'P'"))?;
        let (date_part, time_part) = match body.split_once('T') {
            Some((_, time)) if time.is_empty() => {
                return Err(format!("duration '{s}' has an empty time part"));
            }
            Some((date, time)) => (date, Some(time)),
            None => (body, None),
        };

        let mut months: u64 = 0;
        let mut fixed = Duration::zero();
        let mut components = 0;

        for (value, unit) in components_of(date_part)? {
            let n = whole(&value, unit)?;
            components += 1;
            match unit {
                'Y' => months = add_months(months, n.checked_mul(12))?,
                'M' => months = add_months(months, Some(n))?,
                'W' => fixed = add_fixed(fixed, weeks(n)?)?,
                'D' => fixed = add_fixed(fixed, days(n)?)?,
                other => return Err(format!("unexpected designator '{other}' in date part")),
            }
        }

        if let Some(time_part) = time_part {
            for (value, unit) in components_of(time_part)? {
                components += 1;
                let part = match unit {
                    'H' => hours(whole(&value, unit)?)?,
                    'M' => minutes(whole(&value, unit)?)?,
                    'S' => seconds(&value)?,
                    other => return Err(format!("unexpected designator '{other}' in time part")),
                };
                fixed = add_fixed(fixed, part)?;
            }
        }

        if components == 0 {
            return Err(format!("duration '{s}' has no components"));
        }
        let months = u32::try_from(months).map_err(|_| format!("duration '{s}' is too long"))?;
        Ok(Self { months, fixed })
    }
}

fn components_of(part: &str) -> Result<Vec<(String, char)>, String> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            if number.is_empty() {
                return Err(format!("designator '{c}' has no value"));
            }
            out.push((std::mem::take(&mut number), c));
        } else {
            return Err(format!("unexpected character '{c}'"));
        }
    }
    if !number.is_empty() {
        return Err(format!("value '{number}' has no designator"));
    }
    Ok(out)
}

fn whole(value: &str, unit: char) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| format!("'{value}{unit}' must be a whole number"))
}

fn add_months(total: u64, part: Option<u64>) -> Result<u64, String> {
    part.and_then(|part| total.checked_add(part))
        .ok_or_else(|| "month count out of range".to_string())
}

fn add_fixed(total: Duration, part: Duration) -> Result<Duration, String> {
    total
        .checked_add(&part)
        .ok_or_else(|| "duration out of range".to_string())
}

fn weeks(n: u64) -> Result<Duration, String> {
    i64::try_from(n)
        .ok()
        .and_then(Duration::try_weeks)
        .ok_or_else(|| "week count out of range".to_string())
}

fn days(n: u64) -> Result<Duration, String> {
    i64::try_from(n)
        .ok()
        .and_then(Duration::try_days)
        .ok_or_else(|| "day count out of range".to_string())
}

fn hours(n: u64) -> Result<Duration, String> {
    i64::try_from(n)
        .ok()
        .and_then(Duration::try_hours)
        .ok_or_else(|| "hour count out of range".to_string())
}

fn minutes(n: u64) -> Result<Duration, String> {
    i64::try_from(n)
        .ok()
        .and_then(Duration::try_minutes)
        .ok_or_else(|| "minute count out of range".to_string())
}

fn seconds(value: &str) -> Result<Duration, String> {
    let normalized = value.replace(',', ".");
    let secs: f64 = normalized
        .parse()
        .map_err(|_| format!("'{value}S' is not a number"))?;
    if !secs.is_finite() || secs < 0.0 || secs > (i64::MAX / 1000) as f64 {
        return Err(format!("'{value}S' is out of range"));
    }
    Duration::try_milliseconds((secs * 1000.0).round() as i64)
        .ok_or_else(|| format!("'{value}S' is out of range"))
}

fn instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("'{s}' is not an RFC 3339 instant: {e}"))
}

/// A parsed retry cycle: how many retries, and when the next one is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCycle {
    /// Number of repetitions; `u32::MAX` for `R/...`.
    pub repeat: u32,
    pub period: IsoDuration,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RetryCycle {
    pub fn parse(expression: &str) -> Result<Self, CycleParseError> {
        Self::parse_inner(expression.trim()).map_err(|reason| CycleParseError {
            expression: expression.to_string(),
            reason,
        })
    }

    fn parse_inner(expression: &str) -> Result<Self, String> {
        if expression.is_empty() {
            return Err("expression is empty".to_string());
        }

        let mut parts: Vec<&str> = expression.split('/').collect();
        let repeat = match parts.first() {
            Some(&first) if first.starts_with('R') => {
                let count = &first[1..];
                parts.remove(0);
                if count.is_empty() {
                    u32::MAX
                } else {
                    count
                        .parse::<u32>()
                        .map_err(|_| format!("repeat count '{count}' is not a number"))?
                }
            }
            _ => 1,
        };

        let (period, start, end) = match parts.as_slice() {
            [duration] => (duration.parse::<IsoDuration>()?, None, None),
            [first, second] if first.starts_with('P') => {
                (first.parse::<IsoDuration>()?, None, Some(instant(second)?))
            }
            [first, second] if second.starts_with('P') => {
                (second.parse::<IsoDuration>()?, Some(instant(first)?), None)
            }
            [first, second] => {
                let start = instant(first)?;
                let end = instant(second)?;
                if end <= start {
                    return Err("interval end must be after its start".to_string());
                }
                (IsoDuration::from_fixed(end - start), Some(start), None)
            }
            _ => return Err("expected at most two interval parts after the repeat".to_string()),
        };

        if period.is_zero() {
            return Err("period must be greater than zero".to_string());
        }

        Ok(Self {
            repeat,
            period,
            start,
            end,
        })
    }

    /// First occurrence strictly after `now`.
    ///
    /// Without a start the cycle anchors to `now`; with one, occurrences sit on
    /// the grid `start + k * period`. `None` when the cycle has ended.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match self.start {
            None => self.period.add_to(now)?,
            Some(start) if start > now => start,
            Some(start) => self.grid_point_after(start, now)?,
        };
        match self.end {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    fn grid_point_after(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.period.months == 0 {
            let step = self.period.fixed.num_milliseconds();
            if step <= 0 {
                return None;
            }
            let elapsed = (now - start).num_milliseconds();
            let k = elapsed / step + 1;
            return start.checked_add_signed(Duration::milliseconds(k.checked_mul(step)?));
        }

        let mut at = start;
        for _ in 0..MAX_GRID_STEPS {
            at = self.period.add_to(at)?;
            if at > now {
                return Some(at);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn repeat_and_period() {
        let cycle = RetryCycle::parse("R5/PT10M").unwrap();
        assert_eq!(cycle.repeat, 5);
        assert_eq!(cycle.next_after(at(12, 0, 0)), Some(at(12, 10, 0)));
    }

    #[test]
    fn bare_duration_is_one_repetition() {
        let cycle = RetryCycle::parse("PT30S").unwrap();
        assert_eq!(cycle.repeat, 1);
        assert_eq!(cycle.next_after(at(12, 0, 0)), Some(at(12, 0, 30)));
    }

    #[test]
    fn unbounded_repeat() {
        assert_eq!(RetryCycle::parse("R/PT1H").unwrap().repeat, u32::MAX);
    }

    #[test]
    fn mixed_components_add_up() {
        let cycle = RetryCycle::parse("R2/P1DT1H30M").unwrap();
        let next = cycle.next_after(at(0, 0, 0)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 1, 30, 0).unwrap());
    }

    #[test]
    fn calendar_months_follow_the_calendar() {
        let cycle = RetryCycle::parse("R1/P1M").unwrap();
        let jan_31 = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            cycle.next_after(jan_31),
            Some(Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn start_anchors_a_grid() {
        let cycle = RetryCycle::parse("R3/2026-03-01T12:00:00Z/PT15M").unwrap();
        assert_eq!(cycle.next_after(at(11, 0, 0)), Some(at(12, 0, 0)));
        assert_eq!(cycle.next_after(at(12, 0, 0)), Some(at(12, 15, 0)));
        assert_eq!(cycle.next_after(at(12, 20, 0)), Some(at(12, 30, 0)));
    }

    #[test]
    fn start_and_end_define_the_period() {
        let cycle =
            RetryCycle::parse("R2/2026-03-01T12:00:00Z/2026-03-01T12:05:00Z").unwrap();
        assert_eq!(cycle.next_after(at(12, 7, 0)), Some(at(12, 10, 0)));
    }

    #[test]
    fn end_bounds_the_cycle() {
        let cycle = RetryCycle::parse("R3/PT1H/2026-03-01T13:00:00Z").unwrap();
        assert_eq!(cycle.next_after(at(12, 0, 0)), Some(at(13, 0, 0)));
        assert_eq!(cycle.next_after(at(12, 30, 0)), None);
    }

    #[test]
    fn fractional_seconds() {
        let cycle = RetryCycle::parse("PT1.5S").unwrap();
        assert_eq!(
            cycle.next_after(at(0, 0, 0)),
            Some(at(0, 0, 1) + Duration::milliseconds(500))
        );
    }

    #[test]
    fn malformed_cycles_are_configuration_errors() {
        for bad in [
            "", "R3", "R3/", "Rx/PT1M", "PT", "P", "PT0S", "10M", "R3/PT1M/later", "P1.5D",
            "R2/PT1M/PT2M/PT3M", "R3/P1H",
        ] {
            let err = RetryCycle::parse(bad).expect_err(bad);
            assert!(matches!(JobError::from(err), JobError::Configuration(_)));
        }
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        for huge in [
            "R3/P106751991167DT2562047788015H",
            "R3/P15250284452W106751991167D",
            "PT9223372036854775S1M",
            "P18446744073709551615Y",
        ] {
            let err = RetryCycle::parse(huge).expect_err(huge);
            assert!(err.reason.contains("out of range") || err.reason.contains("too long"));
        }
    }
}
