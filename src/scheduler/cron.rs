//! Five-field cron expressions and next-run computation.
//!
//! Supported syntax per field: `*`, numbers, ranges (`1-5`), steps (`*/15`,
//! `10-50/10`), lists (`1,15,30`), three-letter month and weekday names, and
//! the aliases `@hourly`, `@daily`/`@midnight`, `@weekly`, `@monthly`,
//! `@yearly`/`@annually`. Times are evaluated in UTC.
//!
//! As in Vixie cron, when both day-of-month and day-of-week are restricted a
//! day matches if *either* does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far ahead to search before declaring an expression unsatisfiable.
const SEARCH_YEARS: i32 = 5;

/// Errors raised while parsing or evaluating a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("unknown alias '{0}'")]
    UnknownAlias(String),

    #[error("expression '{0}' never matches")]
    NeverMatches(String),
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};
// 7 is accepted as an alias for Sunday and folded onto 0
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            alias if alias.starts_with('@') => {
                return Err(CronError::UnknownAlias(alias.to_string()))
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        let schedule = Self {
            source: trimmed.to_string(),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        };

        // Reject expressions like "0 0 30 2 *" up front.
        if schedule.next_after(Utc::now()).is_none() {
            return Err(CronError::NeverMatches(schedule.source));
        }
        Ok(schedule)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`.
    ///
    /// Returns `None` if nothing matches within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after)? + Duration::minutes(1);
        let horizon = after.year() + SEARCH_YEARS;

        while t.year() <= horizon {
            if !bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = start_of_hour(t)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Next run for a schedule, strictly after both `reference` and `now`.
///
/// `reference` is the previous `next_run`. Occurrences that were missed
/// while nothing dispatched are skipped, not replayed: with `*/5`, a
/// reference of 12:00 and a current time of 12:05:30 yields 12:10.
pub fn compute_next_run(
    crontab: &str,
    reference: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let schedule = CronSchedule::parse(crontab)?;
    next_run_for(&schedule, reference, now)
}

/// [`compute_next_run`] for an already parsed schedule.
pub fn next_run_for(
    schedule: &CronSchedule,
    reference: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    // The first occurrence after max(reference, now) is exactly what repeated
    // "advance the reference until it passes now" converges to.
    let start = reference.max(now);
    schedule
        .next_after(start)
        .ok_or_else(|| CronError::NeverMatches(schedule.source.clone()))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(field: &str, spec: FieldSpec) -> Result<u64, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: spec.name,
        value: field.to_string(),
        reason,
    };

    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list element".to_string()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{}'", step)))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, spec)?, parse_value(hi, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // "5/15" means "5-max/15"
            if part.contains('/') {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(invalid(format!("range {}-{} is reversed", start, end)));
        }

        let mut value = start;
        while value <= end {
            mask |= 1u64 << value;
            value += step;
        }
    }
    Ok(mask)
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, CronError> {
    let lowered = raw.to_ascii_lowercase();
    let value = if let Some(idx) = spec.names.iter().position(|n| *n == lowered) {
        idx as u32 + if spec.min == 1 { 1 } else { 0 }
    } else {
        raw.parse::<u32>().map_err(|_| CronError::InvalidField {
            field: spec.name,
            value: raw.to_string(),
            reason: "not a number".to_string(),
        })?
    };

    if value < spec.min || value > spec.max {
        return Err(CronError::InvalidField {
            field: spec.name,
            value: raw.to_string(),
            reason: format!("must be between {} and {}", spec.min, spec.max),
        });
    }
    Ok(value)
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
        .single()
}

fn start_of_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}
