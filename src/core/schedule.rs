//! Schedule parsing and next fire time calculation.
//!
//! Supports standard cron expressions, extended 6-field cron (with seconds),
//! shortcuts (@daily, @hourly, etc.), and interval expressions (@every).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing or evaluating schedules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The expression has no occurrence after the reference time.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A parsed, timezone-aware schedule.
#[derive(Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    kind: ScheduleKind,
}

#[derive(Clone)]
enum ScheduleKind {
    Cron(Box<CronSchedule>),
    Every(chrono::Duration),
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl Schedule {
    /// Parse a schedule evaluated in UTC.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    /// - Intervals: `@every 5m`, `@every 1h30m`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse a schedule evaluated in the given IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let kind = parse_expression(expression.trim())?;

        Ok(Self {
            expression,
            timezone,
            kind,
        })
    }

    /// The first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::NoMoreOccurrences),
            ScheduleKind::Every(step) => after
                .checked_add_signed(*step)
                .ok_or(ScheduleError::NoMoreOccurrences),
        }
    }

    /// The first fire time after the current instant.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// Iterate fire times after `after`, each one feeding the next lookup.
    pub fn upcoming(&self, after: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let mut cursor = after;
        std::iter::from_fn(move || {
            let next = self.next_after(cursor).ok()?;
            cursor = next;
            Some(next)
        })
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Get the timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

fn parse_expression(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    if !expression.starts_with('@') {
        return parse_cron(expression);
    }

    let lowered = expression.to_lowercase();
    match lowered.as_str() {
        "@yearly" | "@annually" => parse_cron("0 0 1 1 *"),
        "@monthly" => parse_cron("0 0 1 * *"),
        "@weekly" => parse_cron("0 0 * * SUN"),
        "@daily" | "@midnight" => parse_cron("0 0 * * *"),
        "@hourly" => parse_cron("0 * * * *"),
        s => match s.strip_prefix("@every ") {
            Some(interval) => {
                let step = parse_duration(interval.trim())?;
                let step = chrono::Duration::from_std(step)
                    .map_err(|_| ScheduleError::InvalidInterval(interval.to_string()))?;
                Ok(ScheduleKind::Every(step))
            }
            None => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        },
    }
}

/// Parse a cron expression, promoting 5-field forms to the 6-field syntax.
///
/// The weekday field uses standard cron numbering (0-6, Sunday is 0 or 7) and
/// is rewritten to the `cron` crate's (1-7, Sunday is 1).
fn parse_cron(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 or 6 fields, got {}",
                n
            )));
        }
    }
    fields[5] = normalize_weekdays(&fields[5])?;

    CronSchedule::from_str(&fields.join(" "))
        .map(|s| ScheduleKind::Cron(Box::new(s)))
        .map_err(|e| ScheduleError::InvalidCron(e.to_string()))
}

fn normalize_weekdays(field: &str) -> Result<String, ScheduleError> {
    let items = field
        .split(',')
        .map(normalize_weekday_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

/// Expand one numeric weekday item into an explicit list. Names and bare
/// wildcards pass through untouched.
fn normalize_weekday_item(item: &str) -> Result<String, ScheduleError> {
    let numeric = item.bytes().any(|b| b.is_ascii_digit());
    if !numeric || item.bytes().any(|b| b.is_ascii_alphabetic()) {
        return Ok(item.to_string());
    }

    let invalid = || ScheduleError::InvalidCron(format!("invalid day of week: {}", item));
    let day = |value: &str| {
        value
            .parse::<u32>()
            .ok()
            .filter(|day| *day <= 7)
            .ok_or_else(invalid)
    };

    let (base, step) = match item.split_once('/') {
        Some((base, step)) => {
            let step = step.parse::<usize>().ok().filter(|s| *s > 0);
            (base, Some(step.ok_or_else(invalid)?))
        }
        None => (item, None),
    };
    let (start, end) = match (base, base.split_once('-')) {
        ("*" | "?", _) => (0, 6),
        (_, Some((from, to))) => (day(from)?, day(to)?),
        (single, None) => {
            let start = day(single)?;
            (start, if step.is_some() { 6 } else { start })
        }
    };
    if start > end {
        return Err(invalid());
    }

    let mut days: Vec<u32> = (start..=end)
        .step_by(step.unwrap_or(1))
        .map(|day| day % 7 + 1)
        .collect();
    days.sort_unstable();
    days.dedup();
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Parse a duration string like "30s", "5m", "1h30m" or "1d".
pub(crate) fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(invalid()),
        };
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    // Trailing digits without a unit.
    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}
