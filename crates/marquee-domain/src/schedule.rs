// SPDX-License-Identifier: GPL-3.0-or-later
//! Recurrence rules for scheduled tasks.
//!
//! Occurrences are always returned in UTC. Cron expressions are evaluated in a
//! [`ScheduleTimezone`] and converted back, so "03:00 every day" means 03:00 in
//! the configured zone.

use chrono::{DateTime, Duration, FixedOffset, Local, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("interval must be greater than zero")]
    ZeroInterval,

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("cron expression '{0}' has no upcoming occurrence")]
    Exhausted(String),

    #[error("next occurrence is out of the representable time range")]
    OutOfRange,

    #[error("invalid timezone '{0}', expected UTC, local, a zone name like Europe/Berlin or an offset like +02:00")]
    InvalidTimezone(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// Fixed number of seconds between runs.
    Interval { seconds: u64 },
    /// Cron expression, either 5-field (minute first) or 6/7-field (second first).
    Cron { expression: String },
}

impl Schedule {
    pub fn interval(seconds: u64) -> Self {
        Self::Interval { seconds }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Interval { seconds: 0 } => Err(ScheduleError::ZeroInterval),
            Self::Interval { .. } => Ok(()),
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        tz: ScheduleTimezone,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Self::Interval { seconds: 0 } => Err(ScheduleError::ZeroInterval),
            Self::Interval { seconds } => i64::try_from(*seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|step| after.checked_add_signed(step))
                .ok_or(ScheduleError::OutOfRange),
            Self::Cron { expression } => {
                let schedule = parse_cron(expression)?;
                let next = match tz {
                    ScheduleTimezone::Utc => first_after(&schedule, &after.with_timezone(&Utc)),
                    ScheduleTimezone::Local => {
                        first_after(&schedule, &after.with_timezone(&Local))
                    }
                    ScheduleTimezone::Fixed(offset) => {
                        first_after(&schedule, &after.with_timezone(&offset))
                    }
                    ScheduleTimezone::Named(zone) => {
                        first_after(&schedule, &after.with_timezone(&zone))
                    }
                };
                next.ok_or_else(|| ScheduleError::Exhausted(expression.clone()))
            }
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval { seconds } => write!(f, "every {seconds}s"),
            Self::Cron { expression } => write!(f, "cron '{expression}'"),
        }
    }
}

fn first_after<Z: TimeZone>(schedule: &CronSchedule, after: &DateTime<Z>) -> Option<DateTime<Utc>> {
    schedule
        .after(after)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let trimmed = expression.trim();
    // The cron crate wants a leading seconds field; accept the common 5-field form too.
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Zone in which cron expressions are interpreted.
///
/// Named zones follow daylight saving; fixed offsets never move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleTimezone {
    #[default]
    Utc,
    Local,
    Fixed(FixedOffset),
    Named(Tz),
}

impl FromStr for ScheduleTimezone {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let invalid = || ScheduleError::InvalidTimezone(s.to_string());
        if value.eq_ignore_ascii_case("utc") || value.eq_ignore_ascii_case("z") {
            return Ok(Self::Utc);
        }
        if value.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }
        if value.starts_with(['+', '-']) {
            return value.parse::<FixedOffset>().map(Self::Fixed).map_err(|_| invalid());
        }
        value.parse::<Tz>().map(Self::Named).map_err(|_| invalid())
    }
}
