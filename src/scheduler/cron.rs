// pgbackd/src/scheduler/cron.rs
use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::errors::{AppError, Result};

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// A parsed cron expression bound to the time zone it is evaluated in.
///
/// Accepts the classic five fields (`min hour dom month dow`, Sunday = 0 or 7),
/// a six field form with a leading seconds column, and `@daily` style macros.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
    time_zone: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, time_zone: &str) -> Result<Self> {
        let time_zone = Tz::from_str(time_zone.trim()).map_err(|_| {
            AppError::InvalidSchedule(format!("unknown time zone '{time_zone}'"))
        })?;
        let normalized = normalize(expression)?;
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            AppError::InvalidSchedule(format!("cannot parse '{expression}': {e}"))
        })?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            time_zone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`, evaluated in the schedule's zone.
    ///
    /// Occurrences are matched on wall-clock time. A time skipped by a DST gap fires
    /// at the same distance past the gap; a time repeated by an overlap fires once,
    /// at its first instance.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut wall_clock = after.with_timezone(&self.time_zone).naive_local();
        // Right after a gap, rewind by its length so gap occurrences are still ahead.
        let sprung = self.utc_offset(after) - self.utc_offset(after - TimeDelta::days(1));
        if sprung > TimeDelta::zero() {
            wall_clock -= sprung;
        }
        let wall_clock = Utc.from_utc_datetime(&wall_clock);
        self.schedule
            .after(&wall_clock)
            .map(|occurrence| self.resolve_local(occurrence.naive_utc()))
            .find(|next| *next > after)
    }

    fn resolve_local(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self.time_zone.from_local_datetime(&local) {
            LocalResult::Single(at) | LocalResult::Ambiguous(at, _) => at.with_timezone(&Utc),
            LocalResult::None => {
                // Gaps are shorter than a day, so the offset a day earlier is the pre-gap one.
                let before_gap = self.utc_offset(Utc.from_utc_datetime(&(local - TimeDelta::days(1))));
                Utc.from_utc_datetime(&(local - before_gap))
            }
        }
    }

    fn utc_offset(&self, at: DateTime<Utc>) -> TimeDelta {
        let offset = self.time_zone.offset_from_utc_datetime(&at.naive_utc()).fix();
        TimeDelta::seconds(i64::from(offset.local_minus_utc()))
    }
}

fn normalize(expression: &str) -> Result<String> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => {
            return Err(AppError::InvalidSchedule(format!(
                "'{expression}' has {n} fields, expected 5 (or 6 with seconds)"
            )));
        }
    }
    fields[5] = weekday_names(&fields[5]);
    Ok(fields.join(" "))
}

// The cron crate counts weekdays from 1 = Sunday; classic cron uses 0 = Sunday.
fn weekday_names(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            let named = match base.split_once('-') {
                Some((from, to)) => match (weekday(from), to.parse::<usize>().ok()) {
                    (Some(from), Some(7)) if step.is_none() && from != "SUN" => {
                        format!("{from}-SAT,SUN")
                    }
                    (Some(from), Some(to)) if to <= 7 => {
                        format!("{from}-{}", WEEKDAYS[if to == 7 { 6 } else { to }])
                    }
                    _ => base.to_string(),
                },
                None => weekday(base).map(str::to_string).unwrap_or_else(|| base.to_string()),
            };
            match step {
                Some(step) => format!("{named}/{step}"),
                None => named,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn weekday(value: &str) -> Option<&'static str> {
    value
        .parse::<usize>()
        .ok()
        .and_then(|n| WEEKDAYS.get(n).copied())
}
