use super::task::ScheduleKind;
use crate::shared::time::parse_rfc3339_secs;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;

const MAX_CRON_SEARCH_MINUTES: i64 = 60 * 24 * 366 * 5;
const MAX_INTERVAL_SECONDS: i64 = 31_536_000;

/// Checks a schedule value without computing anything from it.
pub fn validate_schedule(kind: ScheduleKind, value: &str) -> Result<(), String> {
    match kind {
        ScheduleKind::Cron => parse_cron_expression(value).map(|_| ()),
        ScheduleKind::Interval => parse_interval_seconds(value).map(|_| ()),
        ScheduleKind::Once => parse_rfc3339_secs(value).map(|_| ()),
    }
}

/// Next time a task of this schedule should fire.
///
/// `last_run` is `None` when the task has never run. A `once` task that has
/// already run yields `None`: it is retired. Intervals are measured from
/// `now`, not from the previous planned time, so a late tick never causes a
/// burst of catch-up runs.
pub fn compute_next_run(
    kind: ScheduleKind,
    value: &str,
    now: i64,
    last_run: Option<i64>,
    timezone: &Tz,
) -> Result<Option<i64>, String> {
    match kind {
        ScheduleKind::Once => {
            if last_run.is_some() {
                Ok(None)
            } else {
                parse_rfc3339_secs(value).map(Some)
            }
        }
        ScheduleKind::Interval => {
            let seconds = parse_interval_seconds(value)?;
            Ok(Some(now.saturating_add(seconds)))
        }
        ScheduleKind::Cron => {
            let cron = parse_cron_expression(value)?;
            let mut candidate = ((now / 60) + 1) * 60;
            for _ in 0..MAX_CRON_SEARCH_MINUTES {
                if cron_matches(&cron, candidate, timezone) {
                    return Ok(Some(candidate));
                }
                candidate = candidate.saturating_add(60);
            }
            Err(format!(
                "unable to compute next run for cron expression `{value}` in timezone `{timezone}`"
            ))
        }
    }
}

fn parse_interval_seconds(raw: &str) -> Result<i64, String> {
    let seconds = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("interval must be a whole number of seconds (got `{raw}`)"))?;
    if seconds < 1 {
        return Err("interval must be >= 1 second".to_string());
    }
    if seconds > MAX_INTERVAL_SECONDS {
        return Err(format!("interval must be <= {MAX_INTERVAL_SECONDS} seconds"));
    }
    Ok(seconds)
}

#[derive(Debug, Clone)]
struct CronField {
    any: bool,
    values: BTreeSet<u32>,
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        self.any || self.values.contains(&value)
    }
}

#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

pub fn parse_cron_expression(raw: &str) -> Result<CronExpression, String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(
            "cron expression must use 5 fields: minute hour day_of_month month day_of_week"
                .to_string(),
        );
    }

    Ok(CronExpression {
        minute: parse_cron_field(fields[0], 0, 59, AliasKind::None)?,
        hour: parse_cron_field(fields[1], 0, 23, AliasKind::None)?,
        day_of_month: parse_cron_field(fields[2], 1, 31, AliasKind::None)?,
        month: parse_cron_field(fields[3], 1, 12, AliasKind::Month)?,
        day_of_week: parse_cron_field(fields[4], 0, 7, AliasKind::Weekday)?,
    })
}

fn cron_matches(expr: &CronExpression, unix_ts: i64, timezone: &Tz) -> bool {
    let Some(utc_dt) = Utc.timestamp_opt(unix_ts, 0).single() else {
        return false;
    };
    let local = utc_dt.with_timezone(timezone);

    if !expr.minute.matches(local.minute())
        || !expr.hour.matches(local.hour())
        || !expr.month.matches(local.month())
    {
        return false;
    }

    let day_of_month_match = expr.day_of_month.matches(local.day());
    let day_of_week_match = expr
        .day_of_week
        .matches(local.weekday().num_days_from_sunday());

    // Classic cron: when both day fields are restricted, either may match.
    if expr.day_of_month.any || expr.day_of_week.any {
        day_of_month_match && day_of_week_match
    } else {
        day_of_month_match || day_of_week_match
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliasKind {
    None,
    Month,
    Weekday,
}

fn parse_cron_field(
    raw: &str,
    min: u32,
    max: u32,
    aliases: AliasKind,
) -> Result<CronField, String> {
    if raw == "*" {
        return Ok(CronField {
            any: true,
            values: BTreeSet::new(),
        });
    }

    let mut values = BTreeSet::new();
    for segment in raw.split(',') {
        parse_cron_segment(segment, min, max, aliases, &mut values)?;
    }
    if values.is_empty() {
        return Err(format!("invalid cron field `{raw}`"));
    }
    Ok(CronField { any: false, values })
}

fn parse_cron_segment(
    raw: &str,
    min: u32,
    max: u32,
    aliases: AliasKind,
    values: &mut BTreeSet<u32>,
) -> Result<(), String> {
    let (range_raw, step) = match raw.split_once('/') {
        Some((range, step_raw)) => {
            let step = step_raw
                .parse::<u32>()
                .map_err(|_| format!("invalid cron step `{step_raw}`"))?;
            if step == 0 {
                return Err("cron step must be >= 1".to_string());
            }
            (range, step)
        }
        None => (raw, 1),
    };

    let (start, end) = if range_raw == "*" {
        (min, max)
    } else if let Some((start_raw, end_raw)) = range_raw.split_once('-') {
        (
            parse_cron_atom(start_raw, min, max, aliases)?,
            parse_cron_atom(end_raw, min, max, aliases)?,
        )
    } else {
        let value = parse_cron_atom(range_raw, min, max, aliases)?;
        (value, value)
    };

    if start > end {
        return Err(format!("invalid cron range `{raw}`"));
    }

    let mut value = start;
    while value <= end {
        // Sunday may be written as 0 or 7.
        let normalized = if aliases == AliasKind::Weekday && value == 7 {
            0
        } else {
            value
        };
        values.insert(normalized);
        match value.checked_add(step) {
            Some(next) => value = next,
            None => break,
        }
    }
    Ok(())
}

fn parse_cron_atom(raw: &str, min: u32, max: u32, aliases: AliasKind) -> Result<u32, String> {
    let lower = raw.to_ascii_lowercase();
    let alias = match aliases {
        AliasKind::None => None,
        AliasKind::Month => [
            "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
        ]
        .iter()
        .position(|name| *name == lower)
        .map(|index| index as u32 + 1),
        AliasKind::Weekday => ["sun", "mon", "tue", "wed", "thu", "fri", "sat"]
            .iter()
            .position(|name| *name == lower)
            .map(|index| index as u32),
    };
    let value = match alias {
        Some(value) => value,
        None => lower
            .parse::<u32>()
            .map_err(|_| format!("invalid cron value `{raw}`"))?,
    };

    if value < min || value > max {
        return Err(format!(
            "cron value `{raw}` is out of bounds ({min}..={max})"
        ));
    }
    Ok(value)
}
