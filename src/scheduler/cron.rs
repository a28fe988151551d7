//! Cron expression and wall-clock trigger parsing for schedules.
//!
//! Accepts standard five-field cron expressions plus the `@shortcut` forms,
//! and `HH:MM` wall-clock time lists.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Expand `@shortcut` forms and pad five-field expressions with a seconds
/// field, which the cron parser requires.
fn expand(expr: &str) -> Result<String> {
    let expr = expr.trim();
    let expanded = match expr {
        "@minutely" => "0 * * * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * SUN".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        other if other.starts_with('@') => {
            return Err(Error::config(format!("unknown cron shortcut: {other}")))
        }
        other => {
            let fields = other.split_whitespace().count();
            match fields {
                5 => format!("0 {other}"),
                6 | 7 => other.to_string(),
                n => {
                    return Err(Error::config(format!(
                        "cron expression has {n} fields, expected 5: {other}"
                    )))
                }
            }
        }
    };
    Ok(expanded)
}

/// Parse one cron expression.
pub fn parse_cron(expr: &str) -> Result<CronSchedule> {
    let expanded = expand(expr)?;
    CronSchedule::from_str(&expanded)
        .map_err(|e| Error::config(format!("invalid cron expression '{expr}': {e}")))
}

/// Parse a wall-clock trigger time in `HH:MM` form.
pub fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| Error::config(format!("invalid time '{raw}', expected HH:MM")))
}

/// The next instant, strictly after `now`, at which any of the given cron
/// expressions or wall-clock times fires.
pub fn next_trigger(
    crons: &[CronSchedule],
    times: &[NaiveTime],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let from_crons = crons.iter().filter_map(|c| c.after(&now).next());

    let from_times = times.iter().filter_map(|t| {
        let today = Utc
            .from_local_datetime(&now.date_naive().and_time(*t))
            .single()?;
        if today > now {
            Some(today)
        } else {
            Some(today + ChronoDuration::days(1))
        }
    });

    from_crons.chain(from_times).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn shortcuts_expand() {
        assert!(parse_cron("@minutely").is_ok());
        assert!(parse_cron("@hourly").is_ok());
        assert!(parse_cron("@daily").is_ok());
        assert!(parse_cron("@weekly").is_ok());
        assert!(parse_cron("@monthly").is_ok());
        assert!(parse_cron("@yearly").is_ok());
        assert!(parse_cron("@fortnightly").is_err());
    }

    #[test]
    fn five_field_expression_accepted() {
        let schedule = parse_cron("*/5 * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.after(&now).next().unwrap();
        assert!(next > now);
        assert_eq!(next.minute() % 5, 0);
    }

    #[test]
    fn wrong_field_count_rejected() {
        assert!(parse_cron("* * *").is_err());
    }

    #[test]
    fn parses_wall_clock_times() {
        assert_eq!(
            parse_time("09:30").unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("9am").is_err());
    }

    #[test]
    fn next_trigger_picks_earliest() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap();
        let crons = vec![parse_cron("@hourly").unwrap()];
        let times = vec![parse_time("10:30").unwrap()];
        let next = next_trigger(&crons, &times, now).unwrap();
        // 10:30 today beats 11:00 from the hourly cron.
        assert_eq!((next.hour(), next.minute()), (10, 30));
        assert_eq!(next.day(), 1);
    }

    #[test]
    fn past_time_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let times = vec![parse_time("08:00").unwrap()];
        let next = next_trigger(&[], &times, now).unwrap();
        assert_eq!(next.day(), 2);
        assert_eq!(next.hour(), 8);
    }
}
