use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use super::types::ControlTest;
use crate::core::error::ApiError;

pub const MAX_INTERVAL_MINUTES: i32 = 10080;

/// Delay between activation and the first scheduled run.
pub fn activation_delay() -> Duration {
    Duration::minutes(1)
}

/// Parses a cron expression. Five-field expressions are read as classic
/// crontab: they get a leading seconds field and their day-of-week field
/// is renumbered from crontab's 0-7 (0 and 7 are Sunday) to the 1-7
/// (1 is Sunday) the scheduler uses.
pub fn parse_cron(expression: &str) -> Result<Schedule, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = if let [minute, hour, day, month, weekday] = fields[..] {
        format!("0 {minute} {hour} {day} {month} {}", crontab_weekdays(weekday)?)
    } else {
        fields.join(" ")
    };
    Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// Renumbers a crontab day-of-week field. Names and `*` pass through;
/// numeric days, ranges and steps are expanded to an explicit list.
fn crontab_weekdays(field: &str) -> Result<String, String> {
    let mut out = Vec::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".into());
                }
                (base, Some(step))
            }
            None => (part, None),
        };
        if base == "*" || base.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(part.to_string());
            continue;
        }
        let (first, last) = match base.split_once('-') {
            Some((a, b)) => (crontab_day(a)?, crontab_day(b)?),
            None => {
                let day = crontab_day(base)?;
                (day, if step.is_some() { 6 } else { day })
            }
        };
        if first > last {
            return Err(format!("invalid day-of-week range '{base}'"));
        }
        for day in (first..=last).step_by(step.unwrap_or(1) as usize) {
            let day = (day % 7 + 1).to_string();
            if !out.contains(&day) {
                out.push(day);
            }
        }
    }
    Ok(out.join(","))
}

fn crontab_day(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day of week '{value}' is not between 0 and 7")),
    }
}

/// Checks the cron-xor-interval rule and the bounds of whichever is set.
pub fn check_schedule(cron_expression: Option<&str>, interval_minutes: Option<i32>) -> Result<(), ApiError> {
    match (cron_expression, interval_minutes) {
        (Some(_), Some(_)) => Err(ApiError::field(
            "cron_expression",
            "cron_expression and interval_minutes are mutually exclusive",
        )),
        (None, None) => Err(ApiError::field(
            "interval_minutes",
            "either cron_expression or interval_minutes is required",
        )),
        (Some(expression), None) => parse_cron(expression)
            .map(|_| ())
            .map_err(|e| ApiError::field("cron_expression", format!("is not a valid cron expression: {e}"))),
        (None, Some(minutes)) if !(1..=MAX_INTERVAL_MINUTES).contains(&minutes) => Err(ApiError::field(
            "interval_minutes",
            format!("must be between 1 and {MAX_INTERVAL_MINUTES}"),
        )),
        (None, Some(_)) => Ok(()),
    }
}

/// Next due time after `from` for an active test.
pub fn next_run_after(test: &ControlTest, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(minutes) = test.interval_minutes {
        return Some(from + Duration::minutes(i64::from(minutes)));
    }
    let schedule = parse_cron(test.cron_expression.as_deref()?).ok()?;
    schedule.after(&from).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_engine::types::TestType;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use uuid::Uuid;

    #[test]
    fn test_five_field_cron_is_accepted() {
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("0 0 2 * * *").is_ok());
        assert!(parse_cron("every tuesday").is_err());
    }

    fn next_weekday(expression: &str) -> Weekday {
        // 2026-03-04 is a Wednesday.
        let from = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).single().expect("valid time");
        let schedule = parse_cron(expression).expect("valid cron");
        schedule.after(&from).next().expect("has a next time").weekday()
    }

    #[test]
    fn test_crontab_day_of_week_numbering() {
        assert_eq!(next_weekday("0 0 * * 0"), Weekday::Sun);
        assert_eq!(next_weekday("0 0 * * 7"), Weekday::Sun);
        assert_eq!(next_weekday("* * * * 1"), Weekday::Mon);
        assert_eq!(next_weekday("0 9 * * 6"), Weekday::Sat);
        assert_eq!(next_weekday("0 9 * * 1-2"), Weekday::Mon);
        assert_eq!(next_weekday("0 9 * * 5-7"), Weekday::Fri);
        assert_eq!(next_weekday("0 9 * * Mon"), Weekday::Mon);
        assert!(parse_cron("0 9 * * 8").is_err());
        assert!(parse_cron("0 9 * * 5-1").is_err());
    }

    #[test]
    fn test_crontab_weekday_lists() {
        assert_eq!(crontab_weekdays("0").as_deref(), Ok("1"));
        assert_eq!(crontab_weekdays("1-5").as_deref(), Ok("2,3,4,5,6"));
        assert_eq!(crontab_weekdays("0,7").as_deref(), Ok("1"));
        assert_eq!(crontab_weekdays("*/2").as_deref(), Ok("*/2"));
        assert_eq!(crontab_weekdays("1-7/3").as_deref(), Ok("2,5,1"));
    }

    #[test]
    fn test_schedule_is_exclusive() {
        assert!(check_schedule(Some("0 * * * *"), None).is_ok());
        assert!(check_schedule(None, Some(10080)).is_ok());
        let err = check_schedule(Some("0 * * * *"), Some(5)).expect_err("both set");
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(check_schedule(None, None).is_err());
        assert!(check_schedule(None, Some(10081)).is_err());
        assert!(check_schedule(None, Some(0)).is_err());
    }

    #[test]
    fn test_next_run_follows_schedule() {
        let mut test = ControlTest::new(Uuid::new_v4(), "TST-1".into(), "MFA".into(), TestType::Configuration, Uuid::new_v4(), Uuid::new_v4());
        let from = Utc.with_ymd_and_hms(2026, 3, 1, 10, 7, 0).single().expect("valid time");

        test.interval_minutes = Some(30);
        assert_eq!(next_run_after(&test, from), Some(from + Duration::minutes(30)));

        test.interval_minutes = None;
        test.cron_expression = Some("0 * * * *".into());
        let next = next_run_after(&test, from).expect("cron has a next time");
        assert_eq!((next.hour(), next.minute()), (11, 0));
    }
}
