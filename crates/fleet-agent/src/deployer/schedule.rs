//! Standard 5-field cron parsing and next-fire-time computation. No crate in this workspace's stack
//! already provides this, so it is implemented directly: a minimal
//! recursive-descent parser over the five fields
//! (minute hour day-of-month month day-of-week), each supporting `*`,
//! comma lists, `a-b` ranges, and `*/n` / `a-b/n` steps, which covers
//! every schedule upstream Fleet's own cron library accepts for this
//! subsystem.

use chrono::{DateTime, Datelike, Timelike, Utc};
use snafu::{OptionExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cron expression {expression:?} must have exactly 5 fields, got {count}"))]
    FieldCount { expression: String, count: usize },

    #[snafu(display("invalid cron field {field:?} in expression {expression:?}"))]
    InvalidField { expression: String, field: String },

    #[snafu(display("cron field value {value} is out of range {min}-{max}"))]
    OutOfRange { value: u32, min: u32, max: u32 },

    #[snafu(display("no fire time found for {expression:?} within the search horizon"))]
    NoFireTimeFound { expression: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
    expression: String,
}

#[derive(Clone, Debug, PartialEq)]
struct Field {
    allowed: Vec<u32>,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.allowed.contains(&value)
    }
}

fn parse_field(expression: &str, raw: &str, min: u32, max: u32) -> Result<Field, Error> {
    let mut allowed = Vec::new();
    for part in raw.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<u32>().ok().context(InvalidFieldSnafu {
                    expression: expression.to_owned(),
                    field: part.to_owned(),
                })?,
            ),
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let lo: u32 = lo.parse().ok().context(InvalidFieldSnafu {
                expression: expression.to_owned(),
                field: part.to_owned(),
            })?;
            let hi: u32 = hi.parse().ok().context(InvalidFieldSnafu {
                expression: expression.to_owned(),
                field: part.to_owned(),
            })?;
            (lo, hi)
        } else {
            let value: u32 = range_part.parse().ok().context(InvalidFieldSnafu {
                expression: expression.to_owned(),
                field: part.to_owned(),
            })?;
            (value, value)
        };

        if start < min || end > max || start > end {
            return OutOfRangeSnafu { value: start, min, max }.fail();
        }

        let mut value = start;
        while value <= end {
            allowed.push(value);
            value += step;
        }
    }
    allowed.sort_unstable();
    allowed.dedup();
    Ok(Field { allowed })
}

impl CronSchedule {
    /// Parse a standard 5-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return FieldCountSnafu {
                expression: expression.to_owned(),
                count: fields.len(),
            }
            .fail();
        }
        Ok(CronSchedule {
            minute: parse_field(expression, fields[0], 0, 59)?,
            hour: parse_field(expression, fields[1], 0, 23)?,
            day_of_month: parse_field(expression, fields[2], 1, 31)?,
            month: parse_field(expression, fields[3], 1, 12)?,
            day_of_week: parse_field(expression, fields[4], 0, 6)?,
            expression: expression.to_owned(),
        })
    }

    /// The next instant strictly after `after` at which this schedule
    /// fires, searched minute-by-minute up to two years out (a schedule
    /// that never fires within that horizon is a configuration bug, not
    /// a legitimate wait).
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        let mut candidate = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + chrono::Duration::minutes(1);

        let horizon = after + chrono::Duration::days(366 * 2);
        while candidate < horizon {
            if self.minute.matches(candidate.minute())
                && self.hour.matches(candidate.hour())
                && self.day_of_month.matches(candidate.day())
                && self.month.matches(candidate.month())
                && self.day_of_week.matches(candidate.weekday().num_days_from_sunday())
            {
                return Ok(candidate);
            }
            candidate += chrono::Duration::minutes(1);
        }
        NoFireTimeFoundSnafu {
            expression: self.expression.clone(),
        }
        .fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("valid datetime")
    }

    use chrono::TimeZone;

    #[test]
    fn daily_3am_fires_at_next_3am() {
        let schedule = CronSchedule::parse("0 3 * * *").expect("parse");
        let next = schedule.next_after(t(2026, 1, 1, 2, 0)).expect("next fire");
        assert_eq!(next, t(2026, 1, 1, 3, 0));
    }

    #[test]
    fn daily_3am_after_3am_rolls_to_next_day() {
        let schedule = CronSchedule::parse("0 3 * * *").expect("parse");
        let next = schedule.next_after(t(2026, 1, 1, 3, 0)).expect("next fire");
        assert_eq!(next, t(2026, 1, 2, 3, 0));
    }

    #[test]
    fn step_field_fires_every_15_minutes() {
        let schedule = CronSchedule::parse("*/15 * * * *").expect("parse");
        let next = schedule.next_after(t(2026, 1, 1, 0, 1)).expect("next fire");
        assert_eq!(next, t(2026, 1, 1, 0, 15));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronSchedule::parse("0 3 * *").is_err());
    }

    #[test]
    fn rejects_out_of_range_value() {
        assert!(CronSchedule::parse("0 99 * * *").is_err());
    }
}
