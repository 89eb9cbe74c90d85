//! Cron expression parsing, matching and next-run computation.
//!
//! Standard 5-field expressions (minute hour dom month dow), with an
//! optional leading seconds field. Supports `*`, `*/n`, exact values,
//! ranges `a-b` and comma lists. Malformed expressions are rejected at
//! parse time.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use ck_common::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Step(u32),
    List(Vec<CronPart>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronPart {
    Exact(u32),
    Range(u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: Option<CronField>,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> EngineResult<Self> {
        let fields: Vec<&str> = expression.trim().split_whitespace().collect();
        let (seconds, rest): (Option<CronField>, &[&str]) = match fields.len() {
            5 => (None, &fields[..]),
            6 => (Some(parse_field(fields[0], 0, 59)?), &fields[1..]),
            n => {
                return Err(EngineError::BadInput(format!(
                    "cron expression must have 5 or 6 fields, got {n}"
                )));
            }
        };

        Ok(Self {
            expression: expression.trim().to_string(),
            seconds,
            minute: parse_field(rest[0], 0, 59)?,
            hour: parse_field(rest[1], 0, 23)?,
            day_of_month: parse_field(rest[2], 1, 31)?,
            month: parse_field(rest[3], 1, 12)?,
            // 7 is accepted as an alias for Sunday
            day_of_week: parse_field(rest[4], 0, 7)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let seconds_ok = match &self.seconds {
            None => true,
            Some(field) => field_matches(field, at.second()),
        };
        seconds_ok && self.date_fields_match(at)
    }

    fn date_fields_match(&self, at: DateTime<Utc>) -> bool {
        let dow = at.weekday().num_days_from_sunday();
        field_matches(&self.minute, at.minute())
            && field_matches(&self.hour, at.hour())
            && field_matches(&self.day_of_month, at.day())
            && field_matches(&self.month, at.month())
            && (field_matches(&self.day_of_week, dow)
                || (dow == 0 && field_matches(&self.day_of_week, 7)))
    }

    /// First instant strictly after `after` matching the schedule, scanning
    /// at most a year ahead.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut cursor = after.with_nanosecond(0)?.with_second(0)?;

        for _ in 0..(366 * 24 * 60) {
            if self.date_fields_match(cursor) {
                match &self.seconds {
                    None => {
                        if cursor > after {
                            return Some(cursor);
                        }
                    }
                    Some(field) => {
                        for second in 0..60u32 {
                            if field_matches(field, second) {
                                let candidate = cursor.with_second(second)?;
                                if candidate > after {
                                    return Some(candidate);
                                }
                            }
                        }
                    }
                }
            }
            cursor = cursor + Duration::minutes(1);
        }
        None
    }
}

fn parse_field(input: &str, min: u32, max: u32) -> EngineResult<CronField> {
    let bad = || EngineError::BadInput(format!("invalid cron field: {input}"));

    if input == "*" {
        return Ok(CronField::Any);
    }

    if let Some(step) = input.strip_prefix("*/") {
        let step: u32 = step.parse().map_err(|_| bad())?;
        if step == 0 || step > max.max(1) {
            return Err(bad());
        }
        return Ok(CronField::Step(step));
    }

    let mut parts = Vec::new();
    for part in input.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.parse().map_err(|_| bad())?;
            let end: u32 = end.parse().map_err(|_| bad())?;
            if start > end || start < min || end > max {
                return Err(bad());
            }
            parts.push(CronPart::Range(start, end));
        } else {
            let value: u32 = part.parse().map_err(|_| bad())?;
            if value < min || value > max {
                return Err(bad());
            }
            parts.push(CronPart::Exact(value));
        }
    }
    if parts.is_empty() {
        return Err(bad());
    }
    Ok(CronField::List(parts))
}

fn field_matches(field: &CronField, value: u32) -> bool {
    match field {
        CronField::Any => true,
        CronField::Step(step) => value % step == 0,
        CronField::List(parts) => parts.iter().any(|part| match part {
            CronPart::Exact(exact) => value == *exact,
            CronPart::Range(start, end) => value >= *start && value <= *end,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(CronSchedule::parse("").is_err());
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("* * * * * * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
        assert!(CronSchedule::parse("5-2 * * * *").is_err());
    }

    #[test]
    fn test_parse_accepts_standard_forms() {
        assert!(CronSchedule::parse("0 3 * * *").is_ok());
        assert!(CronSchedule::parse("*/5 * * * *").is_ok());
        assert!(CronSchedule::parse("0 0 1,15 * 1-5").is_ok());
        // Optional seconds field
        assert!(CronSchedule::parse("30 0 3 * * *").is_ok());
    }

    #[test]
    fn test_field_matching() {
        let schedule = CronSchedule::parse("30 14 * * *").unwrap();
        assert!(schedule.matches(at("2026-03-02T14:30:00Z")));
        assert!(!schedule.matches(at("2026-03-02T14:31:00Z")));
    }

    #[test]
    fn test_step_field() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert!(schedule.matches(at("2026-03-02T09:00:00Z")));
        assert!(schedule.matches(at("2026-03-02T09:45:00Z")));
        assert!(!schedule.matches(at("2026-03-02T09:50:00Z")));
    }

    #[test]
    fn test_day_of_week_sunday_aliases() {
        // 2026-03-01 is a Sunday
        let zero = CronSchedule::parse("0 8 * * 0").unwrap();
        let seven = CronSchedule::parse("0 8 * * 7").unwrap();
        assert!(zero.matches(at("2026-03-01T08:00:00Z")));
        assert!(seven.matches(at("2026-03-01T08:00:00Z")));
        assert!(!seven.matches(at("2026-03-02T08:00:00Z")));
    }

    #[test]
    fn test_next_after_daily() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        assert_eq!(
            schedule.next_after(at("2026-03-02T10:00:00Z")),
            Some(at("2026-03-03T09:00:00Z"))
        );
        assert_eq!(
            schedule.next_after(at("2026-03-02T08:59:59Z")),
            Some(at("2026-03-02T09:00:00Z"))
        );
        // Strictly after
        assert_eq!(
            schedule.next_after(at("2026-03-02T09:00:00Z")),
            Some(at("2026-03-03T09:00:00Z"))
        );
    }

    #[test]
    fn test_next_after_with_seconds_field() {
        let schedule = CronSchedule::parse("30 * * * * *").unwrap();
        assert_eq!(
            schedule.next_after(at("2026-03-02T10:00:00Z")),
            Some(at("2026-03-02T10:00:30Z"))
        );
        assert_eq!(
            schedule.next_after(at("2026-03-02T10:00:30Z")),
            Some(at("2026-03-02T10:01:30Z"))
        );
    }

    #[test]
    fn test_next_after_month_boundary() {
        let schedule = CronSchedule::parse("0 0 1 * *").unwrap();
        assert_eq!(
            schedule.next_after(at("2026-03-15T12:00:00Z")),
            Some(at("2026-04-01T00:00:00Z"))
        );
    }
}
