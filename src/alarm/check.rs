//! Alarm checks
//!
//! Checks are parsed from a point's limits field and run in order on every
//! valid sample after the stage chain. A check that trips returns a copy of
//! the sample with the alarm flag set; once a sample is flagged the remaining
//! checks are skipped.

use crate::config::points::parse_stage_spec;
use crate::error::{EngineError, Result};
use crate::types::{parse_as_bool, Sample};

/// One alarm rule with its running state
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmCheck {
    /// Numeric range; with `inside_normal` the alarm is raised outside it
    Range {
        lower: f64,
        upper: f64,
        inside_normal: bool,
    },
    /// Numeric match held for `count` consecutive updates
    ValueMatch {
        target: f64,
        match_normal: bool,
        count: u32,
        running: u32,
    },
    /// Case-insensitive string set
    StringMatch { match_normal: bool, set: Vec<String> },
    /// Boolean equal to `alarm_value` for `count` consecutive updates
    Boolean {
        alarm_value: bool,
        count: u32,
        running: u32,
    },
}

fn flag(text: &str) -> bool {
    matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "t" | "1")
}

fn number(class: &str, text: &str) -> Result<f64> {
    text.trim()
        .parse()
        .map_err(|_| EngineError::stage_args(class, format!("\"{}\" is not a number", text)))
}

fn count(class: &str, text: Option<&String>) -> Result<u32> {
    match text {
        None => Ok(1),
        Some(t) => t
            .trim()
            .parse::<u32>()
            .map(|c| c.max(1))
            .map_err(|_| EngineError::stage_args(class, format!("\"{}\" is not a count", t))),
    }
}

impl AlarmCheck {
    /// Parse a limits spec such as `Range-"0""20"`
    pub fn parse(spec: &str) -> Result<Option<Self>> {
        let Some(parsed) = parse_stage_spec(spec) else {
            return Ok(None);
        };
        let class = parsed.class.as_str();
        let args = &parsed.args;

        let check = match class {
            "Range" => {
                if args.len() < 2 {
                    return Err(EngineError::stage_args(class, "need lower and upper limits"));
                }
                let a = number(class, &args[0])?;
                let b = number(class, &args[1])?;
                AlarmCheck::Range {
                    lower: a.min(b),
                    upper: a.max(b),
                    inside_normal: args.get(2).map_or(true, |s| flag(s)),
                }
            }
            "ValueMatch" => {
                let target = args
                    .first()
                    .ok_or_else(|| EngineError::stage_args(class, "need a value to match"))?;
                AlarmCheck::ValueMatch {
                    target: number(class, target)?,
                    match_normal: args.get(1).map_or(true, |s| flag(s)),
                    count: count(class, args.get(2))?,
                    running: 0,
                }
            }
            "StringMatch" => {
                if args.len() < 2 {
                    return Err(EngineError::stage_args(class, "need a flag and at least one string"));
                }
                AlarmCheck::StringMatch {
                    match_normal: flag(&args[0]),
                    set: args[1..].iter().map(|s| s.trim().to_string()).collect(),
                }
            }
            "Boolean" => AlarmCheck::Boolean {
                alarm_value: args.first().map_or(true, |s| flag(s)),
                count: count(class, args.get(1))?,
                running: 0,
            },
            other => return Err(EngineError::UnknownStage(format!("alarm check {}", other))),
        };

        Ok(Some(check))
    }

    /// Parse every spec in a limits field
    pub fn parse_all(specs: &[String]) -> Result<Vec<Self>> {
        let mut checks = Vec::new();
        for spec in specs {
            if let Some(c) = Self::parse(spec)? {
                checks.push(c);
            }
        }
        Ok(checks)
    }

    /// True when this sample trips the check
    pub fn trips(&mut self, sample: &Sample) -> bool {
        let Some(value) = sample.value() else {
            return false;
        };

        match self {
            AlarmCheck::Range {
                lower,
                upper,
                inside_normal,
            } => match value.as_f64() {
                Some(v) => {
                    let within = v >= *lower && v <= *upper;
                    within != *inside_normal
                }
                None => {
                    tracing::warn!("({}) Range check on non-numeric data", sample.name());
                    false
                }
            },
            AlarmCheck::ValueMatch {
                target,
                match_normal,
                count,
                running,
            } => {
                let Some(v) = value.as_f64() else {
                    tracing::warn!("({}) ValueMatch check on non-numeric data", sample.name());
                    return false;
                };
                let matched = v == *target;
                if matched != *match_normal {
                    *running += 1;
                } else {
                    *running = 0;
                }
                *running >= *count
            }
            AlarmCheck::StringMatch { match_normal, set } => {
                let text = value.to_string();
                let text = text.trim();
                let matched = set.iter().any(|s| s.eq_ignore_ascii_case(text));
                matched != *match_normal
            }
            AlarmCheck::Boolean {
                alarm_value,
                count,
                running,
            } => {
                match parse_as_bool(value) {
                    Some(b) if b == *alarm_value => *running += 1,
                    _ => *running = 0,
                }
                *running >= *count
            }
        }
    }
}

/// Run checks in order, stopping at the first that trips
pub fn apply_checks(checks: &mut [AlarmCheck], sample: Sample) -> Sample {
    if sample.alarm() {
        return sample;
    }
    for check in checks.iter_mut() {
        if check.trips(&sample) {
            return sample.with_alarm(true);
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::timestamp_from_secs;

    fn s(v: impl Into<crate::types::Value>) -> Sample {
        Sample::new("site.x", timestamp_from_secs(0), v)
    }

    #[test]
    fn test_range_inside_normal() {
        let mut check = AlarmCheck::parse(r#"Range-"20""0""#).unwrap().unwrap();
        assert!(!check.trips(&s(10.0)));
        assert!(check.trips(&s(25.0)));
        assert!(check.trips(&s(-1i64)));
    }

    #[test]
    fn test_range_inside_abnormal() {
        let mut check = AlarmCheck::parse(r#"Range-"0""20""false""#).unwrap().unwrap();
        assert!(check.trips(&s(10.0)));
        assert!(!check.trips(&s(25.0)));
    }

    #[test]
    fn test_value_match_needs_consecutive_updates() {
        let mut check = AlarmCheck::parse(r#"ValueMatch-"1""true""3""#).unwrap().unwrap();
        assert!(!check.trips(&s(0i64)));
        assert!(!check.trips(&s(0i64)));
        assert!(check.trips(&s(0i64)));
        // A matching value resets the run
        assert!(!check.trips(&s(1i64)));
        assert!(!check.trips(&s(0i64)));
    }

    #[test]
    fn test_string_match() {
        let mut check = AlarmCheck::parse(r#"StringMatch-"true""OK""IDLE""#).unwrap().unwrap();
        assert!(!check.trips(&s("ok")));
        assert!(check.trips(&s("FAULT")));
    }

    #[test]
    fn test_boolean() {
        let mut check = AlarmCheck::parse(r#"Boolean-"true""2""#).unwrap().unwrap();
        assert!(!check.trips(&s(true)));
        assert!(check.trips(&s(true)));
        assert!(!check.trips(&s(false)));
    }

    #[test]
    fn test_null_never_trips() {
        let mut check = AlarmCheck::parse(r#"Range-"0""1""#).unwrap().unwrap();
        assert!(!check.trips(&Sample::null("site.x", timestamp_from_secs(0))));
    }

    #[test]
    fn test_apply_stops_after_first_trip() {
        let mut checks = AlarmCheck::parse_all(&[
            r#"Range-"0""1""#.to_string(),
            r#"Boolean-"true""2""#.to_string(),
        ])
        .unwrap();
        let out = apply_checks(&mut checks, s(5i64));
        assert!(out.alarm());
        // The boolean check never saw the sample
        assert_eq!(
            checks[1],
            AlarmCheck::Boolean {
                alarm_value: true,
                count: 2,
                running: 0
            }
        );
    }

    #[test]
    fn test_bad_spec() {
        assert!(AlarmCheck::parse(r#"Range-"1""#).is_err());
        assert!(AlarmCheck::parse("Sometimes").is_err());
        assert!(AlarmCheck::parse("-").unwrap().is_none());
    }
}
