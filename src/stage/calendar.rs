//! Wall-clock pulses driven by the shared timer
//!
//! These stages do not react to input. On activation each one schedules a
//! timer task at the owning point's period; every tick evaluates a
//! calendar rule in the configured zone and pushes a boolean sample into
//! the point's chain, where the stage passes it through.
//!
//! Zones are `UTC`/`GMT`/`Z`, `Local`, an IANA name such as
//! `Australia/Sydney`, or a fixed offset such as `+10:00`, `-0330` or
//! `UTC+10`. Named zones follow daylight saving.

use crate::error::{EngineError, Result};
use crate::stage::{parse_arg, require_args, Activation, Stage, StageContext, StageInit, StageRegistry};
use crate::timer::TaskControl;
use crate::types::{Period, Sample, Timestamp, Value};
use chrono::{
    Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike,
};
use chrono_tz::Tz;
use std::sync::Arc;

pub(crate) fn register(registry: &mut StageRegistry) {
    registry.register("DailyPulse", CalendarPulse::create_daily);
    registry.register("MonthlyPulse", CalendarPulse::create_monthly);
    registry.register("CronPulse", CalendarPulse::create_cron);
    registry.register("DailyWindow", CalendarPulse::create_window);
}

// ==================== Zones and times ====================

/// Time zone in which a calendar rule is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSpec {
    Utc,
    Local,
    Fixed(FixedOffset),
    Named(Tz),
}

impl ZoneSpec {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let upper = text.to_ascii_uppercase();
        match upper.as_str() {
            "UTC" | "GMT" | "Z" | "UT" => return Some(ZoneSpec::Utc),
            "LOCAL" | "LOCALTIME" => return Some(ZoneSpec::Local),
            _ => {}
        }
        if let Ok(tz) = text.parse::<Tz>() {
            return Some(ZoneSpec::Named(tz));
        }
        let offset = upper
            .strip_prefix("UTC")
            .or_else(|| upper.strip_prefix("GMT"))
            .unwrap_or(&upper);
        parse_offset(offset).map(ZoneSpec::Fixed)
    }

    /// Wall-clock reading of an instant
    pub fn wall(&self, t: Timestamp) -> NaiveDateTime {
        match self {
            ZoneSpec::Utc => t.naive_utc(),
            ZoneSpec::Local => t.with_timezone(&Local).naive_local(),
            ZoneSpec::Fixed(offset) => t.with_timezone(offset).naive_local(),
            ZoneSpec::Named(tz) => t.with_timezone(tz).naive_local(),
        }
    }

    /// Instant of a wall-clock reading; the earlier one when ambiguous
    pub fn instant(&self, wall: NaiveDateTime) -> Option<Timestamp> {
        let local = match self {
            ZoneSpec::Utc => return Some(wall.and_utc()),
            ZoneSpec::Local => Local.from_local_datetime(&wall).earliest()?.fixed_offset(),
            ZoneSpec::Fixed(offset) => offset.from_local_datetime(&wall).earliest()?,
            ZoneSpec::Named(tz) => tz.from_local_datetime(&wall).earliest()?.fixed_offset(),
        };
        Some(local.to_utc())
    }
}

/// `+HH`, `+HH:MM` or `+HHMM`
fn parse_offset(text: &str) -> Option<FixedOffset> {
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub(crate) fn parse_zone(class: &str, text: &str) -> Result<ZoneSpec> {
    ZoneSpec::parse(text)
        .ok_or_else(|| EngineError::stage_args(class, format!("unknown time zone \"{}\"", text)))
}

/// `HH:MM` in 24-hour format
pub(crate) fn parse_hhmm(class: &str, text: &str) -> Result<NaiveTime> {
    let bad = || EngineError::stage_args(class, format!("need time in HH:MM 24-hour format, got \"{}\"", text));
    let (h, m) = text.trim().split_once(':').ok_or_else(bad)?;
    let h: u32 = h.parse().map_err(|_| bad())?;
    let m: u32 = m.parse().map_err(|_| bad())?;
    NaiveTime::from_hms_opt(h, m, 0).ok_or_else(bad)
}

fn same_minute(a: NaiveTime, b: NaiveTime) -> bool {
    a.hour() == b.hour() && a.minute() == b.minute()
}

// ==================== Cron ====================

/// Five-field cron expression: minute, hour, day of month, month, day of
/// week (0 or 7 is Sunday)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    any_day: bool,
    any_weekday: bool,
}

impl CronSchedule {
    pub fn parse(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::stage_args(
                "CronPulse",
                format!("expected 5 cron fields, got {}", fields.len()),
            ));
        }
        let mut weekdays = parse_cron_field(fields[4], 0, 7)?;
        if weekdays & (1 << 7) != 0 {
            weekdays |= 1;
        }
        Ok(Self {
            minutes: parse_cron_field(fields[0], 0, 59)?,
            hours: parse_cron_field(fields[1], 0, 23)?,
            days: parse_cron_field(fields[2], 1, 31)?,
            months: parse_cron_field(fields[3], 1, 12)?,
            weekdays,
            any_day: fields[2] == "*",
            any_weekday: fields[4] == "*",
        })
    }

    pub fn matches(&self, wall: NaiveDateTime) -> bool {
        let bit = |set: u64, n: u32| set & (1u64 << n) != 0;
        let day = bit(self.days, wall.day());
        let weekday = bit(self.weekdays, wall.weekday().num_days_from_sunday());
        // Both restricted: either may match
        let day_ok = match (self.any_day, self.any_weekday) {
            (false, false) => day || weekday,
            _ => day && weekday,
        };
        bit(self.minutes, wall.minute())
            && bit(self.hours, wall.hour())
            && bit(self.months, wall.month())
            && day_ok
    }
}

fn parse_cron_field(field: &str, min: u32, max: u32) -> Result<u64> {
    let bad = || EngineError::stage_args("CronPulse", format!("bad cron field \"{}\"", field));
    let mut set = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, s.parse::<u32>().map_err(|_| bad())?),
            None => (part, 1),
        };
        if step == 0 {
            return Err(bad());
        }
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (a.parse().map_err(|_| bad())?, b.parse().map_err(|_| bad())?)
        } else {
            let n: u32 = range.parse().map_err(|_| bad())?;
            // "n/step" runs to the end of the range
            (n, if part.contains('/') { max } else { n })
        };
        if lo < min || hi > max || lo > hi {
            return Err(bad());
        }
        for n in (lo..=hi).step_by(step as usize) {
            set |= 1u64 << n;
        }
    }
    Ok(set)
}

// ==================== Rules ====================

/// A calendar rule plus the memory it needs to pulse once per match
#[derive(Debug, Clone)]
pub enum CalendarRule {
    Daily {
        at: NaiveTime,
        zone: ZoneSpec,
        last: Option<NaiveDate>,
    },
    Monthly {
        day: u32,
        at: NaiveTime,
        zone: ZoneSpec,
        last: Option<(i32, u32)>,
    },
    Cron {
        schedule: CronSchedule,
        zone: ZoneSpec,
        last: Option<NaiveDateTime>,
    },
    /// True between two times of day, inclusive; may span midnight
    Window {
        start: NaiveTime,
        end: NaiveTime,
        zone: ZoneSpec,
    },
}

impl CalendarRule {
    /// Evaluate at `now`; pulses report true once per matching minute
    pub fn tick(&mut self, now: Timestamp) -> bool {
        match self {
            CalendarRule::Daily { at, zone, last } => {
                let wall = zone.wall(now);
                let today = wall.date();
                if *last != Some(today) && same_minute(wall.time(), *at) {
                    *last = Some(today);
                    true
                } else {
                    false
                }
            }
            CalendarRule::Monthly { day, at, zone, last } => {
                let wall = zone.wall(now);
                let month = (wall.year(), wall.month());
                if *last != Some(month) && wall.day() == *day && same_minute(wall.time(), *at) {
                    *last = Some(month);
                    true
                } else {
                    false
                }
            }
            CalendarRule::Cron { schedule, zone, last } => {
                let wall = zone.wall(now);
                let minute = wall
                    .with_second(0)
                    .and_then(|w| w.with_nanosecond(0))
                    .unwrap_or(wall);
                if schedule.matches(wall) && *last != Some(minute) {
                    *last = Some(minute);
                    true
                } else {
                    false
                }
            }
            CalendarRule::Window { start, end, zone } => {
                let t = zone.wall(now).time();
                let t = NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t);
                if start <= end {
                    *start <= t && t <= *end
                } else {
                    t >= *start || t <= *end
                }
            }
        }
    }
}

// ==================== Stage ====================

/// Timer-driven boolean pulse; passes its own ticks through the chain
#[derive(Debug)]
pub struct CalendarPulse {
    class: &'static str,
    rule: CalendarRule,
    period: Period,
}

impl CalendarPulse {
    fn build(init: &StageInit<'_>, class: &'static str, rule: CalendarRule) -> Result<Box<dyn Stage>> {
        if init.point.period <= Period::zero() {
            return Err(EngineError::stage_args(class, "the point needs a non-zero period"));
        }
        Ok(Box::new(Self {
            class,
            rule,
            period: init.point.period,
        }))
    }

    fn create_daily(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 2, "HH:MM and a time zone")?;
        let rule = CalendarRule::Daily {
            at: parse_hhmm(init.class, &init.args[0])?,
            zone: parse_zone(init.class, &init.args[1])?,
            last: None,
        };
        Self::build(init, "DailyPulse", rule)
    }

    fn create_monthly(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 3, "day of month, HH:MM and a time zone")?;
        let day: u32 = parse_arg(init.class, init.args, 0, "day of month")?;
        if !(1..=31).contains(&day) {
            return Err(EngineError::stage_args(init.class, "day of month must be 1 to 31"));
        }
        let rule = CalendarRule::Monthly {
            day,
            at: parse_hhmm(init.class, &init.args[1])?,
            zone: parse_zone(init.class, &init.args[2])?,
            last: None,
        };
        Self::build(init, "MonthlyPulse", rule)
    }

    fn create_cron(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 2, "a cron expression and a time zone")?;
        let rule = CalendarRule::Cron {
            schedule: CronSchedule::parse(&init.args[0])?,
            zone: parse_zone(init.class, &init.args[1])?,
            last: None,
        };
        Self::build(init, "CronPulse", rule)
    }

    fn create_window(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 3, "start HH:MM, end HH:MM and a time zone")?;
        let rule = CalendarRule::Window {
            start: parse_hhmm(init.class, &init.args[0])?,
            end: parse_hhmm(init.class, &init.args[1])?,
            zone: parse_zone(init.class, &init.args[2])?,
        };
        Self::build(init, "DailyWindow", rule)
    }
}

impl Stage for CalendarPulse {
    fn name(&self) -> &str {
        self.class
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(Some(input))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        let mut rule = self.rule.clone();
        let point = Arc::downgrade(act.point);
        let engine = act.engine.downgrade();
        let name = act.point.full_name().to_string();

        act.engine.schedule_task(
            format!("{} {}", name, self.class),
            act.engine.now() + self.period,
            self.period,
            move |now| {
                let (Some(engine), Some(point)) = (engine.upgrade(), point.upgrade()) else {
                    return TaskControl::Stop;
                };
                let sample = Sample::new(point.full_name(), now, Value::Bool(rule.tick(now)));
                if let Err(e) = point.fire(&engine, sample, true) {
                    tracing::debug!("({}) Calendar tick not published: {}", point.full_name(), e);
                }
                TaskControl::Continue
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::point::{PointDescriptor, PointInfo};
    use crate::scripting::ScriptEngine;
    use crate::timer::ManualClock;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn test_zone_parsing() {
        assert_eq!(ZoneSpec::parse("UTC"), Some(ZoneSpec::Utc));
        assert_eq!(ZoneSpec::parse("gmt"), Some(ZoneSpec::Utc));
        assert_eq!(ZoneSpec::parse("Local"), Some(ZoneSpec::Local));
        let aest = ZoneSpec::parse("UTC+10").unwrap();
        assert_eq!(aest, ZoneSpec::parse("+10:00").unwrap());
        assert_eq!(aest.wall(at(2024, 1, 1, 20, 0)).hour(), 6);
        assert_eq!(ZoneSpec::parse("-0330"), ZoneSpec::parse("UTC-3:30"));
        assert!(ZoneSpec::parse("Mars/Olympus").is_none());
        assert!(ZoneSpec::parse("+25").is_none());

        let wall = aest.wall(at(2024, 1, 1, 20, 0));
        assert_eq!(aest.instant(wall), Some(at(2024, 1, 1, 20, 0)));
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        let sydney = ZoneSpec::parse("Australia/Sydney").unwrap();
        assert_eq!(sydney, ZoneSpec::Named(chrono_tz::Australia::Sydney));

        // Daylight saving ends on 2024-04-07: 09:15 is 22:15 UTC before, 23:15 UTC after
        let mut rule = CalendarRule::Daily {
            at: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            zone: sydney,
            last: None,
        };
        assert!(rule.tick(at(2024, 4, 5, 22, 15)));
        assert!(!rule.tick(at(2024, 4, 7, 22, 15)));
        assert!(rule.tick(at(2024, 4, 7, 23, 15)));

        let wall = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(9, 0, 0).unwrap();
        assert_eq!(sydney.instant(wall), Some(at(2024, 1, 14, 22, 0)));
        let wall = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap().and_hms_opt(9, 0, 0).unwrap();
        assert_eq!(sydney.instant(wall), Some(at(2024, 7, 14, 23, 0)));
    }

    #[test]
    fn test_named_zone_accepted_by_daily_integrator() {
        let info = PointInfo::new("site", "energy");
        let args = vec!["09:01".to_string(), "Australia/Sydney".to_string()];
        let scripts = ScriptEngine::new();
        let init = StageInit {
            class: "DailyIntegratorPosOnly",
            args: &args,
            point: &info,
            scripts: &scripts,
        };
        assert!(StageRegistry::with_builtins().create(&init).is_ok());
    }

    #[test]
    fn test_hhmm() {
        assert_eq!(parse_hhmm("T", "07:30").unwrap(), NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert!(parse_hhmm("T", "24:00").is_err());
        assert!(parse_hhmm("T", "0730").is_err());
    }

    #[test]
    fn test_daily_pulse_once_per_day() {
        let mut rule = CalendarRule::Daily {
            at: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            zone: ZoneSpec::Utc,
            last: None,
        };
        assert!(!rule.tick(at(2024, 3, 1, 9, 14)));
        assert!(rule.tick(at(2024, 3, 1, 9, 15)));
        // Second tick in the same minute
        assert!(!rule.tick(at(2024, 3, 1, 9, 15) + Period::seconds(30)));
        assert!(rule.tick(at(2024, 3, 2, 9, 15)));
    }

    #[test]
    fn test_monthly_pulse() {
        let mut rule = CalendarRule::Monthly {
            day: 1,
            at: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            zone: ZoneSpec::Utc,
            last: None,
        };
        assert!(rule.tick(at(2024, 3, 1, 0, 0)));
        assert!(!rule.tick(at(2024, 3, 1, 0, 0)));
        assert!(!rule.tick(at(2024, 3, 2, 0, 0)));
        assert!(rule.tick(at(2024, 4, 1, 0, 0)));
    }

    #[test]
    fn test_cron_schedule() {
        let cron = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // 2024-03-04 is a Monday
        assert!(cron.matches(at(2024, 3, 4, 9, 30).naive_utc()));
        assert!(!cron.matches(at(2024, 3, 4, 9, 31).naive_utc()));
        assert!(!cron.matches(at(2024, 3, 4, 18, 0).naive_utc()));
        assert!(!cron.matches(at(2024, 3, 3, 10, 0).naive_utc()));

        let sundays = CronSchedule::parse("0 12 * * 7").unwrap();
        assert!(sundays.matches(at(2024, 3, 3, 12, 0).naive_utc()));

        // Day of month or weekday when both are restricted
        let either = CronSchedule::parse("0 0 1 * 1").unwrap();
        assert!(either.matches(at(2024, 3, 1, 0, 0).naive_utc()));
        assert!(either.matches(at(2024, 3, 4, 0, 0).naive_utc()));

        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
    }

    #[test]
    fn test_cron_rule_pulses_once_per_minute() {
        let mut rule = CalendarRule::Cron {
            schedule: CronSchedule::parse("30 * * * *").unwrap(),
            zone: ZoneSpec::Utc,
            last: None,
        };
        assert!(rule.tick(at(2024, 3, 4, 9, 30)));
        assert!(!rule.tick(at(2024, 3, 4, 9, 30) + Period::seconds(10)));
        assert!(rule.tick(at(2024, 3, 4, 10, 30)));
    }

    #[test]
    fn test_window_spanning_midnight() {
        let mut night = CalendarRule::Window {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            zone: ZoneSpec::Utc,
        };
        assert!(night.tick(at(2024, 3, 4, 23, 0)));
        assert!(night.tick(at(2024, 3, 4, 6, 0)));
        assert!(!night.tick(at(2024, 3, 4, 6, 1)));
        assert!(!night.tick(at(2024, 3, 4, 12, 0)));

        let mut day = CalendarRule::Window {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            zone: ZoneSpec::Utc,
        };
        assert!(day.tick(at(2024, 3, 4, 17, 0)));
        assert!(!day.tick(at(2024, 3, 4, 8, 59)));
    }

    #[test]
    fn test_pulse_needs_period() {
        let info = PointInfo::new("site", "tick");
        let args = vec!["09:00".to_string(), "UTC".to_string()];
        let scripts = ScriptEngine::new();
        let init = StageInit {
            class: "DailyPulse",
            args: &args,
            point: &info,
            scripts: &scripts,
        };
        assert!(StageRegistry::with_builtins().create(&init).is_err());
    }

    #[test]
    fn test_timer_fires_into_point() {
        let clock = Arc::new(ManualClock::new(at(2024, 3, 4, 9, 14)));
        let engine = Engine::with_clock(EngineConfig::default(), clock.clone());
        let info = PointInfo::new("site", "tick").with_period(Period::seconds(60));
        let args = vec!["09:15".to_string(), "UTC".to_string()];
        let scripts = ScriptEngine::new();
        let stage = StageRegistry::with_builtins()
            .create(&StageInit {
                class: "DailyPulse",
                args: &args,
                point: &info,
                scripts: &scripts,
            })
            .unwrap();
        let point = Arc::new(PointDescriptor::new(info, vec![stage]));
        engine.registry().register(point.clone()).unwrap();
        point.activate(&engine);

        engine.timers().run_due(at(2024, 3, 4, 9, 15));
        let latest = engine.latest("site.tick").unwrap();
        assert_eq!(latest.value(), Some(&Value::Bool(true)));

        engine.timers().run_due(at(2024, 3, 4, 9, 16));
        assert_eq!(engine.latest("site.tick").unwrap().value(), Some(&Value::Bool(false)));
    }
}
